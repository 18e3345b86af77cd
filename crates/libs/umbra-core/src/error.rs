use crate::id::RouterId;

/// Error taxonomy of the core, enumerated by behavioral meaning. Kinds that
/// are handled by dropping a frame are never surfaced past the owning
/// object; everything else is fatal to that object only.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("link frame authenticator mismatch")]
    AuthenticatorMismatch,
    #[error("handshake failure: {0}")]
    HandshakeFailure(&'static str),
    #[error("link session timed out")]
    SessionTimeout,
    #[error("reassembled message hash mismatch")]
    FragmentHashMismatch,
    #[error("path build timed out")]
    PathBuildTimeout,
    #[error("path build rejected by {hop} (code {code})")]
    PathBuildRejected { hop: RouterId, code: u8 },
    #[error("introset is stale")]
    IntroSetStale,
    #[error("introset lookup failed")]
    IntroSetLookupFailed,
    #[error("flow rejected by authentication policy")]
    FlowRejectedByAuth,
    #[error("replay detected")]
    ReplayDetected,
    #[error("congested, try again later")]
    Congested,

    #[error("invalid signature")]
    InvalidSignature,
    #[error("malformed message: {0}")]
    Malformed(&'static str),
    #[error("no established session with {0}")]
    NoSession(RouterId),
    #[error("unknown router {0}")]
    UnknownRouter(RouterId),
    #[error("record expired")]
    Expired,
    #[error("not enough usable routers")]
    NotEnoughRouters,
    #[error("message too large")]
    TooLarge,
    #[error("crypto failure")]
    Crypto,
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl From<umbra_crypto::CryptoError> for Error {
    fn from(_: umbra_crypto::CryptoError) -> Self {
        Error::Crypto
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(_: rmp_serde::decode::Error) -> Self {
        Error::Malformed("msgpack decode")
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(_: rmp_serde::encode::Error) -> Self {
        Error::Malformed("msgpack encode")
    }
}
