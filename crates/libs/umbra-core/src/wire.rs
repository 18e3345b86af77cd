//! Routing-message envelope and the message bodies it carries. Everything
//! here is a msgpack dict on the wire; the byte-exact link-frame layouts
//! live in the link crate.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use umbra_crypto::CryptoProvider;

use crate::error::Error;
use crate::id::{ConvoTag, PathId, RouterId, ServiceAddress};
use crate::introset::IntroSet;
use crate::rc::RouterContact;

/// One datagram = one link frame, at most this many bytes before padding.
pub const MAX_FRAME_SIZE: usize = 1200;
/// Upper bound for a single link message (fragmented across frames).
pub const MAX_LINK_MSG_SIZE: usize = 8192;

/// Envelope of every post-handshake link message, discriminated by tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LinkMessage {
    /// LIM - the first message on a fresh session; binds it to a router id.
    Lim(LinkIntro),
    /// LRCM - path-build commit travelling hop to hop.
    RelayCommit(RelayCommit),
    /// LRSM - path-build status travelling back to the builder.
    RelayStatus(RelayStatus),
    /// DHT request or reply, delivered directly between routers.
    Dht(DhtMessage),
    /// Onion-routed traffic for one hop of a path.
    Path(PathEnvelope),
    /// Direct-to-router data for a local service endpoint.
    Data(DirectData),
    /// Teardown for one path, forwarded hop to hop.
    Close(PathClose),
}

impl LinkMessage {
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    pub fn tag(&self) -> &'static str {
        match self {
            LinkMessage::Lim(_) => "LIM",
            LinkMessage::RelayCommit(_) => "LRCM",
            LinkMessage::RelayStatus(_) => "LRSM",
            LinkMessage::Dht(_) => "DHT",
            LinkMessage::Path(_) => "PATH",
            LinkMessage::Data(_) => "DATA",
            LinkMessage::Close(_) => "CLOS",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkIntro {
    pub rc: RouterContact,
}

/// One hop's sealed record inside a relay commit. Only the addressed hop
/// can open it: the key is the classical share combined with the ML-KEM
/// capsule, both against that hop's long-term keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitCapsule {
    pub eph_pub: [u8; 32],
    #[serde(with = "serde_bytes")]
    pub pq_ciphertext: Vec<u8>,
    pub nonce: [u8; 32],
    #[serde(with = "serde_bytes")]
    pub record: Vec<u8>,
    /// HMAC over the encrypted record under the capsule key.
    pub tag: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayCommit {
    pub capsules: Vec<CommitCapsule>,
}

/// Plaintext of a commit capsule once the hop has opened it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Ingress path id at this hop.
    pub path_id: PathId,
    /// Next hop, or zero when this hop is the terminus.
    pub next_router: RouterId,
    /// Ingress path id at the next hop; zero at the terminus.
    pub next_path_id: PathId,
    pub lifetime_ms: u64,
    /// Position in the commit chain, outermost hop first.
    pub chain_index: u8,
}

pub mod status_code {
    pub const OK: u8 = 0;
    pub const REJECTED: u8 = 1;
    pub const CONGESTED: u8 = 2;
    pub const DUPLICATE_PATH_ID: u8 = 3;
    pub const MALFORMED: u8 = 4;
}

/// Build status travelling back toward the builder. `path_id` is rewritten
/// by each hop to its own ingress id so the message stays routable; the
/// signature therefore covers only the verdict and the signer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayStatus {
    pub path_id: PathId,
    pub code: u8,
    pub router: RouterId,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl RelayStatus {
    pub fn signed(
        crypto: &CryptoProvider,
        signing_key: &ed25519_dalek::SigningKey,
        path_id: PathId,
        code: u8,
    ) -> Self {
        let router = RouterId::new(signing_key.verifying_key().to_bytes());
        let mut status = Self {
            path_id,
            code,
            router,
            signature: Vec::new(),
        };
        status.signature = crypto.sign(signing_key, &status.signable()).to_vec();
        status
    }

    fn signable(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + RouterId::SIZE);
        buf.push(self.code);
        buf.extend_from_slice(self.router.as_slice());
        buf
    }

    pub fn verify(&self, crypto: &CryptoProvider) -> bool {
        crypto.verify(self.router.as_bytes(), &self.signable(), &self.signature)
    }

    pub fn is_ok(&self) -> bool {
        self.code == status_code::OK
    }
}

/// One onion layer as it travels between two adjacent hops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathEnvelope {
    pub path_id: PathId,
    pub nonce: [u8; 32],
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectData {
    pub service: ServiceAddress,
    pub frame: ProtocolFrame,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathClose {
    pub path_id: PathId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtMessage {
    pub txid: u64,
    pub op: DhtOp,
}

/// The operations the DHT must support. Replies are delivered on the same
/// path (or session) the request came in on, matched by txid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DhtOp {
    FindRouter(RouterId),
    GotRouter(Option<RouterContact>),
    PublishIntroSet(IntroSet),
    PublishAck { code: u8 },
    FindIntroSet(ServiceAddress),
    GotIntroSet(Option<IntroSet>),
}

/// What sits inside the innermost onion layer - decoded by the terminus
/// for client-to-service traffic and by the path owner for the reverse
/// direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TerminalMessage {
    /// End-to-end flow traffic for this node.
    Flow(ProtocolFrame),
    /// Introduction-point forwarding: push the frame upstream on the path
    /// whose terminus ingress id is `path_id`.
    Inject {
        path_id: PathId,
        frame: ProtocolFrame,
    },
    /// DHT operation executed at the terminus relay.
    Dht(DhtMessage),
    Probe { txid: u64 },
    ProbeReply { txid: u64 },
}

impl TerminalMessage {
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    Handshake,
    HandshakeAck,
    Data,
    Reject,
}

/// End-to-end frame between two service endpoints. Handshake frames carry
/// the sender's identity envelope and are signed by it; data frames are
/// authenticated with the flow session key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolFrame {
    pub convo_tag: ConvoTag,
    pub kind: FrameKind,
    pub sequence: u64,
    /// Sender service address; zero outside handshake frames.
    pub sender: ServiceAddress,
    /// Sender's flow encryption key; zero outside handshake frames.
    pub sender_enc: [u8; 32],
    /// One-shot DH share for the handshake; zero afterwards.
    pub eph_pub: [u8; 32],
    pub nonce: [u8; 32],
    pub auth_token: Option<String>,
    pub payload: ByteBuf,
    /// Ed25519 signature (handshake) or session-key HMAC (data).
    pub auth: ByteBuf,
}
