//! End-to-end frame crypto. The handshake agrees a one-shot key against the
//! remote service's published encryption key and signs the sender identity
//! envelope; everything after rides the derived session key.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use umbra_core::wire::{FrameKind, ProtocolFrame};
use umbra_core::{ConvoTag, Error, IntroSet, ServiceAddress};
use umbra_crypto::{CryptoProvider, SharedKey};
use x25519_dalek::PublicKey;

use crate::identity::ServiceIdentity;

/// Plaintext of a handshake frame: the sender's introset (so the receiver
/// can route replies) plus any piggybacked first data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeBody {
    pub introset: IntroSet,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

fn signable(frame: &ProtocolFrame) -> Result<Vec<u8>, Error> {
    let mut unsigned = frame.clone();
    unsigned.auth = ByteBuf::new();
    Ok(rmp_serde::to_vec(&unsigned)?)
}

/// Both ends derive the flow session key from the handshake key and the
/// conversation tag.
fn session_key(crypto: &CryptoProvider, handshake: &SharedKey, tag: &ConvoTag) -> SharedKey {
    SharedKey::new(crypto.hmac(handshake.as_ref(), tag.as_slice()))
}

/// Build the flow-opening frame. Returns the frame and the session key.
pub fn build_handshake(
    crypto: &CryptoProvider,
    our: &ServiceIdentity,
    remote_enc: [u8; 32],
    tag: ConvoTag,
    auth_token: Option<String>,
    body: &HandshakeBody,
) -> Result<(ProtocolFrame, SharedKey), Error> {
    let eph = crypto.encryption_keygen();
    let eph_pub = PublicKey::from(&eph);
    let nonce = crypto.rand_nonce();
    let handshake_key = crypto.dh_client(&PublicKey::from(remote_enc), &eph, &nonce);

    let mut payload = rmp_serde::to_vec(body)?;
    crypto.xchacha20(&mut payload, &handshake_key, &nonce);

    let mut frame = ProtocolFrame {
        convo_tag: tag,
        kind: FrameKind::Handshake,
        sequence: 0,
        sender: our.address(),
        sender_enc: our.enc_public(),
        eph_pub: eph_pub.to_bytes(),
        nonce,
        auth_token,
        payload: ByteBuf::from(payload),
        auth: ByteBuf::new(),
    };
    frame.auth = ByteBuf::from(crypto.sign(&our.signing, &signable(&frame)?).to_vec());

    let key = session_key(crypto, &handshake_key, &tag);
    Ok((frame, key))
}

/// Open a flow-opening frame with our endpoint keys. Verifies the sender
/// signature and returns the body, the session key, and the sender address.
pub fn open_handshake(
    crypto: &CryptoProvider,
    our: &ServiceIdentity,
    frame: &ProtocolFrame,
) -> Result<(HandshakeBody, SharedKey, ServiceAddress), Error> {
    if frame.kind != FrameKind::Handshake {
        return Err(Error::Malformed("not a handshake frame"));
    }
    if !crypto.verify(frame.sender.as_bytes(), &signable(frame)?, &frame.auth) {
        return Err(Error::InvalidSignature);
    }
    let handshake_key = crypto.dh_server(
        &PublicKey::from(frame.eph_pub),
        &our.enc_secret,
        &frame.nonce,
    );
    let mut payload = frame.payload.to_vec();
    crypto.xchacha20(&mut payload, &handshake_key, &frame.nonce);
    let body: HandshakeBody = rmp_serde::from_slice(&payload)?;

    let key = session_key(crypto, &handshake_key, &frame.convo_tag);
    Ok((body, key, frame.sender))
}

fn keyed_frame(
    crypto: &CryptoProvider,
    key: &SharedKey,
    tag: ConvoTag,
    kind: FrameKind,
    sequence: u64,
    payload: &[u8],
) -> Result<ProtocolFrame, Error> {
    let nonce = crypto.rand_nonce();
    let mut sealed = payload.to_vec();
    crypto.xchacha20(&mut sealed, key, &nonce);
    let mut frame = ProtocolFrame {
        convo_tag: tag,
        kind,
        sequence,
        sender: ServiceAddress::zero(),
        sender_enc: [0u8; 32],
        eph_pub: [0u8; 32],
        nonce,
        auth_token: None,
        payload: ByteBuf::from(sealed),
        auth: ByteBuf::new(),
    };
    frame.auth = ByteBuf::from(crypto.hmac(key.as_ref(), &signable(&frame)?).to_vec());
    Ok(frame)
}

fn open_keyed_frame(
    crypto: &CryptoProvider,
    key: &SharedKey,
    frame: &ProtocolFrame,
) -> Result<Vec<u8>, Error> {
    if !crypto.hmac_verify(key.as_ref(), &signable(frame)?, &frame.auth) {
        return Err(Error::AuthenticatorMismatch);
    }
    let mut payload = frame.payload.to_vec();
    crypto.xchacha20(&mut payload, key, &frame.nonce);
    Ok(payload)
}

/// Confirmation from the accepting side; possession of the session key is
/// the proof of identity.
pub fn build_ack(
    crypto: &CryptoProvider,
    key: &SharedKey,
    tag: ConvoTag,
) -> Result<ProtocolFrame, Error> {
    keyed_frame(crypto, key, tag, FrameKind::HandshakeAck, 0, &[])
}

pub fn verify_ack(crypto: &CryptoProvider, key: &SharedKey, frame: &ProtocolFrame) -> bool {
    frame.kind == FrameKind::HandshakeAck && open_keyed_frame(crypto, key, frame).is_ok()
}

pub fn build_data(
    crypto: &CryptoProvider,
    key: &SharedKey,
    tag: ConvoTag,
    sequence: u64,
    payload: &[u8],
) -> Result<ProtocolFrame, Error> {
    keyed_frame(crypto, key, tag, FrameKind::Data, sequence, payload)
}

pub fn open_data(
    crypto: &CryptoProvider,
    key: &SharedKey,
    frame: &ProtocolFrame,
) -> Result<Vec<u8>, Error> {
    if frame.kind != FrameKind::Data {
        return Err(Error::Malformed("not a data frame"));
    }
    open_keyed_frame(crypto, key, frame)
}

/// Unauthenticated refusal for a flow that failed the auth gate; carries
/// nothing the receiver could act on beyond the tag.
pub fn build_reject(tag: ConvoTag) -> ProtocolFrame {
    ProtocolFrame {
        convo_tag: tag,
        kind: FrameKind::Reject,
        sequence: 0,
        sender: ServiceAddress::zero(),
        sender_enc: [0u8; 32],
        eph_pub: [0u8; 32],
        nonce: [0u8; 32],
        auth_token: None,
        payload: ByteBuf::new(),
        auth: ByteBuf::new(),
    }
}
