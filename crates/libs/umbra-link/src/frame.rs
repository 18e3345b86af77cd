//! Byte-exact frame layouts. Every post-handshake datagram is
//!
//! ```text
//! [ 32-byte HMAC ][ 32-byte nonce ][ ciphertext ]
//! ```
//!
//! where the ciphertext is XChaCha20 over a 6-byte inner header plus body.
//! The HMAC covers `nonce || ciphertext` under the session key.

use umbra_core::Error;
use umbra_crypto::{CryptoProvider, SharedKey, HMAC_SIZE, TUNNEL_NONCE_SIZE};

/// HMAC plus nonce.
pub const OUTER_OVERHEAD: usize = HMAC_SIZE + TUNNEL_NONCE_SIZE;
/// version | msg_type | size_be16 | rsv | flags
pub const HEADER_SIZE: usize = 6;
pub const WIRE_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Aliv = 0x00,
    Xmit = 0x01,
    Acks = 0x02,
    Frag = 0x03,
}

impl MsgType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(MsgType::Aliv),
            0x01 => Some(MsgType::Xmit),
            0x02 => Some(MsgType::Acks),
            0x03 => Some(MsgType::Frag),
            _ => None,
        }
    }
}

/// Session-level header flag bits.
pub mod session_flag {
    pub const INVALIDATED: u8 = 1 << 0;
    pub const HIGH_PACKET_DROP: u8 = 1 << 1;
    pub const HIGH_MTU: u8 = 1 << 2;
    pub const PROTO_UPGRADE: u8 = 1 << 3;
}

#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub version: u8,
    pub msg_type: MsgType,
    pub size: u16,
    pub flags: u8,
}

/// Build one plaintext frame: inner header followed by `body`.
pub fn make_frame(msg_type: MsgType, body: &[u8], flags: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.push(WIRE_VERSION);
    out.push(msg_type as u8);
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.push(0); // rsv
    out.push(flags);
    out.extend_from_slice(body);
    out
}

/// Split a plaintext frame into header and body.
pub fn parse_frame(frame: &[u8]) -> Result<(FrameHeader, &[u8]), Error> {
    if frame.len() < HEADER_SIZE {
        return Err(Error::Malformed("short frame"));
    }
    let msg_type =
        MsgType::from_byte(frame[1]).ok_or(Error::Malformed("unknown frame msg type"))?;
    let size = u16::from_be_bytes([frame[2], frame[3]]) as usize;
    if frame.len() - HEADER_SIZE < size {
        return Err(Error::Malformed("frame size overflow"));
    }
    let header = FrameHeader {
        version: frame[0],
        msg_type,
        size: size as u16,
        flags: frame[5],
    };
    Ok((header, &frame[HEADER_SIZE..HEADER_SIZE + size]))
}

/// Encrypt and authenticate one plaintext frame into a wire datagram.
pub fn seal(crypto: &CryptoProvider, key: &SharedKey, plain: &[u8]) -> Vec<u8> {
    let nonce = crypto.rand_nonce();
    let mut ciphertext = plain.to_vec();
    crypto.xchacha20(&mut ciphertext, key, &nonce);

    let mut covered = Vec::with_capacity(TUNNEL_NONCE_SIZE + ciphertext.len());
    covered.extend_from_slice(&nonce);
    covered.extend_from_slice(&ciphertext);
    let tag = crypto.hmac(key.as_ref(), &covered);

    let mut out = Vec::with_capacity(OUTER_OVERHEAD + ciphertext.len());
    out.extend_from_slice(&tag);
    out.extend_from_slice(&covered);
    out
}

/// Verify and decrypt one wire datagram back into a plaintext frame.
/// Authenticator mismatch is indistinguishable from garbage by design.
pub fn open(crypto: &CryptoProvider, key: &SharedKey, datagram: &[u8]) -> Result<Vec<u8>, Error> {
    if datagram.len() < OUTER_OVERHEAD + HEADER_SIZE {
        return Err(Error::AuthenticatorMismatch);
    }
    let (tag, covered) = datagram.split_at(HMAC_SIZE);
    if !crypto.hmac_verify(key.as_ref(), covered, tag) {
        return Err(Error::AuthenticatorMismatch);
    }
    let nonce: [u8; TUNNEL_NONCE_SIZE] = covered[..TUNNEL_NONCE_SIZE]
        .try_into()
        .map_err(|_| Error::AuthenticatorMismatch)?;
    let mut plain = covered[TUNNEL_NONCE_SIZE..].to_vec();
    crypto.xchacha20(&mut plain, key, &nonce);
    Ok(plain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let frame = make_frame(MsgType::Acks, &[1, 2, 3], session_flag::HIGH_MTU);
        let (header, body) = parse_frame(&frame).expect("parse");
        assert_eq!(header.version, WIRE_VERSION);
        assert_eq!(header.msg_type, MsgType::Acks);
        assert_eq!(header.size, 3);
        assert_eq!(header.flags, session_flag::HIGH_MTU);
        assert_eq!(body, &[1, 2, 3]);
    }

    #[test]
    fn parse_rejects_truncated_body() {
        let mut frame = make_frame(MsgType::Frag, &[0u8; 16], 0);
        frame.truncate(HEADER_SIZE + 8);
        assert!(parse_frame(&frame).is_err());
    }

    #[test]
    fn seal_open_round_trip() {
        let crypto = CryptoProvider::new();
        let key = SharedKey::new([3u8; 32]);
        let plain = make_frame(MsgType::Aliv, &[], 0);

        let datagram = seal(&crypto, &key, &plain);
        assert_eq!(datagram.len(), OUTER_OVERHEAD + plain.len());
        let opened = open(&crypto, &key, &datagram).expect("open");
        assert_eq!(opened, plain);
    }

    #[test]
    fn open_rejects_flipped_bit() {
        let crypto = CryptoProvider::new();
        let key = SharedKey::new([3u8; 32]);
        let mut datagram = seal(&crypto, &key, &make_frame(MsgType::Aliv, &[], 0));
        let last = datagram.len() - 1;
        datagram[last] ^= 1;
        assert!(matches!(
            open(&crypto, &key, &datagram),
            Err(Error::AuthenticatorMismatch)
        ));
    }

    #[test]
    fn open_rejects_wrong_key() {
        let crypto = CryptoProvider::new();
        let datagram = seal(
            &crypto,
            &SharedKey::new([3u8; 32]),
            &make_frame(MsgType::Aliv, &[], 0),
        );
        assert!(open(&crypto, &SharedKey::new([4u8; 32]), &datagram).is_err());
    }
}
