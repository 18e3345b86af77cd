//! XMIT body codec: the fixed 46-byte message descriptor that precedes the
//! inline last fragment.
//!
//! ```text
//! [ 32B content hash ][ 8B msgid BE ][ 2B fragsize BE ]
//! [ 2B lastfrag BE ][ 1B numfrags ][ 1B flags ]
//! ```

use umbra_core::Error;

pub const XMIT_OVERHEAD: usize = 46;
/// LSB set marks "message begin". Remaining bits are reserved: written as
/// zero, ignored on read.
pub const FLAG_BEGIN: u8 = 0x01;
/// A single 32-bit ack mask must cover every fragment plus the sentinel.
pub const MAX_FRAGS: u8 = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XmitInfo {
    pub hash: [u8; 32],
    pub msg_id: u64,
    pub frag_size: u16,
    pub last_frag_size: u16,
    pub num_frags: u8,
    pub flags: u8,
}

impl XmitInfo {
    pub fn total_size(&self) -> usize {
        self.frag_size as usize * self.num_frags as usize + self.last_frag_size as usize
    }

    pub fn is_begin(&self) -> bool {
        self.flags & FLAG_BEGIN != 0
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.hash);
        out.extend_from_slice(&self.msg_id.to_be_bytes());
        out.extend_from_slice(&self.frag_size.to_be_bytes());
        out.extend_from_slice(&self.last_frag_size.to_be_bytes());
        out.push(self.num_frags);
        out.push(self.flags);
    }

    pub fn parse(body: &[u8]) -> Result<Self, Error> {
        if body.len() < XMIT_OVERHEAD {
            return Err(Error::Malformed("short XMIT"));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&body[..32]);
        let msg_id = u64::from_be_bytes(body[32..40].try_into().expect("sized slice"));
        let frag_size = u16::from_be_bytes([body[40], body[41]]);
        let last_frag_size = u16::from_be_bytes([body[42], body[43]]);
        let num_frags = body[44];
        let flags = body[45];
        if num_frags > MAX_FRAGS {
            return Err(Error::Malformed("too many fragments"));
        }
        Ok(Self {
            hash,
            msg_id,
            frag_size,
            last_frag_size,
            num_frags,
            flags,
        })
    }
}
