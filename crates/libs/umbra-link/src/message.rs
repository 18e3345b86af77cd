//! The reliable-delivery unit of the link layer: one message split into up
//! to 31 full fragments plus an inline last fragment, tracked by a 32-bit
//! acknowledgement mask whose bit `num_frags` is the last-fragment sentinel.

use tokio::time::{Duration, Instant};

use crate::xmit::XmitInfo;

/// Resend the XMIT if no ACKS arrived within this after start.
pub const XMIT_RESEND_AFTER: Duration = Duration::from_millis(1000);
/// Resend unacked fragments at this cadence once the first ACKS arrived.
pub const FRAG_RESEND_AFTER: Duration = Duration::from_millis(500);
/// Receiver-side ACKS cadence for incomplete messages.
pub const ACK_CADENCE: Duration = Duration::from_millis(200);

pub struct TransitMessage {
    pub info: XmitInfo,
    frags: Vec<Vec<u8>>,
    last_frag: Vec<u8>,
    /// Receiver: fragments present. Sender: fragments acknowledged.
    mask: u32,
    pub started: Instant,
    /// Sender side: when the last ACKS for this message arrived.
    last_ack: Option<Instant>,
    /// Receiver side: when we last emitted an ACKS for this message.
    last_ack_sent: Option<Instant>,
    /// Receiver side: progress since the last ACKS went out.
    dirty: bool,
}

impl TransitMessage {
    /// Sender side: split `payload` into fragments.
    pub fn outbound(info: XmitInfo, payload: &[u8], now: Instant) -> Self {
        let frag_size = info.frag_size as usize;
        let mut frags = Vec::with_capacity(info.num_frags as usize);
        let mut rest = payload;
        for _ in 0..info.num_frags {
            let (frag, tail) = rest.split_at(frag_size);
            frags.push(frag.to_vec());
            rest = tail;
        }
        Self {
            info,
            frags,
            last_frag: rest.to_vec(),
            mask: 0,
            started: now,
            last_ack: None,
            last_ack_sent: None,
            dirty: false,
        }
    }

    /// Receiver side: created from an XMIT, which carries the last fragment
    /// inline. The sentinel bit is set immediately.
    pub fn inbound(info: XmitInfo, last_frag: &[u8], now: Instant) -> Self {
        let frags = vec![Vec::new(); info.num_frags as usize];
        Self {
            mask: 1 << info.num_frags,
            info,
            frags,
            last_frag: last_frag.to_vec(),
            started: now,
            last_ack: None,
            last_ack_sent: None,
            dirty: true,
        }
    }

    pub fn bitmask(&self) -> u32 {
        self.mask
    }

    fn complete_mask(&self) -> u32 {
        // bits [0, num_frags] inclusive
        (1u32 << (self.info.num_frags + 1)) - 1
    }

    pub fn completed(&self) -> bool {
        self.mask & self.complete_mask() == self.complete_mask()
    }

    /// Receiver: store fragment `index`. Wrong index or size is the caller's
    /// signal to drop the frame.
    pub fn put_frag(&mut self, index: u8, bytes: &[u8]) -> bool {
        if index >= self.info.num_frags || bytes.len() != self.info.frag_size as usize {
            return false;
        }
        let fresh = self.mask & (1 << index) == 0;
        self.frags[index as usize] = bytes.to_vec();
        self.mask |= 1 << index;
        if fresh {
            self.dirty = true;
        }
        fresh
    }

    /// Sender: merge an acknowledgement mask. Idempotent.
    pub fn apply_ack(&mut self, mask: u32, now: Instant) {
        self.mask |= mask & self.complete_mask();
        self.last_ack = Some(now);
    }

    pub fn should_resend_xmit(&self, now: Instant) -> bool {
        self.last_ack.is_none() && now.duration_since(self.started) >= XMIT_RESEND_AFTER
    }

    pub fn should_resend_frags(&self, now: Instant) -> bool {
        match self.last_ack {
            Some(at) => !self.completed() && now.duration_since(at) >= FRAG_RESEND_AFTER,
            None => false,
        }
    }

    /// Receiver: is a cadence ACKS due?
    pub fn should_send_ack(&self, now: Instant) -> bool {
        if !self.dirty {
            return false;
        }
        match self.last_ack_sent {
            Some(at) => now.duration_since(at) >= ACK_CADENCE,
            None => now.duration_since(self.started) >= ACK_CADENCE,
        }
    }

    pub fn mark_ack_sent(&mut self, now: Instant) {
        self.last_ack_sent = Some(now);
        self.dirty = false;
    }

    /// Fragment indices the peer has not acknowledged yet.
    pub fn unacked(&self) -> impl Iterator<Item = (u8, &[u8])> {
        self.frags
            .iter()
            .enumerate()
            .filter(move |(i, _)| self.mask & (1 << *i) == 0)
            .map(|(i, frag)| (i as u8, frag.as_slice()))
    }

    pub fn last_frag(&self) -> &[u8] {
        &self.last_frag
    }

    /// Receiver: stitch the message back together once every bit is set.
    pub fn reassemble(&self) -> Option<Vec<u8>> {
        if !self.completed() {
            return None;
        }
        let mut out = Vec::with_capacity(self.info.total_size());
        for frag in &self.frags {
            out.extend_from_slice(frag);
        }
        out.extend_from_slice(&self.last_frag);
        Some(out)
    }
}

/// Fragment a payload: full fragments of `frag_size` while more than one
/// fragment's worth remains, the rest inline in the XMIT.
pub fn fragment_layout(payload_len: usize, frag_size: u16) -> (u8, u16) {
    let frag_size = frag_size as usize;
    let num_frags = payload_len / frag_size;
    let last = payload_len - num_frags * frag_size;
    (num_frags as u8, last as u16)
}
