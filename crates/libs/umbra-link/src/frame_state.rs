//! Per-session reliable transport state: inbound reassembly, outbound
//! retransmission, acknowledgement coding, and strict in-order delivery of
//! completed messages to the dispatch layer.

use std::collections::{BTreeMap, HashMap, VecDeque};

use tokio::time::{Duration, Instant};
use umbra_core::wire::MAX_LINK_MSG_SIZE;
use umbra_core::Error;
use umbra_crypto::CryptoProvider;

use crate::codel::CodelQueue;
use crate::frame::{make_frame, parse_frame, session_flag, MsgType};
use crate::message::{fragment_layout, TransitMessage};
use crate::xmit::{XmitInfo, FLAG_BEGIN, MAX_FRAGS, XMIT_OVERHEAD};

pub const DEFAULT_FRAG_SIZE: u16 = 1024;
/// Give up on a transit message that has made no progress for this long.
const MESSAGE_EXPIRE: Duration = Duration::from_secs(30);

pub struct FrameState {
    crypto: CryptoProvider,
    rx: HashMap<u64, TransitMessage>,
    tx: HashMap<u64, TransitMessage>,
    /// Next inbound msgid to hand upward; ids below it are history.
    next_rx_id: u64,
    next_tx_id: u64,
    /// Completed but out-of-order messages, keyed by msgid.
    pending: BTreeMap<u64, Vec<u8>>,
    /// In-order messages ready for the dispatch layer.
    delivered: VecDeque<Vec<u8>>,
    sendq: CodelQueue<Vec<u8>>,
    frag_size: u16,
    pub tx_flags: u8,
    pub rx_flags: u8,
    hash_mismatches: u64,
}

impl FrameState {
    pub fn new(crypto: CryptoProvider) -> Self {
        Self {
            crypto,
            rx: HashMap::new(),
            tx: HashMap::new(),
            next_rx_id: 0,
            next_tx_id: 0,
            pending: BTreeMap::new(),
            delivered: VecDeque::new(),
            sendq: CodelQueue::new(),
            frag_size: DEFAULT_FRAG_SIZE,
            tx_flags: 0,
            rx_flags: 0,
            hash_mismatches: 0,
        }
    }

    pub fn hash_mismatches(&self) -> u64 {
        self.hash_mismatches
    }

    pub fn flags_agree(&self, flags: u8) -> bool {
        ((self.rx_flags & flags) & (self.tx_flags & flags)) == flags
    }

    /// Queue one link message for reliable delivery. Returns its msgid.
    pub fn queue_message(&mut self, payload: &[u8], now: Instant) -> Result<u64, Error> {
        if payload.len() > MAX_LINK_MSG_SIZE {
            return Err(Error::TooLarge);
        }
        let (num_frags, last_frag_size) = fragment_layout(payload.len(), self.frag_size);
        if num_frags > MAX_FRAGS {
            return Err(Error::TooLarge);
        }
        let msg_id = self.next_tx_id;
        self.next_tx_id += 1;

        let info = XmitInfo {
            hash: self.crypto.short_hash(payload),
            msg_id,
            frag_size: self.frag_size,
            last_frag_size,
            num_frags,
            flags: FLAG_BEGIN,
        };
        let msg = TransitMessage::outbound(info, payload, now);
        self.push_xmit_frame(&msg, now);
        for frame in frag_frames(self.tx_flags, &msg) {
            self.sendq.push(frame, now);
        }
        self.tx.insert(msg_id, msg);
        Ok(msg_id)
    }

    pub fn keepalive(&mut self, now: Instant) {
        self.sendq
            .push(make_frame(MsgType::Aliv, &[], self.tx_flags), now);
    }

    /// Process one decrypted plaintext frame.
    pub fn process(&mut self, plain: &[u8], now: Instant) -> Result<(), Error> {
        let (header, body) = parse_frame(plain)?;
        if header.flags & session_flag::INVALIDATED != 0 {
            self.rx_flags |= session_flag::INVALIDATED;
        }
        match header.msg_type {
            MsgType::Aliv => {
                if self.rx_flags & session_flag::INVALIDATED != 0 {
                    self.tx_flags |= session_flag::INVALIDATED;
                }
                Ok(())
            }
            MsgType::Xmit => self.got_xmit(body, now),
            MsgType::Frag => self.got_frag(body, now),
            MsgType::Acks => self.got_acks(body, now),
        }
    }

    fn got_xmit(&mut self, body: &[u8], now: Instant) -> Result<(), Error> {
        let info = XmitInfo::parse(body)?;
        let last_frag = &body[XMIT_OVERHEAD..];
        if last_frag.len() != info.last_frag_size as usize {
            return Err(Error::Malformed("XMIT last-fragment size mismatch"));
        }
        if info.total_size() > MAX_LINK_MSG_SIZE {
            return Err(Error::Malformed("XMIT total size"));
        }
        if !info.is_begin() {
            return Err(Error::Malformed("XMIT without begin flag"));
        }

        let id = info.msg_id;
        if id < self.next_rx_id || self.rx.contains_key(&id) || self.pending.contains_key(&id) {
            log::debug!("link: duplicate XMIT msgid={id}");
            return Ok(());
        }

        let msg = TransitMessage::inbound(info, last_frag, now);
        if msg.completed() {
            self.finish_inbound(msg, now);
        } else {
            self.rx.insert(id, msg);
        }
        Ok(())
    }

    fn got_frag(&mut self, body: &[u8], now: Instant) -> Result<(), Error> {
        if body.len() <= 9 {
            return Err(Error::Malformed("short FRAG"));
        }
        let msg_id = u64::from_be_bytes(body[..8].try_into().expect("sized slice"));
        let frag_no = body[8];
        let frag = &body[9..];

        let Some(msg) = self.rx.get_mut(&msg_id) else {
            log::debug!("link: FRAG for unknown msgid={msg_id}");
            return Ok(());
        };
        if frag.len() != msg.info.frag_size as usize {
            return Err(Error::Malformed("FRAG size mismatch"));
        }
        msg.put_frag(frag_no, frag);
        if msg.completed() {
            let msg = self.rx.remove(&msg_id).expect("present");
            self.finish_inbound(msg, now);
        }
        Ok(())
    }

    fn got_acks(&mut self, body: &[u8], now: Instant) -> Result<(), Error> {
        if body.len() < 12 {
            return Err(Error::Malformed("short ACKS"));
        }
        let msg_id = u64::from_be_bytes(body[..8].try_into().expect("sized slice"));
        let mask = u32::from_be_bytes(body[8..12].try_into().expect("sized slice"));

        let Some(msg) = self.tx.get_mut(&msg_id) else {
            log::debug!("link: ACKS for unknown msgid={msg_id}");
            return Ok(());
        };
        msg.apply_ack(mask, now);
        if msg.completed() {
            self.tx.remove(&msg_id);
        } else {
            // the peer told us exactly which fragments are missing
            let frames = frag_frames(self.tx_flags, self.tx.get(&msg_id).expect("present"));
            for frame in frames {
                self.sendq.push(frame, now);
            }
            if let Some(msg) = self.tx.get_mut(&msg_id) {
                msg.note_frag_resend(now);
            }
        }
        Ok(())
    }

    /// A message completed reassembly: authenticate it, then release it (and
    /// any unblocked successors) upward in strict msgid order.
    fn finish_inbound(&mut self, msg: TransitMessage, now: Instant) {
        let id = msg.info.msg_id;
        let Some(payload) = msg.reassemble() else {
            return;
        };
        if self.crypto.short_hash(&payload) != msg.info.hash {
            // possible corruption or tampering; drop without a trace
            self.hash_mismatches += 1;
            return;
        }
        self.push_ack(id, msg.bitmask(), now);

        if id == self.next_rx_id {
            self.delivered.push_back(payload);
            self.next_rx_id += 1;
            while let Some(parked) = self.pending.remove(&self.next_rx_id) {
                self.delivered.push_back(parked);
                self.next_rx_id += 1;
            }
        } else {
            log::debug!(
                "link: parked out-of-order msgid={id}, expecting {}",
                self.next_rx_id
            );
            self.pending.insert(id, payload);
        }
    }

    fn push_ack(&mut self, msg_id: u64, mask: u32, now: Instant) {
        let mut body = Vec::with_capacity(12);
        body.extend_from_slice(&msg_id.to_be_bytes());
        body.extend_from_slice(&mask.to_be_bytes());
        self.sendq
            .push(make_frame(MsgType::Acks, &body, self.tx_flags), now);
    }

    fn push_xmit_frame(&mut self, msg: &TransitMessage, now: Instant) {
        let mut body = Vec::with_capacity(XMIT_OVERHEAD + msg.last_frag().len());
        msg.info.encode_into(&mut body);
        body.extend_from_slice(msg.last_frag());
        self.sendq
            .push(make_frame(MsgType::Xmit, &body, self.tx_flags), now);
    }

    /// Timer pass: retransmits, cadence ACKS, stale-message sweep.
    pub fn tick(&mut self, now: Instant) {
        let mut xmit_resend = Vec::new();
        let mut frag_resend = Vec::new();
        for (id, msg) in &self.tx {
            if msg.should_resend_xmit(now) {
                xmit_resend.push(*id);
            } else if msg.should_resend_frags(now) {
                frag_resend.push(*id);
            }
        }
        for id in xmit_resend {
            let msg = self.tx.get(&id).expect("present");
            let mut body = Vec::with_capacity(XMIT_OVERHEAD + msg.last_frag().len());
            msg.info.encode_into(&mut body);
            body.extend_from_slice(msg.last_frag());
            let frame = make_frame(MsgType::Xmit, &body, self.tx_flags);
            self.sendq.push(frame, now);
        }
        for id in frag_resend {
            let frames = frag_frames(self.tx_flags, self.tx.get(&id).expect("present"));
            for frame in frames {
                self.sendq.push(frame, now);
            }
            if let Some(msg) = self.tx.get_mut(&id) {
                msg.note_frag_resend(now);
            }
        }

        let mut acks = Vec::new();
        for (id, msg) in &self.rx {
            if msg.should_send_ack(now) {
                acks.push((*id, msg.bitmask()));
            }
        }
        for (id, mask) in acks {
            self.push_ack(id, mask, now);
            if let Some(msg) = self.rx.get_mut(&id) {
                msg.mark_ack_sent(now);
            }
        }

        self.tx
            .retain(|_, msg| now.duration_since(msg.started) < MESSAGE_EXPIRE);
        self.rx
            .retain(|_, msg| now.duration_since(msg.started) < MESSAGE_EXPIRE);
    }

    /// Next plaintext frame awaiting encryption, CoDel-managed.
    pub fn pop_frame(&mut self, now: Instant) -> Option<Vec<u8>> {
        self.sendq.pop(now)
    }

    /// Next in-order message for the dispatch layer.
    pub fn pop_delivered(&mut self) -> Option<Vec<u8>> {
        self.delivered.pop_front()
    }

    pub fn has_unacked_tx(&self) -> bool {
        !self.tx.is_empty()
    }

    pub fn next_rx_id(&self) -> u64 {
        self.next_rx_id
    }
}

fn frag_frames(tx_flags: u8, msg: &TransitMessage) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    for (idx, frag) in msg.unacked() {
        let mut body = Vec::with_capacity(9 + frag.len());
        body.extend_from_slice(&msg.info.msg_id.to_be_bytes());
        body.push(idx);
        body.extend_from_slice(frag);
        frames.push(make_frame(MsgType::Frag, &body, tx_flags));
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ACK_CADENCE;

    fn pair() -> (FrameState, FrameState) {
        let crypto = CryptoProvider::new();
        (FrameState::new(crypto), FrameState::new(crypto))
    }

    fn drain_frames(state: &mut FrameState, now: Instant) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(frame) = state.pop_frame(now) {
            out.push(frame);
        }
        out
    }

    #[test]
    fn single_frame_message_is_delivered_once() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        let payload = vec![42u8; 100];
        a.queue_message(&payload, now).expect("queue");

        for frame in drain_frames(&mut a, now) {
            b.process(&frame, now).expect("process");
        }
        assert_eq!(b.pop_delivered().expect("delivered"), payload);
        assert!(b.pop_delivered().is_none());

        // the completion ACKS clears the sender's transit entry
        for frame in drain_frames(&mut b, now) {
            a.process(&frame, now).expect("process");
        }
        assert!(!a.has_unacked_tx());
    }

    #[test]
    fn lost_fragments_are_repaired_by_acks() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        // 4 full fragments plus a 100-byte tail
        let payload: Vec<u8> = (0..4196u32).map(|i| (i % 256) as u8).collect();
        a.queue_message(&payload, now).expect("queue");

        let frames = drain_frames(&mut a, now);
        assert_eq!(frames.len(), 5); // XMIT + 4 FRAGs... XMIT carries the tail
        // deliver XMIT, frag 0 and frag 2; lose frags 1 and 3
        b.process(&frames[0], now).expect("xmit");
        b.process(&frames[1], now).expect("frag 0");
        b.process(&frames[3], now).expect("frag 2");
        assert!(b.pop_delivered().is_none());

        // cadence ACKS reports the holes
        let later = now + ACK_CADENCE;
        b.tick(later);
        let acks = drain_frames(&mut b, later);
        assert_eq!(acks.len(), 1);
        let (_, body) = parse_frame(&acks[0]).expect("parse");
        let mask = u32::from_be_bytes(body[8..12].try_into().expect("mask"));
        assert_eq!(mask, 0b10101);

        // the ACKS triggers retransmission of exactly the missing fragments
        a.process(&acks[0], later).expect("acks");
        let resent = drain_frames(&mut a, later);
        assert_eq!(resent.len(), 2);
        for frame in resent {
            b.process(&frame, later).expect("frag");
        }
        assert_eq!(b.pop_delivered().expect("delivered"), payload);

        // completion ACKS carries the full mask
        let final_acks = drain_frames(&mut b, later);
        assert_eq!(final_acks.len(), 1);
        let (_, body) = parse_frame(&final_acks[0]).expect("parse");
        let mask = u32::from_be_bytes(body[8..12].try_into().expect("mask"));
        assert_eq!(mask, 0b11111);
    }

    #[test]
    fn duplicate_xmit_is_ignored() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        a.queue_message(b"hello", now).expect("queue");
        let frames = drain_frames(&mut a, now);

        b.process(&frames[0], now).expect("first");
        b.process(&frames[0], now).expect("duplicate");
        assert!(b.pop_delivered().is_some());
        assert!(b.pop_delivered().is_none());
    }

    #[test]
    fn out_of_order_messages_release_in_msgid_order() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        a.queue_message(b"zero", now).expect("queue");
        a.queue_message(b"one", now).expect("queue");
        a.queue_message(b"two", now).expect("queue");
        let frames = drain_frames(&mut a, now);
        assert_eq!(frames.len(), 3);

        // arrive reversed
        b.process(&frames[2], now).expect("msg 2");
        b.process(&frames[1], now).expect("msg 1");
        assert!(b.pop_delivered().is_none());

        b.process(&frames[0], now).expect("msg 0");
        assert_eq!(b.pop_delivered().expect("msg"), b"zero".to_vec());
        assert_eq!(b.pop_delivered().expect("msg"), b"one".to_vec());
        assert_eq!(b.pop_delivered().expect("msg"), b"two".to_vec());
        assert_eq!(b.next_rx_id(), 3);
    }

    #[test]
    fn corrupted_reassembly_is_dropped_silently() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        let payload = vec![7u8; 1500];
        a.queue_message(&payload, now).expect("queue");
        let frames = drain_frames(&mut a, now);
        assert_eq!(frames.len(), 2);

        // corrupt the fragment body past the header before delivery; the
        // frame layer would normally reject this, so patch the inner bytes
        let mut bad_frag = frames[1].clone();
        let last = bad_frag.len() - 1;
        bad_frag[last] ^= 0xff;
        b.process(&frames[0], now).expect("xmit");
        b.process(&bad_frag, now).expect("frag");

        assert!(b.pop_delivered().is_none());
        assert_eq!(b.hash_mismatches(), 1);
    }

    #[test]
    fn xmit_resend_after_one_second() {
        let (mut a, _) = pair();
        let now = Instant::now();
        a.queue_message(b"ping", now).expect("queue");
        drain_frames(&mut a, now);

        a.tick(now + Duration::from_millis(999));
        assert!(drain_frames(&mut a, now + Duration::from_millis(999)).is_empty());

        let later = now + Duration::from_millis(1000);
        a.tick(later);
        let frames = drain_frames(&mut a, later);
        assert_eq!(frames.len(), 1);
        let (header, _) = parse_frame(&frames[0]).expect("parse");
        assert_eq!(header.msg_type, MsgType::Xmit);
    }

    #[test]
    fn oversize_message_is_refused() {
        let (mut a, _) = pair();
        let now = Instant::now();
        let huge = vec![0u8; MAX_LINK_MSG_SIZE + 1];
        assert!(matches!(a.queue_message(&huge, now), Err(Error::TooLarge)));
    }
}
