//! Link session state machine. Sans-IO: the caller feeds datagrams and
//! clock readings in, and polls datagrams and events out.
//!
//! Handshake (initiator I, responder R, all DH between I's ephemeral key and
//! R's long-term encryption key):
//!
//! ```text
//! I -> R  Intro        eph_pub | n1 | HMAC(dh(n1))            + pad <= 64
//! R -> I  IntroAck     resp_eph | nr | enc(token) | HMAC(dh(nr)) + pad <= 32
//! I -> R  SessionStart enc(token) | n2 | HMAC(dh(n1))         + pad <= 32
//! ```
//!
//! after which `session_key = short_hash(dh(n1) || token || n2)` and each
//! side immediately sends its signed router contact as message id 0 (LIM).

use std::collections::VecDeque;

use tokio::time::{Duration, Instant};
use umbra_core::wire::{LinkIntro, LinkMessage};
use umbra_core::{Error, RouterContact, RouterId};
use umbra_crypto::{CryptoProvider, SharedKey, TUNNEL_NONCE_SIZE};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::frame::{self, OUTER_OVERHEAD};
use crate::frame_state::FrameState;

pub const SESSION_TIMEOUT: Duration = Duration::from_secs(10);
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(2_500);
const HANDSHAKE_RESEND: Duration = Duration::from_secs(1);

const INTRO_SIZE: usize = 96;
const MAX_INTRO_PAD: u64 = 64;
const INTRO_ACK_SIZE: usize = 128;
const SESSION_START_SIZE: usize = 96;
const MAX_HANDSHAKE_PAD: u64 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    IntroSent,
    IntroRecv,
    IntroAckSent,
    IntroAckRecv,
    SessionStartSent,
    LimSent,
    Established,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Timeout,
    HandshakeFailure,
    SpoofedLim,
    Replaced,
    Local,
}

#[derive(Debug)]
pub enum SessionEvent {
    Established { router: RouterId },
    Message(Vec<u8>),
    Closed(CloseReason),
}

pub struct Session {
    crypto: CryptoProvider,
    state: SessionState,
    role: Role,
    our_rc: RouterContact,
    our_enc_secret: StaticSecret,
    eph_secret: Option<StaticSecret>,
    remote_lt_enc: Option<PublicKey>,
    remote_eph_pub: Option<[u8; 32]>,
    /// The router we dialed; inbound sessions learn it from the LIM.
    expected_router: Option<RouterId>,
    intro_nonce: [u8; TUNNEL_NONCE_SIZE],
    derived: Option<SharedKey>,
    token: [u8; 32],
    session_key: Option<SharedKey>,
    remote_rc: Option<RouterContact>,
    frame: FrameState,
    last_recv: Instant,
    last_send: Instant,
    session_timeout: Duration,
    keep_alive: Duration,
    last_handshake: Option<Vec<u8>>,
    last_handshake_sent: Instant,
    transmits: VecDeque<Vec<u8>>,
    events: VecDeque<SessionEvent>,
    auth_failures: u64,
}

impl Session {
    /// Start an outbound session toward `remote_rc`.
    pub fn connect(
        crypto: CryptoProvider,
        our_rc: RouterContact,
        our_enc_secret: StaticSecret,
        remote_rc: &RouterContact,
        session_timeout: Duration,
        keep_alive: Duration,
        now: Instant,
    ) -> Self {
        let mut session = Self::base(
            crypto,
            our_rc,
            our_enc_secret,
            Role::Initiator,
            session_timeout,
            keep_alive,
            now,
        );
        session.remote_lt_enc = Some(PublicKey::from(remote_rc.enc_key));
        session.expected_router = Some(remote_rc.router_id);
        session.send_intro(now);
        session
    }

    /// Accept an inbound session; the first datagram must be an Intro.
    pub fn accept(
        crypto: CryptoProvider,
        our_rc: RouterContact,
        our_enc_secret: StaticSecret,
        session_timeout: Duration,
        keep_alive: Duration,
        now: Instant,
    ) -> Self {
        Self::base(
            crypto,
            our_rc,
            our_enc_secret,
            Role::Responder,
            session_timeout,
            keep_alive,
            now,
        )
    }

    fn base(
        crypto: CryptoProvider,
        our_rc: RouterContact,
        our_enc_secret: StaticSecret,
        role: Role,
        session_timeout: Duration,
        keep_alive: Duration,
        now: Instant,
    ) -> Self {
        Self {
            crypto,
            state: SessionState::Initial,
            role,
            our_rc,
            our_enc_secret,
            eph_secret: None,
            remote_lt_enc: None,
            remote_eph_pub: None,
            expected_router: None,
            intro_nonce: [0u8; TUNNEL_NONCE_SIZE],
            derived: None,
            token: [0u8; 32],
            session_key: None,
            remote_rc: None,
            frame: FrameState::new(crypto),
            last_recv: now,
            last_send: now,
            session_timeout,
            keep_alive,
            last_handshake: None,
            last_handshake_sent: now,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
            auth_failures: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    pub fn is_dead(&self) -> bool {
        self.state == SessionState::Timeout
    }

    pub fn remote_router(&self) -> Option<RouterId> {
        self.remote_rc.as_ref().map(|rc| rc.router_id)
    }

    pub fn remote_rc(&self) -> Option<&RouterContact> {
        self.remote_rc.as_ref()
    }

    pub fn auth_failures(&self) -> u64 {
        self.auth_failures
    }

    pub fn poll_transmit(&mut self) -> Option<Vec<u8>> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// Queue a link message for reliable delivery. Refused until the session
    /// is bound to a router - no traffic without an established session.
    pub fn queue_message(&mut self, msg: &LinkMessage, now: Instant) -> Result<u64, Error> {
        if !self.is_established() {
            return Err(Error::NoSession(
                self.expected_router.unwrap_or_default(),
            ));
        }
        let id = self.frame.queue_message(&msg.encode()?, now)?;
        self.pump(now);
        Ok(id)
    }

    pub fn close(&mut self, reason: CloseReason) {
        if self.state != SessionState::Timeout {
            self.state = SessionState::Timeout;
            self.events.push_back(SessionEvent::Closed(reason));
        }
    }

    /// Feed one datagram from the wire.
    pub fn handle_datagram(&mut self, datagram: &[u8], now: Instant) {
        if self.state == SessionState::Timeout {
            return;
        }
        match (self.role, self.state) {
            (Role::Responder, SessionState::Initial) => self.on_intro(datagram, now),
            (Role::Initiator, SessionState::IntroSent) => self.on_intro_ack(datagram, now),
            (Role::Responder, SessionState::IntroAckSent) => {
                self.on_session_start(datagram, now)
            }
            _ => self.on_encrypted_frame(datagram, now),
        }
        self.pump(now);
    }

    /// Timer pass: handshake resends, retransmits, keepalive, idle timeout.
    pub fn tick(&mut self, now: Instant) {
        if self.state == SessionState::Timeout {
            return;
        }

        if now.duration_since(self.last_recv) >= self.session_timeout {
            log::info!("link: session timed out in {:?}", self.state);
            self.close(CloseReason::Timeout);
            return;
        }

        if !self.is_established() {
            if let Some(pkt) = &self.last_handshake {
                if now.duration_since(self.last_handshake_sent) >= HANDSHAKE_RESEND {
                    self.transmits.push_back(pkt.clone());
                    self.last_handshake_sent = now;
                    self.last_send = now;
                }
            }
        }

        if self.session_key.is_some() {
            self.frame.tick(now);
            if now.duration_since(self.last_send) >= self.keep_alive {
                self.frame.keepalive(now);
            }
        }
        self.pump(now);
    }

    // --- handshake ---

    fn send_intro(&mut self, now: Instant) {
        let eph = self.crypto.encryption_keygen();
        let eph_pub = PublicKey::from(&eph);
        self.intro_nonce = self.crypto.rand_nonce();
        let remote = self.remote_lt_enc.expect("initiator knows the remote key");
        let derived = self.crypto.dh_client(&remote, &eph, &self.intro_nonce);

        let pad = (self.crypto.rand_u64() % (MAX_INTRO_PAD + 1)) as usize;
        let mut pkt = Vec::with_capacity(INTRO_SIZE + pad);
        pkt.extend_from_slice(eph_pub.as_bytes());
        pkt.extend_from_slice(&self.intro_nonce);
        let tag = self.crypto.hmac(derived.as_ref(), &pkt[..64]);
        pkt.extend_from_slice(&tag);
        if pad > 0 {
            let mut padding = vec![0u8; pad];
            self.crypto.rand_bytes(&mut padding);
            pkt.extend_from_slice(&padding);
        }

        self.eph_secret = Some(eph);
        self.derived = Some(derived);
        self.last_handshake = Some(pkt.clone());
        self.last_handshake_sent = now;
        self.last_send = now;
        self.transmits.push_back(pkt);
        self.state = SessionState::IntroSent;
    }

    fn on_intro(&mut self, datagram: &[u8], now: Instant) {
        if datagram.len() < INTRO_SIZE {
            self.close(CloseReason::HandshakeFailure);
            return;
        }
        let eph_pub: [u8; 32] = datagram[..32].try_into().expect("sized slice");
        let nonce: [u8; TUNNEL_NONCE_SIZE] =
            datagram[32..64].try_into().expect("sized slice");
        let derived = self.crypto.dh_server(
            &PublicKey::from(eph_pub),
            &self.our_enc_secret,
            &nonce,
        );
        if !self
            .crypto
            .hmac_verify(derived.as_ref(), &datagram[..64], &datagram[64..96])
        {
            log::debug!("link: intro authenticator mismatch");
            self.close(CloseReason::HandshakeFailure);
            return;
        }

        self.remote_eph_pub = Some(eph_pub);
        self.intro_nonce = nonce;
        self.derived = Some(derived);
        self.state = SessionState::IntroRecv;
        self.last_recv = now;
        self.send_intro_ack(now);
    }

    fn send_intro_ack(&mut self, now: Instant) {
        let eph_pub = self
            .remote_eph_pub
            .expect("intro processed before intro ack");
        let resp_eph = self.crypto.encryption_keygen();
        let resp_eph_pub = PublicKey::from(&resp_eph);
        let nonce_r = self.crypto.rand_nonce();
        let derived_r = self.crypto.dh_server(
            &PublicKey::from(eph_pub),
            &self.our_enc_secret,
            &nonce_r,
        );
        self.crypto.rand_bytes(&mut self.token);
        let mut token_ct = self.token;
        self.crypto.xchacha20(&mut token_ct, &derived_r, &nonce_r);

        let pad = (self.crypto.rand_u64() % (MAX_HANDSHAKE_PAD + 1)) as usize;
        let mut pkt = Vec::with_capacity(INTRO_ACK_SIZE + pad);
        pkt.extend_from_slice(resp_eph_pub.as_bytes());
        pkt.extend_from_slice(&nonce_r);
        pkt.extend_from_slice(&token_ct);
        let tag = self.crypto.hmac(derived_r.as_ref(), &pkt[..96]);
        pkt.extend_from_slice(&tag);
        if pad > 0 {
            let mut padding = vec![0u8; pad];
            self.crypto.rand_bytes(&mut padding);
            pkt.extend_from_slice(&padding);
        }

        self.last_handshake = Some(pkt.clone());
        self.last_handshake_sent = now;
        self.last_send = now;
        self.transmits.push_back(pkt);
        self.state = SessionState::IntroAckSent;
    }

    fn on_intro_ack(&mut self, datagram: &[u8], now: Instant) {
        if datagram.len() < INTRO_ACK_SIZE {
            self.close(CloseReason::HandshakeFailure);
            return;
        }
        let remote = self.remote_lt_enc.expect("initiator knows the remote key");
        let eph = self.eph_secret.as_ref().expect("intro sent");
        let nonce_r: [u8; TUNNEL_NONCE_SIZE] =
            datagram[32..64].try_into().expect("sized slice");
        let derived_r = self.crypto.dh_client(&remote, eph, &nonce_r);
        if !self
            .crypto
            .hmac_verify(derived_r.as_ref(), &datagram[..96], &datagram[96..128])
        {
            // either tampering or a reordered later frame; the intro
            // resend timer keeps the handshake alive in both cases
            log::debug!("link: intro-ack authenticator mismatch");
            self.auth_failures += 1;
            return;
        }
        let mut token: [u8; 32] = datagram[64..96].try_into().expect("sized slice");
        self.crypto.xchacha20(&mut token, &derived_r, &nonce_r);
        self.token = token;
        self.state = SessionState::IntroAckRecv;
        self.last_recv = now;
        self.send_session_start(now);
    }

    fn send_session_start(&mut self, now: Instant) {
        let derived = self.derived.clone().expect("intro derived key");
        let nonce2 = self.crypto.rand_nonce();
        let mut token_ct = self.token;
        self.crypto.xchacha20(&mut token_ct, &derived, &nonce2);

        let pad = (self.crypto.rand_u64() % (MAX_HANDSHAKE_PAD + 1)) as usize;
        let mut pkt = Vec::with_capacity(SESSION_START_SIZE + pad);
        pkt.extend_from_slice(&token_ct);
        pkt.extend_from_slice(&nonce2);
        let tag = self.crypto.hmac(derived.as_ref(), &pkt[..64]);
        pkt.extend_from_slice(&tag);
        if pad > 0 {
            let mut padding = vec![0u8; pad];
            self.crypto.rand_bytes(&mut padding);
            pkt.extend_from_slice(&padding);
        }

        self.derive_session_key(&nonce2);
        self.last_handshake = Some(pkt.clone());
        self.last_handshake_sent = now;
        self.last_send = now;
        self.transmits.push_back(pkt);
        self.state = SessionState::SessionStartSent;
        self.send_lim(now);
    }

    fn on_session_start(&mut self, datagram: &[u8], now: Instant) {
        if datagram.len() < SESSION_START_SIZE {
            self.close(CloseReason::HandshakeFailure);
            return;
        }
        // a retransmitted Intro re-elicits the stored IntroAck
        if let Some(eph_pub) = self.remote_eph_pub {
            if datagram.len() >= INTRO_SIZE
                && datagram[..32] == eph_pub[..]
                && datagram[32..64] == self.intro_nonce[..]
            {
                if let Some(pkt) = &self.last_handshake {
                    self.transmits.push_back(pkt.clone());
                    self.last_handshake_sent = now;
                }
                return;
            }
        }

        let derived = self.derived.clone().expect("intro derived key");
        if !self
            .crypto
            .hmac_verify(derived.as_ref(), &datagram[..64], &datagram[64..96])
        {
            // possibly an encrypted frame that outran the session start
            log::debug!("link: session-start authenticator mismatch");
            self.auth_failures += 1;
            return;
        }
        let nonce2: [u8; TUNNEL_NONCE_SIZE] =
            datagram[32..64].try_into().expect("sized slice");
        let mut token: [u8; 32] = datagram[..32].try_into().expect("sized slice");
        self.crypto.xchacha20(&mut token, &derived, &nonce2);
        if token != self.token {
            log::debug!("link: session-start token mismatch");
            self.close(CloseReason::HandshakeFailure);
            return;
        }

        self.derive_session_key(&nonce2);
        self.last_recv = now;
        self.last_handshake = None;
        self.send_lim(now);
    }

    fn derive_session_key(&mut self, nonce2: &[u8; TUNNEL_NONCE_SIZE]) {
        let derived = self.derived.as_ref().expect("intro derived key");
        let mut input = Vec::with_capacity(96);
        input.extend_from_slice(derived.as_ref());
        input.extend_from_slice(&self.token);
        input.extend_from_slice(nonce2);
        self.session_key = Some(SharedKey::new(self.crypto.short_hash(&input)));
    }

    /// Message id 0 in each direction: our signed router contact.
    fn send_lim(&mut self, now: Instant) {
        let lim = LinkMessage::Lim(LinkIntro {
            rc: self.our_rc.clone(),
        });
        match lim.encode() {
            Ok(bytes) => {
                if self.frame.queue_message(&bytes, now).is_ok() {
                    self.state = SessionState::LimSent;
                }
            }
            Err(err) => {
                log::warn!("link: failed to encode LIM: {err}");
                self.close(CloseReason::HandshakeFailure);
            }
        }
    }

    // --- established traffic ---

    fn on_encrypted_frame(&mut self, datagram: &[u8], now: Instant) {
        let Some(key) = self.session_key.clone() else {
            return;
        };
        if datagram.len() <= OUTER_OVERHEAD {
            return;
        }
        let plain = match frame::open(&self.crypto, &key, datagram) {
            Ok(plain) => plain,
            Err(_) => {
                // do not touch last-activity on authenticator mismatch; a
                // retransmitted SessionStart also lands here for a responder
                self.auth_failures += 1;
                return;
            }
        };
        self.last_recv = now;
        if let Err(err) = self.frame.process(&plain, now) {
            log::debug!("link: dropping bad frame: {err}");
            return;
        }
        while let Some(message) = self.frame.pop_delivered() {
            self.deliver(message);
        }
    }

    fn deliver(&mut self, message: Vec<u8>) {
        if self.remote_rc.is_some() {
            self.events.push_back(SessionEvent::Message(message));
            return;
        }
        // the first in-order message must be the peer's LIM
        let rc = match LinkMessage::decode(&message) {
            Ok(LinkMessage::Lim(intro)) => intro.rc,
            _ => {
                log::warn!("link: first message was not a LIM");
                self.close(CloseReason::HandshakeFailure);
                return;
            }
        };
        if rc.verify(&self.crypto).is_err() {
            log::warn!("link: LIM carried an invalid router contact");
            self.close(CloseReason::SpoofedLim);
            return;
        }
        if let Some(expected) = self.expected_router {
            if rc.router_id != expected {
                log::warn!(
                    "link: spoofed LIM, expected {expected} got {}",
                    rc.router_id
                );
                self.close(CloseReason::SpoofedLim);
                return;
            }
        }
        let router = rc.router_id;
        self.remote_rc = Some(rc);
        self.last_handshake = None;
        self.state = SessionState::Established;
        self.events.push_back(SessionEvent::Established { router });
    }

    fn pump(&mut self, now: Instant) {
        let Some(key) = self.session_key.clone() else {
            return;
        };
        while let Some(plain) = self.frame.pop_frame(now) {
            self.transmits
                .push_back(frame::seal(&self.crypto, &key, &plain));
            self.last_send = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_core::now_ms;

    fn make_identity(crypto: &CryptoProvider) -> (RouterContact, StaticSecret) {
        let signing = crypto.signing_keygen();
        let enc_secret = crypto.encryption_keygen();
        let rc = RouterContact::signed(
            crypto,
            &signing,
            PublicKey::from(&enc_secret).to_bytes(),
            vec![],
            vec![],
            now_ms() + 3_600_000,
        )
        .expect("sign rc");
        (rc, enc_secret)
    }

    fn shuttle(a: &mut Session, b: &mut Session, now: Instant) {
        for _ in 0..16 {
            let mut quiet = true;
            while let Some(pkt) = a.poll_transmit() {
                b.handle_datagram(&pkt, now);
                quiet = false;
            }
            while let Some(pkt) = b.poll_transmit() {
                a.handle_datagram(&pkt, now);
                quiet = false;
            }
            if quiet {
                break;
            }
        }
    }

    fn establish() -> (Session, Session, CryptoProvider) {
        let crypto = CryptoProvider::new();
        let (rc_a, enc_a) = make_identity(&crypto);
        let (rc_b, enc_b) = make_identity(&crypto);
        let now = Instant::now();

        let mut a = Session::connect(
            crypto,
            rc_a,
            enc_a,
            &rc_b,
            SESSION_TIMEOUT,
            KEEP_ALIVE_INTERVAL,
            now,
        );
        let mut b = Session::accept(
            crypto,
            rc_b,
            enc_b,
            SESSION_TIMEOUT,
            KEEP_ALIVE_INTERVAL,
            now,
        );
        shuttle(&mut a, &mut b, now);
        (a, b, crypto)
    }

    #[test]
    fn handshake_establishes_both_sides() {
        let (mut a, mut b, _) = establish();
        assert!(a.is_established());
        assert!(b.is_established());

        let mut a_saw = false;
        while let Some(event) = a.poll_event() {
            if matches!(event, SessionEvent::Established { .. }) {
                a_saw = true;
            }
        }
        let mut b_saw = false;
        while let Some(event) = b.poll_event() {
            if matches!(event, SessionEvent::Established { .. }) {
                b_saw = true;
            }
        }
        assert!(a_saw && b_saw);
        assert_eq!(a.remote_router(), Some(b.our_rc.router_id));
        assert_eq!(b.remote_router(), Some(a.our_rc.router_id));
    }

    #[test]
    fn messages_flow_after_establishment() {
        let (mut a, mut b, _) = establish();
        let now = Instant::now();
        while a.poll_event().is_some() {}
        while b.poll_event().is_some() {}

        let msg = LinkMessage::Close(umbra_core::wire::PathClose {
            path_id: umbra_core::PathId::new([9; 16]),
        });
        a.queue_message(&msg, now).expect("queue");
        shuttle(&mut a, &mut b, now);

        let mut got = None;
        while let Some(event) = b.poll_event() {
            if let SessionEvent::Message(data) = event {
                got = Some(data);
            }
        }
        let decoded = LinkMessage::decode(&got.expect("message")).expect("decode");
        assert!(matches!(decoded, LinkMessage::Close(_)));
    }

    #[test]
    fn queue_refused_before_establishment() {
        let crypto = CryptoProvider::new();
        let (rc_a, enc_a) = make_identity(&crypto);
        let (rc_b, _) = make_identity(&crypto);
        let now = Instant::now();
        let mut a = Session::connect(
            crypto,
            rc_a,
            enc_a,
            &rc_b,
            SESSION_TIMEOUT,
            KEEP_ALIVE_INTERVAL,
            now,
        );
        let msg = LinkMessage::Close(umbra_core::wire::PathClose {
            path_id: umbra_core::PathId::zero(),
        });
        assert!(matches!(
            a.queue_message(&msg, now),
            Err(Error::NoSession(_))
        ));
    }

    #[test]
    fn tampered_intro_destroys_nascent_session() {
        let crypto = CryptoProvider::new();
        let (rc_a, enc_a) = make_identity(&crypto);
        let (rc_b, enc_b) = make_identity(&crypto);
        let now = Instant::now();
        let mut a = Session::connect(
            crypto,
            rc_a,
            enc_a,
            &rc_b,
            SESSION_TIMEOUT,
            KEEP_ALIVE_INTERVAL,
            now,
        );
        let mut b = Session::accept(
            crypto,
            rc_b,
            enc_b,
            SESSION_TIMEOUT,
            KEEP_ALIVE_INTERVAL,
            now,
        );
        let mut intro = a.poll_transmit().expect("intro");
        intro[70] ^= 1; // flip a bit inside the authenticator
        b.handle_datagram(&intro, now);
        assert!(b.is_dead());
    }

    #[test]
    fn session_times_out_after_silence() {
        let (mut a, _b, _) = establish();
        let now = Instant::now();
        a.tick(now + SESSION_TIMEOUT);
        assert!(a.is_dead());

        let mut closed = false;
        while let Some(event) = a.poll_event() {
            if matches!(event, SessionEvent::Closed(CloseReason::Timeout)) {
                closed = true;
            }
        }
        assert!(closed);
    }

    #[test]
    fn keepalive_fills_idle_gaps() {
        let (mut a, mut b, _) = establish();
        let now = Instant::now();
        while a.poll_transmit().is_some() {}

        let later = now + KEEP_ALIVE_INTERVAL;
        a.tick(later);
        let pkt = a.poll_transmit().expect("keepalive frame");
        b.handle_datagram(&pkt, later);
        // an ALIV round keeps the peer's idle clock fresh
        b.tick(later + Duration::from_millis(1));
        assert!(!b.is_dead());
    }

    #[test]
    fn garbage_frames_do_not_refresh_activity() {
        let (mut a, _b, _) = establish();
        let now = Instant::now();
        let before = a.auth_failures();
        a.handle_datagram(&vec![0u8; 128], now + Duration::from_secs(5));
        assert_eq!(a.auth_failures(), before + 1);
        a.tick(now + SESSION_TIMEOUT);
        assert!(a.is_dead());
    }
}
