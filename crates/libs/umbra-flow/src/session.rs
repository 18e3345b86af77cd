//! Per-conversation endpoint state.

use umbra_core::{ConvoTag, Error, IntroSet, Introduction, ServiceAddress};
use umbra_crypto::SharedKey;

use crate::replay::ReplayWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Handshake sent, awaiting the ack.
    Pending,
    Established,
    Rejected,
}

pub struct FlowSession {
    pub tag: ConvoTag,
    pub remote: ServiceAddress,
    pub key: SharedKey,
    pub state: FlowState,
    /// The remote's introset as of the handshake; used to route replies.
    pub remote_introset: Option<IntroSet>,
    pub last_intro: Option<Introduction>,
    next_seq: u64,
    rx: ReplayWindow,
    pub last_activity_ms: u64,
    replay_drops: u64,
}

impl FlowSession {
    /// Outbound flow: we initiated, handshake in flight.
    pub fn outbound(
        tag: ConvoTag,
        remote: ServiceAddress,
        key: SharedKey,
        remote_introset: IntroSet,
        intro: Introduction,
        now_ms: u64,
    ) -> Self {
        Self {
            tag,
            remote,
            key,
            state: FlowState::Pending,
            remote_introset: Some(remote_introset),
            last_intro: Some(intro),
            next_seq: 1,
            rx: ReplayWindow::new(),
            last_activity_ms: now_ms,
            replay_drops: 0,
        }
    }

    /// Inbound flow: the remote initiated; it is established as soon as we
    /// ack.
    pub fn inbound(
        tag: ConvoTag,
        remote: ServiceAddress,
        key: SharedKey,
        remote_introset: Option<IntroSet>,
        now_ms: u64,
    ) -> Self {
        Self {
            tag,
            remote,
            key,
            state: FlowState::Established,
            remote_introset,
            last_intro: None,
            next_seq: 1,
            rx: ReplayWindow::new(),
            last_activity_ms: now_ms,
            replay_drops: 0,
        }
    }

    pub fn next_sequence(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub fn highest_inbound(&self) -> u64 {
        self.rx.highest_seen()
    }

    pub fn replay_drops(&self) -> u64 {
        self.replay_drops
    }

    /// Window the inbound sequence; a rejected number is a replay.
    pub fn accept_inbound(&mut self, seq: u64, now_ms: u64) -> Result<(), Error> {
        if self.rx.accept(seq) {
            self.last_activity_ms = now_ms;
            Ok(())
        } else {
            self.replay_drops += 1;
            Err(Error::ReplayDetected)
        }
    }

    /// Pick a usable introduction of the remote, rotating off expired ones.
    pub fn route_intro(
        &mut self,
        now_ms: u64,
        blacklist: &std::collections::HashSet<umbra_core::RouterId>,
    ) -> Option<Introduction> {
        if let Some(current) = &self.last_intro {
            if current.is_valid(now_ms) && !blacklist.contains(&current.router) {
                return self.last_intro.clone();
            }
        }
        let set = self.remote_introset.as_ref()?;
        let fresh = set.best_intro(now_ms, blacklist)?.clone();
        self.last_intro = Some(fresh.clone());
        Some(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use umbra_core::{PathId, RouterId};
    use umbra_crypto::CryptoProvider;

    fn intro(router: u8, expires_at: u64) -> Introduction {
        Introduction {
            router: RouterId::new([router; 32]),
            path_id: PathId::new([router; 16]),
            expires_at,
        }
    }

    fn session_with_intros(intros: Vec<Introduction>) -> FlowSession {
        let crypto = CryptoProvider::new();
        let identity = crate::identity::ServiceIdentity::generate(&crypto);
        let set = IntroSet::signed(
            &crypto,
            &identity.signing,
            identity.enc_public(),
            String::new(),
            1,
            intros.clone(),
        )
        .expect("introset");
        FlowSession::outbound(
            ConvoTag::new([1; 16]),
            identity.address(),
            SharedKey::new([2; 32]),
            set,
            intros[0].clone(),
            0,
        )
    }

    #[test]
    fn sequence_numbers_are_monotonic() {
        let mut s = session_with_intros(vec![intro(1, 10_000)]);
        assert_eq!(s.next_sequence(), 1);
        assert_eq!(s.next_sequence(), 2);
        assert_eq!(s.next_sequence(), 3);
    }

    #[test]
    fn replay_is_counted_and_rejected() {
        let mut s = session_with_intros(vec![intro(1, 10_000)]);
        s.accept_inbound(1, 0).expect("fresh");
        s.accept_inbound(3, 0).expect("ahead");
        s.accept_inbound(2, 0).expect("window");
        assert!(matches!(
            s.accept_inbound(2, 0),
            Err(Error::ReplayDetected)
        ));
        assert_eq!(s.replay_drops(), 1);
        assert_eq!(s.highest_inbound(), 3);
    }

    #[test]
    fn intro_rotates_when_the_current_expires() {
        let mut s = session_with_intros(vec![intro(1, 1_000), intro(2, 100_000)]);
        let blacklist = HashSet::new();

        let first = s.route_intro(500, &blacklist).expect("intro");
        assert_eq!(first.router, RouterId::new([1; 32]));

        // after expiry the session rotates to the surviving intro
        let second = s.route_intro(5_000, &blacklist).expect("intro");
        assert_eq!(second.router, RouterId::new([2; 32]));
        assert_eq!(s.last_intro.as_ref().map(|i| i.router), Some(second.router));
    }

    #[test]
    fn blacklisted_intro_is_skipped() {
        let mut s = session_with_intros(vec![intro(1, 100_000), intro(2, 100_000)]);
        let mut blacklist = HashSet::new();
        blacklist.insert(RouterId::new([1; 32]));
        let picked = s.route_intro(0, &blacklist).expect("intro");
        assert_eq!(picked.router, RouterId::new([2; 32]));
    }
}
