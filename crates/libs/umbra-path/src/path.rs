//! Client-side state for a path the local router built and owns.

use umbra_core::wire::{LinkMessage, PathEnvelope, TerminalMessage};
use umbra_core::{Error, PathId, RouterContact, RouterId};
use umbra_crypto::{CryptoProvider, SharedKey};

use crate::onion::{self, HopCrypt};

/// Three failed latency probes in a row kill a path.
pub const PROBE_STRIKES_FATAL: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    Building,
    Established,
    Expired,
    Failed,
}

#[derive(Clone)]
pub struct PathHop {
    pub rc: RouterContact,
    pub path_id: PathId,
    pub key: SharedKey,
}

pub struct OwnedPath {
    pub hops: Vec<PathHop>,
    pub status: PathStatus,
    pub started_build_ms: u64,
    pub established_at_ms: u64,
    pub expires_at_ms: u64,
    pub latency_ms: Option<u64>,
    /// Outstanding probe, if any: (txid, sent-at).
    probe: Option<(u64, u64)>,
    probe_strikes: u32,
    pub last_probe_ms: u64,
    /// Identifies the hop selection for stampede control.
    pub hopset_hash: u64,
}

impl OwnedPath {
    pub fn new(hops: Vec<PathHop>, hopset_hash: u64, now_ms: u64) -> Self {
        Self {
            hops,
            status: PathStatus::Building,
            started_build_ms: now_ms,
            established_at_ms: 0,
            expires_at_ms: 0,
            latency_ms: None,
            probe: None,
            probe_strikes: 0,
            last_probe_ms: 0,
            hopset_hash,
        }
    }

    /// The path id on the first hop - how the path owner recognizes
    /// upstream traffic and build statuses.
    pub fn outer_path_id(&self) -> PathId {
        self.hops.first().map(|h| h.path_id).unwrap_or_default()
    }

    pub fn first_hop_router(&self) -> RouterId {
        self.hops
            .first()
            .map(|h| h.rc.router_id)
            .unwrap_or_default()
    }

    pub fn terminus_router(&self) -> RouterId {
        self.hops
            .last()
            .map(|h| h.rc.router_id)
            .unwrap_or_default()
    }

    pub fn terminus_path_id(&self) -> PathId {
        self.hops.last().map(|h| h.path_id).unwrap_or_default()
    }

    pub fn contains_router(&self, router: &RouterId) -> bool {
        self.hops.iter().any(|h| h.rc.router_id == *router)
    }

    fn hop_crypt(&self) -> Vec<HopCrypt> {
        self.hops
            .iter()
            .map(|h| HopCrypt {
                path_id: h.path_id,
                key: h.key.clone(),
            })
            .collect()
    }

    /// Onion-wrap a terminal message for this path. Returns the first-hop
    /// router and the link message to hand to it.
    pub fn wrap(
        &self,
        crypto: &CryptoProvider,
        terminal: &TerminalMessage,
    ) -> Result<(RouterId, LinkMessage), Error> {
        let payload = terminal.encode()?;
        let env = onion::wrap_downstream(crypto, &self.hop_crypt(), &payload)?;
        Ok((self.first_hop_router(), LinkMessage::Path(env)))
    }

    /// Strip all layers from upstream traffic and decode the terminal body.
    pub fn open_upstream(
        &self,
        crypto: &CryptoProvider,
        env: PathEnvelope,
    ) -> Result<TerminalMessage, Error> {
        let plain = onion::unwrap_upstream(crypto, &self.hop_crypt(), env)?;
        TerminalMessage::decode(&plain)
    }

    pub fn mark_established(&mut self, now_ms: u64, lifetime_ms: u64) {
        self.status = PathStatus::Established;
        self.established_at_ms = now_ms;
        self.expires_at_ms = now_ms + lifetime_ms;
    }

    pub fn mark_failed(&mut self) {
        self.status = PathStatus::Failed;
    }

    pub fn is_usable(&self, now_ms: u64) -> bool {
        self.status == PathStatus::Established && now_ms < self.expires_at_ms
    }

    /// A client rebuilds shortly before expiry so it is never pathless.
    pub fn needs_rebuild(&self, now_ms: u64, slack_ms: u64) -> bool {
        self.status == PathStatus::Established && now_ms + slack_ms >= self.expires_at_ms
    }

    pub fn expire_tick(&mut self, now_ms: u64) {
        if self.status == PathStatus::Established && now_ms >= self.expires_at_ms {
            self.status = PathStatus::Expired;
        }
    }

    // --- latency probes ---

    pub fn begin_probe(&mut self, crypto: &CryptoProvider, now_ms: u64) -> TerminalMessage {
        let txid = crypto.rand_u64();
        self.probe = Some((txid, now_ms));
        self.last_probe_ms = now_ms;
        TerminalMessage::Probe { txid }
    }

    pub fn has_probe_in_flight(&self) -> bool {
        self.probe.is_some()
    }

    /// Returns the measured latency when the reply matches the probe.
    pub fn on_probe_reply(&mut self, txid: u64, now_ms: u64) -> Option<u64> {
        match self.probe {
            Some((expected, sent)) if expected == txid => {
                self.probe = None;
                self.probe_strikes = 0;
                let latency = now_ms.saturating_sub(sent);
                self.latency_ms = Some(latency);
                Some(latency)
            }
            _ => None,
        }
    }

    /// Called when a probe deadline lapses; returns true once the path is
    /// declared dead.
    pub fn on_probe_timeout(&mut self, timeout_ms: u64, now_ms: u64) -> bool {
        let Some((_, sent)) = self.probe else {
            return false;
        };
        if now_ms.saturating_sub(sent) < timeout_ms {
            return false;
        }
        self.probe = None;
        self.probe_strikes += 1;
        if self.probe_strikes >= PROBE_STRIKES_FATAL {
            self.status = PathStatus::Failed;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_core::now_ms;

    fn make_path(crypto: &CryptoProvider, n: usize) -> OwnedPath {
        let hops = (0..n)
            .map(|i| {
                let signing = crypto.signing_keygen();
                let rc = RouterContact::signed(
                    crypto,
                    &signing,
                    [i as u8; 32],
                    vec![],
                    vec![],
                    now_ms() + 3_600_000,
                )
                .expect("rc");
                PathHop {
                    rc,
                    path_id: PathId::new([i as u8 + 1; 16]),
                    key: SharedKey::new([i as u8 + 50; 32]),
                }
            })
            .collect();
        OwnedPath::new(hops, 77, 1_000)
    }

    #[test]
    fn lifecycle_established_to_expired() {
        let crypto = CryptoProvider::new();
        let mut path = make_path(&crypto, 3);
        assert_eq!(path.status, PathStatus::Building);
        assert!(!path.is_usable(1_000));

        path.mark_established(1_000, 600_000);
        assert!(path.is_usable(1_001));
        assert!(!path.needs_rebuild(1_001, 60_000));
        assert!(path.needs_rebuild(541_001, 60_000));

        path.expire_tick(601_000);
        assert_eq!(path.status, PathStatus::Expired);
        assert!(!path.is_usable(601_000));
    }

    #[test]
    fn wrap_unwrap_round_trip_through_own_keys() {
        let crypto = CryptoProvider::new();
        let path = make_path(&crypto, 3);
        let message = TerminalMessage::Probe { txid: 42 };
        let (first, wrapped) = path.wrap(&crypto, &message).expect("wrap");
        assert_eq!(first, path.first_hop_router());

        // simulate hop peels, then rebuild the upstream direction
        let LinkMessage::Path(env) = wrapped else {
            panic!("expected a path message");
        };
        let mut env = env;
        let crypts = path.hop_crypt();
        let mut plain = Vec::new();
        for (i, hop) in crypts.iter().enumerate() {
            plain = crate::onion::peel_layer(&crypto, &hop.key, &env);
            if i < crypts.len() - 1 {
                env = crate::onion::next_envelope(&plain).expect("envelope");
            }
        }
        match TerminalMessage::decode(&plain).expect("decode") {
            TerminalMessage::Probe { txid } => assert_eq!(txid, 42),
            _ => panic!("wrong terminal message"),
        }
    }

    #[test]
    fn three_probe_timeouts_kill_the_path() {
        let crypto = CryptoProvider::new();
        let mut path = make_path(&crypto, 3);
        path.mark_established(0, 600_000);

        for round in 0..PROBE_STRIKES_FATAL {
            let _ = path.begin_probe(&crypto, 1_000 * round as u64);
            let dead = path.on_probe_timeout(500, 1_000 * round as u64 + 600);
            assert_eq!(dead, round + 1 == PROBE_STRIKES_FATAL);
        }
        assert_eq!(path.status, PathStatus::Failed);
    }

    #[test]
    fn probe_reply_resets_strikes_and_records_latency() {
        let crypto = CryptoProvider::new();
        let mut path = make_path(&crypto, 3);
        path.mark_established(0, 600_000);

        let probe = path.begin_probe(&crypto, 10_000);
        let TerminalMessage::Probe { txid } = probe else {
            panic!("expected probe");
        };
        assert!(path.on_probe_reply(999, 10_050).is_none());
        assert_eq!(path.on_probe_reply(txid, 10_050), Some(50));
        assert_eq!(path.latency_ms, Some(50));
    }
}
