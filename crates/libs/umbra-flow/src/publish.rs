//! Introset publication pacing: periodic republish, ack-gated success, and
//! exponential cooldown on failure.

use umbra_core::wire::{DhtMessage, DhtOp};
use umbra_core::IntroSet;
use umbra_crypto::CryptoProvider;

pub const DEFAULT_PUBLISH_INTERVAL_MS: u64 = 150_000;
pub const RETRY_COOLDOWN_BASE_MS: u64 = 1_000;
pub const RETRY_COOLDOWN_CAP_MS: u64 = 60_000;
const ACK_DEADLINE_MS: u64 = 5_000;

pub struct Publisher {
    interval_ms: u64,
    last_success_ms: u64,
    next_attempt_ms: u64,
    failures: u32,
    /// Outstanding publish: (txid, deadline).
    in_flight: Option<(u64, u64)>,
}

impl Publisher {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms: interval_ms.max(1),
            last_success_ms: 0,
            next_attempt_ms: 0,
            failures: 0,
            in_flight: None,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// A publish is due on the interval, or sooner when the set would go
    /// stale first, and never while one is in flight or cooling down.
    pub fn due(&self, set: &IntroSet, now_ms: u64) -> bool {
        if self.in_flight.is_some() || now_ms < self.next_attempt_ms {
            return false;
        }
        if now_ms.saturating_sub(self.last_success_ms) >= self.interval_ms {
            return true;
        }
        // replace before the earliest introduction expires
        set.earliest_expiry() != 0 && now_ms + self.interval_ms / 2 >= set.earliest_expiry()
    }

    pub fn begin(&mut self, crypto: &CryptoProvider, set: IntroSet, now_ms: u64) -> DhtMessage {
        let txid = crypto.rand_u64();
        self.in_flight = Some((txid, now_ms + ACK_DEADLINE_MS));
        DhtMessage {
            txid,
            op: DhtOp::PublishIntroSet(set),
        }
    }

    /// Success only on the storing hop's acknowledgement.
    pub fn on_ack(&mut self, txid: u64, code: u8, now_ms: u64) -> bool {
        match self.in_flight {
            Some((expected, _)) if expected == txid => {
                self.in_flight = None;
                if code == 0 {
                    self.failures = 0;
                    self.last_success_ms = now_ms;
                    self.next_attempt_ms = now_ms;
                    true
                } else {
                    self.note_failure(now_ms);
                    false
                }
            }
            _ => false,
        }
    }

    /// Expire an unacknowledged publish.
    pub fn tick(&mut self, now_ms: u64) {
        if let Some((_, deadline)) = self.in_flight {
            if now_ms >= deadline {
                self.in_flight = None;
                self.note_failure(now_ms);
            }
        }
    }

    fn note_failure(&mut self, now_ms: u64) {
        self.failures = self.failures.saturating_add(1);
        let shift = (self.failures - 1).min(6);
        let cooldown = (RETRY_COOLDOWN_BASE_MS << shift).min(RETRY_COOLDOWN_CAP_MS);
        self.next_attempt_ms = now_ms + cooldown;
        log::debug!(
            "publish: failure #{}, retrying in {cooldown}ms",
            self.failures
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ServiceIdentity;
    use umbra_core::{Introduction, PathId, RouterId};

    fn set(crypto: &CryptoProvider, earliest_expiry: u64) -> IntroSet {
        let identity = ServiceIdentity::generate(crypto);
        IntroSet::signed(
            crypto,
            &identity.signing,
            identity.enc_public(),
            String::new(),
            1,
            vec![Introduction {
                router: RouterId::new([1; 32]),
                path_id: PathId::new([1; 16]),
                expires_at: earliest_expiry,
            }],
        )
        .expect("introset")
    }

    #[test]
    fn due_on_interval_and_ack_resets() {
        let crypto = CryptoProvider::new();
        let set = set(&crypto, u64::MAX);
        let mut publisher = Publisher::new(150_000);

        assert!(publisher.due(&set, 0));
        let msg = publisher.begin(&crypto, set.clone(), 0);
        assert!(!publisher.due(&set, 1), "not due while in flight");

        assert!(publisher.on_ack(msg.txid, 0, 100));
        assert!(!publisher.due(&set, 100_000));
        assert!(publisher.due(&set, 150_100));
    }

    #[test]
    fn failure_backs_off_exponentially() {
        let crypto = CryptoProvider::new();
        let set = set(&crypto, u64::MAX);
        let mut publisher = Publisher::new(150_000);

        let msg = publisher.begin(&crypto, set.clone(), 0);
        assert!(!publisher.on_ack(msg.txid, 1, 10));
        assert_eq!(publisher.failures(), 1);
        assert!(!publisher.due(&set, 10), "cooling down");
        assert!(publisher.due(&set, 10 + RETRY_COOLDOWN_BASE_MS + 150_000));

        // second failure doubles the cooldown
        let msg = publisher.begin(&crypto, set.clone(), 200_000);
        assert!(!publisher.on_ack(msg.txid, 1, 200_010));
        assert!(!publisher.due(&set, 200_010 + RETRY_COOLDOWN_BASE_MS));
        assert!(publisher.due(&set, 200_010 + 2 * RETRY_COOLDOWN_BASE_MS + 150_000));
    }

    #[test]
    fn unacked_publish_times_out() {
        let crypto = CryptoProvider::new();
        let set = set(&crypto, u64::MAX);
        let mut publisher = Publisher::new(150_000);
        let _ = publisher.begin(&crypto, set, 0);

        publisher.tick(ACK_DEADLINE_MS - 1);
        assert_eq!(publisher.failures(), 0);
        publisher.tick(ACK_DEADLINE_MS);
        assert_eq!(publisher.failures(), 1);
    }

    #[test]
    fn republish_before_earliest_intro_expiry() {
        let crypto = CryptoProvider::new();
        let set = set(&crypto, 100_000);
        let mut publisher = Publisher::new(150_000);
        let msg = publisher.begin(&crypto, set.clone(), 0);
        publisher.on_ack(msg.txid, 0, 0);

        // interval has not lapsed, but the earliest intro is about to die
        assert!(!publisher.due(&set, 10_000));
        assert!(publisher.due(&set, 30_000));
    }
}
