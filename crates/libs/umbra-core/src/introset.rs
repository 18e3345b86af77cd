//! Introductions and introduction sets - how a hidden service advertises
//! the path endpoints it can be reached through.

use std::collections::HashSet;

use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use umbra_crypto::CryptoProvider;

use crate::error::Error;
use crate::id::{PathId, RouterId, ServiceAddress};

/// One advertised path terminus: the named path ends at the named router
/// until `expires_at` (unix milliseconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Introduction {
    pub router: RouterId,
    pub path_id: PathId,
    pub expires_at: u64,
}

impl Introduction {
    pub fn is_valid(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

/// Signed set of current introductions for one service address, stored in
/// the DHT under that address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntroSet {
    pub service: ServiceAddress,
    /// X25519 public key used for flow handshakes with this service.
    pub enc_key: [u8; 32],
    /// Short tag for topic-based discovery; may be empty.
    pub topic: String,
    pub sequence: u64,
    pub intros: Vec<Introduction>,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl IntroSet {
    pub fn signed(
        crypto: &CryptoProvider,
        signing_key: &SigningKey,
        enc_key: [u8; 32],
        topic: String,
        sequence: u64,
        intros: Vec<Introduction>,
    ) -> Result<Self, Error> {
        let mut set = Self {
            service: ServiceAddress::new(signing_key.verifying_key().to_bytes()),
            enc_key,
            topic,
            sequence,
            intros,
            signature: Vec::new(),
        };
        let signable = set.signable()?;
        set.signature = crypto.sign(signing_key, &signable).to_vec();
        Ok(set)
    }

    fn signable(&self) -> Result<Vec<u8>, Error> {
        let mut unsigned = self.clone();
        unsigned.signature = Vec::new();
        Ok(rmp_serde::to_vec(&unsigned)?)
    }

    /// Freshness invariant: signature valid under the service address and at
    /// least one introduction still alive.
    pub fn verify(&self, crypto: &CryptoProvider, now: u64) -> Result<(), Error> {
        let signable = self.signable()?;
        if !crypto.verify(self.service.as_bytes(), &signable, &self.signature) {
            return Err(Error::InvalidSignature);
        }
        if !self.intros.iter().any(|i| i.is_valid(now)) {
            return Err(Error::IntroSetStale);
        }
        Ok(())
    }

    /// Latest expiry across the contained introductions; the tie-breaker
    /// when two sets carry the same sequence number.
    pub fn latest_expiry(&self) -> u64 {
        self.intros.iter().map(|i| i.expires_at).max().unwrap_or(0)
    }

    /// Earliest intro expiry - the publisher must replace its set before
    /// this instant.
    pub fn earliest_expiry(&self) -> u64 {
        self.intros.iter().map(|i| i.expires_at).min().unwrap_or(0)
    }

    pub fn supersedes(&self, other: &IntroSet) -> bool {
        if self.sequence != other.sequence {
            return self.sequence > other.sequence;
        }
        self.latest_expiry() > other.latest_expiry()
    }

    /// Pick a usable introduction: unexpired and not blacklisted. Prefers
    /// the one expiring last so a flow rides it as long as possible.
    pub fn best_intro(&self, now: u64, blacklist: &HashSet<RouterId>) -> Option<&Introduction> {
        self.intros
            .iter()
            .filter(|i| i.is_valid(now) && !blacklist.contains(&i.router))
            .max_by_key(|i| i.expires_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intro(router_byte: u8, expires_at: u64) -> Introduction {
        Introduction {
            router: RouterId::new([router_byte; 32]),
            path_id: PathId::new([router_byte; 16]),
            expires_at,
        }
    }

    fn signed_set(crypto: &CryptoProvider, sequence: u64, intros: Vec<Introduction>) -> IntroSet {
        let key = crypto.signing_keygen();
        IntroSet::signed(crypto, &key, [4u8; 32], String::new(), sequence, intros)
            .expect("sign introset")
    }

    #[test]
    fn verify_accepts_fresh_set() {
        let crypto = CryptoProvider::new();
        let set = signed_set(&crypto, 1, vec![intro(1, 10_000)]);
        set.verify(&crypto, 5_000).expect("fresh");
    }

    #[test]
    fn verify_rejects_all_expired() {
        let crypto = CryptoProvider::new();
        let set = signed_set(&crypto, 1, vec![intro(1, 1_000), intro(2, 2_000)]);
        assert!(matches!(
            set.verify(&crypto, 5_000),
            Err(Error::IntroSetStale)
        ));
    }

    #[test]
    fn verify_rejects_tampered_sequence() {
        let crypto = CryptoProvider::new();
        let mut set = signed_set(&crypto, 1, vec![intro(1, 10_000)]);
        set.sequence = 2;
        assert!(matches!(
            set.verify(&crypto, 5_000),
            Err(Error::InvalidSignature)
        ));
    }

    #[test]
    fn supersedes_by_sequence_then_expiry() {
        let crypto = CryptoProvider::new();
        let low = signed_set(&crypto, 1, vec![intro(1, 10_000)]);
        let high = signed_set(&crypto, 2, vec![intro(1, 5_000)]);
        assert!(high.supersedes(&low));
        assert!(!low.supersedes(&high));

        let short = signed_set(&crypto, 3, vec![intro(1, 5_000)]);
        let long = signed_set(&crypto, 3, vec![intro(1, 9_000)]);
        assert!(long.supersedes(&short));
    }

    #[test]
    fn best_intro_honors_blacklist() {
        let crypto = CryptoProvider::new();
        let set = signed_set(&crypto, 1, vec![intro(1, 10_000), intro(2, 20_000)]);

        let mut blacklist = HashSet::new();
        let best = set.best_intro(0, &blacklist).expect("intro");
        assert_eq!(best.router, RouterId::new([2; 32]));

        blacklist.insert(RouterId::new([2; 32]));
        let best = set.best_intro(0, &blacklist).expect("intro");
        assert_eq!(best.router, RouterId::new([1; 32]));

        blacklist.insert(RouterId::new([1; 32]));
        assert!(set.best_intro(0, &blacklist).is_none());
    }
}
