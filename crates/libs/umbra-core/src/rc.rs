//! Signed router identities and the in-memory contact store.

use std::collections::HashMap;
use std::net::SocketAddr;

use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use umbra_crypto::CryptoProvider;

use crate::error::Error;
use crate::id::RouterId;

/// Current contact format version.
pub const RC_VERSION: u8 = 1;

/// A self-signed, self-describing identity record for a relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterContact {
    pub router_id: RouterId,
    /// X25519 public key used for link handshakes and path-build capsules.
    pub enc_key: [u8; 32],
    /// ML-KEM encapsulation key used for path-build capsules.
    #[serde(with = "serde_bytes")]
    pub pq_key: Vec<u8>,
    pub addrs: Vec<SocketAddr>,
    pub version: u8,
    /// Unix milliseconds after which this contact must not seed new sessions.
    pub expires_at: u64,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl RouterContact {
    /// Build and self-sign a contact for the local router.
    pub fn signed(
        crypto: &CryptoProvider,
        signing_key: &SigningKey,
        enc_key: [u8; 32],
        pq_key: Vec<u8>,
        addrs: Vec<SocketAddr>,
        expires_at: u64,
    ) -> Result<Self, Error> {
        let mut rc = Self {
            router_id: RouterId::new(signing_key.verifying_key().to_bytes()),
            enc_key,
            pq_key,
            addrs,
            version: RC_VERSION,
            expires_at,
            signature: Vec::new(),
        };
        let signable = rc.signable()?;
        rc.signature = crypto.sign(signing_key, &signable).to_vec();
        Ok(rc)
    }

    fn signable(&self) -> Result<Vec<u8>, Error> {
        let mut unsigned = self.clone();
        unsigned.signature = Vec::new();
        Ok(rmp_serde::to_vec(&unsigned)?)
    }

    /// Check the self-signature under the advertised router id.
    pub fn verify(&self, crypto: &CryptoProvider) -> Result<(), Error> {
        let signable = self.signable()?;
        if crypto.verify(self.router_id.as_bytes(), &signable, &self.signature) {
            Ok(())
        } else {
            Err(Error::InvalidSignature)
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// In-memory index of router contacts. Single writer (the logic task);
/// readers receive cloned snapshots.
#[derive(Default)]
pub struct RcStore {
    contacts: HashMap<RouterId, RouterContact>,
}

impl RcStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn get(&self, router: &RouterId) -> Option<RouterContact> {
        self.contacts.get(router).cloned()
    }

    pub fn contains(&self, router: &RouterId) -> bool {
        self.contacts.contains_key(router)
    }

    /// Insert a verified contact. An older record (by signed expiry) never
    /// replaces a newer one; at most one current contact per router.
    pub fn put(&mut self, crypto: &CryptoProvider, rc: RouterContact) -> Result<(), Error> {
        rc.verify(crypto)?;
        match self.contacts.get(&rc.router_id) {
            Some(existing) if existing.expires_at > rc.expires_at => {
                log::debug!("rc: ignoring stale contact for {}", rc.router_id);
            }
            _ => {
                self.contacts.insert(rc.router_id, rc);
            }
        }
        Ok(())
    }

    pub fn remove(&mut self, router: &RouterId) -> Option<RouterContact> {
        self.contacts.remove(router)
    }

    pub fn remove_expired(&mut self, now: u64) -> usize {
        let before = self.contacts.len();
        self.contacts.retain(|_, rc| !rc.is_expired(now));
        before - self.contacts.len()
    }

    /// Uniform sample of up to `k` distinct, unexpired contacts passing the
    /// caller's filter. Partial Fisher-Yates over a snapshot of the keys.
    pub fn random_sample<F>(
        &self,
        crypto: &CryptoProvider,
        k: usize,
        now: u64,
        filter: F,
    ) -> Vec<RouterContact>
    where
        F: Fn(&RouterContact) -> bool,
    {
        let mut candidates: Vec<&RouterContact> = self
            .contacts
            .values()
            .filter(|rc| !rc.is_expired(now) && filter(rc))
            .collect();

        let mut picked = Vec::with_capacity(k.min(candidates.len()));
        while picked.len() < k && !candidates.is_empty() {
            let idx = (crypto.rand_u64() % candidates.len() as u64) as usize;
            picked.push(candidates.swap_remove(idx).clone());
        }
        picked
    }

    /// Routers sorted by XOR distance of their id to `key`, nearest first.
    /// This is the DHT neighborhood used for introset placement.
    pub fn closest_to(&self, key: &[u8; 32], count: usize, now: u64) -> Vec<RouterContact> {
        let mut all: Vec<&RouterContact> = self
            .contacts
            .values()
            .filter(|rc| !rc.is_expired(now))
            .collect();
        all.sort_by_key(|rc| xor_distance(rc.router_id.as_bytes(), key));
        all.into_iter().take(count).cloned().collect()
    }
}

/// XOR metric over 32-byte keys, big-endian ordering.
pub fn xor_distance(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_rc(crypto: &CryptoProvider, expires_at: u64) -> (SigningKey, RouterContact) {
        let signing = crypto.signing_keygen();
        let rc = RouterContact::signed(
            crypto,
            &signing,
            [9u8; 32],
            vec![1, 2, 3],
            vec!["127.0.0.1:7000".parse().expect("addr")],
            expires_at,
        )
        .expect("sign rc");
        (signing, rc)
    }

    #[test]
    fn signature_round_trip() {
        let crypto = CryptoProvider::new();
        let (_, rc) = make_rc(&crypto, 10_000);
        rc.verify(&crypto).expect("valid signature");

        let mut tampered = rc.clone();
        tampered.expires_at += 1;
        assert!(tampered.verify(&crypto).is_err());
    }

    #[test]
    fn put_rejects_bad_signature() {
        let crypto = CryptoProvider::new();
        let (_, mut rc) = make_rc(&crypto, 10_000);
        rc.signature[0] ^= 1;
        let mut store = RcStore::new();
        assert!(store.put(&crypto, rc).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn put_keeps_newest() {
        let crypto = CryptoProvider::new();
        let signing = crypto.signing_keygen();
        let newer = RouterContact::signed(&crypto, &signing, [0; 32], vec![], vec![], 20_000)
            .expect("sign");
        let older = RouterContact::signed(&crypto, &signing, [0; 32], vec![], vec![], 10_000)
            .expect("sign");

        let mut store = RcStore::new();
        store.put(&crypto, newer.clone()).expect("put newer");
        store.put(&crypto, older).expect("put older");
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get(&newer.router_id).expect("present").expires_at,
            20_000
        );
    }

    #[test]
    fn random_sample_skips_expired_and_filtered() {
        let crypto = CryptoProvider::new();
        let mut store = RcStore::new();
        let (_, live) = make_rc(&crypto, 10_000);
        let (_, dead) = make_rc(&crypto, 1_000);
        store.put(&crypto, live.clone()).expect("put");
        store.put(&crypto, dead.clone()).expect("put");

        let sample = store.random_sample(&crypto, 5, 5_000, |_| true);
        assert_eq!(sample.len(), 1);
        assert_eq!(sample[0].router_id, live.router_id);

        let none = store.random_sample(&crypto, 5, 5_000, |rc| rc.router_id != live.router_id);
        assert!(none.is_empty());
    }

    #[test]
    fn closest_to_orders_by_xor() {
        let crypto = CryptoProvider::new();
        let mut store = RcStore::new();
        for _ in 0..8 {
            let (_, rc) = make_rc(&crypto, u64::MAX);
            store.put(&crypto, rc).expect("put");
        }
        let key = [0x5a; 32];
        let ranked = store.closest_to(&key, 8, 0);
        for pair in ranked.windows(2) {
            assert!(
                xor_distance(pair[0].router_id.as_bytes(), &key)
                    <= xor_distance(pair[1].router_id.as_bytes(), &key)
            );
        }
    }
}
