//! DHT-node side of introset storage.

use std::collections::HashMap;

use umbra_core::{Error, IntroSet, ServiceAddress};
use umbra_crypto::CryptoProvider;

#[derive(Default)]
pub struct IntroSetStore {
    sets: HashMap<ServiceAddress, IntroSet>,
}

impl IntroSetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Store a published set. Verifies freshness, keeps the highest
    /// sequence, and is idempotent for a re-publish of the same sequence.
    /// Returns whether the stored copy changed.
    pub fn put(
        &mut self,
        crypto: &CryptoProvider,
        set: IntroSet,
        now_ms: u64,
    ) -> Result<bool, Error> {
        set.verify(crypto, now_ms)?;
        match self.sets.get(&set.service) {
            Some(existing) if !set.supersedes(existing) => {
                if set.sequence == existing.sequence {
                    // same publication again: one stored copy, no change
                    Ok(false)
                } else {
                    log::debug!(
                        "introset: ignoring stale sequence {} for {}",
                        set.sequence,
                        set.service
                    );
                    Ok(false)
                }
            }
            _ => {
                self.sets.insert(set.service, set);
                Ok(true)
            }
        }
    }

    /// Fetch the current set for a service, fresh introductions only.
    pub fn get(&self, service: &ServiceAddress, now_ms: u64) -> Option<IntroSet> {
        let set = self.sets.get(service)?;
        if set.intros.iter().any(|i| i.is_valid(now_ms)) {
            Some(set.clone())
        } else {
            None
        }
    }

    pub fn sweep(&mut self, now_ms: u64) -> usize {
        let before = self.sets.len();
        self.sets
            .retain(|_, set| set.intros.iter().any(|i| i.is_valid(now_ms)));
        before - self.sets.len()
    }
}
