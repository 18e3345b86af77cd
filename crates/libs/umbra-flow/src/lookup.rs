//! Introset lookup: cooldown-gated, issued over multiple disjoint paths,
//! resolved by highest sequence once enough distinct paths answered.

use std::collections::HashMap;

use umbra_core::wire::{DhtMessage, DhtOp};
use umbra_core::{Error, IntroSet, PathId, ServiceAddress};
use umbra_crypto::CryptoProvider;

#[derive(Debug, Clone, Copy)]
pub struct LookupConfig {
    /// Decaying per-service rate limit.
    pub cooldown_ms: u64,
    /// Responses from at least this many distinct paths before accepting.
    pub quorum: usize,
    pub deadline_ms: u64,
    pub max_retries: u32,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 250,
            quorum: 2,
            deadline_ms: 5_000,
            max_retries: 3,
        }
    }
}

struct PendingLookup {
    service: ServiceAddress,
    /// txid -> the path it was issued on.
    txids: HashMap<u64, PathId>,
    responses: HashMap<PathId, Option<IntroSet>>,
    deadline_ms: u64,
}

pub enum LookupProgress {
    Pending,
    /// Quorum reached; the best verified set, if any path had one.
    Done {
        service: ServiceAddress,
        result: Option<IntroSet>,
    },
    Unmatched,
}

#[derive(Default)]
pub struct LookupManager {
    pending: Vec<PendingLookup>,
    last_issued: HashMap<ServiceAddress, u64>,
}

impl LookupManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Issue a lookup for `service` over the given paths. Requires at least
    /// `quorum` distinct paths and honors the per-service cooldown.
    pub fn begin(
        &mut self,
        crypto: &CryptoProvider,
        config: &LookupConfig,
        service: ServiceAddress,
        paths: &[PathId],
        now_ms: u64,
    ) -> Result<Vec<(PathId, DhtMessage)>, Error> {
        if let Some(last) = self.last_issued.get(&service) {
            if now_ms.saturating_sub(*last) < config.cooldown_ms {
                return Err(Error::Congested);
            }
        }
        let mut distinct: Vec<PathId> = Vec::new();
        for path in paths {
            if !distinct.contains(path) {
                distinct.push(*path);
            }
        }
        if distinct.len() < config.quorum {
            return Err(Error::IntroSetLookupFailed);
        }
        if self.pending.iter().any(|p| p.service == service) {
            return Err(Error::Congested);
        }

        let mut txids = HashMap::new();
        let mut requests = Vec::new();
        for path in distinct {
            let txid = crypto.rand_u64();
            txids.insert(txid, path);
            requests.push((
                path,
                DhtMessage {
                    txid,
                    op: DhtOp::FindIntroSet(service),
                },
            ));
        }

        self.last_issued.insert(service, now_ms);
        self.pending.push(PendingLookup {
            service,
            txids,
            responses: HashMap::new(),
            deadline_ms: now_ms + config.deadline_ms,
        });
        Ok(requests)
    }

    /// Feed a `GotIntroSet` reply that arrived on `path`.
    pub fn on_response(
        &mut self,
        crypto: &CryptoProvider,
        config: &LookupConfig,
        txid: u64,
        result: Option<IntroSet>,
        now_ms: u64,
    ) -> LookupProgress {
        let Some(index) = self
            .pending
            .iter()
            .position(|p| p.txids.contains_key(&txid))
        else {
            return LookupProgress::Unmatched;
        };
        let pending = &mut self.pending[index];
        let path = pending.txids[&txid];

        // only verified, fresh sets count as positive answers
        let verified = result.filter(|set| {
            set.service == pending.service && set.verify(crypto, now_ms).is_ok()
        });
        pending.responses.insert(path, verified);

        if pending.responses.len() < config.quorum {
            return LookupProgress::Pending;
        }

        let pending = self.pending.swap_remove(index);
        let best = pending
            .responses
            .into_values()
            .flatten()
            .max_by(|a, b| {
                a.sequence
                    .cmp(&b.sequence)
                    .then(a.latest_expiry().cmp(&b.latest_expiry()))
            });
        LookupProgress::Done {
            service: pending.service,
            result: best,
        }
    }

    /// Expire overdue lookups. Each failure is surfaced once; the caller
    /// decides whether to retry after its own cooldown.
    pub fn tick(&mut self, now_ms: u64) -> Vec<(ServiceAddress, Error)> {
        let mut failed = Vec::new();
        self.pending.retain(|p| {
            if now_ms >= p.deadline_ms {
                failed.push((p.service, Error::IntroSetLookupFailed));
                false
            } else {
                true
            }
        });
        failed
    }
}
