//! Client path builder: hop sampling under operator constraints, commit
//! construction, build deadlines, and the exponential cooldown for hops
//! that refuse or time out.

use std::collections::{HashMap, HashSet};

use umbra_core::wire::{status_code, CommitRecord, RelayCommit, RelayStatus};
use umbra_core::{Config, Error, PathId, RcStore, RouterId};
use umbra_crypto::CryptoProvider;

use crate::capsule;
use crate::path::{OwnedPath, PathHop};

pub const BUILD_TIMEOUT_MS: u64 = 10_000;
const BACKOFF_BASE_MS: u64 = 30_000;
const BACKOFF_CAP_MS: u64 = 60 * 60 * 1000;

struct Backoff {
    strikes: u32,
    until_ms: u64,
}

pub struct PendingBuild {
    pub path: OwnedPath,
    pub deadline_ms: u64,
    guard: (RouterId, u64),
}

#[derive(Debug)]
pub struct BuildFailure {
    pub outer: PathId,
    pub error: Error,
}

pub enum StatusOutcome {
    Established(OwnedPath),
    Rejected { hop: RouterId, code: u8 },
    Unmatched,
}

pub struct PathBuilder {
    crypto: CryptoProvider,
    our_router: RouterId,
    pending: HashMap<PathId, PendingBuild>,
    cooldowns: HashMap<RouterId, Backoff>,
    /// One in-flight build per (terminus, hop-set) to prevent stampedes.
    in_flight: HashSet<(RouterId, u64)>,
}

impl PathBuilder {
    pub fn new(crypto: CryptoProvider, our_router: RouterId) -> Self {
        Self {
            crypto,
            our_router,
            pending: HashMap::new(),
            cooldowns: HashMap::new(),
            in_flight: HashSet::new(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_suspect(&self, router: &RouterId, now_ms: u64) -> bool {
        self.cooldowns
            .get(router)
            .map(|b| now_ms < b.until_ms)
            .unwrap_or(false)
    }

    /// Exponential cooldown: 30 s doubling per strike, capped at an hour.
    pub fn strike(&mut self, router: RouterId, now_ms: u64) {
        let entry = self.cooldowns.entry(router).or_insert(Backoff {
            strikes: 0,
            until_ms: 0,
        });
        entry.strikes = entry.strikes.saturating_add(1);
        let shift = (entry.strikes - 1).min(7);
        let cooldown = (BACKOFF_BASE_MS << shift).min(BACKOFF_CAP_MS);
        entry.until_ms = now_ms + cooldown;
        log::debug!("path: {router} suspect for {cooldown}ms ({} strikes)", entry.strikes);
    }

    /// Sample hops and produce the commit for a new path. The returned
    /// commit goes to the first hop; the pending build resolves via
    /// [`PathBuilder::on_status`] or times out in [`PathBuilder::tick`].
    pub fn begin_build(
        &mut self,
        store: &RcStore,
        config: &Config,
        avoid: Option<&RouterId>,
        now_ms: u64,
    ) -> Result<(PathId, RouterId, RelayCommit), Error> {
        let n = config.hops_per_path.max(1);
        let hops = store.random_sample(&self.crypto, n, now_ms, |rc| {
            rc.router_id != self.our_router
                && Some(&rc.router_id) != avoid
                && config.allows_hop(&rc.router_id)
                && !self.is_suspect(&rc.router_id, now_ms)
                && !rc.pq_key.is_empty()
        });
        if hops.len() < n {
            return Err(Error::NotEnoughRouters);
        }

        let mut id_bytes = Vec::with_capacity(n * RouterId::SIZE);
        for rc in &hops {
            id_bytes.extend_from_slice(rc.router_id.as_slice());
        }
        let digest = self.crypto.short_hash(&id_bytes);
        let hopset_hash = u64::from_be_bytes(digest[..8].try_into().expect("sized slice"));
        let terminus = hops[n - 1].router_id;
        let guard = (terminus, hopset_hash);
        if self.in_flight.contains(&guard) {
            return Err(Error::Congested);
        }

        let path_ids: Vec<PathId> = (0..n)
            .map(|_| {
                let mut id = [0u8; PathId::SIZE];
                self.crypto.rand_bytes(&mut id);
                PathId::new(id)
            })
            .collect();

        let mut capsules = Vec::with_capacity(n);
        let mut path_hops = Vec::with_capacity(n);
        for (i, rc) in hops.iter().enumerate() {
            let record = CommitRecord {
                path_id: path_ids[i],
                next_router: if i + 1 < n {
                    hops[i + 1].router_id
                } else {
                    RouterId::zero()
                },
                next_path_id: if i + 1 < n {
                    path_ids[i + 1]
                } else {
                    PathId::zero()
                },
                lifetime_ms: config.path_lifetime_ms,
                chain_index: i as u8,
            };
            let (capsule, key) = capsule::seal(&self.crypto, rc, &record)?;
            capsules.push(capsule);
            path_hops.push(PathHop {
                rc: rc.clone(),
                path_id: path_ids[i],
                key,
            });
        }

        let path = OwnedPath::new(path_hops, hopset_hash, now_ms);
        let outer = path.outer_path_id();
        let first_hop = path.first_hop_router();
        let deadline = now_ms + config.path_alignment_timeout_ms.max(1);

        self.in_flight.insert(guard);
        self.pending.insert(
            outer,
            PendingBuild {
                path,
                deadline_ms: deadline,
                guard,
            },
        );
        log::info!("path: building {outer} via {first_hop} ({n} hops)");
        Ok((outer, first_hop, RelayCommit { capsules }))
    }

    /// Resolve a signed build status against the pending builds.
    pub fn on_status(
        &mut self,
        status: &RelayStatus,
        lifetime_ms: u64,
        now_ms: u64,
    ) -> StatusOutcome {
        let Some(pending) = self.pending.get(&status.path_id) else {
            return StatusOutcome::Unmatched;
        };
        if !status.verify(&self.crypto) || !pending.path.contains_router(&status.router) {
            log::warn!("path: unverifiable status for {}", status.path_id);
            return StatusOutcome::Unmatched;
        }

        let pending = self.pending.remove(&status.path_id).expect("present");
        self.in_flight.remove(&pending.guard);
        let mut path = pending.path;

        if status.is_ok() && status.router == path.terminus_router() {
            path.mark_established(now_ms, lifetime_ms);
            log::info!(
                "path: {} established, terminus {}",
                status.path_id,
                path.terminus_router()
            );
            StatusOutcome::Established(path)
        } else {
            let code = if status.is_ok() {
                // an OK from a non-terminal hop is itself suspicious
                status_code::REJECTED
            } else {
                status.code
            };
            self.strike(status.router, now_ms);
            log::info!(
                "path: {} rejected by {} (code {code})",
                status.path_id,
                status.router
            );
            StatusOutcome::Rejected {
                hop: status.router,
                code,
            }
        }
    }

    /// Expire overdue builds; every hop of a timed-out selection picks up a
    /// strike, since the culprit is unknown.
    pub fn tick(&mut self, now_ms: u64) -> Vec<BuildFailure> {
        let overdue: Vec<PathId> = self
            .pending
            .iter()
            .filter(|(_, p)| now_ms >= p.deadline_ms)
            .map(|(id, _)| *id)
            .collect();

        let mut failures = Vec::new();
        for outer in overdue {
            let pending = self.pending.remove(&outer).expect("present");
            self.in_flight.remove(&pending.guard);
            let hops: Vec<RouterId> = pending
                .path
                .hops
                .iter()
                .map(|h| h.rc.router_id)
                .collect();
            for hop in hops {
                self.strike(hop, now_ms);
            }
            log::warn!("path: build {outer} timed out");
            failures.push(BuildFailure {
                outer,
                error: Error::PathBuildTimeout,
            });
        }

        self.cooldowns
            .retain(|_, b| now_ms < b.until_ms + BACKOFF_CAP_MS);
        failures
    }
}
