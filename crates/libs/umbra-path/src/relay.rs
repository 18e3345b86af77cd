//! Relay-side path handling: installing transit state from a commit,
//! forwarding onion traffic in both directions, and routing build status
//! back toward the builder.

use ed25519_dalek::SigningKey;
use umbra_core::wire::{status_code, PathEnvelope, RelayCommit, RelayStatus};
use umbra_core::{PathId, RouterId};
use umbra_crypto::{CryptoProvider, PqKeypair};
use x25519_dalek::StaticSecret;

use crate::capsule;
use crate::onion;
use crate::transit::{TransitHop, TransitTable};

/// Transit entries never outlive this, whatever lifetime the builder asked
/// for.
pub const MAX_TRANSIT_LIFETIME_MS: u64 = 30 * 60 * 1000;

/// The long-term material a relay needs to take part in path builds.
pub struct RelayKeys<'a> {
    pub crypto: &'a CryptoProvider,
    pub enc_secret: &'a StaticSecret,
    pub pq: &'a PqKeypair,
    pub signing: &'a SigningKey,
}

pub enum CommitAction {
    /// Pass the stripped commit to the next hop.
    Forward { next: RouterId, commit: RelayCommit },
    /// Answer the upstream peer with a status.
    Reply(RelayStatus),
}

/// Process a relay commit arriving from `upstream`: open our capsule,
/// install the transit entry, and either forward or (at the terminus,
/// or on failure) reply with a signed status.
pub fn handle_relay_commit(
    keys: &RelayKeys<'_>,
    table: &mut TransitTable,
    upstream: RouterId,
    commit: &RelayCommit,
    now_ms: u64,
) -> CommitAction {
    let Some(ours) = commit.capsules.first() else {
        return CommitAction::Reply(RelayStatus::signed(
            keys.crypto,
            keys.signing,
            PathId::zero(),
            status_code::MALFORMED,
        ));
    };

    let (record, key) = match capsule::open(keys.crypto, keys.enc_secret, keys.pq, ours) {
        Ok(opened) => opened,
        Err(_) => {
            log::debug!("path: commit capsule from {upstream} did not open");
            return CommitAction::Reply(RelayStatus::signed(
                keys.crypto,
                keys.signing,
                PathId::zero(),
                status_code::MALFORMED,
            ));
        }
    };

    let remaining = commit.capsules[1..].to_vec();
    commit_action(
        keys,
        table,
        upstream,
        record,
        key,
        remaining,
        ours.record.len(),
        now_ms,
    )
}

/// Act on an already-opened commit record - the entry point when the
/// capsule was opened off-thread by the crypto pool.
#[allow(clippy::too_many_arguments)]
pub fn commit_action(
    keys: &RelayKeys<'_>,
    table: &mut TransitTable,
    upstream: RouterId,
    record: umbra_core::wire::CommitRecord,
    key: umbra_crypto::SharedKey,
    remaining: Vec<umbra_core::wire::CommitCapsule>,
    record_len: usize,
    now_ms: u64,
) -> CommitAction {
    let terminus = record.next_router.is_zero();
    let hop = TransitHop {
        ingress: record.path_id,
        egress: record.next_path_id,
        upstream,
        downstream: (!terminus).then_some(record.next_router),
        key,
        expires_at: now_ms + record.lifetime_ms.min(MAX_TRANSIT_LIFETIME_MS),
    };
    if !table.install(hop) {
        log::info!(
            "path: refusing duplicate path id {} from {upstream}",
            record.path_id
        );
        return CommitAction::Reply(RelayStatus::signed(
            keys.crypto,
            keys.signing,
            record.path_id,
            status_code::DUPLICATE_PATH_ID,
        ));
    }

    if terminus {
        log::debug!("path: terminus installed for {}", record.path_id);
        return CommitAction::Reply(RelayStatus::signed(
            keys.crypto,
            keys.signing,
            record.path_id,
            status_code::OK,
        ));
    }

    // strip our capsule and keep the commit's length constant
    let mut capsules = remaining;
    capsules.push(capsule::decoy(keys.crypto, record_len));
    CommitAction::Forward {
        next: record.next_router,
        commit: RelayCommit { capsules },
    }
}

/// Route a status arriving from `from` one hop closer to the builder,
/// rewriting the path id to our ingress so the next hop can match it.
/// A failed status also tears down our own state for the doomed path.
pub fn handle_relay_status(
    table: &mut TransitTable,
    from: RouterId,
    status: &RelayStatus,
) -> Option<(RouterId, RelayStatus)> {
    let hop = table.lookup_outbound(&from, &status.path_id)?;
    let (upstream, ingress) = (hop.upstream, hop.ingress);
    let mut forwarded = status.clone();
    forwarded.path_id = ingress;
    if !status.is_ok() {
        table.remove(&upstream, &ingress);
    }
    Some((upstream, forwarded))
}

pub enum PathTraffic {
    /// Peel succeeded; hand the inner envelope to the next hop.
    ForwardDown { next: RouterId, env: PathEnvelope },
    /// Upstream direction; hand the re-wrapped envelope to our upstream.
    ForwardUp { next: RouterId, env: PathEnvelope },
    /// We are the terminus; `payload` is the innermost plaintext.
    Terminal { ingress: PathId, payload: Vec<u8> },
    /// No matching transit entry, or the layers are inconsistent.
    Drop,
}

/// Process one onion envelope arriving over the link from `from`.
pub fn handle_path_envelope(
    crypto: &CryptoProvider,
    table: &TransitTable,
    from: RouterId,
    env: &PathEnvelope,
) -> PathTraffic {
    if let Some(hop) = table.lookup_inbound(&from, &env.path_id) {
        let plain = onion::peel_layer(crypto, &hop.key, env);
        return match hop.downstream {
            None => PathTraffic::Terminal {
                ingress: hop.ingress,
                payload: plain,
            },
            Some(next) => match onion::next_envelope(&plain) {
                Ok(inner) if inner.path_id == hop.egress => {
                    PathTraffic::ForwardDown { next, env: inner }
                }
                _ => {
                    log::debug!("path: inner layer mismatch on {}", env.path_id);
                    PathTraffic::Drop
                }
            },
        };
    }

    if let Some(hop) = table.lookup_outbound(&from, &env.path_id) {
        let inner = match onion::encode_envelope(env) {
            Ok(inner) => inner,
            Err(_) => return PathTraffic::Drop,
        };
        let wrapped = onion::add_layer(crypto, &hop.key, hop.ingress, &inner);
        return PathTraffic::ForwardUp {
            next: hop.upstream,
            env: wrapped,
        };
    }

    PathTraffic::Drop
}

/// Originate upstream traffic at a terminus we host - used both for
/// introduction-point injection and for answering probes.
pub fn inject_upstream(
    crypto: &CryptoProvider,
    table: &TransitTable,
    ingress: &PathId,
    payload: &[u8],
) -> Option<(RouterId, PathEnvelope)> {
    let hop = table.lookup_terminus(ingress)?;
    let env = onion::add_layer(crypto, &hop.key, hop.ingress, payload);
    Some((hop.upstream, env))
}
