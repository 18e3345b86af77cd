//! Per-hop transit state a relay keeps for every path routed through it.

use std::collections::HashMap;

use umbra_core::{PathId, RouterId};
use umbra_crypto::SharedKey;

/// One relay's state for one path: the two adjacent peers, the path ids on
/// both sides, and the symmetric key agreed during the build. Entries die
/// at a hard deadline regardless of traffic.
#[derive(Clone)]
pub struct TransitHop {
    pub ingress: PathId,
    /// Zero-filled at the terminus.
    pub egress: PathId,
    pub upstream: RouterId,
    pub downstream: Option<RouterId>,
    pub key: SharedKey,
    pub expires_at: u64,
}

impl TransitHop {
    pub fn is_terminus(&self) -> bool {
        self.downstream.is_none()
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

type HopKey = (RouterId, PathId);

/// Both keyings over the same entries: `(upstream, ingress)` for traffic
/// heading downstream, `(downstream, egress)` for the reverse. Each pair is
/// unique in its table or the install is refused.
#[derive(Default)]
pub struct TransitTable {
    inbound: HashMap<HopKey, TransitHop>,
    outbound: HashMap<HopKey, HopKey>,
    /// Terminus entries by ingress id, for introduction-point injection.
    terminus: HashMap<PathId, HopKey>,
}

impl TransitTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inbound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inbound.is_empty()
    }

    /// Install a hop, enforcing uniqueness of both `(router, path_id)`
    /// keyings. Returns false and leaves the table untouched on collision.
    pub fn install(&mut self, hop: TransitHop) -> bool {
        let in_key = (hop.upstream, hop.ingress);
        if self.inbound.contains_key(&in_key) {
            return false;
        }
        if let Some(downstream) = hop.downstream {
            let out_key = (downstream, hop.egress);
            if self.outbound.contains_key(&out_key) {
                return false;
            }
            self.outbound.insert(out_key, in_key);
        } else {
            if self.terminus.contains_key(&hop.ingress) {
                return false;
            }
            self.terminus.insert(hop.ingress, in_key);
        }
        self.inbound.insert(in_key, hop);
        true
    }

    /// Entry for traffic arriving from `upstream` tagged `ingress`.
    pub fn lookup_inbound(&self, upstream: &RouterId, ingress: &PathId) -> Option<&TransitHop> {
        self.inbound.get(&(*upstream, *ingress))
    }

    /// Entry for traffic arriving from `downstream` tagged with our egress.
    pub fn lookup_outbound(
        &self,
        downstream: &RouterId,
        egress: &PathId,
    ) -> Option<&TransitHop> {
        let in_key = self.outbound.get(&(*downstream, *egress))?;
        self.inbound.get(in_key)
    }

    /// Terminus entry by its advertised ingress id, for injected frames.
    pub fn lookup_terminus(&self, ingress: &PathId) -> Option<&TransitHop> {
        let in_key = self.terminus.get(ingress)?;
        self.inbound.get(in_key)
    }

    pub fn remove(&mut self, upstream: &RouterId, ingress: &PathId) -> Option<TransitHop> {
        let hop = self.inbound.remove(&(*upstream, *ingress))?;
        if let Some(downstream) = hop.downstream {
            self.outbound.remove(&(downstream, hop.egress));
        } else {
            self.terminus.remove(&hop.ingress);
        }
        Some(hop)
    }

    /// Hard-deadline sweep, independent of traffic.
    pub fn sweep(&mut self, now: u64) -> usize {
        let dead: Vec<HopKey> = self
            .inbound
            .iter()
            .filter(|(_, hop)| hop.is_expired(now))
            .map(|(key, _)| *key)
            .collect();
        let count = dead.len();
        for (upstream, ingress) in dead {
            self.remove(&upstream, &ingress);
        }
        count
    }

    /// Drop every entry adjacent to a router whose link died.
    pub fn remove_peer(&mut self, router: &RouterId) -> usize {
        let dead: Vec<HopKey> = self
            .inbound
            .iter()
            .filter(|((upstream, _), hop)| upstream == router || hop.downstream == Some(*router))
            .map(|(key, _)| *key)
            .collect();
        let count = dead.len();
        for (upstream, ingress) in dead {
            self.remove(&upstream, &ingress);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hop(upstream: u8, ingress: u8, downstream: Option<u8>, egress: u8) -> TransitHop {
        TransitHop {
            ingress: PathId::new([ingress; 16]),
            egress: PathId::new([egress; 16]),
            upstream: RouterId::new([upstream; 32]),
            downstream: downstream.map(|b| RouterId::new([b; 32])),
            key: SharedKey::new([9; 32]),
            expires_at: 10_000,
        }
    }

    #[test]
    fn install_and_lookup_both_directions() {
        let mut table = TransitTable::new();
        assert!(table.install(hop(1, 10, Some(2), 20)));

        let down = table
            .lookup_inbound(&RouterId::new([1; 32]), &PathId::new([10; 16]))
            .expect("inbound");
        assert_eq!(down.egress, PathId::new([20; 16]));

        let up = table
            .lookup_outbound(&RouterId::new([2; 32]), &PathId::new([20; 16]))
            .expect("outbound");
        assert_eq!(up.ingress, PathId::new([10; 16]));
    }

    #[test]
    fn duplicate_keyings_are_refused() {
        let mut table = TransitTable::new();
        assert!(table.install(hop(1, 10, Some(2), 20)));
        // same (upstream, ingress)
        assert!(!table.install(hop(1, 10, Some(3), 30)));
        // same (downstream, egress)
        assert!(!table.install(hop(4, 40, Some(2), 20)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn terminus_entries_index_by_ingress() {
        let mut table = TransitTable::new();
        assert!(table.install(hop(1, 10, None, 0)));
        let t = table
            .lookup_terminus(&PathId::new([10; 16]))
            .expect("terminus");
        assert!(t.is_terminus());
        // a second terminus with the same ingress id is refused
        assert!(!table.install(hop(2, 10, None, 0)));
    }

    #[test]
    fn sweep_honors_hard_deadline() {
        let mut table = TransitTable::new();
        table.install(hop(1, 10, Some(2), 20));
        table.install(hop(3, 30, Some(4), 40));
        assert_eq!(table.sweep(9_999), 0);
        assert_eq!(table.sweep(10_000), 2);
        assert!(table.is_empty());
        assert!(table
            .lookup_outbound(&RouterId::new([2; 32]), &PathId::new([20; 16]))
            .is_none());
    }

    #[test]
    fn remove_peer_clears_adjacent_entries() {
        let mut table = TransitTable::new();
        table.install(hop(1, 10, Some(2), 20));
        table.install(hop(2, 30, Some(3), 40));
        table.install(hop(4, 50, Some(5), 60));
        assert_eq!(table.remove_peer(&RouterId::new([2; 32])), 2);
        assert_eq!(table.len(), 1);
    }
}
