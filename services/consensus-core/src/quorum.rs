//! Quorum arithmetic for a fixed replica set.

use mesh_core::PeerId;

use crate::config::MINIMUM_REPLICA_COUNT;
use crate::error::{ConsensusError, Result};

/// Maximum number of Byzantine replicas tolerated by a cluster of `n`.
pub fn fault_tolerance(n: usize) -> usize {
    if n <= 1 { return 0; }
    (n - 1) / 3
}

/// Membership and derived quorum sizes. Replica order is significant: the
/// primary of view `v` is `replicas[v mod n]`, so every member must be built
/// from the same list.
#[derive(Clone, Debug)]
pub struct ProtocolParameters {
    replicas: Vec<PeerId>,
    f: usize,
}

impl ProtocolParameters {
    pub fn new(replicas: Vec<PeerId>) -> Result<Self> {
        if replicas.len() < MINIMUM_REPLICA_COUNT {
            return Err(ConsensusError::NotEnoughReplicas { have: replicas.len(), need: MINIMUM_REPLICA_COUNT });
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = replicas.iter().find(|p| !seen.insert(**p)) {
            return Err(ConsensusError::DuplicateReplica(*dup));
        }
        let f = fault_tolerance(replicas.len());
        Ok(Self { replicas, f })
    }

    pub fn n(&self) -> usize { self.replicas.len() }
    pub fn f(&self) -> usize { self.f }
    pub fn replicas(&self) -> &[PeerId] { &self.replicas }
    pub fn contains(&self, peer: &PeerId) -> bool { self.replicas.contains(peer) }

    pub fn primary_for(&self, view: u64) -> PeerId {
        self.replicas[(view % self.replicas.len() as u64) as usize]
    }

    /// Prepares needed beyond the primary's implicit vote carried by its PrePrepare.
    pub fn prepare_quorum(&self) -> usize { 2 * self.f }

    pub fn commit_quorum(&self) -> usize { 2 * self.f + 1 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::Keypair;

    fn peers(n: usize) -> Vec<PeerId> {
        (0..n).map(|i| Keypair::from_seed([i as u8 + 1; 32]).peer_id()).collect()
    }

    #[test]
    fn fault_tolerance_matches_formula() {
        assert_eq!(fault_tolerance(0), 0);
        assert_eq!(fault_tolerance(1), 0);
        for n in 2..40usize {
            assert_eq!(fault_tolerance(n), (n - 1) / 3, "n={n}");
        }
        assert_eq!(fault_tolerance(4), 1);
        assert_eq!(fault_tolerance(7), 2);
        assert_eq!(fault_tolerance(10), 3);
    }

    #[test]
    fn quorums_for_four_replicas() {
        let params = ProtocolParameters::new(peers(4)).unwrap();
        assert_eq!(params.f(), 1);
        assert_eq!(params.prepare_quorum(), 2);
        assert_eq!(params.commit_quorum(), 3);
    }

    #[test]
    fn primary_rotates_with_view() {
        let list = peers(5);
        let params = ProtocolParameters::new(list.clone()).unwrap();
        assert_eq!(params.primary_for(0), list[0]);
        assert_eq!(params.primary_for(3), list[3]);
        assert_eq!(params.primary_for(7), list[2]);
    }

    #[test]
    fn rejects_small_clusters() {
        let err = ProtocolParameters::new(peers(3)).unwrap_err();
        assert!(matches!(err, ConsensusError::NotEnoughReplicas { have: 3, need: 4 }));
    }

    #[test]
    fn rejects_duplicate_members() {
        let mut list = peers(4);
        list.push(list[0]);
        assert!(matches!(ProtocolParameters::new(list), Err(ConsensusError::DuplicateReplica(_))));
    }
}
