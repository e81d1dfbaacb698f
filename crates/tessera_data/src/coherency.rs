//! MSI state transitions over the per-node replicas of one handle.
//!
//! These functions only rewrite replica states; locking, allocation and
//! transfers are the manager's business.

use crate::replica::{AccessStats, CacheState, Replica};
use tessera_core::MemoryNode;
use tessera_perf::BusModel;

/// Number of replicas in OWNER state
#[must_use]
pub fn owner_count(replicas: &[Replica]) -> usize {
    replicas
        .iter()
        .filter(|r| r.state == CacheState::Owner)
        .count()
}

/// Whether any replica holds valid contents
#[must_use]
pub fn has_valid_copy(replicas: &[Replica]) -> bool {
    replicas.iter().any(|r| r.state.is_valid() && r.allocated)
}

/// Pick the replica a transfer to `dst` should read from
///
/// Chooses the valid allocated copy with the cheapest predicted transfer,
/// lowest node index on ties. `dst` itself is never a source.
#[must_use]
pub fn select_source(
    replicas: &[Replica],
    dst: MemoryNode,
    size: usize,
    bus: &BusModel,
) -> Option<MemoryNode> {
    let mut best: Option<(MemoryNode, f64)> = None;
    for replica in replicas {
        if replica.node == dst || !replica.state.is_valid() || !replica.allocated {
            continue;
        }
        let cost = bus.transfer_time(replica.node, dst, size);
        if best.is_none_or(|(_, c)| cost < c) {
            best = Some((replica.node, cost));
        }
    }
    best.map(|(node, _)| node)
}

/// Predicted cost of making `dst` valid, zero if it already is
#[must_use]
pub fn transfer_cost(replicas: &[Replica], dst: MemoryNode, size: usize, bus: &BusModel) -> f64 {
    match replicas.get(dst.index()) {
        Some(r) if r.state.is_valid() || r.is_requested() => 0.0,
        _ => select_source(replicas, dst, size, bus)
            .map_or(0.0, |src| bus.transfer_time(src, dst, size)),
    }
}

/// Make `dst` the only valid copy
pub fn grant_write(replicas: &mut [Replica], stats: &mut [AccessStats], dst: MemoryNode) {
    for replica in replicas.iter_mut() {
        if replica.node != dst && replica.state.is_valid() {
            replica.state = CacheState::Invalid;
            if let Some(s) = stats.get_mut(replica.node.index()) {
                s.invalidated += 1;
            }
        }
    }
    if let Some(replica) = replicas.get_mut(dst.index()) {
        replica.state = CacheState::Owner;
        replica.initialized = true;
    }
}

/// Give `dst` a shared copy, demoting any owner
pub fn grant_read(replicas: &mut [Replica], dst: MemoryNode) {
    for replica in replicas.iter_mut() {
        if replica.state == CacheState::Owner {
            replica.state = CacheState::Shared;
        }
    }
    if let Some(replica) = replicas.get_mut(dst.index()) {
        replica.state = CacheState::Shared;
        replica.initialized = true;
    }
}

/// Invalidate every replica
pub fn invalidate_all(replicas: &mut [Replica], stats: &mut [AccessStats]) {
    for replica in replicas.iter_mut() {
        if replica.state.is_valid() {
            replica.state = CacheState::Invalid;
            if let Some(s) = stats.get_mut(replica.node.index()) {
                s.invalidated += 1;
            }
        }
    }
}

/// Recompute a parent's states from the states of its children
///
/// A node is valid iff every child is valid there; it is OWNER when it is
/// the only such node.
pub fn gather(parent: &mut [Replica], children: &[Vec<CacheState>]) {
    let valid: Vec<bool> = (0..parent.len())
        .map(|n| {
            children
                .iter()
                .all(|c| c.get(n).is_some_and(|s| s.is_valid()))
        })
        .collect();
    let nvalid = valid.iter().filter(|v| **v).count();
    for (replica, valid) in parent.iter_mut().zip(valid) {
        replica.state = match (valid, nvalid) {
            (false, _) => CacheState::Invalid,
            (true, 1) => CacheState::Owner,
            (true, _) => CacheState::Shared,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NodeBuffer;
    use tessera_perf::LinkModel;

    fn node(i: usize) -> MemoryNode {
        MemoryNode::from_index(i)
    }

    fn replicas(states: &[CacheState]) -> Vec<Replica> {
        states
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let mut r = Replica::new(node(i), states.len());
                r.attach(NodeBuffer::zeroed(node(i), 8), false);
                r.state = *s;
                r
            })
            .collect()
    }

    use CacheState::{Invalid, Owner, Shared};

    #[test]
    fn test_read_demotes_owner() {
        let mut reps = replicas(&[Owner, Invalid]);
        grant_read(&mut reps, node(1));
        assert_eq!(reps[0].state, Shared);
        assert_eq!(reps[1].state, Shared);
    }

    #[test]
    fn test_write_invalidates_others() {
        let mut reps = replicas(&[Shared, Shared, Invalid]);
        let mut stats = vec![AccessStats::default(); 3];
        grant_write(&mut reps, &mut stats, node(1));
        assert_eq!(reps[0].state, Invalid);
        assert_eq!(reps[1].state, Owner);
        assert_eq!(stats[0].invalidated, 1);
        assert_eq!(stats[2].invalidated, 0);
        assert_eq!(owner_count(&reps), 1);
    }

    #[test]
    fn test_select_cheapest_source() {
        let reps = replicas(&[Shared, Shared, Invalid]);
        let mut bus = BusModel::pcie(3);
        bus.set_link(node(1), node(2), LinkModel::new(1.0, 1e6));
        assert_eq!(select_source(&reps, node(2), 1024, &bus), Some(node(1)));

        let bus = BusModel::pcie(3);
        assert_eq!(select_source(&reps, node(2), 1024, &bus), Some(node(0)));
    }

    #[test]
    fn test_select_none_when_nothing_valid() {
        let reps = replicas(&[Invalid, Invalid]);
        assert_eq!(select_source(&reps, node(1), 8, &BusModel::pcie(2)), None);
        assert!(!has_valid_copy(&reps));
    }

    #[test]
    fn test_transfer_cost() {
        let reps = replicas(&[Owner, Invalid]);
        let bus = BusModel::uniform(2, LinkModel::new(5.0, 1.0));
        assert_eq!(transfer_cost(&reps, node(0), 10, &bus), 0.0);
        assert_eq!(transfer_cost(&reps, node(1), 10, &bus), 15.0);
    }

    #[test]
    fn test_gather_from_children() {
        let mut parent = replicas(&[Invalid, Invalid, Invalid]);
        gather(
            &mut parent,
            &[vec![Shared, Owner, Invalid], vec![Shared, Shared, Shared]],
        );
        assert_eq!(parent[0].state, Shared);
        assert_eq!(parent[1].state, Shared);
        assert_eq!(parent[2].state, Invalid);

        gather(&mut parent, &[vec![Invalid, Owner, Invalid]]);
        assert_eq!(parent[1].state, Owner);
    }
}
