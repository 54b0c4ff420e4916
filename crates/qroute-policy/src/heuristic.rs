use qroute_core::{ReplicaId, Selection, SelectionSource};

/// Replica with the fewest in-flight jobs; ties go to the lowest index.
/// Empty input yields replica 0.
pub fn least_loaded(loads: &[u64]) -> ReplicaId {
    let index = loads
        .iter()
        .enumerate()
        .min_by_key(|(i, load)| (**load, *i))
        .map_or(0, |(i, _)| i);
    ReplicaId(index)
}

pub fn heuristic_selection(loads: &[u64]) -> Selection {
    Selection {
        replica: least_loaded(loads),
        confidence: 1.0,
        exploration: false,
        source: SelectionSource::Heuristic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_picks_minimum() {
        assert_eq!(least_loaded(&[5, 3, 7]), ReplicaId(1));
        assert_eq!(least_loaded(&[9, 8, 0]), ReplicaId(2));
    }

    #[test]
    fn test_ties_resolve_to_lowest_index() {
        assert_eq!(least_loaded(&[2, 1, 1]), ReplicaId(1));
        assert_eq!(least_loaded(&[0, 0, 0]), ReplicaId(0));
    }

    #[test]
    fn test_empty_loads() {
        assert_eq!(least_loaded(&[]), ReplicaId(0));
    }

    #[test]
    fn test_selection_is_marked_heuristic() {
        let s = heuristic_selection(&[4, 1, 2]);
        assert_eq!(s.replica, ReplicaId(1));
        assert_eq!(s.source, SelectionSource::Heuristic);
        assert!(!s.exploration);
        assert_eq!(s.confidence, 1.0);
    }
}
