//! Default `Unchoker`: round-robins which connected peers get unchoked each
//! tick rather than a rate-based tit-for-tat policy, which the engine leaves
//! as a Non-goal (see `collab::Unchoker`). A real client would swap this for
//! one that ranks `candidates` by recent download throughput.

use std::{
    net::SocketAddr,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::collab::Unchoker;

#[derive(Debug, Default)]
pub struct RoundRobinUnchoker {
    cursor: AtomicUsize,
}

impl RoundRobinUnchoker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Unchoker for RoundRobinUnchoker {
    fn choose_unchoked(&self, candidates: &[SocketAddr], max_unchoked: usize) -> Vec<SocketAddr> {
        if candidates.is_empty() || max_unchoked == 0 {
            return Vec::new();
        }
        let n = max_unchoked.min(candidates.len());
        let start = self.cursor.fetch_add(n, Ordering::Relaxed) % candidates.len();
        (0..n).map(|i| candidates[(start + i) % candidates.len()]).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(n: usize) -> Vec<SocketAddr> {
        (0..n).map(|i| format!("127.0.0.1:{}", 10000 + i).parse().unwrap()).collect()
    }

    #[test]
    fn test_rotates_selection_across_calls() {
        let u = RoundRobinUnchoker::new();
        let candidates = addrs(5);
        let first = u.choose_unchoked(&candidates, 2);
        let second = u.choose_unchoked(&candidates, 2);
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_ne!(first, second);
    }

    #[test]
    fn test_caps_at_candidate_count() {
        let u = RoundRobinUnchoker::new();
        let candidates = addrs(3);
        assert_eq!(u.choose_unchoked(&candidates, 10).len(), 3);
    }

    #[test]
    fn test_empty_candidates_yields_nothing() {
        let u = RoundRobinUnchoker::new();
        assert!(u.choose_unchoked(&[], 5).is_empty());
    }
}
