//! Pool selection strategies
//!
//! Filtering decides which pools are eligible; a [`SelectionStrategy`]
//! decides which one of them gets the request. The default is a uniform
//! random pick, which spreads identical requests evenly over time. It is
//! not capacity-aware.

use crate::crd::ResourcePool;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Choose one of N eligible pools
pub trait SelectionStrategy: Send + Sync {
    fn select<'a>(&self, pools: &[&'a ResourcePool]) -> Option<&'a ResourcePool>;
}

/// Uniform random choice
pub struct RandomSelection {
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl RandomSelection {
    /// Seeded from OS entropy
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Use a caller-provided generator
    pub fn with_rng(rng: impl RngCore + Send + 'static) -> Self {
        Self {
            rng: Mutex::new(Box::new(rng)),
        }
    }
}

impl Default for RandomSelection {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for RandomSelection {
    fn select<'a>(&self, pools: &[&'a ResourcePool]) -> Option<&'a ResourcePool> {
        match pools.len() {
            0 => None,
            1 => Some(pools[0]),
            n => {
                let index = (self.rng.lock().next_u64() % n as u64) as usize;
                Some(pools[index])
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crd::{ResourceKind, ResourcePoolSpec};

    /// Yields 0, 1, 2, ... so picks cycle through the pools
    pub(crate) struct CountingRng(pub u64);

    impl RngCore for CountingRng {
        fn next_u32(&mut self) -> u32 {
            self.next_u64() as u32
        }

        fn next_u64(&mut self) -> u64 {
            let n = self.0;
            self.0 += 1;
            n
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for chunk in dest.chunks_mut(8) {
                let bytes = self.next_u64().to_le_bytes();
                chunk.copy_from_slice(&bytes[..chunk.len()]);
            }
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    fn pool(name: &str) -> ResourcePool {
        ResourcePool::new(
            name,
            ResourcePoolSpec {
                kind: ResourceKind::Volume,
                provider_id: None,
                taints: vec![],
            },
        )
    }

    #[test]
    fn test_empty_and_single() {
        let strategy = RandomSelection::new();
        assert!(strategy.select(&[]).is_none());
        let only = pool("only");
        assert_eq!(strategy.select(&[&only]).map(|p| p.name()), Some("only"));
    }

    #[test]
    fn test_counting_rng_alternates() {
        let strategy = RandomSelection::with_rng(CountingRng(0));
        let (a, b) = (pool("a"), pool("b"));
        let picks: Vec<&str> = (0..4)
            .filter_map(|_| strategy.select(&[&a, &b]))
            .map(|p| p.name())
            .collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_entropy_spreads_picks() {
        let strategy = RandomSelection::new();
        let (a, b) = (pool("a"), pool("b"));
        let on_a = (0..2000)
            .filter_map(|_| strategy.select(&[&a, &b]))
            .filter(|p| p.name() == "a")
            .count() as i64;
        assert!((on_a - (2000 - on_a)).abs() < 400, "skewed: {} on a", on_a);
    }
}
