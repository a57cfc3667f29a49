//! Peer discovery: where the addresses to dial at start come from.
//!
//! The mesh asks its [`PeerDiscovery`] once per start and hands every
//! address to the local peer manager. [`StaticSeeds`] is the only provider
//! shipped here: it returns a fixed list, normally `initial_peers` from the
//! options.

use std::net::SocketAddr;

use async_trait::async_trait;
use tracing::debug;

use crate::error::MeshError;

/// Supplies addresses to dial.
#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    async fn discover(&self) -> Result<Vec<SocketAddr>, MeshError>;
}

/// A fixed seed list.
#[derive(Debug, Clone, Default)]
pub struct StaticSeeds {
    seeds: Vec<SocketAddr>,
}

impl StaticSeeds {
    /// Seeds are kept in order with duplicates dropped.
    pub fn new(seeds: impl IntoIterator<Item = SocketAddr>) -> Self {
        let mut unique: Vec<SocketAddr> = Vec::new();
        for seed in seeds {
            if !unique.contains(&seed) {
                unique.push(seed);
            }
        }
        Self { seeds: unique }
    }

    pub fn seeds(&self) -> &[SocketAddr] {
        &self.seeds
    }
}

#[async_trait]
impl PeerDiscovery for StaticSeeds {
    async fn discover(&self) -> Result<Vec<SocketAddr>, MeshError> {
        debug!("Static discovery: {} seed(s)", self.seeds.len());
        Ok(self.seeds.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_seeds_keep_order_and_drop_duplicates() {
        let a: SocketAddr = "10.0.0.1:9480".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:9480".parse().unwrap();
        let seeds = StaticSeeds::new([b, a, b]);

        assert_eq!(seeds.seeds(), &[b, a]);
        assert_eq!(seeds.discover().await.unwrap(), vec![b, a]);
    }

    #[tokio::test]
    async fn test_empty_seed_list() {
        let seeds = StaticSeeds::default();
        assert!(seeds.discover().await.unwrap().is_empty());
    }
}
