//! Atomically refreshed twin graph cache
//!
//! Binders read a snapshot with [`GraphCache::load`]; a background refresh
//! swaps in a new graph without blocking them. Every swap bumps the
//! generation so memoized bindings made against the old graph can be
//! recognised as stale.

use crate::error::Result;
use crate::graph::TwinGraph;
use crate::service::TwinGraphService;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct GraphCache {
    graph: ArcSwap<TwinGraph>,
    generation: AtomicU64,
}

impl Default for GraphCache {
    fn default() -> Self {
        Self::new(TwinGraph::new())
    }
}

impl GraphCache {
    pub fn new(graph: TwinGraph) -> Self {
        Self {
            graph: ArcSwap::from_pointee(graph),
            generation: AtomicU64::new(0),
        }
    }

    /// Current snapshot, unaffected by later refreshes
    pub fn load(&self) -> Arc<TwinGraph> {
        self.graph.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Swap in a new graph, returns the new generation
    pub fn replace(&self, graph: TwinGraph) -> u64 {
        self.graph.store(Arc::new(graph));
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Fetch a fresh graph around `seeds` and swap it in
    ///
    /// On failure the current graph stays in place.
    pub async fn refresh(&self, service: &dyn TwinGraphService, seeds: &[String]) -> Result<u64> {
        let graph = service.graph_around(seeds).await?;
        let (twins, relations) = (graph.len(), graph.edge_count());
        let generation = self.replace(graph);
        tracing::info!(twins, relations, generation, "Twin graph refreshed");
        Ok(generation)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::service::MemoryTwinGraphService;
    use crate::twin::Twin;

    fn graph_of(ids: &[&str]) -> TwinGraph {
        let mut graph = TwinGraph::new();
        for id in ids {
            graph.add_twin(Twin::new(*id, "dtmi:com:x:Thing;1"));
        }
        graph
    }

    #[test]
    fn test_snapshot_survives_replace() {
        let cache = GraphCache::new(graph_of(&["a"]));
        let before = cache.load();
        assert_eq!(cache.generation(), 0);

        assert_eq!(cache.replace(graph_of(&["a", "b"])), 1);
        assert_eq!(before.len(), 1);
        assert_eq!(cache.load().len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_from_service() {
        let service = MemoryTwinGraphService::new(graph_of(&["a", "b", "c"]));
        let cache = GraphCache::default();

        let generation = cache.refresh(&service, &[]).await.unwrap();
        assert_eq!(generation, 1);
        assert_eq!(cache.load().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_graph() {
        let service = MemoryTwinGraphService::new(graph_of(&["a"]));
        let cache = GraphCache::new(graph_of(&["x", "y"]));

        assert!(cache.refresh(&service, &["ghost".to_string()]).await.is_err());
        assert_eq!(cache.generation(), 0);
        assert_eq!(cache.load().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_readers_during_refresh() {
        let cache = Arc::new(GraphCache::new(graph_of(&["a"])));
        let mut readers = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            readers.push(tokio::spawn(async move {
                for _ in 0..100 {
                    let snapshot = cache.load();
                    assert!(snapshot.len() == 1 || snapshot.len() == 2);
                    tokio::task::yield_now().await;
                }
            }));
        }
        cache.replace(graph_of(&["a", "b"]));
        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(cache.load().len(), 2);
    }
}
