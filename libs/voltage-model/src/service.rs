//! Twin graph service
//!
//! The binder never sees the whole estate, only the neighbourhood of the
//! twins it binds. A service produces that neighbourhood on request.

use crate::error::{ModelError, Result};
use crate::graph::TwinGraph;
use async_trait::async_trait;
use std::sync::Arc;

/// Hop radius around the seeds returned by the in-memory service
pub const DEFAULT_GRAPH_HOPS: usize = 4;

#[async_trait]
pub trait TwinGraphService: Send + Sync {
    /// Graph of the twins reachable from `twin_ids`
    async fn graph_around(&self, twin_ids: &[String]) -> Result<TwinGraph>;
}

/// Serves neighbourhoods out of a complete graph held in memory
#[derive(Debug, Clone)]
pub struct MemoryTwinGraphService {
    graph: Arc<TwinGraph>,
    hops: usize,
}

impl MemoryTwinGraphService {
    pub fn new(graph: TwinGraph) -> Self {
        Self {
            graph: Arc::new(graph),
            hops: DEFAULT_GRAPH_HOPS,
        }
    }

    pub fn with_hops(mut self, hops: usize) -> Self {
        self.hops = hops;
        self
    }

    pub fn graph(&self) -> &TwinGraph {
        &self.graph
    }
}

#[async_trait]
impl TwinGraphService for MemoryTwinGraphService {
    async fn graph_around(&self, twin_ids: &[String]) -> Result<TwinGraph> {
        // An empty seed list means everything
        if twin_ids.is_empty() {
            return Ok(self.graph.as_ref().clone());
        }
        if let Some(missing) = twin_ids.iter().find(|id| !self.graph.contains(id)) {
            return Err(ModelError::unknown_twin(missing.as_str()));
        }
        let seeds: Vec<&str> = twin_ids.iter().map(String::as_str).collect();
        Ok(self.graph.neighborhood(&seeds, self.hops))
    }
}
