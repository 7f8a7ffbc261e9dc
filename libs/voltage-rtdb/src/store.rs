//! In-memory time-series store
//!
//! One [`TimeSeries`] per signal id, each behind its own lock so ingestion
//! for one signal never blocks readers of another.

use crate::buffer::TimedValue;
use crate::series::{SignalStatus, TimeSeries};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

pub type SharedSeries = Arc<RwLock<TimeSeries>>;

#[derive(Debug)]
pub struct MemoryTimeSeriesStore {
    series: DashMap<String, SharedSeries>,
    apply_compression: bool,
}

impl Default for MemoryTimeSeriesStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTimeSeriesStore {
    pub fn new() -> Self {
        Self {
            series: DashMap::new(),
            apply_compression: true,
        }
    }

    /// Keep every point, used by replay when exact history matters
    pub fn without_compression() -> Self {
        Self {
            series: DashMap::new(),
            apply_compression: false,
        }
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Register a signal with its metadata, replacing any previous entry
    pub fn insert(&self, series: TimeSeries) -> SharedSeries {
        let shared = Arc::new(RwLock::new(series));
        let id = shared.read().id.clone();
        self.series.insert(id, Arc::clone(&shared));
        shared
    }

    pub fn get(&self, id: &str) -> Option<SharedSeries> {
        self.series.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn get_or_create(&self, id: &str) -> SharedSeries {
        if let Some(existing) = self.series.get(id) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.series
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(TimeSeries::new(id))))
                .value(),
        )
    }

    /// Append a point to a signal, creating it on first sight
    pub fn ingest(&self, id: &str, point: TimedValue) -> bool {
        let series = self.get_or_create(id);
        let accepted = series.write().add_point(point, self.apply_compression);
        if !accepted {
            tracing::trace!(signal_id = %id, "Point ignored");
        }
        accepted
    }

    pub fn ids(&self) -> Vec<String> {
        self.series.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Refresh the health flags of every signal, returns the unhealthy ones
    pub fn refresh_status(&self, now: DateTime<Utc>) -> Vec<(String, SignalStatus)> {
        self.series
            .iter()
            .filter_map(|entry| {
                let status = entry.value().write().set_status(now);
                (!status.is_healthy()).then(|| (entry.key().clone(), status))
            })
            .collect()
    }
}
