//! Run-scoped state threaded through every component call.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Progress counters for one run. Cheap to update from concurrent tasks.
#[derive(Debug, Default)]
pub struct RunCounters {
    pub pages_fetched: AtomicUsize,
    pub records_stored: AtomicUsize,
    pub records_rejected: AtomicUsize,
    pub warehouse_queries: AtomicUsize,
    pub override_lookups: AtomicUsize,
    pub classifier_calls: AtomicUsize,
    pub validation_failures: AtomicUsize,
    pub remote_updates: AtomicUsize,
}

impl RunCounters {
    pub fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            pages_fetched: self.pages_fetched.load(Ordering::Relaxed),
            records_stored: self.records_stored.load(Ordering::Relaxed),
            records_rejected: self.records_rejected.load(Ordering::Relaxed),
            warehouse_queries: self.warehouse_queries.load(Ordering::Relaxed),
            override_lookups: self.override_lookups.load(Ordering::Relaxed),
            classifier_calls: self.classifier_calls.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            remote_updates: self.remote_updates.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub pages_fetched: usize,
    pub records_stored: usize,
    pub records_rejected: usize,
    pub warehouse_queries: usize,
    pub override_lookups: usize,
    pub classifier_calls: usize,
    pub validation_failures: usize,
    pub remote_updates: usize,
}

#[derive(Debug)]
pub struct RunContext {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub counters: RunCounters,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            run_id: generate_run_id(),
            started_at: Utc::now(),
            counters: RunCounters::default(),
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Host-qualified, time-ordered run identifier.
pub fn generate_run_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let uuid = uuid::Uuid::new_v7(uuid::Timestamp::now(uuid::NoContext));
    format!("{}-{}", hostname, uuid)
}
