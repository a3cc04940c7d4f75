//! Ingestion counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::ErrorClass;

/// Lock-free counters updated by the pipeline.
#[derive(Debug, Default)]
pub struct IngestStats {
    applied: AtomicU64,
    duplicates: AtomicU64,
    buffered: AtomicU64,
    passed_through: AtomicU64,
    rejected: AtomicU64,
    retryable: AtomicU64,
    fatal: AtomicU64,
    out_of_order: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub applied: u64,
    pub duplicates: u64,
    pub buffered: u64,
    pub passed_through: u64,
    pub rejected: u64,
    pub retryable: u64,
    pub fatal: u64,
    pub out_of_order: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl IngestStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_applied(&self, out_of_order: bool) {
        bump(&self.applied);
        if out_of_order {
            bump(&self.out_of_order);
        }
    }

    pub fn record_duplicate(&self) {
        bump(&self.duplicates);
    }

    pub fn record_buffered(&self) {
        bump(&self.buffered);
    }

    pub fn record_passed_through(&self) {
        bump(&self.passed_through);
    }

    pub fn record_error(&self, class: ErrorClass) {
        match class {
            ErrorClass::Rejected => bump(&self.rejected),
            ErrorClass::Retryable => bump(&self.retryable),
            ErrorClass::Fatal => bump(&self.fatal),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            passed_through: self.passed_through.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            retryable: self.retryable.load(Ordering::Relaxed),
            fatal: self.fatal.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
        }
    }
}
