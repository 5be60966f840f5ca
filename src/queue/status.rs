//! In-process monitoring counters, mirrored to OpenTelemetry instruments.

use std::sync::atomic::{AtomicU64, Ordering};

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram};
use serde::Serialize;

use crate::model::{ActivityRecord, ActivityStatus};
use crate::telemetry::metrics;

/// Point-in-time view of queue activity.
///
/// `received`, `success`, `error` and `processing_time_ms` count events since
/// the queue was constructed. `pending` and `in_progress` are read from the
/// store when the snapshot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QueueStatusSnapshot {
    pub received: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub success: u64,
    pub error: u64,
    pub processing_time_ms: u64,
}

pub(crate) struct QueueMonitor {
    received: AtomicU64,
    success: AtomicU64,
    error: AtomicU64,
    processing_time_ms: AtomicU64,

    submitted_counter: Counter<u64>,
    claimed_counter: Counter<u64>,
    finished_counter: Counter<u64>,
    execution_time: Histogram<f64>,
}

impl QueueMonitor {
    pub(crate) fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            success: AtomicU64::new(0),
            error: AtomicU64::new(0),
            processing_time_ms: AtomicU64::new(0),
            submitted_counter: metrics::tasks_submitted(),
            claimed_counter: metrics::tasks_claimed(),
            finished_counter: metrics::tasks_finished(),
            execution_time: metrics::execution_time_ms(),
        }
    }

    pub(crate) fn on_submitted(&self, task_type: &str) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.submitted_counter
            .add(1, &[KeyValue::new("task_type", task_type.to_string())]);
    }

    pub(crate) fn on_claimed(&self, task_type: &str) {
        self.claimed_counter
            .add(1, &[KeyValue::new("task_type", task_type.to_string())]);
    }

    /// Account for a task leaving the queue. Cancellations are neither
    /// successes nor errors.
    pub(crate) fn on_finished(&self, record: &ActivityRecord) {
        self.finished_counter.add(
            1,
            &[
                KeyValue::new("task_type", record.task_type.clone()),
                KeyValue::new("status", record.status.as_str()),
            ],
        );

        let counter = match record.status {
            ActivityStatus::Success => &self.success,
            ActivityStatus::Failed => &self.error,
            ActivityStatus::Canceled => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if let Some(ms) = record.execution_time_ms {
            let ms = ms.max(0) as u64;
            self.processing_time_ms.fetch_add(ms, Ordering::Relaxed);
            self.execution_time.record(
                ms as f64,
                &[KeyValue::new("status", record.status.as_str())],
            );
        }
    }

    pub(crate) fn snapshot(&self, pending: u64, in_progress: u64) -> QueueStatusSnapshot {
        QueueStatusSnapshot {
            received: self.received.load(Ordering::Relaxed),
            pending,
            in_progress,
            success: self.success.load(Ordering::Relaxed),
            error: self.error.load(Ordering::Relaxed),
            processing_time_ms: self.processing_time_ms.load(Ordering::Relaxed),
        }
    }
}
