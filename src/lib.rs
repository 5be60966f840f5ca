//! # ce-queue
//!
//! Durable, multi-worker task queue for a compute engine.
//!
//! Tasks are submitted, claimed by at most one worker at a time within a
//! bounded retry budget, and archived into an append-only activity history
//! once they succeed, fail or are canceled. State lives in SQLite;
//! observability goes through tracing and OpenTelemetry.

pub mod config;
pub mod error;
pub mod maintenance;
pub mod model;
pub mod ports;
pub mod queue;
pub mod storage;
pub mod telemetry;
