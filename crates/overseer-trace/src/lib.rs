//! # overseer-trace — Durable Trace Store & Streaming
//!
//! Append-only, per-run trace logs with store-assigned monotonic sequences,
//! dedupe-key idempotency, a durable run registry, and an ordered resumable
//! stream projection over the journal.
//!
//! ## Module Overview
//!
//! - [`store`] — [`FileTraceStore`], one JSONL log per run
//! - [`registry`] — [`RunRegistry`], durable run rows and status transitions
//! - [`journal`] — [`TraceJournal`] + [`StreamHub`], append-then-publish and
//!   gap-free subscriptions

pub mod journal;
pub mod registry;
pub mod store;

pub use journal::{StreamHub, TraceJournal};
pub use registry::RunRegistry;
pub use store::FileTraceStore;
