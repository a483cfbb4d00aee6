//! # overseer-runtime — Cycle Control & Worker Convergence
//!
//! The two control planes of the core: the mount/reason/prune cycle that
//! keeps raw evidence out of persistent state, and the join coordinator
//! that converges N parallel workers on exactly one supervisor resumption.
//!
//! ## Module Overview
//!
//! - [`conversation`] — [`ConversationStore`], the append-only persistent
//!   context mutated only by pruning
//! - [`cycle`] — [`CycleController`], one mount/reason/prune pass
//! - [`group`] — [`WorkerGroup`] rows and the durable [`GroupLedger`]
//! - [`join`] — [`JoinCoordinator`], fan-out, at-most-once continuation,
//!   deadline sweep, cancellation, crash recovery

pub mod conversation;
pub mod cycle;
pub mod group;
pub mod join;

pub use conversation::ConversationStore;
pub use cycle::{CycleController, EVIDENCE_UNAVAILABLE};
pub use group::{GroupLedger, WorkerGroup, WorkerOutcome, WorkerSlot};
pub use join::{Continuation, JoinCoordinator, WorkerReport};
