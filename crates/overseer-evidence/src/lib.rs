//! # overseer-evidence — Deterministic Evidence Compilation
//!
//! Turns a trace slice plus a strict budget into a bounded, ordered
//! [`EvidenceBundle`]: failures first, then user-visible tool calls, then
//! recency, with explicit tail truncation. Pure ordering and truncation
//! over execution metadata; payload content is never interpreted.
//!
//! ## Module Overview
//!
//! - [`bundle`] — [`EvidenceBundle`], [`EvidenceFragment`], priorities
//! - [`compiler`] — [`EvidenceCompiler`] (store-backed) and the pure
//!   [`assemble`] step

pub mod bundle;
pub mod compiler;

pub use bundle::{EvidenceBundle, EvidenceFragment, FragmentPriority};
pub use compiler::{EvidenceCompiler, EvidenceScope, assemble};
