//! TapeDeck Core — session state, time, and data primitives.
//!
//! This crate contains the in-memory heart of the orchestrator:
//! - Domain types (bars, intervals, stream kinds, symbol sources)
//! - Trading calendar with injected holidays and early closes
//! - TimeAuthority: the single source of virtual or wall-clock "now"
//! - SessionStateStore: bars, indicators, quality, registration, locks
//! - Subscription: the one-shot handshake gate between pipeline threads
//! - Indicator kernels and the name→handle registry
//! - Quality scoring over the aligned timestamp grid
//! - Repository and live-stream trait seams

pub mod calendar;
pub mod clock;
pub mod domain;
pub mod indicators;
pub mod quality;
pub mod repository;
pub mod store;
pub mod subscription;
