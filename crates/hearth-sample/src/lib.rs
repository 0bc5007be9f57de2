//! Sample actors built on the `hearth` framework:
//!
//! - [`export_job`] — a resumable, alarm-driven export pipeline
//! - [`post_counter`] — hot per-post counters with live watchers
//! - [`rate_limiter`] — fixed-window limiting with explicit failure posture
//!
//! The binary in `main.rs` wires all three into a short demo run.

pub mod export_job;
pub mod post_counter;
pub mod rate_limiter;

pub use export_job::ExportJob;
pub use post_counter::PostCounter;
pub use rate_limiter::RateLimiter;
