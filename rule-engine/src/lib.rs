//! Incremental rule execution engine.
//!
//! Rules read immutable streams of source data through a shared pipeline,
//! track their progress with durable per-rule watermarks, aggregate into
//! embedded stores, and fire windowed notifications once data has aged past
//! a late-arrival grace period.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types that implement
//! `std::error::Error` with a cause chain, use formats that include the full
//! chain so root causes are visible in logs:
//!
//! - **Inline format:** `{e:#}` — full chain on one line (`outer: middle: root cause`).
//! - **Structured field:** `error = ?e` — full chain with `Caused by:` sections (Debug).
//!
//! Avoid `{}` / `%e` (Display) for errors — they only show the top-level
//! message and hide the chain.

pub mod aggregate;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod dupcheck;
pub mod executor;
pub mod fs_source;
pub mod kv;
pub mod metrics_const;
pub mod model;
pub mod notifier;
pub mod planner;
pub mod server;
pub mod service;
pub mod test_utils;
pub mod tracker;

pub use coordinator::{Coordinator, EngineContext};
pub use model::{Detection, RuleDefinition, RuleKind};
pub use service::RuleEngineService;
