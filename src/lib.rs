//! Interval-driven polling controllers.
//!
//! The core is framework-free: [`PollingController`] runs an async task on
//! a fixed [`Cadence`] and absorbs task failures, and [`bind`] ties a
//! controller to an owner's lifetime. The remaining modules make up the
//! `pollkit` daemon, which polls shell commands listed in a TOML config.

pub mod app;
pub mod binder;
pub mod clock;
pub mod config;
pub mod controller;
pub mod failure;
pub mod ipc;
pub mod jobs;

pub use binder::{bind, BoundPoller, Lifecycle, Scope, UnmountHook};
pub use clock::Cadence;
pub use controller::{OverlapPolicy, PollStats, PollerBuilder, PollingController};
pub use failure::{log_failure, ErrorHook, PollError, PollOutcome, TaskFailure};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
