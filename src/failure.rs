//! Failure types and the error policy for poll tasks.
//!
//! A failed invocation is only ever terminal for that invocation. The
//! controller hands every failure to an [`ErrorHook`] and keeps ticking.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Errors returned to callers of the polling API.
///
/// Task failures never show up here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("polling interval must be greater than zero")]
    ZeroInterval,
    #[error("pollers must be started from within a Tokio runtime")]
    NoRuntime,
    #[error("the owner of this poller has been unmounted")]
    Unmounted,
}

/// One failed invocation of a poll task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskFailure {
    /// The task resolved to an error.
    #[error("task failed: {message}")]
    Failed { message: String },
    /// The task panicked, either while creating its future or while running it.
    #[error("task panicked: {message}")]
    Panicked { message: String },
}

impl TaskFailure {
    pub fn failed(err: impl fmt::Display) -> Self {
        TaskFailure::Failed {
            message: err.to_string(),
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        TaskFailure::Panicked { message }
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, TaskFailure::Panicked { .. })
    }
}

/// What a poll task's future may resolve to.
///
/// Tasks have no required return value: `()` always counts as success,
/// and any `Result` counts its `Err` as a failed invocation.
pub trait PollOutcome {
    fn into_outcome(self) -> Result<(), TaskFailure>;
}

impl PollOutcome for () {
    fn into_outcome(self) -> Result<(), TaskFailure> {
        Ok(())
    }
}

impl<T, E: fmt::Display> PollOutcome for Result<T, E> {
    fn into_outcome(self) -> Result<(), TaskFailure> {
        self.map(|_| ()).map_err(TaskFailure::failed)
    }
}

/// Callback that observes failed invocations.
///
/// Receives the poller name and the failure. It cannot stop the cadence.
pub type ErrorHook = Arc<dyn Fn(&str, &TaskFailure) + Send + Sync>;

/// The default hook: log the failure and carry on.
pub fn log_failure() -> ErrorHook {
    Arc::new(|name: &str, failure: &TaskFailure| {
        log::warn!("Poller '{}': {}", name, failure);
    })
}

/// Run the hook, containing any panic it raises.
pub(crate) fn report(hook: &ErrorHook, name: &str, failure: &TaskFailure) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(name, failure)));
    if result.is_err() {
        log::error!("Poller '{}': error hook panicked while reporting: {}", name, failure);
    }
}
