//! Interval-driven polling controller.
//!
//! A [`PollingController`] invokes a caller-supplied async task once per
//! cadence until it is stopped. Failed invocations (errors and panics) are
//! handed to the error hook and never end the cadence.
//!
//! Each invocation runs as its own Tokio task. Stopping the controller
//! cancels the timer loop only; an invocation that is already in flight
//! is allowed to finish.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Deserialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::clock::{ticker, Cadence};
use crate::failure::{log_failure, report, ErrorHook, PollError, PollOutcome, TaskFailure};

type BoxTask = Box<dyn FnMut() -> BoxFuture<'static, Result<(), TaskFailure>> + Send>;
type SharedTask = Arc<Mutex<BoxTask>>;

/// What to do when a tick arrives while an earlier invocation is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum OverlapPolicy {
    /// Skip the tick. Avoids request pile-up against slow endpoints.
    #[default]
    #[serde(rename = "skip")]
    SkipIfBusy,
    /// Start another invocation regardless.
    #[serde(rename = "allow")]
    Allow,
}

/// Counters for one controller. They survive start/stop cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollStats {
    /// Invocations started, including ones that failed.
    pub invocations: u64,
    pub failures: u64,
    /// Ticks dropped because an invocation was still in flight.
    pub skipped: u64,
    pub in_flight: usize,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

type SharedStats = Arc<Mutex<PollStats>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking task body poisons nothing we can't keep using.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Builder for a [`PollingController`].
pub struct PollerBuilder {
    name: String,
    cadence: Cadence,
    overlap: OverlapPolicy,
    on_error: ErrorHook,
}

impl PollerBuilder {
    /// Cadence used by [`PollingController::start_default`].
    pub fn cadence(mut self, cadence: Cadence) -> Self {
        self.cadence = cadence;
        self
    }

    pub fn overlap(mut self, overlap: OverlapPolicy) -> Self {
        self.overlap = overlap;
        self
    }

    /// Replace the default logging error hook.
    pub fn on_error(mut self, hook: ErrorHook) -> Self {
        self.on_error = hook;
        self
    }

    pub fn build(self) -> PollingController {
        PollingController {
            name: Arc::from(self.name),
            cadence: self.cadence,
            overlap: self.overlap,
            on_error: self.on_error,
            task: None,
            running: None,
            stats: SharedStats::default(),
        }
    }
}

struct Running {
    handle: JoinHandle<()>,
    refresh: Arc<Notify>,
    run: Arc<RunState>,
}

/// State private to one start..stop run of the timer loop.
///
/// Overlap is judged against this run's own invocations, so a restart is
/// never held back by work left over from the previous task.
#[derive(Default)]
struct RunState {
    /// Set by `stop`. Held across each tick so no invocation starts after it.
    stopped: Mutex<bool>,
    busy: AtomicUsize,
}

/// Runs a task on a fixed cadence until stopped.
///
/// Two states: stopped (initial) and running. `start` while running
/// restarts with the new task, so there is never more than one timer.
pub struct PollingController {
    name: Arc<str>,
    cadence: Cadence,
    overlap: OverlapPolicy,
    on_error: ErrorHook,
    task: Option<SharedTask>,
    /// Holds the timer loop. `Some` exactly while running.
    running: Option<Running>,
    stats: SharedStats,
}

impl PollingController {
    /// A controller with the default cadence, skip-if-busy overlap and logging error hook.
    pub fn new(name: impl Into<String>) -> Self {
        Self::builder(name).build()
    }

    pub fn builder(name: impl Into<String>) -> PollerBuilder {
        PollerBuilder {
            name: name.into(),
            cadence: Cadence::DEFAULT,
            overlap: OverlapPolicy::default(),
            on_error: log_failure(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    pub fn overlap(&self) -> OverlapPolicy {
        self.overlap
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn stats(&self) -> PollStats {
        lock(&self.stats).clone()
    }

    /// Start invoking `task` every `cadence`, replacing any running loop.
    ///
    /// The first invocation happens one cadence from now. Must be called
    /// from within a Tokio runtime.
    pub fn start<F, Fut>(&mut self, task: F, cadence: Cadence) -> Result<(), PollError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: PollOutcome,
    {
        tokio::runtime::Handle::try_current().map_err(|_| PollError::NoRuntime)?;
        self.stop();

        let mut task = task;
        let boxed: BoxTask = Box::new(move || {
            let invocation = task();
            async move { invocation.await.into_outcome() }.boxed()
        });
        self.task = Some(Arc::new(Mutex::new(boxed)));
        self.cadence = cadence;
        self.spawn_loop()
    }

    /// Same as [`start`](Self::start) with the controller's configured cadence.
    pub fn start_default<F, Fut>(&mut self, task: F) -> Result<(), PollError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: PollOutcome,
    {
        self.start(task, self.cadence)
    }

    /// Cancel the timer. No-op when already stopped.
    ///
    /// No invocation starts after this returns, even on a multi-thread
    /// runtime where the loop may be mid-tick.
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            *lock(&running.run.stopped) = true;
            running.handle.abort();
            log::debug!("Poller '{}' stopped", self.name);
        }
    }

    /// Change the cadence. A running loop restarts with the same task, so
    /// the next invocation is one new cadence away.
    pub fn set_cadence(&mut self, cadence: Cadence) -> Result<(), PollError> {
        self.cadence = cadence;
        if self.running.is_none() {
            return Ok(());
        }
        tokio::runtime::Handle::try_current().map_err(|_| PollError::NoRuntime)?;
        self.stop();
        self.spawn_loop()
    }

    /// Ask for one invocation now, outside the regular cadence.
    ///
    /// Returns `false` when stopped. The overlap policy still applies.
    pub fn refresh(&self) -> bool {
        match &self.running {
            Some(running) => {
                running.refresh.notify_one();
                true
            }
            None => false,
        }
    }

    fn spawn_loop(&mut self) -> Result<(), PollError> {
        let Some(task) = self.task.clone() else {
            return Ok(());
        };
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| PollError::NoRuntime)?;

        let refresh = Arc::new(Notify::new());
        let run = Arc::new(RunState::default());
        let tick = Tick {
            name: self.name.clone(),
            overlap: self.overlap,
            on_error: self.on_error.clone(),
            task,
            stats: self.stats.clone(),
            run: run.clone(),
        };
        let handle = runtime.spawn(run_loop(tick, self.cadence, refresh.clone()));
        self.running = Some(Running {
            handle,
            refresh,
            run,
        });

        log::debug!(
            "Poller '{}' started (every {}, {:?})",
            self.name,
            self.cadence,
            self.overlap
        );
        Ok(())
    }
}

impl Drop for PollingController {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop(tick: Tick, cadence: Cadence, refresh: Arc<Notify>) {
    let mut interval = ticker(cadence, tick.overlap);
    loop {
        tokio::select! {
            biased;
            _ = interval.tick() => {}
            _ = refresh.notified() => {
                log::debug!("Poller '{}' refresh requested", tick.name);
            }
        }
        tick.fire();
    }
}

/// Everything the timer loop needs to launch one invocation.
struct Tick {
    name: Arc<str>,
    overlap: OverlapPolicy,
    on_error: ErrorHook,
    task: SharedTask,
    stats: SharedStats,
    run: Arc<RunState>,
}

impl Tick {
    fn fire(&self) {
        let stopped = lock(&self.run.stopped);
        if *stopped {
            return;
        }

        let busy = self.run.busy.load(Ordering::SeqCst) > 0;
        if self.overlap == OverlapPolicy::SkipIfBusy && busy {
            lock(&self.stats).skipped += 1;
            log::debug!("Poller '{}' busy, skipping tick", self.name);
            return;
        }

        let created = {
            let mut guard = lock(&self.task);
            let task: &mut BoxTask = &mut guard;
            std::panic::catch_unwind(AssertUnwindSafe(|| task()))
        };

        let invocation = match created {
            Ok(invocation) => invocation,
            Err(payload) => {
                lock(&self.stats).invocations += 1;
                record_outcome(
                    &self.stats,
                    &self.on_error,
                    &self.name,
                    Err(TaskFailure::from_panic(payload)),
                );
                return;
            }
        };

        let guard = InFlight::begin(self.stats.clone(), self.run.clone());
        let stats = self.stats.clone();
        let name = self.name.clone();
        let on_error = self.on_error.clone();
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(invocation).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(payload) => Err(TaskFailure::from_panic(payload)),
            };
            drop(guard);
            record_outcome(&stats, &on_error, &name, outcome);
        });
    }
}

/// Marks one invocation as in flight until dropped.
struct InFlight {
    stats: SharedStats,
    run: Arc<RunState>,
}

impl InFlight {
    fn begin(stats: SharedStats, run: Arc<RunState>) -> Self {
        {
            let mut guard = lock(&stats);
            guard.invocations += 1;
            guard.in_flight += 1;
        }
        run.busy.fetch_add(1, Ordering::SeqCst);
        Self { stats, run }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.run.busy.fetch_sub(1, Ordering::SeqCst);
        let mut stats = lock(&self.stats);
        stats.in_flight = stats.in_flight.saturating_sub(1);
    }
}

fn record_outcome(
    stats: &SharedStats,
    on_error: &ErrorHook,
    name: &str,
    outcome: Result<(), TaskFailure>,
) {
    match outcome {
        Ok(()) => {
            lock(stats).last_success = Some(Utc::now());
        }
        Err(failure) => {
            {
                let mut stats = lock(stats);
                stats.failures += 1;
                stats.last_failure = Some(Utc::now());
            }
            report(on_error, name, &failure);
        }
    }
}
