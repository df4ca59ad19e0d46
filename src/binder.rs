//! Ties a poller's lifetime to the object that owns it.
//!
//! The owner exposes a single "unmounted" hook through [`Lifecycle`].
//! [`bind`] registers a stop against that hook, so a poller cannot outlive
//! its owner even when nobody calls `stop` explicitly.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::clock::Cadence;
use crate::controller::{PollStats, PollingController};
use crate::failure::{PollError, PollOutcome};

/// Callback run when an owner is torn down.
pub type UnmountHook = Box<dyn FnOnce() + Send>;

/// Something with a destruction event that pollers can attach to.
pub trait Lifecycle {
    fn on_unmount(&mut self, hook: UnmountHook);
}

/// A plain owner: collects unmount hooks and runs them once.
///
/// Hooks run in reverse registration order. Dropping a mounted scope
/// unmounts it. Registering on a scope that is already unmounted runs the
/// hook immediately.
pub struct Scope {
    name: String,
    hooks: Vec<UnmountHook>,
    mounted: bool,
}

impl Scope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hooks: Vec::new(),
            mounted: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    pub fn unmount(&mut self) {
        if !self.mounted {
            return;
        }
        self.mounted = false;
        log::debug!("Unmounting scope '{}' ({} hooks)", self.name, self.hooks.len());
        while let Some(hook) = self.hooks.pop() {
            hook();
        }
    }
}

impl Lifecycle for Scope {
    fn on_unmount(&mut self, hook: UnmountHook) {
        if self.mounted {
            self.hooks.push(hook);
        } else {
            hook();
        }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.unmount();
    }
}

struct Binding {
    controller: Mutex<PollingController>,
    released: AtomicBool,
}

impl Binding {
    fn controller(&self) -> MutexGuard<'_, PollingController> {
        self.controller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stops the controller the first time it is called.
    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut controller = self.controller();
        controller.stop();
        log::debug!("Released poller '{}'", controller.name());
    }
}

/// A controller whose lifetime is bound to an owner.
///
/// Once released (owner unmounted, [`release`](Self::release) called, or
/// this handle dropped) the poller is stopped and cannot be started again.
pub struct BoundPoller {
    binding: Arc<Binding>,
}

/// Bind `controller` to `owner` so it stops when the owner unmounts.
pub fn bind<L>(owner: &mut L, controller: PollingController) -> BoundPoller
where
    L: Lifecycle + ?Sized,
{
    let binding = Arc::new(Binding {
        controller: Mutex::new(controller),
        released: AtomicBool::new(false),
    });
    let weak = Arc::downgrade(&binding);
    owner.on_unmount(Box::new(move || {
        if let Some(binding) = weak.upgrade() {
            binding.release();
        }
    }));
    BoundPoller { binding }
}

impl BoundPoller {
    pub fn name(&self) -> String {
        self.binding.controller().name().to_string()
    }

    pub fn is_released(&self) -> bool {
        self.binding.released.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.binding.controller().is_running()
    }

    pub fn cadence(&self) -> Cadence {
        self.binding.controller().cadence()
    }

    pub fn stats(&self) -> PollStats {
        self.binding.controller().stats()
    }

    pub fn start<F, Fut>(&self, task: F, cadence: Cadence) -> Result<(), PollError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: PollOutcome,
    {
        let mut controller = self.binding.controller();
        if self.is_released() {
            return Err(PollError::Unmounted);
        }
        controller.start(task, cadence)
    }

    pub fn start_default<F, Fut>(&self, task: F) -> Result<(), PollError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: PollOutcome,
    {
        let cadence = self.cadence();
        self.start(task, cadence)
    }

    pub fn stop(&self) {
        self.binding.controller().stop();
    }

    pub fn refresh(&self) -> bool {
        self.binding.controller().refresh()
    }

    pub fn set_cadence(&self, cadence: Cadence) -> Result<(), PollError> {
        self.binding.controller().set_cadence(cadence)
    }

    /// Stop and detach now, without waiting for the owner.
    pub fn release(&self) {
        self.binding.release();
    }
}

impl Drop for BoundPoller {
    fn drop(&mut self) {
        self.binding.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting(
        calls: &Arc<AtomicUsize>,
    ) -> impl FnMut() -> std::future::Ready<()> + Send + 'static {
        let calls = calls.clone();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[test]
    fn test_scope_runs_hooks_once_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut scope = Scope::new("page");
        for i in 0..3 {
            let order = order.clone();
            scope.on_unmount(Box::new(move || order.lock().unwrap().push(i)));
        }
        assert_eq!(scope.hook_count(), 3);

        scope.unmount();
        scope.unmount();
        drop(scope);

        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn test_hook_on_unmounted_scope_runs_immediately() {
        let ran = Arc::new(AtomicBool::new(false));
        let mut scope = Scope::new("gone");
        scope.unmount();
        assert!(!scope.is_mounted());

        let flag = ran.clone();
        scope.on_unmount(Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(scope.hook_count(), 0);
    }

    #[test]
    fn test_dropping_scope_unmounts() {
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let mut scope = Scope::new("temporary");
            let ran = ran.clone();
            scope.on_unmount(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmount_stops_bound_poller() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut scope = Scope::new("dashboard");
        let poller = bind(&mut scope, PollingController::new("metrics"));
        poller
            .start(counting(&calls), Cadence::from_millis(1000).unwrap())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        scope.unmount();
        assert!(poller.is_released());
        assert!(!poller.is_running());

        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_poller_refuses_to_restart() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut scope = Scope::new("closed");
        let poller = bind(&mut scope, PollingController::new("late"));
        scope.unmount();

        let result = poller.start(counting(&calls), Cadence::DEFAULT);
        assert_eq!(result, Err(PollError::Unmounted));
        assert!(!poller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_stop_then_unmount_is_harmless() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut scope = Scope::new("tidy");
        let poller = bind(&mut scope, PollingController::new("tidy-poller"));
        poller.start_default(counting(&calls)).unwrap();

        poller.stop();
        assert!(!poller.is_released());
        poller.release();
        poller.release();
        scope.unmount();

        assert!(poller.is_released());
        tokio::time::sleep(Duration::from_millis(10_000)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_before_owner_stops_poller() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut scope = Scope::new("outlives");
        {
            let poller = bind(&mut scope, PollingController::new("short"));
            poller
                .start(counting(&calls), Cadence::from_millis(500).unwrap())
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // The registered hook finds nothing left to stop.
        scope.unmount();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bound_poller_forwards_controls() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut scope = Scope::new("controls");
        let poller = bind(
            &mut scope,
            PollingController::builder("forwarded")
                .cadence(Cadence::from_millis(1000).unwrap())
                .build(),
        );
        assert_eq!(poller.name(), "forwarded");
        poller.start_default(counting(&calls)).unwrap();

        assert!(poller.refresh());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        poller.set_cadence(Cadence::from_millis(100).unwrap()).unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(poller.stats().invocations, 4);
    }
}
