//! Supervisor: owns one bound poller per configured job.
//!
//! The current job set lives in a [`Scope`]. Applying a new config
//! unmounts that scope, which stops every poller it owns, and mounts a
//! fresh one for the new jobs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_channel::Receiver;
use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;

use crate::binder::{bind, BoundPoller, Scope};
use crate::config::{load_config_from, Config, ConfigWatcher};
use crate::controller::PollingController;
use crate::failure::PollError;
use crate::ipc::{IpcCommand, IpcRequest};
use crate::jobs::{JobOutputs, ScriptJob};

const CONFIG_CHECK_INTERVAL: Duration = Duration::from_millis(500);

pub struct Supervisor {
    config_path: PathBuf,
    config: Config,
    outputs: JobOutputs,
    scope: Scope,
    pollers: BTreeMap<String, BoundPoller>,
    generation: u64,
}

impl Supervisor {
    pub fn new(config_path: PathBuf, outputs: JobOutputs) -> Self {
        Self {
            config_path,
            config: Config::default(),
            outputs,
            scope: Scope::new("jobs#0"),
            pollers: BTreeMap::new(),
            generation: 0,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.pollers.keys().cloned().collect()
    }

    /// Replace the running job set with the enabled jobs of `config`.
    ///
    /// Returns the number of jobs started.
    pub fn apply(&mut self, config: Config) -> Result<usize, PollError> {
        self.unmount_jobs();

        let ids: Vec<&str> = config.enabled_jobs().map(|job| job.id.as_str()).collect();
        self.outputs.retain_ids(&ids);

        self.generation += 1;
        self.scope = Scope::new(format!("jobs#{}", self.generation));

        for job in config.enabled_jobs() {
            let Some(cadence) = job.cadence(&config.defaults) else {
                log::warn!("Job '{}' has no valid interval, skipping", job.id);
                continue;
            };
            let controller = PollingController::builder(job.id.as_str())
                .cadence(cadence)
                .overlap(job.overlap(&config.defaults))
                .build();
            let poller = bind(&mut self.scope, controller);
            let task =
                ScriptJob::from_config(job, &config.defaults).into_task(self.outputs.clone());
            poller.start_default(task)?;
            log::info!("Job '{}' polling every {}", job.id, cadence);
            self.pollers.insert(job.id.clone(), poller);
        }

        log::info!(
            "Started {} poll job(s) in scope '{}'",
            self.pollers.len(),
            self.scope.name()
        );
        self.config = config;
        Ok(self.pollers.len())
    }

    /// Re-read the config file and apply it.
    pub fn reload(&mut self) -> Result<usize, PollError> {
        let config = load_config_from(&self.config_path);
        self.apply(config)
    }

    pub fn shutdown(&mut self) {
        self.unmount_jobs();
        log::info!("All poll jobs stopped");
    }

    fn unmount_jobs(&mut self) {
        self.scope.unmount();
        self.pollers.clear();
    }

    /// Answers one IPC command.
    pub fn handle(&mut self, command: &IpcCommand) -> String {
        match command {
            IpcCommand::Status => serde_json::json!({
                "version": crate::VERSION,
                "running": true,
                "jobs": self.pollers.len(),
            })
            .to_string(),
            IpcCommand::List => self.list_json().to_string(),
            IpcCommand::Get { job_id } => self.get_json(job_id),
            IpcCommand::Trigger { job_id } => match self.pollers.get(job_id) {
                Some(poller) if poller.refresh() => "OK".to_string(),
                Some(_) => format!("ERR: job '{}' is not running", job_id),
                None => format!("ERR: unknown job '{}'", job_id),
            },
            IpcCommand::Reload => match self.reload() {
                Ok(started) => format!("OK: reloaded, {} job(s) running", started),
                Err(e) => format!("ERR: reload failed: {}", e),
            },
        }
    }

    fn list_json(&self) -> serde_json::Value {
        let jobs: Vec<serde_json::Value> = self
            .pollers
            .iter()
            .map(|(id, poller)| {
                let stats = poller.stats();
                serde_json::json!({
                    "id": id,
                    "running": poller.is_running(),
                    "interval_ms": poller.cadence().as_millis(),
                    "invocations": stats.invocations,
                    "failures": stats.failures,
                    "skipped": stats.skipped,
                    "in_flight": stats.in_flight,
                    "last_success": stats.last_success.as_ref().map(DateTime::<Utc>::to_rfc3339),
                    "last_failure": stats.last_failure.as_ref().map(DateTime::<Utc>::to_rfc3339),
                })
            })
            .collect();
        serde_json::Value::Array(jobs)
    }

    fn get_json(&self, job_id: &str) -> String {
        if !self.pollers.contains_key(job_id) {
            return format!("ERR: unknown job '{}'", job_id);
        }
        let output = self.outputs.get(job_id);
        serde_json::json!({
            "id": job_id,
            "output": output.as_ref().map(|o| o.text.as_str()),
            "updated_at": output.as_ref().map(|o| o.updated_at.to_rfc3339()),
        })
        .to_string()
    }
}

/// The daemon's event loop.
///
/// Serves IPC requests, applies config reloads and exits on shutdown or
/// when the request channel closes. All pollers are stopped on the way out.
pub async fn run(
    mut supervisor: Supervisor,
    requests: Receiver<IpcRequest>,
    shutdown: Receiver<()>,
    watcher: Option<ConfigWatcher>,
) {
    let mut config_check = tokio::time::interval(CONFIG_CHECK_INTERVAL);
    config_check.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Ok(request) => {
                    let response = supervisor.handle(&request.command);
                    request.respond(response);
                }
                Err(_) => {
                    log::info!("IPC channel closed");
                    break;
                }
            },
            _ = shutdown.recv() => {
                log::info!("Shutdown requested");
                break;
            }
            _ = config_check.tick() => {
                if let Some(watcher) = &watcher {
                    if watcher.check_and_reload() {
                        if let Err(e) = supervisor.apply(watcher.current()) {
                            log::error!("Failed to apply reloaded config: {}", e);
                        } else {
                            log::info!("Config reloaded");
                        }
                    }
                }
            }
        }
    }

    supervisor.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DefaultsConfig, JobConfig};
    use std::sync::{Arc, RwLock};

    fn job(id: &str, command: &str) -> JobConfig {
        JobConfig {
            id: id.to_string(),
            command: command.to_string(),
            interval_ms: Some(60_000),
            overlap: None,
            enabled: true,
        }
    }

    fn config(jobs: Vec<JobConfig>) -> Config {
        Config {
            defaults: DefaultsConfig::default(),
            jobs,
        }
    }

    fn supervisor() -> (Supervisor, JobOutputs) {
        let outputs = JobOutputs::new();
        let dir = std::env::temp_dir().join("pollkit-test-missing.toml");
        (Supervisor::new(dir, outputs.clone()), outputs)
    }

    async fn wait_for_output(outputs: &JobOutputs, id: &str) -> String {
        for _ in 0..200 {
            if let Some(output) = outputs.get(id) {
                return output.text;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no output recorded for job '{}'", id);
    }

    #[tokio::test]
    async fn test_apply_starts_enabled_jobs_only() {
        let (mut supervisor, _) = supervisor();
        let mut disabled = job("off", "echo off");
        disabled.enabled = false;

        let started = supervisor
            .apply(config(vec![job("a", "echo a"), disabled, job("b", "echo b")]))
            .unwrap();

        assert_eq!(started, 2);
        assert_eq!(supervisor.job_ids(), vec!["a", "b"]);

        let status: serde_json::Value =
            serde_json::from_str(&supervisor.handle(&IpcCommand::Status)).unwrap();
        assert_eq!(status["jobs"], 2);
        assert_eq!(status["running"], true);

        let list: serde_json::Value =
            serde_json::from_str(&supervisor.handle(&IpcCommand::List)).unwrap();
        assert_eq!(list[0]["id"], "a");
        assert_eq!(list[0]["running"], true);
        assert_eq!(list[0]["interval_ms"], 60_000);
        assert_eq!(list[1]["id"], "b");
    }

    #[tokio::test]
    async fn test_trigger_and_get() {
        let (mut supervisor, outputs) = supervisor();
        supervisor.apply(config(vec![job("greet", "echo hi")])).unwrap();

        let pending: serde_json::Value = serde_json::from_str(&supervisor.handle(
            &IpcCommand::Get {
                job_id: "greet".to_string(),
            },
        ))
        .unwrap();
        assert!(pending["output"].is_null());

        let reply = supervisor.handle(&IpcCommand::Trigger {
            job_id: "greet".to_string(),
        });
        assert_eq!(reply, "OK");
        assert_eq!(wait_for_output(&outputs, "greet").await, "hi");

        let got: serde_json::Value = serde_json::from_str(&supervisor.handle(&IpcCommand::Get {
            job_id: "greet".to_string(),
        }))
        .unwrap();
        assert_eq!(got["output"], "hi");
        assert!(got["updated_at"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_job_errors() {
        let (mut supervisor, _) = supervisor();
        assert_eq!(
            supervisor.handle(&IpcCommand::Trigger {
                job_id: "nope".to_string()
            }),
            "ERR: unknown job 'nope'"
        );
        assert_eq!(
            supervisor.handle(&IpcCommand::Get {
                job_id: "nope".to_string()
            }),
            "ERR: unknown job 'nope'"
        );
    }

    #[tokio::test]
    async fn test_reapply_replaces_job_set() {
        let (mut supervisor, outputs) = supervisor();
        supervisor
            .apply(config(vec![job("old", "echo old"), job("kept", "echo kept")]))
            .unwrap();
        outputs.record("old", "stale".to_string());
        outputs.record("kept", "value".to_string());

        supervisor.apply(config(vec![job("kept", "echo kept")])).unwrap();

        assert_eq!(supervisor.job_ids(), vec!["kept"]);
        assert!(outputs.get("old").is_none());
        assert_eq!(outputs.get("kept").unwrap().text, "value");
        assert_eq!(supervisor.config().jobs.len(), 1);
    }

    #[tokio::test]
    async fn test_reload_with_missing_file_clears_jobs() {
        let (mut supervisor, _) = supervisor();
        supervisor.apply(config(vec![job("a", "echo a")])).unwrap();

        assert_eq!(
            supervisor.handle(&IpcCommand::Reload),
            "OK: reloaded, 0 job(s) running"
        );
        assert!(supervisor.job_ids().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let (mut supervisor, _) = supervisor();
        supervisor.apply(config(vec![job("a", "echo a")])).unwrap();
        supervisor.shutdown();
        assert_eq!(supervisor.handle(&IpcCommand::List), "[]");
    }

    #[tokio::test]
    async fn test_run_serves_requests_until_shutdown() {
        let (mut supervisor, _) = supervisor();
        supervisor.apply(config(vec![job("a", "echo a")])).unwrap();

        let (request_tx, request_rx) = async_channel::unbounded();
        let (shutdown_tx, shutdown_rx) = async_channel::bounded(1);
        let daemon = tokio::spawn(run(supervisor, request_rx, shutdown_rx, None));

        let (request, reply) = IpcRequest::new(IpcCommand::Trigger {
            job_id: "a".to_string(),
        });
        request_tx.send(request).await.unwrap();
        assert_eq!(reply.recv().await.unwrap(), "OK");

        shutdown_tx.send(()).await.unwrap();
        daemon.await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_reports_started_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[[jobs]]\nid = \"a\"\ncommand = \"echo a\"\n\n[[jobs]]\nid = \"b\"\ncommand = \"echo b\"\n",
        )
        .unwrap();
        let mut supervisor = Supervisor::new(path, JobOutputs::new());

        assert_eq!(
            supervisor.handle(&IpcCommand::Reload),
            "OK: reloaded, 2 job(s) running"
        );
    }

    #[tokio::test]
    async fn test_run_applies_config_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let shared = Arc::new(RwLock::new(Config::default()));
        let watcher = ConfigWatcher::new(path.clone(), shared).unwrap();
        let supervisor = Supervisor::new(path.clone(), JobOutputs::new());

        let (request_tx, request_rx) = async_channel::unbounded();
        let (shutdown_tx, shutdown_rx) = async_channel::bounded(1);
        let daemon = tokio::spawn(run(supervisor, request_rx, shutdown_rx, Some(watcher)));

        std::fs::write(
            &path,
            "[[jobs]]\nid = \"fresh\"\ncommand = \"echo fresh\"\ninterval_ms = 60000\n",
        )
        .unwrap();

        let mut list = serde_json::Value::Null;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let (request, reply) = IpcRequest::new(IpcCommand::List);
            request_tx.send(request).await.unwrap();
            list = serde_json::from_str(&reply.recv().await.unwrap()).unwrap();
            if list.as_array().is_some_and(|jobs| !jobs.is_empty()) {
                break;
            }
        }
        assert_eq!(list[0]["id"], "fresh");
        assert_eq!(list[0]["interval_ms"], 60_000);

        shutdown_tx.send(()).await.unwrap();
        daemon.await.unwrap();
    }
}
