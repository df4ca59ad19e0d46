//! Shell-command poll jobs.
//!
//! A job runs `<shell> -c <command>` and keeps its trimmed stdout as the
//! latest output. A failed run leaves the previous output in place.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use thiserror::Error;

use crate::config::{DefaultsConfig, JobConfig};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("failed to spawn command: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },
    #[error("command exited with {}: {stderr}", describe_code(.code))]
    ExitStatus { code: Option<i32>, stderr: String },
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

/// Latest output of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutput {
    pub text: String,
    pub updated_at: DateTime<Utc>,
}

/// Latest outputs of all jobs, shared between pollers and the IPC surface.
#[derive(Debug, Clone, Default)]
pub struct JobOutputs {
    inner: Arc<RwLock<HashMap<String, JobOutput>>>,
}

impl JobOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, id: &str, text: String) {
        if let Ok(mut map) = self.inner.write() {
            map.insert(
                id.to_string(),
                JobOutput {
                    text,
                    updated_at: Utc::now(),
                },
            );
        }
    }

    pub fn get(&self, id: &str) -> Option<JobOutput> {
        self.inner.read().ok().and_then(|map| map.get(id).cloned())
    }

    /// Drops outputs of jobs that are no longer configured.
    pub fn retain_ids(&self, ids: &[&str]) {
        if let Ok(mut map) = self.inner.write() {
            map.retain(|id, _| ids.contains(&id.as_str()));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut map) = self.inner.write() {
            map.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptJob {
    id: String,
    command: String,
    shell: String,
}

impl ScriptJob {
    pub fn new(id: &str, command: &str, shell: &str) -> Self {
        Self {
            id: id.to_string(),
            command: command.to_string(),
            shell: shell.to_string(),
        }
    }

    pub fn from_config(job: &JobConfig, defaults: &DefaultsConfig) -> Self {
        Self::new(&job.id, &job.command, &defaults.shell)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn run(&self) -> Result<String, JobError> {
        let output = tokio::process::Command::new(&self.shell)
            .arg("-c")
            .arg(&self.command)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| JobError::Spawn { source })?;

        if !output.status.success() {
            return Err(JobError::ExitStatus {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Poll task body: run the command and record its output.
    pub fn into_task(
        self,
        outputs: JobOutputs,
    ) -> impl FnMut() -> BoxFuture<'static, Result<(), JobError>> + Send + 'static {
        let job = Arc::new(self);
        move || {
            let job = job.clone();
            let outputs = outputs.clone();
            async move {
                let text = job.run().await?;
                log::trace!("Job '{}' output: {}", job.id, text);
                outputs.record(&job.id, text);
                Ok(())
            }
            .boxed()
        }
    }
}
