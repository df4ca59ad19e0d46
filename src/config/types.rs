use std::collections::HashSet;
use std::fmt;

use serde::Deserialize;

use crate::clock::Cadence;
use crate::controller::OverlapPolicy;

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

/// Settings shared by every job unless a job overrides them
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DefaultsConfig {
    /// Poll interval in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Overlap policy: "skip" or "allow"
    #[serde(default)]
    pub overlap: OverlapPolicy,
    /// Shell used to run job commands (invoked as `<shell> -c <command>`)
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            overlap: OverlapPolicy::default(),
            shell: default_shell(),
        }
    }
}

/// Configuration for a single poll job
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct JobConfig {
    /// Unique job ID, used by `pollkit-msg get/trigger`
    pub id: String,
    /// Shell command whose stdout becomes the job output
    pub command: String,
    /// Poll interval override in milliseconds
    pub interval_ms: Option<u64>,
    /// Overlap policy override
    pub overlap: Option<OverlapPolicy>,
    /// Disabled jobs are parsed and validated but never started
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl JobConfig {
    /// Effective cadence, falling back to the defaults section.
    pub fn cadence(&self, defaults: &DefaultsConfig) -> Option<Cadence> {
        Cadence::from_millis(self.interval_ms.unwrap_or(defaults.interval_ms)).ok()
    }

    pub fn overlap(&self, defaults: &DefaultsConfig) -> OverlapPolicy {
        self.overlap.unwrap_or(defaults.overlap)
    }
}

fn default_interval_ms() -> u64 {
    Cadence::DEFAULT.as_millis()
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_enabled() -> bool {
    true
}

/// A problem found while validating a config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    pub is_error: bool,
    pub message: String,
}

impl ConfigIssue {
    fn error(message: impl Into<String>) -> Self {
        Self {
            is_error: true,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            is_error: false,
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = if self.is_error { "error" } else { "warning" };
        write!(f, "{}: {}", level, self.message)
    }
}

impl Config {
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.defaults.interval_ms == 0 {
            issues.push(ConfigIssue::error("defaults.interval_ms must be greater than 0"));
        }
        if self.defaults.shell.trim().is_empty() {
            issues.push(ConfigIssue::error("defaults.shell must not be empty"));
        }

        let mut seen = HashSet::new();
        for (index, job) in self.jobs.iter().enumerate() {
            if job.id.trim().is_empty() {
                issues.push(ConfigIssue::error(format!("jobs[{}]: id must not be empty", index)));
            } else if !seen.insert(job.id.as_str()) {
                issues.push(ConfigIssue::error(format!(
                    "jobs[{}]: duplicate id '{}'",
                    index, job.id
                )));
            }
            if job.command.trim().is_empty() {
                issues.push(ConfigIssue::error(format!(
                    "jobs[{}] '{}': command must not be empty",
                    index, job.id
                )));
            }
            if job.interval_ms == Some(0) {
                issues.push(ConfigIssue::error(format!(
                    "jobs[{}] '{}': interval_ms must be greater than 0",
                    index, job.id
                )));
            }
        }

        if !self.jobs.iter().any(|job| job.enabled) {
            issues.push(ConfigIssue::warning("no enabled jobs; nothing will be polled"));
        }

        issues
    }

    /// Enabled jobs in config order.
    pub fn enabled_jobs(&self) -> impl Iterator<Item = &JobConfig> {
        self.jobs.iter().filter(|job| job.enabled)
    }
}
