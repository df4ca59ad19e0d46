mod types;

pub use types::{Config, ConfigIssue, DefaultsConfig, JobConfig};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

pub type SharedConfig = Arc<RwLock<Config>>;

const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);

pub fn load_config() -> Config {
    load_config_from(&get_config_path())
}

/// Loads and validates a config file, falling back to defaults on any error.
pub fn load_config_from(config_path: &Path) -> Config {
    let config = if config_path.exists() {
        match std::fs::read_to_string(config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    log::info!("Loaded config from {:?}", config_path);
                    config
                }
                Err(e) => {
                    log::error!("Failed to parse config: {}", e);
                    Config::default()
                }
            },
            Err(e) => {
                log::error!("Failed to read config file: {}", e);
                Config::default()
            }
        }
    } else {
        log::info!("No config file found at {:?}, using defaults", config_path);
        Config::default()
    };

    let issues = config.validate();
    let errors: Vec<_> = issues.iter().filter(|i| i.is_error).collect();
    let warnings: Vec<_> = issues.iter().filter(|i| !i.is_error).collect();

    for warning in &warnings {
        log::warn!("Config: {}", warning);
    }
    for error in &errors {
        log::error!("Config: {}", error);
    }

    if !issues.is_empty() {
        log::info!(
            "Config validation: {} error(s), {} warning(s)",
            errors.len(),
            warnings.len()
        );
    }

    if !errors.is_empty() {
        log::error!("Config has errors; falling back to defaults.");
        return Config::default();
    }

    config
}

/// `$POLLKIT_CONFIG`, else `~/.config/pollkit/config.toml`.
pub fn get_config_path() -> PathBuf {
    if let Some(path) = std::env::var_os("POLLKIT_CONFIG") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("pollkit")
        .join("config.toml")
}

pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    receiver: Receiver<Result<Event, notify::Error>>,
    config_path: PathBuf,
    config: SharedConfig,
    last_reload: Mutex<Instant>,
    /// A change was seen but not yet applied (debounced).
    pending: AtomicBool,
}

impl ConfigWatcher {
    pub fn new(config_path: PathBuf, config: SharedConfig) -> Result<Self, notify::Error> {
        let (tx, rx) = channel();

        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;

        // Watch the config directory (create if needed)
        let config_dir = config_path
            .parent()
            .unwrap_or(config_path.as_path())
            .to_path_buf();
        if !config_dir.exists() {
            let _ = std::fs::create_dir_all(&config_dir);
        }

        watcher.watch(&config_dir, RecursiveMode::NonRecursive)?;
        log::info!("Watching config directory: {:?}", config_dir);

        Ok(Self {
            _watcher: watcher,
            receiver: rx,
            config_path,
            config,
            last_reload: Mutex::new(
                Instant::now()
                    .checked_sub(RELOAD_DEBOUNCE)
                    .unwrap_or_else(Instant::now),
            ),
            pending: AtomicBool::new(false),
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Snapshot of the most recently loaded config.
    pub fn current(&self) -> Config {
        self.config.read().map(|cfg| cfg.clone()).unwrap_or_default()
    }

    /// Check for config changes and reload if needed. Returns true if config was reloaded.
    ///
    /// A change that lands inside the debounce window stays pending and is
    /// applied by a later call.
    pub fn check_and_reload(&self) -> bool {
        let file_name = self.config_path.file_name();
        let mut should_reload = self.pending.load(Ordering::SeqCst);

        // Drain all pending events
        while let Ok(event) = self.receiver.try_recv() {
            match event {
                Ok(event) => {
                    let is_config = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().is_some() && p.file_name() == file_name);

                    if is_config && (event.kind.is_modify() || event.kind.is_create()) {
                        should_reload = true;
                    }
                }
                Err(e) => {
                    log::error!("Config watch error: {}", e);
                }
            }
        }

        if !should_reload {
            return false;
        }

        let now = Instant::now();
        let elapsed = self
            .last_reload
            .lock()
            .map(|t| now.duration_since(*t))
            .unwrap_or(Duration::ZERO);
        if elapsed < RELOAD_DEBOUNCE {
            self.pending.store(true, Ordering::SeqCst);
            return false;
        }
        self.pending.store(false, Ordering::SeqCst);

        log::info!("Config file changed, reloading...");
        let new_config = load_config_from(&self.config_path);
        if let Ok(mut cfg) = self.config.write() {
            *cfg = new_config;
            if let Ok(mut t) = self.last_reload.lock() {
                *t = now;
            }
            return true;
        }

        false
    }
}
