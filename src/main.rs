use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use pollkit::app::{self, Supervisor};
use pollkit::config::{get_config_path, load_config_from, ConfigWatcher};
use pollkit::ipc;
use pollkit::jobs::JobOutputs;
use pollkit::VERSION;

fn print_help() {
    println!(
        "pollkit {}
Polls shell commands on fixed intervals and serves their latest output

USAGE:
    pollkit [OPTIONS]

OPTIONS:
    -c, --config <PATH>  Use this config file instead of the default
    -h, --help           Print this help message
    -v, --version        Print version information

ENVIRONMENT:
    RUST_LOG             Set log level (error, warn, info, debug, trace)
    POLLKIT_CONFIG       Config file path (overridden by --config)
    XDG_RUNTIME_DIR      Directory for the control socket

CONFIG:
    ~/.config/pollkit/config.toml

EXAMPLES:
    pollkit                          Run with default config
    RUST_LOG=debug pollkit           Run with debug logging
    pollkit-msg list                 Show job statistics",
        VERSION
    );
}

/// Returns the config path, or `None` when the process should exit.
fn parse_args() -> Option<PathBuf> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config_path = get_config_path();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return None;
            }
            "-v" | "--version" => {
                println!("pollkit {}", VERSION);
                return None;
            }
            "-c" | "--config" => match iter.next() {
                Some(path) => config_path = PathBuf::from(path),
                None => {
                    eprintln!("{} requires a path", arg);
                    std::process::exit(1);
                }
            },
            other => {
                eprintln!("Unknown argument: {}", other);
                eprintln!("Try 'pollkit --help' for more information.");
                std::process::exit(1);
            }
        }
    }

    Some(config_path)
}

fn init_logging() {
    // Flush each line for interactive debugging.
    let mut logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    logger
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{} {:>5} {}] {}",
                chrono::Utc::now().to_rfc3339(),
                record.level(),
                record.target(),
                record.args()
            )?;
            buf.flush()
        })
        .init();
}

fn main() {
    let Some(config_path) = parse_args() else {
        return;
    };

    init_logging();
    log::info!("Starting pollkit v{}", VERSION);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let socket = ipc::socket_path();
    let (request_tx, request_rx) = async_channel::unbounded();
    if let Err(err) = ipc::start_listener(&socket, request_tx) {
        if err.kind() == std::io::ErrorKind::AddrInUse {
            eprintln!("pollkit is already running.");
            std::process::exit(0);
        }
        log::warn!("Failed to start IPC listener: {}", err);
    }

    // Register cleanup for SIGINT/SIGTERM
    let (shutdown_tx, shutdown_rx) = async_channel::bounded(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    }) {
        log::warn!("Failed to install signal handler: {}", e);
    }

    let config = load_config_from(&config_path);
    let shared = Arc::new(RwLock::new(config.clone()));
    let watcher = match ConfigWatcher::new(config_path.clone(), shared) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            log::warn!("Config hot reload disabled: {}", e);
            None
        }
    };

    runtime.block_on(async move {
        let mut supervisor = Supervisor::new(config_path, JobOutputs::new());
        if let Err(e) = supervisor.apply(config) {
            log::error!("Failed to start jobs: {}", e);
        }
        app::run(supervisor, request_rx, shutdown_rx, watcher).await;
    });

    let _ = std::fs::remove_file(&socket);
    log::info!("pollkit stopped");
}
