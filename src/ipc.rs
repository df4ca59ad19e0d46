//! IPC command types and the Unix socket listener.
//!
//! Each connection carries one command line and gets one reply line.
//! Parsed commands travel over an async channel to the supervisor, which
//! answers through a per-request reply channel.

use async_channel::{Receiver, Sender};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How long a client may take to send its command or read the reply.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(2);

/// A parsed IPC command destined for the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcCommand {
    /// Daemon version and job count.
    Status,
    /// Every job with its poller statistics.
    List,
    /// Latest output of one job.
    Get { job_id: String },
    /// Poll one job right now.
    Trigger { job_id: String },
    /// Re-read the config file and rebuild the job set.
    Reload,
}

/// A command plus the channel its reply goes back on.
pub struct IpcRequest {
    pub command: IpcCommand,
    reply: Sender<String>,
}

impl IpcRequest {
    pub fn new(command: IpcCommand) -> (Self, Receiver<String>) {
        let (reply, rx) = async_channel::bounded(1);
        (Self { command, reply }, rx)
    }

    pub fn respond(self, response: String) {
        let _ = self.reply.try_send(response);
    }
}

pub fn socket_path() -> PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(runtime_dir).join("pollkit.sock")
}

/// Parses a command line. `Err` carries the reply to send back as-is.
pub fn parse_command(line: &str) -> Result<IpcCommand, String> {
    let trimmed = line.trim();
    let parts: Vec<&str> = trimmed.splitn(2, ' ').collect();
    let verb = parts.first().copied().unwrap_or("");
    let arg = parts.get(1).map(|s| s.trim()).unwrap_or("");

    match verb {
        "status" => Ok(IpcCommand::Status),
        "list" => Ok(IpcCommand::List),
        "reload" => Ok(IpcCommand::Reload),
        "get" | "trigger" if arg.is_empty() => Err(format!("ERR: {} requires <job_id>", verb)),
        "get" => Ok(IpcCommand::Get {
            job_id: arg.to_string(),
        }),
        "trigger" => Ok(IpcCommand::Trigger {
            job_id: arg.to_string(),
        }),
        other => Err(format!("ERR: unknown command '{}'", other)),
    }
}

/// Binds the socket and serves connections on a background thread.
///
/// Fails with `AddrInUse` when another daemon already answers on the
/// socket. A stale socket file is removed and rebound.
pub fn start_listener(socket: &Path, requests: Sender<IpcRequest>) -> std::io::Result<()> {
    if let Some(parent) = socket.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = match UnixListener::bind(socket) {
        Ok(listener) => listener,
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            if UnixStream::connect(socket).is_ok() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    "pollkit is already running",
                ));
            }
            let _ = std::fs::remove_file(socket);
            UnixListener::bind(socket)?
        }
        Err(err) => return Err(err),
    };
    log::info!("IPC listening on {:?}", socket);

    std::thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let requests = requests.clone();
            std::thread::spawn(move || serve_client(stream, &requests));
        }
    });

    Ok(())
}

/// One command line in, one reply line out.
fn serve_client(stream: UnixStream, requests: &Sender<IpcRequest>) {
    let _ = stream.set_read_timeout(Some(CLIENT_TIMEOUT));
    let _ = stream.set_write_timeout(Some(CLIENT_TIMEOUT));

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    if let Err(e) = reader.read_line(&mut line) {
        log::debug!("IPC client dropped: {}", e);
        return;
    }
    let response = dispatch(&line, requests);
    let mut stream = reader.into_inner();
    let _ = writeln!(stream, "{}", response);
}

fn dispatch(line: &str, requests: &Sender<IpcRequest>) -> String {
    let command = match parse_command(line) {
        Ok(command) => command,
        Err(response) => return response,
    };
    log::debug!("IPC command: {:?}", command);

    let (request, reply) = IpcRequest::new(command);
    if requests.send_blocking(request).is_err() {
        return "ERR: daemon is shutting down".to_string();
    }
    reply
        .recv_blocking()
        .unwrap_or_else(|_| "ERR: no response".to_string())
}

/// Sends one command to a running daemon and returns its reply line.
pub fn send_command(socket: &Path, command: &str) -> std::io::Result<String> {
    let mut stream = UnixStream::connect(socket)?;
    writeln!(stream, "{}", command)?;

    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    reader.read_line(&mut response)?;
    Ok(response.trim().to_string())
}
