//! Command-line tool to send messages to a running pollkit daemon

use std::env;

use pollkit::ipc::{send_command, socket_path};

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();

    if args.is_empty() {
        eprintln!("Usage: pollkit-msg <command> [args...]");
        eprintln!();
        eprintln!("Commands:");
        eprintln!("  status                          Get daemon status (JSON)");
        eprintln!("  list                            List all jobs with poll statistics (JSON)");
        eprintln!("  get <job_id>                    Get the latest output of a job (JSON)");
        eprintln!("  trigger <job_id>                Poll a job right now");
        eprintln!("  reload                          Reload configuration");
        std::process::exit(1);
    }

    let command = args.join(" ");
    let socket = socket_path();

    match send_command(&socket, &command) {
        Ok(response) => {
            println!("{}", response);
            if response.starts_with("ERR") {
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Failed to reach pollkit at {:?}: {}", socket, e);
            eprintln!("Is pollkit running?");
            std::process::exit(1);
        }
    }
}
