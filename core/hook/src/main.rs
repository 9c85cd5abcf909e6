//! devpulse-hook: shell-side client for devpulse-daemon.
//!
//! ## Subcommands
//!
//! - `send`: report one finished command (called by the shell snippet)
//! - `init`: print the shell integration snippet for bash or zsh

mod client;
mod logging;
mod shell;

use chrono::Utc;
use clap::{Parser, Subcommand};
use devpulse_protocol::CommandPayload;

#[derive(Parser, Debug)]
#[command(name = "devpulse-hook")]
#[command(about = "Reports shell commands to the devpulse daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send one command record to the daemon
    Send {
        /// Working directory the command ran in
        #[arg(long)]
        pwd: String,

        /// Exit status of the command
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        exit_code: i32,

        /// Wall time in seconds
        #[arg(long)]
        duration: Option<f64>,

        /// Completion time, Unix seconds (defaults to now)
        #[arg(long)]
        ts: Option<i64>,

        /// The command line as typed
        #[arg(last = true, required = true, num_args = 1..)]
        command: Vec<String>,
    },

    /// Print the shell integration snippet
    Init {
        #[arg(value_enum)]
        shell: shell::Shell,
    },
}

fn build_payload(
    pwd: String,
    exit_code: i32,
    duration: Option<f64>,
    ts: Option<i64>,
    command: Vec<String>,
) -> CommandPayload {
    CommandPayload {
        command: command.join(" "),
        pwd,
        ts: Some(ts.unwrap_or_else(|| Utc::now().timestamp())),
        duration,
        exit_code: Some(exit_code),
    }
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Send {
            pwd,
            exit_code,
            duration,
            ts,
            command,
        } => {
            let _logging_guard = logging::init();
            if !client::hook_enabled() {
                return;
            }
            let payload = build_payload(pwd, exit_code, duration, ts, command);
            // Reporting is best effort; the shell must never see a failure.
            let result =
                client::socket_path().and_then(|socket| client::send(&payload, &socket));
            if let Err(err) = result {
                tracing::warn!(error = %err, "devpulse-hook send failed");
            }
        }
        Commands::Init { shell } => {
            let hook_path = std::env::current_exe()
                .map(|path| path.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "devpulse-hook".to_string());
            print!("{}", shell::snippet(shell, &hook_path));
        }
    }
}
