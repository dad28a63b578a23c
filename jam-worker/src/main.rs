//! jam-worker - one process per jam session
//!
//! Started by the orchestrator with its session parameters and two
//! pre-allocated ports: the control port the orchestrator connects to and
//! the file port browsers stream sound files through.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info};

use jam_utils::{paths, LogConfig, Result};

mod control;
mod process;
mod sounds;
mod streaming;
mod tree;

use process::{SessionInfo, SessionProcess};
use streaming::FileServer;

/// Events buffered ahead of the session actor
const EVENT_QUEUE: usize = 1024;

#[derive(Parser, Debug)]
#[command(author, version, about = "jamhub session worker", long_about = None)]
struct Args {
    /// Session this worker serves
    #[arg(long)]
    session_id: String,

    #[arg(long, default_value = "", allow_hyphen_values = true)]
    title: String,

    #[arg(long, default_value = "", allow_hyphen_values = true)]
    description: String,

    /// Account that created the session
    #[arg(long, allow_hyphen_values = true)]
    owner: Option<String>,

    /// Session length; the worker exits when it runs out
    #[arg(long, default_value_t = 3600)]
    length_secs: u64,

    #[arg(long, default_value_t = 4)]
    max_depth: usize,

    #[arg(long, default_value_t = 4)]
    max_width: usize,

    /// Address to bind both sockets on
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long)]
    control_port: u16,

    #[arg(long)]
    file_port: u16,

    /// Orchestrator handshake address (host:port)
    #[arg(long)]
    orchestrator: String,

    /// Where sound files are kept (defaults to the per-session data dir)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 10)]
    handshake_attempts: u32,

    #[arg(long, default_value_t = 500)]
    handshake_delay_ms: u64,
}

async fn run(args: Args) -> Result<()> {
    let data_dir = args
        .data_dir
        .clone()
        .unwrap_or_else(|| paths::worker_data_dir(&args.session_id));
    let sounds_dir = data_dir.join("sounds");
    paths::ensure_dir(&sounds_dir)?;

    let control_listener = TcpListener::bind((args.host.as_str(), args.control_port)).await?;
    let file_listener = TcpListener::bind((args.host.as_str(), args.file_port)).await?;
    info!(
        "Session {} listening on {}:{} (control) and {}:{} (files)",
        args.session_id, args.host, args.control_port, args.host, args.file_port
    );

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    tokio::spawn(control::serve_control(control_listener, events_tx.clone()));
    let file_server = Arc::new(FileServer::new(&sounds_dir, events_tx));
    tokio::spawn(file_server.serve(file_listener));

    let info = SessionInfo {
        session_id: args.session_id.clone(),
        title: args.title.clone(),
        description: args.description.clone(),
        owner_account_id: args.owner.clone(),
        start_time: Utc::now(),
        length_secs: args.length_secs,
        max_depth: args.max_depth,
        max_width: args.max_width,
    };
    let deadline = Instant::now() + Duration::from_secs(args.length_secs);
    let process = SessionProcess::new(info, &sounds_dir);

    let orchestrator = args.orchestrator.clone();
    let session_id = args.session_id.clone();
    let delay = Duration::from_millis(args.handshake_delay_ms);
    let attempts = args.handshake_attempts;
    tokio::spawn(async move {
        if let Err(e) = control::announce(&orchestrator, &session_id, attempts, delay).await {
            error!("Handshake failed: {}", e);
        }
    });

    let reason = process.run(events_rx, deadline).await;
    info!(?reason, "Worker for session {} exiting", args.session_id);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    jam_utils::init_logging_with_config(LogConfig::worker(&args.session_id))?;

    run(args).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> std::result::Result<Args, clap::Error> {
        let mut argv = vec![
            "jam-worker",
            "--session-id",
            "a1b2c3d4",
            "--control-port",
            "4001",
            "--file-port",
            "4002",
            "--orchestrator",
            "127.0.0.1:4000",
        ];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv)
    }

    #[test]
    fn test_plain_title() {
        let args = parse(&["--title", "Friday jam"]).unwrap();
        assert_eq!(args.title, "Friday jam");
        assert!(args.owner.is_none());
    }

    #[test]
    fn test_free_text_may_start_with_hyphen() {
        let args = parse(&[
            "--title",
            "- late set -",
            "--description",
            "-v",
            "--owner",
            "-dj",
        ])
        .unwrap();
        assert_eq!(args.title, "- late set -");
        assert_eq!(args.description, "-v");
        assert_eq!(args.owner.as_deref(), Some("-dj"));
    }

    #[test]
    fn test_attached_values_are_taken_verbatim() {
        let args = parse(&["--title=--help", "--description=-v", "--owner=-x"]).unwrap();
        assert_eq!(args.title, "--help");
        assert_eq!(args.description, "-v");
        assert_eq!(args.owner.as_deref(), Some("-x"));
    }
}
