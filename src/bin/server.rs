use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use broadcast_chat::prelude::*;

/// Broadcast chat server: every line a client sends is relayed to every other client.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8000")]
    address: String,

    /// Seconds a client may stay silent before it is disconnected
    #[arg(short, long, default_value_t = 300)]
    idle_timeout: u64,

    /// Lines that may wait in a client's outgoing queue before senders block
    #[arg(short, long, default_value_t = 5)]
    queue_capacity: usize,

    /// Control messages that may wait for the broker
    #[arg(long, default_value_t = 64)]
    hub_capacity: usize,

    /// Longest line, in bytes, a client may send before it is disconnected
    #[arg(long, default_value_t = 64 * 1024)]
    max_line_length: usize,

    /// Seconds a closing connection gets to flush its pending lines
    #[arg(long, default_value_t = 5)]
    close_grace: u64,

    /// Write logs to a daily rolling file in this directory instead of stdout
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn init_tracing(log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "server.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

async fn run(args: Args) -> Result<(), ServerError> {
    let config = HubConfig::new(Duration::from_secs(args.idle_timeout), args.queue_capacity, args.hub_capacity)?
        .with_max_line_length(args.max_line_length)?
        .with_close_grace(Duration::from_secs(args.close_grace));
    let listener = TcpListener::bind(&args.address).await?;

    let (hub, broker_handle) = Broadcaster::spawn(config.hub_capacity);

    tokio::select! {
        res = accept_loop(listener, hub, config) => res,
        res = broker_handle => match res {
            Ok(res) => res,
            Err(e) => Err(ServerError::StateError(format!("broker task failed: {e}"))),
        },
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let _guard = init_tracing(args.log_dir.as_ref());
    info!(?args, "Starting server");

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server stopped");
            eprintln!("error from server main: {e}");
            ExitCode::FAILURE
        }
    }
}
