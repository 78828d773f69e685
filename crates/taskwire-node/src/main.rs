//! Taskwire node - runs a message server or talks to one.
//!
//! `serve` starts a server with the node's demonstration handlers and runs
//! until interrupted. `send` and `ping` act as clients of a running node.

mod handler;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use handler::{Codes, NodeDispatch, NodeStatus};
use std::time::Duration;
use taskwire::{MessageEndpointClient, MessageEndpointServer, ServerConfig, NO_SEQUENCE_NUM};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "taskwire-node")]
#[command(about = "Message server and client for the taskwire transport")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a server until interrupted
    Serve {
        /// Label for the server's internal addresses
        #[arg(long, default_value = "node")]
        label: String,

        /// Async (fire-and-forget) port (0 = auto-assign)
        #[arg(long, default_value = "8005")]
        async_port: u16,

        /// Sync (request/response) port (0 = auto-assign)
        #[arg(long, default_value = "8006")]
        sync_port: u16,

        /// Worker threads per mode (defaults to TASKWIRE_SERVER_THREADS or 2)
        #[arg(short, long)]
        threads: Option<usize>,

        /// Worker receive timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Send a fire-and-forget message to be logged by the node
    Send {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value = "8005")]
        async_port: u16,

        /// Sequence number to attach
        #[arg(long)]
        sequence: Option<i32>,

        message: String,
    },

    /// Ping a node, optionally asking for its status
    Ping {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value = "8006")]
        sync_port: u16,

        /// Print request counters after the ping
        #[arg(long)]
        status: bool,

        /// Request timeout in milliseconds
        #[arg(long, default_value = "5000")]
        timeout_ms: u64,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match args.command {
        Command::Serve {
            label,
            async_port,
            sync_port,
            threads,
            timeout_ms,
        } => serve(label, async_port, sync_port, threads, timeout_ms),
        Command::Send {
            host,
            async_port,
            sequence,
            message,
        } => {
            let mut client =
                MessageEndpointClient::new(host, async_port, 0, Duration::from_secs(5));
            client.send_sequenced(
                Codes::LOG,
                message.as_bytes(),
                sequence.unwrap_or(NO_SEQUENCE_NUM),
            )?;
            client.close()?;
            Ok(())
        }
        Command::Ping {
            host,
            sync_port,
            status,
            timeout_ms,
        } => ping(host, sync_port, status, Duration::from_millis(timeout_ms)),
    }
}

fn serve(
    label: String,
    async_port: u16,
    sync_port: u16,
    threads: Option<usize>,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let mut config = ServerConfig::from_env(label, async_port, sync_port)
        .context("Invalid server configuration")?;
    if let Some(threads) = threads {
        config = config.with_threads(threads);
    }
    if let Some(ms) = timeout_ms {
        config = config.with_timeout(Duration::from_millis(ms));
    }
    config.validate()?;

    info!("Starting taskwire node");
    info!("Configuration: {}", serde_json::to_string(&config)?);

    let mut server = MessageEndpointServer::new(config, NodeDispatch::default());
    server.start()?;

    // Print ports for wrapping scripts to read (intentional stdout)
    println!("ASYNC_PORT={}", server.async_port());
    println!("SYNC_PORT={}", server.sync_port());

    let (signal_tx, signal_rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = signal_tx.send(());
    })
    .context("Failed to install signal handler")?;

    signal_rx.recv().context("Signal handler dropped")?;
    info!("Shutdown signal received, stopping");

    server.stop()?;
    info!(
        "Final counters: {}",
        serde_json::to_string(&server.dispatch().status())?
    );
    Ok(())
}

fn ping(host: String, sync_port: u16, status: bool, timeout: Duration) -> Result<()> {
    let mut client = MessageEndpointClient::new(host, 0, sync_port, timeout);

    let reply = client.send_await_response(Codes::PING, b"PING")?;
    if &reply[..] != b"PONG" {
        bail!("Unexpected ping reply: {:?}", String::from_utf8_lossy(&reply));
    }
    println!("PONG");

    if status {
        let counters: NodeStatus = client.call_json(Codes::STATUS, &())?;
        println!("{}", serde_json::to_string_pretty(&counters)?);
    }

    client.close()?;
    Ok(())
}
