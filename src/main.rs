use agentvox::connection::ReconnectPolicy;
use agentvox::session::Role;
use agentvox::{SessionConfig, VoiceSession};
use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Talk to a voice agent from the terminal
#[derive(Parser, Debug)]
#[command(name = "agentvox", version, about)]
struct Args {
    /// Agent to talk to, e.g. "sales"
    agent: String,

    /// Socket base URL
    #[arg(long, env = "AGENTVOX_WS_URL", default_value = agentvox::config::DEFAULT_SERVER_URL)]
    server_url: String,

    /// Microphone chunk length in milliseconds
    #[arg(long, default_value_t = 250)]
    chunk_ms: u64,

    /// Do not reopen the socket after it closes
    #[arg(long)]
    no_reconnect: bool,

    /// Exponential reconnect backoff, giving up after five attempts
    #[arg(long, conflicts_with = "no_reconnect")]
    standalone_backoff: bool,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        let reconnect = if self.no_reconnect {
            ReconnectPolicy::disabled()
        } else if self.standalone_backoff {
            ReconnectPolicy::standalone()
        } else {
            ReconnectPolicy::default()
        };

        SessionConfig::default()
            .with_server_url(self.server_url.clone())
            .with_chunk_interval(Duration::from_millis(self.chunk_ms))
            .with_reconnect(reconnect)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agentvox=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    info!("Starting agentvox for agent {}", args.agent);

    let session = VoiceSession::builder(args.agent.clone())
        .config(args.session_config())
        .build()
        .context("Failed to set up the voice session")?;

    session.start_session().await;
    println!("Press Enter to start or stop talking, q + Enter to quit.");

    let mut status = session.subscribe_status();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printed = 0;
    let mut meter = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = line.context("Failed to read stdin")?;
                match line.as_deref().map(str::trim) {
                    None | Some("q") | Some("quit") => break,
                    Some(_) if session.is_recording() => session.stop_recording(),
                    Some(_) => {
                        if let Err(e) = session.start_recording().await {
                            warn!("Cannot record: {}", e);
                            println!("{}", e.user_message());
                        }
                    }
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                println!("[{}]", current);
                if let Some(err) = session.error() {
                    println!("! {}", err.user_message());
                }
            }
            _ = meter.tick() => {
                if session.is_recording() {
                    let bars = (session.level() * 20.0).round() as usize;
                    println!("mic {:<20}|", "#".repeat(bars));
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }

        let messages = session.messages();
        for message in messages.iter().skip(printed) {
            let who = match message.role {
                Role::User => "you",
                Role::Agent => "agent",
            };
            println!("{}: {}", who, message.text);
        }
        printed = messages.len();
    }

    session.end_session().await;
    session.shutdown().await;
    info!("Goodbye");

    Ok(())
}
