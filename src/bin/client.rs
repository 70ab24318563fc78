//! Voice chat client
//!
//! Joins a channel on the rendezvous server and talks to every other member
//! directly over UDP.
//!
//! ```text
//! voice-client                 prompt for a channel id
//! voice-client --channel 42    join channel 42
//! voice-client --list          list channels and exit
//! ```
//!
//! While a session runs, type `exit` to leave. Ctrl+C leaves and quits.

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use p2p_voice_chat::{
    audio::{DeviceCapture, DevicePlayback},
    config::AppConfig,
    rendezvous::{HttpRendezvous, Rendezvous},
    session::{AudioIo, Session, SessionEnd, StopSignal},
};

const STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// Peer-to-peer voice chat client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Channel to join (prompted for when omitted)
    #[arg(short, long)]
    channel: Option<u32>,

    /// Config file path (overrides platform default)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured username
    #[arg(short, long)]
    username: Option<String>,

    /// List channels and exit
    #[arg(long, default_value = "false")]
    list: bool,
}

/// Ctrl+C state shared between the signal handler and the prompt loop
#[derive(Default)]
struct Shutdown {
    interrupted: AtomicBool,
    notify: Notify,
    session: Mutex<Option<StopSignal>>,
}

impl Shutdown {
    fn trigger(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        if let Some(stop) = self.session.lock().as_ref() {
            stop.stop();
        }
        self.notify.notify_waiters();
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let path = match args.config.clone() {
        Some(path) => path,
        None => AppConfig::default_path().context("no config directory on this platform")?,
    };
    let mut config = AppConfig::load_or_create(&path, || prompt_blocking("Username: "))
        .with_context(|| format!("failed to load {}", path.display()))?;
    if let Some(username) = args.username.clone() {
        config.client.username = username;
        config.validate()?;
    }

    let default_level = if config.client.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rendezvous = Arc::new(HttpRendezvous::new(config.client.server_url()));
    tracing::debug!("Rendezvous server {}", rendezvous.base_url());

    if args.list {
        return list_channels(&*rendezvous).await;
    }

    let shutdown = Arc::new(Shutdown::default());
    ctrlc_handler(shutdown.clone());
    let mut lines = stdin_lines();
    let mut next_channel = args.channel;

    tracing::info!("Logged in as {}", config.client.username);

    loop {
        let channel_id = match next_channel.take() {
            Some(id) => id,
            None => match prompt_channel(&mut lines, &shutdown).await {
                Some(id) => id,
                None => break,
            },
        };

        let end = run_session(&config, rendezvous.clone(), channel_id, &mut lines, &shutdown).await;
        match end {
            Ok(Outcome::Quit) => break,
            Ok(Outcome::Removed) => {
                tracing::warn!("You were removed from channel {}", channel_id);
            }
            Err(e) => tracing::error!("{:#}", e),
        }

        if shutdown.is_interrupted() {
            break;
        }
    }

    tracing::info!("Bye");
    Ok(())
}

enum Outcome {
    /// Ctrl+C or `exit`
    Quit,
    Removed,
}

async fn run_session(
    config: &AppConfig,
    rendezvous: Arc<HttpRendezvous>,
    channel_id: u32,
    lines: &mut mpsc::UnboundedReceiver<String>,
    shutdown: &Shutdown,
) -> Result<Outcome> {
    let audio = AudioIo {
        capture: Box::new(DeviceCapture::open(
            &config.audio,
            config.network.recv_timeout(),
        )?),
        playback: Box::new(DevicePlayback::open(&config.audio)?),
    };

    let stop = StopSignal::new();
    *shutdown.session.lock() = Some(stop.clone());
    let session = Session::new(config.clone(), rendezvous, channel_id, stop.clone())?;
    tracing::info!("Joining channel {}", channel_id);

    let run = session.run(audio);
    tokio::pin!(run);
    let mut status = tokio::time::interval(STATUS_INTERVAL);
    status.tick().await;

    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            Some(line) = lines.recv() => match line.trim() {
                "exit" => {
                    tracing::info!("Leaving channel {}", channel_id);
                    stop.stop();
                }
                "" => {}
                other => tracing::error!("Unknown command: {}", other),
            },
            _ = status.tick() => {
                let s = session.status();
                tracing::info!(
                    "Members {} | connected {} | latency {:.1} ms | sent {} pkts | received {} pkts",
                    s.members,
                    s.connected,
                    s.latency_ms,
                    s.transport.packets_sent,
                    s.transport.packets_received
                );
            }
        }
    };
    shutdown.session.lock().take();

    match result? {
        SessionEnd::Removed => Ok(Outcome::Removed),
        SessionEnd::Stopped => Ok(Outcome::Quit),
    }
}

async fn list_channels<R: Rendezvous + ?Sized>(rendezvous: &R) -> Result<()> {
    let channels = rendezvous
        .list_channels()
        .await
        .context("failed to fetch channel list")?;

    if channels.is_empty() {
        println!("No channels");
    }
    for channel in channels {
        println!("{:>8}  {}  (by {})", channel.id, channel.name, channel.author);
    }
    Ok(())
}

/// Ask for a channel id until one parses. `None` on Ctrl+C or closed stdin.
async fn prompt_channel(
    lines: &mut mpsc::UnboundedReceiver<String>,
    shutdown: &Shutdown,
) -> Option<u32> {
    loop {
        if shutdown.is_interrupted() {
            return None;
        }
        print!("Channel ID: ");
        let _ = std::io::stdout().flush();

        let line = tokio::select! {
            line = lines.recv() => line?,
            _ = shutdown.notify.notified() => return None,
        };
        match line.trim().parse::<u32>() {
            Ok(id) => return Some(id),
            Err(_) => tracing::error!("Not a channel id: {}", line.trim()),
        }
    }
}

fn prompt_blocking(prompt: &str) -> std::io::Result<String> {
    print!("{}", prompt);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line)
}

/// Forward stdin lines from a dedicated thread
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    let spawned = std::thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        tracing::error!("Failed to read stdin: {}", e);
    }
    rx
}

/// Ctrl+C handler
fn ctrlc_handler(shutdown: Arc<Shutdown>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        tokio::spawn(async move {
            let mut sig = match signal(SignalKind::interrupt()) {
                Ok(sig) => sig,
                Err(e) => {
                    tracing::error!("Failed to install Ctrl+C handler: {}", e);
                    return;
                }
            };
            while sig.recv().await.is_some() {
                tracing::info!("Ctrl+C detected");
                shutdown.trigger();
            }
        });
    }

    #[cfg(windows)]
    {
        if let Err(e) = ctrlc::set_handler(move || shutdown.trigger()) {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    }
}
