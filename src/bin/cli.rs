//! CLI binary for halo.

use anyhow::Context;
use clap::{Parser, Subcommand};
use halo::audio::{AudioBackend, CpalBackend};
use halo::session::WebSocketTransport;
use halo::tools::executor_from_config;
use halo::{AssistantCoordinator, HaloConfig, SessionState, TranscriptEntry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How long `halo text` waits for the model to finish answering.
const TEXT_REPLY_TIMEOUT: Duration = Duration::from_secs(60);

/// Halo: realtime voice and vision assistant.
#[derive(Parser)]
#[command(name = "halo", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Start a live voice conversation.
    Chat,

    /// List available audio devices.
    Devices,

    /// Send one text message and print the reply.
    Text {
        /// Message to send.
        message: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so the transcript on stdout stays clean.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("halo=info,tungstenite=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => HaloConfig::from_file(path)?,
        None => {
            let path = HaloConfig::default_config_path();
            if path.exists() {
                HaloConfig::from_file(&path)?
            } else {
                HaloConfig::default()
            }
        }
    };

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => run_chat(config).await,
        Command::Devices => list_devices(),
        Command::Text { message } => run_text(config, message).await,
    }
}

fn build_assistant(config: HaloConfig) -> anyhow::Result<AssistantCoordinator> {
    config.validate().context("invalid configuration")?;
    let executor = executor_from_config(&config.executor)?;
    Ok(AssistantCoordinator::new(
        config,
        Arc::new(WebSocketTransport::new()),
        Arc::new(CpalBackend),
        executor,
    ))
}

async fn connect(assistant: &AssistantCoordinator) -> anyhow::Result<()> {
    let mut state = assistant.subscribe_state();
    assistant.connect().await?;
    let reached = state
        .wait_for(|s| matches!(s, SessionState::Connected | SessionState::Error))
        .await
        .map(|s| *s)
        .context("session dropped during connect")?;
    if reached == SessionState::Error {
        anyhow::bail!("could not open session");
    }
    info!(session_id = %assistant.session_id(), "session connected");
    Ok(())
}

async fn run_chat(config: HaloConfig) -> anyhow::Result<()> {
    println!("Halo v{}", env!("CARGO_PKG_VERSION"));

    let assistant = build_assistant(config)?;
    connect(&assistant).await?;
    if let Err(e) = assistant.start_recording().await {
        warn!("microphone unavailable, continuing with text only: {e}");
    }
    println!("\nListening. Speak, or type a message and press Enter. Ctrl+C to stop.\n");

    let mut transcript = assistant.subscribe_transcript();
    let mut state = assistant.subscribe_state();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut printed = 0;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("received Ctrl+C, shutting down");
                break;
            }
            changed = transcript.changed() => {
                if changed.is_err() {
                    break;
                }
                print_finalized(&transcript.borrow_and_update(), &mut printed);
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let text = line.trim();
                    if !text.is_empty()
                        && let Err(e) = assistant.send_text(text).await
                    {
                        warn!("message not sent: {e}");
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("stdin closed: {e}");
                    stdin_open = false;
                }
            },
            changed = state.changed() => {
                if changed.is_err() || state.borrow_and_update().is_terminal() {
                    println!("\nSession ended.");
                    break;
                }
            }
        }
    }

    assistant.shutdown().await;
    Ok(())
}

async fn run_text(config: HaloConfig, message: String) -> anyhow::Result<()> {
    let assistant = build_assistant(config)?;
    connect(&assistant).await?;

    let mut transcript = assistant.subscribe_transcript();
    assistant.send_text(message).await?;

    let mut printed = 0;
    let reply = tokio::time::timeout(
        TEXT_REPLY_TIMEOUT,
        wait_for_reply(&mut transcript, &mut printed),
    )
    .await;
    assistant.shutdown().await;
    reply.context("timed out waiting for a reply")?
}

/// Print entries until a finalized assistant entry shows up.
async fn wait_for_reply(
    transcript: &mut watch::Receiver<Vec<TranscriptEntry>>,
    printed: &mut usize,
) -> anyhow::Result<()> {
    loop {
        transcript
            .changed()
            .await
            .context("assistant stopped before replying")?;
        let entries = transcript.borrow_and_update().clone();
        let before = *printed;
        print_finalized(&entries, printed);
        let replied = entries[before..*printed]
            .iter()
            .any(|e| e.role == halo::Role::Assistant);
        if replied {
            return Ok(());
        }
    }
}

/// Print finalized entries past `printed`, stopping at the first live one.
fn print_finalized(entries: &[TranscriptEntry], printed: &mut usize) {
    for entry in entries.iter().skip(*printed) {
        if !entry.finalized {
            break;
        }
        println!("[{}] {}", entry.role.as_str(), entry.text);
        *printed += 1;
    }
}

fn list_devices() -> anyhow::Result<()> {
    let backend = CpalBackend;
    println!("Input devices:");
    for name in backend.input_devices()? {
        println!("  {name}");
    }
    println!("\nOutput devices:");
    for name in backend.output_devices()? {
        println!("  {name}");
    }
    Ok(())
}
