//! Floorlink CLI - tail a machine channel or a schedule board from a
//! terminal.
//!
//! This is a thin diagnostic surface over the `floorlink` library: it
//! connects, prints state transitions, notifications, and snapshot
//! summaries, and forwards a command once if asked. See the library
//! for the actual channel machinery.

use anyhow::Result;
use clap::{Parser, Subcommand};
use floorlink::{
    ChannelConfig, ChannelEvent, ConnectionState, DocumentSubscription, MachineChannel, SyncEvent,
};

#[derive(Parser)]
#[command(name = "floorlink", version, about = "Shop-floor channel diagnostics")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to a machine endpoint and print everything it reports.
    Watch {
        /// Machine WebSocket URL (ws://, wss://, or http(s):// to convert).
        url: String,
        /// Optional command to send once the channel opens, as
        /// `type:json-payload` (e.g. `jog:{"axis":"x","mm":5}`).
        #[arg(long)]
        send: Option<String>,
    },
    /// Subscribe to a schedule board document and print sync events.
    Board {
        /// Board stream WebSocket URL.
        url: String,
        /// Document id to follow.
        document_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Watch { url, send } => watch_machine(&url, send.as_deref()).await,
        Command::Board { url, document_id } => watch_board(&url, &document_id).await,
    }
}

async fn watch_machine(url: &str, send: Option<&str>) -> Result<()> {
    let config = ChannelConfig::new(floorlink::ws::http_to_ws_scheme(url));
    let (channel, mut events) = MachineChannel::connect(config);
    let mut state_rx = channel.watch_state();
    let mut snapshot_rx = channel.watch_snapshot();
    let mut pending_send = send.map(parse_send).transpose()?;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                print_channel_event(&event);
                if let ChannelEvent::Connected { .. } = event {
                    if let Some((kind, payload)) = pending_send.take() {
                        channel.send(&kind, &payload)?;
                        println!("sent {kind}");
                    }
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = state_rx.borrow().clone();
                println!("state: {state:?}");
                if state == ConnectionState::Failed {
                    println!("(run again or press Ctrl-C; automatic retries exhausted)");
                }
            }
            changed = snapshot_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshot_rx.borrow().clone();
                println!(
                    "snapshot: capturing={} analyzing={} eject={:?} image={:?}",
                    snapshot.is_capturing,
                    snapshot.is_analyzing,
                    snapshot.ejection_decision,
                    snapshot.image.as_ref().map(|i| i.seq),
                );
            }
            _ = tokio::signal::ctrl_c() => {
                channel.close();
                break;
            }
        }
    }
    Ok(())
}

async fn watch_board(url: &str, document_id: &str) -> Result<()> {
    let config = ChannelConfig::new(floorlink::ws::http_to_ws_scheme(url));
    let (subscription, mut events) = DocumentSubscription::subscribe(config, document_id);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SyncEvent::Updated(document) => println!("document: {document}"),
                    SyncEvent::Deleted => println!("document deleted"),
                    other => println!("{other:?}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                subscription.close();
                break;
            }
        }
    }
    Ok(())
}

fn parse_send(raw: &str) -> Result<(String, serde_json::Value)> {
    let (kind, payload) = raw
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected type:json-payload, got '{raw}'"))?;
    let payload = serde_json::from_str(payload)
        .map_err(|e| anyhow::anyhow!("bad payload JSON: {e}"))?;
    Ok((kind.to_string(), payload))
}

fn print_channel_event(event: &ChannelEvent) {
    match event {
        ChannelEvent::Connected { recovered: true } => println!("reconnected"),
        ChannelEvent::Connected { recovered: false } => println!("connected"),
        ChannelEvent::Reconnecting {
            attempt,
            max_attempts,
            delay,
        } => println!("reconnecting {attempt}/{max_attempts} in {delay:?}"),
        ChannelEvent::Closed { code, reason } => println!("closed ({code}) {reason}"),
        ChannelEvent::Fatal { attempts } => {
            println!("gave up after {attempts} attempts; manual reconnect required");
        }
        ChannelEvent::Log { severity, message } => println!("[{severity}] {message}"),
        ChannelEvent::Alert { severity, message } => println!("ALERT [{severity}] {message}"),
    }
}
