//! # nexus-voicectl
//!
//! Small companion binary for the voice client:
//! - `presence`: connect to signaling and watch who sits in which voice channel
//! - `config`: print the effective configuration
//! - `volume`: read or write the stored per-user volumes

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use nexus_common::config::VoiceClientConfig;
use nexus_voice::prefs::{JsonFilePreferences, PreferenceStore};
use nexus_voice::retry::RetryPolicy;
use nexus_voice::signaling::SignalingChannel;
use nexus_voice::{RoomPresence, WsSignaling};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "nexus-voicectl", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watch voice-channel presence without joining a call.
    Presence {
        /// Only report this channel.
        #[arg(long)]
        channel: Option<Uuid>,
        /// Seconds between reports.
        #[arg(long, default_value_t = 10)]
        interval: u64,
    },
    /// Print the effective configuration as JSON.
    Config,
    /// Read or set the stored volume for a user.
    Volume {
        user: String,
        /// New volume, 0-100. Prints the stored value when omitted.
        value: Option<u8>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = nexus_common::config::init()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nexus_voice=debug,nexus_voicectl=info".into()),
        )
        .with_target(true)
        .init();

    match Cli::parse().command {
        Command::Presence { channel, interval } => watch_presence(config, channel, interval).await,
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(config)?);
            Ok(())
        }
        Command::Volume { user, value } => volume(config, &user, value),
    }
}

async fn watch_presence(
    config: &VoiceClientConfig,
    channel: Option<Uuid>,
    interval: u64,
) -> anyhow::Result<()> {
    tracing::info!("🎙️  nexus-voicectl v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(url = %config.signaling.url, "Connecting to voice signaling");

    let signaling: Arc<dyn SignalingChannel> = Arc::new(WsSignaling::connect(
        config.signaling.url.clone(),
        RetryPolicy::from_config(&config.signaling.reconnect),
    ));
    let presence = RoomPresence::new();
    let cancel = CancellationToken::new();
    let listener = presence.spawn_listener(signaling.clone(), cancel.clone());

    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => report(&presence, signaling.as_ref(), channel).await,
        }
    }

    tracing::info!("Shutting down");
    cancel.cancel();
    listener.await?;
    Ok(())
}

async fn report(presence: &RoomPresence, signaling: &dyn SignalingChannel, channel: Option<Uuid>) {
    if !signaling.is_connected() {
        tracing::warn!("Signaling not connected; presence may be stale");
    }
    let channels = match channel {
        Some(id) => vec![(id, presence.channel_count(id).await)],
        None => presence.channels().await,
    };
    if channels.is_empty() {
        tracing::info!("No active voice channels");
    }
    for (channel_id, count) in channels {
        let members = presence.channel_members(channel_id).await;
        let names: Vec<String> = members
            .iter()
            .map(|m| {
                let mut name = m.user_name.clone();
                if m.is_muted {
                    name.push_str(" (muted)");
                }
                if m.is_speaking {
                    name.push_str(" (speaking)");
                }
                name
            })
            .collect();
        tracing::info!(channel = %channel_id, count, members = ?names, "Voice channel");
    }
}

fn volume(config: &VoiceClientConfig, user: &str, value: Option<u8>) -> anyhow::Result<()> {
    let Some(path) = config.preferences.path.as_deref() else {
        anyhow::bail!("no preferences file configured (set NEXUS_VOICE__PREFERENCES__PATH)");
    };
    let store = JsonFilePreferences::open(path)?;
    match value {
        Some(volume) => {
            store.set_volume(user, volume)?;
            tracing::info!(user, volume = volume.min(100), "Volume stored");
        }
        None => println!("{}", store.volume_or_default(user)),
    }
    Ok(())
}
