//! # meetlink-loopback
//!
//! Runs a publisher with synthetic capture and codecs against a subscriber
//! in the same process, over a real transport, and reports what arrived.
//!
//! ```bash
//! # Stream transport on an ephemeral port, 5 seconds
//! meetlink-loopback
//!
//! # WebSocket transport, engine settings from a file
//! meetlink-loopback --transport socket --config meetlink.toml --duration 10
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use meetlink_engine::config::EngineConfig;
use meetlink_engine::media::synthetic::SyntheticDecoderFactory;
use meetlink_engine::mixer::AudioMixer;
use meetlink_engine::publisher::{MediaBackends, Publisher};
use meetlink_engine::registry::ChannelRegistry;
use meetlink_engine::session::TransportSession;
use meetlink_engine::subscriber::Subscriber;
use meetlink_engine::transport::datachannel::{fixed_signaling, loopback_pair, DataChannelConnector};
use meetlink_engine::transport::socket::{SocketConnector, SocketListener};
use meetlink_engine::transport::stream::{StreamConnector, StreamListener};
use meetlink_engine::transport::{Connector, TransportKind};
use meetlink_transport::wire::VideoTier;

/// Synthetic publisher → subscriber loopback.
#[derive(Parser, Debug)]
#[command(name = "meetlink-loopback", about = "Publish synthetic media to a local subscriber")]
struct Cli {
    /// Engine configuration (TOML). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Transport to use: stream, socket or data-channel.
    #[arg(long)]
    transport: Option<String>,

    /// Listen address for the subscriber side.
    #[arg(long, default_value = "127.0.0.1:0")]
    listen: String,

    /// Tier the subscriber starts on.
    #[arg(long)]
    tier: Option<VideoTier>,

    /// Seconds to run.
    #[arg(long, default_value_t = 5)]
    duration: u64,

    /// Stats log interval in milliseconds.
    #[arg(long, default_value_t = 1000)]
    stats_interval_ms: u64,
}

fn parse_kind(s: &str) -> anyhow::Result<TransportKind> {
    match s {
        "stream" => Ok(TransportKind::Stream),
        "socket" => Ok(TransportKind::Socket),
        "data-channel" => Ok(TransportKind::DataChannel),
        other => anyhow::bail!("unknown transport: {other}"),
    }
}

/// Publisher and subscriber connectors for a transport kind. The
/// subscriber side accepts; the publisher side dials.
async fn connectors(kind: TransportKind, listen: &str) -> anyhow::Result<(Arc<dyn Connector>, Arc<dyn Connector>)> {
    Ok(match kind {
        TransportKind::Stream => {
            let listener = StreamListener::bind(listen).await?;
            let addr = listener.local_addr();
            tracing::info!(%addr, "stream transport");
            (
                Arc::new(StreamConnector::new(addr.to_string())) as Arc<dyn Connector>,
                Arc::new(listener) as Arc<dyn Connector>,
            )
        }
        TransportKind::Socket => {
            let listener = SocketListener::bind(listen).await?;
            let url = format!("ws://{}", listener.local_addr()?);
            tracing::info!(%url, "socket transport");
            (
                Arc::new(SocketConnector::new(url)) as Arc<dyn Connector>,
                Arc::new(listener) as Arc<dyn Connector>,
            )
        }
        TransportKind::DataChannel => {
            let (a, b) = loopback_pair();
            tracing::info!("in-process data-channel transport");
            (
                Arc::new(DataChannelConnector::new(fixed_signaling(a))) as Arc<dyn Connector>,
                Arc::new(DataChannelConnector::new(fixed_signaling(b))) as Arc<dyn Connector>,
            )
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .compact()
        .init();

    let cli = Cli::parse();

    // ── Configuration ───────────────────────────────────────────
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            EngineConfig::from_toml_str(&text).map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    if let Some(kind) = &cli.transport {
        config.transport.kind = parse_kind(kind)?;
    }
    if let Some(tier) = cli.tier {
        config.subscriber.tier = tier;
    }

    tracing::info!(
        transport = %config.transport.kind,
        tiers = config.publisher.tiers.len(),
        subscriber_tier = %config.subscriber.tier,
        duration_s = cli.duration,
        "meetlink-loopback starting"
    );

    // ── Sessions ────────────────────────────────────────────────
    let (dial, accept) = connectors(config.transport.kind, &cli.listen).await?;
    let registry = || ChannelRegistry::new(config.backpressure, config.fec.policy.clone());
    let publisher = Publisher::new(
        config.publisher.clone(),
        TransportSession::new(dial, registry(), config.reconnect),
        MediaBackends::synthetic(),
    );
    let mixer = AudioMixer::new(48_000, 1);
    let subscriber = Subscriber::new(
        "loopback",
        config.subscriber.clone(),
        TransportSession::new(accept, registry(), config.reconnect),
        Arc::new(SyntheticDecoderFactory),
        Some(mixer.clone()),
    )
    .with_fec(config.fec.clone());

    let (sub_result, pub_result) = tokio::join!(subscriber.start(), publisher.start());
    sub_result.context("subscriber start")?;
    pub_result.context("publisher start")?;
    let mut video = subscriber
        .take_video_output()
        .context("video output already taken")?;

    // ── Run ─────────────────────────────────────────────────────
    let mut frames_out: u64 = 0;
    let mut last_ts: Option<u32> = None;
    let mut out_of_order: u64 = 0;
    let mut audio_tick = tokio::time::interval(Duration::from_millis(20));
    let mut stats_tick = tokio::time::interval(Duration::from_millis(cli.stats_interval_ms.max(100)));
    let deadline = tokio::time::sleep(Duration::from_secs(cli.duration));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down...");
                break;
            }
            frame = video.recv() => {
                let Some(frame) = frame else { break };
                frames_out += 1;
                if last_ts.is_some_and(|t| frame.frame.timestamp_us < t) {
                    out_of_order += 1;
                }
                last_ts = Some(frame.frame.timestamp_us);
            }
            _ = audio_tick.tick() => {
                // Stand-in audio sink: 20 ms per tick.
                mixer.output(960);
            }
            _ = stats_tick.tick() => {
                let tx = publisher.stats();
                let rx = subscriber.stats();
                tracing::info!(
                    encoded = tx.frames_encoded,
                    dropped = tx.frames_dropped_backpressure,
                    audio_chunks = tx.audio_chunks,
                    received = rx.packets_received,
                    decoded = rx.frames_decoded,
                    shown = frames_out,
                    loss = format!("{:.3}", rx.loss_rate()),
                    "stats"
                );
            }
        }
    }

    // ── Shutdown ────────────────────────────────────────────────
    publisher.stop().await;
    subscriber.stop().await;

    let tx = publisher.stats();
    let rx = subscriber.stats();
    tracing::info!(
        frames_encoded = tx.frames_encoded,
        key_frames = tx.key_frames,
        packets_received = rx.packets_received,
        frames_decoded = rx.frames_decoded,
        frames_shown = frames_out,
        out_of_order,
        fec_recovered = rx.fec_recovered,
        gaps = rx.gaps,
        mixer_clock_ms = mixer.clock_us() / 1000,
        "meetlink-loopback finished"
    );
    println!("{}", serde_json::to_string_pretty(&serde_json::json!({
        "publisher": tx,
        "subscriber": rx,
        "frames_shown": frames_out,
    }))?);
    Ok(())
}
