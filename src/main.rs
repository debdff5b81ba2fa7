use anyhow::Result;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use m3u_validator::{
    config::Config,
    ingestor::{IngestionPipeline, PlaylistCache},
    models::ValidationReport,
    playback::{FailoverSettings, PlaybackSession, PlaybackState, ProbeMediaBackend},
    utils::url::UrlUtils,
    validator::{probe_from_config, ValidationOptions, ValidationTargets, Validator},
};

#[derive(Parser)]
#[command(name = "m3u-validator")]
#[command(version = "0.1.0")]
#[command(about = "Ingest an M3U playlist, validate its streams and play channels with failover")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Playlist URL (overrides config file)
    #[arg(short, long, value_name = "URL")]
    source_url: Option<String>,

    /// Maximum probes in flight (overrides config file)
    #[arg(long, value_name = "N")]
    concurrency: Option<usize>,

    /// Per-probe timeout in milliseconds (overrides config file)
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List merged channels with their candidate counts
    Channels {
        /// Only channels in this category
        #[arg(long)]
        category: Option<String>,

        /// Only channels for this country code (e.g. CN)
        #[arg(long)]
        country: Option<String>,
    },
    /// Write the merged channels.json and streams.json
    Export {
        /// Output directory
        #[arg(short, long, value_name = "DIR", default_value = ".")]
        dir: PathBuf,
    },
    /// Probe every channel and write a JSON report
    Validate {
        /// Probe every stream on its own instead of per channel
        #[arg(long)]
        flat: bool,

        /// Keep probing a channel's candidates after one succeeds
        #[arg(long)]
        all_candidates: bool,

        /// Report path (defaults to stream-validation-YYYY-MM-DD.json)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Play a channel, failing over between its candidates
    Play {
        /// Channel display name
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("m3u_validator={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting M3U Validator v{}", env!("CARGO_PKG_VERSION"));

    std::env::set_var("CONFIG_FILE", &cli.config);
    let mut config = Config::load()?;
    info!("Configuration loaded from: {}", cli.config);

    if let Some(url) = cli.source_url {
        config.source.url = url;
    }
    if let Some(concurrency) = cli.concurrency {
        config.validation.concurrency = concurrency;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.validation.timeout_ms = timeout_ms;
    }
    config.validate()?;

    info!(
        "Using playlist source: {}",
        UrlUtils::obfuscate_credentials(&config.source.url)
    );

    let pipeline = IngestionPipeline::from_config(&config)?;
    let mut cache = PlaylistCache::new(config.source.cache_ttl());
    let playlist = pipeline.load(&mut cache).await?;

    match cli.command {
        Commands::Channels { category, country } => {
            let mut shown = 0usize;
            for (channel, candidates) in
                playlist.filter_channels(category.as_deref(), country.as_deref())
            {
                let categories: Vec<&str> = channel.categories.iter().map(String::as_str).collect();
                println!(
                    "{}\t[{}]\t{} source(s)",
                    channel.name,
                    categories.join(", "),
                    candidates.len()
                );
                shown += 1;
            }
            info!(
                "Listed {} of {} channels ({} streams)",
                shown,
                playlist.index.channel_count(),
                playlist.index.stream_count()
            );
        }
        Commands::Export { dir } => {
            let (channels_path, streams_path) = playlist.write_json(&dir).await?;
            info!(
                "Wrote {} and {}",
                channels_path.display(),
                streams_path.display()
            );
        }
        Commands::Validate {
            flat,
            all_candidates,
            output,
        } => {
            let cancel = CancellationToken::new();
            spawn_ct_watcher(cancel.clone());

            let names: Arc<HashMap<String, String>> = Arc::new(
                playlist
                    .channels
                    .iter()
                    .map(|c| (c.id.clone(), c.name.clone()))
                    .collect(),
            );
            let log_interval = config.validation.progress_log_interval.max(1);

            let options = ValidationOptions::from_config(&config.validation)
                .with_probe_all_candidates(all_candidates || config.validation.probe_all_candidates)
                .with_cancellation(cancel.clone())
                .on_progress(move |completed, total| {
                    if completed % log_interval == 0 || completed == total {
                        info!("Progress: {}/{}", completed, total);
                    }
                })
                .on_channel_playable(move |channel_id| {
                    let name = names.get(channel_id).map(String::as_str).unwrap_or(channel_id);
                    info!("Playable: {}", name);
                });

            let grouped = config.validation.grouped && !flat;
            let targets = ValidationTargets::from_index(&playlist.index, grouped);
            let validator = Validator::new(probe_from_config(&config)?);
            let results = validator.validate(targets, options).await;

            let report = ValidationReport::from_results(&results);
            let path = output.unwrap_or_else(|| PathBuf::from(report.default_file_name()));
            report.write_to(&path).await?;

            if cancel.is_cancelled() {
                warn!("Validation was interrupted; report is partial");
            }
            info!(
                "{} of {} playable, report written to {}",
                report.success_count,
                report.total,
                path.display()
            );
        }
        Commands::Play { name } => {
            let (channel, candidates) = playlist.playback_candidates(&name)?;
            info!("Playing '{}' with {} candidates", channel.name, candidates.len());

            let backend = Arc::new(ProbeMediaBackend::new(probe_from_config(&config)?));
            let session = PlaybackSession::start(
                backend,
                FailoverSettings::from_config(&config.playback),
                candidates,
            );
            let handle = session.handle();

            let reached = tokio::select! {
                state = handle.wait_for(|s| s.is_playing() || s.is_terminal()) => state,
                _ = tokio::signal::ctrl_c() => {
                    info!("Caught CTRL+C signal!");
                    handle.state()
                }
            };

            let outcome = session.stop().await?;
            for state in &outcome.transitions {
                info!("  {}", state);
            }
            match reached {
                PlaybackState::Playing { index, .. } => {
                    info!("'{}' is playable from candidate #{}", channel.name, index);
                }
                PlaybackState::Exhausted => {
                    warn!("No candidate of '{}' could be played", channel.name);
                    if let Some(url) = outcome.fallback_url {
                        println!("{}", url);
                    }
                }
                other => info!("Stopped while {}", other),
            }
        }
    }

    Ok(())
}

fn spawn_ct_watcher(ct: CancellationToken) {
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Caught CTRL+C signal!");
        ct.cancel();
    });
}
