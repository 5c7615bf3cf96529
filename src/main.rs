//! lexaudio - play an article's audio commentary from a catalog
//!
//! Loads settings, opens the default output device, warms the cache around
//! the chosen article and plays it through a focus-mode surface until it
//! ends or Ctrl+C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use lexaudio::audio::{PlaybackNotification, PlayerSurface, Visualizer};
use lexaudio::{Catalog, PlaybackCoordinator, PreloadCache, RodioBackend, Settings};

/// Command-line arguments for lexaudio
#[derive(Parser, Debug)]
#[command(name = "lexaudio")]
#[command(about = "Play article audio commentary")]
#[command(version)]
struct Args {
    /// JSON catalog of articles in reading order
    #[arg(short, long)]
    catalog: PathBuf,

    /// Id of the article to play
    #[arg(short, long)]
    article: String,

    /// Output volume, 0.0 to 1.0
    #[arg(long)]
    volume: Option<f32>,

    /// Keep --volume as the default for later runs
    #[arg(long, requires = "volume")]
    remember: bool,

    /// Settings file (defaults to the platform config directory)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Print spectrum bars while playing
    #[arg(long)]
    visualize: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let mut settings = match &args.settings {
        Some(path) => Settings::load_from_file(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => Settings::load(),
    };
    if let (Some(volume), true) = (args.volume, args.remember) {
        settings.playback.initial_volume = volume.clamp(0.0, 1.0);
        let saved = match &args.settings {
            Some(path) => settings.save_to_file(path),
            None => settings.save(),
        };
        if let Err(e) = saved {
            warn!("Could not save settings: {}", e);
        }
    }

    let catalog = Catalog::load_from_file(&args.catalog)
        .with_context(|| format!("Failed to load catalog {}", args.catalog.display()))?;
    let article = catalog
        .get(&args.article)
        .cloned()
        .with_context(|| format!("Article {} is not in the catalog", args.article))?;
    info!("Loaded {} articles", catalog.len());

    let backend = RodioBackend::open(&settings).context("Failed to open audio output")?;
    let cache = PreloadCache::new(Arc::new(backend), settings.preload.clone());
    let coordinator = PlaybackCoordinator::new(cache.clone(), settings.playback.clone());
    if let Some(volume) = args.volume {
        coordinator.set_volume(volume);
    }

    let _warmup = cache.preload_proximity(&article.article_id, &catalog.url_map());

    let mut notifications = coordinator.notifications();
    let player = PlayerSurface::focus(&coordinator, article.clone());
    let mut visualizer = args
        .visualize
        .then(|| Visualizer::new(&coordinator, settings.visualizer.clone()));

    player
        .toggle()
        .await
        .with_context(|| format!("Could not play {}", article.article_id))?;

    let mut report = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                coordinator.stop_audio();
                break;
            }
            notification = notifications.recv() => match notification {
                Ok(PlaybackNotification::AudioEnded { article_id }) if article_id == article.article_id => {
                    info!("Finished {}", article_id);
                    break;
                }
                Ok(PlaybackNotification::Failed { error, .. }) => {
                    cache.clear();
                    let notice = error.notice();
                    return Err(error).context(notice);
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            _ = report.tick() => {
                let view = player.view();
                if view.is_playing {
                    info!(
                        "{} {:>5.1}% ({}s / {}s)",
                        article.article_id,
                        view.progress,
                        view.position.as_secs(),
                        view.duration.map(|d| d.as_secs()).unwrap_or_default()
                    );
                }
                if let Some(visualizer) = visualizer.as_mut() {
                    println!("{}", render_bars(&visualizer.frame().bars));
                }
            }
        }
    }

    cache.clear();
    Ok(())
}

fn render_bars(bars: &[f32]) -> String {
    const LEVELS: [char; 9] = [' ', '▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];
    bars.iter()
        .map(|bar| LEVELS[(bar.clamp(0.0, 1.0) * 8.0).round() as usize])
        .collect()
}
