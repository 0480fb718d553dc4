use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use termtunes::downloader::cache::ContentCache;
use termtunes::downloader::http_pool::HttpPool;
use termtunes::downloader::manager::DownloadManager;
use termtunes::downloader::strategies::{CompositeResolver, FileResolver, HttpResolver, YtDlpResolver};
use termtunes::downloader::Resolver;
use termtunes::player::output::default_sink_factory;
use termtunes::player::{spawn_player, PlayerHandle, PlayerSettings, SymphoniaBackend};
use termtunes::utils::{format_duration_ms, format_file_size};
use termtunes::{AppConfig, PlaylistCommand, PlaylistManager, SourceRef, TrackInfo};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "termtunes", version, about = "Terminal music client")]
struct Cli {
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Play URLs, local files or search queries
    Play {
        #[arg(required = true)]
        sources: Vec<String>,
        #[arg(long)]
        shuffle: bool,
        #[arg(long)]
        repeat: bool,
    },
    /// Inspect or maintain the audio cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    Stats,
    Sweep,
    Clear,
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    /// Write the effective configuration to disk
    Init,
}

const HELP: &str = "n next | p previous | space/pause toggle | + - volume | > < seek | seek <secs> | \
s shuffle | add <source> | rm <index> | ls | st | q";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path).with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::load().context("loading the default config")?,
    };

    match cli.command {
        Command::Play {
            sources,
            shuffle,
            repeat,
        } => {
            let mut config = config;
            config.repeat |= repeat;
            play(config, sources, shuffle).await
        }
        Command::Cache { action } => cache_command(&config, action).await,
        Command::Config { action } => {
            match action {
                ConfigAction::Show => println!("{}", serde_json::to_string_pretty(&config)?),
                ConfigAction::Init => {
                    let written = match &cli.config {
                        Some(path) => {
                            config.save_to(path)?;
                            path.clone()
                        }
                        None => {
                            config.save()?;
                            AppConfig::get_config_path()?
                        }
                    };
                    println!("Wrote {}", written.display());
                }
            }
            Ok(())
        }
    }
}

async fn cache_command(config: &AppConfig, action: CacheAction) -> anyhow::Result<()> {
    let cache = ContentCache::open(config.cache_dir.clone(), config.cache_quota_bytes()).await?;
    match action {
        CacheAction::Stats => {
            let stats = cache.stats().await;
            println!(
                "{} entries, {} of {} ({} pinned)",
                stats.entries,
                format_file_size(stats.total_bytes),
                format_file_size(stats.quota_bytes),
                stats.pinned
            );
            for entry in cache.entries().await {
                println!(
                    "  {:<28} {:>10}  {}",
                    entry.key,
                    format_file_size(entry.size_bytes),
                    entry.last_accessed_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        CacheAction::Sweep => {
            let report = cache.sweep().await?;
            println!(
                "Removed {} stale entries and {} stray files",
                report.removed_entries, report.removed_files
            );
        }
        CacheAction::Clear => {
            let removed = cache.clear().await?;
            println!("Removed {} entries", removed);
        }
    }
    Ok(())
}

async fn play(config: AppConfig, sources: Vec<String>, shuffle: bool) -> anyhow::Result<()> {
    info!("🎵 Starting termtunes");
    let shutdown = CancellationToken::new();

    let mut pool = HttpPool::new(config.max_concurrent_downloads, config.download_timeout())?;
    if let Some(proxy_url) = &config.proxy {
        info!("Setting up proxy: {}", proxy_url);
        pool = pool.with_proxy(proxy_url)?;
    }
    let pool = Arc::new(pool);
    let resolvers: Vec<Arc<dyn Resolver>> = vec![
        Arc::new(FileResolver::new()),
        Arc::new(HttpResolver::new(pool.clone())),
        Arc::new(YtDlpResolver::new(config.ytdlp_path.clone(), pool)),
    ];
    let resolver = Arc::new(CompositeResolver::new(resolvers));

    let cache = ContentCache::open(config.cache_dir.clone(), config.cache_quota_bytes()).await?;
    let cleanup = cache.spawn_cleanup(config.cleanup_interval(), shutdown.clone());
    let downloads = DownloadManager::new(&config, cache.clone(), resolver);

    let backend = Arc::new(SymphoniaBackend::new(
        default_sink_factory(),
        config.sample_rate,
        config.buffer_frames,
    ));
    let (player, player_task) = spawn_player(PlayerSettings::from(&config), cache, backend);

    let tracks = sources
        .iter()
        .map(|s| TrackInfo::from_source(SourceRef::parse(s)))
        .collect();
    let mut manager = PlaylistManager::new(&config, tracks, player.clone(), downloads.clone());
    if shuffle {
        manager.toggle_shuffle().await;
    }
    if let Err(e) = manager.next().await {
        log::error!("❌ Could not start playback: {}", e);
    }

    let (commands, rx) = mpsc::channel(32);
    let playlist_task = tokio::spawn(manager.run(rx));

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match handle_line(line.trim_end_matches('\r'), &player, &commands).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("{}", e),
        }
    }

    let _ = commands.send(PlaylistCommand::Shutdown).await;
    let _ = playlist_task.await;
    if let Err(e) = player.shutdown().await {
        log::debug!("Player already stopped: {}", e);
    }
    let _ = player_task.await;
    downloads.shutdown().await;
    shutdown.cancel();
    let _ = cleanup.await;
    info!("👋 Bye");
    Ok(())
}

/// Returns `false` when the user asked to quit.
async fn handle_line(
    line: &str,
    player: &PlayerHandle,
    commands: &mpsc::Sender<PlaylistCommand>,
) -> anyhow::Result<bool> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        if line.contains(' ') {
            player.toggle_pause().await?;
        }
        return Ok(true);
    }
    let (word, arg) = trimmed
        .split_once(' ')
        .map(|(word, arg)| (word, arg.trim()))
        .unwrap_or((trimmed, ""));
    let send = |command: PlaylistCommand| async move {
        commands
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("playlist is not running"))
    };

    match word {
        "n" => send(PlaylistCommand::Next).await?,
        "p" => send(PlaylistCommand::Previous).await?,
        "pause" => player.toggle_pause().await?,
        "+" => player.volume_up().await?,
        "-" => player.volume_down().await?,
        ">" => player.seek_forward().await?,
        "<" => player.seek_backward().await?,
        "seek" => {
            let secs: f64 = arg.parse().context("seek takes a number of seconds")?;
            player.seek((secs.max(0.0) * 1000.0) as u64).await?;
        }
        "s" => send(PlaylistCommand::ToggleShuffle).await?,
        "add" if !arg.is_empty() => {
            send(PlaylistCommand::Add(TrackInfo::from_source(SourceRef::parse(arg)))).await?
        }
        "rm" => {
            let index: usize = arg.parse().context("rm takes a playlist index")?;
            send(PlaylistCommand::Remove(index)).await?;
        }
        "ls" => {
            let (reply, response) = oneshot::channel();
            send(PlaylistCommand::Snapshot(reply)).await?;
            let snapshot = response.await?;
            for (i, track) in snapshot.tracks.iter().enumerate() {
                let marker = if snapshot.current_index == Some(i) { '>' } else { ' ' };
                println!("{} {:>3} {}", marker, i, track.display_name());
            }
            println!(
                "shuffle {} | repeat {}",
                if snapshot.shuffle_enabled { "on" } else { "off" },
                if snapshot.repeat { "on" } else { "off" }
            );
        }
        "st" => {
            let state = player.snapshot();
            println!(
                "{} {} {}/{} vol {:.0}%",
                state.status.as_str(),
                state.current_track_id.as_deref().unwrap_or("-"),
                format_duration_ms(state.position_ms),
                format_duration_ms(state.duration_ms),
                state.volume * 100.0
            );
        }
        "q" | "quit" => return Ok(false),
        _ => println!("{}", HELP),
    }
    Ok(true)
}
