//! Command line demo for the download engine
//!
//! ```text
//! stream-downloader <url> [dest-dir] [--hls] [--config <file>] [--blob <file>]
//! stream-downloader --resume <blob-file> [--config <file>]
//! ```
//!
//! Ctrl-C pauses the download and writes the resume blob.

use anyhow::{bail, Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use stream_downloader::utils::logging::init_tracing;
use stream_downloader::utils::validation::looks_like_playlist;
use stream_downloader::{
    ChannelListener, DownloadEvent, Downloader, DownloaderFactory, DownloaderKind, EngineConfig,
    Task,
};

struct Args {
    url: Option<String>,
    dest_dir: PathBuf,
    force_hls: bool,
    config: Option<PathBuf>,
    blob: Option<PathBuf>,
    resume: Option<PathBuf>,
}

fn usage() -> ! {
    eprintln!("Usage: stream-downloader <url> [dest-dir] [--hls] [--config <file>] [--blob <file>]");
    eprintln!("       stream-downloader --resume <blob-file> [--config <file>]");
    std::process::exit(1);
}

fn parse_args() -> Args {
    let mut args = Args {
        url: None,
        dest_dir: PathBuf::from("."),
        force_hls: false,
        config: None,
        blob: None,
        resume: None,
    };
    let mut positional = Vec::new();
    let mut iter = env::args().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--hls" => args.force_hls = true,
            "--config" => args.config = Some(iter.next().unwrap_or_else(|| usage()).into()),
            "--blob" => args.blob = Some(iter.next().unwrap_or_else(|| usage()).into()),
            "--resume" => args.resume = Some(iter.next().unwrap_or_else(|| usage()).into()),
            "-h" | "--help" => usage(),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    args.url = positional.next();
    if let Some(dir) = positional.next() {
        args.dest_dir = PathBuf::from(dir);
    }
    if args.url.is_none() && args.resume.is_none() {
        usage();
    }
    args
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load_from(path),
        None => EngineConfig::load_or_default(),
    }
}

fn build_downloader(args: &Args, factory: &DownloaderFactory) -> Result<Downloader> {
    if let Some(blob_path) = &args.resume {
        let blob = std::fs::read(blob_path)
            .with_context(|| format!("Failed to read resume blob {:?}", blob_path))?;
        return factory
            .load(&blob)
            .with_context(|| format!("{:?} is not a usable resume blob", blob_path));
    }

    let Some(url) = args.url.as_deref() else {
        bail!("no URL given");
    };
    let task = Task::new(url, url, &args.dest_dir);
    let is_playlist = url::Url::parse(url)
        .map(|parsed| looks_like_playlist(&parsed, None))
        .unwrap_or(false);
    let kind = if args.force_hls || is_playlist {
        DownloaderKind::Hls
    } else {
        DownloaderKind::MultiThread
    };

    let downloader = factory.create(kind, task)?;
    Ok(downloader)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = parse_args();

    let config = load_config(args.config.as_deref())?;
    let factory = DownloaderFactory::new(config).context("Failed to build downloader factory")?;
    let downloader = build_downloader(&args, &factory)?;

    let (listener, mut events) = ChannelListener::new();
    downloader.set_listener(Arc::new(listener));

    if args.resume.is_none() {
        downloader.create().await?;
    }

    let task = downloader.task();
    let blob_path = args
        .blob
        .clone()
        .or_else(|| args.resume.clone())
        .unwrap_or_else(|| task.destination_dir().join(format!("{}.sdlb", task.file_name())));

    downloader.start().await?;

    let mut pausing = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !pausing => {
                info!("Interrupted, pausing download");
                pausing = true;
                if let Err(e) = downloader.pause().await {
                    warn!("Pause failed: {}", e);
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    DownloadEvent::Created { info, .. } => {
                        info!("Resolved {} ({} bytes)", info.real_url, info.content_length);
                    }
                    DownloadEvent::Progress { total, downloaded, .. } => {
                        let speed = downloader.speed();
                        if total > 0 {
                            info!(
                                "{}/{} bytes ({:.1}%), {:.1} KiB/s",
                                downloaded,
                                total,
                                downloaded as f64 / total as f64 * 100.0,
                                speed.smoothed / 1024.0
                            );
                        } else {
                            info!("{} bytes, {:.1} KiB/s", downloaded, speed.smoothed / 1024.0);
                        }
                    }
                    DownloadEvent::Warning { code, message, .. } => warn!("{}: {}", code, message),
                    DownloadEvent::SaveInstance { blob, .. } => {
                        std::fs::write(&blob_path, &blob)
                            .with_context(|| format!("Failed to write resume blob {:?}", blob_path))?;
                        info!("Resume blob written to {:?}", blob_path);
                        if pausing {
                            break;
                        }
                    }
                    DownloadEvent::Completed { total, .. } => {
                        info!("Saved {} bytes to {:?}", total, task.destination_path());
                        if blob_path.exists() && args.blob.is_none() {
                            let _ = std::fs::remove_file(&blob_path);
                        }
                        break;
                    }
                    DownloadEvent::Error { code, message, .. } => {
                        error!("{}: {}", code, message);
                        bail!("download failed: {}", message);
                    }
                    _ => {}
                }
            }
        }
    }

    Ok(())
}
