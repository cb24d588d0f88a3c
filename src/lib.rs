//! Stream Downloader - Core Library
//!
//! A resumable download engine: it sniffs a URL, picks a ranged multi-worker
//! or HLS segment strategy, streams data to disk concurrently, reports
//! progress and speed, and serializes its state into a blob from which the
//! download can later resume exactly where it stopped.

pub mod core;
pub mod parsers;
pub mod utils;

// Re-export commonly used types
pub use core::{
    config::EngineConfig,
    downloader::{Downloader, DownloaderSeed},
    error_handling::{EngineError, ErrorCode, RetryPolicy},
    factory::DownloaderFactory,
    listener::{ChannelListener, DownloadEvent, DownloadListener, LoggingListener},
    models::{
        DownloadState, DownloaderKind, Phase, Segment, SegmentDescriptor, SegmentState,
        SnifferInfo, Task,
    },
    persistence::PersistenceCodec,
    progress_tracker::SpeedReading,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialize logging with default settings
pub fn init() {
    utils::logging::init_tracing();
    tracing::info!("{} v{} initialized", NAME, VERSION);
}
