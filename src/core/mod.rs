//! Core engine modules
//!
//! Domain models, sniffing, segment scheduling, progress aggregation,
//! persistence and the downloader state machine.

pub mod bandwidth;
pub mod config;
pub mod downloader;
pub mod error_handling;
pub mod factory;
pub mod hls_scheduler;
pub mod listener;
pub mod models;
pub mod persistence;
pub mod progress_tracker;
pub mod range_scheduler;
pub mod scheduler;
pub mod sniffer;

#[cfg(test)]
mod test_support;



// Re-export commonly used types
pub use config::EngineConfig;
pub use downloader::{Downloader, DownloaderSeed};
pub use error_handling::{EngineError, ErrorCode};
pub use factory::DownloaderFactory;
pub use listener::{ChannelListener, DownloadEvent, DownloadListener, LoggingListener};
