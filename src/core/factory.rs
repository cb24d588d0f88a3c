//! Downloader construction
//!
//! The factory keeps a registry from [`DownloaderKind`] to a scheduler
//! constructor, so every downloader is built by the same code path whether
//! it starts from a fresh [`Task`] or from a resume blob.

use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::config::EngineConfig;
use crate::core::downloader::{Downloader, DownloaderSeed};
use crate::core::error_handling::EngineError;
use crate::core::hls_scheduler::HlsScheduler;
use crate::core::models::{DownloaderKind, Task};
use crate::core::persistence::PersistenceCodec;
use crate::core::range_scheduler::RangeScheduler;
use crate::core::scheduler::SegmentScheduler;
use crate::utils::network::build_client;

/// Builds the scheduler for one downloader
pub type SchedulerConstructor = fn(&EngineConfig) -> Arc<dyn SegmentScheduler>;

#[derive(Clone)]
pub struct DownloaderFactory {
    config: Arc<EngineConfig>,
    client: Client,
    registry: HashMap<DownloaderKind, SchedulerConstructor>,
}

impl std::fmt::Debug for DownloaderFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloaderFactory")
            .field("config", &self.config)
            .field("kinds", &self.registry.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn range_scheduler(_config: &EngineConfig) -> Arc<dyn SegmentScheduler> {
    Arc::new(RangeScheduler::new())
}

fn hls_scheduler(_config: &EngineConfig) -> Arc<dyn SegmentScheduler> {
    Arc::new(HlsScheduler::new())
}

impl DownloaderFactory {
    /// Factory with the built-in kinds registered
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let client = build_client(&config)?;
        Ok(Self::with_client(config, client))
    }

    /// Factory sharing an existing HTTP client
    pub fn with_client(config: EngineConfig, client: Client) -> Self {
        let mut factory = Self {
            config: Arc::new(config),
            client,
            registry: HashMap::new(),
        };
        factory.register(DownloaderKind::MultiThread, range_scheduler);
        factory.register(DownloaderKind::Hls, hls_scheduler);
        factory
    }

    /// Register or replace the scheduler constructor of a kind
    pub fn register(&mut self, kind: DownloaderKind, constructor: SchedulerConstructor) {
        self.registry.insert(kind, constructor);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Downloader for a new task; call `create()` on it next
    pub fn create(&self, kind: DownloaderKind, task: Task) -> Result<Downloader, EngineError> {
        self.build(kind, DownloaderSeed::Fresh(task))
    }

    /// Rebuild a downloader from a resume blob; `None` when the blob is unusable
    pub fn load(&self, blob: &[u8]) -> Option<Downloader> {
        let state = match PersistenceCodec::decode(blob) {
            Ok(state) => state,
            Err(e) => {
                warn!("Ignoring resume blob: {}", e);
                return None;
            }
        };

        let kind = state.kind;
        debug!(
            "Loaded {} state for {} ({} bytes written)",
            kind,
            state.task.source_url(),
            state.total_bytes_written()
        );

        match self.build(kind, DownloaderSeed::Resumed(state)) {
            Ok(downloader) => Some(downloader),
            Err(e) => {
                warn!("Ignoring resume blob: {}", e);
                None
            }
        }
    }

    fn build(&self, kind: DownloaderKind, seed: DownloaderSeed) -> Result<Downloader, EngineError> {
        let constructor = self
            .registry
            .get(&kind)
            .ok_or(EngineError::UnsupportedKind { kind })?;
        let scheduler = constructor(&self.config);

        Ok(Downloader::new(
            seed,
            scheduler,
            self.config.clone(),
            self.client.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{DownloadState, Phase, Segment, SegmentState, SnifferInfo};
    use crate::core::persistence::CURRENT_VERSION;

    fn factory() -> DownloaderFactory {
        DownloaderFactory::new(EngineConfig::default()).unwrap()
    }

    fn started_state() -> DownloadState {
        let task = Task::new("http://example.com/file.bin", "file", "/tmp/none");
        let info = SnifferInfo {
            real_url: "http://example.com/file.bin".to_string(),
            content_length: 10,
            is_segmented: false,
            segment_manifest: None,
            accepts_ranges: true,
            content_type: None,
            is_live: false,
        };
        let mut segments = vec![Segment::new(0, 0, Some(4)), Segment::new(1, 5, Some(9))];
        segments[0].state = SegmentState::Done;
        segments[0].bytes_written = 5;
        segments[1].state = SegmentState::Failed;
        segments[1].bytes_written = 2;
        let mut state = DownloadState::new(DownloaderKind::MultiThread, task, info, segments);
        state.phase = Phase::Started;
        state
    }

    #[test]
    fn test_create_uses_registered_kind() {
        let task = Task::new("http://example.com/file.bin", "file", "/tmp/none");
        let downloader = factory().create(DownloaderKind::Hls, task.clone()).unwrap();
        assert_eq!(downloader.kind(), DownloaderKind::Hls);
        assert_eq!(downloader.task(), task);
        assert_eq!(downloader.phase(), Phase::Created);
    }

    #[test]
    fn test_unregistered_kind_is_rejected() {
        let mut factory = factory();
        factory.registry.clear();
        let task = Task::new("http://example.com/file.bin", "file", "/tmp/none");
        let err = factory.create(DownloaderKind::MultiThread, task).unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedKind { .. }));
    }

    #[test]
    fn test_load_restores_resumable_state() {
        let blob = PersistenceCodec::encode(&started_state()).unwrap();
        let downloader = factory().load(&blob).unwrap();

        assert_eq!(downloader.kind(), DownloaderKind::MultiThread);
        assert_eq!(downloader.phase(), Phase::Paused);
        let state = downloader.state().unwrap();
        assert_eq!(state.segments[0].state, SegmentState::Done);
        assert_eq!(state.segments[1].state, SegmentState::Pending);
        assert_eq!(state.segments[1].bytes_written, 2);
    }

    #[test]
    fn test_load_rejects_unusable_blobs() {
        let factory = factory();
        let mut blob = PersistenceCodec::encode(&started_state()).unwrap();

        assert!(factory.load(&[]).is_none());
        assert!(factory.load(b"garbage blob").is_none());

        blob[4..6].copy_from_slice(&(CURRENT_VERSION + 1).to_be_bytes());
        assert!(factory.load(&blob).is_none());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = EngineConfig {
            concurrency: 0,
            ..EngineConfig::default()
        };
        assert!(DownloaderFactory::new(config).is_err());
    }
}
