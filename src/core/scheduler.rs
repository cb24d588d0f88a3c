//! Segment scheduling
//!
//! A [`SegmentScheduler`] turns sniffed metadata into an initial segment
//! layout and later drives the transfer of those segments to disk. Two
//! implementations exist: [`RangeScheduler`](crate::core::range_scheduler::RangeScheduler)
//! for byte-range parallel downloads and
//! [`HlsScheduler`](crate::core::hls_scheduler::HlsScheduler) for playlists.
//!
//! Schedulers never own the download state. They mutate it through
//! [`RunContext::with_state`], which refuses the mutation once a newer run
//! has started, so a worker left over from an abandoned run cannot corrupt
//! the state of the next one.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use reqwest::{Client, Response};
use std::fmt::Debug;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::bandwidth::BandwidthController;
use crate::core::config::EngineConfig;
use crate::core::error_handling::{EngineError, ErrorCode};
use crate::core::models::{
    DownloadState, DownloaderKind, Segment, SegmentState, SnifferInfo,
};
use crate::core::progress_tracker::ProgressAggregator;
use crate::utils::network::{send_following_redirects, ByteRange};

/// Download state shared between a downloader and its scheduler run
pub type SharedState = Arc<Mutex<DownloadState>>;

/// How a scheduler run ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every segment is on disk
    Completed,
    /// The stop token fired
    Stopped,
}

/// Notifications a run sends back to its downloader
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    SegmentDone { index: usize, count: usize },
    Warning { code: ErrorCode, message: String },
}

/// Everything one scheduler run needs
#[derive(Debug, Clone)]
pub struct RunContext {
    pub client: Client,
    pub config: Arc<EngineConfig>,
    pub state: SharedState,
    pub progress: Arc<ProgressAggregator>,
    pub stop: CancellationToken,
    pub events: mpsc::UnboundedSender<SchedulerEvent>,
    pub run_id: u64,
    pub bandwidth: BandwidthController,
}

impl RunContext {
    /// Mutate the state if this run is still the current one
    pub fn with_state<R>(&self, f: impl FnOnce(&mut DownloadState) -> R) -> Option<R> {
        let mut state = self.state.lock();
        if state.run_id != self.run_id {
            return None;
        }
        Some(f(&mut state))
    }

    pub fn segment(&self, index: usize) -> Option<Segment> {
        self.with_state(|s| s.segments.get(index).cloned()).flatten()
    }

    pub fn set_segment_state(&self, index: usize, state: SegmentState) {
        self.with_state(|s| {
            if let Some(segment) = s.segments.get_mut(index) {
                segment.state = state;
            }
        });
    }

    pub fn destination(&self) -> PathBuf {
        self.state.lock().task.destination_path()
    }

    pub fn emit(&self, event: SchedulerEvent) {
        let _ = self.events.send(event);
    }

    pub fn warn(&self, code: ErrorCode, message: impl Into<String>) {
        let message = message.into();
        warn!("{}: {}", code, message);
        self.emit(SchedulerEvent::Warning { code, message });
    }
}

#[async_trait]
pub trait SegmentScheduler: Send + Sync + Debug {
    fn kind(&self) -> DownloaderKind;

    /// Initial segment layout for a freshly sniffed resource
    fn plan_segments(
        &self,
        info: &SnifferInfo,
        config: &EngineConfig,
    ) -> Result<Vec<Segment>, EngineError>;

    /// Transfer every unfinished segment, returning when done, stopped or failed
    async fn run(&self, ctx: RunContext) -> Result<RunOutcome, EngineError>;
}

/// Split `[0, length)` into `parts` contiguous segments whose sizes differ by at most one.
///
/// The first `length % parts` segments get the extra byte. `parts` is clamped
/// to `[1, length]`; an empty range yields no segments.
pub fn partition(length: u64, parts: usize) -> Vec<Segment> {
    if length == 0 {
        return Vec::new();
    }

    let parts = (parts.max(1) as u64).min(length);
    let base = length / parts;
    let remainder = length % parts;

    let mut segments = Vec::with_capacity(parts as usize);
    let mut start = 0u64;
    for index in 0..parts {
        let size = base + u64::from(index < remainder);
        segments.push(Segment::new(index as usize, start, Some(start + size - 1)));
        start += size;
    }
    segments
}

/// Number of range segments for a resource of `length` bytes
pub fn segment_count(length: u64, config: &EngineConfig) -> usize {
    let by_size = (length / config.min_segment_size.max(1)).max(1);
    (by_size.min(config.concurrency.max(1) as u64)) as usize
}

/// Why a single fetch attempt stopped
#[derive(Debug)]
pub(crate) enum AttemptError {
    /// Stop token fired or the run was superseded
    Interrupted,
    /// The server answered a ranged request with the full body
    RangeRejected,
    Failed(EngineError),
}

impl From<EngineError> for AttemptError {
    fn from(error: EngineError) -> Self {
        Self::Failed(error)
    }
}

impl From<std::io::Error> for AttemptError {
    fn from(error: std::io::Error) -> Self {
        Self::Failed(EngineError::Io(error))
    }
}

/// Issue a GET bounded by the stop token and the read timeout
pub(crate) async fn send_request(
    ctx: &RunContext,
    stop: &CancellationToken,
    url: &str,
    range: Option<ByteRange>,
) -> Result<Response, AttemptError> {
    let read_timeout = ctx.config.read_timeout();
    let request = send_following_redirects(&ctx.client, url, range, ctx.config.max_redirects);

    tokio::select! {
        biased;
        _ = stop.cancelled() => Err(AttemptError::Interrupted),
        result = timeout(read_timeout, request) => match result {
            Err(_) => Err(AttemptError::Failed(EngineError::transfer(format!(
                "no response from {} within {:?}",
                url, read_timeout
            )))),
            Ok(Err(e)) => Err(AttemptError::Failed(e)),
            Ok(Ok((response, _))) => Ok(response),
        }
    }
}

/// Next body chunk, bounded by the stop token and the read timeout
pub(crate) async fn next_chunk<S>(
    stream: &mut S,
    stop: &CancellationToken,
    read_timeout: Duration,
) -> Result<Option<Bytes>, AttemptError>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    tokio::select! {
        biased;
        _ = stop.cancelled() => Err(AttemptError::Interrupted),
        next = timeout(read_timeout, stream.next()) => match next {
            Err(_) => Err(AttemptError::Failed(EngineError::transfer(format!(
                "no data received for {:?}",
                read_timeout
            )))),
            Ok(None) => Ok(None),
            Ok(Some(Err(e))) => Err(AttemptError::Failed(e.into())),
            Ok(Some(Ok(bytes))) => Ok(Some(bytes)),
        }
    }
}

/// Apply the bandwidth limit to `bytes`, bounded by the stop token
pub(crate) async fn throttle(
    ctx: &RunContext,
    stop: &CancellationToken,
    bytes: u64,
) -> Result<(), AttemptError> {
    tokio::select! {
        biased;
        _ = stop.cancelled() => Err(AttemptError::Interrupted),
        _ = ctx.bandwidth.throttle(bytes) => Ok(()),
    }
}

/// Run `attempt` until it succeeds, retrying retryable failures with backoff.
///
/// The segment is IN_PROGRESS while an attempt runs and FAILED while waiting
/// for a retry. An interrupted segment goes back to PENDING. Marking the
/// segment DONE is left to the caller.
pub(crate) async fn with_retries<T, F, Fut>(
    ctx: &RunContext,
    stop: &CancellationToken,
    index: usize,
    mut attempt: F,
) -> Result<T, AttemptError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let max_attempts = ctx.config.retry.max_attempts();
    let mut attempt_no = 1u32;

    loop {
        ctx.set_segment_state(index, SegmentState::InProgress);

        let error = match attempt().await {
            Ok(value) => return Ok(value),
            Err(AttemptError::Failed(error)) => error,
            Err(other) => {
                ctx.set_segment_state(index, SegmentState::Pending);
                return Err(other);
            }
        };

        ctx.set_segment_state(index, SegmentState::Failed);

        if !error.is_retryable() || attempt_no >= max_attempts {
            return Err(AttemptError::Failed(EngineError::SegmentExhausted {
                index,
                attempts: attempt_no,
                message: error.to_string(),
            }));
        }

        let delay = ctx.config.retry.delay_for(attempt_no);
        warn!(
            "Segment {} attempt {}/{} failed, retrying in {:?}: {}",
            index, attempt_no, max_attempts, delay, error
        );

        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                ctx.set_segment_state(index, SegmentState::Pending);
                return Err(AttemptError::Interrupted);
            }
            _ = sleep(delay) => {}
        }

        attempt_no += 1;
        debug!("Segment {} starting attempt {}", index, attempt_no);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_covers(segments: &[Segment], length: u64) {
        let mut expected = 0u64;
        for (position, segment) in segments.iter().enumerate() {
            assert_eq!(segment.index, position);
            assert_eq!(segment.start_offset, expected);
            let end = segment.end_offset.unwrap();
            assert!(end >= segment.start_offset);
            expected = end + 1;
        }
        assert_eq!(expected, length);
    }

    #[test]
    fn test_partition_even_split() {
        let segments = partition(1000, 4);
        let sizes: Vec<u64> = segments.iter().map(|s| s.len().unwrap()).collect();
        assert_eq!(sizes, vec![250, 250, 250, 250]);
        assert_eq!(segments[1].start_offset, 250);
        assert_eq!(segments[1].end_offset, Some(499));
    }

    #[test]
    fn test_partition_remainder_goes_first() {
        let segments = partition(1000, 3);
        let sizes: Vec<u64> = segments.iter().map(|s| s.len().unwrap()).collect();
        assert_eq!(sizes, vec![334, 333, 333]);
        assert_covers(&segments, 1000);
    }

    #[test]
    fn test_partition_covers_range_exactly_once() {
        for length in [1u64, 2, 3, 7, 64, 999, 1000, 1001, 65_537] {
            for parts in 1..=17usize {
                let segments = partition(length, parts);
                assert_covers(&segments, length);
                assert_eq!(segments.len() as u64, (parts as u64).min(length));

                let sizes: Vec<u64> = segments.iter().map(|s| s.len().unwrap()).collect();
                let max = sizes.iter().max().unwrap();
                let min = sizes.iter().min().unwrap();
                assert!(max - min <= 1);
            }
        }
    }

    #[test]
    fn test_partition_edge_cases() {
        assert!(partition(0, 4).is_empty());
        assert_eq!(partition(3, 8).len(), 3);
        assert_eq!(partition(10, 0).len(), 1);
    }

    #[test]
    fn test_segment_count_respects_minimum_size() {
        let config = EngineConfig {
            concurrency: 4,
            min_segment_size: 100,
            ..EngineConfig::default()
        };
        assert_eq!(segment_count(1000, &config), 4);
        assert_eq!(segment_count(250, &config), 2);
        assert_eq!(segment_count(50, &config), 1);
    }
}
