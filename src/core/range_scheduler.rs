//! Multi-threaded range downloads
//!
//! The destination file is pre-allocated and split into contiguous byte
//! ranges. A fixed pool of workers claims PENDING segments one at a time,
//! requests `[start + written, end]` and writes the body at the matching file
//! offset, so a paused segment resumes exactly where it stopped.
//!
//! A server answering a ranged request with `200 OK` does not honour ranges:
//! progress is discarded and the resource is fetched again as one stream.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::EngineConfig;
use crate::core::error_handling::{EngineError, ErrorCode};
use crate::core::models::{DownloaderKind, Segment, SegmentState, SnifferInfo};
use crate::core::scheduler::{
    next_chunk, partition, segment_count, send_request, throttle, with_retries, AttemptError,
    RunContext, RunOutcome, SchedulerEvent, SegmentScheduler,
};
use crate::utils::file_utils::ensure_dir_exists;
use crate::utils::network::{response_content_range, ByteRange};

#[derive(Debug, Default, Clone, Copy)]
pub struct RangeScheduler;

impl RangeScheduler {
    pub fn new() -> Self {
        Self
    }
}

/// How the worker pool finished
enum PoolOutcome {
    Completed,
    Stopped,
    RangeRejected,
}

/// How a single worker finished
enum WorkerExit {
    Drained,
    Stopped,
    RangeRejected,
}

#[async_trait]
impl SegmentScheduler for RangeScheduler {
    fn kind(&self) -> DownloaderKind {
        DownloaderKind::MultiThread
    }

    fn plan_segments(
        &self,
        info: &SnifferInfo,
        config: &EngineConfig,
    ) -> Result<Vec<Segment>, EngineError> {
        let segments = match info.known_length() {
            None => vec![Segment::new(0, 0, None)],
            Some(0) => Vec::new(),
            Some(length) if !info.accepts_ranges => partition(length, 1),
            Some(length) => partition(length, segment_count(length, config)),
        };
        debug!(
            "Planned {} range segments for {}",
            segments.len(),
            info.real_url
        );
        Ok(segments)
    }

    async fn run(&self, ctx: RunContext) -> Result<RunOutcome, EngineError> {
        let path = ctx.destination();
        if let Some(parent) = path.parent() {
            ensure_dir_exists(parent)?;
        }

        reconcile_with_disk(&ctx, &path).await?;
        note_unranged_server(&ctx);

        let length = ctx.state.lock().sniffer_info.known_length();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .await?;
        if let Some(length) = length {
            if file.metadata().await?.len() < length {
                file.set_len(length).await?;
            }
        }

        loop {
            match run_pool(&ctx, &path).await? {
                PoolOutcome::Completed => break,
                PoolOutcome::Stopped => return Ok(RunOutcome::Stopped),
                PoolOutcome::RangeRejected => {
                    if !fall_back_to_single_stream(&ctx, &file).await? {
                        return Ok(RunOutcome::Stopped);
                    }
                }
            }
        }

        let written = ctx.with_state(|s| s.total_bytes_written());
        let Some(written) = written else {
            return Ok(RunOutcome::Stopped);
        };
        file.set_len(length.unwrap_or(written)).await?;
        file.sync_all().await?;

        info!("Range download finished: {} bytes at {:?}", written, path);
        Ok(RunOutcome::Completed)
    }
}

/// Discard recorded progress when the partial file is gone
async fn reconcile_with_disk(ctx: &RunContext, path: &Path) -> Result<(), EngineError> {
    let exists = tokio::fs::metadata(path).await.is_ok();
    if exists {
        return Ok(());
    }

    let reset = ctx.with_state(|s| {
        let recorded = s.total_bytes_written();
        if recorded > 0 {
            s.segments.iter_mut().for_each(Segment::reset);
        }
        (recorded, s.segments.clone())
    });

    if let Some((recorded, segments)) = reset {
        if recorded > 0 {
            ctx.progress.rebase(&segments);
            ctx.warn(
                ErrorCode::ProgressDiscarded,
                format!(
                    "{:?} is missing, discarding {} recorded bytes",
                    path, recorded
                ),
            );
        }
    }
    Ok(())
}

/// Report a server whose sniff reply ignored the range before streaming it whole.
///
/// A run with recorded progress skips this: its ranged request is rejected
/// and reported by the fallback instead.
fn note_unranged_server(ctx: &RunContext) {
    let url = ctx
        .with_state(|s| {
            let nothing_to_fetch = s.segments.is_empty();
            if s.sniffer_info.accepts_ranges || nothing_to_fetch || s.total_bytes_written() > 0 {
                return None;
            }
            s.ranges_honored = false;
            Some(s.sniffer_info.real_url.clone())
        })
        .flatten();

    if let Some(url) = url {
        let error = EngineError::RangeNotSupported { url };
        ctx.warn(
            error.code(),
            format!("{}; downloading as a single stream", error),
        );
    }
}

/// Replace the partition by one whole-resource segment
async fn fall_back_to_single_stream(ctx: &RunContext, file: &File) -> Result<bool, EngineError> {
    let replaced = ctx.with_state(|s| {
        let discarded = s.total_bytes_written();
        let end = s
            .sniffer_info
            .known_length()
            .and_then(|len| len.checked_sub(1));
        s.ranges_honored = false;
        s.segments = vec![Segment::new(0, 0, end)];
        (discarded, s.segments.clone(), s.sniffer_info.real_url.clone())
    });
    let Some((discarded, segments, url)) = replaced else {
        return Ok(false);
    };

    if segments[0].end_offset.is_none() {
        file.set_len(0).await?;
    }
    ctx.progress.rebase(&segments);
    let error = EngineError::RangeNotSupported { url };
    ctx.warn(
        error.code(),
        format!(
            "{}; restarting as a single stream ({} bytes discarded)",
            error, discarded
        ),
    );
    Ok(true)
}

async fn run_pool(ctx: &RunContext, path: &Path) -> Result<PoolOutcome, EngineError> {
    let pending = ctx
        .with_state(|s| {
            s.segments
                .iter()
                .filter(|seg| seg.state != SegmentState::Done)
                .count()
        })
        .unwrap_or(0);

    if ctx.stop.is_cancelled() {
        return Ok(PoolOutcome::Stopped);
    }
    if pending == 0 {
        return Ok(PoolOutcome::Completed);
    }

    let workers = ctx.config.concurrency.clamp(1, pending);
    let pool_stop = ctx.stop.child_token();
    info!("Starting {} workers for {} segments", workers, pending);

    let mut join_set = JoinSet::new();
    for worker_id in 0..workers {
        let ctx = ctx.clone();
        let stop = pool_stop.clone();
        let path = path.to_path_buf();
        join_set.spawn(async move { worker_loop(worker_id, &ctx, &stop, &path).await });
    }

    let mut failure: Option<EngineError> = None;
    let mut range_rejected = false;

    while let Some(joined) = join_set.join_next().await {
        let result = joined.unwrap_or_else(|e| {
            Err(EngineError::transfer(format!("worker task failed: {}", e)))
        });
        match result {
            Ok(WorkerExit::Drained) | Ok(WorkerExit::Stopped) => {}
            Ok(WorkerExit::RangeRejected) => {
                range_rejected = true;
                pool_stop.cancel();
            }
            Err(error) => {
                if failure.is_none() {
                    failure = Some(error);
                }
                pool_stop.cancel();
            }
        }
    }

    if let Some(error) = failure {
        return Err(error);
    }
    if ctx.stop.is_cancelled() {
        return Ok(PoolOutcome::Stopped);
    }
    if range_rejected {
        return Ok(PoolOutcome::RangeRejected);
    }

    match ctx.with_state(|s| s.segments.iter().all(Segment::is_done)) {
        Some(true) => Ok(PoolOutcome::Completed),
        Some(false) => Err(EngineError::transfer("workers exited with unfinished segments")),
        None => Ok(PoolOutcome::Stopped),
    }
}

async fn worker_loop(
    worker_id: usize,
    ctx: &RunContext,
    stop: &CancellationToken,
    path: &Path,
) -> Result<WorkerExit, EngineError> {
    loop {
        if stop.is_cancelled() {
            return Ok(WorkerExit::Stopped);
        }

        let claimed = ctx.with_state(|s| {
            let segment = s
                .segments
                .iter_mut()
                .find(|seg| seg.state == SegmentState::Pending)?;
            segment.state = SegmentState::InProgress;
            Some((segment.index, s.segments.len()))
        });
        let (index, count) = match claimed {
            None => return Ok(WorkerExit::Stopped),
            Some(None) => return Ok(WorkerExit::Drained),
            Some(Some(claim)) => claim,
        };

        debug!("Worker {} claimed segment {}", worker_id, index);

        match with_retries(ctx, stop, index, move || fetch_segment(ctx, stop, path, index)).await
        {
            Ok(()) => {
                ctx.set_segment_state(index, SegmentState::Done);
                debug!("Worker {} finished segment {}", worker_id, index);
                ctx.emit(SchedulerEvent::SegmentDone { index, count });
            }
            Err(AttemptError::Interrupted) => return Ok(WorkerExit::Stopped),
            Err(AttemptError::RangeRejected) => return Ok(WorkerExit::RangeRejected),
            Err(AttemptError::Failed(error)) => {
                warn!("Worker {} giving up on segment {}: {}", worker_id, index, error);
                return Err(error);
            }
        }
    }
}

/// One attempt at transferring the rest of segment `index`
async fn fetch_segment(
    ctx: &RunContext,
    stop: &CancellationToken,
    path: &Path,
    index: usize,
) -> Result<(), AttemptError> {
    let (segment, url, length) = ctx
        .with_state(|s| {
            s.segments.get(index).cloned().map(|seg| {
                (
                    seg,
                    s.sniffer_info.real_url.clone(),
                    s.sniffer_info.known_length(),
                )
            })
        })
        .flatten()
        .ok_or(AttemptError::Interrupted)?;

    let offset = segment.resume_offset();
    if segment.remaining() == Some(0) {
        return Ok(());
    }

    let whole_resource = offset == 0
        && match (segment.end_offset, length) {
            (None, _) => true,
            (Some(end), Some(len)) => end + 1 == len,
            (Some(_), None) => false,
        };
    let range = (!whole_resource).then(|| ByteRange::new(offset, segment.end_offset));

    let response = send_request(ctx, stop, &url, range).await?;
    let status = response.status();

    match status {
        StatusCode::PARTIAL_CONTENT => {
            if let Some((start, _)) = response_content_range(&response).and_then(|r| r.range) {
                if start != offset {
                    return Err(AttemptError::Failed(EngineError::transfer(format!(
                        "server returned range starting at {} instead of {}",
                        start, offset
                    ))));
                }
            }
        }
        StatusCode::OK if range.is_some() => return Err(AttemptError::RangeRejected),
        s if s.is_success() => {}
        s => {
            return Err(AttemptError::Failed(EngineError::HttpStatus {
                status: s.as_u16(),
                url: url.clone(),
            }))
        }
    }

    let mut file = OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;

    let read_timeout = ctx.config.read_timeout();
    let mut stream = Box::pin(response.bytes_stream());
    let mut position = offset;

    while let Some(chunk) = next_chunk(&mut stream, stop, read_timeout).await? {
        let take = match segment.end_offset {
            Some(end) => chunk.len().min((end + 1 - position) as usize),
            None => chunk.len(),
        };
        if take == 0 {
            break;
        }

        file.write_all(&chunk[..take]).await?;
        file.flush().await?;

        let delta = take as u64;
        position += delta;
        ctx.with_state(|s| s.segments[index].bytes_written += delta)
            .ok_or(AttemptError::Interrupted)?;
        ctx.progress.record(index, delta);
        throttle(ctx, stop, delta).await?;

        if segment.end_offset.is_some_and(|end| position > end) {
            break;
        }
    }

    if let Some(end) = segment.end_offset {
        if position <= end {
            return Err(AttemptError::Failed(EngineError::transfer(format!(
                "segment {} body ended at byte {} of {}",
                index,
                position,
                end + 1
            ))));
        }
    }
    Ok(())
}
