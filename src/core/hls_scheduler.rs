//! HLS segment downloads
//!
//! Segments are fetched with bounded parallelism but yielded in manifest
//! order, then appended to the destination file one after another. A
//! segment only counts as DONE once it is on disk, so after a pause the
//! contiguous DONE prefix is exactly what the file holds.

use aes::Aes128;
use async_trait::async_trait;
use cbc::Decryptor;
use cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use reqwest::StatusCode;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::EngineConfig;
use crate::core::error_handling::{EngineError, ErrorCode};
use crate::core::models::{DownloaderKind, Segment, SegmentDescriptor, SegmentState, SnifferInfo};
use crate::core::scheduler::{
    next_chunk, send_request, throttle, with_retries, AttemptError, RunContext, RunOutcome,
    SchedulerEvent, SegmentScheduler,
};
use crate::parsers::m3u8_parser::sequence_iv;
use crate::utils::file_utils::ensure_dir_exists;
use crate::utils::network::ByteRange;

/// AES-128 keys by URI, fetched at most once per run
type KeyCache = DashMap<String, Arc<OnceCell<[u8; 16]>>>;

#[derive(Debug, Default, Clone, Copy)]
pub struct HlsScheduler;

impl HlsScheduler {
    pub fn new() -> Self {
        Self
    }
}

/// Per-run fetch helpers shared by all in-flight segment futures
struct FetchContext<'a> {
    ctx: &'a RunContext,
    stop: &'a CancellationToken,
    keys: KeyCache,
    range_warned: AtomicBool,
}

#[async_trait]
impl SegmentScheduler for HlsScheduler {
    fn kind(&self) -> DownloaderKind {
        DownloaderKind::Hls
    }

    fn plan_segments(
        &self,
        info: &SnifferInfo,
        _config: &EngineConfig,
    ) -> Result<Vec<Segment>, EngineError> {
        let manifest = info
            .segment_manifest
            .as_ref()
            .filter(|_| info.is_segmented)
            .ok_or_else(|| EngineError::UnrecognizedContent {
                reason: format!("{} is not a segmented stream", info.real_url),
            })?;

        if info.is_live {
            warn!(
                "{} is a live playlist; downloading the {} segments currently listed",
                info.real_url,
                manifest.len()
            );
        }

        Ok((0..manifest.len())
            .map(|index| Segment::new(index, 0, None))
            .collect())
    }

    async fn run(&self, ctx: RunContext) -> Result<RunOutcome, EngineError> {
        let manifest = ctx
            .state
            .lock()
            .sniffer_info
            .segment_manifest
            .clone()
            .ok_or_else(|| EngineError::UnrecognizedContent {
                reason: "state has no segment manifest".to_string(),
            })?;
        let count = manifest.len();

        let path = ctx.destination();
        if let Some(parent) = path.parent() {
            ensure_dir_exists(parent)?;
        }

        let Some((first, mut position)) = reconcile_with_disk(&ctx, &path).await? else {
            return Ok(RunOutcome::Stopped);
        };

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .await?;
        file.set_len(position).await?;
        file.seek(SeekFrom::Start(position)).await?;

        info!(
            "Fetching HLS segments {}..{} of {} into {:?}",
            first, count, count, path
        );

        let fetch = FetchContext {
            ctx: &ctx,
            stop: &ctx.stop,
            keys: KeyCache::new(),
            range_warned: AtomicBool::new(false),
        };
        let fetch = &fetch;
        let manifest = &manifest;

        let mut fetches = Box::pin(
            stream::iter(first..count)
                .map(move |index| async move {
                    let descriptor = &manifest[index];
                    let result = with_retries(fetch.ctx, fetch.stop, index, move || {
                        fetch.fetch_segment(descriptor)
                    })
                    .await;
                    (index, result)
                })
                .buffered(ctx.config.concurrency.max(1)),
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.stop.cancelled() => return Ok(RunOutcome::Stopped),
                next = fetches.next() => next,
            };
            let Some((index, result)) = next else {
                break;
            };

            let data = match result {
                Ok(data) => data,
                Err(AttemptError::Interrupted) => return Ok(RunOutcome::Stopped),
                Err(AttemptError::RangeRejected) => {
                    return Err(EngineError::transfer(format!(
                        "segment {} could not be fetched",
                        index
                    )))
                }
                Err(AttemptError::Failed(error)) => return Err(error),
            };

            file.write_all(&data).await?;
            file.flush().await?;

            let len = data.len() as u64;
            let start = position;
            let recorded = ctx.with_state(|s| {
                let segment = &mut s.segments[index];
                segment.start_offset = start;
                segment.end_offset = len.checked_sub(1).map(|last| start + last);
                segment.bytes_written = len;
                segment.state = SegmentState::Done;
            });
            if recorded.is_none() {
                return Ok(RunOutcome::Stopped);
            }

            position += len;
            ctx.progress.record(index, len);
            debug!("Segment {}/{} written ({} bytes)", index + 1, count, len);
            ctx.emit(SchedulerEvent::SegmentDone { index, count });
        }

        file.set_len(position).await?;
        file.sync_all().await?;

        info!("HLS download finished: {} bytes at {:?}", position, path);
        Ok(RunOutcome::Completed)
    }
}

/// Keep the contiguous DONE prefix that is on disk and reset everything after it.
///
/// Returns the first segment to fetch and the file offset to append at.
async fn reconcile_with_disk(
    ctx: &RunContext,
    path: &Path,
) -> Result<Option<(usize, u64)>, EngineError> {
    let file_len = tokio::fs::metadata(path).await.ok().map(|m| m.len());

    let outcome = ctx.with_state(|s| {
        let prefix = s.segments.iter().take_while(|seg| seg.is_done()).count();
        let prefix_bytes: u64 = s.segments[..prefix].iter().map(|seg| seg.bytes_written).sum();
        let on_disk = file_len.is_some_and(|len| len >= prefix_bytes);

        let (keep, keep_bytes) = if prefix > 0 && !on_disk {
            (0, 0)
        } else {
            (prefix, prefix_bytes)
        };

        for segment in &mut s.segments[keep..] {
            segment.reset();
            segment.start_offset = 0;
            segment.end_offset = None;
        }
        (keep, keep_bytes, prefix_bytes - keep_bytes, s.segments.clone())
    });

    let Some((keep, keep_bytes, discarded, segments)) = outcome else {
        return Ok(None);
    };

    ctx.progress.rebase(&segments);
    if discarded > 0 {
        ctx.warn(
            ErrorCode::ProgressDiscarded,
            format!(
                "{:?} no longer holds the downloaded segments, discarding {} bytes",
                path, discarded
            ),
        );
    }
    Ok(Some((keep, keep_bytes)))
}

impl FetchContext<'_> {
    /// One attempt at fetching (and decrypting) a segment
    async fn fetch_segment(&self, descriptor: &SegmentDescriptor) -> Result<Vec<u8>, AttemptError> {
        let range = descriptor
            .byte_range
            .map(|(start, end)| ByteRange::new(start, Some(end)));
        let response = send_request(self.ctx, self.stop, &descriptor.uri, range).await?;

        let status = response.status();
        let slice = match (status, descriptor.byte_range) {
            (StatusCode::PARTIAL_CONTENT, Some((start, end))) => Some((0, end - start)),
            (StatusCode::OK, Some((start, end))) => {
                if !self.range_warned.swap(true, Ordering::AcqRel) {
                    self.ctx.warn(
                        ErrorCode::RangeNotSupported,
                        format!(
                            "{} ignored a byte-range request; slicing sub-ranges locally",
                            descriptor.uri
                        ),
                    );
                }
                Some((start, end))
            }
            (s, _) if s.is_success() => None,
            (s, _) => {
                return Err(AttemptError::Failed(EngineError::HttpStatus {
                    status: s.as_u16(),
                    url: descriptor.uri.clone(),
                }))
            }
        };

        let capacity = descriptor.approx_byte_length.unwrap_or(0).min(16 * 1024 * 1024);
        let mut body = Vec::with_capacity(capacity as usize);
        let read_timeout = self.ctx.config.read_timeout();
        let mut stream = Box::pin(response.bytes_stream());

        while let Some(chunk) = next_chunk(&mut stream, self.stop, read_timeout).await? {
            body.extend_from_slice(&chunk);
            throttle(self.ctx, self.stop, chunk.len() as u64).await?;
        }

        if let Some((start, end)) = slice {
            if (body.len() as u64) <= end {
                return Err(AttemptError::Failed(EngineError::transfer(format!(
                    "{} returned {} bytes, sub-range ends at {}",
                    descriptor.uri,
                    body.len(),
                    end
                ))));
            }
            body = body[start as usize..=end as usize].to_vec();
        }

        match &descriptor.key {
            Some(key) => {
                let key_bytes = self.key(&key.uri).await?;
                let iv = key.iv.unwrap_or_else(|| sequence_iv(descriptor.sequence));
                Ok(decrypt_segment(&key_bytes, &iv, &body)?)
            }
            None => Ok(body),
        }
    }

    async fn key(&self, uri: &str) -> Result<[u8; 16], AttemptError> {
        let cell = self.keys.entry(uri.to_string()).or_default().clone();
        let key = cell.get_or_try_init(|| self.fetch_key(uri)).await?;
        Ok(*key)
    }

    async fn fetch_key(&self, uri: &str) -> Result<[u8; 16], AttemptError> {
        debug!("Fetching AES-128 key {}", uri);
        let response = send_request(self.ctx, self.stop, uri, None).await?;
        if !response.status().is_success() {
            return Err(AttemptError::Failed(EngineError::HttpStatus {
                status: response.status().as_u16(),
                url: uri.to_string(),
            }));
        }

        let read_timeout = self.ctx.config.read_timeout();
        let mut stream = Box::pin(response.bytes_stream());
        let mut data = Vec::with_capacity(16);
        while let Some(chunk) = next_chunk(&mut stream, self.stop, read_timeout).await? {
            data.extend_from_slice(&chunk);
        }

        <[u8; 16]>::try_from(data.as_slice()).map_err(|_| {
            AttemptError::Failed(EngineError::transfer(format!(
                "AES-128 key {} has {} bytes, expected 16",
                uri,
                data.len()
            )))
        })
    }
}

fn decrypt_segment(key: &[u8; 16], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, EngineError> {
    let decryptor = Decryptor::<Aes128>::new_from_slices(key, iv)
        .map_err(|e| EngineError::transfer(format!("invalid AES-128 key or IV: {}", e)))?;
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(|_| EngineError::transfer("AES-128 decryption failed"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use cbc::Encryptor;
    use cipher::BlockEncryptMut;

    pub(crate) fn encrypt_segment(key: &[u8; 16], iv: &[u8; 16], data: &[u8]) -> Vec<u8> {
        Encryptor::<Aes128>::new_from_slices(key, iv)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(data)
    }

    #[test]
    fn test_decrypt_roundtrip() {
        let key = [3u8; 16];
        let iv = sequence_iv(5);
        let plain = b"transport stream payload".to_vec();

        let encrypted = encrypt_segment(&key, &iv, &plain);
        assert_ne!(encrypted, plain);
        assert_eq!(decrypt_segment(&key, &iv, &encrypted).unwrap(), plain);
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let iv = sequence_iv(0);
        let encrypted = encrypt_segment(&[1u8; 16], &iv, b"hello hls");
        let result = decrypt_segment(&[2u8; 16], &iv, &encrypted);
        if let Ok(data) = result {
            assert_ne!(data, b"hello hls".to_vec());
        }
    }

    #[test]
    fn test_plan_requires_segmented_resource() {
        let info = SnifferInfo {
            real_url: "http://example.com/file.mp4".to_string(),
            content_length: 10,
            is_segmented: false,
            segment_manifest: None,
            accepts_ranges: true,
            content_type: None,
            is_live: false,
        };
        let err = HlsScheduler::new()
            .plan_segments(&info, &EngineConfig::default())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnrecognizedContent);
    }
}
