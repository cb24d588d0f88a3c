//! Versioned binary encoding of [`DownloadState`]
//!
//! Blob layout:
//!
//! ```text
//! +------+---------+-------------+-----------------+
//! | SDLB | version | payload len | bincode payload |
//! | 4 B  | u16 BE  | u32 BE      | len bytes       |
//! +------+---------+-------------+-----------------+
//! ```
//!
//! Decoding rejects a wrong magic, an unknown version, a length mismatch, an
//! undecodable payload, and a state whose segments break the partition rules.

use crate::core::error_handling::EngineError;
use crate::core::models::DownloadState;

pub const MAGIC: &[u8; 4] = b"SDLB";

pub const CURRENT_VERSION: u16 = 1;

const HEADER_LEN: usize = MAGIC.len() + 2 + 4;

pub struct PersistenceCodec;

impl PersistenceCodec {
    pub fn encode(state: &DownloadState) -> Result<Vec<u8>, EngineError> {
        let payload = bincode::serialize(state).map_err(|e| {
            EngineError::Io(std::io::Error::other(format!(
                "Failed to serialize download state: {}",
                e
            )))
        })?;
        let payload_len = u32::try_from(payload.len()).map_err(|_| {
            EngineError::Io(std::io::Error::other("download state too large to encode"))
        })?;

        let mut blob = Vec::with_capacity(HEADER_LEN + payload.len());
        blob.extend_from_slice(MAGIC);
        blob.extend_from_slice(&CURRENT_VERSION.to_be_bytes());
        blob.extend_from_slice(&payload_len.to_be_bytes());
        blob.extend_from_slice(&payload);
        Ok(blob)
    }

    pub fn decode(blob: &[u8]) -> Result<DownloadState, EngineError> {
        let version = Self::peek_version(blob)?;
        if version != CURRENT_VERSION {
            return Err(EngineError::CorruptBlob {
                reason: format!("unsupported format version {}", version),
            });
        }

        let declared = u32::from_be_bytes([blob[6], blob[7], blob[8], blob[9]]) as usize;
        let payload = &blob[HEADER_LEN..];
        if payload.len() != declared {
            return Err(EngineError::CorruptBlob {
                reason: format!(
                    "payload length {} does not match header {}",
                    payload.len(),
                    declared
                ),
            });
        }

        let state: DownloadState = bincode::deserialize(payload)?;
        state.validate()?;
        Ok(state)
    }

    /// Format version of a blob after checking its magic
    pub fn peek_version(blob: &[u8]) -> Result<u16, EngineError> {
        if blob.len() < HEADER_LEN {
            return Err(EngineError::CorruptBlob {
                reason: format!("blob of {} bytes is shorter than the header", blob.len()),
            });
        }
        if &blob[..MAGIC.len()] != MAGIC {
            return Err(EngineError::CorruptBlob {
                reason: "bad magic".to_string(),
            });
        }
        Ok(u16::from_be_bytes([blob[4], blob[5]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error_handling::ErrorCode;
    use crate::core::models::{
        DownloaderKind, ErrorInfo, Phase, Segment, SegmentDescriptor, SegmentKey, SegmentState,
        SnifferInfo, Task,
    };
    use tokio_test::{assert_err, assert_ok};

    fn multi_thread_state() -> DownloadState {
        let task = Task::new("http://example.com/video.mp4", "Video", "/tmp/downloads");
        let info = SnifferInfo {
            real_url: "http://cdn.example.com/video.mp4".to_string(),
            content_length: 1000,
            is_segmented: false,
            segment_manifest: None,
            accepts_ranges: true,
            content_type: Some("video/mp4".to_string()),
            is_live: false,
        };
        let mut segments = vec![
            Segment::new(0, 0, Some(333)),
            Segment::new(1, 334, Some(666)),
            Segment::new(2, 667, Some(999)),
        ];
        segments[0].bytes_written = 334;
        segments[0].state = SegmentState::Done;
        segments[1].bytes_written = 17;
        segments[1].state = SegmentState::InProgress;

        let mut state = DownloadState::new(DownloaderKind::MultiThread, task, info, segments);
        state.phase = Phase::Paused;
        state.last_error = Some(ErrorInfo {
            code: ErrorCode::Transfer,
            message: "connection reset".to_string(),
        });
        state
    }

    fn hls_state() -> DownloadState {
        let task = Task::new("http://example.com/live/index.m3u8", "Live", "/tmp/downloads");
        let manifest = vec![
            SegmentDescriptor {
                uri: "http://example.com/live/a.ts".to_string(),
                approx_byte_length: Some(1234),
                duration: 6.006,
                sequence: 41,
                byte_range: None,
                key: Some(SegmentKey {
                    uri: "http://example.com/key".to_string(),
                    iv: Some([7u8; 16]),
                }),
            },
            SegmentDescriptor {
                uri: "http://example.com/live/b.ts".to_string(),
                approx_byte_length: None,
                duration: 3.5,
                sequence: 42,
                byte_range: Some((10, 19)),
                key: None,
            },
        ];
        let info = SnifferInfo {
            real_url: "http://example.com/live/index.m3u8".to_string(),
            content_length: -1,
            is_segmented: true,
            segment_manifest: Some(manifest),
            accepts_ranges: false,
            content_type: Some("application/vnd.apple.mpegurl".to_string()),
            is_live: false,
        };
        let mut segments = vec![Segment::new(0, 0, None), Segment::new(1, 0, None)];
        segments[0].end_offset = Some(99);
        segments[0].bytes_written = 100;
        segments[0].state = SegmentState::Done;
        segments[1].start_offset = 100;
        DownloadState::new(DownloaderKind::Hls, task, info, segments)
    }

    #[test]
    fn test_roundtrip_preserves_every_field() {
        for state in [multi_thread_state(), hls_state()] {
            let blob = assert_ok!(PersistenceCodec::encode(&state));
            let decoded = assert_ok!(PersistenceCodec::decode(&blob));
            assert_eq!(decoded, state);
            assert_eq!(decoded.task.display_name(), state.task.display_name());

            let again = assert_ok!(PersistenceCodec::encode(&decoded));
            assert_eq!(again, blob);
        }
    }

    #[test]
    fn test_header_layout() {
        let blob = PersistenceCodec::encode(&multi_thread_state()).unwrap();
        assert_eq!(&blob[..4], b"SDLB");
        assert_eq!(u16::from_be_bytes([blob[4], blob[5]]), CURRENT_VERSION);
        let len = u32::from_be_bytes([blob[6], blob[7], blob[8], blob[9]]) as usize;
        assert_eq!(len, blob.len() - HEADER_LEN);
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let mut blob = PersistenceCodec::encode(&multi_thread_state()).unwrap();
        blob[4..6].copy_from_slice(&99u16.to_be_bytes());

        assert_eq!(PersistenceCodec::peek_version(&blob).unwrap(), 99);
        let err = assert_err!(PersistenceCodec::decode(&blob));
        assert_eq!(err.code(), ErrorCode::CorruptBlob);
    }

    #[test]
    fn test_damaged_blobs_are_rejected() {
        let blob = PersistenceCodec::encode(&multi_thread_state()).unwrap();

        assert_err!(PersistenceCodec::decode(&[]));
        assert_err!(PersistenceCodec::decode(b"SDL"));

        let mut bad_magic = blob.clone();
        bad_magic[0] = b'X';
        assert_err!(PersistenceCodec::decode(&bad_magic));

        assert_err!(PersistenceCodec::decode(&blob[..blob.len() - 1]));

        let mut garbage = blob[..HEADER_LEN].to_vec();
        garbage[6..10].copy_from_slice(&4u32.to_be_bytes());
        garbage.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        assert_err!(PersistenceCodec::decode(&garbage));
    }

    #[test]
    fn test_structurally_invalid_state_is_rejected() {
        let mut state = multi_thread_state();
        state.segments[1].start_offset = 400;
        let blob = PersistenceCodec::encode(&state).unwrap();

        let err = assert_err!(PersistenceCodec::decode(&blob));
        assert!(matches!(err, EngineError::CorruptBlob { .. }));
    }

    #[test]
    fn test_run_id_is_not_persisted() {
        let mut state = multi_thread_state();
        state.run_id = 42;
        let decoded = PersistenceCodec::decode(&PersistenceCodec::encode(&state).unwrap()).unwrap();
        assert_eq!(decoded.run_id, 0);
    }
}
