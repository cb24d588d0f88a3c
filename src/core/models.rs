//! Core data models for the download engine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use crate::core::error_handling::{EngineError, ErrorCode};
use crate::utils::file_utils::file_name_from_url;

/// Downloader kind, used as the registry tag in the factory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownloaderKind {
    MultiThread,

    Hls,
}

impl fmt::Display for DownloaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MultiThread => write!(f, "MULTI_THREAD"),
            Self::Hls => write!(f, "HLS"),
        }
    }
}

/// One logical download as described by the caller.
///
/// Identity is `(source_url, destination_dir, file_name)`; two tasks with the
/// same identity describe the same download even if the display name differs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    source_url: String,

    display_name: String,

    destination_dir: PathBuf,

    file_name: String,

    resume_cursor: u64,
}

impl Task {
    /// Create a task whose file name is derived from the URL
    pub fn new(
        source_url: impl Into<String>,
        display_name: impl Into<String>,
        destination_dir: impl Into<PathBuf>,
    ) -> Self {
        let source_url = source_url.into();
        let file_name = file_name_from_url(&source_url);
        Self::with_file_name(source_url, display_name, destination_dir, file_name)
    }

    pub fn with_file_name(
        source_url: impl Into<String>,
        display_name: impl Into<String>,
        destination_dir: impl Into<PathBuf>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            source_url: source_url.into(),
            display_name: display_name.into(),
            destination_dir: destination_dir.into(),
            file_name: file_name.into(),
            resume_cursor: 0,
        }
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn destination_dir(&self) -> &Path {
        &self.destination_dir
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Full path of the output file
    pub fn destination_path(&self) -> PathBuf {
        self.destination_dir.join(&self.file_name)
    }

    /// Bytes written when the task was last paused or snapshotted
    pub fn resume_cursor(&self) -> u64 {
        self.resume_cursor
    }

    pub(crate) fn set_resume_cursor(&mut self, cursor: u64) {
        self.resume_cursor = cursor;
    }

    /// Whether both tasks describe the same logical download
    pub fn same_download(&self, other: &Task) -> bool {
        self == other
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.source_url == other.source_url
            && self.destination_dir == other.destination_dir
            && self.file_name == other.file_name
    }
}

impl Eq for Task {}

impl Hash for Task {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source_url.hash(state);
        self.destination_dir.hash(state);
        self.file_name.hash(state);
    }
}

/// AES-128 key reference attached to an HLS segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentKey {
    /// Absolute key URI
    pub uri: String,
    /// Explicit IV; when absent the media sequence number is used
    pub iv: Option<[u8; 16]>,
}

/// One manifest entry of a segmented stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    /// Absolute segment URI
    pub uri: String,
    /// Exact length for byte-range segments, an estimate otherwise
    pub approx_byte_length: Option<u64>,
    /// Duration in seconds
    pub duration: f64,
    /// Media sequence number
    pub sequence: u64,
    /// Inclusive sub-range of the URI (EXT-X-BYTERANGE)
    pub byte_range: Option<(u64, u64)>,
    pub key: Option<SegmentKey>,
}

/// Result of sniffing a URL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnifferInfo {
    /// URL after redirects (the media playlist for HLS)
    pub real_url: String,
    /// Total length, -1 when unknown
    pub content_length: i64,
    pub is_segmented: bool,
    pub segment_manifest: Option<Vec<SegmentDescriptor>>,
    /// The probe was answered with 206 Partial Content
    pub accepts_ranges: bool,
    pub content_type: Option<String>,
    /// Playlist had no EXT-X-ENDLIST
    pub is_live: bool,
}

impl SnifferInfo {
    /// Content length when known
    pub fn known_length(&self) -> Option<u64> {
        u64::try_from(self.content_length).ok()
    }

    pub fn segment_count(&self) -> usize {
        self.segment_manifest.as_ref().map(Vec::len).unwrap_or(0)
    }
}

/// Segment state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentState {
    Pending,

    InProgress,

    Done,

    Failed,
}

/// A byte range of the destination file (or one manifest entry in HLS mode)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub index: usize,
    pub start_offset: u64,
    /// Inclusive end, `None` for an open-ended range of unknown length
    pub end_offset: Option<u64>,
    pub bytes_written: u64,
    pub state: SegmentState,
}

impl Segment {
    pub fn new(index: usize, start_offset: u64, end_offset: Option<u64>) -> Self {
        Self {
            index,
            start_offset,
            end_offset,
            bytes_written: 0,
            state: SegmentState::Pending,
        }
    }

    /// Length of the range, when bounded
    pub fn len(&self) -> Option<u64> {
        self.end_offset
            .map(|end| end.saturating_sub(self.start_offset) + 1)
    }

    /// Next byte to request
    pub fn resume_offset(&self) -> u64 {
        self.start_offset + self.bytes_written
    }

    pub fn remaining(&self) -> Option<u64> {
        self.len().map(|len| len.saturating_sub(self.bytes_written))
    }

    pub fn is_done(&self) -> bool {
        self.state == SegmentState::Done
    }

    /// Forget progress of this segment
    pub fn reset(&mut self) {
        self.bytes_written = 0;
        self.state = SegmentState::Pending;
    }
}

/// Downloader lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Created,

    Started,

    Paused,

    Completed,

    Error,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Whether the state machine allows moving to `next`
    pub fn can_transition_to(&self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Self::Created, Phase::Started)
                | (Self::Started, Phase::Paused)
                | (Self::Started, Phase::Completed)
                | (Self::Started, Phase::Error)
                | (Self::Paused, Phase::Started)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "CREATED",
            Self::Started => "STARTED",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Last terminal error recorded in the state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&EngineError> for ErrorInfo {
    fn from(error: &EngineError) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
        }
    }
}

/// Everything needed to resume a download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadState {
    pub kind: DownloaderKind,
    pub task: Task,
    pub sniffer_info: SnifferInfo,
    pub segments: Vec<Segment>,
    pub phase: Phase,
    pub last_error: Option<ErrorInfo>,
    /// Cleared once the server is seen answering a ranged request with 200
    pub ranges_honored: bool,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    /// Fences out workers of abandoned runs; never persisted
    #[serde(skip)]
    pub run_id: u64,
}

impl DownloadState {
    pub fn new(
        kind: DownloaderKind,
        task: Task,
        sniffer_info: SnifferInfo,
        segments: Vec<Segment>,
    ) -> Self {
        let ranges_honored = sniffer_info.accepts_ranges;
        Self {
            kind,
            task,
            sniffer_info,
            segments,
            phase: Phase::Created,
            last_error: None,
            ranges_honored,
            updated_at: chrono::Utc::now(),
            run_id: 0,
        }
    }

    /// Sum of bytes written over all segments
    pub fn total_bytes_written(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes_written).sum()
    }

    /// Length reported to listeners as `total`, -1 when unknown
    pub fn reported_total(&self) -> i64 {
        self.sniffer_info.content_length
    }

    pub fn is_complete(&self) -> bool {
        let all_done = self.segments.iter().all(Segment::is_done);
        match self.sniffer_info.known_length() {
            Some(len) if self.kind == DownloaderKind::MultiThread => {
                all_done && self.total_bytes_written() == len
            }
            _ => all_done,
        }
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        self.updated_at = chrono::Utc::now();
    }

    /// Turn the state of an interrupted run back into a resumable one
    pub fn normalize_for_resume(&mut self) {
        if self.phase == Phase::Started {
            self.phase = Phase::Paused;
        }
        for segment in &mut self.segments {
            if matches!(segment.state, SegmentState::InProgress | SegmentState::Failed) {
                segment.state = SegmentState::Pending;
            }
        }
        let cursor = self.total_bytes_written();
        self.task.set_resume_cursor(cursor);
    }

    /// Check the structural invariants of the state
    pub fn validate(&self) -> Result<(), EngineError> {
        let corrupt = |reason: String| EngineError::CorruptBlob { reason };

        for (position, segment) in self.segments.iter().enumerate() {
            if segment.index != position {
                return Err(corrupt(format!(
                    "segment at position {} has index {}",
                    position, segment.index
                )));
            }
            if let Some(len) = segment.len() {
                if segment.bytes_written > len {
                    return Err(corrupt(format!(
                        "segment {} wrote {} bytes of {}",
                        segment.index, segment.bytes_written, len
                    )));
                }
            }
        }

        match self.kind {
            DownloaderKind::MultiThread => self.validate_partition(),
            DownloaderKind::Hls => {
                if self.segments.len() != self.sniffer_info.segment_count() {
                    return Err(corrupt(format!(
                        "{} segments for a manifest of {}",
                        self.segments.len(),
                        self.sniffer_info.segment_count()
                    )));
                }
                Ok(())
            }
        }
    }

    fn validate_partition(&self) -> Result<(), EngineError> {
        let corrupt = |reason: String| EngineError::CorruptBlob { reason };
        let mut expected_start = 0u64;

        for segment in &self.segments {
            if segment.start_offset != expected_start {
                return Err(corrupt(format!(
                    "segment {} starts at {} instead of {}",
                    segment.index, segment.start_offset, expected_start
                )));
            }
            match segment.end_offset {
                Some(end) if end >= segment.start_offset => expected_start = end + 1,
                Some(end) => {
                    return Err(corrupt(format!(
                        "segment {} ends at {} before its start {}",
                        segment.index, end, segment.start_offset
                    )))
                }
                None if self.segments.len() == 1 => return Ok(()),
                None => {
                    return Err(corrupt(format!(
                        "open-ended segment {} in a multi-segment partition",
                        segment.index
                    )))
                }
            }
        }

        match self.sniffer_info.known_length() {
            Some(len) if expected_start != len => Err(corrupt(format!(
                "segments cover {} bytes of {}",
                expected_start, len
            ))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info(len: i64) -> SnifferInfo {
        SnifferInfo {
            real_url: "http://example.com/file.bin".to_string(),
            content_length: len,
            is_segmented: false,
            segment_manifest: None,
            accepts_ranges: true,
            content_type: None,
            is_live: false,
        }
    }

    #[test]
    fn test_task_identity_ignores_display_name() {
        let a = Task::new("http://example.com/a.mp4", "first", "/tmp/dl");
        let b = Task::new("http://example.com/a.mp4", "second", "/tmp/dl");
        let c = Task::new("http://example.com/a.mp4", "first", "/tmp/other");

        assert!(a.same_download(&b));
        assert!(!a.same_download(&c));
        assert_eq!(a.file_name(), "a.mp4");
        assert_eq!(a.destination_path(), PathBuf::from("/tmp/dl/a.mp4"));
    }

    #[test]
    fn test_segment_offsets() {
        let mut segment = Segment::new(1, 250, Some(499));
        assert_eq!(segment.len(), Some(250));
        segment.bytes_written = 100;
        assert_eq!(segment.resume_offset(), 350);
        assert_eq!(segment.remaining(), Some(150));

        let open = Segment::new(0, 0, None);
        assert_eq!(open.len(), None);
        assert_eq!(open.remaining(), None);
    }

    #[test]
    fn test_phase_transitions() {
        assert!(Phase::Created.can_transition_to(Phase::Started));
        assert!(Phase::Paused.can_transition_to(Phase::Started));
        assert!(Phase::Started.can_transition_to(Phase::Completed));
        assert!(!Phase::Created.can_transition_to(Phase::Paused));
        assert!(!Phase::Completed.can_transition_to(Phase::Started));
        assert!(!Phase::Error.can_transition_to(Phase::Started));
        assert!(!Phase::Paused.can_transition_to(Phase::Paused));
    }

    #[test]
    fn test_state_validation_detects_gaps() {
        let task = Task::new("http://example.com/file.bin", "file", "/tmp");
        let segments = vec![Segment::new(0, 0, Some(499)), Segment::new(1, 501, Some(999))];
        let state = DownloadState::new(DownloaderKind::MultiThread, task, sample_info(1000), segments);

        assert!(matches!(
            state.validate(),
            Err(EngineError::CorruptBlob { .. })
        ));
    }

    #[test]
    fn test_normalize_for_resume() {
        let task = Task::new("http://example.com/file.bin", "file", "/tmp");
        let mut segments = vec![Segment::new(0, 0, Some(499)), Segment::new(1, 500, Some(999))];
        segments[0].state = SegmentState::InProgress;
        segments[0].bytes_written = 120;
        segments[1].state = SegmentState::Failed;
        let mut state =
            DownloadState::new(DownloaderKind::MultiThread, task, sample_info(1000), segments);
        state.phase = Phase::Started;

        state.normalize_for_resume();

        assert_eq!(state.phase, Phase::Paused);
        assert!(state
            .segments
            .iter()
            .all(|s| s.state == SegmentState::Pending));
        assert_eq!(state.segments[0].bytes_written, 120);
        assert_eq!(state.task.resume_cursor(), 120);
        assert!(state.validate().is_ok());
    }
}
