//! Error taxonomy and retry policy
//!
//! Every failure the engine can surface is an [`EngineError`]. Each variant maps
//! to a stable [`ErrorCode`] that listeners receive together with the message,
//! so callers can branch on the code without parsing text.
//!
//! Retry timing for segment transfers is described by [`RetryPolicy`]:
//! exponential backoff with a cap and symmetric jitter.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::core::models::{DownloaderKind, Phase};

/// Default base delay for exponential backoff (500ms)
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Maximum delay cap for exponential backoff (10 seconds)
pub const MAX_DELAY_CAP: Duration = Duration::from_secs(10);

/// Stable error codes reported to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Network,
    TooManyRedirects,
    UnrecognizedContent,
    HttpStatus,
    ManifestParse,
    Transfer,
    SegmentExhausted,
    RangeNotSupported,
    Io,
    ProgressDiscarded,
    CorruptBlob,
    InvalidTransition,
    Config,
    UnsupportedKind,
}

impl ErrorCode {
    /// Numeric form of the code
    pub fn as_u16(&self) -> u16 {
        match self {
            Self::Network => 100,
            Self::TooManyRedirects => 101,
            Self::UnrecognizedContent => 102,
            Self::HttpStatus => 103,
            Self::ManifestParse => 200,
            Self::Transfer => 300,
            Self::SegmentExhausted => 301,
            Self::RangeNotSupported => 302,
            Self::Io => 303,
            Self::ProgressDiscarded => 304,
            Self::CorruptBlob => 400,
            Self::InvalidTransition => 500,
            Self::Config => 600,
            Self::UnsupportedKind => 601,
        }
    }

    /// Symbolic form of the code
    pub fn name(&self) -> &'static str {
        match self {
            Self::Network => "NETWORK",
            Self::TooManyRedirects => "TOO_MANY_REDIRECTS",
            Self::UnrecognizedContent => "UNRECOGNIZED_CONTENT",
            Self::HttpStatus => "HTTP_STATUS",
            Self::ManifestParse => "MANIFEST_PARSE",
            Self::Transfer => "TRANSFER",
            Self::SegmentExhausted => "SEGMENT_EXHAUSTED",
            Self::RangeNotSupported => "RANGE_NOT_SUPPORTED",
            Self::Io => "IO",
            Self::ProgressDiscarded => "PROGRESS_DISCARDED",
            Self::CorruptBlob => "CORRUPT_BLOB",
            Self::InvalidTransition => "INVALID_TRANSITION",
            Self::Config => "CONFIG",
            Self::UnsupportedKind => "UNSUPPORTED_KIND",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.as_u16())
    }
}

/// Engine failures
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Too many redirects (limit {limit}) starting at {url}")]
    TooManyRedirects { limit: usize, url: String },

    #[error("Unrecognized content: {reason}")]
    UnrecognizedContent { reason: String },

    #[error("HTTP status {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Manifest parse error at line {line_number} ({line:?}): {reason}")]
    ManifestParse {
        line_number: usize,
        line: String,
        reason: String,
    },

    #[error("Transfer error: {message}")]
    Transfer { message: String },

    #[error("Segment {index} failed after {attempts} attempts: {message}")]
    SegmentExhausted {
        index: usize,
        attempts: u32,
        message: String,
    },

    #[error("Server does not honor range requests for {url}")]
    RangeNotSupported { url: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt resume blob: {reason}")]
    CorruptBlob { reason: String },

    #[error("Cannot {operation} while {phase}")]
    InvalidTransition {
        operation: &'static str,
        phase: Phase,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("No scheduler registered for kind {kind}")]
    UnsupportedKind { kind: DownloaderKind },
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Network { .. } => ErrorCode::Network,
            Self::TooManyRedirects { .. } => ErrorCode::TooManyRedirects,
            Self::UnrecognizedContent { .. } => ErrorCode::UnrecognizedContent,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::ManifestParse { .. } => ErrorCode::ManifestParse,
            Self::Transfer { .. } => ErrorCode::Transfer,
            Self::SegmentExhausted { .. } => ErrorCode::SegmentExhausted,
            Self::RangeNotSupported { .. } => ErrorCode::RangeNotSupported,
            Self::Io(_) => ErrorCode::Io,
            Self::CorruptBlob { .. } => ErrorCode::CorruptBlob,
            Self::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            Self::Config { .. } => ErrorCode::Config,
            Self::UnsupportedKind { .. } => ErrorCode::UnsupportedKind,
        }
    }

    /// Determine if a segment transfer failing with this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Transfer { .. } | Self::Io(_) => true,
            Self::HttpStatus { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn transfer(message: impl Into<String>) -> Self {
        Self::Transfer {
            message: message.into(),
        }
    }

    pub fn manifest(line_number: usize, line: &str, reason: impl Into<String>) -> Self {
        Self::ManifestParse {
            line_number,
            line: line.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(error: reqwest::Error) -> Self {
        if let Some(status) = error.status() {
            return Self::HttpStatus {
                status: status.as_u16(),
                url: error.url().map(|u| u.to_string()).unwrap_or_default(),
            };
        }
        Self::Network {
            message: error.to_string(),
        }
    }
}

impl From<bincode::Error> for EngineError {
    fn from(error: bincode::Error) -> Self {
        Self::CorruptBlob {
            reason: error.to_string(),
        }
    }
}

/// Retry timing for failed segment transfers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Relative jitter, 0.1 means ±5%
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: DEFAULT_BASE_DELAY.as_millis() as u64,
            max_delay_ms: MAX_DELAY_CAP.as_millis() as u64,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Total attempts including the first one
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let delay_ms = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_delay_ms as f64);

        if self.jitter_factor <= 0.0 {
            return Duration::from_millis(capped as u64);
        }

        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5);
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        let err = EngineError::SegmentExhausted {
            index: 2,
            attempts: 4,
            message: "connection reset".to_string(),
        };
        assert_eq!(err.code(), ErrorCode::SegmentExhausted);
        assert_eq!(err.code().as_u16(), 301);
        assert_eq!(err.code().name(), "SEGMENT_EXHAUSTED");

        let err = EngineError::InvalidTransition {
            operation: "pause",
            phase: Phase::Created,
        };
        assert_eq!(err.to_string(), "Cannot pause while CREATED");
        assert_eq!(err.code().as_u16(), 500);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::transfer("short body").is_retryable());
        assert!(EngineError::HttpStatus {
            status: 503,
            url: String::new()
        }
        .is_retryable());
        assert!(!EngineError::HttpStatus {
            status: 404,
            url: String::new()
        }
        .is_retryable());
        assert!(!EngineError::CorruptBlob {
            reason: "bad".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_exponential_backoff_without_jitter() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 1000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
        assert_eq!(policy.max_attempts(), 6);
    }

    #[test]
    fn test_backoff_jitter_stays_in_bounds() {
        let policy = RetryPolicy {
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            jitter_factor: 0.2,
            ..RetryPolicy::default()
        };

        for _ in 0..100 {
            let delay = policy.delay_for(1).as_millis();
            assert!((900..=1100).contains(&delay), "delay {} out of range", delay);
        }
    }
}
