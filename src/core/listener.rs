//! Download lifecycle observers
//!
//! [`DownloadListener`] has one method per event, each with an empty default,
//! so implementors only override what they need. Methods may be called from
//! any tokio worker thread. [`ChannelListener`] turns the callbacks into
//! [`DownloadEvent`] values on an unbounded channel, and [`LoggingListener`]
//! writes them to `tracing`.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::core::error_handling::ErrorCode;
use crate::core::models::{SnifferInfo, Task};

pub trait DownloadListener: Send + Sync {
    /// Sniffing succeeded; `info` describes the resolved resource
    fn on_created(&self, _task: &Task, _info: &SnifferInfo) {}

    fn on_start(&self, _task: &Task) {}

    fn on_pause(&self, _task: &Task) {}

    /// `total` is -1 when the length is unknown
    fn on_progress(&self, _task: &Task, _total: i64, _downloaded: u64) {}

    fn on_segment_complete(&self, _task: &Task, _index: usize, _count: usize) {}

    /// Non-terminal conditions
    fn on_warning(&self, _task: &Task, _code: ErrorCode, _message: &str) {}

    fn on_error(&self, _task: &Task, _code: ErrorCode, _message: &str) {}

    fn on_complete(&self, _task: &Task, _total: u64) {}

    /// Resume blob to persist
    fn on_save_instance(&self, _task: &Task, _blob: &[u8]) {}
}

/// Message form of the listener callbacks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DownloadEvent {
    Created { task: Task, info: SnifferInfo },
    Started { task: Task },
    Paused { task: Task },
    Progress { task: Task, total: i64, downloaded: u64 },
    SegmentComplete { task: Task, index: usize, count: usize },
    Warning { task: Task, code: ErrorCode, message: String },
    Error { task: Task, code: ErrorCode, message: String },
    Completed { task: Task, total: u64 },
    SaveInstance { task: Task, blob: Vec<u8> },
}

impl DownloadEvent {
    pub fn task(&self) -> &Task {
        match self {
            Self::Created { task, .. }
            | Self::Started { task }
            | Self::Paused { task }
            | Self::Progress { task, .. }
            | Self::SegmentComplete { task, .. }
            | Self::Warning { task, .. }
            | Self::Error { task, .. }
            | Self::Completed { task, .. }
            | Self::SaveInstance { task, .. } => task,
        }
    }
}

/// Forwards every callback as a [`DownloadEvent`]
#[derive(Debug, Clone)]
pub struct ChannelListener {
    sender: mpsc::UnboundedSender<DownloadEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DownloadEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn from_sender(sender: mpsc::UnboundedSender<DownloadEvent>) -> Self {
        Self { sender }
    }

    fn send(&self, event: DownloadEvent) {
        // Receiver gone means nobody is listening anymore
        let _ = self.sender.send(event);
    }
}

impl DownloadListener for ChannelListener {
    fn on_created(&self, task: &Task, info: &SnifferInfo) {
        self.send(DownloadEvent::Created {
            task: task.clone(),
            info: info.clone(),
        });
    }

    fn on_start(&self, task: &Task) {
        self.send(DownloadEvent::Started { task: task.clone() });
    }

    fn on_pause(&self, task: &Task) {
        self.send(DownloadEvent::Paused { task: task.clone() });
    }

    fn on_progress(&self, task: &Task, total: i64, downloaded: u64) {
        self.send(DownloadEvent::Progress {
            task: task.clone(),
            total,
            downloaded,
        });
    }

    fn on_segment_complete(&self, task: &Task, index: usize, count: usize) {
        self.send(DownloadEvent::SegmentComplete {
            task: task.clone(),
            index,
            count,
        });
    }

    fn on_warning(&self, task: &Task, code: ErrorCode, message: &str) {
        self.send(DownloadEvent::Warning {
            task: task.clone(),
            code,
            message: message.to_string(),
        });
    }

    fn on_error(&self, task: &Task, code: ErrorCode, message: &str) {
        self.send(DownloadEvent::Error {
            task: task.clone(),
            code,
            message: message.to_string(),
        });
    }

    fn on_complete(&self, task: &Task, total: u64) {
        self.send(DownloadEvent::Completed {
            task: task.clone(),
            total,
        });
    }

    fn on_save_instance(&self, task: &Task, blob: &[u8]) {
        self.send(DownloadEvent::SaveInstance {
            task: task.clone(),
            blob: blob.to_vec(),
        });
    }
}

/// Logs lifecycle events through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl DownloadListener for LoggingListener {
    fn on_created(&self, task: &Task, info: &SnifferInfo) {
        info!(
            "[{}] created: {} ({} bytes, segmented={}) -> {:?}",
            task.display_name(),
            info.real_url,
            info.content_length,
            info.is_segmented,
            task.destination_path()
        );
    }

    fn on_start(&self, task: &Task) {
        info!("[{}] started", task.display_name());
    }

    fn on_pause(&self, task: &Task) {
        info!("[{}] paused at {} bytes", task.display_name(), task.resume_cursor());
    }

    fn on_progress(&self, task: &Task, total: i64, downloaded: u64) {
        if total > 0 {
            info!(
                "[{}] {}/{} bytes ({:.1}%)",
                task.display_name(),
                downloaded,
                total,
                downloaded as f64 / total as f64 * 100.0
            );
        } else {
            info!("[{}] {} bytes", task.display_name(), downloaded);
        }
    }

    fn on_warning(&self, task: &Task, code: ErrorCode, message: &str) {
        warn!("[{}] {}: {}", task.display_name(), code, message);
    }

    fn on_error(&self, task: &Task, code: ErrorCode, message: &str) {
        error!("[{}] {}: {}", task.display_name(), code, message);
    }

    fn on_complete(&self, task: &Task, total: u64) {
        info!("[{}] completed, {} bytes", task.display_name(), total);
    }

    fn on_save_instance(&self, task: &Task, blob: &[u8]) {
        info!("[{}] resume blob of {} bytes", task.display_name(), blob.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Silent;
    impl DownloadListener for Silent {}

    fn sniffed() -> SnifferInfo {
        SnifferInfo {
            real_url: "http://cdn.example.com/a.bin".to_string(),
            content_length: 1000,
            is_segmented: false,
            segment_manifest: None,
            accepts_ranges: true,
            content_type: Some("application/octet-stream".to_string()),
            is_live: false,
        }
    }

    #[test]
    fn test_default_methods_are_no_ops() {
        let task = Task::new("http://example.com/a.bin", "a", "/tmp");
        let listener: &dyn DownloadListener = &Silent;
        listener.on_created(&task, &sniffed());
        listener.on_progress(&task, -1, 10);
        listener.on_error(&task, ErrorCode::Network, "boom");
    }

    #[test]
    fn test_channel_listener_forwards_events() {
        let (listener, mut receiver) = ChannelListener::new();
        let task = Task::new("http://example.com/a.bin", "a", "/tmp");

        listener.on_created(&task, &sniffed());
        listener.on_start(&task);
        listener.on_progress(&task, 100, 40);
        listener.on_save_instance(&task, &[1, 2, 3]);

        match receiver.try_recv().unwrap() {
            DownloadEvent::Created { info, .. } => {
                assert_eq!(info.real_url, "http://cdn.example.com/a.bin");
                assert_eq!(info.content_length, 1000);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            receiver.try_recv().unwrap(),
            DownloadEvent::Started { task: task.clone() }
        );
        assert_eq!(
            receiver.try_recv().unwrap(),
            DownloadEvent::Progress {
                task: task.clone(),
                total: 100,
                downloaded: 40
            }
        );
        match receiver.try_recv().unwrap() {
            DownloadEvent::SaveInstance { blob, .. } => assert_eq!(blob, vec![1, 2, 3]),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_logging_listener_handles_unknown_total() {
        let task = Task::new("http://example.com/a.bin", "a", "/tmp");
        let listener = LoggingListener;
        listener.on_created(&task, &sniffed());
        listener.on_progress(&task, -1, 10);
        listener.on_progress(&task, 100, 10);
        listener.on_warning(&task, ErrorCode::RangeNotSupported, "ranges ignored");
    }

    #[test]
    fn test_channel_listener_survives_dropped_receiver() {
        let (listener, receiver) = ChannelListener::new();
        drop(receiver);
        let task = Task::new("http://example.com/a.bin", "a", "/tmp");
        listener.on_complete(&task, 5);
    }
}
