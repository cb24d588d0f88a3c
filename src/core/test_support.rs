//! Shared fixtures for the engine tests: a wiremock responder that speaks
//! byte ranges, a fast test configuration and event collection helpers.

use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use wiremock::{Request, Respond, ResponseTemplate};

use crate::core::config::EngineConfig;
use crate::core::error_handling::RetryPolicy;
use crate::core::listener::DownloadEvent;

/// How a [`RangeResponder`] treats `Range` headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeMode {
    Honour,
    /// Only the one-byte sniff request gets a 206, everything else the full body
    SniffOnly,
    Ignore,
}

/// Serves `body`, honouring `Range: bytes=a-b` according to `mode`
#[derive(Debug, Clone)]
pub struct RangeResponder {
    body: Vec<u8>,
    mode: RangeMode,
    /// Ranged requests starting at or after this offset are delayed
    slow_from: Option<(u64, Duration)>,
    /// Ranged requests starting at or after this offset get a 500
    fail_from: Option<u64>,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            mode: RangeMode::Honour,
            slow_from: None,
            fail_from: None,
        }
    }

    pub fn mode(mut self, mode: RangeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn slow_from(mut self, offset: u64, delay: Duration) -> Self {
        self.slow_from = Some((offset, delay));
        self
    }

    pub fn fail_from(mut self, offset: u64) -> Self {
        self.fail_from = Some(offset);
        self
    }

    fn full(&self) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("content-type", "application/octet-stream")
            .set_body_bytes(self.body.clone())
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let Some((start, end)) = requested_range(request) else {
            return self.full();
        };
        let is_sniff = start == 0 && end == Some(0);

        match self.mode {
            RangeMode::Ignore => return self.full(),
            RangeMode::SniffOnly if !is_sniff => return self.full(),
            _ => {}
        }

        if !is_sniff && self.fail_from.is_some_and(|offset| start >= offset) {
            return ResponseTemplate::new(500);
        }

        let total = self.body.len() as u64;
        if start >= total {
            return ResponseTemplate::new(416)
                .insert_header("content-range", format!("bytes */{}", total).as_str());
        }

        let last = end.unwrap_or(total - 1).min(total - 1);
        let slice = self.body[start as usize..=last as usize].to_vec();
        let mut response = ResponseTemplate::new(206)
            .insert_header("content-type", "application/octet-stream")
            .insert_header(
                "content-range",
                format!("bytes {}-{}/{}", start, last, total).as_str(),
            )
            .set_body_bytes(slice);

        if let Some((offset, delay)) = self.slow_from {
            if !is_sniff && start >= offset {
                response = response.set_delay(delay);
            }
        }
        response
    }
}

/// `(start, end)` of a `Range: bytes=start-[end]` header
pub fn requested_range(request: &Request) -> Option<(u64, Option<u64>)> {
    let value = request.headers.get("range")?.to_str().ok()?;
    let bounds = value.trim().strip_prefix("bytes=")?;
    let (start, end) = bounds.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => None,
        end => Some(end.parse().ok()?),
    };
    Some((start, end))
}

/// Raw `Range` header values of the requests a server received
pub fn range_headers(requests: &[Request]) -> Vec<String> {
    requests
        .iter()
        .filter_map(|r| r.headers.get("range"))
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect()
}

/// Deterministic, non-repeating-looking payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Small segments, quick retries and frequent progress ticks
pub fn test_config() -> EngineConfig {
    EngineConfig {
        concurrency: 4,
        min_segment_size: 1,
        retry: RetryPolicy {
            max_retries: 2,
            base_delay_ms: 10,
            max_delay_ms: 50,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        },
        connect_timeout_secs: 5,
        read_timeout_secs: 10,
        progress_interval_ms: 20,
        pause_timeout_ms: 2000,
        ..EngineConfig::default()
    }
}

pub fn is_terminal(event: &DownloadEvent) -> bool {
    matches!(
        event,
        DownloadEvent::Completed { .. } | DownloadEvent::Error { .. }
    )
}

/// Collect events up to and including the first COMPLETED or ERROR
pub async fn collect_until_end(events: &mut UnboundedReceiver<DownloadEvent>) -> Vec<DownloadEvent> {
    collect_until(events, is_terminal).await
}

/// Collect events up to and including the first one matching `done`
pub async fn collect_until(
    events: &mut UnboundedReceiver<DownloadEvent>,
    done: impl Fn(&DownloadEvent) -> bool,
) -> Vec<DownloadEvent> {
    let mut collected = Vec::new();
    let result = timeout(Duration::from_secs(20), async {
        while let Some(event) = events.recv().await {
            let finished = done(&event);
            collected.push(event);
            if finished {
                return;
            }
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for events: {:?}", collected);
    collected
}

/// Drain whatever is already queued
pub fn drain(events: &mut UnboundedReceiver<DownloadEvent>) -> Vec<DownloadEvent> {
    let mut collected = Vec::new();
    while let Ok(event) = events.try_recv() {
        collected.push(event);
    }
    collected
}

pub fn warnings(events: &[DownloadEvent]) -> Vec<crate::core::error_handling::ErrorCode> {
    events
        .iter()
        .filter_map(|e| match e {
            DownloadEvent::Warning { code, .. } => Some(*code),
            _ => None,
        })
        .collect()
}
