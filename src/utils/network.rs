//! Network utilities and helpers

use reqwest::header::{CONTENT_RANGE, LOCATION, RANGE};
use reqwest::{Client, Response};
use url::Url;

use crate::core::config::EngineConfig;
use crate::core::error_handling::EngineError;

/// Default user agent string
pub const DEFAULT_USER_AGENT: &str = "StreamDownloader/1.0";

/// Build the HTTP client shared by the sniffer and the schedulers.
///
/// Redirects are disabled at the client level; [`send_following_redirects`]
/// follows them with an explicit hop limit.
pub fn build_client(config: &EngineConfig) -> Result<Client, EngineError> {
    Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(config.connect_timeout())
        .user_agent(config.user_agent.clone())
        .build()
        .map_err(|e| EngineError::Config {
            message: format!("Failed to build HTTP client: {}", e),
        })
}

/// Inclusive byte range for a `Range` header, `None` end means "to the end"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// Issue a GET, following redirects manually up to `max_redirects` hops.
///
/// Returns the final response and the URL that produced it. The range header,
/// when given, is sent on every hop.
pub async fn send_following_redirects(
    client: &Client,
    url: &str,
    range: Option<ByteRange>,
    max_redirects: usize,
) -> Result<(Response, Url), EngineError> {
    let mut current = Url::parse(url).map_err(|e| EngineError::UnrecognizedContent {
        reason: format!("Invalid URL {:?}: {}", url, e),
    })?;
    let mut hops = 0usize;

    loop {
        let mut request = client.get(current.clone());
        if let Some(range) = range {
            request = request.header(RANGE, range.header_value());
        }

        let response = request.send().await?;
        if !response.status().is_redirection() {
            return Ok((response, current));
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| EngineError::HttpStatus {
                status: response.status().as_u16(),
                url: current.to_string(),
            })?;

        hops += 1;
        if hops > max_redirects {
            return Err(EngineError::TooManyRedirects {
                limit: max_redirects,
                url: url.to_string(),
            });
        }

        let next = current
            .join(location)
            .map_err(|e| EngineError::Network {
                message: format!("Invalid redirect target {:?}: {}", location, e),
            })?;
        tracing::debug!("Redirect {} -> {}", current, next);
        current = next;
    }
}

/// Parsed `Content-Range` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// Served range, absent for `bytes */N`
    pub range: Option<(u64, u64)>,
    /// Complete length, absent for `/*`
    pub total: Option<u64>,
}

/// Parse `bytes a-b/N`, `bytes a-b/*` and `bytes */N`
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range_part, total_part) = rest.split_once('/')?;

    let total = match total_part.trim() {
        "*" => None,
        digits => Some(digits.parse::<u64>().ok()?),
    };

    let range = match range_part.trim() {
        "*" => None,
        span => {
            let (start, end) = span.split_once('-')?;
            let start = start.trim().parse::<u64>().ok()?;
            let end = end.trim().parse::<u64>().ok()?;
            if end < start {
                return None;
            }
            Some((start, end))
        }
    };

    if range.is_none() && total.is_none() {
        return None;
    }
    Some(ContentRange { range, total })
}

/// Content-Range of a response, if present and well formed
pub fn response_content_range(response: &Response) -> Option<ContentRange> {
    response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_content_range)
}
