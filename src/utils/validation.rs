//! URL and input validation utilities

use url::Url;

use crate::core::error_handling::EngineError;

/// Parse a URL and require an http(s) scheme
pub fn validate_url(url: &str) -> Result<Url, EngineError> {
    let parsed = Url::parse(url).map_err(|e| EngineError::UnrecognizedContent {
        reason: format!("Invalid URL format {:?}: {}", url, e),
    })?;

    if !is_http_url(&parsed) {
        return Err(EngineError::UnrecognizedContent {
            reason: format!("Unsupported URL scheme: {}", parsed.scheme()),
        });
    }
    Ok(parsed)
}

pub fn is_http_url(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

/// Whether a URL path or MIME type points at an HLS playlist
pub fn looks_like_playlist(url: &Url, content_type: Option<&str>) -> bool {
    let by_mime = content_type
        .map(|mime| mime.to_ascii_lowercase().contains("mpegurl"))
        .unwrap_or(false);
    by_mime || url.path().to_ascii_lowercase().ends_with(".m3u8")
}
