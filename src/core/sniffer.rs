//! Resource sniffing
//!
//! Resolves a URL into [`SnifferInfo`] with a one-byte ranged GET. The probe
//! tells us the final URL after redirects, the total length and whether the
//! server honours ranges. Playlists are then fetched and parsed; a master
//! playlist is resolved to its highest-bandwidth variant.

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, info};
use url::Url;

use crate::core::config::EngineConfig;
use crate::core::error_handling::EngineError;
use crate::core::models::SnifferInfo;
use crate::parsers::m3u8_parser::{parse_playlist, MediaPlaylist, Playlist};
use crate::utils::network::{response_content_range, send_following_redirects, ByteRange};
use crate::utils::validation::{looks_like_playlist, validate_url};

#[derive(Debug, Clone)]
pub struct Sniffer {
    client: Client,
    max_redirects: usize,
}

struct ProbeResult {
    final_url: Url,
    content_length: i64,
    accepts_ranges: bool,
    content_type: Option<String>,
}

impl Sniffer {
    pub fn new(client: Client, config: &EngineConfig) -> Self {
        Self {
            client,
            max_redirects: config.max_redirects,
        }
    }

    /// Probe `url` and describe how it can be downloaded. No disk side effects.
    pub async fn sniff(&self, url: &str) -> Result<SnifferInfo, EngineError> {
        validate_url(url)?;
        let probe = self.probe(url).await?;

        if !looks_like_playlist(&probe.final_url, probe.content_type.as_deref()) {
            info!(
                "Sniffed {}: length={} ranges={}",
                probe.final_url, probe.content_length, probe.accepts_ranges
            );
            return Ok(SnifferInfo {
                real_url: probe.final_url.to_string(),
                content_length: probe.content_length,
                is_segmented: false,
                segment_manifest: None,
                accepts_ranges: probe.accepts_ranges,
                content_type: probe.content_type,
                is_live: false,
            });
        }

        let (playlist_url, playlist, bandwidth) = self.resolve_media_playlist(&probe.final_url).await?;
        let content_length = playlist
            .exact_byte_length()
            .and_then(|len| i64::try_from(len).ok())
            .unwrap_or(-1);

        info!(
            "Sniffed playlist {}: {} segments, {:.1}s, live={}",
            playlist_url,
            playlist.segments.len(),
            playlist.total_duration(),
            playlist.is_live
        );

        Ok(SnifferInfo {
            real_url: playlist_url.to_string(),
            content_length,
            is_segmented: true,
            segment_manifest: Some(playlist.to_descriptors(bandwidth)),
            accepts_ranges: probe.accepts_ranges,
            content_type: probe.content_type,
            is_live: playlist.is_live,
        })
    }

    async fn probe(&self, url: &str) -> Result<ProbeResult, EngineError> {
        let (response, final_url) = send_following_redirects(
            &self.client,
            url,
            Some(ByteRange::new(0, Some(0))),
            self.max_redirects,
        )
        .await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let status = response.status();
        let (content_length, accepts_ranges) = match status {
            StatusCode::PARTIAL_CONTENT => {
                let total = response_content_range(&response).and_then(|r| r.total);
                (to_length(total), true)
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                let total = response_content_range(&response).and_then(|r| r.total);
                (to_length(total), true)
            }
            s if s.is_success() => (to_length(response.content_length()), false),
            s => {
                return Err(EngineError::HttpStatus {
                    status: s.as_u16(),
                    url: final_url.to_string(),
                })
            }
        };

        debug!(
            "Probe {} -> {} status={} length={}",
            url, final_url, status, content_length
        );

        Ok(ProbeResult {
            final_url,
            content_length,
            accepts_ranges,
            content_type,
        })
    }

    async fn resolve_media_playlist(
        &self,
        url: &Url,
    ) -> Result<(Url, MediaPlaylist, Option<u64>), EngineError> {
        let (playlist_url, content) = self.fetch_text(url.as_str()).await?;

        match parse_playlist(&content, &playlist_url)? {
            Playlist::Media(media) => Ok((playlist_url, media, None)),
            Playlist::Master(variants) => {
                let variant = Playlist::best_variant(&variants).ok_or_else(|| {
                    EngineError::manifest(1, "#EXTM3U", "master playlist without variants")
                })?;
                info!(
                    "Selected variant {} ({} bps) of {}",
                    variant.uri, variant.bandwidth, playlist_url
                );

                let (media_url, content) = self.fetch_text(&variant.uri).await?;
                match parse_playlist(&content, &media_url)? {
                    Playlist::Media(media) => Ok((media_url, media, Some(variant.bandwidth))),
                    Playlist::Master(_) => Err(EngineError::manifest(
                        1,
                        "#EXTM3U",
                        "variant playlist is itself a master playlist",
                    )),
                }
            }
        }
    }

    async fn fetch_text(&self, url: &str) -> Result<(Url, String), EngineError> {
        let (response, final_url) =
            send_following_redirects(&self.client, url, None, self.max_redirects).await?;
        let response = require_success(response, &final_url)?;
        let content = response.text().await?;
        Ok((final_url, content))
    }
}

fn to_length(length: Option<u64>) -> i64 {
    length.and_then(|l| i64::try_from(l).ok()).unwrap_or(-1)
}

fn require_success(response: Response, url: &Url) -> Result<Response, EngineError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(EngineError::HttpStatus {
            status: response.status().as_u16(),
            url: url.to_string(),
        })
    }
}
