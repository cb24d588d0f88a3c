//! M3U8 playlist parsing utilities
//!
//! Parses master and media playlists. Parsing is strict: anything the engine
//! cannot download correctly is rejected with the 1-based line number and the
//! text of the offending line.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::error_handling::EngineError;
use crate::core::models::{SegmentDescriptor, SegmentKey};

/// One `#EXT-X-STREAM-INF` entry of a master playlist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantStream {
    pub uri: String,
    pub bandwidth: u64,
    pub resolution: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSegment {
    pub uri: String,
    pub duration: f64,
    pub sequence: u64,
    /// Inclusive (start, end)
    pub byte_range: Option<(u64, u64)>,
    pub key: Option<SegmentKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaPlaylist {
    pub segments: Vec<MediaSegment>,
    pub target_duration: Option<f64>,
    pub media_sequence: u64,
    /// No `#EXT-X-ENDLIST` was seen
    pub is_live: bool,
}

impl MediaPlaylist {
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }

    /// Exact byte total when every segment is a sub-range
    pub fn exact_byte_length(&self) -> Option<u64> {
        self.segments.iter().try_fold(0u64, |total, s| {
            let (start, end) = s.byte_range?;
            total.checked_add(end - start + 1)
        })
    }

    /// Convert into descriptors, estimating sizes from `bandwidth` (bits/s) when known
    pub fn to_descriptors(&self, bandwidth: Option<u64>) -> Vec<SegmentDescriptor> {
        self.segments
            .iter()
            .map(|segment| {
                let approx_byte_length = match segment.byte_range {
                    Some((start, end)) => Some(end - start + 1),
                    None => bandwidth.map(|bps| (bps as f64 * segment.duration / 8.0) as u64),
                };
                SegmentDescriptor {
                    uri: segment.uri.clone(),
                    approx_byte_length,
                    duration: segment.duration,
                    sequence: segment.sequence,
                    byte_range: segment.byte_range,
                    key: segment.key.clone(),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Playlist {
    Master(Vec<VariantStream>),
    Media(MediaPlaylist),
}

impl Playlist {
    /// Variant with the highest advertised bandwidth
    pub fn best_variant(variants: &[VariantStream]) -> Option<&VariantStream> {
        variants.iter().max_by_key(|v| v.bandwidth)
    }
}

/// Parse playlist content, resolving URIs against `base_url`
pub fn parse_playlist(content: &str, base_url: &Url) -> Result<Playlist, EngineError> {
    let mut lines = content
        .trim_start_matches('\u{feff}')
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()));

    match lines.by_ref().find(|(_, line)| !line.is_empty()) {
        Some((_, "#EXTM3U")) => {}
        Some((number, line)) => {
            return Err(EngineError::manifest(number, line, "missing #EXTM3U header"))
        }
        None => return Err(EngineError::manifest(1, "", "empty playlist")),
    }

    let mut parser = PlaylistParser::new(base_url);
    let mut last_line = 1;
    for (number, line) in lines {
        last_line = number;
        if !line.is_empty() {
            parser.feed(number, line)?;
        }
    }
    parser.finish(last_line)
}

struct PlaylistParser<'a> {
    base_url: &'a Url,
    segments: Vec<MediaSegment>,
    variants: Vec<VariantStream>,
    target_duration: Option<f64>,
    media_sequence: u64,
    next_sequence: u64,
    ended: bool,
    pending_duration: Option<(usize, f64)>,
    pending_range: Option<(u64, u64)>,
    pending_variant: Option<(usize, u64, Option<String>)>,
    current_key: Option<SegmentKey>,
    last_range_end: Option<u64>,
}

impl<'a> PlaylistParser<'a> {
    fn new(base_url: &'a Url) -> Self {
        Self {
            base_url,
            segments: Vec::new(),
            variants: Vec::new(),
            target_duration: None,
            media_sequence: 0,
            next_sequence: 0,
            ended: false,
            pending_duration: None,
            pending_range: None,
            pending_variant: None,
            current_key: None,
            last_range_end: None,
        }
    }

    fn feed(&mut self, number: usize, line: &str) -> Result<(), EngineError> {
        let err = |reason: &str| EngineError::manifest(number, line, reason);

        if !line.starts_with('#') {
            return self.push_uri(number, line);
        }

        if let Some(value) = line.strip_prefix("#EXTINF:") {
            let duration_str = value.split(',').next().unwrap_or("").trim();
            let duration = duration_str
                .parse::<f64>()
                .ok()
                .filter(|d| d.is_finite() && *d >= 0.0)
                .ok_or_else(|| err("invalid segment duration"))?;
            self.pending_duration = Some((number, duration));
        } else if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            let duration = value
                .trim()
                .parse::<f64>()
                .map_err(|_| err("invalid target duration"))?;
            self.target_duration = Some(duration);
        } else if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            let sequence = value
                .trim()
                .parse::<u64>()
                .map_err(|_| err("invalid media sequence"))?;
            self.media_sequence = sequence;
            self.next_sequence = sequence;
        } else if let Some(value) = line.strip_prefix("#EXT-X-BYTERANGE:") {
            self.pending_range = Some(self.parse_byte_range(value).map_err(|r| err(r))?);
        } else if let Some(value) = line.strip_prefix("#EXT-X-KEY:") {
            self.current_key = self.parse_key(value).map_err(|r| err(&r))?;
        } else if let Some(value) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            let attributes = parse_attributes(value);
            let bandwidth = attribute(&attributes, "BANDWIDTH")
                .ok_or_else(|| err("variant without BANDWIDTH"))?
                .parse::<u64>()
                .map_err(|_| err("invalid BANDWIDTH"))?;
            let resolution = attribute(&attributes, "RESOLUTION").map(str::to_string);
            self.pending_variant = Some((number, bandwidth, resolution));
        } else if line == "#EXT-X-ENDLIST" {
            self.ended = true;
        }
        Ok(())
    }

    fn push_uri(&mut self, number: usize, line: &str) -> Result<(), EngineError> {
        let uri = self
            .base_url
            .join(line)
            .map_err(|e| EngineError::manifest(number, line, format!("invalid URI: {}", e)))?
            .to_string();

        if let Some((_, bandwidth, resolution)) = self.pending_variant.take() {
            self.variants.push(VariantStream {
                uri,
                bandwidth,
                resolution,
            });
            return Ok(());
        }

        let (_, duration) = self
            .pending_duration
            .take()
            .ok_or_else(|| EngineError::manifest(number, line, "segment URI without #EXTINF"))?;

        let byte_range = self.pending_range.take();
        if let Some((_, end)) = byte_range {
            self.last_range_end = Some(end);
        } else {
            self.last_range_end = None;
        }

        self.segments.push(MediaSegment {
            uri,
            duration,
            sequence: self.next_sequence,
            byte_range,
            key: self.current_key.clone(),
        });
        self.next_sequence += 1;
        Ok(())
    }

    fn parse_byte_range(&self, value: &str) -> Result<(u64, u64), &'static str> {
        let (length, offset) = match value.trim().split_once('@') {
            Some((length, offset)) => (length, Some(offset)),
            None => (value.trim(), None),
        };
        let length = length
            .parse::<u64>()
            .map_err(|_| "invalid BYTERANGE length")?;
        if length == 0 {
            return Err("zero-length BYTERANGE");
        }
        let start = match offset {
            Some(offset) => offset
                .parse::<u64>()
                .map_err(|_| "invalid BYTERANGE offset")?,
            None => self
                .last_range_end
                .ok_or("BYTERANGE without offset must follow another sub-range")?
                .checked_add(1)
                .ok_or("BYTERANGE overflows")?,
        };
        let end = start
            .checked_add(length - 1)
            .ok_or("BYTERANGE overflows")?;
        Ok((start, end))
    }

    fn parse_key(&self, value: &str) -> Result<Option<SegmentKey>, String> {
        let attributes = parse_attributes(value);
        let method = attribute(&attributes, "METHOD").ok_or("key without METHOD")?;

        match method {
            "NONE" => Ok(None),
            "AES-128" => {
                let uri = attribute(&attributes, "URI").ok_or("AES-128 key without URI")?;
                let uri = self
                    .base_url
                    .join(uri)
                    .map_err(|e| format!("invalid key URI: {}", e))?
                    .to_string();
                let iv = attribute(&attributes, "IV").map(parse_iv).transpose()?;
                Ok(Some(SegmentKey { uri, iv }))
            }
            other => Err(format!("unsupported encryption method {}", other)),
        }
    }

    fn finish(mut self, last_line: usize) -> Result<Playlist, EngineError> {
        if let Some((number, _)) = self.pending_duration.take() {
            return Err(EngineError::manifest(number, "#EXTINF", "#EXTINF without segment URI"));
        }
        if let Some((number, _, _)) = self.pending_variant.take() {
            return Err(EngineError::manifest(
                number,
                "#EXT-X-STREAM-INF",
                "variant without URI",
            ));
        }

        match (self.variants.is_empty(), self.segments.is_empty()) {
            (false, true) => Ok(Playlist::Master(self.variants)),
            (false, false) => Err(EngineError::manifest(
                last_line,
                "",
                "playlist mixes variant streams and media segments",
            )),
            (true, true) => Err(EngineError::manifest(
                last_line,
                "",
                "playlist contains no segments",
            )),
            (true, false) => Ok(Playlist::Media(MediaPlaylist {
                segments: self.segments,
                target_duration: self.target_duration,
                media_sequence: self.media_sequence,
                is_live: !self.ended,
            })),
        }
    }
}

/// Split an attribute list, honouring quoted values
fn parse_attributes(input: &str) -> Vec<(String, String)> {
    let mut attributes = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut pieces = Vec::new();

    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => pieces.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    pieces.push(current);

    for piece in pieces {
        if let Some((name, value)) = piece.split_once('=') {
            let value = value.trim().trim_matches('"');
            attributes.push((name.trim().to_ascii_uppercase(), value.to_string()));
        }
    }
    attributes
}

fn attribute<'v>(attributes: &'v [(String, String)], name: &str) -> Option<&'v str> {
    attributes
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

fn parse_iv(value: &str) -> Result<[u8; 16], String> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .ok_or("IV must start with 0x")?;
    let bytes = hex::decode(digits).map_err(|e| format!("invalid IV: {}", e))?;
    <[u8; 16]>::try_from(bytes.as_slice()).map_err(|_| "IV must be 16 bytes".to_string())
}

/// IV derived from the media sequence number
pub fn sequence_iv(sequence: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&sequence.to_be_bytes());
    iv
}
