//! File system utilities

use std::fs;
use std::io;
use std::path::Path;

/// File name used when a URL has no usable last path segment
pub const FALLBACK_FILE_NAME: &str = "download";

/// Ensure directory exists
pub fn ensure_dir_exists(path: &Path) -> io::Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Get file extension
pub fn get_file_extension(filename: &str) -> Option<&str> {
    Path::new(filename).extension().and_then(|ext| ext.to_str())
}

/// Sanitize filename for filesystem
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// Derive a file name from the last path segment of a URL
pub fn file_name_from_url(url: &str) -> String {
    let segment = url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|segment| !segment.is_empty());

    let decoded = segment.map(|s| percent_decode(&s));
    match decoded.as_deref().map(sanitize_filename) {
        Some(name) if !name.trim_matches(|c| c == '.' || c == '_').is_empty() => name,
        _ => FALLBACK_FILE_NAME.to_string(),
    }
}

fn percent_decode(input: &str) -> String {
    url::form_urlencoded::parse(format!("x={}", input.replace('+', "%2B")).as_bytes())
        .next()
        .map(|(_, value)| value.into_owned())
        .unwrap_or_else(|| input.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a<b>c:d.mp4"), "a_b_c_d.mp4");
        assert_eq!(sanitize_filename("dir/name\\x"), "dir_name_x");
        assert_eq!(sanitize_filename("plain.ts"), "plain.ts");
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(
            file_name_from_url("https://cdn.example.com/videos/movie.mp4?token=1"),
            "movie.mp4"
        );
        assert_eq!(
            file_name_from_url("https://cdn.example.com/a/my%20clip.mp4"),
            "my clip.mp4"
        );
        assert_eq!(file_name_from_url("https://cdn.example.com/"), "download");
        assert_eq!(file_name_from_url("not a url"), "download");
    }

    #[test]
    fn test_ensure_dir_exists() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        ensure_dir_exists(&nested).unwrap();
        assert!(nested.is_dir());
        ensure_dir_exists(&nested).unwrap();
    }

    #[test]
    fn test_get_file_extension() {
        assert_eq!(get_file_extension("index.m3u8"), Some("m3u8"));
        assert_eq!(get_file_extension("README"), None);
    }
}
