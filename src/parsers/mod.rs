//! Playlist parsing

pub mod m3u8_parser;

pub use m3u8_parser::*;
