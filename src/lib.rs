// Copyright (C) 2026 The sanchez developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `.sanchez` video container format and streaming protocol.
//!
//! The container is a line-oriented file: one JSON metadata line, one
//! fixed-width geometry/length line, then one line per frame in either of
//! two encodings (zlib+base64, or literal hex triples). See [container].
//!
//! The streaming protocol fragments frames into MTU-sized packets and
//! carries them over TCP or UDP (unicast, multicast, or broadcast),
//! optionally with XOR forward error correction for satellite-style lossy
//! links. See [server] and [client].

use serde::{Deserialize, Serialize};

mod error;

pub mod client;
pub mod codec;
pub mod container;
pub mod frame;
pub mod packet;
pub mod player;
pub mod server;
pub mod transport;

pub use error::{Error, FormatError, ProtocolError};
pub use frame::{Frame, FrameStore};

/// Largest width or height the config line can express.
pub const MAX_DIMENSION: u32 = 9_999;

/// Largest frame count the config line can express.
pub const MAX_FRAME_COUNT: u32 = 9_999_999;

/// Exact byte length of the config line (sans newline).
pub const CONFIG_LINE_LEN: usize = 15;

/// Frame rate assumed when the metadata carries no usable duration.
pub const DEFAULT_FPS: f64 = 24.0;

/// The descriptive header serialized as the container's first line and as
/// the payload of a `METADATA` packet. All fields are strings; `seconds`
/// holds the total duration as a decimal.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Metadata {
    pub title: String,
    pub creator: String,
    pub created_at: String,
    pub seconds: String,
}

impl Metadata {
    /// Parses the `seconds` field. Returns `None` when it isn't a positive
    /// decimal.
    pub fn duration_secs(&self) -> Option<f64> {
        self.seconds
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|s| s.is_finite() && *s > 0.)
    }
}

/// The geometry/length triple serialized as the container's second line and
/// as the payload of a `CONFIG` packet: `width(4) ‖ height(4) ‖
/// frame_count(7)`, all zero-padded decimal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Config {
    width: u32,
    height: u32,
    frame_count: u32,
}

impl Config {
    pub fn new(width: u32, height: u32, frame_count: u32) -> Result<Self, Error> {
        if width == 0 || height == 0 {
            return Err(FormatError::UnsupportedGeometry { width, height }.into());
        }
        if width > MAX_DIMENSION {
            return Err(Error::Overflow {
                field: "width",
                value: width.into(),
                max: MAX_DIMENSION.into(),
            });
        }
        if height > MAX_DIMENSION {
            return Err(Error::Overflow {
                field: "height",
                value: height.into(),
                max: MAX_DIMENSION.into(),
            });
        }
        if frame_count > MAX_FRAME_COUNT {
            return Err(Error::Overflow {
                field: "frame_count",
                value: frame_count.into(),
                max: MAX_FRAME_COUNT.into(),
            });
        }
        Ok(Config {
            width,
            height,
            frame_count,
        })
    }

    /// Parses a config line. Strictly positional: exactly 15 ASCII digits,
    /// leading zeros required, no whitespace.
    pub fn parse_line(line: &str) -> Result<Self, Error> {
        if line.len() != CONFIG_LINE_LEN {
            return Err(FormatError::InvalidConfig("wrong length").into());
        }
        if !line.bytes().all(|b| b.is_ascii_digit()) {
            return Err(FormatError::InvalidConfig("non-digit").into());
        }
        // Unwraps can't fire: the fields are short runs of ASCII digits.
        let width = line[0..4].parse().unwrap();
        let height = line[4..8].parse().unwrap();
        let frame_count = line[8..15].parse().unwrap();
        if width == 0 || height == 0 {
            return Err(FormatError::UnsupportedGeometry { width, height }.into());
        }
        Ok(Config {
            width,
            height,
            frame_count,
        })
    }

    /// Serializes to the 15-digit line (sans newline).
    pub fn encode_line(&self) -> String {
        format!(
            "{:04}{:04}{:07}",
            self.width, self.height, self.frame_count
        )
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// Byte length of one decoded frame: `width * height * 3`.
    #[inline]
    pub fn frame_len(&self) -> usize {
        (self.width as usize) * (self.height as usize) * 3
    }

    /// Frame rate derived from the metadata duration, or [DEFAULT_FPS] when
    /// the duration is absent or useless.
    pub fn fps(&self, metadata: &Metadata) -> f64 {
        match metadata.duration_secs() {
            Some(secs) if self.frame_count > 0 => f64::from(self.frame_count) / secs,
            _ => DEFAULT_FPS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_line_round_trip() {
        let c = Config::new(2, 2, 1).unwrap();
        assert_eq!(c.encode_line(), "000200020000001");
        assert_eq!(c.encode_line().len(), CONFIG_LINE_LEN);
        assert_eq!(Config::parse_line("000200020000001").unwrap(), c);

        let c = Config::new(9999, 9999, 9_999_999).unwrap();
        assert_eq!(c.encode_line(), "999999999999999");
        assert_eq!(Config::parse_line(&c.encode_line()).unwrap(), c);
    }

    #[test]
    fn config_rejects_bad_lines() {
        Config::parse_line("00020002000001").unwrap_err(); // 14 chars
        Config::parse_line("0002000200000010").unwrap_err(); // 16 chars
        Config::parse_line("0002x0020000001").unwrap_err(); // non-digit
        Config::parse_line(" 00200020000001").unwrap_err(); // whitespace
        Config::parse_line("000000020000001").unwrap_err(); // zero width
    }

    #[test]
    fn config_rejects_overflow() {
        Config::new(10_000, 2, 1).unwrap_err();
        Config::new(2, 10_000, 1).unwrap_err();
        Config::new(2, 2, 10_000_000).unwrap_err();
        Config::new(0, 2, 1).unwrap_err();
    }

    #[test]
    fn metadata_single_line_json() {
        let m = Metadata {
            title: "t".to_owned(),
            creator: "c".to_owned(),
            created_at: "2026-01-02T01:30:43Z".to_owned(),
            seconds: "0.04".to_owned(),
        };
        let json = serde_json::to_string(&m).unwrap();
        assert!(!json.contains('\n'));
        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
        assert_eq!(m.duration_secs(), Some(0.04));
    }

    #[test]
    fn fps_derivation() {
        let m = Metadata {
            title: String::new(),
            creator: String::new(),
            created_at: String::new(),
            seconds: "2.0".to_owned(),
        };
        let c = Config::new(4, 4, 48).unwrap();
        assert!((c.fps(&m) - 24.0).abs() < 1e-9);
        let no_dur = Metadata {
            seconds: "x".to_owned(),
            ..m
        };
        assert!((c.fps(&no_dur) - DEFAULT_FPS).abs() < 1e-9);
    }
}
