// Copyright (C) 2026 The sanchez developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types shared across the container codec, wire protocol, and
//! streaming paths.

use thiserror::Error;

/// Malformed `.sanchez` container data: header lines or frame lines that
/// can't be decoded. Fatal to the current read operation.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("malformed header: {0}")]
    MalformedHeader(&'static str),

    #[error("bad metadata JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("bad config line: {0}")]
    InvalidConfig(&'static str),

    #[error("unsupported geometry {width}x{height}")]
    UnsupportedGeometry { width: u32, height: u32 },

    #[error("bad base64 frame line: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("bad zlib stream: {0}")]
    Zlib(String),

    #[error("bad hex token {0:?} in frame line")]
    Hex(String),

    #[error("frame decoded to {actual} bytes, expected {expected}")]
    ShortFrame { expected: usize, actual: usize },

    #[error("trailing data after frame")]
    TrailingData,

    #[error("config declares {expected} frames, got {actual}")]
    FrameCountMismatch { expected: u32, actual: u32 },
}

/// Malformed or corrupt wire packets. `BadMagic` and `UnsupportedVersion`
/// are fatal to a streaming session; the rest are counted per-packet and
/// the session continues.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("truncated packet: have {have} bytes, need {need}")]
    Truncated { have: usize, need: usize },

    #[error("length mismatch: header claims {claimed} payload bytes, got {actual}")]
    LengthMismatch { claimed: usize, actual: usize },

    #[error("payload of {len} bytes exceeds maximum {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("checksum mismatch: computed {computed:08x}, packet carries {stored:08x}")]
    ChecksumMismatch { computed: u32, stored: u32 },

    #[error("bad {0} payload")]
    BadPayload(&'static str),
}

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("geometry mismatch: expected {expected_width}x{expected_height}, got {width}x{height}")]
    Geometry {
        expected_width: u32,
        expected_height: u32,
        width: u32,
        height: u32,
    },

    #[error("{field} {value} exceeds maximum {max}")]
    Overflow {
        field: &'static str,
        value: u64,
        max: u64,
    },

    #[error("transport closed")]
    TransportClosed,
}

impl Error {
    /// True for conditions a receiver counts and skips rather than
    /// propagating: a single corrupt or truncated datagram.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Protocol(ProtocolError::ChecksumMismatch { .. })
            | Error::Protocol(ProtocolError::Truncated { .. })
            | Error::Protocol(ProtocolError::LengthMismatch { .. })
            | Error::Protocol(ProtocolError::PayloadTooLarge { .. })
            | Error::Protocol(ProtocolError::BadPayload(_)) => true,
            _ => false,
        }
    }
}
