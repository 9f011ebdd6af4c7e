// Copyright (C) 2026 The sanchez developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-frame payload encodings.
//!
//! A container frame line is either *compressed* (`base64(zlib(rgb))`, no
//! surrounding punctuation) or *uncompressed* (`{RRGGBB,RRGGBB,...}`, one
//! six-digit hex triple per pixel in row-major order). Readers dispatch on
//! the first character; writers pick one [Encoding] for the whole file.
//!
//! The streaming path reuses the zlib and CRC32 primitives here: a frame
//! travels as its deflated bytes, chunked, and is integrity-checked with
//! the same CRC the packet layer uses.

use std::io::Read;
use std::io::Write;

use bytes::Bytes;

use crate::frame::Frame;
use crate::{Config, Error, FormatError};

/// Writer-side choice of per-line encoding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Encoding {
    /// `base64(zlib_deflate(rgb))`.
    Compressed,
    /// `{RRGGBB,...}` hex triples, uppercase on write.
    Hex,
}

/// Deflates raw frame bytes with zlib.
pub fn deflate(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut enc = flate2::write::ZlibEncoder::new(
        Vec::with_capacity(data.len() / 4),
        flate2::Compression::default(),
    );
    enc.write_all(data)?;
    Ok(enc.finish()?)
}

/// Inflates a zlib stream, requiring the output to be exactly
/// `expected_len` bytes.
pub fn inflate(data: &[u8], expected_len: usize) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(expected_len);
    let mut dec = flate2::read::ZlibDecoder::new(data);
    // Read at most one byte past the expected length so an overlong stream
    // fails without buffering it all.
    dec.take(expected_len as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| FormatError::Zlib(e.to_string()))?;
    if out.len() != expected_len {
        return Err(FormatError::ShortFrame {
            expected: expected_len,
            actual: out.len(),
        }
        .into());
    }
    Ok(out)
}

/// CRC32 (IEEE) of `data`, as used by both the packet trailer and the
/// per-frame integrity check.
pub fn crc32(data: &[u8]) -> u32 {
    let mut h = crc32fast::Hasher::new();
    h.update(data);
    h.finalize()
}

/// XORs `data` into `acc`, growing `acc` with zero padding as needed.
/// This is the FEC parity operation: members shorter than the group's
/// longest are treated as zero-extended.
pub(crate) fn xor_pad(acc: &mut Vec<u8>, data: &[u8]) {
    if data.len() > acc.len() {
        acc.resize(data.len(), 0);
    }
    for (a, b) in acc.iter_mut().zip(data.iter()) {
        *a ^= *b;
    }
}

/// Encodes one frame as a container line (sans newline).
pub fn encode_line(frame: &Frame, encoding: Encoding) -> Result<String, Error> {
    match encoding {
        Encoding::Compressed => Ok(base64::encode(deflate(frame.data())?)),
        Encoding::Hex => Ok(encode_hex(frame.data())),
    }
}

/// Decodes one container line into raw frame bytes, dispatching on the
/// first character.
pub fn decode_line(line: &str, config: &Config) -> Result<Bytes, Error> {
    if line.starts_with('{') {
        decode_hex(line, config.frame_len())
    } else {
        decode_compressed(line, config.frame_len())
    }
}

fn encode_hex(data: &[u8]) -> String {
    // "{" + 7 chars per pixel (6 hex + separator/brace) + "}".
    let mut out = String::with_capacity(2 + data.len() / 3 * 7);
    out.push('{');
    for (i, px) in data.chunks_exact(3).enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&hex::encode_upper(px));
    }
    out.push('}');
    out
}

fn decode_hex(line: &str, expected_len: usize) -> Result<Bytes, Error> {
    let body = match line.strip_prefix('{').and_then(|l| l.strip_suffix('}')) {
        Some(b) => b,
        None => return Err(FormatError::TrailingData.into()),
    };
    if body.contains('}') {
        // A closing brace mid-line means data followed the real terminator.
        return Err(FormatError::TrailingData.into());
    }
    let mut out = Vec::with_capacity(expected_len);
    for token in body.split(',') {
        if token.len() != 6 {
            return Err(FormatError::Hex(token.to_owned()).into());
        }
        let px = hex::decode(token).map_err(|_| FormatError::Hex(token.to_owned()))?;
        out.extend_from_slice(&px);
    }
    if out.len() != expected_len {
        return Err(FormatError::ShortFrame {
            expected: expected_len,
            actual: out.len(),
        }
        .into());
    }
    Ok(out.into())
}

fn decode_compressed(line: &str, expected_len: usize) -> Result<Bytes, Error> {
    let deflated = base64::decode(line.trim_end()).map_err(FormatError::Base64)?;
    Ok(inflate(&deflated, expected_len)?.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_2x2() -> Frame {
        Frame::from_rgb(
            2,
            2,
            vec![
                0xff, 0x00, 0x00, // red
                0x00, 0xff, 0x00, // green
                0x00, 0x00, 0xff, // blue
                0xff, 0xff, 0xff, // white
            ],
        )
        .unwrap()
    }

    #[test]
    fn hex_line_bit_exact() {
        let line = encode_line(&frame_2x2(), Encoding::Hex).unwrap();
        assert_eq!(line, "{FF0000,00FF00,0000FF,FFFFFF}");
    }

    #[test]
    fn hex_accepts_either_case() {
        let config = Config::new(2, 2, 1).unwrap();
        let upper = decode_line("{FF0000,00FF00,0000FF,FFFFFF}", &config).unwrap();
        let lower = decode_line("{ff0000,00ff00,0000ff,ffffff}", &config).unwrap();
        assert_eq!(upper, lower);
        assert_eq!(&upper[..], frame_2x2().data().as_ref());
    }

    #[test]
    fn hex_token_count_must_match() {
        let config = Config::new(2, 2, 1).unwrap();
        match decode_line("{FF0000,00FF00,0000FF}", &config) {
            Err(Error::Format(FormatError::ShortFrame { .. })) => {}
            o => panic!("expected short frame, got {:?}", o),
        }
        match decode_line("{FF0000,00FF00,0000FF,FFFFFF,ABCDEF}", &config) {
            Err(Error::Format(FormatError::ShortFrame { .. })) => {}
            o => panic!("expected short frame, got {:?}", o),
        }
    }

    #[test]
    fn hex_rejects_garbage() {
        let config = Config::new(2, 2, 1).unwrap();
        decode_line("{FF0000,00FF00,0000FF,FFFFF}", &config).unwrap_err(); // 5 chars
        decode_line("{FF0000,00FF00,0000FF,FFFFGG}", &config).unwrap_err(); // non-hex
        decode_line("{FF0000,00FF00,0000FF,FFFFFF", &config).unwrap_err(); // no brace
        decode_line("{FF0000,00FF00,0000FF,FFFFFF}x", &config).unwrap_err(); // trailing
    }

    #[test]
    fn compressed_round_trip() {
        let config = Config::new(2, 2, 1).unwrap();
        let frame = frame_2x2();
        let line = encode_line(&frame, Encoding::Compressed).unwrap();
        assert!(!line.starts_with('{'));
        let back = decode_line(&line, &config).unwrap();
        assert_eq!(&back[..], frame.data().as_ref());
    }

    #[test]
    fn compressed_rejects_wrong_length() {
        let config = Config::new(2, 2, 1).unwrap();
        let short = base64::encode(deflate(&[0u8; 9]).unwrap());
        match decode_line(&short, &config) {
            Err(Error::Format(FormatError::ShortFrame { .. })) => {}
            o => panic!("expected short frame, got {:?}", o),
        }
        let long = base64::encode(deflate(&[0u8; 13]).unwrap());
        decode_line(&long, &config).unwrap_err();
    }

    #[test]
    fn compressed_rejects_bad_base64() {
        let config = Config::new(2, 2, 1).unwrap();
        match decode_line("!!!not-base64!!!", &config) {
            Err(Error::Format(FormatError::Base64(_))) => {}
            o => panic!("expected base64 error, got {:?}", o),
        }
    }

    #[test]
    fn inflate_checks_exact_length() {
        let d = deflate(&[7u8; 12]).unwrap();
        assert_eq!(inflate(&d, 12).unwrap(), vec![7u8; 12]);
        inflate(&d, 11).unwrap_err();
        inflate(&d, 13).unwrap_err();
        inflate(b"not zlib", 12).unwrap_err();
    }

    #[test]
    fn crc32_ieee_vector() {
        // Standard IEEE check value for "123456789".
        assert_eq!(crc32(b"123456789"), 0xcbf4_3926);
    }
}
