// Copyright (C) 2026 The sanchez developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire packet codec.
//!
//! Fixed big-endian layout:
//! `magic(4) ‖ version(1) ‖ type(1) ‖ seq(4) ‖ ts_ns(8) ‖ payload_len(4) ‖
//! payload ‖ crc32(4)`, where the CRC covers everything before it. One UDP
//! datagram carries exactly one packet; on TCP, [PacketCodec] provides
//! `Framed` length-delimited framing from the same layout.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use pretty_hex::PrettyHex;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::crc32;
use crate::{Error, ProtocolError};

/// First four bytes of every packet.
pub const MAGIC: [u8; 4] = *b"SANC";

/// Current protocol version.
pub const VERSION: u8 = 1;

/// Byte length of the fixed header (before the payload).
pub const HEADER_LEN: usize = 22;

/// Byte length of the CRC trailer.
pub const CRC_LEN: usize = 4;

/// Upper bound on `payload_len`, far above any chunk size this protocol
/// emits. Claims beyond it are treated as corruption rather than buffered.
pub const MAX_PAYLOAD_LEN: usize = 1 << 20;

/// `codec_tag` used in `AUDIO_CONFIG` for the MP3 sibling audio blob.
pub const AUDIO_CODEC_MP3: u32 = u32::from_be_bytes(*b"mp3\0");

/// Packet type codes. Unrecognized codes decode as [PacketType::Unknown]
/// so receivers can count and skip them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PacketType {
    Metadata,
    Config,
    FrameStart,
    FrameChunk,
    FrameEnd,
    Sync,
    FecData,
    AudioConfig,
    AudioChunk,
    EndStream,
    Unknown(u8),
}

impl PacketType {
    pub fn code(self) -> u8 {
        match self {
            PacketType::Metadata => 0x01,
            PacketType::Config => 0x02,
            PacketType::FrameStart => 0x10,
            PacketType::FrameChunk => 0x11,
            PacketType::FrameEnd => 0x12,
            PacketType::Sync => 0x20,
            PacketType::FecData => 0x30,
            PacketType::AudioConfig => 0x40,
            PacketType::AudioChunk => 0x41,
            PacketType::EndStream => 0xFF,
            PacketType::Unknown(c) => c,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => PacketType::Metadata,
            0x02 => PacketType::Config,
            0x10 => PacketType::FrameStart,
            0x11 => PacketType::FrameChunk,
            0x12 => PacketType::FrameEnd,
            0x20 => PacketType::Sync,
            0x30 => PacketType::FecData,
            0x40 => PacketType::AudioConfig,
            0x41 => PacketType::AudioChunk,
            0xFF => PacketType::EndStream,
            c => PacketType::Unknown(c),
        }
    }
}

/// One wire packet. `ts` is the sender's monotonic nanoseconds since
/// session start; `seq` increments on every emitted packet and wraps at
/// 2^32.
#[derive(Clone, Eq, PartialEq)]
pub struct Packet {
    pub ty: PacketType,
    pub seq: u32,
    pub ts: u64,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(ty: PacketType, seq: u32, ts: u64, payload: impl Into<Bytes>) -> Self {
        Packet {
            ty,
            seq,
            ts,
            payload: payload.into(),
        }
    }

    /// Serializes header, payload, and CRC trailer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len() + CRC_LEN);
        buf.put_slice(&MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(self.ty.code());
        buf.put_u32(self.seq);
        buf.put_u64(self.ts);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        let crc = crc32(&buf);
        buf.put_u32(crc);
        buf.freeze()
    }

    /// Parses one packet occupying the whole of `data` (the datagram
    /// case). Trailing bytes are a [ProtocolError::LengthMismatch].
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_LEN + CRC_LEN {
            return Err(ProtocolError::Truncated {
                have: data.len(),
                need: HEADER_LEN + CRC_LEN,
            });
        }
        if data[0..4] != MAGIC {
            let mut m = [0u8; 4];
            m.copy_from_slice(&data[0..4]);
            return Err(ProtocolError::BadMagic(m));
        }
        if data[4] != VERSION {
            return Err(ProtocolError::UnsupportedVersion(data[4]));
        }
        let payload_len = u32::from_be_bytes([data[18], data[19], data[20], data[21]]) as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                len: payload_len,
                max: MAX_PAYLOAD_LEN,
            });
        }
        let need = HEADER_LEN + payload_len + CRC_LEN;
        if data.len() < need {
            return Err(ProtocolError::Truncated {
                have: data.len(),
                need,
            });
        }
        if data.len() > need {
            return Err(ProtocolError::LengthMismatch {
                claimed: payload_len,
                actual: data.len() - HEADER_LEN - CRC_LEN,
            });
        }
        let crc_off = need - CRC_LEN;
        let stored = u32::from_be_bytes([
            data[crc_off],
            data[crc_off + 1],
            data[crc_off + 2],
            data[crc_off + 3],
        ]);
        let computed = crc32(&data[..crc_off]);
        if stored != computed {
            return Err(ProtocolError::ChecksumMismatch { computed, stored });
        }
        Ok(Packet {
            ty: PacketType::from_code(data[5]),
            seq: u32::from_be_bytes([data[6], data[7], data[8], data[9]]),
            ts: u64::from_be_bytes([
                data[10], data[11], data[12], data[13], data[14], data[15], data[16], data[17],
            ]),
            payload: Bytes::copy_from_slice(&data[HEADER_LEN..crc_off]),
        })
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("ty", &self.ty)
            .field("seq", &self.seq)
            .field("ts", &self.ts)
            .field("payload", &self.payload.hex_dump())
            .finish()
    }
}

/// `FRAME_START` payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameStart {
    pub frame_index: u32,
    pub total_bytes: u32,
    pub chunk_count: u32,
}

impl FrameStart {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u32(self.frame_index);
        buf.put_u32(self.total_bytes);
        buf.put_u32(self.chunk_count);
        buf.freeze()
    }

    pub fn parse(mut payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() != 12 {
            return Err(ProtocolError::BadPayload("FRAME_START"));
        }
        Ok(FrameStart {
            frame_index: payload.get_u32(),
            total_bytes: payload.get_u32(),
            chunk_count: payload.get_u32(),
        })
    }
}

/// `FRAME_CHUNK` payload: an 8-byte index prefix, then a contiguous slice
/// of the frame's deflated bytes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FrameChunk {
    pub frame_index: u32,
    pub chunk_index: u32,
    pub data: Bytes,
}

impl FrameChunk {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.data.len());
        buf.put_u32(self.frame_index);
        buf.put_u32(self.chunk_index);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Zero-copy parse: `data` aliases the payload.
    pub fn parse(payload: &Bytes) -> Result<Self, ProtocolError> {
        if payload.len() < 8 {
            return Err(ProtocolError::BadPayload("FRAME_CHUNK"));
        }
        let mut prefix = &payload[..8];
        Ok(FrameChunk {
            frame_index: prefix.get_u32(),
            chunk_index: prefix.get_u32(),
            data: payload.slice(8..),
        })
    }
}

/// `FRAME_END` payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameEnd {
    pub frame_index: u32,
    /// CRC32 of the frame's complete deflated byte sequence.
    pub frame_crc32: u32,
}

impl FrameEnd {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u32(self.frame_index);
        buf.put_u32(self.frame_crc32);
        buf.freeze()
    }

    pub fn parse(mut payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() != 8 {
            return Err(ProtocolError::BadPayload("FRAME_END"));
        }
        Ok(FrameEnd {
            frame_index: payload.get_u32(),
            frame_crc32: payload.get_u32(),
        })
    }
}

/// `SYNC` beacon payload: wall-clock nanoseconds and the frame index in
/// flight. Receivers treat it as a heartbeat.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Sync {
    pub server_ts: u64,
    pub frame_index: u32,
}

impl Sync {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u64(self.server_ts);
        buf.put_u32(self.frame_index);
        buf.freeze()
    }

    pub fn parse(mut payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() != 12 {
            return Err(ProtocolError::BadPayload("SYNC"));
        }
        Ok(Sync {
            server_ts: payload.get_u64(),
            frame_index: payload.get_u32(),
        })
    }
}

/// `FEC_DATA` payload: XOR parity over a group of consecutive
/// `FRAME_CHUNK` payloads, each zero-padded to `member_length`.
///
/// `group_id` is the sequence number of the group's first member, so a
/// receiver can enumerate members as the `FRAME_CHUNK` packets with seq in
/// `[group_id, parity_seq)` even when other packet types interleave.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FecData {
    pub group_id: u32,
    pub member_count: u32,
    pub member_length: u32,
    pub parity: Bytes,
}

impl FecData {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12 + self.parity.len());
        buf.put_u32(self.group_id);
        buf.put_u32(self.member_count);
        buf.put_u32(self.member_length);
        buf.put_slice(&self.parity);
        buf.freeze()
    }

    pub fn parse(payload: &Bytes) -> Result<Self, ProtocolError> {
        if payload.len() < 12 {
            return Err(ProtocolError::BadPayload("FEC_DATA"));
        }
        let mut prefix = &payload[..12];
        let group_id = prefix.get_u32();
        let member_count = prefix.get_u32();
        let member_length = prefix.get_u32();
        let parity = payload.slice(12..);
        if parity.len() != member_length as usize {
            return Err(ProtocolError::BadPayload("FEC_DATA"));
        }
        Ok(FecData {
            group_id,
            member_count,
            member_length,
            parity,
        })
    }
}

/// `AUDIO_CONFIG` payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AudioConfig {
    pub codec_tag: u32,
    pub total_bytes: u32,
}

impl AudioConfig {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u32(self.codec_tag);
        buf.put_u32(self.total_bytes);
        buf.freeze()
    }

    pub fn parse(mut payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() != 8 {
            return Err(ProtocolError::BadPayload("AUDIO_CONFIG"));
        }
        Ok(AudioConfig {
            codec_tag: payload.get_u32(),
            total_bytes: payload.get_u32(),
        })
    }
}

/// `AUDIO_CHUNK` payload: byte offset into the audio blob, then raw bytes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AudioChunk {
    pub offset: u32,
    pub data: Bytes,
}

impl AudioChunk {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.data.len());
        buf.put_u32(self.offset);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn parse(payload: &Bytes) -> Result<Self, ProtocolError> {
        if payload.len() < 4 {
            return Err(ProtocolError::BadPayload("AUDIO_CHUNK"));
        }
        let mut prefix = &payload[..4];
        Ok(AudioChunk {
            offset: prefix.get_u32(),
            data: payload.slice(4..),
        })
    }
}

/// Length-delimited TCP framing for [Packet], for use with
/// `tokio_util::codec::Framed`.
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        // Validate the fixed prefix before trusting the length field, so a
        // desynced stream fails fast instead of buffering garbage.
        if src[0..4] != MAGIC {
            let mut m = [0u8; 4];
            m.copy_from_slice(&src[0..4]);
            return Err(ProtocolError::BadMagic(m).into());
        }
        if src[4] != VERSION {
            return Err(ProtocolError::UnsupportedVersion(src[4]).into());
        }
        let payload_len = u32::from_be_bytes([src[18], src[19], src[20], src[21]]) as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                len: payload_len,
                max: MAX_PAYLOAD_LEN,
            }
            .into());
        }
        let need = HEADER_LEN + payload_len + CRC_LEN;
        if src.len() < need {
            src.reserve(need - src.len());
            return Ok(None);
        }
        let frame = src.split_to(need);
        Ok(Some(Packet::decode(&frame)?))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Error> {
        dst.extend_from_slice(&item.encode());
        Ok(())
    }
}
