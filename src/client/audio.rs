// Copyright (C) 2026 The sanchez developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reassembles the interleaved audio stream back into one blob.

use std::collections::BTreeMap;

use bytes::Bytes;
use log::{debug, warn};

use crate::packet::{AudioChunk, AudioConfig};

/// Collects `AUDIO_CHUNK` payloads keyed by offset until the stream ends,
/// then assembles them against the declared total length.
pub(crate) struct AudioAssembler {
    config: Option<AudioConfig>,
    chunks: BTreeMap<u32, Bytes>,
    received: usize,
}

impl AudioAssembler {
    pub fn new() -> Self {
        AudioAssembler {
            config: None,
            chunks: BTreeMap::new(),
            received: 0,
        }
    }

    pub fn configure(&mut self, config: AudioConfig) {
        if let Some(old) = self.config {
            if old != config {
                warn!("audio config changed mid-session; keeping the first");
            }
            return;
        }
        debug!(
            "audio: codec {:08x}, {} bytes expected",
            config.codec_tag, config.total_bytes
        );
        self.config = Some(config);
    }

    pub fn push(&mut self, chunk: AudioChunk) {
        if chunk.data.is_empty() {
            return;
        }
        // Duplicate offsets (retransmits or loops) keep the first copy.
        if self.chunks.contains_key(&chunk.offset) {
            return;
        }
        self.received += chunk.data.len();
        self.chunks.insert(chunk.offset, chunk.data);
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    /// Assembles the blob. Gaps left by lost chunks are zero-filled and
    /// logged; `None` when no audio was announced.
    pub fn finish(&self) -> Option<Bytes> {
        let config = self.config?;
        let total = config.total_bytes as usize;
        let mut out = vec![0u8; total];
        let mut filled = 0usize;
        for (offset, data) in &self.chunks {
            let start = *offset as usize;
            if start >= total {
                continue;
            }
            let end = (start + data.len()).min(total);
            out[start..end].copy_from_slice(&data[..end - start]);
            filled += end - start;
        }
        if filled < total {
            warn!("audio: {} of {} bytes missing", total - filled, total);
        }
        Some(out.into())
    }
}
