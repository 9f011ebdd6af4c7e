// Copyright (C) 2026 The sanchez developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stream server: fragments frames into packets and emits one session per
//! transport.
//!
//! Session lifecycle: `METADATA`, `CONFIG`, optional `AUDIO_CONFIG`, then
//! per frame `FRAME_START` / `FRAME_CHUNK`* / `FRAME_END` with audio
//! chunks interleaved between frames, `SYNC` beacons at least every
//! `sync_interval`, XOR parity per chunk group in satellite mode, and a
//! final `END_STREAM` unless looping forever.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::net::TcpListener;

use crate::codec;
use crate::frame::{Frame, FrameStore};
use crate::packet::{
    AudioChunk, AudioConfig, FecData, FrameChunk, FrameEnd, FrameStart, Packet, PacketType,
    Sync, AUDIO_CODEC_MP3,
};
use crate::transport::{PacketSink, TcpTransport};
use crate::{Error, FormatError, Metadata};

/// Default chunk size on unicast links.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Chunk size forced by satellite mode (fits a conservative MTU).
pub const SATELLITE_CHUNK_SIZE: usize = 1400;

const DEFAULT_FEC_GROUP: u32 = 8;
const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Options controlling one streaming session.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    loop_playback: bool,
    satellite: bool,
    chunk_size: Option<usize>,
    fps: Option<f64>,
    fec_group: u32,
    sync_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            loop_playback: false,
            satellite: false,
            chunk_size: None,
            fps: None,
            fec_group: DEFAULT_FEC_GROUP,
            sync_interval: DEFAULT_SYNC_INTERVAL,
        }
    }
}

impl SessionOptions {
    /// Restart from frame 0 after the last frame instead of ending the
    /// session.
    pub fn loop_playback(mut self, v: bool) -> Self {
        self.loop_playback = v;
        self
    }

    /// Enable FEC parity emission and force MTU-sized chunks.
    pub fn satellite(mut self, v: bool) -> Self {
        self.satellite = v;
        self
    }

    /// Override the chunk size. Satellite mode still caps it at
    /// [SATELLITE_CHUNK_SIZE].
    pub fn chunk_size(mut self, v: usize) -> Self {
        self.chunk_size = Some(v);
        self
    }

    /// Override the pacing rate. Defaults to the rate derived from the
    /// metadata duration. Ignored on TCP, which paces via backpressure.
    pub fn fps(mut self, v: f64) -> Self {
        self.fps = Some(v);
        self
    }

    /// Number of chunks guarded by one parity packet (satellite only).
    pub fn fec_group(mut self, v: u32) -> Self {
        self.fec_group = v.max(1);
        self
    }

    /// Maximum gap between emissions before a `SYNC` beacon is inserted.
    pub fn sync_interval(mut self, v: Duration) -> Self {
        self.sync_interval = v;
        self
    }

    fn effective_chunk_size(&self) -> usize {
        let s = match (self.chunk_size, self.satellite) {
            (Some(s), true) => s.min(SATELLITE_CHUNK_SIZE),
            (Some(s), false) => s,
            (None, true) => SATELLITE_CHUNK_SIZE,
            (None, false) => DEFAULT_CHUNK_SIZE,
        };
        s.max(1)
    }
}

/// Everything one session streams: frames, their metadata, and an optional
/// out-of-band audio blob (MP3 bytes).
pub struct StreamSource {
    pub metadata: Metadata,
    pub frames: FrameStore,
    pub audio: Option<Bytes>,
}

/// Rolling XOR parity accumulator over full `FRAME_CHUNK` payloads.
///
/// Members are zero-padded to the longest payload in the group, and the
/// group id records the first member's sequence number so receivers can
/// enumerate members by seq range.
struct FecEncoder {
    group_size: u32,
    first_seq: Option<u32>,
    count: u32,
    parity: Vec<u8>,
}

impl FecEncoder {
    fn new(group_size: u32) -> Self {
        FecEncoder {
            group_size,
            first_seq: None,
            count: 0,
            parity: Vec::new(),
        }
    }

    fn push(&mut self, seq: u32, payload: &[u8]) {
        if self.first_seq.is_none() {
            self.first_seq = Some(seq);
        }
        codec::xor_pad(&mut self.parity, payload);
        self.count += 1;
    }

    fn full(&self) -> bool {
        self.count == self.group_size
    }

    fn take(&mut self) -> Option<FecData> {
        let first_seq = self.first_seq.take()?;
        let parity = std::mem::take(&mut self.parity);
        let fec = FecData {
            group_id: first_seq,
            member_count: self.count,
            member_length: parity.len() as u32,
            parity: parity.into(),
        };
        self.count = 0;
        Some(fec)
    }
}

/// Doles out the audio blob as offset-prefixed chunks, a fair share after
/// each frame.
struct AudioFeeder {
    data: Bytes,
    chunk_size: usize,
    per_frame: usize,
    offset: usize,
}

impl AudioFeeder {
    fn new(data: Bytes, chunk_size: usize, frame_count: u32) -> Self {
        let total_chunks = (data.len() + chunk_size - 1) / chunk_size;
        let per_frame = match frame_count {
            0 => total_chunks,
            n => (total_chunks + n as usize - 1) / n as usize,
        };
        AudioFeeder {
            data,
            chunk_size,
            per_frame,
            offset: 0,
        }
    }

    fn next_chunk(&mut self) -> Option<AudioChunk> {
        if self.offset >= self.data.len() {
            return None;
        }
        let end = (self.offset + self.chunk_size).min(self.data.len());
        let chunk = AudioChunk {
            offset: self.offset as u32,
            data: self.data.slice(self.offset..end),
        };
        self.offset = end;
        Some(chunk)
    }
}

struct Session<'a, S: PacketSink> {
    sink: &'a mut S,
    opts: &'a SessionOptions,
    seq: u32,
    t0: Instant,
    last_sync: Instant,
    frame_index: u32,
}

impl<'a, S: PacketSink> Session<'a, S> {
    fn new(sink: &'a mut S, opts: &'a SessionOptions) -> Self {
        let now = Instant::now();
        Session {
            sink,
            opts,
            seq: 0,
            t0: now,
            last_sync: now,
            frame_index: 0,
        }
    }

    /// Emits one packet, inserting a `SYNC` beacon first if one is due.
    /// Returns the sequence number the packet was assigned.
    async fn emit(&mut self, ty: PacketType, payload: Bytes) -> Result<u32, Error> {
        if self.last_sync.elapsed() >= self.opts.sync_interval {
            self.emit_sync().await?;
        }
        self.emit_raw(ty, payload).await
    }

    async fn emit_sync(&mut self) -> Result<(), Error> {
        let payload = Sync {
            server_ts: wall_clock_ns(),
            frame_index: self.frame_index,
        }
        .encode();
        self.last_sync = Instant::now();
        self.emit_raw(PacketType::Sync, payload).await?;
        Ok(())
    }

    async fn emit_raw(&mut self, ty: PacketType, payload: Bytes) -> Result<u32, Error> {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        let ts = self.t0.elapsed().as_nanos() as u64;
        self.sink.send(Packet::new(ty, seq, ts, payload)).await?;
        Ok(seq)
    }

    /// Sleeps until `deadline`, emitting `SYNC` beacons if the wait spans
    /// one or more sync intervals.
    async fn pace(&mut self, deadline: Instant) -> Result<(), Error> {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let until_sync = self
                .opts
                .sync_interval
                .checked_sub(self.last_sync.elapsed());
            match until_sync {
                None => self.emit_sync().await?,
                Some(d) if now + d < deadline => {
                    tokio::time::sleep(d).await;
                    self.emit_sync().await?;
                }
                Some(_) => {
                    tokio::time::sleep(deadline - now).await;
                    return Ok(());
                }
            }
        }
    }

    async fn emit_frame(
        &mut self,
        index: u32,
        frame: &Frame,
        fec: &mut Option<FecEncoder>,
    ) -> Result<(), Error> {
        self.frame_index = index;
        let deflated = Bytes::from(codec::deflate(frame.data())?);
        let chunk_size = self.opts.effective_chunk_size();
        let chunk_count = (deflated.len() + chunk_size - 1) / chunk_size;
        self.emit(
            PacketType::FrameStart,
            FrameStart {
                frame_index: index,
                total_bytes: deflated.len() as u32,
                chunk_count: chunk_count as u32,
            }
            .encode(),
        )
        .await?;
        for chunk_index in 0..chunk_count {
            let start = chunk_index * chunk_size;
            let end = (start + chunk_size).min(deflated.len());
            let payload = FrameChunk {
                frame_index: index,
                chunk_index: chunk_index as u32,
                data: deflated.slice(start..end),
            }
            .encode();
            let seq = self.emit(PacketType::FrameChunk, payload.clone()).await?;
            if let Some(enc) = fec {
                enc.push(seq, &payload);
                if enc.full() {
                    self.flush_fec(fec).await?;
                }
            }
        }
        // A partial group never spans frames.
        self.flush_fec(fec).await?;
        self.emit(
            PacketType::FrameEnd,
            FrameEnd {
                frame_index: index,
                frame_crc32: codec::crc32(&deflated),
            }
            .encode(),
        )
        .await?;
        Ok(())
    }

    async fn flush_fec(&mut self, fec: &mut Option<FecEncoder>) -> Result<(), Error> {
        if let Some(data) = fec.as_mut().and_then(FecEncoder::take) {
            self.emit(PacketType::FecData, data.encode()).await?;
        }
        Ok(())
    }
}

fn wall_clock_ns() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Streams one session over `sink`, returning when the source is
/// exhausted (or never, when looping, unless the transport fails).
pub async fn stream_session<S: PacketSink>(
    source: &StreamSource,
    sink: &mut S,
    opts: &SessionOptions,
) -> Result<(), Error> {
    let config = source.frames.config()?;
    let metadata_json =
        serde_json::to_string(&source.metadata).map_err(FormatError::InvalidJson)?;
    let fps = opts.fps.unwrap_or_else(|| config.fps(&source.metadata));
    let frame_period = Duration::from_secs_f64(1.0 / fps.max(0.001));
    let paced = sink.needs_pacing();
    let chunk_size = opts.effective_chunk_size();

    let mut session = Session::new(sink, opts);
    session
        .emit(PacketType::Metadata, metadata_json.into())
        .await?;
    session
        .emit(PacketType::Config, config.encode_line().into())
        .await?;

    let mut audio = source.audio.as_ref().map(|a| {
        AudioFeeder::new(a.clone(), chunk_size, config.frame_count())
    });
    if let Some(feeder) = &audio {
        session
            .emit(
                PacketType::AudioConfig,
                AudioConfig {
                    codec_tag: AUDIO_CODEC_MP3,
                    total_bytes: feeder.data.len() as u32,
                }
                .encode(),
            )
            .await?;
    }

    let mut fec = if opts.satellite {
        Some(FecEncoder::new(opts.fec_group))
    } else {
        None
    };

    debug!(
        "session start: {} frames, fps {:.3}, chunk {} bytes, satellite {}",
        config.frame_count(),
        fps,
        chunk_size,
        opts.satellite
    );
    let mut deadline = Instant::now();
    loop {
        for (i, frame) in source.frames.iter().enumerate() {
            if paced {
                session.pace(deadline).await?;
                deadline += frame_period;
            }
            session.emit_frame(i as u32, frame, &mut fec).await?;
            if let Some(feeder) = &mut audio {
                for _ in 0..feeder.per_frame {
                    match feeder.next_chunk() {
                        Some(chunk) => {
                            session
                                .emit(PacketType::AudioChunk, chunk.encode())
                                .await?;
                        }
                        None => break,
                    }
                }
            }
        }
        if !opts.loop_playback || source.frames.is_empty() {
            break;
        }
    }
    // Rounding can leave audio unsent when the store is empty.
    if let Some(feeder) = &mut audio {
        while let Some(chunk) = feeder.next_chunk() {
            session
                .emit(PacketType::AudioChunk, chunk.encode())
                .await?;
        }
    }
    session.emit(PacketType::EndStream, Bytes::new()).await?;
    debug!("session end after {} packets", session.seq);
    Ok(())
}

/// TCP accept loop: each client gets its own session (starting from seq
/// 0) on its own task. A client failing mid-stream drops only that
/// client.
pub async fn serve_tcp(
    listener: TcpListener,
    source: Arc<StreamSource>,
    opts: SessionOptions,
) -> Result<(), Error> {
    loop {
        let (stream, addr) = listener.accept().await?;
        info!("client {} connected", addr);
        let source = source.clone();
        let opts = opts.clone();
        tokio::spawn(async move {
            let mut transport = TcpTransport::new(stream);
            match stream_session(&source, &mut transport, &opts).await {
                Ok(()) => info!("client {} finished", addr),
                Err(e) => warn!("client {} dropped: {}", addr, e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testutil;

    fn source(frame_count: usize, audio: Option<&[u8]>) -> StreamSource {
        let mut frames = FrameStore::new(4, 4).unwrap();
        for i in 0..frame_count {
            let data: Vec<u8> = (0..48).map(|p| (i * 48 + p) as u8).collect();
            frames.push(Frame::from_rgb(4, 4, data).unwrap()).unwrap();
        }
        StreamSource {
            metadata: Metadata {
                title: "t".to_owned(),
                creator: "c".to_owned(),
                created_at: "2026-01-02T01:30:43Z".to_owned(),
                seconds: "0.4".to_owned(),
            },
            frames,
            audio: audio.map(Bytes::copy_from_slice),
        }
    }

    async fn collect(source: &StreamSource, opts: &SessionOptions) -> Vec<Packet> {
        let (mut sink, mut rx) = testutil::channel();
        stream_session(source, &mut sink, opts).await.unwrap();
        drop(sink);
        let mut out = Vec::new();
        while let Some(p) = rx.0.recv().await {
            out.push(p);
        }
        out
    }

    #[tokio::test]
    async fn lifecycle_order_and_sequencing() {
        let src = source(3, None);
        let pkts = collect(&src, &SessionOptions::default()).await;
        assert_eq!(pkts[0].ty, PacketType::Metadata);
        assert_eq!(pkts[1].ty, PacketType::Config);
        assert_eq!(&pkts[1].payload[..], b"000400040000003");
        assert_eq!(pkts.last().unwrap().ty, PacketType::EndStream);
        for (i, p) in pkts.iter().enumerate() {
            assert_eq!(p.seq, i as u32, "seq increments on every packet");
        }
        // FRAME_START(i) < FRAME_CHUNK(i,*) < FRAME_END(i) for each frame.
        let mut current = None;
        for p in &pkts[2..] {
            match p.ty {
                PacketType::FrameStart => {
                    let fs = FrameStart::parse(&p.payload).unwrap();
                    assert_eq!(current, None);
                    current = Some(fs.frame_index);
                }
                PacketType::FrameChunk => {
                    let fc = FrameChunk::parse(&p.payload).unwrap();
                    assert_eq!(Some(fc.frame_index), current);
                }
                PacketType::FrameEnd => {
                    let fe = FrameEnd::parse(&p.payload).unwrap();
                    assert_eq!(Some(fe.frame_index), current);
                    current = None;
                }
                _ => {}
            }
        }
        assert_eq!(current, None);
    }

    #[tokio::test]
    async fn satellite_emits_recoverable_parity() {
        let src = source(1, None);
        let opts = SessionOptions::default()
            .satellite(true)
            .chunk_size(16)
            .fec_group(4);
        let pkts = collect(&src, &opts).await;
        let chunks: Vec<&Packet> = pkts
            .iter()
            .filter(|p| p.ty == PacketType::FrameChunk)
            .collect();
        let parity_pkts: Vec<&Packet> = pkts
            .iter()
            .filter(|p| p.ty == PacketType::FecData)
            .collect();
        assert!(!parity_pkts.is_empty());
        let mut covered = 0;
        for p in &parity_pkts {
            let fec = FecData::parse(&p.payload).unwrap();
            assert!(fec.member_count <= 4);
            covered += fec.member_count;
            // Members are the chunks with seq in [group_id, parity_seq);
            // their XOR equals the parity.
            let span = p.seq.wrapping_sub(fec.group_id);
            let members: Vec<&&Packet> = chunks
                .iter()
                .filter(|c| c.seq.wrapping_sub(fec.group_id) < span)
                .collect();
            assert_eq!(members.len() as u32, fec.member_count);
            let mut acc = vec![0u8; fec.member_length as usize];
            for m in &members {
                codec::xor_pad(&mut acc, &m.payload);
            }
            assert_eq!(&acc[..], &fec.parity[..]);
        }
        assert_eq!(covered as usize, chunks.len(), "every chunk is guarded");
        // Parity packets precede the FRAME_END of their frame.
        let end_seq = pkts
            .iter()
            .find(|p| p.ty == PacketType::FrameEnd)
            .unwrap()
            .seq;
        for p in pkts.iter().filter(|p| p.ty == PacketType::FecData) {
            assert!(p.seq < end_seq);
        }
    }

    #[tokio::test]
    async fn audio_config_then_interleaved_chunks() {
        let audio = vec![0xabu8; 100];
        let src = source(3, Some(&audio));
        let opts = SessionOptions::default().chunk_size(16);
        let pkts = collect(&src, &opts).await;
        let cfg_pos = pkts
            .iter()
            .position(|p| p.ty == PacketType::AudioConfig)
            .unwrap();
        assert_eq!(cfg_pos, 2, "audio config follows metadata and config");
        let cfg = AudioConfig::parse(&pkts[cfg_pos].payload).unwrap();
        assert_eq!(cfg.codec_tag, AUDIO_CODEC_MP3);
        assert_eq!(cfg.total_bytes, 100);
        // All bytes arrive, offsets contiguous.
        let mut got = vec![false; 100];
        for p in pkts.iter().filter(|p| p.ty == PacketType::AudioChunk) {
            let c = AudioChunk::parse(&p.payload).unwrap();
            for i in 0..c.data.len() {
                got[c.offset as usize + i] = true;
            }
        }
        assert!(got.iter().all(|b| *b));
        // Audio is interleaved: some chunk appears before the last frame's
        // end.
        let first_audio = pkts
            .iter()
            .position(|p| p.ty == PacketType::AudioChunk)
            .unwrap();
        let last_end = pkts
            .iter()
            .rposition(|p| p.ty == PacketType::FrameEnd)
            .unwrap();
        assert!(first_audio < last_end);
    }

    #[tokio::test]
    async fn looping_re_emits_frame_zero_with_larger_seq() {
        let src = source(2, None);
        let opts = SessionOptions::default().loop_playback(true);
        let (mut sink, mut rx) = testutil::channel();
        let handle = tokio::spawn(async move {
            // Ends with TransportClosed when the test drops the receiver.
            let _ = stream_session(&src, &mut sink, &opts).await;
        });
        let mut starts = Vec::new();
        while starts.len() < 3 {
            let p = rx.0.recv().await.unwrap();
            if p.ty == PacketType::FrameStart {
                starts.push((FrameStart::parse(&p.payload).unwrap().frame_index, p.seq));
            }
        }
        drop(rx);
        let _ = handle.await;
        assert_eq!(starts[0].0, 0);
        assert_eq!(starts[1].0, 1);
        assert_eq!(starts[2].0, 0, "loop restarts at frame 0");
        assert!(starts[2].1 > starts[1].1, "seq keeps increasing across loops");
    }

    #[tokio::test]
    async fn empty_store_ends_immediately() {
        let src = source(0, None);
        let pkts = collect(&src, &SessionOptions::default().loop_playback(true)).await;
        assert_eq!(pkts.len(), 3);
        assert_eq!(pkts[2].ty, PacketType::EndStream);
    }
}
