// Copyright (C) 2026 The sanchez developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stream client: validates, orders, and reassembles packets back into
//! frames.
//!
//! The session is a small state machine: `AwaitingHeader` until a `CONFIG`
//! packet arrives, `InSession` while frames flow, `Terminated` after
//! `END_STREAM`. Frames are delivered strictly in increasing index order;
//! a frame blocked behind loss is given `max_frame_lag` to complete once a
//! later frame has finished, then skipped with a [StreamItem::FrameLost]
//! marker. In satellite sessions a single missing chunk per FEC group is
//! recovered by XOR.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, trace, warn};

use crate::codec;
use crate::frame::Frame;
use crate::packet::{
    AudioChunk, AudioConfig, FecData, FrameChunk, FrameEnd, FrameStart, Packet, PacketType,
};
use crate::transport::PacketSource;
use crate::{Config, Error, FormatError, Metadata};

mod audio;
mod seq;

use audio::AudioAssembler;
use seq::{SeqStatus, SequenceTracker, REORDER_WINDOW};

/// Frame-completion timeout when the stream's rate is unknown.
const UNKNOWN_RATE_LAG: Duration = Duration::from_millis(500);

/// Default per-packet receive timeout: three sync intervals.
const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// How many pre-`CONFIG` packets to hold for replay, covering reordering
/// of the session header itself.
const MAX_PENDING_PRECONFIG: usize = REORDER_WINDOW as usize;

/// Options controlling one receiving session.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    recv_timeout: Duration,
    max_frame_lag: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            max_frame_lag: None,
        }
    }
}

impl ClientOptions {
    /// Maximum quiet time on the transport before the session is declared
    /// dead. Should be about three times the server's sync interval.
    pub fn recv_timeout(mut self, v: Duration) -> Self {
        self.recv_timeout = v;
        self
    }

    /// How long an incomplete frame may block delivery once a later frame
    /// has completed. Defaults to twice the frame period, or 500 ms when
    /// the rate is unknown.
    pub fn max_frame_lag(mut self, v: Duration) -> Self {
        self.max_frame_lag = Some(v);
        self
    }
}

/// One item of the reassembled sequence.
#[derive(Debug)]
pub enum StreamItem {
    /// A complete frame, delivered in increasing index order.
    Frame { index: u32, frame: Frame },
    /// A frame that could not be reassembled in time; holds its position
    /// in the sequence.
    FrameLost(u32),
}

/// Counters surfaced to the consumer. Recoverable conditions are counted
/// here rather than raised.
#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    pub packets: u64,
    pub payload_bytes: u64,
    pub checksum_mismatches: u64,
    pub bad_packets: u64,
    pub stale: u64,
    pub duplicates: u64,
    pub unknown_types: u64,
    pub fec_recovered: u64,
    pub fec_unrecoverable: u64,
    pub frames_delivered: u64,
    pub frames_lost: u64,
}

/// A frame being reassembled.
struct PartialFrame {
    start: Option<FrameStart>,
    crc: Option<u32>,
    chunks: BTreeMap<u32, Bytes>,
    /// Chunk indices recovered by FEC, still zero-padded to the group's
    /// member length; trimmed at assembly.
    padded: BTreeSet<u32>,
}

impl PartialFrame {
    fn new() -> Self {
        PartialFrame {
            start: None,
            crc: None,
            chunks: BTreeMap::new(),
            padded: BTreeSet::new(),
        }
    }

    fn is_complete(&self) -> bool {
        match (&self.start, &self.crc) {
            (Some(start), Some(_)) => self.chunks.len() as u32 == start.chunk_count,
            _ => false,
        }
    }

    fn add_chunk(&mut self, index: u32, data: Bytes, padded: bool) {
        if self.chunks.contains_key(&index) {
            return;
        }
        if padded {
            self.padded.insert(index);
        }
        self.chunks.insert(index, data);
    }

    /// Concatenates the chunks, trimming FEC-recovered members to their
    /// true lengths. `None` when the buffered data is inconsistent.
    fn assemble(mut self) -> Option<Vec<u8>> {
        let start = self.start?;
        let total = start.total_bytes as usize;
        let count = start.chunk_count;
        if count == 0 || *self.chunks.keys().next_back()? >= count {
            return None;
        }
        if !self.padded.is_empty() {
            self.trim_padded(total, count)?;
        }
        let mut out = Vec::with_capacity(total);
        for data in self.chunks.values() {
            out.extend_from_slice(data);
        }
        if out.len() != total {
            return None;
        }
        Some(out)
    }

    /// Restores FEC-recovered chunks to their true lengths. Every
    /// non-final chunk shares one size, so it is derivable no matter
    /// which chunks happened to arrive exactly, independently for each
    /// recovered group.
    fn trim_padded(&mut self, total: usize, count: u32) -> Option<()> {
        let last = count - 1;
        let chunk_size = if count == 1 {
            total
        } else if let Some((_, data)) = self
            .chunks
            .iter()
            .find(|(i, _)| **i < last && !self.padded.contains(i))
        {
            data.len()
        } else if let Some(data) = self
            .chunks
            .get(&last)
            .filter(|_| !self.padded.contains(&last))
        {
            // Only the final chunk arrived exactly; the others split the
            // remainder evenly.
            let body = total.checked_sub(data.len())?;
            let size = body / (count as usize - 1);
            if size * (count as usize - 1) != body {
                return None;
            }
            size
        } else if self.chunks.values().map(Bytes::len).sum::<usize>() == total {
            // Every chunk was recovered from a single-member group, so
            // none of them carries padding.
            self.padded.clear();
            return Some(());
        } else {
            return None;
        };
        let padded = std::mem::take(&mut self.padded);
        for i in padded {
            let want = if i == last {
                total.checked_sub(chunk_size * (count as usize - 1))?
            } else {
                chunk_size
            };
            let data = self.chunks.get_mut(&i)?;
            if data.len() < want {
                return None;
            }
            let trimmed = data.slice(..want);
            *data = trimmed;
        }
        Some(())
    }
}

struct Session {
    config: Config,
    /// Next frame index owed to the consumer.
    next_index: u32,
    partials: BTreeMap<u32, PartialFrame>,
    /// Frames done reassembling (`None` = known lost), keyed by index,
    /// with their completion instant for the lag clock.
    finished: BTreeMap<u32, (Option<Frame>, Instant)>,
    /// Recent `FRAME_CHUNK` payloads keyed by seq, for FEC recovery.
    recent_chunks: VecDeque<(u32, Bytes)>,
    max_frame_lag: Duration,
}

impl Session {
    fn new(config: Config, metadata: Option<&Metadata>, opts: &ClientOptions) -> Self {
        let max_frame_lag = opts.max_frame_lag.unwrap_or_else(|| match metadata {
            Some(m) if m.duration_secs().is_some() => {
                Duration::from_secs_f64(2.0 / config.fps(m))
            }
            _ => UNKNOWN_RATE_LAG,
        });
        Session {
            config,
            next_index: 0,
            partials: BTreeMap::new(),
            finished: BTreeMap::new(),
            recent_chunks: VecDeque::new(),
            max_frame_lag,
        }
    }

    fn remember_chunk(&mut self, seq: u32, payload: Bytes, max_seen: u32) {
        self.recent_chunks.push_back((seq, payload));
        while let Some((s, _)) = self.recent_chunks.front() {
            if max_seen.wrapping_sub(*s) >= REORDER_WINDOW {
                self.recent_chunks.pop_front();
            } else {
                break;
            }
        }
    }
}

enum State {
    AwaitingHeader,
    InSession(Box<Session>),
    Terminated,
}

/// Receives one streaming session and yields its frames as a lazy
/// sequence.
pub struct StreamClient<S: PacketSource> {
    source: S,
    opts: ClientOptions,
    state: State,
    metadata: Option<Metadata>,
    config: Option<Config>,
    tracker: SequenceTracker,
    audio: AudioAssembler,
    stats: SessionStats,
    queue: VecDeque<StreamItem>,
    pending_preconfig: Vec<Packet>,
}

impl<S: PacketSource> StreamClient<S> {
    pub fn new(source: S) -> Self {
        Self::with_options(source, ClientOptions::default())
    }

    pub fn with_options(source: S, opts: ClientOptions) -> Self {
        StreamClient {
            source,
            opts,
            state: State::AwaitingHeader,
            metadata: None,
            config: None,
            tracker: SequenceTracker::new(),
            audio: AudioAssembler::new(),
            stats: SessionStats::default(),
            queue: VecDeque::new(),
            pending_preconfig: Vec::new(),
        }
    }

    /// The stream's metadata, once a `METADATA` packet has been seen.
    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// The stream's geometry, once a `CONFIG` packet has been seen.
    pub fn config(&self) -> Option<Config> {
        self.config
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// The reassembled audio blob. Complete once the session has
    /// terminated; `None` when the stream carried no audio.
    pub fn audio(&self) -> Option<Bytes> {
        self.audio.finish()
    }

    /// Returns the next frame (or loss marker), `None` at end of stream.
    ///
    /// Errors: [Error::TransportClosed] on silence or abnormal close,
    /// protocol violations (bad magic or version) as fatal.
    pub async fn next(&mut self) -> Result<Option<StreamItem>, Error> {
        loop {
            if let Some(item) = self.queue.pop_front() {
                return Ok(Some(item));
            }
            if let State::Terminated = self.state {
                return Ok(None);
            }
            let received =
                tokio::time::timeout(self.opts.recv_timeout, self.source.recv()).await;
            let pkt = match received {
                Err(_elapsed) => {
                    if self.skip_lagging() {
                        continue;
                    }
                    self.state = State::Terminated;
                    return Err(Error::TransportClosed);
                }
                Ok(Ok(Some(pkt))) => pkt,
                Ok(Ok(None)) => {
                    // EOF without END_STREAM; partial buffers are dropped.
                    self.state = State::Terminated;
                    return Err(Error::TransportClosed);
                }
                Ok(Err(e)) if e.is_recoverable() => {
                    if let Error::Protocol(crate::ProtocolError::ChecksumMismatch {
                        ..
                    }) = e
                    {
                        self.stats.checksum_mismatches += 1;
                    } else {
                        self.stats.bad_packets += 1;
                    }
                    debug!("dropping bad packet: {}", e);
                    continue;
                }
                Ok(Err(e)) => {
                    self.state = State::Terminated;
                    return Err(e);
                }
            };
            self.process(pkt)?;
            self.skip_lagging();
        }
    }

    fn process(&mut self, pkt: Packet) -> Result<(), Error> {
        self.stats.packets += 1;
        self.stats.payload_bytes += pkt.payload.len() as u64;
        match self.tracker.accept(pkt.seq) {
            SeqStatus::Stale => {
                self.stats.stale += 1;
                return Ok(());
            }
            SeqStatus::Duplicate => {
                self.stats.duplicates += 1;
                return Ok(());
            }
            SeqStatus::InOrder | SeqStatus::Reordered => {}
        }
        self.dispatch(pkt)
    }

    fn dispatch(&mut self, pkt: Packet) -> Result<(), Error> {
        match pkt.ty {
            PacketType::Metadata => {
                if self.metadata.is_none() {
                    let metadata = serde_json::from_slice(&pkt.payload)
                        .map_err(FormatError::InvalidJson)?;
                    self.metadata = Some(metadata);
                }
            }
            PacketType::Config => self.on_config(&pkt)?,
            PacketType::Sync => trace!("sync at seq {}", pkt.seq),
            PacketType::AudioConfig => match AudioConfig::parse(&pkt.payload) {
                Ok(c) => self.audio.configure(c),
                Err(_) => self.stats.bad_packets += 1,
            },
            PacketType::AudioChunk => match AudioChunk::parse(&pkt.payload) {
                Ok(c) => self.audio.push(c),
                Err(_) => self.stats.bad_packets += 1,
            },
            PacketType::EndStream => self.finish_session(),
            PacketType::Unknown(code) => {
                self.stats.unknown_types += 1;
                debug!("ignoring unknown packet type {:#04x}", code);
            }
            PacketType::FrameStart | PacketType::FrameChunk | PacketType::FrameEnd
            | PacketType::FecData => {
                if matches!(self.state, State::InSession(_)) {
                    self.on_frame_packet(pkt);
                } else if matches!(self.state, State::AwaitingHeader) {
                    // The header itself may be reordered behind frame
                    // data; hold a window's worth for replay.
                    if self.pending_preconfig.len() < MAX_PENDING_PRECONFIG {
                        self.pending_preconfig.push(pkt);
                    } else {
                        self.stats.stale += 1;
                    }
                }
            }
        }
        Ok(())
    }

    fn on_config(&mut self, pkt: &Packet) -> Result<(), Error> {
        if !matches!(self.state, State::AwaitingHeader) {
            return Ok(());
        }
        let line = std::str::from_utf8(&pkt.payload)
            .map_err(|_| FormatError::InvalidConfig("not UTF-8"))?;
        let config = Config::parse_line(line)?;
        debug!(
            "session config: {}x{}, {} frames",
            config.width(),
            config.height(),
            config.frame_count()
        );
        self.config = Some(config);
        self.state = State::InSession(Box::new(Session::new(
            config,
            self.metadata.as_ref(),
            &self.opts,
        )));
        for pkt in std::mem::take(&mut self.pending_preconfig) {
            self.on_frame_packet(pkt);
        }
        Ok(())
    }

    fn on_frame_packet(&mut self, pkt: Packet) {
        let session = match &mut self.state {
            State::InSession(s) => s,
            _ => return,
        };
        let max_seen = self.tracker.max_seen().unwrap_or(pkt.seq);
        match pkt.ty {
            PacketType::FrameStart => match FrameStart::parse(&pkt.payload) {
                Ok(start) => {
                    Self::maybe_wrap_cycle(session, start.frame_index);
                    if start.frame_index < session.next_index {
                        return;
                    }
                    session
                        .partials
                        .entry(start.frame_index)
                        .or_insert_with(PartialFrame::new)
                        .start = Some(start);
                    Self::try_complete(session, &mut self.stats, start.frame_index);
                }
                Err(_) => self.stats.bad_packets += 1,
            },
            PacketType::FrameChunk => match FrameChunk::parse(&pkt.payload) {
                Ok(chunk) => {
                    session.remember_chunk(pkt.seq, pkt.payload.clone(), max_seen);
                    if chunk.frame_index < session.next_index {
                        return;
                    }
                    session
                        .partials
                        .entry(chunk.frame_index)
                        .or_insert_with(PartialFrame::new)
                        .add_chunk(chunk.chunk_index, chunk.data, false);
                    Self::try_complete(session, &mut self.stats, chunk.frame_index);
                }
                Err(_) => self.stats.bad_packets += 1,
            },
            PacketType::FrameEnd => match FrameEnd::parse(&pkt.payload) {
                Ok(end) => {
                    if end.frame_index < session.next_index {
                        return;
                    }
                    session
                        .partials
                        .entry(end.frame_index)
                        .or_insert_with(PartialFrame::new)
                        .crc = Some(end.frame_crc32);
                    Self::try_complete(session, &mut self.stats, end.frame_index);
                }
                Err(_) => self.stats.bad_packets += 1,
            },
            PacketType::FecData => match FecData::parse(&pkt.payload) {
                Ok(fec) => Self::on_fec(session, &mut self.stats, pkt.seq, fec),
                Err(_) => self.stats.bad_packets += 1,
            },
            _ => unreachable!("dispatch() routes only frame packets here"),
        }
        Self::deliver_ready(session, &mut self.queue, &mut self.stats);
    }

    /// Looping servers restart at frame 0 with an ever-increasing seq;
    /// wrap the delivery expectation with them.
    fn maybe_wrap_cycle(session: &mut Session, frame_index: u32) {
        let n = session.config.frame_count();
        if n > 0 && frame_index == 0 && session.next_index == n {
            debug!("stream loops; expecting frame 0 again");
            session.next_index = 0;
            session.partials.clear();
            session.finished.clear();
        }
    }

    /// XOR-recovers a single missing chunk, if exactly one member of the
    /// group is absent. Members are the received `FRAME_CHUNK` packets
    /// with seq in `[group_id, parity_seq)`.
    fn on_fec(session: &mut Session, stats: &mut SessionStats, parity_seq: u32, fec: FecData) {
        let span = parity_seq.wrapping_sub(fec.group_id);
        if span == 0 || span >= REORDER_WINDOW {
            stats.bad_packets += 1;
            return;
        }
        let members: Vec<Bytes> = session
            .recent_chunks
            .iter()
            .filter(|(s, _)| s.wrapping_sub(fec.group_id) < span)
            .map(|(_, p)| p.clone())
            .collect();
        if members.len() as u32 >= fec.member_count {
            return; // nothing missing
        }
        if members.len() as u32 + 1 != fec.member_count {
            debug!(
                "fec group {}: {} of {} members present, unrecoverable",
                fec.group_id,
                members.len(),
                fec.member_count
            );
            stats.fec_unrecoverable += 1;
            return;
        }
        let mut buf = fec.parity.to_vec();
        for m in &members {
            codec::xor_pad(&mut buf, m);
        }
        let payload = Bytes::from(buf);
        let chunk = match FrameChunk::parse(&payload) {
            Ok(c) => c,
            Err(_) => {
                stats.fec_unrecoverable += 1;
                return;
            }
        };
        if chunk.frame_index < session.next_index {
            return;
        }
        trace!(
            "fec recovered chunk {} of frame {}",
            chunk.chunk_index,
            chunk.frame_index
        );
        stats.fec_recovered += 1;
        session
            .partials
            .entry(chunk.frame_index)
            .or_insert_with(PartialFrame::new)
            .add_chunk(chunk.chunk_index, chunk.data, true);
        Self::try_complete(session, stats, chunk.frame_index);
    }

    /// Moves a partial frame to `finished` once everything has arrived,
    /// verifying CRC and decoding.
    fn try_complete(session: &mut Session, stats: &mut SessionStats, index: u32) {
        let done = match session.partials.get(&index) {
            Some(p) => p.is_complete(),
            None => false,
        };
        if !done {
            return;
        }
        let partial = session.partials.remove(&index).unwrap();
        let expected_crc = partial.crc.unwrap();
        let frame = Self::decode_frame(&session.config, partial, expected_crc);
        if frame.is_none() {
            warn!("frame {} failed reassembly, marking lost", index);
            stats.frames_lost += 1;
        }
        session.finished.insert(index, (frame, Instant::now()));
    }

    fn decode_frame(config: &Config, partial: PartialFrame, expected_crc: u32) -> Option<Frame> {
        let deflated = partial.assemble()?;
        if codec::crc32(&deflated) != expected_crc {
            return None;
        }
        let rgb = codec::inflate(&deflated, config.frame_len()).ok()?;
        Frame::from_rgb(config.width(), config.height(), rgb).ok()
    }

    /// Queues finished frames owed next in order.
    fn deliver_ready(
        session: &mut Session,
        queue: &mut VecDeque<StreamItem>,
        stats: &mut SessionStats,
    ) {
        while let Some((frame, _)) = session.finished.remove(&session.next_index) {
            let index = session.next_index;
            session.next_index = session.next_index.wrapping_add(1);
            match frame {
                Some(frame) => {
                    stats.frames_delivered += 1;
                    queue.push_back(StreamItem::Frame { index, frame });
                }
                None => queue.push_back(StreamItem::FrameLost(index)),
            }
        }
    }

    /// Skips frames that have blocked delivery longer than the lag bound
    /// while a later frame sits finished. Returns whether anything was
    /// queued.
    fn skip_lagging(&mut self) -> bool {
        let session = match &mut self.state {
            State::InSession(s) => s,
            _ => return false,
        };
        let before = self.queue.len();
        loop {
            Self::deliver_ready(session, &mut self.queue, &mut self.stats);
            let blocking = session
                .finished
                .iter()
                .next()
                .map(|(i, (_, at))| (*i, *at));
            match blocking {
                Some((i, finished_at))
                    if i != session.next_index
                        && finished_at.elapsed() >= session.max_frame_lag =>
                {
                    debug!(
                        "frame {} lagged {}ms behind finished frame {}, skipping",
                        session.next_index,
                        session.max_frame_lag.as_millis(),
                        i
                    );
                    session.partials.remove(&session.next_index);
                    self.stats.frames_lost += 1;
                    self.queue.push_back(StreamItem::FrameLost(session.next_index));
                    session.next_index = session.next_index.wrapping_add(1);
                }
                _ => break,
            }
        }
        self.queue.len() > before
    }

    /// Handles `END_STREAM`: drains everything finished, marks known gaps
    /// lost, and terminates.
    fn finish_session(&mut self) {
        if let State::InSession(session) = &mut self.state {
            let known: BTreeSet<u32> = session
                .finished
                .keys()
                .chain(session.partials.keys())
                .copied()
                .filter(|i| *i >= session.next_index)
                .collect();
            for index in known {
                while session.next_index < index {
                    // A gap the stream told us about but never finished.
                    self.stats.frames_lost += 1;
                    self.queue
                        .push_back(StreamItem::FrameLost(session.next_index));
                    session.next_index += 1;
                }
                match session.finished.remove(&index) {
                    Some((Some(frame), _)) => {
                        self.stats.frames_delivered += 1;
                        self.queue.push_back(StreamItem::Frame { index, frame });
                    }
                    _ => {
                        self.stats.frames_lost += 1;
                        self.queue.push_back(StreamItem::FrameLost(index));
                    }
                }
                session.next_index = index + 1;
            }
            // Frames whose every packet vanished leave no trace; the
            // config still promised them.
            while session.next_index < session.config.frame_count() {
                self.stats.frames_lost += 1;
                self.queue
                    .push_back(StreamItem::FrameLost(session.next_index));
                session.next_index += 1;
            }
            debug!(
                "session terminated: {} delivered, {} lost",
                self.stats.frames_delivered, self.stats.frames_lost
            );
        }
        self.state = State::Terminated;
    }
}
