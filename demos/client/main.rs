// Copyright (C) 2026 The sanchez developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `.sanchez` demo tool: write a test-pattern file, play one back, serve
//! it over the network, or receive a stream into a file.

use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Error};
use bytes::Bytes;
use log::{error, info};
use structopt::StructOpt;

use sanchez::client::{ClientOptions, StreamClient, StreamItem};
use sanchez::codec::Encoding;
use sanchez::container;
use sanchez::player::{Player, PlayerState};
use sanchez::server::{serve_tcp, stream_session, SessionOptions, StreamSource};
use sanchez::transport::{PacketSource, TcpTransport, UdpTransport};
use sanchez::{Frame, FrameStore, Metadata};

#[derive(StructOpt)]
struct SaveOpts {
    /// Output .sanchez path.
    #[structopt(long, parse(from_os_str))]
    output: PathBuf,

    #[structopt(long, default_value = "64")]
    width: u32,

    #[structopt(long, default_value = "48")]
    height: u32,

    #[structopt(long, default_value = "48")]
    frames: u32,

    #[structopt(long, default_value = "24")]
    fps: f64,

    /// Write hex frame lines instead of compressed ones.
    #[structopt(long)]
    hex: bool,
}

#[derive(StructOpt)]
struct PlayOpts {
    #[structopt(parse(from_os_str))]
    input: PathBuf,

    #[structopt(long)]
    loop_playback: bool,
}

#[derive(StructOpt)]
struct ServeOpts {
    #[structopt(parse(from_os_str))]
    input: PathBuf,

    /// tcp, udp, multicast, or broadcast.
    #[structopt(long, default_value = "tcp")]
    transport: String,

    /// Listen address (tcp) or destination address (udp family).
    #[structopt(long, default_value = "127.0.0.1:5455")]
    addr: SocketAddr,

    #[structopt(long)]
    loop_playback: bool,

    /// Enable FEC and MTU-sized chunks for lossy links.
    #[structopt(long)]
    satellite: bool,

    /// Sibling .mp3 audio to embed in the stream.
    #[structopt(long, parse(from_os_str))]
    audio: Option<PathBuf>,
}

#[derive(StructOpt)]
struct ReceiveOpts {
    /// tcp, udp, or multicast.
    #[structopt(long, default_value = "tcp")]
    transport: String,

    /// Server address (tcp) or local/group address (udp family).
    #[structopt(long, default_value = "127.0.0.1:5455")]
    addr: SocketAddr,

    /// Where to write the received frames.
    #[structopt(long, parse(from_os_str))]
    output: PathBuf,
}

#[derive(StructOpt)]
enum Cmd {
    /// Writes a synthetic test-pattern container.
    Save(SaveOpts),
    /// Plays a container against the scheduler, printing render times.
    Play(PlayOpts),
    /// Streams a container over the network.
    Serve(ServeOpts),
    /// Receives a stream and stores it as a container.
    Receive(ReceiveOpts),
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(e) = main_inner().await {
        error!("Fatal: {}", e);
        std::process::exit(1);
    }
    info!("Done");
}

async fn main_inner() -> Result<(), Error> {
    match Cmd::from_args() {
        Cmd::Save(opts) => save(opts),
        Cmd::Play(opts) => play(opts).await,
        Cmd::Serve(opts) => serve(opts).await,
        Cmd::Receive(opts) => receive(opts).await,
    }
}

/// A moving diagonal gradient, distinct per frame.
fn test_pattern(width: u32, height: u32, index: u32) -> Frame {
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            data.push((x * 4 + index * 8) as u8);
            data.push((y * 4 + index * 8) as u8);
            data.push((x + y) as u8);
        }
    }
    Frame::from_rgb(width, height, data).expect("pattern matches geometry")
}

fn save(opts: SaveOpts) -> Result<(), Error> {
    let mut store = FrameStore::new(opts.width, opts.height)?;
    for i in 0..opts.frames {
        store.push(test_pattern(opts.width, opts.height, i))?;
    }
    let metadata = Metadata {
        title: "test pattern".to_owned(),
        creator: "sanchez demo".to_owned(),
        created_at: "2026-01-02T01:30:43Z".to_owned(),
        seconds: format!("{:.3}", f64::from(opts.frames) / opts.fps),
    };
    let encoding = if opts.hex {
        Encoding::Hex
    } else {
        Encoding::Compressed
    };
    let file = std::fs::File::create(&opts.output)?;
    container::write(std::io::BufWriter::new(file), &metadata, &store, encoding)?;
    info!(
        "wrote {} {}x{} frames to {}",
        opts.frames,
        opts.width,
        opts.height,
        opts.output.display()
    );
    Ok(())
}

fn load(path: &PathBuf) -> Result<(Metadata, FrameStore), Error> {
    let file = std::fs::File::open(path)?;
    Ok(container::Reader::new(BufReader::new(file))?.read_store()?)
}

async fn play(opts: PlayOpts) -> Result<(), Error> {
    let (metadata, store) = load(&opts.input)?;
    let config = store.config()?;
    let start = Instant::now();
    let mut player =
        Player::from_header(&metadata, &config, start).looping(opts.loop_playback);
    info!("playing {} frames at {:.2} fps", store.len(), player.fps());
    while player.state() != PlayerState::Ended {
        let now = Instant::now();
        if let Some(index) = player.tick(now) {
            let frame = store
                .get(index as usize)
                .ok_or_else(|| anyhow!("scheduler produced index {} out of range", index))?;
            println!(
                "{:8.3}s frame {:5} ({}x{})",
                player.position_secs(now),
                index,
                frame.width(),
                frame.height()
            );
        }
        tokio::time::sleep(Duration::from_secs_f64(0.25 / player.fps())).await;
    }
    Ok(())
}

async fn serve(opts: ServeOpts) -> Result<(), Error> {
    let (metadata, frames) = load(&opts.input)?;
    let audio = match &opts.audio {
        Some(path) => Some(Bytes::from(std::fs::read(path)?)),
        None => None,
    };
    let source = StreamSource {
        metadata,
        frames,
        audio,
    };
    let session_opts = SessionOptions::default()
        .loop_playback(opts.loop_playback)
        .satellite(opts.satellite);
    match opts.transport.as_str() {
        "tcp" => {
            let listener = tokio::net::TcpListener::bind(opts.addr).await?;
            info!("serving on tcp {}", opts.addr);
            serve_tcp(listener, Arc::new(source), session_opts).await?;
        }
        "udp" => {
            let mut t = UdpTransport::unicast(opts.addr).await?;
            info!("streaming to udp {}", opts.addr);
            stream_session(&source, &mut t, &session_opts).await?;
        }
        "multicast" => {
            let group = match opts.addr {
                SocketAddr::V4(g) => g,
                SocketAddr::V6(_) => bail!("multicast groups must be IPv4"),
            };
            let mut t = UdpTransport::multicast_sender(group, 1).await?;
            info!("streaming to multicast {}", group);
            stream_session(&source, &mut t, &session_opts).await?;
        }
        "broadcast" => {
            let mut t = UdpTransport::broadcast(opts.addr).await?;
            info!("streaming to broadcast {}", opts.addr);
            stream_session(&source, &mut t, &session_opts).await?;
        }
        o => bail!("unknown transport {:?}", o),
    }
    Ok(())
}

async fn receive(opts: ReceiveOpts) -> Result<(), Error> {
    match opts.transport.as_str() {
        "tcp" => {
            let t = TcpTransport::connect(opts.addr).await?;
            receive_inner(t, &opts).await
        }
        "udp" => {
            let t = UdpTransport::bind(opts.addr).await?;
            receive_inner(t, &opts).await
        }
        "multicast" => {
            let group = match opts.addr {
                SocketAddr::V4(g) => g,
                SocketAddr::V6(_) => bail!("multicast groups must be IPv4"),
            };
            let t = UdpTransport::multicast_receiver(group).await?;
            receive_inner(t, &opts).await
        }
        o => bail!("unknown transport {:?}", o),
    }
}

async fn receive_inner<S: PacketSource>(transport: S, opts: &ReceiveOpts) -> Result<(), Error> {
    let mut client = StreamClient::with_options(transport, ClientOptions::default());
    let mut frames = Vec::new();
    while let Some(item) = client.next().await? {
        match item {
            StreamItem::Frame { index, frame } => {
                info!("frame {} ({} bytes)", index, frame.data().len());
                frames.push(frame);
            }
            StreamItem::FrameLost(index) => info!("frame {} lost", index),
        }
    }
    let stats = client.stats();
    info!(
        "{} delivered, {} lost, {} recovered by fec",
        stats.frames_delivered, stats.frames_lost, stats.fec_recovered
    );
    let metadata = client
        .metadata()
        .cloned()
        .ok_or_else(|| anyhow!("stream ended before metadata arrived"))?;
    let config = client
        .config()
        .ok_or_else(|| anyhow!("stream ended before config arrived"))?;
    let mut store = FrameStore::new(config.width(), config.height())?;
    for frame in frames {
        store.push(frame)?;
    }
    let file = std::fs::File::create(&opts.output)?;
    container::write(
        std::io::BufWriter::new(file),
        &metadata,
        &store,
        Encoding::Compressed,
    )?;
    if let Some(audio) = client.audio() {
        let audio_path = opts.output.with_extension("mp3");
        std::fs::write(&audio_path, &audio)?;
        info!("wrote sibling audio {}", audio_path.display());
    }
    info!("wrote {} frames to {}", store.len(), opts.output.display());
    Ok(())
}
