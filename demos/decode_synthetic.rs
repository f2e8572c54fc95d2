use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use video_hw_decode::synthetic::{H264StreamWriter, SyntheticEngine, SyntheticGraphics};
use video_hw_decode::{
    Codec, DecodedFrame, DecoderSession, DecoderSettings, Dimensions, EncodedPacket, RtpTimestamp,
};

#[derive(Parser, Debug)]
#[command(about = "Decode a synthetic stream through a decoder session")]
struct Args {
    #[arg(long, default_value = "h264")]
    codec: String,
    #[arg(long, default_value_t = 1280)]
    width: u32,
    #[arg(long, default_value_t = 720)]
    height: u32,
    #[arg(long, default_value_t = 60)]
    frames: u32,
    #[arg(long, default_value_t = false)]
    hardware: bool,
    #[arg(long)]
    pool_size: Option<usize>,
}

#[derive(Debug, Default)]
struct Tally {
    frames: usize,
    hardware_frames: usize,
    last: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let codec: Codec = args
        .codec
        .parse()
        .with_context(|| format!("invalid --codec {}", args.codec))?;
    let dims = Dimensions::new(args.width, args.height)
        .with_context(|| format!("invalid size {}x{}", args.width, args.height))?;

    let mut session = if args.hardware {
        DecoderSession::new(SyntheticEngine::new().with_hardware())
            .with_graphics(Arc::new(SyntheticGraphics::new()))
    } else {
        DecoderSession::new(SyntheticEngine::new())
    };

    let tally = Arc::new(Mutex::new(Tally::default()));
    let sink = Arc::clone(&tally);
    session.register_consumer(move |frame: DecodedFrame, qp: Option<u8>| {
        let mut tally = sink.lock().unwrap_or_else(|p| p.into_inner());
        tally.frames += 1;
        if frame.is_hardware() {
            tally.hardware_frames += 1;
        }
        tally.last = Some(format!("{frame} qp={qp:?}"));
    });

    let mut settings = DecoderSettings::new(codec).with_max_render_resolution(Some(dims));
    if let Some(size) = args.pool_size {
        settings = settings.with_buffer_pool_size(size);
    }
    session
        .configure_with(settings)
        .context("decoder configure failed")?;

    let writer = H264StreamWriter::new(dims);
    for n in 0..args.frames {
        let data = match (codec, n) {
            (Codec::H264, 0) => writer.keyframe(26),
            (Codec::H264, n) => writer.delta_frame(n, 28),
            (_, n) => vec![0, 0, 1, 0x26, (n % 251) as u8 + 1],
        };
        session
            .decode(&EncodedPacket::new(data, RtpTimestamp(n * 3000)))
            .with_context(|| format!("decode failed at frame {n}"))?;
    }

    let tally = tally.lock().unwrap_or_else(|p| p.into_inner());
    println!("{}", session.info());
    println!("{}", session.pool_stats());
    println!(
        "decoded_frames={}, hardware_frames={}, last={}",
        tally.frames,
        tally.hardware_frames,
        tally.last.as_deref().unwrap_or("none")
    );
    Ok(())
}
