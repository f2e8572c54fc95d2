use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use video_hw_decode::synthetic::{H264StreamWriter, SyntheticEngine, SyntheticGraphics};
use video_hw_decode::{
    Codec, DecodedFrame, DecoderError, DecoderSession, Dimensions, EncodedPacket, RtpTimestamp,
};

const FRAMES_PER_RUN: u32 = 30;

fn stream(dims: Dimensions) -> Vec<Vec<u8>> {
    let writer = H264StreamWriter::new(dims);
    std::iter::once(writer.keyframe(26))
        .chain((1..FRAMES_PER_RUN).map(|n| writer.delta_frame(n, 28)))
        .collect()
}

fn run_decode(hardware: bool, dims: Dimensions, packets: &[Vec<u8>]) -> Result<(), DecoderError> {
    let mut session = if hardware {
        DecoderSession::new(SyntheticEngine::new().with_hardware())
            .with_graphics(Arc::new(SyntheticGraphics::new()))
    } else {
        DecoderSession::new(SyntheticEngine::new())
    };
    session.register_consumer(|frame: DecodedFrame, _qp: Option<u8>| {
        std::hint::black_box(frame);
    });
    session.configure(Codec::H264, Some(dims))?;
    for (n, data) in packets.iter().enumerate() {
        session.decode(&EncodedPacket::new(
            data.clone(),
            RtpTimestamp(n as u32 * 3000),
        ))?;
    }
    Ok(())
}

fn decode_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_synthetic");
    group.sample_size(30);
    group.measurement_time(Duration::from_secs(5));
    group.warm_up_time(Duration::from_secs(1));

    for (label, width, height) in [("360p", 640, 360), ("720p", 1280, 720), ("1080p", 1918, 1080)] {
        let Some(dims) = Dimensions::new(width, height) else {
            continue;
        };
        let packets = stream(dims);
        for hardware in [false, true] {
            let path = if hardware { "hardware" } else { "software" };
            group.throughput(Throughput::Elements(u64::from(FRAMES_PER_RUN)));
            group.bench_with_input(BenchmarkId::new(path, label), &packets, |b, packets| {
                b.iter(|| {
                    run_decode(hardware, dims, packets).expect("decode should succeed in benchmark");
                });
            });
        }
    }

    group.finish();
}

criterion_group!(benches, decode_benchmark);
criterion_main!(benches);
