use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use evrpc_client::ipc::{FrameBuffer, NotifyMessage, RpcCodec, RpcEnvelope, Topic, methods};
use rand::{Rng, SeedableRng, rngs::StdRng};

/// A notify envelope whose payload holds `n` random readings
fn gen_notify(n: usize, rng: &mut StdRng) -> RpcEnvelope {
    let readings: Vec<u32> = (0..n).map(|_| rng.gen_range(0..10_000)).collect();
    let notify = NotifyMessage::new(Topic::from("guns"), serde_json::json!({ "readings": readings }));
    RpcEnvelope::request(
        methods::NOTIFY,
        serde_json::to_value(notify).expect("notify serializes"),
    )
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");

    // small payloads stay plain, the larger ones cross the compression threshold
    let sizes = [8, 128, 4_096, 65_536];

    for &n in &sizes {
        let mut rng = StdRng::seed_from_u64(n as u64);
        let envelope = gen_notify(n, &mut rng);
        let frame = RpcCodec::encode(&envelope).expect("frame encodes");
        group.throughput(Throughput::Bytes(frame.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", n), &envelope, |b, envelope| {
            b.iter(|| {
                let frame = RpcCodec::encode(black_box(envelope)).expect("frame encodes");
                black_box(frame);
            });
        });

        group.bench_with_input(BenchmarkId::new("decode", n), &frame, |b, frame| {
            b.iter(|| {
                let decoded = RpcCodec::decode(black_box(frame)).expect("frame decodes");
                black_box(decoded);
            });
        });

        // the same frame split across reads, as the socket readers see it
        group.bench_with_input(BenchmarkId::new("frame_buffer", n), &frame, |b, frame| {
            b.iter(|| {
                let mut buffer = FrameBuffer::new();
                for chunk in frame.chunks(4096) {
                    buffer.push(black_box(chunk));
                }
                let decoded = buffer.try_decode().expect("frame decodes");
                black_box(decoded);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_codec);
criterion_main!(benches);
