//! Codec benchmarks for huddle-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use huddle_protocol::{codec, CallSignal, ClientEvent};

fn offer_event() -> ClientEvent {
    ClientEvent::call(
        "peer-1",
        "peer-2",
        CallSignal::Offer {
            sdp: "v=0\r\n".repeat(200),
        },
    )
}

fn bench_encode_msgpack(c: &mut Criterion) {
    let event = offer_event();

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));
    group.bench_function("offer_msgpack", |b| {
        b.iter(|| codec::encode(black_box(&event)))
    });
    group.bench_function("offer_json", |b| {
        b.iter(|| codec::encode_json(black_box(&event)))
    });
    group.finish();
}

fn bench_decode_msgpack(c: &mut Criterion) {
    let event = offer_event();
    let encoded = codec::encode(&event).unwrap();
    let text = codec::encode_json(&event).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("offer_msgpack", |b| {
        b.iter(|| codec::decode::<ClientEvent>(black_box(&encoded)))
    });
    group.bench_function("offer_json", |b| {
        b.iter(|| codec::decode_json::<ClientEvent>(black_box(&text)))
    });
    group.finish();
}

fn bench_roundtrip(c: &mut Criterion) {
    let event = ClientEvent::join_room("server-1-channel-9", "peer-1");

    c.bench_function("roundtrip_join_room", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&event)).unwrap();
            codec::decode::<ClientEvent>(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_msgpack,
    bench_decode_msgpack,
    bench_roundtrip
);
criterion_main!(benches);
