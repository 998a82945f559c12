use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;

use blipmqtt::core::packet::{decode, encode, encode_into, Connect, Packet, Publish, QoS};
use blipmqtt::core::session::{Attachment, Session};
use blipmqtt::core::topics::{RetainedStore, TopicMatcher};
use bytes::{Bytes, BytesMut};

fn publish_packet(payload_size: usize) -> Packet {
    let mut publish = Publish::new("plant/line-3/press/7/temperature", Bytes::from(vec![0u8; payload_size]));
    publish.qos = QoS::AtLeastOnce;
    publish.packet_id = Some(42);
    Packet::Publish(publish)
}

fn bench_publish_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_codec");

    for &size in [16usize, 1024, 64 * 1024].iter() {
        let packet = publish_packet(size);
        let frame = encode(&packet).unwrap();
        group.throughput(Throughput::Bytes(frame.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &packet, |b, packet| {
            let mut buf = BytesMut::with_capacity(frame.len());
            b.iter(|| {
                buf.clear();
                encode_into(black_box(packet), &mut buf).unwrap();
            });
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &frame, |b, frame| {
            b.iter(|| black_box(decode(black_box(frame)).unwrap()));
        });
    }
    group.finish();
}

fn bench_topic_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("topic_matching");
    let matcher = TopicMatcher::default();
    let topic = "plant/line-3/press/7/temperature";

    for filter in ["plant/line-3/press/7/temperature", "plant/+/press/+/temperature", "plant/#", "other/#"] {
        group.bench_with_input(BenchmarkId::new("matches", filter), &filter, |b, filter| {
            b.iter(|| black_box(matcher.matches(black_box(filter), black_box(topic))));
        });
    }
    group.finish();
}

fn bench_retained_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("retained_lookup");
    let matcher = TopicMatcher::default();

    for &size in [100usize, 10_000].iter() {
        let store = RetainedStore::new();
        for i in 0..size {
            let mut publish = Publish::new(format!("plant/line-{}/press/{}/state", i % 10, i), "ok");
            publish.retain = true;
            store.retain(&publish);
        }
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("line_filter", size), &store, |b, store| {
            b.iter(|| black_box(store.matching("plant/line-3/#", &matcher).len()));
        });
    }
    group.finish();
}

fn bench_session_fanout(c: &mut Criterion) {
    let matcher = TopicMatcher::default();
    let connect = Connect::new("bench");
    let publish = Publish::new("plant/line-3/press/7/temperature", "21.5");

    c.bench_function("session_deliver_and_drain", |b| {
        let session = Session::new("bench".into(), &connect, 1000);
        let attachment = Attachment {
            conn_id: 1,
            peer: "127.0.0.1:1883".parse().unwrap(),
        };
        session.attach(&connect, attachment, false);
        session.subscribe("plant/+/press/#", QoS::AtMostOnce);
        b.iter(|| {
            session.deliver(black_box(&publish), &matcher).unwrap();
            black_box(session.next_outbound(1));
        });
    });
}

criterion_group!(
    benches,
    bench_publish_codec,
    bench_topic_matching,
    bench_retained_lookup,
    bench_session_fanout
);
criterion_main!(benches);
