//! Micro-benchmarks for the packet hot path: parse, checksum, synthesis.

use std::net::Ipv4Addr;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use tunnat::packet::{builder, checksum, parse, tcp_flags};

const SRC: Ipv4Addr = Ipv4Addr::new(10, 8, 0, 2);
const DST: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

fn sample_tcp_packet(payload_len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; 40 + payload_len];
    for (i, b) in buf[40..].iter_mut().enumerate() {
        *b = i as u8;
    }
    let len = builder::tcp_packet(
        &mut buf,
        SRC,
        DST,
        40000,
        443,
        0x1000_0000,
        0x2000_0000,
        tcp_flags::PSH | tcp_flags::ACK,
        64240,
        payload_len,
    );
    buf.truncate(len);
    buf
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    for payload_len in [0usize, 512, 1400] {
        let packet = sample_tcp_packet(payload_len);
        group.throughput(Throughput::Bytes(packet.len() as u64));
        group.bench_function(format!("tcp_{payload_len}"), |b| {
            b.iter(|| parse(black_box(&packet)).unwrap());
        });
    }
    group.finish();
}

fn bench_checksum(c: &mut Criterion) {
    let packet = sample_tcp_packet(1400);
    let mut group = c.benchmark_group("checksum");
    group.throughput(Throughput::Bytes((packet.len() - 20) as u64));
    group.bench_function("tcp_pseudo_header", |b| {
        b.iter(|| checksum::tcp(black_box(SRC), black_box(DST), black_box(&packet[20..])));
    });
    group.finish();
}

fn bench_build(c: &mut Criterion) {
    let mut buf = vec![0u8; 2048];
    c.bench_function("build_tcp_reply_1400", |b| {
        b.iter(|| {
            builder::tcp_packet(
                black_box(&mut buf),
                DST,
                SRC,
                443,
                40000,
                0x1000_0000,
                0x2000_0000,
                tcp_flags::PSH | tcp_flags::ACK,
                64240,
                1400,
            )
        });
    });
}

criterion_group!(benches, bench_parse, bench_checksum, bench_build);
criterion_main!(benches);
