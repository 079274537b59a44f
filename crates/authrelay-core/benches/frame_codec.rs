//! Performance benchmarks for the wire codec and the handshake.
//!
//! Measures frame encode/decode cost across payload sizes and the cost of a
//! complete in-memory SCRAM handshake.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio_util::codec::{Decoder, Encoder};

use authrelay_core::auth::create_provider;
use authrelay_core::config::{CredentialConfig, SecurityConfig, UserCredential};
use authrelay_core::protocol::{Message, MessageCodec};
use authrelay_core::testing::{establish, user};

/// A message whose opaque token is `size` bytes long.
fn message_with_token(size: usize) -> Message {
    Message::client_token(vec![0x5a; size])
}

/// Benchmark encoding one message into a frame.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for size in [64usize, 1024, 16 * 1024] {
        let message = message_with_token(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("message", size), &message, |b, m| {
            let mut codec = MessageCodec::new();
            let mut buf = BytesMut::with_capacity(2 * size + 64);
            b.iter(|| {
                buf.clear();
                codec.encode(m.clone(), &mut buf).unwrap();
                black_box(buf.len());
            });
        });
    }

    group.finish();
}

/// Benchmark decoding one frame into a message.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for size in [64usize, 1024, 16 * 1024] {
        let mut wire = BytesMut::new();
        MessageCodec::new()
            .encode(message_with_token(size), &mut wire)
            .unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("message", size), &wire, |b, w| {
            let mut codec = MessageCodec::new();
            b.iter(|| {
                let mut buf = w.clone();
                black_box(codec.decode(&mut buf).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark a complete SCRAM-SHA-256 handshake without sockets.
fn bench_scram_handshake(c: &mut Criterion) {
    let mut group = c.benchmark_group("handshake");

    let security = SecurityConfig {
        credentials: CredentialConfig::Inline {
            users: vec![UserCredential::new("alice", "alice-secret")],
        },
        ..SecurityConfig::default()
    };
    let provider = create_provider(&security).unwrap();
    let credential = user("alice");

    group.sample_size(20);
    group.bench_function("scram_sha256", |b| {
        b.iter(|| {
            black_box(establish(provider.as_ref(), &credential).unwrap());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_scram_handshake);
criterion_main!(benches);
