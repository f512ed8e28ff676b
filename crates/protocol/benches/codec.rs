//! Performance benchmarks for the wire codec.
//!
//! These benchmarks measure the hot paths of a connection:
//! - Node marshalling and unmarshalling
//! - Frame encryption

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use xxmp_protocol::{CipherState, Dictionary, Node};

fn sample_node(children: usize, data_len: usize) -> Node {
    Node::new("message")
        .with_attr("to", "15551234567@s.whatsapp.net")
        .with_attr("type", "text")
        .with_attr("id", "3EB0C767D26A1D6B2F42")
        .with_children(
            (0..children)
                .map(|_| Node::new("enc").with_attr("v", "2").with_data(vec![0xA5; data_len]))
                .collect(),
        )
}

/// Benchmark node marshalling.
fn bench_node_codec(c: &mut Criterion) {
    let dict = Dictionary::builtin();
    let mut group = c.benchmark_group("node_codec");

    for (name, node) in [
        ("small", sample_node(1, 32)),
        ("medium", sample_node(8, 512)),
        ("large", sample_node(32, 4096)),
    ] {
        let bytes = node.marshal(&dict).unwrap_or_default();
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_function(format!("marshal_{}", name), |b| {
            b.iter(|| black_box(&node).marshal(&dict))
        });
        group.bench_function(format!("unmarshal_{}", name), |b| {
            b.iter(|| Node::unmarshal(black_box(&bytes), &dict))
        });
    }

    group.finish();
}

/// Benchmark frame payload encryption.
fn bench_cipher(c: &mut Criterion) {
    let mut group = c.benchmark_group("cipher");

    for size in [64usize, 4096, 65536] {
        let payload = vec![0u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("encrypt_{}B", size), |b| {
            let mut state = CipherState::new([7u8; 32]);
            b.iter(|| state.encrypt(black_box(&payload)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_node_codec, bench_cipher);
criterion_main!(benches);
