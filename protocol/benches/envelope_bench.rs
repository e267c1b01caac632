// Envelope and watermark benchmarks.
//
// Covers symmetric sealing at a few artifact sizes, the full
// watermark + symmetric layer stack, and contiguous / steganographic
// watermark embedding and verification.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use desci_protocol::config::KdfParams;
use desci_protocol::crypto::envelope::EnvelopeCodec;
use desci_protocol::crypto::layers::{unseal, EncryptionPlan, UnsealKeys};
use desci_protocol::watermark::{self, WatermarkPosition};

// Bench the cipher, not the KDF.
const FAST_KDF: KdfParams = KdfParams::Pbkdf2Sha512 { iterations: 1_000 };
const PASSPHRASE: &[u8] = b"bench passphrase";

fn artifact(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn bench_envelope_encrypt(c: &mut Criterion) {
    let codec = EnvelopeCodec::new(FAST_KDF).unwrap();
    let mut group = c.benchmark_group("envelope/encrypt");

    for size in [1_024usize, 64 * 1_024, 1_024 * 1_024] {
        let data = artifact(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| codec.encrypt(data, PASSPHRASE).unwrap());
        });
    }

    group.finish();
}

fn bench_envelope_decrypt(c: &mut Criterion) {
    let codec = EnvelopeCodec::new(FAST_KDF).unwrap();
    let sealed = codec.encrypt(&artifact(64 * 1_024), PASSPHRASE).unwrap();
    let bytes = sealed.envelope.to_bytes();

    c.bench_function("envelope/decrypt_64k", |b| {
        b.iter(|| codec.decrypt_bytes(&bytes, PASSPHRASE).unwrap());
    });
}

fn bench_layer_stack(c: &mut Criterion) {
    let plan = EncryptionPlan::new()
        .with_watermark("alice", WatermarkPosition::Start)
        .with_symmetric(FAST_KDF);
    let data = artifact(64 * 1_024);

    c.bench_function("layers/seal_watermark_symmetric_64k", |b| {
        b.iter(|| plan.seal(&data, Some(PASSPHRASE)).unwrap());
    });

    let envelope = plan.seal(&data, Some(PASSPHRASE)).unwrap();
    let keys = UnsealKeys {
        passphrase: Some(PASSPHRASE),
        recipient: None,
    };
    c.bench_function("layers/unseal_watermark_symmetric_64k", |b| {
        b.iter(|| unseal(&envelope, &keys).unwrap());
    });
}

fn bench_watermark(c: &mut Criterion) {
    let data = artifact(1_024 * 1_024);
    let embedded = watermark::embed(&data, "alice", WatermarkPosition::Middle);

    c.bench_function("watermark/embed_1m", |b| {
        b.iter(|| watermark::embed(&data, "alice", WatermarkPosition::Middle));
    });
    c.bench_function("watermark/verify_1m", |b| {
        b.iter(|| watermark::verify(&embedded.data, "alice", None));
    });

    let floats = artifact(256 * 1_024);
    c.bench_function("watermark/embed_steganographic_256k", |b| {
        b.iter(|| watermark::embed_steganographic(&floats, "alice", 0.1).unwrap());
    });
}

criterion_group!(
    benches,
    bench_envelope_encrypt,
    bench_envelope_decrypt,
    bench_layer_stack,
    bench_watermark,
);
criterion_main!(benches);
