/// Hot-path costs of the replica's cryptography.
///
/// Benchmarks:
/// 1. Request digest for growing parameter lists
/// 2. Signing a Prepare
/// 3. Verifying a Prepare signature
/// 4. Verifying a view change carrying prepare certificates
///
/// Run with: cargo bench --bench digest_perf

use std::collections::BTreeMap;

use consensus_core::{request_digest, sign, verify_signature, ExecutionRequest, PrePrepare, Prepare, PrepareInfo, Request, ViewChange};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mesh_core::Keypair;

fn request(params: usize) -> Request {
    let origin = Keypair::from_seed([7; 32]).peer_id();
    let mut execute = ExecutionRequest::new("fn-bench", "bench.wasm");
    for i in 0..params {
        execute = execute.with_parameter(format!("arg{i}"), "x".repeat(32));
    }
    Request::new(origin, execute)
}

fn bench_request_digest(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_digest");
    for params in [0usize, 8, 64] {
        let req = request(params);
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(params), &req, |b, req| {
            b.iter(|| black_box(request_digest(req).unwrap()));
        });
    }
    group.finish();
}

fn bench_prepare_signatures(c: &mut Criterion) {
    let key = Keypair::from_seed([1; 32]);
    let signer = key.peer_id();
    let unsigned = Prepare { view: 3, sequence: 42, digest: request_digest(&request(4)).unwrap(), signature: String::new() };

    c.bench_function("prepare_sign", |b| {
        b.iter(|| {
            let mut msg = unsigned.clone();
            sign(&mut msg, &key).unwrap();
            black_box(msg)
        });
    });

    let mut signed = unsigned.clone();
    sign(&mut signed, &key).unwrap();
    c.bench_function("prepare_verify", |b| {
        b.iter(|| verify_signature(black_box(&signed), &signer).unwrap());
    });
}

fn bench_view_change_verify(c: &mut Criterion) {
    let keys: Vec<Keypair> = (1..=4u8).map(|i| Keypair::from_seed([i; 32])).collect();
    let prepares: Vec<PrepareInfo> = (1..=16u64)
        .map(|sequence| {
            let req = request(2);
            let digest = request_digest(&req).unwrap();
            let mut preprepare = PrePrepare { view: 0, sequence, digest: digest.clone(), request: req, signature: String::new() };
            sign(&mut preprepare, &keys[0]).unwrap();
            let mut votes = BTreeMap::new();
            for key in &keys[1..3] {
                let mut p = Prepare { view: 0, sequence, digest: digest.clone(), signature: String::new() };
                sign(&mut p, key).unwrap();
                votes.insert(key.peer_id(), p);
            }
            PrepareInfo { view: 0, sequence, digest, preprepare, prepares: votes }
        })
        .collect();
    let mut vc = ViewChange { view: 1, prepares, signature: String::new() };
    sign(&mut vc, &keys[2]).unwrap();
    let signer = keys[2].peer_id();

    c.bench_function("view_change_verify_16_certificates", |b| {
        b.iter(|| verify_signature(black_box(&vc), &signer).unwrap());
    });
}

criterion_group!(benches, bench_request_digest, bench_prepare_signatures, bench_view_change_verify);
criterion_main!(benches);
