use std::sync::atomic::AtomicBool;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use bpow_types::{WorkHash, WorkNonce};
use bpow_work::{is_work_valid, work_value, WorkGenerator};

fn bench_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("generation");
    let hash = WorkHash::new([0x42; 32]);
    let cancel = AtomicBool::new(false);

    // Low thresholds that complete quickly enough for benchmarking.
    for threshold in [0xF000_0000_0000_0000u64, 0xFF00_0000_0000_0000, 0xFFF0_0000_0000_0000] {
        group.bench_with_input(
            BenchmarkId::new("generate", format!("{threshold:#x}")),
            &threshold,
            |b, &threshold| {
                b.iter(|| {
                    black_box(
                        WorkGenerator
                            .generate(black_box(&hash), black_box(threshold), &cancel)
                            .unwrap(),
                    )
                });
            },
        );
    }

    group.finish();
}

fn bench_validation(c: &mut Criterion) {
    let hash_hex = "3F93C5CD2E314FA16702189041E68E68C07B27961BF37F0B7705145BEFBA3AA3";

    c.bench_function("validate_hex_valid", |b| {
        b.iter(|| black_box(is_work_valid(black_box(hash_hex), 64, black_box("205452237a9b01f4"))));
    });

    c.bench_function("work_value", |b| {
        let hash = WorkHash::new([0xFF; 32]);
        b.iter(|| black_box(work_value(black_box(&hash), black_box(WorkNonce(12345)))));
    });
}

criterion_group!(benches, bench_generation, bench_validation);
criterion_main!(benches);
