use criterion::{black_box, criterion_group, criterion_main, Criterion};

use blackfire_probe::format::write_profile;
use blackfire_probe::graph::ProfileBuilder;
use blackfire_probe::options::ProbeOptions;

fn stack(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// A profile with a few hundred distinct stacks and some recursion.
fn build_profile() -> blackfire_probe::graph::Profile {
    let mut builder = ProfileBuilder::new(100);

    for i in 0..100 {
        let leaf = format!("handler_{}", i % 25);
        builder.add_cpu_sample(
            stack(&["go", "main", "serve", "dispatch", &leaf]),
            (i % 5) + 1,
            1_000 + i * 10,
        );
        let mut recursive = stack(&["go", "main", "serve", "dispatch", "dispatch", &leaf]);
        blackfire_probe::graph::decycle(&mut recursive);
        builder.add_cpu_sample(recursive, 1, 500);
    }
    for i in 0..50 {
        let leaf = format!("alloc_{}", i % 10);
        builder.add_heap_sample(stack(&["go", "main", "serve", &leaf]), 2, 4_096);
    }

    builder.finish()
}

fn bench_build(c: &mut Criterion) {
    c.bench_function("graph_build_300_samples", |b| {
        b.iter(|| black_box(build_profile()))
    });
}

fn bench_encode(c: &mut Criterion) {
    let profile = build_profile();
    let mut options = ProbeOptions::new();
    options.set("flag_timespan", "1");

    c.bench_function("wire_encode_with_timeline", |b| {
        b.iter(|| {
            let mut out = Vec::with_capacity(64 * 1024);
            write_profile(&mut out, black_box(&profile), &options, "bench").expect("encode");
            black_box(out)
        })
    });
}

criterion_group!(benches, bench_build, bench_encode);
criterion_main!(benches);
