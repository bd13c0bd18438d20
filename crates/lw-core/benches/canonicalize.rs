use criterion::{black_box, criterion_group, criterion_main, Criterion};

use lw_core::{classify, to_surt_exact, to_surt_prefix, BoundaryPrefixes};

const URLS: &[&str] = &[
    "https://wayback.archive-it.org/20/1/https://cdn.example.com/a.js",
    "https://wayback.archive-it.org/1234/20200101000000im_/https://img.example.org/logo.png",
    "https://fonts.gstatic.com/s/roboto/v30/KFOmCnqEu92Fr1Mu4mxK.woff2",
    "https://www.google-analytics.com/analytics.js?v=2",
    "https://wayback.archive-it.org/1234/",
];

fn bench_classify(c: &mut Criterion) {
    let prefixes = BoundaryPrefixes::new(["https://wayback.archive-it.org/"]);
    c.bench_function("classify", |b| {
        b.iter(|| {
            for url in URLS {
                black_box(classify(black_box(url), &prefixes));
            }
        })
    });
}

fn bench_surt(c: &mut Criterion) {
    let prefixes = BoundaryPrefixes::new(["https://wayback.archive-it.org/"]);
    c.bench_function("to_surt_exact", |b| {
        b.iter(|| {
            for url in URLS {
                let _ = black_box(to_surt_exact(black_box(url), &prefixes));
            }
        })
    });
    c.bench_function("to_surt_prefix", |b| {
        b.iter(|| {
            for url in URLS {
                let _ = black_box(to_surt_prefix(black_box(url), &prefixes));
            }
        })
    });
}

criterion_group!(benches, bench_classify, bench_surt);
criterion_main!(benches);
