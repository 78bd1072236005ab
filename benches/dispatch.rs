//! Benchmarks for the tool-dispatch hot path.
//!
//! Every tool-use event pays for param normalization plus a dedup check
//! before anything executes, so these two stay on the latency path of an
//! otherwise streaming conversation.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::time::Duration;

use switchboard::{normalize_params, SessionId, ToolDispatcher};

fn bench_normalize(c: &mut Criterion) {
    let flat = json!({"account": "123", "currency": "USD", "include_pending": true});
    let nested = json!({
        "filters": {
            "date_range": {"from": "2025-01-01", "to": "2025-03-31"},
            "categories": ["transfers", "fees", "interest"],
            "amount": {"min": 0, "max": 10_000},
        },
        "account": "123",
        "page": {"size": 50, "cursor": "abc123"},
    });

    c.bench_function("normalize_flat_params", |b| {
        b.iter(|| normalize_params(black_box(&flat)))
    });
    c.bench_function("normalize_nested_params", |b| {
        b.iter(|| normalize_params(black_box(&nested)))
    });
}

fn bench_dedup_check(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let _guard = rt.enter();

    let dispatcher = ToolDispatcher::new(Duration::from_millis(5000), 3);
    let session = SessionId::from("bench-session");
    let params = json!({"account": "123", "currency": "USD"});

    // Warm the slot so the bench measures the duplicate-hit path.
    dispatcher.check_duplicate(&session, "lookup_balance", &params);

    c.bench_function("check_duplicate_hit", |b| {
        b.iter(|| dispatcher.check_duplicate(black_box(&session), "lookup_balance", black_box(&params)))
    });

    c.bench_function("check_duplicate_miss", |b| {
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            let fresh = json!({"account": n.to_string()});
            dispatcher.check_duplicate(black_box(&session), "lookup_balance", black_box(&fresh))
        })
    });
}

criterion_group!(benches, bench_normalize, bench_dedup_check);
criterion_main!(benches);
