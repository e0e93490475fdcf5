use criterion::{criterion_group, criterion_main, Criterion};
use rpc_admission::limiter::{PacingClock, RateWindow};
use rpc_admission::{AcquireContext, AdmissionController, Outcome, RateLimiterConfig, Settings};
use std::hint::black_box;
use std::time::Duration;
use tokio::time::Instant;

fn bench_window_consume(c: &mut Criterion) {
    let window = RateWindow::new();
    let cfg = RateLimiterConfig::new(90, Duration::from_secs(10), 35, Duration::from_millis(105));

    c.bench_function("window_try_consume", |b| {
        b.iter(|| {
            if let Ok(ticket) = window.try_consume(black_box(&cfg), Instant::now()) {
                window.refund(ticket);
            }
        })
    });
}

fn bench_pacing_slot(c: &mut Criterion) {
    let clock = PacingClock::new();
    let spacing = Duration::from_millis(15);

    c.bench_function("pacing_next_slot", |b| {
        b.iter(|| {
            if let Some(slot) = clock.next_slot(black_box(spacing), Instant::now(), None) {
                clock.cancel(slot);
            }
        })
    });
}

fn bench_acquire_release(c: &mut Criterion) {
    // Paused clock: pacing sleeps advance virtual time instead of blocking the bench.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap();

    let mut settings = Settings::default();
    settings.default_pool =
        RateLimiterConfig::new(1_000_000, Duration::from_secs(10), 35, Duration::from_millis(1));
    settings.pacing.request_delay_ms = 1;
    let controller = AdmissionController::from_settings(&settings);
    let ctx = AcquireContext::new();

    c.bench_function("acquire_release_uncontended", |b| {
        b.iter(|| {
            rt.block_on(async {
                let lease = controller.acquire(black_box("solana-rpc"), &ctx).await.unwrap();
                lease.release(Outcome::Success)
            })
        })
    });
}

fn bench_degraded_fail_fast(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();

    let controller = AdmissionController::default();
    for _ in 0..3 {
        controller.report_result("dexscreener", Outcome::RateLimited);
    }
    let ctx = AcquireContext::new();

    c.bench_function("acquire_open_circuit", |b| {
        b.iter(|| rt.block_on(controller.acquire(black_box("dexscreener"), &ctx)).is_err())
    });
}

criterion_group!(
    benches,
    bench_window_consume,
    bench_pacing_slot,
    bench_acquire_release,
    bench_degraded_fail_fast
);
criterion_main!(benches);
