// Copyright (c) 2025 AccelBench Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! AccelBench's own process metrics, exposed at `GET /metrics`. Separate
//! from the vLLM scraper (C3) — this is observability of the benchmarking
//! service itself, not of the workloads it benchmarks.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
    static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "accelbench_http_requests_total",
            "Total HTTP requests handled, by route and status class"
        ),
        &["route", "status"],
    )
    .expect("metric options are valid");
    static ref ACTIVE_RUNS: IntGauge = IntGauge::new(
        "accelbench_active_runs",
        "Number of benchmark runs currently pending or running"
    )
    .expect("metric options are valid");
    static ref SCRAPER_SAMPLES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "accelbench_scraper_samples_total",
            "Total scraper poll attempts, by outcome"
        ),
        &["outcome"],
    )
    .expect("metric options are valid");
}

/// Registers every collector with the process-wide registry. Call once at
/// startup before serving `/metrics`.
pub fn init() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
            .expect("metric registered exactly once");
        REGISTRY
            .register(Box::new(ACTIVE_RUNS.clone()))
            .expect("metric registered exactly once");
        REGISTRY
            .register(Box::new(SCRAPER_SAMPLES_TOTAL.clone()))
            .expect("metric registered exactly once");
    });
}

pub fn record_http_request(route: &str, status: u16) {
    let status_class = match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    };
    HTTP_REQUESTS_TOTAL.with_label_values(&[route, status_class]).inc();
}

pub fn set_active_runs(count: i64) {
    ACTIVE_RUNS.set(count);
}

pub fn record_scraper_sample(outcome: &str) {
    SCRAPER_SAMPLES_TOTAL.with_label_values(&[outcome]).inc();
}

/// Renders the current registry in Prometheus text exposition format.
pub fn render() -> String {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&metric_families, &mut buffer)
        .expect("text encoding never fails for well-formed metric families");
    String::from_utf8(buffer).expect("prometheus text encoder emits valid utf-8")
}
