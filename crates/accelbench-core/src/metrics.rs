// Copyright (c) 2025 AccelBench Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The metrics pipeline (C2): tolerant parsing of load-generator output,
//! nearest-rank percentile computation, and merging of scraper samples.

use crate::domain::{BenchmarkMetrics, Percentiles};
use crate::error::{Error, Result};
use crate::scraper::ScraperSummary;
use serde::Deserialize;
use uuid::Uuid;

const BEGIN_MARKER: &str = "ACCELBENCH_JSON_BEGIN";
const END_MARKER: &str = "ACCELBENCH_JSON_END";
const DIAGNOSTIC_WINDOW: usize = 250;

/// One request record from the load generator's JSON payload.
#[derive(Debug, Clone, Deserialize)]
struct RawRequest {
    ttft_ms: Option<f64>,
    e2e_latency_ms: Option<f64>,
    itl_ms: Option<f64>,
    #[allow(dead_code)]
    input_tokens: Option<f64>,
    output_tokens: Option<f64>,
    duration_seconds: Option<f64>,
    success: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawSummary {
    total_duration_seconds: Option<f64>,
    total_requests: Option<i64>,
    successful_requests: Option<i64>,
    failed_requests: Option<i64>,
    throughput_aggregate_tps: Option<f64>,
    requests_per_second: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct LoadgenPayload {
    requests: Vec<RawRequest>,
    #[serde(default)]
    summary: RawSummary,
}

/// Diagnostic context retained when every parse strategy fails: the first
/// and last 250 bytes of the buffer, so a caller can log a truncated dump
/// without holding the whole (possibly enormous) log in memory.
#[derive(Debug, Clone)]
pub struct ParseDiagnostics {
    pub head: Vec<u8>,
    pub tail: Vec<u8>,
}

impl ParseDiagnostics {
    fn capture(buf: &[u8]) -> Self {
        let head_len = buf.len().min(DIAGNOSTIC_WINDOW);
        let tail_len = buf.len().min(DIAGNOSTIC_WINDOW);
        Self {
            head: buf[..head_len].to_vec(),
            tail: buf[buf.len() - tail_len..].to_vec(),
        }
    }
}

/// Locates a sentinel-delimited payload, or the whole buffer, or the first
/// JSON-looking line, tried in order with first success winning.
fn parse_loadgen_payload(buf: &[u8]) -> std::result::Result<LoadgenPayload, ParseDiagnostics> {
    // Strategy 1: sentinel markers.
    if let Some(begin) = find_subslice(buf, BEGIN_MARKER.as_bytes()) {
        let after_begin = begin + BEGIN_MARKER.len();
        if let Some(end_rel) = find_subslice(&buf[after_begin..], END_MARKER.as_bytes()) {
            let candidate = &buf[after_begin..after_begin + end_rel];
            if let Ok(payload) = serde_json::from_slice::<LoadgenPayload>(candidate) {
                return Ok(payload);
            }
        }
    }

    // Strategy 2: the entire buffer.
    if let Ok(payload) = serde_json::from_slice::<LoadgenPayload>(buf) {
        return Ok(payload);
    }

    // Strategy 3: first line starting with `{` that parses with a
    // non-empty request array.
    for line in buf.split(|&b| b == b'\n') {
        let trimmed = trim_ascii_whitespace(line);
        if trimmed.first() != Some(&b'{') {
            continue;
        }
        if let Ok(payload) = serde_json::from_slice::<LoadgenPayload>(trimmed) {
            if !payload.requests.is_empty() {
                return Ok(payload);
            }
        }
    }

    Err(ParseDiagnostics::capture(buf))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn trim_ascii_whitespace(buf: &[u8]) -> &[u8] {
    let start = buf.iter().position(|b| !b.is_ascii_whitespace());
    let end = buf.iter().rposition(|b| !b.is_ascii_whitespace());
    match (start, end) {
        (Some(s), Some(e)) => &buf[s..=e],
        _ => &[],
    }
}

/// Nearest-rank percentile over a pre-sorted slice: `index = ceil(p*n/100) - 1`,
/// clamped to `[0, n-1]`.
fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    let n = sorted.len();
    debug_assert!(n > 0);
    let rank = ((percentile * n as f64) / 100.0).ceil() as i64 - 1;
    let idx = rank.clamp(0, n as i64 - 1) as usize;
    sorted[idx]
}

fn percentiles_of(mut values: Vec<f64>) -> Percentiles {
    if values.is_empty() {
        return Percentiles::default();
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    Percentiles {
        p50: Some(nearest_rank(&values, 50.0)),
        p90: Some(nearest_rank(&values, 90.0)),
        p95: Some(nearest_rank(&values, 95.0)),
        p99: Some(nearest_rank(&values, 99.0)),
    }
}

/// Computes the aggregate `BenchmarkMetrics` for a run from raw
/// load-generator output bytes, merging in scraper samples when present.
///
/// Fails with [`Error::Data`] if no parse strategy yields a payload; the
/// diagnostic head/tail bytes are embedded in the error message (truncated
/// to ASCII-escaped form) per the "first/last 250 bytes" logging
/// requirement.
pub fn compute_metrics(
    run_id: Uuid,
    loadgen_output: &[u8],
    scraper_summary: Option<&ScraperSummary>,
) -> Result<BenchmarkMetrics> {
    let payload = parse_loadgen_payload(loadgen_output).map_err(|diag| {
        Error::data(format!(
            "no valid payload found in loadgen output (head={:?}, tail={:?})",
            String::from_utf8_lossy(&diag.head),
            String::from_utf8_lossy(&diag.tail),
        ))
    })?;

    let successful: Vec<&RawRequest> = payload.requests.iter().filter(|r| r.success).collect();

    let ttft: Vec<f64> = successful.iter().filter_map(|r| r.ttft_ms).collect();
    let e2e: Vec<f64> = successful
        .iter()
        .filter_map(|r| r.e2e_latency_ms)
        .collect();
    let itl: Vec<f64> = successful.iter().filter_map(|r| r.itl_ms).collect();

    let mean_output_tokens = mean(successful.iter().filter_map(|r| r.output_tokens));
    let mean_duration = mean(successful.iter().filter_map(|r| r.duration_seconds));
    let throughput_tokens_per_sec = match (mean_output_tokens, mean_duration) {
        (Some(tokens), Some(duration)) if duration > 0.0 => Some(tokens / duration),
        _ => None,
    };

    let mut metrics = BenchmarkMetrics {
        id: Uuid::new_v4(),
        run_id,
        ttft_ms: percentiles_of(ttft),
        e2e_latency_ms: percentiles_of(e2e),
        itl_ms: percentiles_of(itl),
        throughput_tokens_per_sec,
        throughput_aggregate_tps: payload.summary.throughput_aggregate_tps,
        requests_per_second: payload.summary.requests_per_second,
        total_duration_seconds: payload.summary.total_duration_seconds,
        successful_requests: payload.summary.successful_requests,
        failed_requests: payload.summary.failed_requests,
        accelerator_utilization_pct: None,
        accelerator_utilization_avg_pct: None,
        accelerator_memory_peak_gib: None,
        waiting_requests_max: None,
        created_at: chrono::Utc::now(),
    };

    if let Some(summary) = scraper_summary {
        metrics.accelerator_utilization_pct = summary.peak_utilization_pct;
        metrics.accelerator_utilization_avg_pct = summary.avg_utilization_pct;
        metrics.accelerator_memory_peak_gib = summary.peak_memory_gib;
        metrics.waiting_requests_max = summary.max_waiting_requests;
    }

    Ok(metrics)
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0_f64, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}
