// Copyright (c) 2025 AccelBench Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The serving scraper (C3): a background task that polls the model
//! server's Prometheus text endpoint every 5 seconds for the duration of a
//! run and folds the samples into a [`ScraperSummary`].
//!
//! The exposition format is parsed by hand rather than through a full
//! Prometheus client: exactly two metric names are ever consulted, so a
//! tolerant line scanner is simpler and has no opinion about the rest of
//! the exposition (histograms, other processes' metrics, comments).

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Fraction (0.0-1.0) of KV cache blocks in use, the vLLM stand-in for
/// accelerator utilization.
const UTILIZATION_METRIC: &str = "vllm:gpu_cache_usage_perc";
/// Count of requests queued behind the running batch.
const WAITING_METRIC: &str = "vllm:num_requests_waiting";

/// The folded view of every sample collected over a run's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScraperSummary {
    pub peak_utilization_pct: Option<f64>,
    pub avg_utilization_pct: Option<f64>,
    /// Derived, not scraped directly: vLLM's exposition carries no
    /// accelerator-memory gauge, only the KV-cache usage fraction above.
    /// This is that peak ratio multiplied by the instance's total
    /// accelerator memory.
    pub peak_memory_gib: Option<f64>,
    pub max_waiting_requests: Option<i64>,
}

/// One successfully parsed poll. `utilization_ratio` is kept in its raw
/// 0.0-1.0 form (as vLLM exposes it) so it can be converted two ways at
/// aggregation time: ×100 for a percentage, ×total GiB for a memory figure.
#[derive(Debug, Clone, Copy, Default)]
struct Sample {
    utilization_ratio: Option<f64>,
    waiting_requests: Option<i64>,
}

/// Accumulates samples and produces the running summary. Kept separate
/// from the polling loop so it can be unit tested without a network stack.
#[derive(Debug, Default)]
struct Accumulator {
    utilization_sum: f64,
    utilization_count: u64,
    utilization_peak: Option<f64>,
    waiting_peak: Option<i64>,
}

impl Accumulator {
    fn ingest(&mut self, sample: Sample) {
        if let Some(u) = sample.utilization_ratio {
            self.utilization_sum += u;
            self.utilization_count += 1;
            self.utilization_peak = Some(self.utilization_peak.map_or(u, |peak| peak.max(u)));
        }
        if let Some(w) = sample.waiting_requests {
            self.waiting_peak = Some(self.waiting_peak.map_or(w, |peak| peak.max(w)));
        }
    }

    /// `total_memory_gib` converts the peak 0.0-1.0 cache-usage ratio into
    /// a GiB figure; it has no bearing on the percentage fields.
    fn summary(&self, total_memory_gib: f64) -> ScraperSummary {
        ScraperSummary {
            peak_utilization_pct: self.utilization_peak.map(|peak| peak * 100.0),
            avg_utilization_pct: if self.utilization_count > 0 {
                Some(self.utilization_sum / self.utilization_count as f64 * 100.0)
            } else {
                None
            },
            peak_memory_gib: self.utilization_peak.map(|peak| peak * total_memory_gib),
            max_waiting_requests: self.waiting_peak,
        }
    }
}

/// Parses one Prometheus exposition-format payload for the two metric
/// names the scraper cares about, ignoring everything else: comments
/// (`#`), unrelated metric names, and malformed value tokens.
fn parse_sample(body: &str) -> Sample {
    let mut sample = Sample::default();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name_and_labels, value_str)) = line.rsplit_once(' ') else {
            continue;
        };
        let name = name_and_labels
            .split(['{', ' '])
            .next()
            .unwrap_or(name_and_labels);
        let Ok(value) = value_str.trim().parse::<f64>() else {
            continue;
        };
        if name == UTILIZATION_METRIC {
            sample.utilization_ratio = Some(value);
        } else if name == WAITING_METRIC {
            sample.waiting_requests = Some(value as i64);
        }
    }
    sample
}

/// Polls `metrics_url` on a fixed interval until `shutdown` fires,
/// publishing the running [`ScraperSummary`] on `tx` after every poll
/// (successful or not — a failed poll just leaves the summary unchanged).
///
/// Runs as a `tokio::spawn`-ed task owned by the orchestrator; cancelling
/// `shutdown` is the only way this loop exits early.
pub async fn run(
    client: reqwest::Client,
    metrics_url: String,
    total_memory_gib: f64,
    shutdown: CancellationToken,
    tx: watch::Sender<ScraperSummary>,
) {
    let mut accumulator = Accumulator::default();
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // One immediate sample at start, then on the fixed interval.
    match poll_once(&client, &metrics_url).await {
        Ok(sample) => {
            accumulator.ingest(sample);
            let _ = tx.send(accumulator.summary(total_memory_gib));
        }
        Err(err) => {
            tracing::warn!(url = %metrics_url, error = %err, "scrape poll failed, skipping sample");
        }
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!(url = %metrics_url, "scraper loop stopping");
                return;
            }
            _ = ticker.tick() => {
                match poll_once(&client, &metrics_url).await {
                    Ok(sample) => {
                        accumulator.ingest(sample);
                        let _ = tx.send(accumulator.summary(total_memory_gib));
                    }
                    Err(err) => {
                        tracing::warn!(url = %metrics_url, error = %err, "scrape poll failed, skipping sample");
                    }
                }
            }
        }
    }
}

async fn poll_once(client: &reqwest::Client, url: &str) -> Result<Sample, reqwest::Error> {
    let body = client
        .get(url)
        .timeout(REQUEST_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    Ok(parse_sample(&body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_known_metrics() {
        let body = format!(
            "# HELP {u} GPU KV-cache usage over time.\n# TYPE {u} gauge\n{u} 0.735\n{w} 4\n",
            u = UTILIZATION_METRIC,
            w = WAITING_METRIC,
        );
        let sample = parse_sample(&body);
        assert_eq!(sample.utilization_ratio, Some(0.735));
        assert_eq!(sample.waiting_requests, Some(4));
    }

    #[test]
    fn ignores_unrelated_metric_families() {
        let body = format!(
            "python_gc_objects_collected_total 481.0\n{u} 0.1\nhttp_requests_total{{method=\"GET\"}} 99\n",
            u = UTILIZATION_METRIC
        );
        let sample = parse_sample(&body);
        assert_eq!(sample.utilization_ratio, Some(0.1));
        assert_eq!(sample.waiting_requests, None);
    }

    #[test]
    fn tolerates_labeled_series_on_tracked_metrics() {
        let body = format!("{u}{{model_name=\"llama\"}} 0.88\n", u = UTILIZATION_METRIC);
        let sample = parse_sample(&body);
        assert_eq!(sample.utilization_ratio, Some(0.88));
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let body = "garbage line with no value\nalso=garbage\n";
        let sample = parse_sample(body);
        assert_eq!(sample.utilization_ratio, None);
        assert_eq!(sample.waiting_requests, None);
    }

    #[test]
    fn accumulator_tracks_peak_and_average_separately() {
        let mut acc = Accumulator::default();
        acc.ingest(Sample {
            utilization_ratio: Some(0.50),
            waiting_requests: Some(1),
        });
        acc.ingest(Sample {
            utilization_ratio: Some(0.90),
            waiting_requests: Some(5),
        });
        acc.ingest(Sample {
            utilization_ratio: Some(0.70),
            waiting_requests: Some(2),
        });
        let summary = acc.summary(80.0);
        assert_eq!(summary.peak_utilization_pct, Some(90.0));
        assert_eq!(summary.avg_utilization_pct, Some(70.0));
        assert_eq!(summary.max_waiting_requests, Some(5));
        assert_eq!(summary.peak_memory_gib, Some(72.0));
    }

    #[test]
    fn accumulator_with_no_samples_summarizes_to_all_none() {
        let acc = Accumulator::default();
        assert_eq!(acc.summary(80.0), ScraperSummary::default());
    }

    #[tokio::test]
    async fn poll_once_parses_a_live_http_response() {
        let mut server = mockito::Server::new_async().await;
        let body = format!("{u} 0.42\n{w} 7\n", u = UTILIZATION_METRIC, w = WAITING_METRIC);
        let mock = server
            .mock("GET", "/metrics")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/metrics", server.url());
        let sample = poll_once(&client, &url).await.expect("poll should succeed");

        mock.assert_async().await;
        assert_eq!(sample.utilization_ratio, Some(0.42));
        assert_eq!(sample.waiting_requests, Some(7));
    }

    #[tokio::test]
    async fn poll_once_surfaces_non_2xx_responses_as_errors() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/metrics").with_status(503).create_async().await;

        let client = reqwest::Client::new();
        let url = format!("{}/metrics", server.url());
        assert!(poll_once(&client, &url).await.is_err());
    }
}
