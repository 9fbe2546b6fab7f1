// Copyright (c) 2025 AccelBench Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Periodic, idempotent pricing refresh (C7).
//!
//! For each configured region: enumerate instance types, quote each one
//! through a [`PricingSource`], and upsert the result. A failed lookup
//! logs and continues; a failed upsert logs and continues. Calls are
//! rate-limited to avoid hammering whatever sits behind the source.

use accelbench_core::domain::{InstanceType, Pricing};
use accelbench_core::repository::Repository;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Gap between successive per-instance-type quote calls.
const RATE_LIMIT: Duration = Duration::from_millis(200);

/// Errors from a pricing source lookup. Distinct from `accelbench_core::Error`
/// because a lookup failure here is recoverable at the refresh-loop level —
/// it never fails the run of another instance type.
#[derive(Debug, thiserror::Error)]
pub enum PricingError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("pricing source returned no quote for {0}")]
    NoQuote(String),

    #[error("malformed pricing response: {0}")]
    Malformed(String),

    #[error("repository error: {0}")]
    Repository(#[from] accelbench_core::Error),
}

/// One quoted price point for an instance type in a region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceQuote {
    pub on_demand_hourly_usd: f64,
    pub reserved_1yr_hourly_usd: Option<f64>,
    pub reserved_3yr_hourly_usd: Option<f64>,
}

/// A source of instance pricing, external to the repository. Implementations
/// talk to whatever vendor pricing API is configured; tests use a canned
/// source instead.
#[async_trait]
pub trait PricingSource: Send + Sync {
    async fn quote(&self, instance_type: &InstanceType, region: &str) -> Result<PriceQuote, PricingError>;
}

/// A deterministic pricing source with no external dependency, derived
/// entirely from an instance type's own accelerator/vCPU/memory shape.
/// Used where no live vendor pricing feed is configured (e.g. self-hosted
/// deployments pricing against a private rate card) and in tests.
pub struct SyntheticPricingSource {
    per_accelerator_hourly_usd: f64,
    per_vcpu_hourly_usd: f64,
    per_memory_gib_hourly_usd: f64,
}

impl Default for SyntheticPricingSource {
    fn default() -> Self {
        Self {
            per_accelerator_hourly_usd: 1.10,
            per_vcpu_hourly_usd: 0.045,
            per_memory_gib_hourly_usd: 0.012,
        }
    }
}

#[async_trait]
impl PricingSource for SyntheticPricingSource {
    async fn quote(&self, instance_type: &InstanceType, _region: &str) -> Result<PriceQuote, PricingError> {
        let on_demand = instance_type.accelerator_count as f64 * self.per_accelerator_hourly_usd
            + instance_type.vcpus as f64 * self.per_vcpu_hourly_usd
            + instance_type.memory_gib * self.per_memory_gib_hourly_usd;

        Ok(PriceQuote {
            on_demand_hourly_usd: on_demand,
            reserved_1yr_hourly_usd: Some(on_demand * 0.65),
            reserved_3yr_hourly_usd: Some(on_demand * 0.45),
        })
    }
}

/// Outcome of one [`PricingRefresher::run_once`] pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshSummary {
    pub region: String,
    pub instance_types_considered: usize,
    pub upserted: usize,
    pub lookup_failures: usize,
    pub upsert_failures: usize,
}

/// Background refresher. Construct once, `spawn` [`PricingRefresher::run_periodically`]
/// as a `tokio::task`, same shape as a typical dispatcher background loop.
pub struct PricingRefresher<R: Repository> {
    repository: Arc<R>,
    source: Arc<dyn PricingSource>,
    regions: Vec<String>,
}

impl<R: Repository> PricingRefresher<R> {
    pub fn new(repository: Arc<R>, source: Arc<dyn PricingSource>, regions: Vec<String>) -> Self {
        Self {
            repository,
            source,
            regions,
        }
    }

    /// One pass over every configured region.
    pub async fn run_once_all_regions(&self) -> Vec<RefreshSummary> {
        let mut summaries = Vec::with_capacity(self.regions.len());
        for region in &self.regions {
            summaries.push(self.run_once(region).await);
        }
        summaries
    }

    /// One pass over a single region: enumerate instance types, quote and
    /// upsert each, rate-limited. Never returns an error — every failure is
    /// logged and folded into the summary so one bad instance type can't
    /// abort the rest of the region.
    pub async fn run_once(&self, region: &str) -> RefreshSummary {
        let mut summary = RefreshSummary {
            region: region.to_string(),
            ..Default::default()
        };

        let instance_types = match self.repository.list_instance_types().await {
            Ok(types) => types,
            Err(e) => {
                tracing::error!("pricing refresh: failed to list instance types: {e}");
                return summary;
            }
        };
        summary.instance_types_considered = instance_types.len();

        let mut first = true;
        for instance_type in &instance_types {
            if !first {
                tokio::time::sleep(RATE_LIMIT).await;
            }
            first = false;

            let quote = match self.source.quote(instance_type, region).await {
                Ok(quote) => quote,
                Err(e) => {
                    tracing::warn!(
                        instance_type = %instance_type.name,
                        region,
                        "pricing lookup failed: {e}"
                    );
                    summary.lookup_failures += 1;
                    continue;
                }
            };

            let row = Pricing {
                id: Uuid::new_v4(),
                instance_type_id: instance_type.id,
                region: region.to_string(),
                effective_date: Utc::now(),
                on_demand_hourly_usd: quote.on_demand_hourly_usd,
                reserved_1yr_hourly_usd: quote.reserved_1yr_hourly_usd,
                reserved_3yr_hourly_usd: quote.reserved_3yr_hourly_usd,
            };

            match self.repository.upsert_pricing(&row).await {
                Ok(()) => summary.upserted += 1,
                Err(e) => {
                    tracing::warn!(
                        instance_type = %instance_type.name,
                        region,
                        "pricing upsert failed: {e}"
                    );
                    summary.upsert_failures += 1;
                }
            }
        }

        summary
    }

    /// Runs `run_once_all_regions` forever, sleeping `interval` between
    /// rounds. Never returns under normal operation; spawn as a background
    /// task from the server binary.
    pub async fn run_periodically(&self, interval: Duration) -> ! {
        tracing::info!(
            regions = ?self.regions,
            interval_secs = interval.as_secs(),
            "pricing refresher started"
        );
        loop {
            for summary in self.run_once_all_regions().await {
                tracing::info!(
                    region = %summary.region,
                    considered = summary.instance_types_considered,
                    upserted = summary.upserted,
                    lookup_failures = summary.lookup_failures,
                    upsert_failures = summary.upsert_failures,
                    "pricing refresh round complete"
                );
            }
            tokio::time::sleep(interval).await;
        }
    }
}
