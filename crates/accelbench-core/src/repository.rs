// Copyright (c) 2025 AccelBench Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The repository contract (C4): a strongly typed facade over a relational
//! store. This module defines the port; `accelbench-repository` provides
//! the Postgres-backed implementation.

use crate::domain::{
    BenchmarkMetrics, BenchmarkRun, CatalogEntry, InstanceType, Model, Pricing, RunStatus,
};
use crate::error::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Pagination parameters shared by every listing operation.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Page {
    /// Catalog listings cap at 500 rows regardless of the requested limit.
    pub fn clamp_catalog(self) -> Self {
        Self {
            limit: self.limit.clamp(1, 500),
            offset: self.offset.max(0),
        }
    }
}

/// Filter for `ListRuns`.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    /// Substring match against the model's `hf_id`.
    pub model: Option<String>,
}

/// Sort key for `ListCatalog`. Only these exact strings are accepted from
/// callers; anything else is rejected at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogSortKey {
    Model,
    Instance,
    TtftP50,
    TtftP90,
    TtftP95,
    TtftP99,
    E2eP50,
    E2eP90,
    E2eP95,
    E2eP99,
    ItlP50,
    ItlP90,
    ItlP95,
    ItlP99,
    Throughput,
    RequestsPerSecond,
    AcceleratorUtilization,
    AcceleratorMemory,
    CompletedAt,
}

impl CatalogSortKey {
    pub fn parse(s: &str) -> Option<Self> {
        use CatalogSortKey::*;
        Some(match s {
            "model" => Model,
            "instance" => Instance,
            "ttft_p50" => TtftP50,
            "ttft_p90" => TtftP90,
            "ttft_p95" => TtftP95,
            "ttft_p99" => TtftP99,
            "e2e_p50" => E2eP50,
            "e2e_p90" => E2eP90,
            "e2e_p95" => E2eP95,
            "e2e_p99" => E2eP99,
            "itl_p50" => ItlP50,
            "itl_p90" => ItlP90,
            "itl_p95" => ItlP95,
            "itl_p99" => ItlP99,
            "throughput" => Throughput,
            "rps" => RequestsPerSecond,
            "util" => AcceleratorUtilization,
            "mem" => AcceleratorMemory,
            "completed_at" => CompletedAt,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Filter for `ListCatalog`. The `status=completed AND superseded=false`
/// restriction is implicit and not a field here — callers cannot widen it.
#[derive(Debug, Clone, Default)]
pub struct CatalogFilter {
    pub model_hf_id: Option<String>,
    pub model_family: Option<String>,
    pub instance_family: Option<String>,
    pub accelerator_type: Option<crate::domain::AcceleratorType>,
    pub sort: Option<CatalogSortKey>,
    pub order: SortOrder,
}

impl Default for SortOrder {
    fn default() -> Self {
        SortOrder::Desc
    }
}

/// The repository port. `accelbench-core` depends only on this trait;
/// `accelbench-repository` supplies the concrete `sqlx`-backed adapter.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Upsert on the `(hf_id, hf_revision)` composite key. Never fails on
    /// concurrent creation of the same model.
    async fn ensure_model(&self, hf_id: &str, hf_revision: &str) -> Result<Model>;

    async fn get_model(&self, id: Uuid) -> Result<Option<Model>>;

    /// Seeded read; absent for unknown names.
    async fn get_instance_type_by_name(&self, name: &str) -> Result<Option<InstanceType>>;

    async fn get_instance_type(&self, id: Uuid) -> Result<Option<InstanceType>>;

    /// All seeded instance types, in no particular order. Used by the
    /// pricing refresher to enumerate what it needs to price per region.
    async fn list_instance_types(&self) -> Result<Vec<InstanceType>>;

    /// Inserts with `status=pending`, `created_at=now`; returns the
    /// assigned id.
    async fn create_benchmark_run(
        &self,
        model_id: Uuid,
        instance_type_id: Uuid,
        params: &crate::domain::RunRequest,
    ) -> Result<Uuid>;

    /// Side-sets `started_at`/`completed_at` depending on the target state;
    /// never regresses status (see `RunStatus::can_transition_to`).
    async fn update_run_status(&self, id: Uuid, status: RunStatus) -> Result<()>;

    /// Atomic: INSERT metrics, verify by read-back in the same transaction,
    /// then UPDATE the run to `status=completed` with `completed_at=now`.
    /// Fails and rolls back if the run already has metrics or the
    /// read-back returns the wrong `run_id`.
    async fn persist_metrics(&self, run_id: Uuid, metrics: &BenchmarkMetrics) -> Result<()>;

    async fn get_benchmark_run(&self, id: Uuid) -> Result<Option<BenchmarkRun>>;

    async fn get_metrics_by_run_id(&self, run_id: Uuid) -> Result<Option<BenchmarkMetrics>>;

    /// Sorted by `created_at` descending.
    async fn list_runs(&self, filter: &RunFilter, page: Page) -> Result<Vec<BenchmarkRun>>;

    async fn count_runs(&self, filter: &RunFilter) -> Result<i64>;

    /// Cascade deletes metrics; single transaction.
    async fn delete_run(&self, id: Uuid) -> Result<()>;

    /// The denormalized projection. Implicitly restricted to
    /// `status=completed AND superseded=false`.
    async fn list_catalog(&self, filter: &CatalogFilter, page: Page) -> Result<Vec<CatalogEntry>>;

    async fn count_catalog(&self, filter: &CatalogFilter) -> Result<i64>;

    /// Idempotent on `(instance_type_id, region, effective_date)`.
    async fn upsert_pricing(&self, row: &Pricing) -> Result<()>;

    /// Returns the most-recent-per-instance row in `region`.
    async fn list_pricing(&self, region: &str) -> Result<Vec<Pricing>>;
}
