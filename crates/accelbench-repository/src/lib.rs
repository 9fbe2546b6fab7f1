// Copyright (c) 2025 AccelBench Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `SqlRepository`: the `sqlx`-backed implementation of
//! `accelbench_core::repository::Repository`.
//!
//! Built on `sqlx::Any` rather than a Postgres-specific pool so the same
//! queries run against a live Postgres database in production and an
//! in-memory SQLite pool in tests. Every id and timestamp column is
//! therefore stored as `TEXT` (UUID/RFC3339 strings) — the lowest common
//! type both backends agree on.

use accelbench_core::domain::{
    AcceleratorType, BenchmarkMetrics, BenchmarkRun, CatalogEntry, Framework, InstanceType, Model,
    Percentiles, Pricing, RunRequest, RunStatus, RunType,
};
use accelbench_core::error::{Error, Result};
use accelbench_core::repository::{CatalogFilter, CatalogSortKey, Page, Repository, RunFilter, SortOrder};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::any::{Any, AnyPool, AnyPoolOptions, AnyRow};
use sqlx::{QueryBuilder, Row};
use uuid::Uuid;

/// The `sqlx::Any`-backed repository. Construct with [`SqlRepository::connect`]
/// and run [`SqlRepository::migrate`] once before serving traffic.
#[derive(Clone)]
pub struct SqlRepository {
    pool: AnyPool,
}

impl SqlRepository {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// For tests: an in-memory SQLite pool, migrated and ready to use.
    pub async fn connect_in_memory() -> anyhow::Result<Self> {
        let repo = Self::connect("sqlite::memory:").await?;
        repo.migrate().await?;
        Ok(repo)
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::data(format!("malformed timestamp {s:?}: {e}")))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::data(format!("malformed uuid {s:?}: {e}")))
}

fn model_from_row(row: &AnyRow) -> Result<Model> {
    Ok(Model {
        id: parse_uuid(row.try_get("id").map_err(sqlx_err)?)?,
        hf_id: row.try_get("hf_id").map_err(sqlx_err)?,
        hf_revision: row.try_get("hf_revision").map_err(sqlx_err)?,
        family: row.try_get("family").map_err(sqlx_err)?,
        parameter_count: row.try_get("parameter_count").map_err(sqlx_err)?,
        created_at: parse_timestamp(row.try_get::<&str, _>("created_at").map_err(sqlx_err)?)?,
    })
}

fn instance_type_from_row(row: &AnyRow) -> Result<InstanceType> {
    let accelerator_type: String = row.try_get("accelerator_type").map_err(sqlx_err)?;
    Ok(InstanceType {
        id: parse_uuid(row.try_get("id").map_err(sqlx_err)?)?,
        name: row.try_get("name").map_err(sqlx_err)?,
        family: row.try_get("family").map_err(sqlx_err)?,
        accelerator_type: AcceleratorType::parse(&accelerator_type)
            .ok_or_else(|| Error::data(format!("unknown accelerator_type {accelerator_type:?}")))?,
        accelerator_name: row.try_get("accelerator_name").map_err(sqlx_err)?,
        accelerator_count: row.try_get("accelerator_count").map_err(sqlx_err)?,
        accelerator_memory_gib: row.try_get("accelerator_memory_gib").map_err(sqlx_err)?,
        vcpus: row.try_get("vcpus").map_err(sqlx_err)?,
        memory_gib: row.try_get("memory_gib").map_err(sqlx_err)?,
    })
}

fn run_from_row(row: &AnyRow) -> Result<BenchmarkRun> {
    let framework: String = row.try_get("framework").map_err(sqlx_err)?;
    let run_type: String = row.try_get("run_type").map_err(sqlx_err)?;
    let status: String = row.try_get("status").map_err(sqlx_err)?;
    let started_at: Option<String> = row.try_get("started_at").map_err(sqlx_err)?;
    let completed_at: Option<String> = row.try_get("completed_at").map_err(sqlx_err)?;

    Ok(BenchmarkRun {
        id: parse_uuid(row.try_get("id").map_err(sqlx_err)?)?,
        model_id: parse_uuid(row.try_get("model_id").map_err(sqlx_err)?)?,
        instance_type_id: parse_uuid(row.try_get("instance_type_id").map_err(sqlx_err)?)?,
        framework: Framework::parse(&framework)
            .ok_or_else(|| Error::data(format!("unknown framework {framework:?}")))?,
        framework_version: row.try_get("framework_version").map_err(sqlx_err)?,
        tensor_parallel_degree: row.try_get("tensor_parallel_degree").map_err(sqlx_err)?,
        quantization: row.try_get("quantization").map_err(sqlx_err)?,
        concurrency: row.try_get("concurrency").map_err(sqlx_err)?,
        input_sequence_length: row.try_get("input_sequence_length").map_err(sqlx_err)?,
        output_sequence_length: row.try_get("output_sequence_length").map_err(sqlx_err)?,
        dataset_name: row.try_get("dataset_name").map_err(sqlx_err)?,
        run_type: RunType::parse(&run_type)
            .ok_or_else(|| Error::data(format!("unknown run_type {run_type:?}")))?,
        status: RunStatus::parse(&status)
            .ok_or_else(|| Error::data(format!("unknown status {status:?}")))?,
        superseded: row.try_get::<i64, _>("superseded").map_err(sqlx_err)? != 0,
        created_at: parse_timestamp(row.try_get::<&str, _>("created_at").map_err(sqlx_err)?)?,
        started_at: started_at.map(|s| parse_timestamp(&s)).transpose()?,
        completed_at: completed_at.map(|s| parse_timestamp(&s)).transpose()?,
    })
}

fn metrics_from_row(row: &AnyRow) -> Result<BenchmarkMetrics> {
    Ok(BenchmarkMetrics {
        id: parse_uuid(row.try_get("id").map_err(sqlx_err)?)?,
        run_id: parse_uuid(row.try_get("run_id").map_err(sqlx_err)?)?,
        ttft_ms: Percentiles {
            p50: row.try_get("ttft_p50").map_err(sqlx_err)?,
            p90: row.try_get("ttft_p90").map_err(sqlx_err)?,
            p95: row.try_get("ttft_p95").map_err(sqlx_err)?,
            p99: row.try_get("ttft_p99").map_err(sqlx_err)?,
        },
        e2e_latency_ms: Percentiles {
            p50: row.try_get("e2e_p50").map_err(sqlx_err)?,
            p90: row.try_get("e2e_p90").map_err(sqlx_err)?,
            p95: row.try_get("e2e_p95").map_err(sqlx_err)?,
            p99: row.try_get("e2e_p99").map_err(sqlx_err)?,
        },
        itl_ms: Percentiles {
            p50: row.try_get("itl_p50").map_err(sqlx_err)?,
            p90: row.try_get("itl_p90").map_err(sqlx_err)?,
            p95: row.try_get("itl_p95").map_err(sqlx_err)?,
            p99: row.try_get("itl_p99").map_err(sqlx_err)?,
        },
        throughput_tokens_per_sec: row.try_get("throughput_tokens_per_sec").map_err(sqlx_err)?,
        throughput_aggregate_tps: row.try_get("throughput_aggregate_tps").map_err(sqlx_err)?,
        requests_per_second: row.try_get("requests_per_second").map_err(sqlx_err)?,
        total_duration_seconds: row.try_get("total_duration_seconds").map_err(sqlx_err)?,
        successful_requests: row.try_get("successful_requests").map_err(sqlx_err)?,
        failed_requests: row.try_get("failed_requests").map_err(sqlx_err)?,
        accelerator_utilization_pct: row.try_get("accelerator_utilization_pct").map_err(sqlx_err)?,
        accelerator_utilization_avg_pct: row
            .try_get("accelerator_utilization_avg_pct")
            .map_err(sqlx_err)?,
        accelerator_memory_peak_gib: row.try_get("accelerator_memory_peak_gib").map_err(sqlx_err)?,
        waiting_requests_max: row.try_get("waiting_requests_max").map_err(sqlx_err)?,
        created_at: parse_timestamp(row.try_get::<&str, _>("created_at").map_err(sqlx_err)?)?,
    })
}

fn pricing_from_row(row: &AnyRow) -> Result<Pricing> {
    Ok(Pricing {
        id: parse_uuid(row.try_get("id").map_err(sqlx_err)?)?,
        instance_type_id: parse_uuid(row.try_get("instance_type_id").map_err(sqlx_err)?)?,
        region: row.try_get("region").map_err(sqlx_err)?,
        effective_date: parse_timestamp(row.try_get::<&str, _>("effective_date").map_err(sqlx_err)?)?,
        on_demand_hourly_usd: row.try_get("on_demand_hourly_usd").map_err(sqlx_err)?,
        reserved_1yr_hourly_usd: row.try_get("reserved_1yr_hourly_usd").map_err(sqlx_err)?,
        reserved_3yr_hourly_usd: row.try_get("reserved_3yr_hourly_usd").map_err(sqlx_err)?,
    })
}

fn sqlx_err(err: sqlx::Error) -> Error {
    Error::infrastructure(format!("sql error: {err}"))
}

fn catalog_sort_column(key: CatalogSortKey) -> &'static str {
    use CatalogSortKey::*;
    match key {
        Model => "m.hf_id",
        Instance => "it.name",
        TtftP50 => "bm.ttft_p50",
        TtftP90 => "bm.ttft_p90",
        TtftP95 => "bm.ttft_p95",
        TtftP99 => "bm.ttft_p99",
        E2eP50 => "bm.e2e_p50",
        E2eP90 => "bm.e2e_p90",
        E2eP95 => "bm.e2e_p95",
        E2eP99 => "bm.e2e_p99",
        ItlP50 => "bm.itl_p50",
        ItlP90 => "bm.itl_p90",
        ItlP95 => "bm.itl_p95",
        ItlP99 => "bm.itl_p99",
        Throughput => "bm.throughput_tokens_per_sec",
        RequestsPerSecond => "bm.requests_per_second",
        AcceleratorUtilization => "bm.accelerator_utilization_pct",
        AcceleratorMemory => "bm.accelerator_memory_peak_gib",
        CompletedAt => "br.completed_at",
    }
}

#[async_trait]
impl Repository for SqlRepository {
    async fn ensure_model(&self, hf_id: &str, hf_revision: &str) -> Result<Model> {
        if let Some(row) = sqlx::query("SELECT * FROM models WHERE hf_id = ? AND hf_revision = ?")
            .bind(hf_id)
            .bind(hf_revision)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?
        {
            return model_from_row(&row);
        }

        let id = Uuid::new_v4();
        let created_at = now_rfc3339();
        let inserted = sqlx::query(
            "INSERT INTO models (id, hf_id, hf_revision, family, parameter_count, created_at) \
             VALUES (?, ?, ?, NULL, NULL, ?)",
        )
        .bind(id.to_string())
        .bind(hf_id)
        .bind(hf_revision)
        .bind(&created_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(Model {
                id,
                hf_id: hf_id.to_string(),
                hf_revision: hf_revision.to_string(),
                family: None,
                parameter_count: None,
                created_at: parse_timestamp(&created_at)?,
            }),
            // A concurrent insert of the same (hf_id, hf_revision) lost the
            // race; the winner's row is now there to read back.
            Err(_) => {
                let row = sqlx::query("SELECT * FROM models WHERE hf_id = ? AND hf_revision = ?")
                    .bind(hf_id)
                    .bind(hf_revision)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(sqlx_err)?;
                model_from_row(&row)
            }
        }
    }

    async fn get_model(&self, id: Uuid) -> Result<Option<Model>> {
        let row = sqlx::query("SELECT * FROM models WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;
        row.as_ref().map(model_from_row).transpose()
    }

    async fn get_instance_type_by_name(&self, name: &str) -> Result<Option<InstanceType>> {
        let row = sqlx::query("SELECT * FROM instance_types WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;
        row.as_ref().map(instance_type_from_row).transpose()
    }

    async fn get_instance_type(&self, id: Uuid) -> Result<Option<InstanceType>> {
        let row = sqlx::query("SELECT * FROM instance_types WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;
        row.as_ref().map(instance_type_from_row).transpose()
    }

    async fn list_instance_types(&self) -> Result<Vec<InstanceType>> {
        let rows = sqlx::query("SELECT * FROM instance_types")
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_err)?;
        rows.iter().map(instance_type_from_row).collect()
    }

    async fn create_benchmark_run(
        &self,
        model_id: Uuid,
        instance_type_id: Uuid,
        params: &RunRequest,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let created_at = now_rfc3339();
        sqlx::query(
            "INSERT INTO benchmark_runs (
                id, model_id, instance_type_id, framework, framework_version,
                tensor_parallel_degree, quantization, concurrency,
                input_sequence_length, output_sequence_length, dataset_name,
                run_type, status, superseded, created_at, started_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?, NULL, NULL)",
        )
        .bind(id.to_string())
        .bind(model_id.to_string())
        .bind(instance_type_id.to_string())
        .bind(params.framework.as_str())
        .bind(&params.framework_version)
        .bind(params.tensor_parallel_degree)
        .bind(&params.quantization)
        .bind(params.concurrency)
        .bind(params.input_sequence_length)
        .bind(params.output_sequence_length)
        .bind(&params.dataset_name)
        .bind(params.run_type.as_str())
        .bind(&created_at)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(id)
    }

    async fn update_run_status(&self, id: Uuid, status: RunStatus) -> Result<()> {
        let current = self
            .get_benchmark_run(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("benchmark run {id}")))?;

        if !current.status.can_transition_to(status) {
            return Err(Error::conflict(format!(
                "cannot transition run {id} from {} to {}",
                current.status.as_str(),
                status.as_str()
            )));
        }

        let now = now_rfc3339();
        let (started_clause, completed_clause) = match status {
            RunStatus::Running => (Some(now.clone()), None),
            RunStatus::Completed | RunStatus::Failed => (None, Some(now.clone())),
            RunStatus::Pending => (None, None),
        };

        sqlx::query(
            "UPDATE benchmark_runs SET status = ?, \
             started_at = COALESCE(?, started_at), \
             completed_at = COALESCE(?, completed_at) \
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(started_clause)
        .bind(completed_clause)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(())
    }

    async fn persist_metrics(&self, run_id: Uuid, metrics: &BenchmarkMetrics) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(sqlx_err)?;

        let run_row = sqlx::query("SELECT * FROM benchmark_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(sqlx_err)?
            .ok_or_else(|| Error::not_found(format!("benchmark run {run_id}")))?;
        let run = run_from_row(&run_row)?;
        if run.status != RunStatus::Running {
            return Err(Error::conflict(format!(
                "run {run_id} is not running (status={})",
                run.status.as_str()
            )));
        }

        let existing = sqlx::query("SELECT id FROM benchmark_metrics WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(sqlx_err)?;
        if existing.is_some() {
            return Err(Error::conflict(format!(
                "metrics already persisted for run {run_id}"
            )));
        }

        let metrics_id = metrics.id.to_string();
        let created_at = metrics.created_at.to_rfc3339();
        let insert_result = sqlx::query(
            "INSERT INTO benchmark_metrics (
                id, run_id, ttft_p50, ttft_p90, ttft_p95, ttft_p99,
                e2e_p50, e2e_p90, e2e_p95, e2e_p99,
                itl_p50, itl_p90, itl_p95, itl_p99,
                throughput_tokens_per_sec, throughput_aggregate_tps, requests_per_second,
                total_duration_seconds, successful_requests, failed_requests,
                accelerator_utilization_pct, accelerator_utilization_avg_pct,
                accelerator_memory_peak_gib, waiting_requests_max, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&metrics_id)
        .bind(run_id.to_string())
        .bind(metrics.ttft_ms.p50)
        .bind(metrics.ttft_ms.p90)
        .bind(metrics.ttft_ms.p95)
        .bind(metrics.ttft_ms.p99)
        .bind(metrics.e2e_latency_ms.p50)
        .bind(metrics.e2e_latency_ms.p90)
        .bind(metrics.e2e_latency_ms.p95)
        .bind(metrics.e2e_latency_ms.p99)
        .bind(metrics.itl_ms.p50)
        .bind(metrics.itl_ms.p90)
        .bind(metrics.itl_ms.p95)
        .bind(metrics.itl_ms.p99)
        .bind(metrics.throughput_tokens_per_sec)
        .bind(metrics.throughput_aggregate_tps)
        .bind(metrics.requests_per_second)
        .bind(metrics.total_duration_seconds)
        .bind(metrics.successful_requests)
        .bind(metrics.failed_requests)
        .bind(metrics.accelerator_utilization_pct)
        .bind(metrics.accelerator_utilization_avg_pct)
        .bind(metrics.accelerator_memory_peak_gib)
        .bind(metrics.waiting_requests_max)
        .bind(&created_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = insert_result {
            tx.rollback().await.ok();
            return Err(Error::FatalPersist {
                reason: e.to_string(),
                discarded_bytes: serde_json::to_vec(metrics).map(|v| v.len()).unwrap_or(0),
            });
        }

        let verify_row = sqlx::query("SELECT run_id FROM benchmark_metrics WHERE id = ?")
            .bind(&metrics_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(sqlx_err)?;
        let verified_run_id: Option<String> = verify_row.map(|r| r.try_get("run_id")).transpose().map_err(sqlx_err)?;
        if verified_run_id.as_deref() != Some(run_id.to_string().as_str()) {
            tx.rollback().await.ok();
            return Err(Error::FatalPersist {
                reason: "read-back run_id mismatch after metrics insert".to_string(),
                discarded_bytes: serde_json::to_vec(metrics).map(|v| v.len()).unwrap_or(0),
            });
        }

        let now = now_rfc3339();
        sqlx::query("UPDATE benchmark_runs SET status = 'completed', completed_at = ? WHERE id = ?")
            .bind(&now)
            .bind(run_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(sqlx_err)?;

        tx.commit().await.map_err(sqlx_err)?;
        Ok(())
    }

    async fn get_benchmark_run(&self, id: Uuid) -> Result<Option<BenchmarkRun>> {
        let row = sqlx::query("SELECT * FROM benchmark_runs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn get_metrics_by_run_id(&self, run_id: Uuid) -> Result<Option<BenchmarkMetrics>> {
        let row = sqlx::query("SELECT * FROM benchmark_metrics WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;
        row.as_ref().map(metrics_from_row).transpose()
    }

    async fn list_runs(&self, filter: &RunFilter, page: Page) -> Result<Vec<BenchmarkRun>> {
        let mut qb = QueryBuilder::new(
            "SELECT br.* FROM benchmark_runs br JOIN models m ON m.id = br.model_id WHERE 1 = 1",
        );
        if let Some(status) = filter.status {
            qb.push(" AND br.status = ").push_bind(status.as_str().to_string());
        }
        if let Some(model) = &filter.model {
            qb.push(" AND m.hf_id LIKE ").push_bind(format!("%{model}%"));
        }
        qb.push(" ORDER BY br.created_at DESC LIMIT ")
            .push_bind(page.limit)
            .push(" OFFSET ")
            .push_bind(page.offset);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(sqlx_err)?;
        rows.iter().map(run_from_row).collect()
    }

    async fn count_runs(&self, filter: &RunFilter) -> Result<i64> {
        let mut qb = QueryBuilder::new(
            "SELECT COUNT(*) AS total FROM benchmark_runs br JOIN models m ON m.id = br.model_id WHERE 1 = 1",
        );
        if let Some(status) = filter.status {
            qb.push(" AND br.status = ").push_bind(status.as_str().to_string());
        }
        if let Some(model) = &filter.model {
            qb.push(" AND m.hf_id LIKE ").push_bind(format!("%{model}%"));
        }
        let row = qb.build().fetch_one(&self.pool).await.map_err(sqlx_err)?;
        row.try_get("total").map_err(sqlx_err)
    }

    async fn delete_run(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(sqlx_err)?;
        sqlx::query("DELETE FROM benchmark_metrics WHERE run_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(sqlx_err)?;
        sqlx::query("DELETE FROM benchmark_runs WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(sqlx_err)?;
        tx.commit().await.map_err(sqlx_err)?;
        Ok(())
    }

    async fn list_catalog(&self, filter: &CatalogFilter, page: Page) -> Result<Vec<CatalogEntry>> {
        let page = page.clamp_catalog();
        let mut qb = QueryBuilder::new(
            "SELECT br.id AS run_id, m.hf_id AS model_hf_id, m.family AS model_family, \
             it.name AS instance_type_name, it.family AS instance_family, \
             it.accelerator_type AS accelerator_type, br.framework AS framework, \
             br.tensor_parallel_degree AS tensor_parallel_degree, br.concurrency AS concurrency, \
             br.run_type AS run_type, br.completed_at AS completed_at, \
             bm.id AS metrics_id, bm.ttft_p50, bm.ttft_p90, bm.ttft_p95, bm.ttft_p99, \
             bm.e2e_p50, bm.e2e_p90, bm.e2e_p95, bm.e2e_p99, \
             bm.itl_p50, bm.itl_p90, bm.itl_p95, bm.itl_p99, \
             bm.throughput_tokens_per_sec, bm.throughput_aggregate_tps, bm.requests_per_second, \
             bm.total_duration_seconds, bm.successful_requests, bm.failed_requests, \
             bm.accelerator_utilization_pct, bm.accelerator_utilization_avg_pct, \
             bm.accelerator_memory_peak_gib, bm.waiting_requests_max, bm.created_at AS metrics_created_at \
             FROM benchmark_runs br \
             JOIN models m ON m.id = br.model_id \
             JOIN instance_types it ON it.id = br.instance_type_id \
             JOIN benchmark_metrics bm ON bm.run_id = br.id \
             WHERE br.status = 'completed' AND br.superseded = 0",
        );
        push_catalog_filters(&mut qb, filter);

        let order = if filter.order == SortOrder::Asc { "ASC" } else { "DESC" };
        let sort_column = filter
            .sort
            .map(catalog_sort_column)
            .unwrap_or("br.completed_at");
        // `({sort_column} IS NULL)` evaluates to 0/1 on both Postgres and
        // SQLite, sorting absent metrics (empty successful-request sets)
        // after present ones regardless of ASC/DESC on the column itself.
        qb.push(format!(" ORDER BY ({sort_column} IS NULL), {sort_column} {order}"));
        qb.push(" LIMIT ").push_bind(page.limit).push(" OFFSET ").push_bind(page.offset);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(sqlx_err)?;
        rows.iter().map(catalog_entry_from_row).collect()
    }

    async fn count_catalog(&self, filter: &CatalogFilter) -> Result<i64> {
        let mut qb = QueryBuilder::new(
            "SELECT COUNT(*) AS total FROM benchmark_runs br \
             JOIN models m ON m.id = br.model_id \
             JOIN instance_types it ON it.id = br.instance_type_id \
             JOIN benchmark_metrics bm ON bm.run_id = br.id \
             WHERE br.status = 'completed' AND br.superseded = 0",
        );
        push_catalog_filters(&mut qb, filter);
        let row = qb.build().fetch_one(&self.pool).await.map_err(sqlx_err)?;
        row.try_get("total").map_err(sqlx_err)
    }

    async fn upsert_pricing(&self, row: &Pricing) -> Result<()> {
        let existing = sqlx::query(
            "SELECT id FROM pricing WHERE instance_type_id = ? AND region = ? AND effective_date = ?",
        )
        .bind(row.instance_type_id.to_string())
        .bind(&row.region)
        .bind(row.effective_date.to_rfc3339())
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_err)?;

        if let Some(existing) = existing {
            let id: String = existing.try_get("id").map_err(sqlx_err)?;
            sqlx::query(
                "UPDATE pricing SET on_demand_hourly_usd = ?, reserved_1yr_hourly_usd = ?, \
                 reserved_3yr_hourly_usd = ? WHERE id = ?",
            )
            .bind(row.on_demand_hourly_usd)
            .bind(row.reserved_1yr_hourly_usd)
            .bind(row.reserved_3yr_hourly_usd)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
            return Ok(());
        }

        sqlx::query(
            "INSERT INTO pricing (
                id, instance_type_id, region, effective_date,
                on_demand_hourly_usd, reserved_1yr_hourly_usd, reserved_3yr_hourly_usd
            ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(row.id.to_string())
        .bind(row.instance_type_id.to_string())
        .bind(&row.region)
        .bind(row.effective_date.to_rfc3339())
        .bind(row.on_demand_hourly_usd)
        .bind(row.reserved_1yr_hourly_usd)
        .bind(row.reserved_3yr_hourly_usd)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(())
    }

    async fn list_pricing(&self, region: &str) -> Result<Vec<Pricing>> {
        let rows = sqlx::query(
            "SELECT p.* FROM pricing p \
             INNER JOIN (
                SELECT instance_type_id, MAX(effective_date) AS latest_date \
                FROM pricing WHERE region = ? GROUP BY instance_type_id
             ) latest ON p.instance_type_id = latest.instance_type_id \
                      AND p.effective_date = latest.latest_date \
             WHERE p.region = ?",
        )
        .bind(region)
        .bind(region)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_err)?;
        rows.iter().map(pricing_from_row).collect()
    }
}

fn push_catalog_filters(qb: &mut QueryBuilder<'_, Any>, filter: &CatalogFilter) {
    if let Some(hf_id) = &filter.model_hf_id {
        qb.push(" AND m.hf_id = ").push_bind(hf_id.clone());
    }
    if let Some(family) = &filter.model_family {
        qb.push(" AND m.family = ").push_bind(family.clone());
    }
    if let Some(family) = &filter.instance_family {
        qb.push(" AND it.family = ").push_bind(family.clone());
    }
    if let Some(accel) = filter.accelerator_type {
        qb.push(" AND it.accelerator_type = ")
            .push_bind(accel.as_str().to_string());
    }
}

fn catalog_entry_from_row(row: &AnyRow) -> Result<CatalogEntry> {
    let accelerator_type: String = row.try_get("accelerator_type").map_err(sqlx_err)?;
    let framework: String = row.try_get("framework").map_err(sqlx_err)?;
    let run_type: String = row.try_get("run_type").map_err(sqlx_err)?;
    let completed_at: Option<String> = row.try_get("completed_at").map_err(sqlx_err)?;
    let run_id = parse_uuid(row.try_get("run_id").map_err(sqlx_err)?)?;

    let metrics = BenchmarkMetrics {
        id: parse_uuid(row.try_get("metrics_id").map_err(sqlx_err)?)?,
        run_id,
        ttft_ms: Percentiles {
            p50: row.try_get("ttft_p50").map_err(sqlx_err)?,
            p90: row.try_get("ttft_p90").map_err(sqlx_err)?,
            p95: row.try_get("ttft_p95").map_err(sqlx_err)?,
            p99: row.try_get("ttft_p99").map_err(sqlx_err)?,
        },
        e2e_latency_ms: Percentiles {
            p50: row.try_get("e2e_p50").map_err(sqlx_err)?,
            p90: row.try_get("e2e_p90").map_err(sqlx_err)?,
            p95: row.try_get("e2e_p95").map_err(sqlx_err)?,
            p99: row.try_get("e2e_p99").map_err(sqlx_err)?,
        },
        itl_ms: Percentiles {
            p50: row.try_get("itl_p50").map_err(sqlx_err)?,
            p90: row.try_get("itl_p90").map_err(sqlx_err)?,
            p95: row.try_get("itl_p95").map_err(sqlx_err)?,
            p99: row.try_get("itl_p99").map_err(sqlx_err)?,
        },
        throughput_tokens_per_sec: row.try_get("throughput_tokens_per_sec").map_err(sqlx_err)?,
        throughput_aggregate_tps: row.try_get("throughput_aggregate_tps").map_err(sqlx_err)?,
        requests_per_second: row.try_get("requests_per_second").map_err(sqlx_err)?,
        total_duration_seconds: row.try_get("total_duration_seconds").map_err(sqlx_err)?,
        successful_requests: row.try_get("successful_requests").map_err(sqlx_err)?,
        failed_requests: row.try_get("failed_requests").map_err(sqlx_err)?,
        accelerator_utilization_pct: row.try_get("accelerator_utilization_pct").map_err(sqlx_err)?,
        accelerator_utilization_avg_pct: row
            .try_get("accelerator_utilization_avg_pct")
            .map_err(sqlx_err)?,
        accelerator_memory_peak_gib: row.try_get("accelerator_memory_peak_gib").map_err(sqlx_err)?,
        waiting_requests_max: row.try_get("waiting_requests_max").map_err(sqlx_err)?,
        created_at: parse_timestamp(
            row.try_get::<&str, _>("metrics_created_at").map_err(sqlx_err)?,
        )?,
    };

    Ok(CatalogEntry {
        run_id,
        model_hf_id: row.try_get("model_hf_id").map_err(sqlx_err)?,
        model_family: row.try_get("model_family").map_err(sqlx_err)?,
        instance_type_name: row.try_get("instance_type_name").map_err(sqlx_err)?,
        instance_family: row.try_get("instance_family").map_err(sqlx_err)?,
        accelerator_type: AcceleratorType::parse(&accelerator_type)
            .ok_or_else(|| Error::data(format!("unknown accelerator_type {accelerator_type:?}")))?,
        framework: Framework::parse(&framework)
            .ok_or_else(|| Error::data(format!("unknown framework {framework:?}")))?,
        tensor_parallel_degree: row.try_get("tensor_parallel_degree").map_err(sqlx_err)?,
        concurrency: row.try_get("concurrency").map_err(sqlx_err)?,
        run_type: RunType::parse(&run_type)
            .ok_or_else(|| Error::data(format!("unknown run_type {run_type:?}")))?,
        metrics,
        completed_at: completed_at.map(|s| parse_timestamp(&s)).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use accelbench_core::domain::Framework;

    async fn seed_instance_type(repo: &SqlRepository, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO instance_types (
                id, name, family, accelerator_type, accelerator_name,
                accelerator_count, accelerator_memory_gib, vcpus, memory_gib
            ) VALUES (?, ?, 'g5', 'gpu', 'A10G', 1, 24.0, 4, 16.0)",
        )
        .bind(id.to_string())
        .bind(name)
        .execute(repo.pool())
        .await
        .unwrap();
        id
    }

    fn sample_request() -> RunRequest {
        RunRequest {
            hf_id: "meta-llama/Llama-3.1-8B".to_string(),
            hf_revision: "main".to_string(),
            instance_type_name: "g5.xlarge".to_string(),
            framework: Framework::Vllm,
            framework_version: "0.6.3".to_string(),
            tensor_parallel_degree: 1,
            quantization: None,
            concurrency: 16,
            input_sequence_length: 512,
            output_sequence_length: 256,
            dataset_name: "sharegpt".to_string(),
            run_type: RunType::OnDemand,
            extra_env: Default::default(),
        }
    }

    fn sample_metrics(run_id: Uuid) -> BenchmarkMetrics {
        BenchmarkMetrics {
            id: Uuid::new_v4(),
            run_id,
            ttft_ms: Percentiles {
                p50: Some(10.0),
                p90: Some(20.0),
                p95: Some(25.0),
                p99: Some(30.0),
            },
            e2e_latency_ms: Percentiles::default(),
            itl_ms: Percentiles::default(),
            throughput_tokens_per_sec: Some(120.0),
            throughput_aggregate_tps: Some(120.0),
            requests_per_second: Some(1.2),
            total_duration_seconds: Some(10.0),
            successful_requests: Some(12),
            failed_requests: Some(0),
            accelerator_utilization_pct: Some(80.0),
            accelerator_utilization_avg_pct: Some(60.0),
            accelerator_memory_peak_gib: Some(18.0),
            waiting_requests_max: Some(2),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn ensure_model_is_idempotent_on_hf_id_and_revision() {
        let repo = SqlRepository::connect_in_memory().await.unwrap();
        let a = repo.ensure_model("org/model", "main").await.unwrap();
        let b = repo.ensure_model("org/model", "main").await.unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn run_lifecycle_persists_metrics_and_completes() {
        let repo = SqlRepository::connect_in_memory().await.unwrap();
        let model = repo.ensure_model("org/model", "main").await.unwrap();
        let instance_type_id = seed_instance_type(&repo, "g5.xlarge").await;

        let run_id = repo
            .create_benchmark_run(model.id, instance_type_id, &sample_request())
            .await
            .unwrap();

        let run = repo.get_benchmark_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Pending);

        repo.update_run_status(run_id, RunStatus::Running).await.unwrap();
        repo.persist_metrics(run_id, &sample_metrics(run_id)).await.unwrap();

        let run = repo.get_benchmark_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());

        let metrics = repo.get_metrics_by_run_id(run_id).await.unwrap().unwrap();
        assert_eq!(metrics.ttft_ms.p50, Some(10.0));
    }

    #[tokio::test]
    async fn persist_metrics_twice_is_a_conflict() {
        let repo = SqlRepository::connect_in_memory().await.unwrap();
        let model = repo.ensure_model("org/model", "main").await.unwrap();
        let instance_type_id = seed_instance_type(&repo, "g5.xlarge").await;
        let run_id = repo
            .create_benchmark_run(model.id, instance_type_id, &sample_request())
            .await
            .unwrap();
        repo.update_run_status(run_id, RunStatus::Running).await.unwrap();
        repo.persist_metrics(run_id, &sample_metrics(run_id)).await.unwrap();

        let second = repo.persist_metrics(run_id, &sample_metrics(run_id)).await;
        assert!(matches!(second, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn illegal_status_transition_is_rejected() {
        let repo = SqlRepository::connect_in_memory().await.unwrap();
        let model = repo.ensure_model("org/model", "main").await.unwrap();
        let instance_type_id = seed_instance_type(&repo, "g5.xlarge").await;
        let run_id = repo
            .create_benchmark_run(model.id, instance_type_id, &sample_request())
            .await
            .unwrap();

        let result = repo.update_run_status(run_id, RunStatus::Completed).await;
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn catalog_excludes_non_terminal_and_superseded_runs() {
        let repo = SqlRepository::connect_in_memory().await.unwrap();
        let model = repo.ensure_model("org/model", "main").await.unwrap();
        let instance_type_id = seed_instance_type(&repo, "g5.xlarge").await;

        let pending_run = repo
            .create_benchmark_run(model.id, instance_type_id, &sample_request())
            .await
            .unwrap();
        let _ = pending_run;

        let completed_run = repo
            .create_benchmark_run(model.id, instance_type_id, &sample_request())
            .await
            .unwrap();
        repo.update_run_status(completed_run, RunStatus::Running).await.unwrap();
        repo.persist_metrics(completed_run, &sample_metrics(completed_run))
            .await
            .unwrap();

        let entries = repo
            .list_catalog(&CatalogFilter::default(), Page::default())
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].run_id, completed_run);
    }

    #[tokio::test]
    async fn pricing_upsert_is_idempotent_on_composite_key() {
        let repo = SqlRepository::connect_in_memory().await.unwrap();
        let instance_type_id = seed_instance_type(&repo, "g5.xlarge").await;
        let effective_date = Utc::now();

        let row = Pricing {
            id: Uuid::new_v4(),
            instance_type_id,
            region: "us-east-1".to_string(),
            effective_date,
            on_demand_hourly_usd: 1.5,
            reserved_1yr_hourly_usd: None,
            reserved_3yr_hourly_usd: None,
        };
        repo.upsert_pricing(&row).await.unwrap();

        let mut updated = row.clone();
        updated.on_demand_hourly_usd = 1.75;
        repo.upsert_pricing(&updated).await.unwrap();

        let prices = repo.list_pricing("us-east-1").await.unwrap();
        assert_eq!(prices.len(), 1);
        assert_eq!(prices[0].on_demand_hourly_usd, 1.75);
    }
}
