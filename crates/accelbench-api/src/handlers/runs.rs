// Copyright (c) 2025 AccelBench Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::error::ApiError;
use crate::{metrics, AppState};
use accelbench_core::cluster::ClusterHandle;
use accelbench_core::domain::{BenchmarkMetrics, BenchmarkRun, RunRequest, RunStatus};
use accelbench_core::repository::{Page, Repository, RunFilter};
use accelbench_core::Error;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn validate_run_request(req: &RunRequest) -> Result<(), Error> {
    if req.hf_id.trim().is_empty() {
        return Err(Error::validation("hf_id must not be empty"));
    }
    if req.hf_revision.trim().is_empty() {
        return Err(Error::validation("hf_revision must not be empty"));
    }
    if req.instance_type_name.trim().is_empty() {
        return Err(Error::validation("instance_type_name must not be empty"));
    }
    if req.framework_version.trim().is_empty() {
        return Err(Error::validation("framework_version must not be empty"));
    }
    if req.dataset_name.trim().is_empty() {
        return Err(Error::validation("dataset_name must not be empty"));
    }
    if req.tensor_parallel_degree <= 0 {
        return Err(Error::validation("tensor_parallel_degree must be positive"));
    }
    if req.concurrency <= 0 {
        return Err(Error::validation("concurrency must be positive"));
    }
    if req.input_sequence_length <= 0 || req.output_sequence_length <= 0 {
        return Err(Error::validation(
            "input/output sequence lengths must be positive",
        ));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct CreateRunResponse {
    pub id: Uuid,
    pub status: &'static str,
}

pub async fn create_run<C: ClusterHandle + 'static, R: Repository + 'static>(
    State(state): State<AppState<C, R>>,
    Json(req): Json<RunRequest>,
) -> Result<(StatusCode, Json<CreateRunResponse>), ApiError> {
    validate_run_request(&req)?;

    let instance_type = state
        .repository
        .get_instance_type_by_name(&req.instance_type_name)
        .await?
        .ok_or_else(|| Error::not_found(format!("instance type {:?}", req.instance_type_name)))?;

    let model = state.repository.ensure_model(&req.hf_id, &req.hf_revision).await?;

    let run_id = state
        .repository
        .create_benchmark_run(model.id, instance_type.id, &req)
        .await?;

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        if let Err(e) = orchestrator.execute(run_id).await {
            tracing::warn!(run_id = %run_id, error = %e, "benchmark run ended in error");
        }
    });

    metrics::record_http_request("/api/v1/runs", 202);
    Ok((
        StatusCode::ACCEPTED,
        Json(CreateRunResponse {
            id: run_id,
            status: "pending",
        }),
    ))
}

pub async fn get_run<C: ClusterHandle + 'static, R: Repository + 'static>(
    State(state): State<AppState<C, R>>,
    Path(id): Path<Uuid>,
) -> Result<Json<BenchmarkRun>, ApiError> {
    let run = state
        .repository
        .get_benchmark_run(id)
        .await?
        .ok_or_else(|| Error::not_found(format!("run {id}")))?;
    Ok(Json(run))
}

pub async fn get_run_metrics<C: ClusterHandle + 'static, R: Repository + 'static>(
    State(state): State<AppState<C, R>>,
    Path(id): Path<Uuid>,
) -> Result<Json<BenchmarkMetrics>, ApiError> {
    state
        .repository
        .get_benchmark_run(id)
        .await?
        .ok_or_else(|| Error::not_found(format!("run {id}")))?;

    let metrics = state
        .repository
        .get_metrics_by_run_id(id)
        .await?
        .ok_or_else(|| Error::not_found(format!("metrics for run {id}")))?;
    Ok(Json(metrics))
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub model: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub runs: Vec<BenchmarkRun>,
    pub total: i64,
}

pub async fn list_jobs<C: ClusterHandle + 'static, R: Repository + 'static>(
    State(state): State<AppState<C, R>>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<ListJobsResponse>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(|s| RunStatus::parse(s).ok_or_else(|| Error::validation(format!("unknown status {s:?}"))))
        .transpose()?;

    let filter = RunFilter {
        status,
        model: query.model,
    };
    let page = Page {
        limit: query.limit.unwrap_or(50),
        offset: query.offset.unwrap_or(0),
    };

    let runs = state.repository.list_runs(&filter, page).await?;
    let total = state.repository.count_runs(&filter).await?;
    Ok(Json(ListJobsResponse { runs, total }))
}

#[derive(Debug, Serialize)]
pub struct CancelRunResponse {
    pub id: Uuid,
    pub status: &'static str,
}

pub async fn cancel_run<C: ClusterHandle + 'static, R: Repository + 'static>(
    State(state): State<AppState<C, R>>,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelRunResponse>, ApiError> {
    let run = state
        .repository
        .get_benchmark_run(id)
        .await?
        .ok_or_else(|| Error::not_found(format!("run {id}")))?;

    if !matches!(run.status, RunStatus::Pending | RunStatus::Running) {
        return Err(Error::conflict(format!(
            "run {id} is not cancellable (status={})",
            run.status.as_str()
        ))
        .into());
    }

    state.cancellations.cancel(id);
    state.repository.update_run_status(id, RunStatus::Failed).await?;

    Ok(Json(CancelRunResponse {
        id,
        status: "failed",
    }))
}

pub async fn delete_run<C: ClusterHandle + 'static, R: Repository + 'static>(
    State(state): State<AppState<C, R>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let run = state
        .repository
        .get_benchmark_run(id)
        .await?
        .ok_or_else(|| Error::not_found(format!("run {id}")))?;

    if matches!(run.status, RunStatus::Pending | RunStatus::Running) {
        state.cancellations.cancel(id);
        // Best-effort: the background task may already be past the point
        // where this transition is legal; the row delete below is final
        // regardless of which status it lands in.
        let _ = state.repository.update_run_status(id, RunStatus::Failed).await;
    }

    state.repository.delete_run(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
