// Copyright (c) 2025 AccelBench Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The JSON REST surface (C6): catalog queries, run lifecycle, pricing, and
//! ambient liveness/metrics endpoints, built on `axum` over `tower`/
//! `tower-http`.

pub mod error;
pub mod handlers;
pub mod metrics;

use accelbench_core::cluster::ClusterHandle;
use accelbench_core::repository::Repository;
use accelbench_core::{CancellationRegistry, Orchestrator};
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// State shared by every handler via axum's `State` extractor. Generic over
/// both ports so the API crate never depends on a concrete cluster/database
/// adapter — the server binary supplies those.
pub struct AppState<C: ClusterHandle + 'static, R: Repository + 'static> {
    pub repository: Arc<R>,
    pub orchestrator: Arc<Orchestrator<C, R>>,
    pub cancellations: CancellationRegistry,
}

impl<C: ClusterHandle + 'static, R: Repository + 'static> Clone for AppState<C, R> {
    fn clone(&self) -> Self {
        Self {
            repository: self.repository.clone(),
            orchestrator: self.orchestrator.clone(),
            cancellations: self.cancellations.clone(),
        }
    }
}

pub fn build_router<C: ClusterHandle + 'static, R: Repository + 'static>(
    state: AppState<C, R>,
) -> Router {
    metrics::init();

    Router::new()
        .route("/api/v1/catalog", get(handlers::catalog::list_catalog))
        .route("/api/v1/runs", post(handlers::runs::create_run))
        .route("/api/v1/runs/:id", get(handlers::runs::get_run))
        .route("/api/v1/runs/:id", delete(handlers::runs::delete_run))
        .route("/api/v1/runs/:id/metrics", get(handlers::runs::get_run_metrics))
        .route("/api/v1/runs/:id/cancel", post(handlers::runs::cancel_run))
        .route("/api/v1/jobs", get(handlers::runs::list_jobs))
        .route("/api/v1/pricing", get(handlers::pricing::list_pricing))
        .route("/healthz", get(handlers::health::healthz))
        .route("/metrics", get(handlers::health::metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use accelbench_core::cluster::{ClusterHandle, JobStatus};
    use accelbench_core::domain::{
        AcceleratorType, BenchmarkMetrics, BenchmarkRun, CatalogEntry, Framework, InstanceType,
        Model, RunRequest, RunStatus, RunType,
    };
    use accelbench_core::cluster::{JobManifest, WorkloadManifest};
    use accelbench_core::repository::{CatalogFilter, Page, RunFilter};
    use accelbench_core::{Error, OrchestratorConfig, Result};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tower::ServiceExt;
    use uuid::Uuid;

    struct NoopCluster;

    #[async_trait]
    impl ClusterHandle for NoopCluster {
        async fn apply_workload(&self, _manifest: &WorkloadManifest) -> Result<()> {
            Ok(())
        }
        async fn apply_job(&self, _manifest: &JobManifest) -> Result<()> {
            Ok(())
        }
        async fn ready_replicas(&self, _namespace: &str, _name: &str) -> Result<i32> {
            Ok(1)
        }
        async fn job_status(&self, _namespace: &str, _name: &str) -> Result<JobStatus> {
            Ok(JobStatus::Complete)
        }
        async fn list_job_pods(&self, _namespace: &str, _name: &str) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn pod_logs(&self, _namespace: &str, _pod: &str) -> Result<Vec<u8>> {
            Ok(vec![])
        }
        async fn delete_deployment(&self, _namespace: &str, _name: &str) -> Result<()> {
            Ok(())
        }
        async fn delete_service(&self, _namespace: &str, _name: &str) -> Result<()> {
            Ok(())
        }
        async fn delete_job(&self, _namespace: &str, _name: &str) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeRepository {
        instance_types: Mutex<HashMap<Uuid, InstanceType>>,
        models: Mutex<HashMap<Uuid, Model>>,
        runs: Mutex<HashMap<Uuid, BenchmarkRun>>,
    }

    #[async_trait]
    impl Repository for FakeRepository {
        async fn ensure_model(&self, hf_id: &str, hf_revision: &str) -> Result<Model> {
            let id = Uuid::new_v4();
            let model = Model {
                id,
                hf_id: hf_id.to_string(),
                hf_revision: hf_revision.to_string(),
                family: None,
                parameter_count: None,
                created_at: chrono::Utc::now(),
            };
            self.models.lock().insert(id, model.clone());
            Ok(model)
        }
        async fn get_model(&self, id: Uuid) -> Result<Option<Model>> {
            Ok(self.models.lock().get(&id).cloned())
        }
        async fn get_instance_type_by_name(&self, name: &str) -> Result<Option<InstanceType>> {
            Ok(self
                .instance_types
                .lock()
                .values()
                .find(|it| it.name == name)
                .cloned())
        }
        async fn get_instance_type(&self, id: Uuid) -> Result<Option<InstanceType>> {
            Ok(self.instance_types.lock().get(&id).cloned())
        }
        async fn list_instance_types(&self) -> Result<Vec<InstanceType>> {
            Ok(self.instance_types.lock().values().cloned().collect())
        }
        async fn create_benchmark_run(
            &self,
            model_id: Uuid,
            instance_type_id: Uuid,
            params: &RunRequest,
        ) -> Result<Uuid> {
            let id = Uuid::new_v4();
            self.runs.lock().insert(
                id,
                BenchmarkRun {
                    id,
                    model_id,
                    instance_type_id,
                    framework: params.framework,
                    framework_version: params.framework_version.clone(),
                    tensor_parallel_degree: params.tensor_parallel_degree,
                    quantization: params.quantization.clone(),
                    concurrency: params.concurrency,
                    input_sequence_length: params.input_sequence_length,
                    output_sequence_length: params.output_sequence_length,
                    dataset_name: params.dataset_name.clone(),
                    run_type: params.run_type,
                    status: RunStatus::Pending,
                    superseded: false,
                    created_at: chrono::Utc::now(),
                    started_at: None,
                    completed_at: None,
                },
            );
            Ok(id)
        }
        async fn update_run_status(&self, id: Uuid, status: RunStatus) -> Result<()> {
            let mut runs = self.runs.lock();
            let run = runs.get_mut(&id).ok_or_else(|| Error::not_found("run"))?;
            if !run.status.can_transition_to(status) {
                return Err(Error::conflict("illegal transition"));
            }
            run.status = status;
            Ok(())
        }
        async fn persist_metrics(&self, _run_id: Uuid, _metrics: &BenchmarkMetrics) -> Result<()> {
            Ok(())
        }
        async fn get_benchmark_run(&self, id: Uuid) -> Result<Option<BenchmarkRun>> {
            Ok(self.runs.lock().get(&id).cloned())
        }
        async fn get_metrics_by_run_id(&self, _run_id: Uuid) -> Result<Option<BenchmarkMetrics>> {
            Ok(None)
        }
        async fn list_runs(&self, _filter: &RunFilter, _page: Page) -> Result<Vec<BenchmarkRun>> {
            Ok(self.runs.lock().values().cloned().collect())
        }
        async fn count_runs(&self, _filter: &RunFilter) -> Result<i64> {
            Ok(self.runs.lock().len() as i64)
        }
        async fn delete_run(&self, id: Uuid) -> Result<()> {
            self.runs.lock().remove(&id);
            Ok(())
        }
        async fn list_catalog(&self, _filter: &CatalogFilter, _page: Page) -> Result<Vec<CatalogEntry>> {
            Ok(vec![])
        }
        async fn count_catalog(&self, _filter: &CatalogFilter) -> Result<i64> {
            Ok(0)
        }
        async fn upsert_pricing(&self, _row: &accelbench_core::domain::Pricing) -> Result<()> {
            Ok(())
        }
        async fn list_pricing(&self, _region: &str) -> Result<Vec<accelbench_core::domain::Pricing>> {
            Ok(vec![])
        }
    }

    fn test_state() -> AppState<NoopCluster, FakeRepository> {
        let repository = Arc::new(FakeRepository::default());
        let cancellations = CancellationRegistry::new();
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(NoopCluster),
            repository.clone(),
            cancellations.clone(),
            OrchestratorConfig::default(),
        ));
        AppState {
            repository,
            orchestrator,
            cancellations,
        }
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn creating_a_run_against_an_unknown_instance_type_is_404() {
        let app = build_router(test_state());
        let body = serde_json::to_vec(&RunRequest {
            hf_id: "meta-llama/Llama-3.1-8B".to_string(),
            hf_revision: "main".to_string(),
            instance_type_name: "does-not-exist".to_string(),
            framework: Framework::Vllm,
            framework_version: "0.6.3".to_string(),
            tensor_parallel_degree: 1,
            quantization: None,
            concurrency: 8,
            input_sequence_length: 512,
            output_sequence_length: 256,
            dataset_name: "sharegpt".to_string(),
            run_type: RunType::OnDemand,
            extra_env: Default::default(),
        })
        .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/runs")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn creating_a_run_with_non_positive_concurrency_is_400() {
        let app = build_router(test_state());
        let body = serde_json::to_vec(&RunRequest {
            hf_id: "meta-llama/Llama-3.1-8B".to_string(),
            hf_revision: "main".to_string(),
            instance_type_name: "g5.xlarge".to_string(),
            framework: Framework::Vllm,
            framework_version: "0.6.3".to_string(),
            tensor_parallel_degree: 1,
            quantization: None,
            concurrency: 0,
            input_sequence_length: 512,
            output_sequence_length: 256,
            dataset_name: "sharegpt".to_string(),
            run_type: RunType::OnDemand,
            extra_env: Default::default(),
        })
        .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/runs")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn fetching_an_unknown_run_is_404() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/runs/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancelling_a_completed_run_is_409() {
        let state = test_state();
        let run_id = Uuid::new_v4();
        let instance_type_id = Uuid::new_v4();
        let model_id = Uuid::new_v4();
        state.repository.runs.lock().insert(
            run_id,
            BenchmarkRun {
                id: run_id,
                model_id,
                instance_type_id,
                framework: Framework::Vllm,
                framework_version: "0.6.3".to_string(),
                tensor_parallel_degree: 1,
                quantization: None,
                concurrency: 8,
                input_sequence_length: 512,
                output_sequence_length: 256,
                dataset_name: "sharegpt".to_string(),
                run_type: RunType::OnDemand,
                status: RunStatus::Completed,
                superseded: false,
                created_at: chrono::Utc::now(),
                started_at: Some(chrono::Utc::now()),
                completed_at: Some(chrono::Utc::now()),
            },
        );

        let app = build_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/v1/runs/{run_id}/cancel"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_prometheus_text() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8(body.to_vec()).unwrap().contains("accelbench"));
    }
}
