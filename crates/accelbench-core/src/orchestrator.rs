// Copyright (c) 2025 AccelBench Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The benchmark lifecycle state machine (C5): takes a pending run from
//! manifest rendering through workload deployment, load generation,
//! scraping, metrics computation, and teardown — with teardown guaranteed
//! on every exit path, including cancellation and panics unwound through
//! `catch_unwind`-free `Result` propagation.

use crate::cancellation::CancellationRegistry;
use crate::cluster::{ClusterHandle, JobStatus};
use crate::domain::{BenchmarkRun, RunStatus};
use crate::error::{Error, Result};
use crate::manifest::{self, RunParameters};
use crate::metrics::compute_metrics;
use crate::repository::Repository;
use crate::scraper::{self, ScraperSummary};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Timing knobs for the phases that poll the cluster. All have defaults
/// drawn from the reference deployment; production callers may tighten or
/// loosen them per environment.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub namespace: String,
    pub ready_timeout: Duration,
    pub ready_poll_interval: Duration,
    pub job_timeout: Duration,
    pub job_poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            namespace: "accelbench".to_string(),
            ready_timeout: Duration::from_secs(25 * 60),
            ready_poll_interval: Duration::from_secs(10),
            job_timeout: Duration::from_secs(2 * 3600),
            job_poll_interval: Duration::from_secs(15),
        }
    }
}

/// Drives one run through its full lifecycle against a [`ClusterHandle`]
/// and [`Repository`] pair. Generic over both ports so tests can supply
/// in-memory fakes.
pub struct Orchestrator<C: ClusterHandle, R: Repository> {
    cluster: Arc<C>,
    repository: Arc<R>,
    cancellations: CancellationRegistry,
    http: reqwest::Client,
    config: OrchestratorConfig,
}

impl<C: ClusterHandle, R: Repository> Orchestrator<C, R> {
    pub fn new(
        cluster: Arc<C>,
        repository: Arc<R>,
        cancellations: CancellationRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            cluster,
            repository,
            cancellations,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            config,
        }
    }

    /// Registers `run_id` for cancellation and runs it to a terminal state.
    /// Teardown always runs, on success, on failure, and on cancellation;
    /// it runs with a fresh, never-cancelled context so a cancelled run
    /// still gets its cluster resources cleaned up.
    pub async fn execute(&self, run_id: Uuid) -> Result<()> {
        let token = self.cancellations.register(run_id);
        let outcome = self.run_phases(run_id, &token).await;

        let teardown_result = self.teardown(run_id, &token).await;
        self.cancellations.unregister(run_id);

        match (&outcome, &teardown_result) {
            (Ok(()), Err(e)) => {
                tracing::warn!(run_id = %run_id, error = %e, "teardown failed after successful run");
            }
            (Err(e), Err(te)) => {
                tracing::warn!(run_id = %run_id, run_error = %e, teardown_error = %te, "teardown failed after run failure");
            }
            _ => {}
        }

        if let Err(err) = &outcome {
            self.fail_run(run_id, err).await;
        }

        outcome
    }

    async fn run_phases(&self, run_id: Uuid, token: &CancellationToken) -> Result<()> {
        check_cancelled(token)?;

        // Phase 1: load and validate. A terminal run handed to the
        // orchestrator is a caller bug, not a retryable condition.
        let run = self
            .repository
            .get_benchmark_run(run_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("benchmark run {run_id}")))?;
        if run.status.is_terminal() {
            return Err(Error::conflict(format!(
                "run {run_id} is already {}",
                run.status.as_str()
            )));
        }

        self.repository
            .update_run_status(run_id, RunStatus::Running)
            .await?;

        check_cancelled(token)?;

        let params = self.build_run_parameters(&run).await?;
        let workload = manifest::render_workload_manifest(&params)?;
        let job = manifest::render_job_manifest(&params)?;

        check_cancelled(token)?;
        self.cluster.apply_workload(&workload).await?;

        self.wait_for_ready(&workload.namespace, &workload.deployment_name, token)
            .await?;

        check_cancelled(token)?;
        self.cluster.apply_job(&job).await?;

        // The scraper only understands vLLM's GPU-flavored exposition;
        // Neuron instances run without one (recorded, not fatal).
        let scraper_started = params.instance_type.accelerator_type
            == crate::domain::AcceleratorType::Gpu;
        let (scraper_tx, scraper_rx) = watch::channel(ScraperSummary::default());
        let scraper_token = CancellationToken::new();
        let scraper_handle = if scraper_started {
            let metrics_url = format!(
                "http://{}.{}.svc.cluster.local:{}/metrics",
                workload.service_name, workload.namespace, workload.service_port
            );
            Some(tokio::spawn(scraper::run(
                self.http.clone(),
                metrics_url,
                params.instance_type.accelerator_memory_gib,
                scraper_token.clone(),
                scraper_tx,
            )))
        } else {
            tracing::info!(
                run_id = %run_id,
                accelerator_type = ?params.instance_type.accelerator_type,
                "serving scraper not started: non-GPU accelerator"
            );
            None
        };

        let job_outcome = self
            .wait_for_job(&job.namespace, &job.job_name, token)
            .await;

        scraper_token.cancel();
        if let Some(handle) = scraper_handle {
            let _ = handle.await;
        }
        let scraper_summary = *scraper_rx.borrow();

        let pod_names = job_outcome?;
        let logs = self.collect_logs(&job.namespace, &pod_names).await?;

        let scraper_summary_ref = if scraper_started {
            Some(&scraper_summary)
        } else {
            None
        };
        let metrics = compute_metrics(run_id, &logs, scraper_summary_ref)?;
        self.repository.persist_metrics(run_id, &metrics).await?;

        Ok(())
    }

    async fn build_run_parameters(&self, run: &BenchmarkRun) -> Result<RunParameters> {
        let instance_type = self
            .repository
            .get_instance_type(run.instance_type_id)
            .await?
            .ok_or_else(|| Error::infrastructure("instance type missing for run"))?;
        let model = self
            .repository
            .get_model(run.model_id)
            .await?
            .ok_or_else(|| Error::infrastructure("model missing for run"))?;

        Ok(RunParameters {
            namespace: self.config.namespace.clone(),
            short_name: run.id.simple().to_string()[..8].to_string(),
            model_hf_id: model.hf_id,
            model_hf_revision: model.hf_revision,
            instance_type,
            framework: run.framework,
            framework_version: run.framework_version.clone(),
            tensor_parallel_degree: run.tensor_parallel_degree,
            quantization: run.quantization.clone(),
            concurrency: run.concurrency,
            input_sequence_length: run.input_sequence_length,
            output_sequence_length: run.output_sequence_length,
            dataset_name: run.dataset_name.clone(),
            min_duration_seconds: 0,
            extra_env: Default::default(),
        })
    }

    async fn wait_for_ready(
        &self,
        namespace: &str,
        deployment_name: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.ready_timeout;
        loop {
            check_cancelled(token)?;
            let ready = self.cluster.ready_replicas(namespace, deployment_name).await?;
            if ready >= 1 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(self.config.ready_timeout));
            }
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.config.ready_poll_interval) => {}
            }
        }
    }

    async fn wait_for_job(
        &self,
        namespace: &str,
        job_name: &str,
        token: &CancellationToken,
    ) -> Result<Vec<String>> {
        let deadline = tokio::time::Instant::now() + self.config.job_timeout;
        loop {
            check_cancelled(token)?;
            match self.cluster.job_status(namespace, job_name).await? {
                JobStatus::Complete => {
                    return self.cluster.list_job_pods(namespace, job_name).await;
                }
                JobStatus::Failed { message } => {
                    return Err(Error::infrastructure(format!(
                        "load generator job failed: {message}"
                    )));
                }
                JobStatus::Running => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(self.config.job_timeout));
            }
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.config.job_poll_interval) => {}
            }
        }
    }

    async fn collect_logs(&self, namespace: &str, pod_names: &[String]) -> Result<Vec<u8>> {
        let pod_name = pod_names
            .first()
            .ok_or_else(|| Error::infrastructure("load generator job produced no pods"))?;
        self.cluster.pod_logs(namespace, pod_name).await
    }

    /// Teardown always runs against a fresh token, never the run's own —
    /// a cancelled run must still have its cluster resources removed.
    async fn teardown(&self, run_id: Uuid, _outer_token: &CancellationToken) -> Result<()> {
        let namespace = self.config.namespace.clone();
        let short_name = run_id.simple().to_string()[..8].to_string();
        let deployment_name = format!("bench-{short_name}");
        let service_name = deployment_name.clone();
        let job_name = format!("loadgen-{short_name}");

        let results = tokio::join!(
            self.cluster.delete_deployment(&namespace, &deployment_name),
            self.cluster.delete_service(&namespace, &service_name),
            self.cluster.delete_job(&namespace, &job_name),
        );

        results.0?;
        results.1?;
        results.2?;
        Ok(())
    }

    async fn fail_run(&self, run_id: Uuid, err: &Error) {
        if err.is_cancellation() {
            tracing::info!(run_id = %run_id, "run cancelled");
        } else {
            tracing::warn!(run_id = %run_id, error = %err, "run failed");
        }
        if let Err(transition_err) = self
            .repository
            .update_run_status(run_id, RunStatus::Failed)
            .await
        {
            tracing::warn!(run_id = %run_id, error = %transition_err, "failed to mark run as failed");
        }
    }
}

fn check_cancelled(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}
