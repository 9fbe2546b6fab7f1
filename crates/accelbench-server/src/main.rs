// Copyright (c) 2025 AccelBench Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! accelbench-server — standalone benchmarking service.
//!
//! Reads config from env vars:
//!   ACCELBENCH_DATABASE_URL     — Postgres connection string (required)
//!   ACCELBENCH_BIND_ADDR        — listen address (default: 0.0.0.0:8080)
//!   ACCELBENCH_KUBE_NAMESPACE   — namespace runs are scheduled into (default: accelbench)
//!   ACCELBENCH_PRICING_REGIONS  — comma-separated regions to refresh (default: us-east-2)
//!   ACCELBENCH_LOG_LEVEL        — tracing env-filter directive (default: info)

use accelbench_api::{build_router, AppState};
use accelbench_cluster::KubeClusterHandle;
use accelbench_core::{CancellationRegistry, Orchestrator, OrchestratorConfig};
use accelbench_pricing::{PricingRefresher, SyntheticPricingSource};
use accelbench_repository::SqlRepository;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const PRICING_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("ACCELBENCH_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("{log_level},accelbench=debug"))),
        )
        .init();

    let database_url =
        std::env::var("ACCELBENCH_DATABASE_URL").expect("ACCELBENCH_DATABASE_URL must be set");
    let bind_addr =
        std::env::var("ACCELBENCH_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let namespace =
        std::env::var("ACCELBENCH_KUBE_NAMESPACE").unwrap_or_else(|_| "accelbench".to_string());
    let pricing_regions: Vec<String> = std::env::var("ACCELBENCH_PRICING_REGIONS")
        .unwrap_or_else(|_| "us-east-2".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let repository = Arc::new(
        SqlRepository::connect(&database_url)
            .await
            .expect("failed to connect to database"),
    );
    repository.migrate().await.expect("failed to run migrations");
    tracing::info!("connected to database and applied migrations");

    let cluster = Arc::new(
        KubeClusterHandle::try_new()
            .await
            .expect("failed to build kube client from in-cluster or kubeconfig context"),
    );

    let cancellations = CancellationRegistry::new();
    let orchestrator_config = OrchestratorConfig {
        namespace,
        ..OrchestratorConfig::default()
    };
    let orchestrator = Arc::new(Orchestrator::new(
        cluster,
        repository.clone(),
        cancellations.clone(),
        orchestrator_config,
    ));

    let pricing_refresher = PricingRefresher::new(
        repository.clone(),
        Arc::new(SyntheticPricingSource::default()),
        pricing_regions.clone(),
    );
    tokio::spawn(async move {
        pricing_refresher.run_periodically(PRICING_REFRESH_INTERVAL).await;
    });
    tracing::info!(regions = ?pricing_regions, "pricing refresher spawned");

    let state = AppState {
        repository,
        orchestrator,
        cancellations,
    };
    let app = build_router(state);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind to {bind_addr}: {e}"));
    tracing::info!("accelbench-server listening on {bind_addr}");
    axum::serve(listener, app).await?;

    Ok(())
}
