// Copyright (c) 2025 AccelBench Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The cluster port: everything the orchestrator needs from the
//! container-orchestrator cluster, expressed as a trait so the state
//! machine in `orchestrator.rs` can be driven against a fake in tests.
//! `accelbench-cluster` supplies the real `kube`-backed implementation.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single container within a workload or job descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default)]
    pub ports: Vec<i32>,
    pub cpu_millicores: i64,
    pub memory_mib: i64,
    #[serde(default)]
    pub accelerator_count: i64,
}

/// The long-running model-serving workload descriptor rendered by C1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadManifest {
    pub namespace: String,
    pub deployment_name: String,
    pub service_name: String,
    pub replicas: i32,
    pub node_selector: BTreeMap<String, String>,
    pub containers: Vec<ContainerSpec>,
    pub service_port: i32,
    pub health_path: String,
}

/// The load-generator job descriptor rendered by C1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobManifest {
    pub namespace: String,
    pub job_name: String,
    pub node_selector: BTreeMap<String, String>,
    pub container: ContainerSpec,
}

/// Terminal/in-flight status of a load-generator job, as surfaced by the
/// cluster's condition list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Complete,
    Failed { message: String },
}

/// Everything the orchestrator needs from the container-orchestrator
/// cluster. All operations are idempotent where the underlying cluster API
/// allows it; "not found" on delete is treated as success so teardown can
/// run unconditionally on every exit path.
#[async_trait]
pub trait ClusterHandle: Send + Sync {
    /// Applies the Deployment + Service pair. An "already exists" error is
    /// surfaced as-is — the orchestrator treats it as a hard error
    /// indicating leaked resources from a prior run with a colliding name.
    async fn apply_workload(&self, manifest: &WorkloadManifest) -> Result<()>;

    async fn apply_job(&self, manifest: &JobManifest) -> Result<()>;

    /// Current ready-replica count of the named Deployment.
    async fn ready_replicas(&self, namespace: &str, deployment_name: &str) -> Result<i32>;

    /// Current terminal/in-flight condition of the named Job.
    async fn job_status(&self, namespace: &str, job_name: &str) -> Result<JobStatus>;

    /// Pod names carrying the job's selector label, in cluster-returned
    /// order. The orchestrator picks the first.
    async fn list_job_pods(&self, namespace: &str, job_name: &str) -> Result<Vec<String>>;

    /// The full log stream of a pod's primary container, as bytes.
    async fn pod_logs(&self, namespace: &str, pod_name: &str) -> Result<Vec<u8>>;

    /// Deletes with background propagation. Not-found is success.
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()>;

    /// Deletes with background propagation. Not-found is success.
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()>;

    /// Deletes with background propagation. Not-found is success.
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;
}
