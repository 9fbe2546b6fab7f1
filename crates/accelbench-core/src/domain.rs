// Copyright (c) 2025 AccelBench Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The persisted entities described in the data model: models, instance
//! types, benchmark runs, metrics, the catalog projection, and pricing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A served model, identified by the Hugging Face id/revision pair.
///
/// Created lazily on first reference by a run; never deleted while a run
/// still references it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Model {
    pub id: Uuid,
    pub hf_id: String,
    pub hf_revision: String,
    pub family: Option<String>,
    pub parameter_count: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// An accelerated instance type. Seeded out of band; effectively immutable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceType {
    pub id: Uuid,
    pub name: String,
    pub family: String,
    pub accelerator_type: AcceleratorType,
    pub accelerator_name: String,
    pub accelerator_count: i32,
    pub accelerator_memory_gib: f64,
    pub vcpus: i32,
    pub memory_gib: f64,
}

/// The accelerator family an instance type exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorType {
    Gpu,
    Neuron,
}

impl AcceleratorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcceleratorType::Gpu => "gpu",
            AcceleratorType::Neuron => "neuron",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gpu" => Some(Self::Gpu),
            "neuron" => Some(Self::Neuron),
            _ => None,
        }
    }
}

/// The serving framework a run is benchmarked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framework {
    Vllm,
    VllmNeuron,
}

impl Framework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Framework::Vllm => "vllm",
            Framework::VllmNeuron => "vllm-neuron",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vllm" => Some(Self::Vllm),
            "vllm-neuron" => Some(Self::VllmNeuron),
            _ => None,
        }
    }
}

/// Whether a run was requested as part of the standing catalog sweep or
/// dispatched on demand. Descriptive only — it does not gate the catalog
/// projection filter, which keys solely on `status` and `superseded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Catalog,
    OnDemand,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Catalog => "catalog",
            RunType::OnDemand => "on_demand",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "catalog" => Some(Self::Catalog),
            "on_demand" => Some(Self::OnDemand),
            _ => None,
        }
    }
}

/// The run lifecycle status. Transitions are monotone: `Pending` ->
/// `Running` -> {`Completed`, `Failed`}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Whether `self -> next` is a legal, monotone transition.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Pending, Pending)
                | (Running, Running)
                | (Failed, Failed)
        )
    }
}

/// One complete benchmark lifecycle from pending to terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkRun {
    pub id: Uuid,
    pub model_id: Uuid,
    pub instance_type_id: Uuid,
    pub framework: Framework,
    pub framework_version: String,
    pub tensor_parallel_degree: i32,
    pub quantization: Option<String>,
    pub concurrency: i32,
    pub input_sequence_length: i32,
    pub output_sequence_length: i32,
    pub dataset_name: String,
    pub run_type: RunType,
    pub status: RunStatus,
    pub superseded: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A single percentile triple (p50/p90/p95/p99), absent in aggregate when
/// the underlying successful-request set was empty.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Percentiles {
    pub p50: Option<f64>,
    pub p90: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

/// Exactly one per completed run. Immutable once written — there is no
/// `UpdateMetrics` operation anywhere in the repository contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkMetrics {
    pub id: Uuid,
    pub run_id: Uuid,
    pub ttft_ms: Percentiles,
    pub e2e_latency_ms: Percentiles,
    pub itl_ms: Percentiles,
    pub throughput_tokens_per_sec: Option<f64>,
    pub throughput_aggregate_tps: Option<f64>,
    pub requests_per_second: Option<f64>,
    pub total_duration_seconds: Option<f64>,
    pub successful_requests: Option<i64>,
    pub failed_requests: Option<i64>,
    pub accelerator_utilization_pct: Option<f64>,
    pub accelerator_utilization_avg_pct: Option<f64>,
    pub accelerator_memory_peak_gib: Option<f64>,
    pub waiting_requests_max: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// The denormalized catalog projection: a join of `Model`, `InstanceType`,
/// `BenchmarkRun` (restricted to `status=completed AND superseded=false`),
/// and `BenchmarkMetrics`, keyed by run id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub run_id: Uuid,
    pub model_hf_id: String,
    pub model_family: Option<String>,
    pub instance_type_name: String,
    pub instance_family: String,
    pub accelerator_type: AcceleratorType,
    pub framework: Framework,
    pub tensor_parallel_degree: i32,
    pub concurrency: i32,
    pub run_type: RunType,
    pub metrics: BenchmarkMetrics,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A pricing row. Upsert key is `(instance_type_id, region, effective_date)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pricing {
    pub id: Uuid,
    pub instance_type_id: Uuid,
    pub region: String,
    pub effective_date: DateTime<Utc>,
    pub on_demand_hourly_usd: f64,
    pub reserved_1yr_hourly_usd: Option<f64>,
    pub reserved_3yr_hourly_usd: Option<f64>,
}

/// Caller-supplied parameters for creating a new benchmark run. Separate
/// from `BenchmarkRun` because the repository, not the caller, assigns the
/// id, status, and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub hf_id: String,
    pub hf_revision: String,
    pub instance_type_name: String,
    pub framework: Framework,
    pub framework_version: String,
    pub tensor_parallel_degree: i32,
    pub quantization: Option<String>,
    pub concurrency: i32,
    pub input_sequence_length: i32,
    pub output_sequence_length: i32,
    pub dataset_name: String,
    pub run_type: RunType,
    #[serde(default)]
    pub extra_env: HashMap<String, String>,
}
