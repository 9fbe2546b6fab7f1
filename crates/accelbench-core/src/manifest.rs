// Copyright (c) 2025 AccelBench Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The manifest renderer (C1): a pure function of a parameter record to
//! orchestrator descriptors. Rendering performs no I/O and is
//! deterministic — the same `RunParameters` always produces byte-identical
//! `WorkloadManifest`/`JobManifest` values (and therefore byte-identical
//! serialized YAML).

use crate::cluster::{ContainerSpec, JobManifest, WorkloadManifest};
use crate::domain::{AcceleratorType, Framework, InstanceType};
use crate::error::{Error, Result};
use std::collections::BTreeMap;

const SERVICE_PORT: i32 = 8000;
const HEALTH_PATH: &str = "/health";
const DEFAULT_WARMUP_REQUESTS: i32 = 10;
const DEFAULT_MIN_REQUESTS: i32 = 200;

/// Everything the manifest renderer needs to produce descriptors for one
/// run. Assembled by the orchestrator from the `BenchmarkRun` row plus the
/// looked-up `InstanceType`.
#[derive(Debug, Clone)]
pub struct RunParameters {
    pub namespace: String,
    /// First 8 characters of the run id; used to derive resource names.
    pub short_name: String,
    pub model_hf_id: String,
    pub model_hf_revision: String,
    pub instance_type: InstanceType,
    pub framework: Framework,
    pub framework_version: String,
    pub tensor_parallel_degree: i32,
    pub quantization: Option<String>,
    pub concurrency: i32,
    pub input_sequence_length: i32,
    pub output_sequence_length: i32,
    pub dataset_name: String,
    pub min_duration_seconds: i32,
    /// Passed through verbatim into the load-generator container's
    /// environment. The renderer does not inspect or secret-scan these;
    /// it is the caller's responsibility to keep secrets out unless they
    /// are meant to reach the job.
    pub extra_env: BTreeMap<String, String>,
}

impl RunParameters {
    fn deployment_name(&self) -> String {
        format!("bench-{}", self.short_name)
    }

    fn service_name(&self) -> String {
        format!("bench-{}", self.short_name)
    }

    fn job_name(&self) -> String {
        format!("loadgen-{}", self.short_name)
    }

    fn model_container_cpu_millicores(&self) -> i64 {
        let vcpus = self.instance_type.vcpus.max(1) as f64;
        let millicores = (vcpus * 0.75 * 1000.0).floor() as i64;
        millicores.max(1000)
    }

    fn model_container_memory_mib(&self) -> i64 {
        let gib = self.instance_type.memory_gib.max(1.0);
        let mib = (gib * 0.85 * 1024.0).floor() as i64;
        mib.max(1024)
    }
}

/// Validates a `RunParameters` before rendering. The only way rendering
/// fails — malformed input, never I/O.
fn validate(params: &RunParameters) -> Result<()> {
    if params.short_name.is_empty() {
        return Err(Error::validation("short_name must not be empty"));
    }
    if params.model_hf_id.is_empty() {
        return Err(Error::validation("model_hf_id must not be empty"));
    }
    if params.concurrency <= 0 {
        return Err(Error::validation("concurrency must be positive"));
    }
    if params.input_sequence_length <= 0 || params.output_sequence_length <= 0 {
        return Err(Error::validation(
            "input/output sequence lengths must be positive",
        ));
    }
    if params.instance_type.accelerator_count <= 0 {
        return Err(Error::validation(
            "instance type must expose at least one accelerator",
        ));
    }
    Ok(())
}

/// Renders the model-serving workload descriptor: a Deployment exposing
/// `accelerator_count` accelerator devices, tolerations/selectors landing
/// it on the requested instance type, and a Service fronting the same
/// pods on port 8000.
pub fn render_workload_manifest(params: &RunParameters) -> Result<WorkloadManifest> {
    validate(params)?;

    let mut node_selector = BTreeMap::new();
    node_selector.insert(
        "node.accelbench.io/instance-type".to_string(),
        params.instance_type.name.clone(),
    );

    let mut env = vec![
        ("MODEL_ID".to_string(), params.model_hf_id.clone()),
        ("MODEL_REVISION".to_string(), params.model_hf_revision.clone()),
        (
            "TENSOR_PARALLEL_DEGREE".to_string(),
            params.tensor_parallel_degree.to_string(),
        ),
    ];
    if let Some(q) = &params.quantization {
        if !q.is_empty() {
            env.push(("QUANTIZATION".to_string(), q.clone()));
        }
    }

    let mut containers = vec![ContainerSpec {
        name: "model-server".to_string(),
        image: server_image_for(params.instance_type.accelerator_type, &params.framework_version),
        env: env.clone(),
        ports: vec![SERVICE_PORT],
        cpu_millicores: params.model_container_cpu_millicores(),
        memory_mib: params.model_container_memory_mib(),
        accelerator_count: params.instance_type.accelerator_count as i64,
    }];

    // Neuron instances run a sidecar runtime container alongside the
    // server container; GPU instances need only the one.
    if params.instance_type.accelerator_type == AcceleratorType::Neuron {
        containers.push(ContainerSpec {
            name: "neuron-runtime".to_string(),
            image: "accelbench/neuron-runtime-sidecar:latest".to_string(),
            env: vec![],
            ports: vec![],
            cpu_millicores: 250,
            memory_mib: 512,
            accelerator_count: 0,
        });
    }

    Ok(WorkloadManifest {
        namespace: params.namespace.clone(),
        deployment_name: params.deployment_name(),
        service_name: params.service_name(),
        replicas: 1,
        node_selector,
        containers,
        service_port: SERVICE_PORT,
        health_path: HEALTH_PATH.to_string(),
    })
}

/// Renders the load-generator job descriptor: one container, no restart on
/// failure, forced onto a non-accelerated "system" node.
pub fn render_job_manifest(params: &RunParameters) -> Result<JobManifest> {
    validate(params)?;

    let mut node_selector = BTreeMap::new();
    node_selector.insert(
        "node.accelbench.io/pool".to_string(),
        "system".to_string(),
    );

    let total_requests = (params.concurrency * 10).max(DEFAULT_MIN_REQUESTS);

    let env = vec![
        ("TARGET_HOST".to_string(), params.deployment_name()),
        ("TARGET_PORT".to_string(), SERVICE_PORT.to_string()),
        ("MODEL_ID".to_string(), params.model_hf_id.clone()),
        ("CONCURRENCY".to_string(), params.concurrency.to_string()),
        (
            "INPUT_SEQUENCE_LENGTH".to_string(),
            params.input_sequence_length.to_string(),
        ),
        (
            "OUTPUT_SEQUENCE_LENGTH".to_string(),
            params.output_sequence_length.to_string(),
        ),
        ("DATASET_NAME".to_string(), params.dataset_name.clone()),
        (
            "WARMUP_REQUESTS".to_string(),
            DEFAULT_WARMUP_REQUESTS.to_string(),
        ),
        ("TOTAL_REQUESTS".to_string(), total_requests.to_string()),
        (
            "MIN_DURATION_SECONDS".to_string(),
            params.min_duration_seconds.to_string(),
        ),
        ("OUTPUT_FORMAT".to_string(), "json".to_string()),
    ];

    let mut env = env;
    for (k, v) in &params.extra_env {
        env.push((k.clone(), v.clone()));
    }

    Ok(JobManifest {
        namespace: params.namespace.clone(),
        job_name: params.job_name(),
        node_selector,
        container: ContainerSpec {
            name: "loadgen".to_string(),
            image: "accelbench/loadgen:latest".to_string(),
            env,
            ports: vec![],
            cpu_millicores: 2000,
            memory_mib: 2048,
            accelerator_count: 0,
        },
    })
}

fn server_image_for(accelerator_type: AcceleratorType, framework_version: &str) -> String {
    match accelerator_type {
        AcceleratorType::Gpu => format!("accelbench/vllm-gpu:{}", framework_version),
        AcceleratorType::Neuron => format!("accelbench/vllm-neuron:{}", framework_version),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::InstanceType;
    use uuid::Uuid;

    fn gpu_instance() -> InstanceType {
        InstanceType {
            id: Uuid::new_v4(),
            name: "g5.xlarge".to_string(),
            family: "g5".to_string(),
            accelerator_type: AcceleratorType::Gpu,
            accelerator_name: "A10G".to_string(),
            accelerator_count: 1,
            accelerator_memory_gib: 24.0,
            vcpus: 4,
            memory_gib: 16.0,
        }
    }

    fn base_params() -> RunParameters {
        RunParameters {
            namespace: "accelbench".to_string(),
            short_name: "abc12345".to_string(),
            model_hf_id: "meta-llama/Llama-3.1-8B".to_string(),
            model_hf_revision: "abc123".to_string(),
            instance_type: gpu_instance(),
            framework: Framework::Vllm,
            framework_version: "0.6.3".to_string(),
            tensor_parallel_degree: 1,
            quantization: None,
            concurrency: 16,
            input_sequence_length: 512,
            output_sequence_length: 256,
            dataset_name: "sharegpt".to_string(),
            min_duration_seconds: 60,
            extra_env: BTreeMap::new(),
        }
    }

    #[test]
    fn rendering_is_deterministic() {
        let params = base_params();
        let a = render_workload_manifest(&params).unwrap();
        let b = render_workload_manifest(&params).unwrap();
        assert_eq!(a, b);

        let ya = serde_yaml::to_string(&a).unwrap();
        let yb = serde_yaml::to_string(&b).unwrap();
        assert_eq!(ya, yb);
    }

    #[test]
    fn workload_names_derive_from_short_name() {
        let params = base_params();
        let manifest = render_workload_manifest(&params).unwrap();
        assert_eq!(manifest.deployment_name, "bench-abc12345");
        assert_eq!(manifest.service_name, "bench-abc12345");
        assert_eq!(manifest.service_port, 8000);
        assert_eq!(manifest.health_path, "/health");
    }

    #[test]
    fn job_name_derives_from_short_name() {
        let params = base_params();
        let manifest = render_job_manifest(&params).unwrap();
        assert_eq!(manifest.job_name, "loadgen-abc12345");
    }

    #[test]
    fn quantization_omitted_when_empty() {
        let mut params = base_params();
        params.quantization = Some(String::new());
        let manifest = render_workload_manifest(&params).unwrap();
        assert!(!manifest.containers[0]
            .env
            .iter()
            .any(|(k, _)| k == "QUANTIZATION"));

        params.quantization = Some("awq".to_string());
        let manifest = render_workload_manifest(&params).unwrap();
        assert!(manifest.containers[0]
            .env
            .iter()
            .any(|(k, v)| k == "QUANTIZATION" && v == "awq"));
    }

    #[test]
    fn resource_requests_are_floored_fractions() {
        let params = base_params();
        let manifest = render_workload_manifest(&params).unwrap();
        // 4 vcpus * 0.75 = 3.0 -> 3000m; 16 GiB * 0.85 = 13.6 -> 13926 MiB (floored)
        assert_eq!(manifest.containers[0].cpu_millicores, 3000);
        assert_eq!(manifest.containers[0].memory_mib, 13926);
    }

    #[test]
    fn resource_requests_floor_at_one() {
        let mut params = base_params();
        params.instance_type.vcpus = 1;
        params.instance_type.memory_gib = 0.5;
        let manifest = render_workload_manifest(&params).unwrap();
        assert_eq!(manifest.containers[0].cpu_millicores, 1000);
        assert_eq!(manifest.containers[0].memory_mib, 1024);
    }

    #[test]
    fn neuron_instance_adds_sidecar_container() {
        let mut params = base_params();
        params.instance_type.accelerator_type = AcceleratorType::Neuron;
        params.framework = Framework::VllmNeuron;
        let manifest = render_workload_manifest(&params).unwrap();
        assert_eq!(manifest.containers.len(), 2);
        assert_eq!(manifest.containers[1].name, "neuron-runtime");
    }

    #[test]
    fn loadgen_total_requests_defaults_to_max_200_or_10x_concurrency() {
        let mut params = base_params();
        params.concurrency = 4;
        let manifest = render_job_manifest(&params).unwrap();
        let total = manifest
            .container
            .env
            .iter()
            .find(|(k, _)| k == "TOTAL_REQUESTS")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert_eq!(total, "200");

        params.concurrency = 50;
        let manifest = render_job_manifest(&params).unwrap();
        let total = manifest
            .container
            .env
            .iter()
            .find(|(k, _)| k == "TOTAL_REQUESTS")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert_eq!(total, "500");
    }

    #[test]
    fn empty_short_name_is_rejected() {
        let mut params = base_params();
        params.short_name.clear();
        assert!(render_workload_manifest(&params).is_err());
    }
}
