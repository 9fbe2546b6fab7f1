// Copyright (c) 2025 AccelBench Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `KubeClusterHandle`: the `kube`-backed implementation of
//! `accelbench_core::cluster::ClusterHandle`.

use accelbench_core::cluster::{
    ClusterHandle, ContainerSpec, JobManifest, JobStatus, WorkloadManifest,
};
use accelbench_core::error::{Error, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements, Service,
    ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{DeleteParams, ListParams, LogParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use std::collections::BTreeMap;

const MANAGER: &str = "accelbench";
const ACCELERATOR_RESOURCE_KEY: &str = "accelbench.io/accelerator";

/// The `kube`-backed cluster handle. Cheap to clone: `kube::Client` is an
/// `Arc`-wrapped handle over a connection pool internally.
#[derive(Clone)]
pub struct KubeClusterHandle {
    client: Client,
}

impl KubeClusterHandle {
    /// Builds a handle from the ambient kubeconfig/in-cluster config,
    /// exactly as `kube::Client::try_default` resolves it.
    pub async fn try_new() -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<k8s_openapi::api::core::v1::Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn to_resource_requirements(spec: &ContainerSpec) -> ResourceRequirements {
    let mut requests = BTreeMap::new();
    requests.insert(
        "cpu".to_string(),
        Quantity(format!("{}m", spec.cpu_millicores)),
    );
    requests.insert(
        "memory".to_string(),
        Quantity(format!("{}Mi", spec.memory_mib)),
    );
    if spec.accelerator_count > 0 {
        requests.insert(
            ACCELERATOR_RESOURCE_KEY.to_string(),
            Quantity(spec.accelerator_count.to_string()),
        );
    }
    ResourceRequirements {
        requests: Some(requests.clone()),
        limits: Some(requests),
        claims: None,
    }
}

fn to_container(spec: &ContainerSpec) -> Container {
    Container {
        name: spec.name.clone(),
        image: Some(spec.image.clone()),
        env: Some(
            spec.env
                .iter()
                .map(|(k, v)| EnvVar {
                    name: k.clone(),
                    value: Some(v.clone()),
                    value_from: None,
                })
                .collect(),
        ),
        ports: Some(
            spec.ports
                .iter()
                .map(|port| ContainerPort {
                    container_port: *port,
                    ..Default::default()
                })
                .collect(),
        ),
        resources: Some(to_resource_requirements(spec)),
        ..Default::default()
    }
}

fn workload_labels(deployment_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/name".to_string(), deployment_name.to_string());
    labels.insert("app.kubernetes.io/managed-by".to_string(), MANAGER.to_string());
    labels
}

fn to_deployment(manifest: &WorkloadManifest) -> Deployment {
    let labels = workload_labels(&manifest.deployment_name);
    let containers: Vec<Container> = manifest.containers.iter().map(to_container).collect();

    Deployment {
        metadata: ObjectMeta {
            name: Some(manifest.deployment_name.clone()),
            namespace: Some(manifest.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(manifest.replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers,
                    node_selector: Some(manifest.node_selector.clone().into_iter().collect()),
                    restart_policy: Some("Always".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn to_service(manifest: &WorkloadManifest) -> Service {
    let labels = workload_labels(&manifest.deployment_name);
    Service {
        metadata: ObjectMeta {
            name: Some(manifest.service_name.clone()),
            namespace: Some(manifest.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                port: manifest.service_port,
                target_port: Some(
                    k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(
                        manifest.service_port,
                    ),
                ),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn job_labels(job_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/name".to_string(), job_name.to_string());
    labels.insert("app.kubernetes.io/managed-by".to_string(), MANAGER.to_string());
    labels
}

fn to_job(manifest: &JobManifest) -> Job {
    let labels = job_labels(&manifest.job_name);
    let container = to_container(&manifest.container);

    Job {
        metadata: ObjectMeta {
            name: Some(manifest.job_name.clone()),
            namespace: Some(manifest.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    node_selector: Some(manifest.node_selector.clone().into_iter().collect()),
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn kube_err(context: &str, err: kube::Error) -> Error {
    Error::infrastructure(format!("{context}: {err}"))
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(
        err,
        kube::Error::Api(resp) if resp.code == 404
    )
}

#[async_trait]
impl ClusterHandle for KubeClusterHandle {
    async fn apply_workload(&self, manifest: &WorkloadManifest) -> Result<()> {
        let deployment = to_deployment(manifest);
        let service = to_service(manifest);
        let params = PatchParams::apply(MANAGER);

        self.deployments(&manifest.namespace)
            .patch(&manifest.deployment_name, &params, &Patch::Apply(&deployment))
            .await
            .map_err(|e| kube_err("applying deployment", e))?;

        self.services(&manifest.namespace)
            .patch(&manifest.service_name, &params, &Patch::Apply(&service))
            .await
            .map_err(|e| kube_err("applying service", e))?;

        Ok(())
    }

    async fn apply_job(&self, manifest: &JobManifest) -> Result<()> {
        let job = to_job(manifest);
        self.jobs(&manifest.namespace)
            .create(&PostParams::default(), &job)
            .await
            .map_err(|e| kube_err("creating job", e))?;
        Ok(())
    }

    async fn ready_replicas(&self, namespace: &str, deployment_name: &str) -> Result<i32> {
        let deployment = self
            .deployments(namespace)
            .get(deployment_name)
            .await
            .map_err(|e| kube_err("reading deployment status", e))?;
        Ok(deployment
            .status
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0))
    }

    async fn job_status(&self, namespace: &str, job_name: &str) -> Result<JobStatus> {
        let job = self
            .jobs(namespace)
            .get(job_name)
            .await
            .map_err(|e| kube_err("reading job status", e))?;
        let status = job.status.unwrap_or_default();

        if status.succeeded.unwrap_or(0) > 0 {
            return Ok(JobStatus::Complete);
        }
        if status.failed.unwrap_or(0) > 0 {
            let message = status
                .conditions
                .unwrap_or_default()
                .into_iter()
                .find(|c| c.type_ == "Failed")
                .and_then(|c| c.message)
                .unwrap_or_else(|| "job reported failed pods".to_string());
            return Ok(JobStatus::Failed { message });
        }
        Ok(JobStatus::Running)
    }

    async fn list_job_pods(&self, namespace: &str, job_name: &str) -> Result<Vec<String>> {
        let selector = format!("app.kubernetes.io/name={job_name}");
        let pods = self
            .pods(namespace)
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| kube_err("listing job pods", e))?;
        Ok(pods
            .items
            .into_iter()
            .filter_map(|pod| pod.metadata.name)
            .collect())
    }

    async fn pod_logs(&self, namespace: &str, pod_name: &str) -> Result<Vec<u8>> {
        let stream = self
            .pods(namespace)
            .log_stream(pod_name, &LogParams::default())
            .await
            .map_err(|e| kube_err("opening pod log stream", e))?;
        let chunks: Vec<bytes::Bytes> = stream
            .try_collect()
            .await
            .map_err(|e| kube_err("reading pod log stream", e))?;
        let mut buf = Vec::new();
        for chunk in chunks {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf)
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .deployments(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(kube_err("deleting deployment", e)),
        }
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .services(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(kube_err("deleting service", e)),
        }
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        let params = DeleteParams::background();
        match self.jobs(namespace).delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(kube_err("deleting job", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accelbench_core::cluster::ContainerSpec;

    fn sample_workload() -> WorkloadManifest {
        let mut node_selector = BTreeMap::new();
        node_selector.insert(
            "node.accelbench.io/instance-type".to_string(),
            "g5.xlarge".to_string(),
        );
        WorkloadManifest {
            namespace: "accelbench".to_string(),
            deployment_name: "bench-abc123".to_string(),
            service_name: "bench-abc123".to_string(),
            replicas: 1,
            node_selector,
            containers: vec![ContainerSpec {
                name: "model-server".to_string(),
                image: "accelbench/vllm-gpu:0.6.3".to_string(),
                env: vec![("MODEL_ID".to_string(), "meta-llama/Llama-3.1-8B".to_string())],
                ports: vec![8000],
                cpu_millicores: 3000,
                memory_mib: 13926,
                accelerator_count: 1,
            }],
            service_port: 8000,
            health_path: "/health".to_string(),
        }
    }

    #[test]
    fn deployment_carries_accelerator_resource_request() {
        let manifest = sample_workload();
        let deployment = to_deployment(&manifest);
        let container = &deployment.spec.unwrap().template.spec.unwrap().containers[0];
        let requests = container.resources.as_ref().unwrap().requests.as_ref().unwrap();
        assert_eq!(
            requests.get(ACCELERATOR_RESOURCE_KEY),
            Some(&Quantity("1".to_string()))
        );
    }

    #[test]
    fn service_targets_the_declared_port() {
        let manifest = sample_workload();
        let service = to_service(&manifest);
        let port = &service.spec.unwrap().ports.unwrap()[0];
        assert_eq!(port.port, 8000);
    }

    #[test]
    fn deployment_and_service_share_selector_labels() {
        let manifest = sample_workload();
        let deployment = to_deployment(&manifest);
        let service = to_service(&manifest);
        let dep_labels = deployment
            .spec
            .unwrap()
            .selector
            .match_labels
            .unwrap();
        let svc_selector = service.spec.unwrap().selector.unwrap();
        assert_eq!(dep_labels, svc_selector);
    }

    #[test]
    fn job_uses_restart_never_and_zero_backoff() {
        let mut node_selector = BTreeMap::new();
        node_selector.insert("node.accelbench.io/pool".to_string(), "system".to_string());
        let manifest = JobManifest {
            namespace: "accelbench".to_string(),
            job_name: "loadgen-abc123".to_string(),
            node_selector,
            container: ContainerSpec {
                name: "loadgen".to_string(),
                image: "accelbench/loadgen:latest".to_string(),
                env: vec![],
                ports: vec![],
                cpu_millicores: 2000,
                memory_mib: 2048,
                accelerator_count: 0,
            },
        };
        let job = to_job(&manifest);
        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(
            spec.template.spec.unwrap().restart_policy,
            Some("Never".to_string())
        );
    }
}
