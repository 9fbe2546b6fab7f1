// Copyright (c) 2025 AccelBench Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Benchmark orchestration core for AccelBench.
//!
//! This crate owns the domain model, the error taxonomy, the manifest
//! renderer, the metrics pipeline, the serving scraper, the cancellation
//! registry, the lifecycle state machine, and the `Repository`/
//! `ClusterHandle` ports that concrete adapters implement. It has no
//! dependency on any specific database or cluster API.

pub mod cancellation;
pub mod cluster;
pub mod domain;
pub mod error;
pub mod manifest;
pub mod metrics;
pub mod orchestrator;
pub mod repository;
pub mod scraper;

pub use cancellation::CancellationRegistry;
pub use cluster::ClusterHandle;
pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use repository::Repository;
