// Copyright (c) 2025 AccelBench Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::error::ApiError;
use crate::AppState;
use accelbench_core::cluster::ClusterHandle;
use accelbench_core::domain::Pricing;
use accelbench_core::repository::Repository;
use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

const DEFAULT_REGION: &str = "us-east-2";

#[derive(Debug, Deserialize)]
pub struct PricingQuery {
    pub region: Option<String>,
}

pub async fn list_pricing<C: ClusterHandle + 'static, R: Repository + 'static>(
    State(state): State<AppState<C, R>>,
    Query(query): Query<PricingQuery>,
) -> Result<Json<Vec<Pricing>>, ApiError> {
    let region = query.region.as_deref().unwrap_or(DEFAULT_REGION);
    let rows = state.repository.list_pricing(region).await?;
    Ok(Json(rows))
}
