// Copyright (c) 2025 AccelBench Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::error::ApiError;
use crate::AppState;
use accelbench_core::cluster::ClusterHandle;
use accelbench_core::domain::{AcceleratorType, CatalogEntry};
use accelbench_core::repository::{CatalogFilter, CatalogSortKey, Page, Repository, SortOrder};
use accelbench_core::Error;
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct CatalogQuery {
    pub model: Option<String>,
    pub model_family: Option<String>,
    pub instance_family: Option<String>,
    pub accelerator_type: Option<String>,
    pub sort: Option<String>,
    pub order: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CatalogResponse {
    pub entries: Vec<CatalogEntry>,
    pub total: i64,
}

pub async fn list_catalog<C: ClusterHandle + 'static, R: Repository + 'static>(
    State(state): State<AppState<C, R>>,
    Query(query): Query<CatalogQuery>,
) -> Result<Json<CatalogResponse>, ApiError> {
    let accelerator_type = query
        .accelerator_type
        .as_deref()
        .map(|s| {
            AcceleratorType::parse(s)
                .ok_or_else(|| Error::validation(format!("unknown accelerator_type {s:?}")))
        })
        .transpose()?;

    let sort = query
        .sort
        .as_deref()
        .map(|s| CatalogSortKey::parse(s).ok_or_else(|| Error::validation(format!("unknown sort key {s:?}"))))
        .transpose()?;

    let order = match query.order.as_deref() {
        None | Some("desc") => SortOrder::Desc,
        Some("asc") => SortOrder::Asc,
        Some(other) => return Err(Error::validation(format!("unknown order {other:?}")).into()),
    };

    let filter = CatalogFilter {
        model_hf_id: query.model,
        model_family: query.model_family,
        instance_family: query.instance_family,
        accelerator_type,
        sort,
        order,
    };

    let page = Page {
        limit: query.limit.unwrap_or(50),
        offset: query.offset.unwrap_or(0),
    }
    .clamp_catalog();

    let entries = state.repository.list_catalog(&filter, page).await?;
    let total = state.repository.count_catalog(&filter).await?;
    Ok(Json(CatalogResponse { entries, total }))
}
