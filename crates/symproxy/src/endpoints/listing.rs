use axum::Json;
use axum::extract::rejection::QueryRejection;
use axum::extract::{self, Query};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use symproxy_service::service::SymbolService;
use symproxy_service::tracking::CacheEntry;

use super::ResponseError;

/// Largest page size accepted by the listing.
const MAX_LIMIT: u64 = 1000;

fn default_limit() -> u64 {
    100
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    skip: u64,
    #[serde(default = "default_limit")]
    limit: u64,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    total: u64,
    skip: u64,
    limit: u64,
    entries: Vec<CacheEntry>,
}

pub async fn list_symbols(
    extract::State(service): extract::State<SymbolService>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<ListResponse>, ResponseError> {
    sentry::configure_scope(|scope| {
        scope.set_transaction(Some("GET /symbols"));
    });

    let Query(ListParams { skip, limit }) = params?;
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err((StatusCode::BAD_REQUEST, "limit must be between 1 and 1000").into());
    }

    let total = service.count_entries().await?;
    let entries = service.list_entries(skip, limit).await?;

    Ok(Json(ListResponse {
        total,
        skip,
        limit,
        entries,
    }))
}
