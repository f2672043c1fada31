use axum::routing::get;
use axum::{Json, Router};
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use symproxy_service::metric;
use symproxy_service::service::SymbolService;
use tower::ServiceBuilder;

mod error;
mod listing;
mod metrics;
mod symbols;

pub use error::ResponseError;
use metrics::MetricsLayer;

use listing::list_symbols;
use symbols::get_symbol;

pub async fn healthcheck() -> Json<serde_json::Value> {
    metric!(counter("healthcheck") += 1);
    Json(serde_json::json!({ "status": "ok" }))
}

pub fn create_app(service: SymbolService) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(MetricsLayer);
    Router::new()
        .route("/symbols", get(list_symbols))
        .route(
            "/download/symbols/:module_name/:identifier/:file_name",
            get(get_symbol).head(get_symbol),
        )
        .route(
            "/:module_name/:identifier/:file_name",
            get(get_symbol).head(get_symbol),
        )
        .with_state(service)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/health", get(healthcheck))
}
