use actix_web::{web, HttpResponse, Result};
use tracing::warn;

use super::AppState;
use crate::store;

/// Liveness plus durable tier status. A failing durable tier degrades the
/// engine to fast-tier caching, so it is reported rather than failed.
pub async fn health_check(state: web::Data<AppState>) -> Result<HttpResponse> {
    let cache = match store::health_check(state.store.as_ref()).await {
        Ok(()) => "ok",
        Err(err) => {
            warn!(error = %err, "Durable cache tier unreachable");
            "degraded"
        }
    };

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "cache": cache,
        "tracked_matches": state.reconciler.tracked_ids().len(),
        "cached_entries": state.reconciler.cache().len(),
    })))
}
