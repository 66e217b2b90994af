pub mod health;
pub mod match_handler;

use actix_web::web;
use std::sync::Arc;

use crate::service::{LeaderboardService, Reconciler};
use crate::store::DurableStore;

/// Shared handles for request handlers.
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
    pub leaderboard: Arc<LeaderboardService>,
    pub store: Arc<dyn DurableStore>,
}

/// Mount the read-only JSON surface under `/api`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/health", web::get().to(health::health_check))
            .route("/matches/{id}", web::get().to(match_handler::get_match))
            .route("/matches/{id}/results", web::get().to(match_handler::get_match_results))
            .route("/wallets/{address}/status", web::get().to(match_handler::get_wallet_status))
            .route("/leaderboard", web::get().to(match_handler::get_leaderboard)),
    );
}
