use actix_web::{web, HttpResponse, Responder};
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use super::AppState;
use crate::api_error::ApiError;
use crate::models::{
    Eligibility, LeaderboardFilters, LifecycleState, MatchId, SortKey, TimeWindow, WalletMatchStatus,
};

// =============================================================================
// MATCHES
// =============================================================================

/// GET /api/matches/{id}
/// Current view of a match, provisional state included
pub async fn get_match(
    state: web::Data<AppState>,
    path: web::Path<MatchId>,
) -> Result<impl Responder, ApiError> {
    let match_id = path.into_inner();
    let view = state.reconciler.get_match(match_id).await?;
    Ok(HttpResponse::Ok().json(view))
}

/// GET /api/matches/{id}/results
/// Final results. While the match is settling every read path is retried
/// under the retry policy; a miss reports `attempts` and `retry_after_ms`.
pub async fn get_match_results(
    state: web::Data<AppState>,
    path: web::Path<MatchId>,
) -> Result<impl Responder, ApiError> {
    let match_id = path.into_inner();
    let view = state.reconciler.get_match(match_id).await?;
    if let Some(confirmed) = view.confirmed() {
        if confirmed.lifecycle_state == LifecycleState::Completed {
            return Ok(HttpResponse::Ok().json(&confirmed.results));
        }
    }

    info!(match_id = match_id, "Results requested before completion, fetching");
    let results = state.reconciler.fetcher().fetch_until_ready(match_id).await?;
    let view = state.reconciler.apply_results(match_id, results).await?;
    Ok(HttpResponse::Ok().json(&view.entity().results))
}

// =============================================================================
// WALLETS
// =============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct WalletPath {
    #[validate(length(equal = 42), custom(function = "crate::models::validate_wallet"))]
    pub address: String,
}

#[derive(Debug, Serialize)]
pub struct WalletStatusResponse {
    pub address: String,
    pub status: WalletMatchStatus,
    pub can_create: Eligibility,
}

/// GET /api/wallets/{address}/status
pub async fn get_wallet_status(
    state: web::Data<AppState>,
    path: web::Path<WalletPath>,
) -> Result<impl Responder, ApiError> {
    let wallet = path.into_inner();
    wallet
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let status = state.reconciler.wallet_status(&wallet.address).await;
    let can_create = state.reconciler.can_create(&wallet.address).await;
    Ok(HttpResponse::Ok().json(WalletStatusResponse {
        address: wallet.address,
        status,
        can_create,
    }))
}

// =============================================================================
// LEADERBOARD
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct LeaderboardQuery {
    pub window: Option<TimeWindow>,
    pub min_matches: Option<u32>,
    pub sort: Option<SortKey>,
}

impl From<LeaderboardQuery> for LeaderboardFilters {
    fn from(query: LeaderboardQuery) -> Self {
        let defaults = LeaderboardFilters::default();
        LeaderboardFilters {
            window: query.window.unwrap_or(defaults.window),
            min_matches: query.min_matches.unwrap_or(defaults.min_matches),
            sort: query.sort.unwrap_or(defaults.sort),
        }
    }
}

/// GET /api/leaderboard?window=&min_matches=&sort=
pub async fn get_leaderboard(
    state: web::Data<AppState>,
    query: web::Query<LeaderboardQuery>,
) -> Result<impl Responder, ApiError> {
    let filters = LeaderboardFilters::from(query.into_inner());
    let entries = state.leaderboard.leaderboard(&filters).await;
    Ok(HttpResponse::Ok().json(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::http::{configure, health};
    use crate::models::{LedgerPhase, MatchResult, MatchSnapshot, Participant, Quantity, SizeClass};
    use crate::service::mock_ledger::*;
    use crate::service::{LeaderboardService, Reconciler};
    use crate::store::MemoryStore;
    use actix_web::{test as actix_test, App};
    use chrono::Utc;
    use std::sync::Arc;

    fn wallet(n: u8) -> String {
        format!("0x{:040x}", n)
    }

    fn ended_snapshot(id: MatchId) -> MatchSnapshot {
        MatchSnapshot {
            id,
            size: SizeClass::TwoPlayer,
            phase: LedgerPhase::Ended,
            participants: vec![
                Participant {
                    wallet: wallet(1),
                    entity_id: 1,
                    boost: 0,
                    score: Quantity::from(40u64),
                },
                Participant {
                    wallet: wallet(2),
                    entity_id: 2,
                    boost: 0,
                    score: Quantity::from(25u64),
                },
            ],
            started_at: Some(Utc::now()),
            prize_pool: Some(Quantity::native(2)),
            results: Vec::new(),
            block_number: Some(10),
            ledger_time: None,
        }
    }

    fn create_test_state() -> (web::Data<AppState>, Arc<MockLedger>, Arc<Reconciler>) {
        let ledger = Arc::new(MockLedger::new());
        let reconciler = create_test_reconciler(ledger.clone(), Arc::new(ManualClock::new(Utc::now())));
        let state = web::Data::new(AppState {
            reconciler: reconciler.clone(),
            leaderboard: Arc::new(LeaderboardService::new(reconciler.clone())),
            store: Arc::new(MemoryStore::new()),
        });
        (state, ledger, reconciler)
    }

    #[test]
    fn test_leaderboard_query_defaults() {
        let filters = LeaderboardFilters::from(LeaderboardQuery {
            min_matches: Some(3),
            ..LeaderboardQuery::default()
        });
        assert_eq!(filters.window, TimeWindow::All);
        assert_eq!(filters.sort, SortKey::Score);
        assert_eq!(filters.min_matches, 3);
    }

    #[actix_web::test]
    async fn test_results_endpoint_completes_settling_match() {
        let (state, ledger, reconciler) = create_test_state();
        ledger.set_match(ended_snapshot(5));
        ledger.fail_always(READ_BATCH_RESULTS, pending());
        ledger.set_leaderboard(
            5,
            vec![MatchResult {
                wallet: wallet(1),
                position: 1,
                score: Quantity::from(40u64),
                reward: Quantity::native(1),
            }],
        );

        let app = actix_test::init_service(App::new().app_data(state).configure(configure)).await;
        let req = actix_test::TestRequest::get().uri("/api/matches/5/results").to_request();
        let body: Vec<MatchResult> = actix_test::call_and_read_body_json(&app, req).await;

        assert_eq!(body.len(), 1);
        assert_eq!(body[0].wallet, wallet(1));
        assert_eq!(
            reconciler.peek_match(5).unwrap().state(),
            LifecycleState::Completed
        );
    }

    #[actix_web::test]
    async fn test_results_endpoint_waits_out_settlement_lag() {
        let (state, ledger, reconciler) = create_test_state();
        let mut snapshot = ended_snapshot(6);
        snapshot.participants.clear();
        ledger.set_match(snapshot);
        ledger.set_recorded_rewards(6, Quantity::native(2));
        ledger.fail_times(READ_BATCH_RESULTS, 2, pending());
        ledger.set_batch_results(
            6,
            vec![MatchResult {
                wallet: wallet(1),
                position: 1,
                score: Quantity::from(40u64),
                reward: Quantity::native(1),
            }],
        );

        let app = actix_test::init_service(App::new().app_data(state).configure(configure)).await;
        let req = actix_test::TestRequest::get().uri("/api/matches/6/results").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 200);

        let body: Vec<MatchResult> = actix_test::read_body_json(resp).await;
        assert_eq!(body.len(), 1);
        assert_eq!(ledger.calls(READ_BATCH_RESULTS), 3);
        assert_eq!(
            reconciler.peek_match(6).unwrap().state(),
            LifecycleState::Completed
        );
    }

    #[actix_web::test]
    async fn test_results_endpoint_reports_retry_hint() {
        let (state, ledger, _reconciler) = create_test_state();
        let mut snapshot = ended_snapshot(7);
        snapshot.participants.clear();
        ledger.set_match(snapshot);
        ledger.set_recorded_rewards(7, Quantity::native(2));
        ledger.fail_always(READ_BATCH_RESULTS, pending());

        let app = actix_test::init_service(App::new().app_data(state).configure(configure)).await;
        let req = actix_test::TestRequest::get().uri("/api/matches/7/results").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 503);

        let body: serde_json::Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["kind"], "results_temporarily_unavailable");
        assert_eq!(body["match_id"], 7);
        assert_eq!(body["attempts"], 3);
        assert!(body["retry_after_ms"].is_u64());
    }

    #[actix_web::test]
    async fn test_unknown_match_is_not_found() {
        let (state, _ledger, _reconciler) = create_test_state();
        let app = actix_test::init_service(App::new().app_data(state).configure(configure)).await;

        let req = actix_test::TestRequest::get().uri("/api/matches/404").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 404);
    }

    #[actix_web::test]
    async fn test_wallet_status_rejects_malformed_address() {
        let (state, _ledger, _reconciler) = create_test_state();
        let app = actix_test::init_service(App::new().app_data(state).configure(configure)).await;

        let req = actix_test::TestRequest::get().uri("/api/wallets/not-a-wallet/status").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 400);

        let req = actix_test::TestRequest::get()
            .uri(&format!("/api/wallets/{}/status", wallet(9)))
            .to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["can_create"]["allowed"], true);
        assert!(body["status"]["active_match_id"].is_null());
    }

    #[actix_web::test]
    async fn test_health_reports_cache_status() {
        let (state, _ledger, _reconciler) = create_test_state();
        let app = actix_test::init_service(
            App::new()
                .app_data(state)
                .route("/health", web::get().to(health::health_check)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["cache"], "ok");
    }
}
