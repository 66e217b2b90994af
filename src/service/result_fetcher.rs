//! Settlement results lookup.
//!
//! The ledger exposes three read paths for the results of a finished match.
//! They are tried cheapest first:
//!
//! 1. bulk results keyed by match ids
//! 2. the single-match ranked leaderboard
//! 3. full match info, deriving placements from raw scores
//!
//! A side-check on recorded rewards runs first and decides how an overall
//! miss is reported: rewards already paid out means the results exist but are
//! not yet readable (`ResultsTemporarilyUnavailable`), otherwise the match is
//! still being settled (`ResultsPending`).

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::ledger_client::{classify_ledger_error, Ledger};
use super::request_queue::RequestQueue;
use super::result_cache::{keys, ResultCache};
use super::retry::Retrier;
use crate::engine_error::{EngineError, ErrorKind};
use crate::models::{
    FeeSchedule, LedgerPhase, MatchEntity, MatchId, MatchResult, MatchSnapshot, Provenance, Quantity,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    BatchResults,
    Leaderboard,
    MatchInfo,
}

impl Strategy {
    const CHAIN: [Strategy; 3] = [Strategy::BatchResults, Strategy::Leaderboard, Strategy::MatchInfo];

    fn label(&self) -> &'static str {
        match self {
            Strategy::BatchResults => "read_batch_results",
            Strategy::Leaderboard => "read_leaderboard",
            Strategy::MatchInfo => "read_match",
        }
    }
}

pub struct ResultFetcher {
    ledger: Arc<dyn Ledger>,
    cache: Arc<ResultCache>,
    queue: Arc<RequestQueue>,
    retrier: Retrier,
    fees: FeeSchedule,
}

impl ResultFetcher {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        cache: Arc<ResultCache>,
        queue: Arc<RequestQueue>,
        retrier: Retrier,
        fees: FeeSchedule,
    ) -> Self {
        Self {
            ledger,
            cache,
            queue,
            retrier,
            fees,
        }
    }

    /// One pass over the strategy chain. Cached results short-circuit it.
    pub async fn fetch_match_result(&self, id: MatchId) -> Result<Vec<MatchResult>, EngineError> {
        if let Some(entry) = self.cache.get::<Vec<MatchResult>>(&keys::match_results(id)).await {
            if entry.is_authoritative() && !entry.value.is_empty() {
                debug!(match_id = id, "Results served from cache");
                return Ok(entry.value);
            }
        }

        let distributed = self.rewards_distributed(id).await;
        let mut all_informative = true;
        let mut last_hard: Option<EngineError> = None;

        for strategy in Strategy::CHAIN {
            match self.run_strategy(id, strategy).await {
                Ok(results) if !results.is_empty() => match self.accept(id, &results).await {
                    Ok(()) => {
                        info!(
                            match_id = id,
                            strategy = strategy.label(),
                            placements = results.len(),
                            "Match results resolved"
                        );
                        self.cache
                            .set(
                                &keys::match_results(id),
                                &results,
                                Provenance::Authoritative,
                                self.cache.policy().completed,
                            )
                            .await;
                        return Ok(results);
                    }
                    Err(err) => {
                        warn!(match_id = id, strategy = strategy.label(), error = %err, "Rejected results");
                        all_informative = false;
                        last_hard = Some(err);
                    }
                },
                Ok(_) => {
                    debug!(match_id = id, strategy = strategy.label(), "No results yet");
                }
                Err(err) if err.kind == ErrorKind::ResultsPending => {
                    debug!(match_id = id, strategy = strategy.label(), "Results pending");
                }
                Err(err) => {
                    warn!(
                        match_id = id,
                        strategy = strategy.label(),
                        kind = %err.kind,
                        error = %err.message,
                        "Results strategy failed"
                    );
                    all_informative = false;
                    last_hard = Some(err);
                }
            }
        }

        let err = if distributed {
            EngineError::new(
                ErrorKind::ResultsTemporarilyUnavailable,
                "rewards were distributed but results are not readable yet",
            )
        } else if all_informative {
            EngineError::new(ErrorKind::ResultsPending, "match results are not computed yet")
        } else {
            last_hard.unwrap_or_else(|| EngineError::unknown("results lookup failed"))
        };
        Err(err.with_match(id))
    }

    /// Repeat the chain while the outcome is transient, under the retry policy.
    pub async fn fetch_until_ready(&self, id: MatchId) -> Result<Vec<MatchResult>, EngineError> {
        self.retrier
            .run_if(
                "fetch_match_result",
                || self.fetch_match_result(id),
                std::convert::identity,
                |kind| kind.is_transient(),
            )
            .await
    }

    /// Warm the results cache for many matches with one bulk read.
    /// Returns how many matches got results.
    pub async fn prefetch(&self, ids: &[MatchId]) -> Result<usize, EngineError> {
        let mut missing = Vec::new();
        for id in ids {
            if self.cache.get::<Vec<MatchResult>>(&keys::match_results(*id)).await.is_none() {
                missing.push(*id);
            }
        }
        missing.sort_unstable();
        missing.dedup();
        if missing.is_empty() {
            return Ok(0);
        }

        let key = format!(
            "batch_results_{}",
            missing.iter().map(|id| id.to_string()).collect::<Vec<_>>().join("_")
        );
        let ledger = self.ledger.clone();
        let request_ids = missing.clone();
        let batches = self
            .queue
            .schedule_retrying(
                &key,
                self.retrier.clone(),
                "read_batch_results",
                move || {
                    let ledger = ledger.clone();
                    let ids = request_ids.clone();
                    async move { ledger.read_batch_results(&ids).await }
                },
                classify_ledger_error,
            )
            .await?;

        let mut warmed = 0;
        for (id, results) in missing.iter().zip(batches) {
            if results.is_empty() || self.accept(*id, &results).await.is_err() {
                continue;
            }
            self.cache
                .set(
                    &keys::match_results(*id),
                    &results,
                    Provenance::Authoritative,
                    self.cache.policy().completed,
                )
                .await;
            warmed += 1;
        }
        info!(requested = missing.len(), warmed = warmed, "Results prefetched");
        Ok(warmed)
    }

    /// Whether any reward has been recorded as paid out. Failures count as "no".
    async fn rewards_distributed(&self, id: MatchId) -> bool {
        let key = keys::recorded_rewards(id);
        if let Some(entry) = self.cache.get::<Quantity>(&key).await {
            if !entry.value.is_zero() {
                return true;
            }
        }

        let ledger = self.ledger.clone();
        let outcome = self
            .queue
            .schedule_retrying(
                &key,
                self.retrier.clone(),
                "read_recorded_rewards",
                move || {
                    let ledger = ledger.clone();
                    async move { ledger.read_recorded_rewards(id).await }
                },
                classify_ledger_error,
            )
            .await;

        match outcome {
            Ok(amount) => {
                let policy = self.cache.policy();
                let ttl = if amount.is_zero() { policy.live } else { policy.completed };
                self.cache.set(&key, &amount, Provenance::Authoritative, ttl).await;
                !amount.is_zero()
            }
            Err(err) => {
                warn!(match_id = id, kind = %err.kind, "Reward side-check failed, assuming not distributed");
                false
            }
        }
    }

    async fn run_strategy(&self, id: MatchId, strategy: Strategy) -> Result<Vec<MatchResult>, EngineError> {
        let ledger = self.ledger.clone();
        let retrier = self.retrier.clone();

        match strategy {
            Strategy::BatchResults => {
                let batches = self
                    .queue
                    .schedule_retrying(
                        &format!("batch_results_{}", id),
                        retrier,
                        strategy.label(),
                        move || {
                            let ledger = ledger.clone();
                            async move { ledger.read_batch_results(&[id]).await }
                        },
                        classify_ledger_error,
                    )
                    .await?;
                Ok(batches.into_iter().next().unwrap_or_default())
            }
            Strategy::Leaderboard => {
                self.queue
                    .schedule_retrying(
                        &format!("leaderboard_results_{}", id),
                        retrier,
                        strategy.label(),
                        move || {
                            let ledger = ledger.clone();
                            async move { ledger.read_leaderboard(id).await }
                        },
                        classify_ledger_error,
                    )
                    .await
            }
            Strategy::MatchInfo => {
                let snapshot = self
                    .queue
                    .schedule_retrying(
                        &keys::match_info(id),
                        retrier,
                        strategy.label(),
                        move || {
                            let ledger = ledger.clone();
                            async move { ledger.read_match(id).await }
                        },
                        classify_ledger_error,
                    )
                    .await?;
                self.results_from_snapshot(&snapshot)
            }
        }
    }

    fn results_from_snapshot(&self, snapshot: &MatchSnapshot) -> Result<Vec<MatchResult>, EngineError> {
        if snapshot.phase != LedgerPhase::Ended {
            return Err(EngineError::new(
                ErrorKind::ResultsPending,
                format!("match {} has not ended", snapshot.id),
            ));
        }
        if !snapshot.results.is_empty() {
            return Ok(snapshot.results.clone());
        }
        if snapshot.participants.is_empty() {
            return Ok(Vec::new());
        }
        let pool = MatchEntity::from_snapshot(snapshot, &self.fees).prize_pool;
        Ok(self
            .fees
            .results_from_scores(snapshot.size, &snapshot.participants, pool))
    }

    /// Results must be well formed and, when the pool is known, not overpay it.
    async fn accept(&self, id: MatchId, results: &[MatchResult]) -> Result<(), EngineError> {
        let pool = self
            .cache
            .get::<MatchEntity>(&keys::match_info(id))
            .await
            .filter(|entry| entry.is_authoritative() && !entry.value.prize_pool.is_zero())
            .map(|entry| entry.value.prize_pool)
            .unwrap_or(Quantity::new(u128::MAX));

        FeeSchedule::validate_results(results, pool)
            .map_err(|reason| EngineError::unknown(format!("inconsistent results: {}", reason)).with_match(id))
    }
}
