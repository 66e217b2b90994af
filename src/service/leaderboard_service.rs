use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use super::reconciler::Reconciler;
use super::result_cache::keys;
use crate::models::{
    normalize_wallet, LeaderboardEntry, LeaderboardFilters, LifecycleState, MatchEntity, Provenance, SortKey,
};

/// Rank players over completed matches.
///
/// Matches are folded in id order and each id at most once, so the same
/// input always yields the same ranking. Only completed matches with results
/// count; windowed queries skip matches without a start time.
pub fn compute(matches: &[MatchEntity], filters: &LeaderboardFilters, now: DateTime<Utc>) -> Vec<LeaderboardEntry> {
    let cutoff = filters.window.span().map(|span| now - span);

    let mut ordered: Vec<&MatchEntity> = matches
        .iter()
        .filter(|m| m.lifecycle_state == LifecycleState::Completed && !m.results.is_empty())
        .filter(|m| match cutoff {
            Some(cutoff) => m.started_at.map_or(false, |started| started >= cutoff),
            None => true,
        })
        .collect();
    ordered.sort_by_key(|m| m.id);

    let mut seen = BTreeSet::new();
    let mut players: BTreeMap<String, LeaderboardEntry> = BTreeMap::new();
    for entity in ordered {
        if !seen.insert(entity.id) {
            continue;
        }
        for result in &entity.results {
            let address = normalize_wallet(&result.wallet);
            players
                .entry(address.clone())
                .or_insert_with(|| LeaderboardEntry::new(address))
                .record(result.position, result.score, result.reward);
        }
    }

    let mut entries: Vec<LeaderboardEntry> = players
        .into_values()
        .filter(|entry| entry.matches_played >= filters.min_matches)
        .collect();

    match filters.sort {
        SortKey::Score => entries.sort_by(|a, b| b.aggregate_score.cmp(&a.aggregate_score)),
        SortKey::Rewards => entries.sort_by(|a, b| b.aggregate_rewards.cmp(&a.aggregate_rewards)),
        SortKey::WinRate => entries.sort_by(|a, b| {
            b.win_rate
                .partial_cmp(&a.win_rate)
                .unwrap_or(Ordering::Equal)
        }),
    }

    for (index, entry) in entries.iter_mut().enumerate() {
        entry.rank = index as u32 + 1;
    }
    entries
}

/// Leaderboard over the reconciler's completed matches, cached per filter set.
pub struct LeaderboardService {
    reconciler: Arc<Reconciler>,
}

impl LeaderboardService {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }

    pub async fn leaderboard(&self, filters: &LeaderboardFilters) -> Vec<LeaderboardEntry> {
        let cache = self.reconciler.cache();
        let key = keys::leaderboard(filters);
        if let Some(entry) = cache.get::<Vec<LeaderboardEntry>>(&key).await {
            return entry.value;
        }

        self.reconciler.restore_completed().await;
        let matches = self.reconciler.completed_matches();
        let entries = compute(&matches, filters, self.reconciler.now());
        debug!(
            key = %key,
            matches = matches.len(),
            players = entries.len(),
            "Leaderboard recomputed"
        );
        cache
            .set(&key, &entries, Provenance::Authoritative, cache.policy().leaderboard)
            .await;
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{MatchResult, Quantity, SizeClass, TimeWindow};
    use crate::service::mock_ledger::{create_test_reconciler, MockLedger};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 20, 9, 0, 0).unwrap()
    }

    fn result(wallet: &str, position: u32, score: u64, reward: u64) -> MatchResult {
        MatchResult {
            wallet: wallet.to_string(),
            position,
            score: Quantity::from(score),
            reward: Quantity::native(reward),
        }
    }

    fn completed(id: u64, started_at: Option<DateTime<Utc>>, results: Vec<MatchResult>) -> MatchEntity {
        let mut entity = MatchEntity::new(id, SizeClass::TwoPlayer);
        entity.started_at = started_at;
        entity.prize_pool = Quantity::native(2);
        entity.complete_with(results);
        entity
    }

    fn create_test_matches() -> Vec<MatchEntity> {
        vec![
            completed(1, Some(now() - Duration::hours(2)), vec![result("0xA", 1, 50, 2), result("0xb", 2, 30, 0)]),
            completed(2, Some(now() - Duration::days(3)), vec![result("0xb", 1, 70, 2), result("0xa", 2, 10, 0)]),
            completed(3, None, vec![result("0xc", 1, 90, 2), result("0xa", 2, 20, 0)]),
        ]
    }

    #[test]
    fn test_compute_is_deterministic() {
        let matches = create_test_matches();
        let filters = LeaderboardFilters::default();

        let first = serde_json::to_string(&compute(&matches, &filters, now())).unwrap();
        let second = serde_json::to_string(&compute(&matches, &filters, now())).unwrap();
        assert_eq!(first, second);

        let mut reversed = matches.clone();
        reversed.reverse();
        let third = serde_json::to_string(&compute(&reversed, &filters, now())).unwrap();
        assert_eq!(first, third);
    }

    #[test]
    fn test_aggregates_across_matches() {
        let entries = compute(&create_test_matches(), &LeaderboardFilters::default(), now());

        let a = entries.iter().find(|e| e.address == "0xa").unwrap();
        assert_eq!(a.matches_played, 3);
        assert_eq!(a.wins, 1);
        assert_eq!(a.aggregate_score, Quantity::from(80u64));
        assert_eq!(a.best_score, Quantity::from(50u64));
        assert!((a.average_position - 5.0 / 3.0).abs() < 1e-9);

        assert_eq!(entries[0].rank, 1);
        assert_eq!(entries[0].address, "0xb");
        assert_eq!(entries.last().unwrap().rank as usize, entries.len());
    }

    #[test]
    fn test_duplicate_matches_count_once() {
        let mut matches = create_test_matches();
        matches.push(matches[0].clone());

        let entries = compute(&matches, &LeaderboardFilters::default(), now());
        let a = entries.iter().find(|e| e.address == "0xa").unwrap();
        assert_eq!(a.matches_played, 3);
    }

    #[test]
    fn test_window_excludes_old_and_undated_matches() {
        let filters = LeaderboardFilters {
            window: TimeWindow::Day,
            ..LeaderboardFilters::default()
        };
        let entries = compute(&create_test_matches(), &filters, now());

        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.matches_played == 1));
        assert!(entries.iter().all(|e| e.address != "0xc"));
    }

    #[test]
    fn test_min_matches_and_win_rate_sort() {
        let filters = LeaderboardFilters {
            min_matches: 2,
            sort: SortKey::WinRate,
            ..LeaderboardFilters::default()
        };
        let entries = compute(&create_test_matches(), &filters, now());

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].address, "0xb");
        assert_eq!(entries[0].win_rate, 0.5);
        assert_eq!(entries[1].address, "0xa");
    }

    #[test]
    fn test_incomplete_matches_are_ignored() {
        let mut open = MatchEntity::new(9, SizeClass::TwoPlayer);
        open.lifecycle_state = LifecycleState::Settling;
        assert!(compute(&[open], &LeaderboardFilters::default(), now()).is_empty());
    }

    #[tokio::test]
    async fn test_service_caches_output() {
        let ledger = Arc::new(MockLedger::new());
        let clock = Arc::new(ManualClock::new(now()));
        let reconciler = create_test_reconciler(ledger, clock.clone());
        let service = LeaderboardService::new(reconciler.clone());
        let filters = LeaderboardFilters::default();

        assert!(service.leaderboard(&filters).await.is_empty());
        let cached = reconciler
            .cache()
            .get::<Vec<LeaderboardEntry>>(&keys::leaderboard(&filters))
            .await
            .unwrap();
        assert_eq!(cached.ttl, reconciler.cache().policy().leaderboard);
    }
}
