//! Match lifecycle reconciliation.
//!
//! Every tracked match keeps its last confirmed ledger state apart from any
//! provisional state applied locally after a submission. Authoritative data
//! always wins: it confirms or discards the provisional state, and it is
//! itself rejected when older than what is already known.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

use super::ledger_client::{classify_ledger_error, Ledger, LedgerError};
use super::request_queue::RequestQueue;
use super::result_cache::{keys, ResultCache};
use super::result_fetcher::ResultFetcher;
use super::retry::Retrier;
use crate::clock::Clock;
use crate::engine_error::{EngineError, ErrorKind};
use crate::models::{
    normalize_wallet, CreateMatchRequest, Eligibility, FeeSchedule, JoinMatchRequest, LifecycleState,
    MatchActionRequest, MatchEntity, MatchId, MatchResult, MatchSnapshot, Participant, Provenance,
    PurchaseBoostsRequest, Quantity, SizeClass, TxHandle, WalletMatchStatus,
};

const CHANGE_CAPACITY: usize = 256;

/// Confirmed or provisional state of a match.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "provenance", rename_all = "lowercase")]
pub enum Tracked {
    Authoritative(MatchEntity),
    Optimistic {
        provisional: MatchEntity,
        prior: Option<MatchEntity>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchView {
    #[serde(flatten)]
    pub tracked: Tracked,
    /// Duration elapsed locally; not confirmed by the ledger.
    pub derived_settling: bool,
}

impl MatchView {
    fn authoritative(entity: MatchEntity) -> Self {
        Self {
            tracked: Tracked::Authoritative(entity),
            derived_settling: false,
        }
    }

    pub fn entity(&self) -> &MatchEntity {
        match &self.tracked {
            Tracked::Authoritative(entity) => entity,
            Tracked::Optimistic { provisional, .. } => provisional,
        }
    }

    pub fn confirmed(&self) -> Option<&MatchEntity> {
        match &self.tracked {
            Tracked::Authoritative(entity) => Some(entity),
            Tracked::Optimistic { prior, .. } => prior.as_ref(),
        }
    }

    pub fn provenance(&self) -> Provenance {
        match self.tracked {
            Tracked::Authoritative(_) => Provenance::Authoritative,
            Tracked::Optimistic { .. } => Provenance::Optimistic,
        }
    }

    /// State to display, with locally derived settling applied.
    pub fn state(&self) -> LifecycleState {
        let state = self.entity().lifecycle_state;
        if self.derived_settling && state == LifecycleState::Active {
            LifecycleState::Settling
        } else {
            state
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Confirmed,
    Completed,
    Optimistic,
    RolledBack,
    DerivedSettling,
    Reverted,
}

/// Notification published whenever a tracked match changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchChange {
    pub match_id: MatchId,
    pub state: LifecycleState,
    pub provenance: Provenance,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingAction {
    Join { wallet: String },
    Start,
    Settle,
}

impl PendingAction {
    fn label(&self) -> &'static str {
        match self {
            PendingAction::Join { .. } => "join",
            PendingAction::Start => "start",
            PendingAction::Settle => "settle",
        }
    }

    fn fulfilled_by(&self, entity: &MatchEntity) -> bool {
        match self {
            PendingAction::Join { wallet } => entity.has_participant(wallet),
            PendingAction::Start => entity.lifecycle_state >= LifecycleState::Active,
            PendingAction::Settle => entity.lifecycle_state >= LifecycleState::Settling,
        }
    }
}

#[derive(Debug, Clone)]
struct OptimisticUpdate {
    id: Uuid,
    action: PendingAction,
    provisional: MatchEntity,
    wallet_prior: Option<(String, Option<WalletMatchStatus>)>,
}

#[derive(Debug, Clone)]
struct MatchRecord {
    confirmed: Option<MatchEntity>,
    optimistic: Option<OptimisticUpdate>,
    derived_settling: bool,
    block: Option<u64>,
    /// Ledger time minus local time at the last snapshot that carried one.
    clock_skew: Duration,
}

impl MatchRecord {
    fn empty() -> Self {
        Self {
            confirmed: None,
            optimistic: None,
            derived_settling: false,
            block: None,
            clock_skew: Duration::zero(),
        }
    }

    fn view(&self) -> Option<MatchView> {
        let tracked = match (&self.optimistic, &self.confirmed) {
            (Some(update), prior) => Tracked::Optimistic {
                provisional: update.provisional.clone(),
                prior: prior.clone(),
            },
            (None, Some(confirmed)) => Tracked::Authoritative(confirmed.clone()),
            (None, None) => return None,
        };
        Some(MatchView {
            tracked,
            derived_settling: self.derived_settling,
        })
    }

    fn stale_reason(&self, incoming: &MatchEntity, block: Option<u64>) -> Option<&'static str> {
        if let (Some(new), Some(known)) = (block, self.block) {
            if new < known {
                return Some("older block");
            }
        }
        match &self.confirmed {
            Some(confirmed) if incoming.lifecycle_state < confirmed.lifecycle_state => {
                Some("lifecycle regression")
            }
            _ => None,
        }
    }
}

pub struct Reconciler {
    ledger: Arc<dyn Ledger>,
    cache: Arc<ResultCache>,
    queue: Arc<RequestQueue>,
    fetcher: Arc<ResultFetcher>,
    retrier: Retrier,
    fees: FeeSchedule,
    clock: Arc<dyn Clock>,
    match_duration: Duration,
    records: Mutex<HashMap<MatchId, MatchRecord>>,
    wallets: Mutex<HashMap<String, WalletMatchStatus>>,
    completed: Mutex<BTreeSet<MatchId>>,
    changes: broadcast::Sender<MatchChange>,
}

impl Reconciler {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        cache: Arc<ResultCache>,
        queue: Arc<RequestQueue>,
        retrier: Retrier,
        fees: FeeSchedule,
        clock: Arc<dyn Clock>,
        match_duration: Duration,
    ) -> Self {
        let fetcher = Arc::new(ResultFetcher::new(
            ledger.clone(),
            cache.clone(),
            queue.clone(),
            retrier.clone(),
            fees.clone(),
        ));
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);

        Self {
            ledger,
            cache,
            queue,
            fetcher,
            retrier,
            fees,
            clock,
            match_duration,
            records: Mutex::new(HashMap::new()),
            wallets: Mutex::new(HashMap::new()),
            completed: Mutex::new(BTreeSet::new()),
            changes,
        }
    }

    pub fn fetcher(&self) -> &Arc<ResultFetcher> {
        &self.fetcher
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn fees(&self) -> &FeeSchedule {
        &self.fees
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MatchChange> {
        self.changes.subscribe()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<MatchId, MatchRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wallets(&self) -> MutexGuard<'_, HashMap<String, WalletMatchStatus>> {
        self.wallets.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn completed_ids(&self) -> MutexGuard<'_, BTreeSet<MatchId>> {
        self.completed.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, changes: Vec<MatchChange>) {
        for change in changes {
            debug!(match_id = change.match_id, kind = ?change.kind, state = ?change.state, "Match changed");
            // No subscribers is fine.
            let _ = self.changes.send(change);
        }
    }

    fn change(view: &MatchView, match_id: MatchId, kind: ChangeKind) -> MatchChange {
        MatchChange {
            match_id,
            state: view.state(),
            provenance: view.provenance(),
            kind,
        }
    }

    /// Last known state without touching the ledger.
    pub fn peek_match(&self, id: MatchId) -> Option<MatchView> {
        self.records().get(&id).and_then(MatchRecord::view)
    }

    pub fn tracked_ids(&self) -> Vec<MatchId> {
        let mut ids: Vec<MatchId> = self.records().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Tracked matches that can still change.
    pub fn unsettled_ids(&self) -> Vec<MatchId> {
        let mut ids: Vec<MatchId> = self
            .records()
            .iter()
            .filter(|(_, record)| {
                record.optimistic.is_some()
                    || record
                        .confirmed
                        .as_ref()
                        .map_or(true, |m| !m.lifecycle_state.is_terminal())
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Confirmed completed matches. Provisional state is never included.
    pub fn completed_matches(&self) -> Vec<MatchEntity> {
        let mut matches: Vec<MatchEntity> = self
            .records()
            .values()
            .filter_map(|record| record.confirmed.clone())
            .filter(|m| m.lifecycle_state == LifecycleState::Completed && !m.results.is_empty())
            .collect();
        matches.sort_by_key(|m| m.id);
        matches
    }

    /// Record a completed match in the durable index so a restarted
    /// process can find it again.
    async fn index_completed(&self, id: MatchId) {
        let ids: Vec<MatchId> = {
            let mut completed = self.completed_ids();
            if !completed.insert(id) {
                return;
            }
            completed.iter().copied().collect()
        };
        self.cache
            .set(
                &keys::completed_index(),
                &ids,
                Provenance::Authoritative,
                self.cache.policy().completed,
            )
            .await;
    }

    /// Track every completed match listed in the durable index whose state
    /// is still cached. Returns how many were picked up.
    pub async fn restore_completed(&self) -> usize {
        let indexed = match self.cache.get::<Vec<MatchId>>(&keys::completed_index()).await {
            Some(entry) => entry.value,
            None => return 0,
        };
        self.completed_ids().extend(indexed.iter().copied());

        let mut restored = 0;
        for id in indexed {
            if self.seed_from_cache(id).await {
                restored += 1;
            }
        }
        if restored > 0 {
            info!(restored = restored, "Completed matches restored from cache");
        }
        restored
    }

    /// Adopt a cached authoritative entity for a match not tracked yet.
    async fn seed_from_cache(&self, id: MatchId) -> bool {
        if self.records().contains_key(&id) {
            return false;
        }
        let entry = match self.cache.get::<MatchEntity>(&keys::match_info(id)).await {
            Some(entry) if entry.is_authoritative() => entry,
            _ => return false,
        };
        let mut records = self.records();
        if records.contains_key(&id) {
            return false;
        }
        debug!(match_id = id, "Seeding match from cache");
        let mut record = MatchRecord::empty();
        record.confirmed = Some(entry.value);
        records.insert(id, record);
        true
    }

    /// Cached state when fresh, otherwise an authoritative refresh.
    pub async fn get_match(&self, id: MatchId) -> Result<MatchView, EngineError> {
        self.seed_from_cache(id).await;
        if self.cache.get::<MatchEntity>(&keys::match_info(id)).await.is_some() {
            if let Some(view) = self.peek_match(id) {
                return Ok(view);
            }
        }
        self.refresh_match(id).await
    }

    async fn read_snapshot(&self, id: MatchId) -> Result<MatchSnapshot, EngineError> {
        let ledger = self.ledger.clone();
        self.queue
            .schedule_retrying(
                &keys::match_info(id),
                self.retrier.clone(),
                "read_match",
                move || {
                    let ledger = ledger.clone();
                    async move { ledger.read_match(id).await }
                },
                classify_ledger_error,
            )
            .await
            .map_err(|e| e.with_match(id))
    }

    /// Read the match from the ledger and fold it in. A match that has ended
    /// also gets its results looked up. On failure the known state is kept.
    pub async fn refresh_match(&self, id: MatchId) -> Result<MatchView, EngineError> {
        let snapshot = match self.read_snapshot(id).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(
                    match_id = id,
                    kind = %err.kind,
                    attempts = err.attempts,
                    "Match refresh failed, keeping last known state"
                );
                return Err(err);
            }
        };

        let view = self.apply_snapshot(snapshot).await;
        let ended = view.provenance() == Provenance::Authoritative
            && view.entity().lifecycle_state == LifecycleState::Settling;
        if !ended {
            return Ok(view);
        }

        match self.fetcher.fetch_match_result(id).await {
            Ok(results) => self.apply_results(id, results).await,
            Err(err) => {
                debug!(match_id = id, kind = %err.kind, "Results not available yet");
                Ok(view)
            }
        }
    }

    pub async fn invalidate_and_refresh(&self, id: MatchId) -> Result<MatchView, EngineError> {
        self.cache.invalidate(&keys::match_info(id)).await;
        self.refresh_match(id).await
    }

    /// Fold an authoritative snapshot into the tracked state.
    pub async fn apply_snapshot(&self, snapshot: MatchSnapshot) -> MatchView {
        let id = snapshot.id;
        self.seed_from_cache(id).await;

        let now = self.clock.now();
        let mut incoming = MatchEntity::from_snapshot(&snapshot, &self.fees);
        if incoming.lifecycle_state == LifecycleState::Completed {
            if let Err(reason) = FeeSchedule::validate_results(&incoming.results, payout_ceiling(&incoming)) {
                warn!(match_id = id, reason = %reason, "Snapshot results inconsistent, keeping match settling");
                incoming.results.clear();
                incoming.lifecycle_state = LifecycleState::Settling;
            }
        }
        let mut changes = Vec::new();
        let mut wallet_writes = Vec::new();

        let (view, accepted) = {
            let mut records = self.records();
            let record = records.entry(id).or_insert_with(MatchRecord::empty);

            if let Some(reason) = record.stale_reason(&incoming, snapshot.block_number) {
                debug!(
                    match_id = id,
                    reason = reason,
                    incoming = ?incoming.lifecycle_state,
                    "Ignoring stale snapshot"
                );
                let view = record
                    .view()
                    .unwrap_or_else(|| MatchView::authoritative(incoming.clone()));
                (view, false)
            } else {
                if let Some(ledger_time) = snapshot.ledger_time {
                    record.clock_skew = ledger_time - now;
                }
                if let Some(block) = snapshot.block_number {
                    record.block = Some(record.block.map_or(block, |known| known.max(block)));
                }

                let mut reverted = false;
                if record.derived_settling {
                    let still_running = match (snapshot.ledger_time, incoming.ends_at(self.match_duration)) {
                        (Some(ledger_time), Some(ends_at)) => ledger_time < ends_at,
                        _ => false,
                    };
                    if incoming.lifecycle_state != LifecycleState::Active || still_running {
                        record.derived_settling = false;
                        reverted = incoming.lifecycle_state == LifecycleState::Active;
                    }
                }

                if let Some(previous) = &record.confirmed {
                    if previous.lifecycle_state.is_terminal() {
                        incoming.results = previous.results.clone();
                    }
                }

                let mut wallets = self.wallets();
                let mut outcome = None;
                if let Some(update) = record.optimistic.take() {
                    if update.action.fulfilled_by(&incoming) {
                        outcome = Some(ChangeKind::Confirmed);
                    } else {
                        info!(
                            match_id = id,
                            update_id = %update.id,
                            action = update.action.label(),
                            "Ledger disagrees with optimistic update, rolling back"
                        );
                        if let Some((wallet, prior)) = update.wallet_prior {
                            restore_wallet(&mut wallets, &wallet, prior, now, &mut wallet_writes);
                        }
                        outcome = Some(ChangeKind::RolledBack);
                    }
                }

                sync_wallets(&mut wallets, &incoming, now, &mut wallet_writes);
                drop(wallets);

                let changed = record.confirmed.as_ref() != Some(&incoming);
                record.confirmed = Some(incoming.clone());
                let view = MatchView {
                    tracked: Tracked::Authoritative(incoming.clone()),
                    derived_settling: record.derived_settling,
                };

                if reverted {
                    info!(match_id = id, "Ledger reports match still running, reverting derived settling");
                    changes.push(Self::change(&view, id, ChangeKind::Reverted));
                }
                if let Some(kind) = outcome {
                    changes.push(Self::change(&view, id, kind));
                } else if changed {
                    let kind = if incoming.lifecycle_state.is_terminal() {
                        ChangeKind::Completed
                    } else {
                        ChangeKind::Confirmed
                    };
                    changes.push(Self::change(&view, id, kind));
                }
                (view, true)
            }
        };

        if accepted {
            let ttl = self.cache.policy().for_state(incoming.lifecycle_state);
            self.cache
                .set(&keys::match_info(id), &incoming, Provenance::Authoritative, ttl)
                .await;
            self.persist_wallets(wallet_writes).await;
            if incoming.lifecycle_state == LifecycleState::Completed {
                self.index_completed(id).await;
            }
        }
        self.emit(changes);
        view
    }

    /// Complete a match with authoritative results. Applying the same
    /// results again changes nothing.
    pub async fn apply_results(&self, id: MatchId, results: Vec<MatchResult>) -> Result<MatchView, EngineError> {
        self.seed_from_cache(id).await;
        let now = self.clock.now();
        let mut wallet_writes = Vec::new();

        let (view, entity, kind) = {
            let mut records = self.records();
            let record = records
                .get_mut(&id)
                .ok_or_else(|| EngineError::not_found(format!("match {} is not tracked", id)).with_match(id))?;
            let confirmed = record
                .confirmed
                .as_mut()
                .ok_or_else(|| EngineError::not_found(format!("match {} has no confirmed state", id)).with_match(id))?;

            if confirmed.lifecycle_state.is_terminal() {
                if confirmed.results != results {
                    warn!(match_id = id, "Ignoring conflicting results for completed match");
                }
                let view = record
                    .view()
                    .ok_or_else(|| EngineError::unknown("completed match without state").with_match(id))?;
                return Ok(view);
            }

            FeeSchedule::validate_results(&results, payout_ceiling(confirmed)).map_err(|reason| {
                EngineError::unknown(format!("inconsistent results: {}", reason)).with_match(id)
            })?;

            confirmed.complete_with(results);
            let entity = confirmed.clone();
            record.derived_settling = false;
            let kind = match record.optimistic.take() {
                Some(update) => {
                    debug!(match_id = id, update_id = %update.id, "Optimistic update superseded by results");
                    ChangeKind::Confirmed
                }
                None => ChangeKind::Completed,
            };

            let mut wallets = self.wallets();
            sync_wallets(&mut wallets, &entity, now, &mut wallet_writes);
            drop(wallets);

            let view = MatchView::authoritative(entity.clone());
            (view, entity, kind)
        };

        info!(match_id = id, placements = entity.results.len(), "Match completed");
        let ttl = self.cache.policy().completed;
        self.cache
            .set(&keys::match_info(id), &entity, Provenance::Authoritative, ttl)
            .await;
        self.cache
            .set(&keys::match_results(id), &entity.results, Provenance::Authoritative, ttl)
            .await;
        self.persist_wallets(wallet_writes).await;
        self.index_completed(id).await;
        self.emit(vec![Self::change(&view, id, kind)]);
        Ok(view)
    }

    /// Flag active matches whose duration has elapsed, adjusted for the
    /// ledger's clock. Returns the ids that were flagged.
    pub fn tick(&self) -> Vec<MatchId> {
        let now = self.clock.now();
        let mut flagged = Vec::new();
        let mut changes = Vec::new();

        {
            let mut records = self.records();
            for (id, record) in records.iter_mut() {
                if record.derived_settling {
                    continue;
                }
                let ends_at = match &record.confirmed {
                    Some(m) if m.lifecycle_state == LifecycleState::Active => m.ends_at(self.match_duration),
                    _ => None,
                };
                let Some(ends_at) = ends_at else { continue };
                if now + record.clock_skew >= ends_at {
                    record.derived_settling = true;
                    flagged.push(*id);
                    if let Some(view) = record.view() {
                        changes.push(Self::change(&view, *id, ChangeKind::DerivedSettling));
                    }
                }
            }
        }

        flagged.sort_unstable();
        if !flagged.is_empty() {
            debug!(matches = ?flagged, "Match duration elapsed");
        }
        self.emit(changes);
        flagged
    }

    pub async fn wallet_status(&self, wallet: &str) -> WalletMatchStatus {
        let wallet = normalize_wallet(wallet);
        if let Some(status) = self.wallets().get(&wallet).cloned() {
            return status;
        }
        if let Some(entry) = self.cache.get::<WalletMatchStatus>(&keys::wallet_status(&wallet)).await {
            self.wallets()
                .entry(wallet)
                .or_insert_with(|| entry.value.clone());
            return entry.value;
        }
        WalletMatchStatus::idle(self.clock.now())
    }

    /// Record a wallet as tied to a match, e.g. the creator of a new match.
    pub async fn mark_wallet_busy(&self, wallet: &str, match_id: MatchId) {
        let wallet = normalize_wallet(wallet);
        let status = WalletMatchStatus::busy(match_id, self.clock.now());
        self.wallets().insert(wallet.clone(), status.clone());
        self.persist_wallets(vec![(wallet, status)]).await;
    }

    async fn persist_wallets(&self, writes: Vec<(String, WalletMatchStatus)>) {
        let ttl = self.cache.policy().live;
        for (wallet, status) in writes {
            self.cache
                .set(&keys::wallet_status(&wallet), &status, Provenance::Authoritative, ttl)
                .await;
        }
    }

    async fn eligibility(&self, wallet: &str, target: Option<MatchId>) -> Eligibility {
        let status = self.wallet_status(wallet).await;
        let Some(active) = status.active_match_id else {
            return Eligibility::allowed();
        };

        let still_open = self
            .peek_match(active)
            .map(|view| view.confirmed().map_or(true, |m| m.lifecycle_state.is_open()))
            .unwrap_or(true);
        if !still_open {
            let wallet = normalize_wallet(wallet);
            let idle = WalletMatchStatus::idle(self.clock.now());
            self.wallets().insert(wallet.clone(), idle.clone());
            self.persist_wallets(vec![(wallet, idle)]).await;
            return Eligibility::allowed();
        }

        let reason = match target {
            Some(id) if id == active => format!("wallet has already joined match {}", active),
            _ => format!("wallet is already in match {}", active),
        };
        Eligibility::blocked(active, reason)
    }

    pub async fn can_create(&self, wallet: &str) -> Eligibility {
        self.eligibility(wallet, None).await
    }

    pub async fn can_join(&self, wallet: &str, match_id: MatchId) -> Eligibility {
        self.eligibility(wallet, Some(match_id)).await
    }

    async fn require_eligible(&self, wallet: &str, target: Option<MatchId>) -> Result<(), EngineError> {
        let eligibility = self.eligibility(wallet, target).await;
        match (eligibility.allowed, eligibility.active_match_id) {
            (true, _) => Ok(()),
            (false, blocking) => {
                let reason = eligibility
                    .reason
                    .unwrap_or_else(|| "wallet already has an open match".to_string());
                let err = EngineError::new(ErrorKind::ActiveMatchConflict, reason);
                Err(match blocking {
                    Some(id) => err.with_match(id),
                    None => err,
                })
            }
        }
    }

    /// Submissions are only retried when the ledger refused them up front.
    async fn submit<F, Fut>(&self, label: &str, op: F) -> Result<TxHandle, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<TxHandle, LedgerError>>,
    {
        let tx = self
            .retrier
            .run_if(label, op, classify_ledger_error, |kind| kind == ErrorKind::RateLimited)
            .await?;
        info!(operation = label, tx_hash = %tx.hash, "Submission accepted");
        Ok(tx)
    }

    async fn apply_optimistic(
        &self,
        id: MatchId,
        action: PendingAction,
        provisional: MatchEntity,
        busy_wallet: Option<&str>,
    ) -> Uuid {
        let update_id = Uuid::new_v4();
        let now = self.clock.now();
        let mut wallet_writes = Vec::new();

        let view = {
            let mut records = self.records();
            let record = records.entry(id).or_insert_with(MatchRecord::empty);
            let wallet_prior = busy_wallet.map(|wallet| {
                let wallet = normalize_wallet(wallet);
                let mut wallets = self.wallets();
                let prior = wallets.insert(wallet.clone(), WalletMatchStatus::busy(id, now));
                wallet_writes.push((wallet.clone(), WalletMatchStatus::busy(id, now)));
                (wallet, prior)
            });
            debug!(match_id = id, update_id = %update_id, action = action.label(), "Applying optimistic update");
            record.optimistic = Some(OptimisticUpdate {
                id: update_id,
                action,
                provisional: provisional.clone(),
                wallet_prior,
            });
            record.view()
        };

        self.cache
            .set(
                &keys::match_info(id),
                &provisional,
                Provenance::Optimistic,
                self.cache.policy().live,
            )
            .await;
        self.persist_wallets(wallet_writes).await;
        if let Some(view) = view {
            self.emit(vec![Self::change(&view, id, ChangeKind::Optimistic)]);
        }
        update_id
    }

    /// Drop the optimistic update `update_id` if it is still pending.
    async fn rollback(&self, id: MatchId, update_id: Uuid) {
        let now = self.clock.now();
        let mut wallet_writes = Vec::new();
        let view = {
            let mut records = self.records();
            let Some(record) = records.get_mut(&id) else { return };
            if record.optimistic.as_ref().map(|u| u.id) != Some(update_id) {
                return;
            }
            if let Some(update) = record.optimistic.take() {
                if let Some((wallet, prior)) = update.wallet_prior {
                    let mut wallets = self.wallets();
                    restore_wallet(&mut wallets, &wallet, prior, now, &mut wallet_writes);
                }
            }
            record.view()
        };

        warn!(match_id = id, update_id = %update_id, "Optimistic update rolled back");
        self.cache.invalidate(&keys::match_info(id)).await;
        self.persist_wallets(wallet_writes).await;
        if let Some(view) = view {
            self.emit(vec![Self::change(&view, id, ChangeKind::RolledBack)]);
        }
    }

    /// Follow a submission with an authoritative read; roll back if it fails.
    async fn confirm(&self, id: MatchId, update_id: Uuid, tx: TxHandle) -> Result<TxHandle, EngineError> {
        match self.invalidate_and_refresh(id).await {
            Ok(_) => Ok(tx),
            Err(err) => {
                warn!(match_id = id, tx_hash = %tx.hash, kind = %err.kind, "Could not confirm submission");
                self.rollback(id, update_id).await;
                Err(err)
            }
        }
    }

    pub async fn submit_create(&self, request: &CreateMatchRequest) -> Result<TxHandle, EngineError> {
        validate(request)?;
        self.require_eligible(&request.wallet, None).await?;

        let wallet = normalize_wallet(&request.wallet);
        let size = request.size;
        let tx = self
            .submit("submit_create", || self.ledger.submit_create(&wallet, size))
            .await?;

        self.cache.invalidate(&keys::active_matches(size)).await;
        self.cache.invalidate(&keys::wallet_status(&wallet)).await;
        Ok(tx)
    }

    pub async fn submit_join(&self, request: &JoinMatchRequest) -> Result<TxHandle, EngineError> {
        validate(request)?;
        let id = request.match_id;
        self.require_eligible(&request.wallet, Some(id)).await?;

        let view = self.get_match(id).await?;
        let current = view.entity().clone();
        if current.lifecycle_state != LifecycleState::Waiting {
            return Err(EngineError::bad_request(format!("match {} is not accepting players", id)).with_match(id));
        }
        if current.is_full() {
            return Err(EngineError::bad_request(format!("match {} is full", id)).with_match(id));
        }
        if current.has_participant(&request.wallet) {
            return Err(EngineError::bad_request(format!("wallet already joined match {}", id)).with_match(id));
        }

        let wallet = normalize_wallet(&request.wallet);
        let fee = self.fees.entry_fee(current.size);
        let (entity_id, boost) = (request.entity_id, request.boost);
        let tx = self
            .submit("submit_join", || {
                self.ledger.submit_join(&wallet, id, entity_id, boost, fee)
            })
            .await?;

        if boost > 0 {
            self.cache.invalidate(&keys::player_inventory(&wallet)).await;
        }

        let mut provisional = current;
        provisional.participants.push(Participant {
            wallet: wallet.clone(),
            entity_id,
            boost,
            score: Quantity::ZERO,
        });
        provisional.prize_pool = provisional.prize_pool + fee;

        let update_id = self
            .apply_optimistic(
                id,
                PendingAction::Join { wallet: wallet.clone() },
                provisional,
                Some(&wallet),
            )
            .await;
        self.confirm(id, update_id, tx).await
    }

    pub async fn submit_start(&self, request: &MatchActionRequest) -> Result<TxHandle, EngineError> {
        validate(request)?;
        let id = request.match_id;
        let view = self.get_match(id).await?;
        let current = view.entity().clone();
        if current.lifecycle_state != LifecycleState::Waiting {
            return Err(EngineError::bad_request(format!("match {} has already started", id)).with_match(id));
        }

        let wallet = normalize_wallet(&request.wallet);
        let tx = self
            .submit("submit_start", || self.ledger.submit_start(&wallet, id))
            .await?;

        let mut provisional = current;
        provisional.lifecycle_state = LifecycleState::Active;
        provisional.started_at = Some(self.clock.now());
        let update_id = self
            .apply_optimistic(id, PendingAction::Start, provisional, None)
            .await;
        self.confirm(id, update_id, tx).await
    }

    pub async fn submit_settle(&self, request: &MatchActionRequest) -> Result<TxHandle, EngineError> {
        validate(request)?;
        let id = request.match_id;
        let view = self.get_match(id).await?;
        let current = view.entity().clone();
        match current.lifecycle_state {
            LifecycleState::Active | LifecycleState::Settling => {}
            LifecycleState::Waiting => {
                return Err(EngineError::bad_request(format!("match {} has not started", id)).with_match(id));
            }
            LifecycleState::Completed => {
                return Err(EngineError::bad_request(format!("match {} is already settled", id)).with_match(id));
            }
        }

        let wallet = normalize_wallet(&request.wallet);
        let tx = self
            .submit("submit_settle", || self.ledger.submit_settle(&wallet, id))
            .await?;

        let mut provisional = current;
        provisional.lifecycle_state = LifecycleState::Settling;
        let update_id = self
            .apply_optimistic(id, PendingAction::Settle, provisional, None)
            .await;
        self.confirm(id, update_id, tx).await
    }

    pub async fn purchase_boosts(&self, request: &PurchaseBoostsRequest) -> Result<TxHandle, EngineError> {
        validate(request)?;
        let wallet = normalize_wallet(&request.wallet);
        let amount = request.amount;
        let tx = self
            .submit("submit_purchase_boosts", || {
                self.ledger.submit_purchase_boosts(&wallet, amount)
            })
            .await?;
        self.cache.invalidate(&keys::player_inventory(&wallet)).await;
        Ok(tx)
    }

    /// Boosts available to a wallet, read through the cache.
    pub async fn inventory(&self, wallet: &str) -> Result<u64, EngineError> {
        let wallet = normalize_wallet(wallet);
        let key = keys::player_inventory(&wallet);
        if let Some(entry) = self.cache.get::<u64>(&key).await {
            return Ok(entry.value);
        }

        let ledger = self.ledger.clone();
        let address = wallet.clone();
        let count = self
            .queue
            .schedule_retrying(
                &key,
                self.retrier.clone(),
                "read_player_inventory",
                move || {
                    let ledger = ledger.clone();
                    let address = address.clone();
                    async move { ledger.read_player_inventory(&address).await }
                },
                classify_ledger_error,
            )
            .await?;

        self.cache
            .set(&key, &count, Provenance::Authoritative, self.cache.policy().live)
            .await;
        Ok(count)
    }

    /// Open match ids for a size class, read through the cache.
    pub async fn active_matches(&self, size: SizeClass) -> Result<Vec<MatchId>, EngineError> {
        let key = keys::active_matches(size);
        if let Some(entry) = self.cache.get::<Vec<MatchId>>(&key).await {
            return Ok(entry.value);
        }

        let ledger = self.ledger.clone();
        let ids = self
            .queue
            .schedule_retrying(
                &key,
                self.retrier.clone(),
                "read_active_matches",
                move || {
                    let ledger = ledger.clone();
                    async move { ledger.read_active_matches(size).await }
                },
                classify_ledger_error,
            )
            .await?;

        self.cache
            .set(&key, &ids, Provenance::Authoritative, self.cache.policy().live)
            .await;
        Ok(ids)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// Most a match may pay out. An unknown pool bounds nothing.
fn payout_ceiling(entity: &MatchEntity) -> Quantity {
    if entity.prize_pool.is_zero() {
        Quantity::new(u128::MAX)
    } else {
        entity.prize_pool
    }
}

fn validate<T: Validate>(request: &T) -> Result<(), EngineError> {
    request
        .validate()
        .map_err(|e| EngineError::bad_request(e.to_string()))
}

/// Point participants' wallet status at this match while it is open and
/// release them once it is not.
fn sync_wallets(
    wallets: &mut HashMap<String, WalletMatchStatus>,
    entity: &MatchEntity,
    now: DateTime<Utc>,
    writes: &mut Vec<(String, WalletMatchStatus)>,
) {
    for participant in &entity.participants {
        let wallet = normalize_wallet(&participant.wallet);
        let current = wallets.get(&wallet).and_then(|s| s.active_match_id);
        let next = if entity.lifecycle_state.is_open() {
            Some(entity.id)
        } else if current == Some(entity.id) {
            None
        } else {
            continue;
        };
        if current == next && wallets.contains_key(&wallet) {
            continue;
        }
        let status = match next {
            Some(id) => WalletMatchStatus::busy(id, now),
            None => WalletMatchStatus::idle(now),
        };
        wallets.insert(wallet.clone(), status.clone());
        writes.push((wallet, status));
    }
}

fn restore_wallet(
    wallets: &mut HashMap<String, WalletMatchStatus>,
    wallet: &str,
    prior: Option<WalletMatchStatus>,
    now: DateTime<Utc>,
    writes: &mut Vec<(String, WalletMatchStatus)>,
) {
    match prior {
        Some(status) => {
            wallets.insert(wallet.to_string(), status.clone());
            writes.push((wallet.to_string(), status));
        }
        None => {
            wallets.remove(wallet);
            let idle = WalletMatchStatus::idle(now);
            writes.push((wallet.to_string(), idle));
        }
    }
}
