//! Scripted in-memory ledger for tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use super::ledger_client::{Ledger, LedgerError};
use super::reconciler::Reconciler;
use super::request_queue::RequestQueue;
use super::result_cache::{ResultCache, TtlPolicy};
use super::retry::{Retrier, RetryPolicy};
use crate::clock::ManualClock;
use crate::config::QueueConfig;
use crate::models::{
    DecodedEvent, FeeSchedule, MatchId, MatchResult, MatchSnapshot, Quantity, SizeClass, TxHandle,
};
use crate::store::MemoryStore;

pub const READ_MATCH: &str = "read_match";
pub const READ_BATCH_RESULTS: &str = "read_batch_results";
pub const READ_LEADERBOARD: &str = "read_leaderboard";
pub const READ_RECORDED_REWARDS: &str = "read_recorded_rewards";
pub const READ_INVENTORY: &str = "read_player_inventory";
pub const READ_ACTIVE_MATCHES: &str = "read_active_matches";
pub const READ_EVENTS: &str = "read_events";
pub const SUBMIT_CREATE: &str = "submit_create";
pub const SUBMIT_JOIN: &str = "submit_join";
pub const SUBMIT_START: &str = "submit_start";
pub const SUBMIT_SETTLE: &str = "submit_settle";
pub const SUBMIT_PURCHASE: &str = "submit_purchase_boosts";

#[derive(Default)]
struct Script {
    matches: HashMap<MatchId, MatchSnapshot>,
    batch_results: HashMap<MatchId, Vec<MatchResult>>,
    leaderboards: HashMap<MatchId, Vec<MatchResult>>,
    recorded_rewards: HashMap<MatchId, Quantity>,
    inventory: HashMap<String, u64>,
    active: HashMap<SizeClass, Vec<MatchId>>,
    events: Vec<DecodedEvent>,
    queued_failures: HashMap<&'static str, VecDeque<LedgerError>>,
    persistent_failures: HashMap<&'static str, LedgerError>,
    calls: HashMap<&'static str, u32>,
    tx_counter: u64,
}

#[derive(Default)]
pub struct MockLedger {
    script: Mutex<Script>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_match(&self, snapshot: MatchSnapshot) {
        self.script().matches.insert(snapshot.id, snapshot);
    }

    pub fn set_batch_results(&self, id: MatchId, results: Vec<MatchResult>) {
        self.script().batch_results.insert(id, results);
    }

    pub fn set_leaderboard(&self, id: MatchId, results: Vec<MatchResult>) {
        self.script().leaderboards.insert(id, results);
    }

    pub fn set_recorded_rewards(&self, id: MatchId, amount: Quantity) {
        self.script().recorded_rewards.insert(id, amount);
    }

    pub fn set_inventory(&self, wallet: &str, count: u64) {
        self.script().inventory.insert(wallet.to_string(), count);
    }

    pub fn set_active_matches(&self, size: SizeClass, ids: Vec<MatchId>) {
        self.script().active.insert(size, ids);
    }

    pub fn push_event(&self, event: DecodedEvent) {
        self.script().events.push(event);
    }

    /// Fail the next `times` calls of `op` with `err`.
    pub fn fail_times(&self, op: &'static str, times: usize, err: LedgerError) {
        let mut script = self.script();
        let queue = script.queued_failures.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(err.clone());
        }
    }

    /// Fail every call of `op` until `heal` is called.
    pub fn fail_always(&self, op: &'static str, err: LedgerError) {
        self.script().persistent_failures.insert(op, err);
    }

    pub fn heal(&self, op: &'static str) {
        let mut script = self.script();
        script.persistent_failures.remove(op);
        script.queued_failures.remove(op);
    }

    pub fn calls(&self, op: &str) -> u32 {
        self.script().calls.get(op).copied().unwrap_or(0)
    }

    fn enter(&self, op: &'static str) -> Result<(), LedgerError> {
        let mut script = self.script();
        *script.calls.entry(op).or_insert(0) += 1;
        if let Some(err) = script.queued_failures.get_mut(op).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        match script.persistent_failures.get(op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn tx(&self, op: &'static str) -> Result<TxHandle, LedgerError> {
        self.enter(op)?;
        let mut script = self.script();
        script.tx_counter += 1;
        Ok(TxHandle {
            hash: format!("0x{:064x}", script.tx_counter),
        })
    }
}

/// Reconciler over `ledger` with an in-memory durable tier and fast retries.
pub fn create_test_reconciler(ledger: Arc<MockLedger>, clock: Arc<ManualClock>) -> Arc<Reconciler> {
    let cache = Arc::new(ResultCache::new(
        Arc::new(MemoryStore::new()),
        clock.clone(),
        TtlPolicy::default(),
    ));
    Arc::new(Reconciler::new(
        ledger,
        cache,
        Arc::new(RequestQueue::new(&QueueConfig::default())),
        Retrier::new(RetryPolicy::immediate(3)),
        FeeSchedule::default(),
        clock,
        chrono::Duration::seconds(60),
    ))
}

pub fn pending() -> LedgerError {
    LedgerError::Rpc {
        code: 3,
        message: "execution reverted: Clash not ended".to_string(),
    }
}

pub fn network_down() -> LedgerError {
    LedgerError::Transport("connection refused".to_string())
}

pub fn rate_limited() -> LedgerError {
    LedgerError::Http {
        status: 429,
        body: "Too Many Requests".to_string(),
    }
}

#[async_trait]
impl Ledger for MockLedger {
    async fn read_match(&self, id: MatchId) -> Result<MatchSnapshot, LedgerError> {
        self.enter(READ_MATCH)?;
        self.script()
            .matches
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::Rpc {
                code: -32000,
                message: format!("match {} not found", id),
            })
    }

    async fn read_batch_results(&self, ids: &[MatchId]) -> Result<Vec<Vec<MatchResult>>, LedgerError> {
        self.enter(READ_BATCH_RESULTS)?;
        let script = self.script();
        Ok(ids
            .iter()
            .map(|id| script.batch_results.get(id).cloned().unwrap_or_default())
            .collect())
    }

    async fn read_leaderboard(&self, id: MatchId) -> Result<Vec<MatchResult>, LedgerError> {
        self.enter(READ_LEADERBOARD)?;
        Ok(self.script().leaderboards.get(&id).cloned().unwrap_or_default())
    }

    async fn read_recorded_rewards(&self, id: MatchId) -> Result<Quantity, LedgerError> {
        self.enter(READ_RECORDED_REWARDS)?;
        Ok(self
            .script()
            .recorded_rewards
            .get(&id)
            .copied()
            .unwrap_or(Quantity::ZERO))
    }

    async fn read_player_inventory(&self, wallet: &str) -> Result<u64, LedgerError> {
        self.enter(READ_INVENTORY)?;
        Ok(self.script().inventory.get(wallet).copied().unwrap_or(0))
    }

    async fn read_active_matches(&self, size: SizeClass) -> Result<Vec<MatchId>, LedgerError> {
        self.enter(READ_ACTIVE_MATCHES)?;
        Ok(self.script().active.get(&size).cloned().unwrap_or_default())
    }

    async fn read_events(&self, from_block: u64) -> Result<Vec<DecodedEvent>, LedgerError> {
        self.enter(READ_EVENTS)?;
        Ok(self
            .script()
            .events
            .iter()
            .filter(|e| e.block >= from_block)
            .cloned()
            .collect())
    }

    async fn submit_create(&self, _wallet: &str, _size: SizeClass) -> Result<TxHandle, LedgerError> {
        self.tx(SUBMIT_CREATE)
    }

    async fn submit_join(
        &self,
        _wallet: &str,
        _match_id: MatchId,
        _entity_id: u64,
        _boost: u32,
        _value: Quantity,
    ) -> Result<TxHandle, LedgerError> {
        self.tx(SUBMIT_JOIN)
    }

    async fn submit_start(&self, _wallet: &str, _match_id: MatchId) -> Result<TxHandle, LedgerError> {
        self.tx(SUBMIT_START)
    }

    async fn submit_settle(&self, _wallet: &str, _match_id: MatchId) -> Result<TxHandle, LedgerError> {
        self.tx(SUBMIT_SETTLE)
    }

    async fn submit_purchase_boosts(&self, _wallet: &str, _amount: u32) -> Result<TxHandle, LedgerError> {
        self.tx(SUBMIT_PURCHASE)
    }
}
