//! Ledger events as cache-invalidation and reconciliation triggers.
//!
//! Events may arrive late, out of order or more than once. Each one only
//! invalidates what it touches and asks the reconciler to refetch, so applying
//! an event twice leaves the same state as applying it once.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ledger_client::{classify_ledger_error, Ledger};
use super::reconciler::Reconciler;
use super::result_cache::keys;
use super::retry::Retrier;
use crate::engine_error::EngineError;
use crate::models::{normalize_wallet, DecodedEvent, LedgerEvent, LifecycleState};

pub struct EventBridge {
    reconciler: Arc<Reconciler>,
}

impl EventBridge {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }

    pub async fn handle(&self, event: LedgerEvent) -> Result<(), EngineError> {
        debug!(event = event.name(), match_id = ?event.match_id(), "Ledger event received");
        let cache = self.reconciler.cache();

        match event {
            LedgerEvent::Created {
                match_id,
                size,
                creator,
            } => {
                cache.invalidate(&keys::active_matches(size)).await;
                self.reconciler.mark_wallet_busy(&creator, match_id).await;
                self.reconciler.invalidate_and_refresh(match_id).await?;
            }
            LedgerEvent::Joined { match_id, wallet } => {
                cache
                    .invalidate(&keys::player_inventory(&normalize_wallet(&wallet)))
                    .await;
                self.reconciler.invalidate_and_refresh(match_id).await?;
            }
            LedgerEvent::Started { match_id } => {
                if let Some(view) = self.reconciler.peek_match(match_id) {
                    cache.invalidate(&keys::active_matches(view.entity().size)).await;
                }
                self.reconciler.invalidate_and_refresh(match_id).await?;
            }
            LedgerEvent::Ended { match_id, results } => {
                // The payload is only a hint; results are always read back from the ledger.
                cache.invalidate(&keys::match_results(match_id)).await;
                let view = self.reconciler.invalidate_and_refresh(match_id).await?;
                let lagging = matches!(
                    view.entity().lifecycle_state,
                    LifecycleState::Waiting | LifecycleState::Active
                );
                if lagging && !results.is_empty() {
                    debug!(match_id = match_id, "Ledger read behind Ended event, looking up results");
                    let confirmed = self.reconciler.fetcher().fetch_match_result(match_id).await?;
                    if confirmed != results {
                        warn!(match_id = match_id, "Ended event results differ from ledger, using ledger");
                    }
                    self.reconciler.apply_results(match_id, confirmed).await?;
                }
            }
            LedgerEvent::RevenueWithdrawn { amount } => {
                let open = self.reconciler.unsettled_ids();
                info!(amount = %amount, matches = open.len(), "Revenue withdrawn, dropping reward side-checks");
                for id in open {
                    cache.invalidate(&keys::recorded_rewards(id)).await;
                }
            }
        }
        Ok(())
    }

    /// Drain events until every sender is gone.
    pub async fn run(self, mut events: mpsc::Receiver<LedgerEvent>) {
        while let Some(event) = events.recv().await {
            let name = event.name();
            let match_id = event.match_id();
            if let Err(err) = self.handle(event).await {
                warn!(
                    event = name,
                    match_id = ?match_id,
                    kind = %err.kind,
                    error = %err.message,
                    "Failed to apply ledger event"
                );
            }
        }
        info!("Event bridge stopped");
    }
}

/// Polls the ledger's event log and forwards new events in log order.
pub struct LedgerEventFeed {
    ledger: Arc<dyn Ledger>,
    retrier: Retrier,
    next_block: u64,
    /// `(block, log_index)` of the last forwarded log.
    cursor: Option<(u64, u32)>,
}

impl LedgerEventFeed {
    pub fn new(ledger: Arc<dyn Ledger>, retrier: Retrier, from_block: u64) -> Self {
        Self {
            ledger,
            retrier,
            next_block: from_block,
            cursor: None,
        }
    }

    pub async fn poll(&mut self) -> Result<Vec<LedgerEvent>, EngineError> {
        let ledger = &self.ledger;
        let from = self.next_block;
        let mut logs: Vec<DecodedEvent> = self
            .retrier
            .run("read_events", || ledger.read_events(from), classify_ledger_error)
            .await?;

        logs.sort_by_key(|log| (log.block, log.log_index));
        let mut seen = BTreeSet::new();
        let mut events = Vec::new();

        for log in logs {
            let position = (log.block, log.log_index);
            if self.cursor.map_or(false, |cursor| position <= cursor) || !seen.insert(position) {
                continue;
            }
            self.cursor = Some(position);
            self.next_block = log.block;

            let name = log.name.clone();
            match LedgerEvent::try_from(log) {
                Ok(event) => events.push(event),
                Err(reason) => {
                    warn!(event = %name, block = position.0, reason = %reason, "Skipping undecodable event")
                }
            }
        }
        Ok(events)
    }

    pub fn spawn(mut self, sink: mpsc::Sender<LedgerEvent>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match self.poll().await {
                    Ok(events) => {
                        for event in events {
                            if sink.send(event).await.is_err() {
                                info!("Event sink closed, stopping feed");
                                return;
                            }
                        }
                    }
                    Err(err) => warn!(kind = %err.kind, error = %err.message, "Event poll failed"),
                }
            }
        })
    }
}
