// Service layer module for clash-sync
pub mod event_bridge;
pub mod leaderboard_service;
pub mod ledger_client;
pub mod poller;
pub mod reconciler;
pub mod request_queue;
pub mod result_cache;
pub mod result_fetcher;
pub mod retry;

#[cfg(test)]
pub(crate) mod mock_ledger;

pub use event_bridge::{EventBridge, LedgerEventFeed};
pub use leaderboard_service::LeaderboardService;
pub use ledger_client::{JsonRpcLedger, Ledger, LedgerError};
pub use poller::{PollReport, Poller};
pub use reconciler::{ChangeKind, MatchChange, MatchView, Reconciler, Tracked};
pub use request_queue::RequestQueue;
pub use result_cache::{keys, ResultCache, TtlPolicy};
pub use result_fetcher::ResultFetcher;
pub use retry::{Retrier, RetryPolicy};
