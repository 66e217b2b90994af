use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::reconciler::Reconciler;
use crate::models::{LifecycleState, MatchId};

/// Outcome of one polling pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub flagged: Vec<MatchId>,
    pub prefetched: usize,
    pub refreshed: usize,
    pub failed: usize,
    pub swept: usize,
}

/// Periodic driver for time-derived state and unsettled matches.
///
/// Each pass flags matches whose duration has elapsed, warms results for
/// settling matches with one bulk read, re-reads every match that can still
/// change and drops expired cache entries. Completed matches are never re-read.
pub struct Poller {
    reconciler: Arc<Reconciler>,
}

impl Poller {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }

    pub async fn poll_once(&self) -> PollReport {
        let flagged = self.reconciler.tick();

        let ids = self.reconciler.unsettled_ids();
        let settling: Vec<MatchId> = ids
            .iter()
            .copied()
            .filter(|id| {
                self.reconciler
                    .peek_match(*id)
                    .map_or(false, |view| view.state() == LifecycleState::Settling)
            })
            .collect();
        let prefetched = if settling.is_empty() {
            0
        } else {
            match self.reconciler.fetcher().prefetch(&settling).await {
                Ok(warmed) => warmed,
                Err(err) => {
                    warn!(matches = settling.len(), kind = %err.kind, "Results prefetch failed");
                    0
                }
            }
        };

        let outcomes = join_all(ids.iter().map(|id| self.reconciler.invalidate_and_refresh(*id))).await;

        let mut report = PollReport {
            flagged,
            prefetched,
            ..PollReport::default()
        };
        for (id, outcome) in ids.iter().zip(outcomes) {
            match outcome {
                Ok(_) => report.refreshed += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(match_id = id, kind = %err.kind, error = %err.message, "Match refresh failed");
                }
            }
        }
        report.swept = self.reconciler.cache().sweep();

        debug!(
            flagged = report.flagged.len(),
            prefetched = report.prefetched,
            refreshed = report.refreshed,
            failed = report.failed,
            swept = report.swept,
            "Poll pass finished"
        );
        report
    }

    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.poll_once().await;
            }
        })
    }
}
