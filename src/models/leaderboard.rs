use chrono::Duration;
use serde::{Deserialize, Serialize};

use super::quantity::Quantity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    Day,
    Week,
    Month,
    #[default]
    All,
}

impl TimeWindow {
    pub fn span(&self) -> Option<Duration> {
        match self {
            TimeWindow::Day => Some(Duration::days(1)),
            TimeWindow::Week => Some(Duration::days(7)),
            TimeWindow::Month => Some(Duration::days(30)),
            TimeWindow::All => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeWindow::Day => "day",
            TimeWindow::Week => "week",
            TimeWindow::Month => "month",
            TimeWindow::All => "all",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    Score,
    Rewards,
    WinRate,
}

impl SortKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortKey::Score => "score",
            SortKey::Rewards => "rewards",
            SortKey::WinRate => "win_rate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LeaderboardFilters {
    #[serde(default)]
    pub window: TimeWindow,
    #[serde(default)]
    pub min_matches: u32,
    #[serde(default)]
    pub sort: SortKey,
}

/// Ranked, derived per-player statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: u32,
    pub address: String,
    pub aggregate_score: Quantity,
    pub aggregate_rewards: Quantity,
    pub matches_played: u32,
    pub wins: u32,
    pub win_rate: f64,
    pub best_score: Quantity,
    pub average_position: f64,
}

impl LeaderboardEntry {
    pub fn new(address: String) -> Self {
        Self {
            rank: 0,
            address,
            aggregate_score: Quantity::ZERO,
            aggregate_rewards: Quantity::ZERO,
            matches_played: 0,
            wins: 0,
            win_rate: 0.0,
            best_score: Quantity::ZERO,
            average_position: 0.0,
        }
    }

    /// Fold one placement into the running totals.
    pub fn record(&mut self, position: u32, score: Quantity, reward: Quantity) {
        self.matches_played += 1;
        let n = self.matches_played as f64;
        self.aggregate_rewards += reward;
        self.aggregate_score += score;
        if position == 1 {
            self.wins += 1;
        }
        if score > self.best_score {
            self.best_score = score;
        }
        self.win_rate = self.wins as f64 / n;
        self.average_position = (self.average_position * (n - 1.0) + position as f64) / n;
    }
}
