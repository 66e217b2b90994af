use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::fee_schedule::FeeSchedule;
use super::quantity::Quantity;

/// Ledger-assigned, monotonically increasing match identifier.
pub type MatchId = u64;

/// Capacity class of a match; fixes max players and the reward split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeClass {
    TwoPlayer,
    FourPlayer,
    FivePlayer,
    TenPlayer,
}

impl SizeClass {
    pub const ALL: [SizeClass; 4] = [
        SizeClass::TwoPlayer,
        SizeClass::FourPlayer,
        SizeClass::FivePlayer,
        SizeClass::TenPlayer,
    ];

    pub fn max_players(&self) -> usize {
        match self {
            SizeClass::TwoPlayer => 2,
            SizeClass::FourPlayer => 4,
            SizeClass::FivePlayer => 5,
            SizeClass::TenPlayer => 10,
        }
    }

    pub fn from_max_players(players: usize) -> Option<SizeClass> {
        SizeClass::ALL
            .into_iter()
            .find(|size| size.max_players() == players)
    }
}

impl std::fmt::Display for SizeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.max_players())
    }
}

/// Lifecycle of a match as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Waiting,
    Active,
    Settling,
    Completed,
}

impl LifecycleState {
    /// Forward-only transitions; same state is allowed for idempotent re-application.
    pub fn can_transition_to(&self, to: &LifecycleState) -> bool {
        match (self, to) {
            (LifecycleState::Waiting, LifecycleState::Active) => true,
            (LifecycleState::Active, LifecycleState::Settling) => true,
            (LifecycleState::Settling, LifecycleState::Completed) => true,
            // Results can be observed before the client noticed the end of the round.
            (LifecycleState::Active, LifecycleState::Completed) => true,
            (a, b) if a == b => true,
            _ => false,
        }
    }

    pub fn valid_next_states(&self) -> Vec<LifecycleState> {
        match self {
            LifecycleState::Waiting => vec![LifecycleState::Active],
            LifecycleState::Active => vec![LifecycleState::Settling, LifecycleState::Completed],
            LifecycleState::Settling => vec![LifecycleState::Completed],
            LifecycleState::Completed => vec![],
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Completed)
    }

    /// Waiting or Active: counts against the single-active-match rule.
    pub fn is_open(&self) -> bool {
        matches!(self, LifecycleState::Waiting | LifecycleState::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub wallet: String,
    pub entity_id: u64,
    pub boost: u32,
    pub score: Quantity,
}

/// One settled placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub wallet: String,
    pub position: u32,
    pub score: Quantity,
    pub reward: Quantity,
}

/// Phase as reported by the ledger; it has no notion of client-side settling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerPhase {
    Waiting,
    Active,
    Ended,
}

/// Raw single-match read from the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchSnapshot {
    pub id: MatchId,
    pub size: SizeClass,
    pub phase: LedgerPhase,
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub prize_pool: Option<Quantity>,
    #[serde(default)]
    pub results: Vec<MatchResult>,
    /// Block the read was served from, used to order racing reads.
    #[serde(default)]
    pub block_number: Option<u64>,
    /// Ledger timestamp at that block.
    #[serde(default)]
    pub ledger_time: Option<DateTime<Utc>>,
}

/// A single competitive round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchEntity {
    pub id: MatchId,
    pub size: SizeClass,
    pub lifecycle_state: LifecycleState,
    pub participants: Vec<Participant>,
    pub started_at: Option<DateTime<Utc>>,
    pub prize_pool: Quantity,
    /// Non-empty iff `lifecycle_state` is `Completed`.
    pub results: Vec<MatchResult>,
}

impl MatchEntity {
    pub fn new(id: MatchId, size: SizeClass) -> Self {
        Self {
            id,
            size,
            lifecycle_state: LifecycleState::Waiting,
            participants: Vec::new(),
            started_at: None,
            prize_pool: Quantity::ZERO,
            results: Vec::new(),
        }
    }

    /// Fold a ledger read into an entity. An ended match without results is `Settling`.
    pub fn from_snapshot(snapshot: &MatchSnapshot, fees: &FeeSchedule) -> Self {
        let lifecycle_state = match snapshot.phase {
            LedgerPhase::Waiting => LifecycleState::Waiting,
            LedgerPhase::Active => LifecycleState::Active,
            LedgerPhase::Ended if snapshot.results.is_empty() => LifecycleState::Settling,
            LedgerPhase::Ended => LifecycleState::Completed,
        };
        let prize_pool = snapshot
            .prize_pool
            .unwrap_or_else(|| fees.prize_pool(snapshot.size, snapshot.participants.len()));

        Self {
            id: snapshot.id,
            size: snapshot.size,
            lifecycle_state,
            participants: snapshot.participants.clone(),
            started_at: snapshot.started_at,
            prize_pool,
            results: if lifecycle_state == LifecycleState::Completed {
                snapshot.results.clone()
            } else {
                Vec::new()
            },
        }
    }

    pub fn max_players(&self) -> usize {
        self.size.max_players()
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.max_players()
    }

    pub fn has_participant(&self, wallet: &str) -> bool {
        self.participants
            .iter()
            .any(|p| p.wallet.eq_ignore_ascii_case(wallet))
    }

    pub fn ends_at(&self, duration: Duration) -> Option<DateTime<Utc>> {
        self.started_at.map(|started| started + duration)
    }

    /// `results` present exactly when completed, and never paying out more than the pool.
    pub fn is_consistent(&self) -> bool {
        let completed = self.lifecycle_state == LifecycleState::Completed;
        if completed == self.results.is_empty() {
            return false;
        }
        let paid: Quantity = self.results.iter().map(|r| r.reward).sum();
        paid <= self.prize_pool
    }

    /// Attach settled results and mark the match completed.
    pub fn complete_with(&mut self, results: Vec<MatchResult>) {
        self.results = results;
        self.lifecycle_state = LifecycleState::Completed;
    }
}

/// Participant indices ordered by descending score; ties keep source order.
pub fn rank_by_score(participants: &[Participant]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..participants.len()).collect();
    order.sort_by(|a, b| participants[*b].score.cmp(&participants[*a].score));
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(wallet: &str, score: u64) -> Participant {
        Participant {
            wallet: wallet.to_string(),
            entity_id: 1,
            boost: 0,
            score: Quantity::from(score),
        }
    }

    #[test]
    fn test_valid_state_transitions() {
        use LifecycleState::*;

        assert!(Waiting.can_transition_to(&Active));
        assert!(Active.can_transition_to(&Settling));
        assert!(Settling.can_transition_to(&Completed));
        assert!(Active.can_transition_to(&Completed));
        assert!(Completed.can_transition_to(&Completed));

        assert!(!Completed.can_transition_to(&Active));
        assert!(!Active.can_transition_to(&Waiting));
        assert!(!Waiting.can_transition_to(&Completed));
        assert!(!Settling.can_transition_to(&Active));
    }

    #[test]
    fn test_terminal_and_open_states() {
        assert!(LifecycleState::Completed.is_terminal());
        assert!(!LifecycleState::Settling.is_terminal());
        assert!(LifecycleState::Waiting.is_open());
        assert!(LifecycleState::Active.is_open());
        assert!(!LifecycleState::Settling.is_open());
        assert!(LifecycleState::Completed.valid_next_states().is_empty());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&LifecycleState::Settling).unwrap();
        assert_eq!(json, "\"SETTLING\"");
    }

    #[test]
    fn test_size_class_capacity() {
        assert_eq!(SizeClass::TwoPlayer.max_players(), 2);
        assert_eq!(SizeClass::TenPlayer.max_players(), 10);
        assert_eq!(SizeClass::from_max_players(5), Some(SizeClass::FivePlayer));
        assert_eq!(SizeClass::from_max_players(3), None);
    }

    #[test]
    fn test_ended_snapshot_without_results_is_settling() {
        let snapshot = MatchSnapshot {
            id: 7,
            size: SizeClass::TwoPlayer,
            phase: LedgerPhase::Ended,
            participants: vec![participant("0xa", 10), participant("0xb", 20)],
            started_at: Some(Utc::now()),
            prize_pool: None,
            results: vec![],
            block_number: Some(100),
            ledger_time: None,
        };

        let entity = MatchEntity::from_snapshot(&snapshot, &FeeSchedule::default());
        assert_eq!(entity.lifecycle_state, LifecycleState::Settling);
        assert_eq!(entity.prize_pool, Quantity::native(2));
        assert!(entity.is_consistent());
    }

    #[test]
    fn test_consistency_requires_results_iff_completed() {
        let mut entity = MatchEntity::new(1, SizeClass::TwoPlayer);
        assert!(entity.is_consistent());

        entity.lifecycle_state = LifecycleState::Completed;
        assert!(!entity.is_consistent());

        entity.prize_pool = Quantity::native(2);
        entity.complete_with(vec![MatchResult {
            wallet: "0xa".to_string(),
            position: 1,
            score: Quantity::from(5u64),
            reward: Quantity::native(3),
        }]);
        assert!(!entity.is_consistent(), "reward above pool");
    }

    #[test]
    fn test_rank_by_score_breaks_ties_by_index() {
        let players = vec![
            participant("0xa", 10),
            participant("0xb", 30),
            participant("0xc", 10),
            participant("0xd", 20),
        ];
        assert_eq!(rank_by_score(&players), vec![1, 3, 0, 2]);
    }
}
