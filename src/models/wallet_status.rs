use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::match_entity::MatchId;

/// Per-wallet view of the match it is currently tied up in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletMatchStatus {
    pub active_match_id: Option<MatchId>,
    pub last_updated: DateTime<Utc>,
}

impl WalletMatchStatus {
    pub fn idle(at: DateTime<Utc>) -> Self {
        Self {
            active_match_id: None,
            last_updated: at,
        }
    }

    pub fn busy(match_id: MatchId, at: DateTime<Utc>) -> Self {
        Self {
            active_match_id: Some(match_id),
            last_updated: at,
        }
    }
}

/// Outcome of a create/join eligibility check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eligibility {
    pub allowed: bool,
    pub active_match_id: Option<MatchId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Eligibility {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            active_match_id: None,
            reason: None,
        }
    }

    pub fn blocked(match_id: MatchId, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            active_match_id: Some(match_id),
            reason: Some(reason.into()),
        }
    }
}

/// Lowercase a wallet address so lookups are case-insensitive.
pub fn normalize_wallet(wallet: &str) -> String {
    wallet.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_eligibility_names_match() {
        let e = Eligibility::blocked(9, "wallet already in match 9");
        assert!(!e.allowed);
        assert_eq!(e.active_match_id, Some(9));

        let json = serde_json::to_string(&Eligibility::allowed()).unwrap();
        assert!(!json.contains("reason"));
    }

    #[test]
    fn test_normalize_wallet() {
        assert_eq!(normalize_wallet(" 0xABcd "), "0xabcd");
    }
}
