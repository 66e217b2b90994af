use serde::{Deserialize, Serialize};

use super::match_entity::{MatchId, MatchResult, SizeClass};
use super::quantity::Quantity;

/// Event record as decoded from a ledger log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedEvent {
    pub name: String,
    #[serde(default)]
    pub match_id: Option<MatchId>,
    pub block: u64,
    #[serde(default)]
    pub log_index: u32,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Ledger-emitted events the engine reacts to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    Created {
        match_id: MatchId,
        size: SizeClass,
        creator: String,
    },
    Joined {
        match_id: MatchId,
        wallet: String,
    },
    Started {
        match_id: MatchId,
    },
    Ended {
        match_id: MatchId,
        results: Vec<MatchResult>,
    },
    RevenueWithdrawn {
        amount: Quantity,
    },
}

impl LedgerEvent {
    pub fn match_id(&self) -> Option<MatchId> {
        match self {
            LedgerEvent::Created { match_id, .. }
            | LedgerEvent::Joined { match_id, .. }
            | LedgerEvent::Started { match_id }
            | LedgerEvent::Ended { match_id, .. } => Some(*match_id),
            LedgerEvent::RevenueWithdrawn { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LedgerEvent::Created { .. } => "Created",
            LedgerEvent::Joined { .. } => "Joined",
            LedgerEvent::Started { .. } => "Started",
            LedgerEvent::Ended { .. } => "Ended",
            LedgerEvent::RevenueWithdrawn { .. } => "RevenueWithdrawn",
        }
    }
}

impl TryFrom<DecodedEvent> for LedgerEvent {
    type Error = String;

    fn try_from(event: DecodedEvent) -> Result<Self, Self::Error> {
        let require_id = || {
            event
                .match_id
                .ok_or_else(|| format!("{} event without match id", event.name))
        };
        let field = |name: &str| {
            event
                .payload
                .get(name)
                .cloned()
                .ok_or_else(|| format!("{} event missing {}", event.name, name))
        };

        match event.name.as_str() {
            "Created" => Ok(LedgerEvent::Created {
                match_id: require_id()?,
                size: serde_json::from_value(field("size")?).map_err(|e| e.to_string())?,
                creator: serde_json::from_value(field("creator")?).map_err(|e| e.to_string())?,
            }),
            "Joined" => Ok(LedgerEvent::Joined {
                match_id: require_id()?,
                wallet: serde_json::from_value(field("wallet")?).map_err(|e| e.to_string())?,
            }),
            "Started" => Ok(LedgerEvent::Started {
                match_id: require_id()?,
            }),
            "Ended" => Ok(LedgerEvent::Ended {
                match_id: require_id()?,
                results: serde_json::from_value(field("results")?)
                    .map_err(|e| e.to_string())?,
            }),
            "RevenueWithdrawn" => Ok(LedgerEvent::RevenueWithdrawn {
                amount: serde_json::from_value(field("amount")?).map_err(|e| e.to_string())?,
            }),
            other => Err(format!("unknown event {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_ended_event() {
        let decoded = DecodedEvent {
            name: "Ended".to_string(),
            match_id: Some(12),
            block: 900,
            log_index: 0,
            payload: serde_json::json!({
                "results": [
                    {"wallet": "0xa", "position": 1, "score": "40", "reward": "2000000000000000000"}
                ]
            }),
        };

        let event = LedgerEvent::try_from(decoded).unwrap();
        match event {
            LedgerEvent::Ended { match_id, results } => {
                assert_eq!(match_id, 12);
                assert_eq!(results[0].reward, Quantity::native(2));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_unknown_and_missing_id() {
        let unknown = DecodedEvent {
            name: "Paused".to_string(),
            match_id: None,
            block: 1,
            log_index: 0,
            payload: serde_json::Value::Null,
        };
        assert!(LedgerEvent::try_from(unknown).is_err());

        let missing = DecodedEvent {
            name: "Started".to_string(),
            match_id: None,
            block: 1,
            log_index: 0,
            payload: serde_json::Value::Null,
        };
        assert!(LedgerEvent::try_from(missing).is_err());
    }

    #[test]
    fn test_event_match_id() {
        assert_eq!(LedgerEvent::Started { match_id: 4 }.match_id(), Some(4));
        assert_eq!(
            LedgerEvent::RevenueWithdrawn { amount: Quantity::ZERO }.match_id(),
            None
        );
    }
}
