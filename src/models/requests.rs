use serde::{Deserialize, Serialize};
use validator::Validate;

use super::match_entity::{MatchId, SizeClass};

/// Upper bound on boosts applied to a single entry.
pub const MAX_BOOST: u32 = 10;

/// Create Match Request DTO
#[derive(Debug, Deserialize, Serialize, Clone, Validate)]
pub struct CreateMatchRequest {
    #[validate(length(equal = 42), custom(function = "validate_wallet"))]
    pub wallet: String,
    pub size: SizeClass,
}

/// Join Match Request DTO
#[derive(Debug, Deserialize, Serialize, Clone, Validate)]
pub struct JoinMatchRequest {
    #[validate(length(equal = 42), custom(function = "validate_wallet"))]
    pub wallet: String,
    pub match_id: MatchId,
    pub entity_id: u64,
    #[validate(range(max = 10))]
    pub boost: u32,
}

/// Start/Settle Match Request DTO
#[derive(Debug, Deserialize, Serialize, Clone, Validate)]
pub struct MatchActionRequest {
    #[validate(length(equal = 42), custom(function = "validate_wallet"))]
    pub wallet: String,
    pub match_id: MatchId,
}

/// Boost Purchase Request DTO
#[derive(Debug, Deserialize, Serialize, Clone, Validate)]
pub struct PurchaseBoostsRequest {
    #[validate(length(equal = 42), custom(function = "validate_wallet"))]
    pub wallet: String,
    #[validate(range(min = 1, max = 100))]
    pub amount: u32,
}

/// Handle returned by the ledger for a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxHandle {
    pub hash: String,
}

/// `0x` followed by hex digits; length is checked separately.
pub fn validate_wallet(wallet: &str) -> Result<(), validator::ValidationError> {
    let hex = wallet
        .strip_prefix("0x")
        .ok_or_else(|| validator::ValidationError::new("wallet_prefix"))?;
    if hex.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(validator::ValidationError::new("wallet_hex"))
    }
}
