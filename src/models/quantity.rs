use rust_decimal::Decimal;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

/// Decimals of the ledger's native unit (1 MON = 10^18 base units).
pub const NATIVE_DECIMALS: u32 = 18;
const NATIVE_UNIT: u128 = 1_000_000_000_000_000_000;
const BPS_DENOMINATOR: u128 = 10_000;
const TYPE_TAG: &str = "bigint";

/// Unsigned ledger integer: reward amounts in base units, prize pools, scores.
///
/// Never converted through floating point. The canonical encoding is
/// `{"__type":"bigint","value":"<decimal>"}` so values survive the durable
/// cache tier unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quantity(u128);

impl Quantity {
    pub const ZERO: Quantity = Quantity(0);

    pub const fn new(raw: u128) -> Self {
        Self(raw)
    }

    /// Whole native units (e.g. `Quantity::native(2)` is 2 MON).
    pub const fn native(whole: u64) -> Self {
        Self(whole as u128 * NATIVE_UNIT)
    }

    pub const fn raw(&self) -> u128 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Quantity) -> Option<Quantity> {
        self.0.checked_add(other.0).map(Quantity)
    }

    pub fn checked_mul(self, factor: u128) -> Option<Quantity> {
        self.0.checked_mul(factor).map(Quantity)
    }

    /// Exact `self * bps / 10_000`, rounding down.
    pub fn mul_bps(self, bps: u32) -> Quantity {
        let bps = bps as u128;
        let whole = (self.0 / BPS_DENOMINATOR) * bps;
        let rest = (self.0 % BPS_DENOMINATOR) * bps / BPS_DENOMINATOR;
        Quantity(whole + rest)
    }

    /// Display value in units with `decimals` places; `None` if it does not fit a `Decimal`.
    pub fn to_units(&self, decimals: u32) -> Option<Decimal> {
        let mantissa = i128::try_from(self.0).ok()?;
        Decimal::try_from_i128_with_scale(mantissa, decimals)
            .ok()
            .map(|d| d.normalize())
    }

    pub fn to_native_units(&self) -> Option<Decimal> {
        self.to_units(NATIVE_DECIMALS)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Quantity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parsed = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
            Some(hex) if hex.is_empty() => Ok(0),
            Some(hex) => u128::from_str_radix(hex, 16),
            None => trimmed.parse::<u128>(),
        };
        parsed
            .map(Quantity)
            .map_err(|e| format!("invalid quantity {:?}: {}", s, e))
    }
}

impl From<u64> for Quantity {
    fn from(value: u64) -> Self {
        Quantity(value as u128)
    }
}

impl From<u128> for Quantity {
    fn from(value: u128) -> Self {
        Quantity(value)
    }
}

impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        Quantity(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Quantity) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sum for Quantity {
    fn sum<I: Iterator<Item = Quantity>>(iter: I) -> Quantity {
        iter.fold(Quantity::ZERO, |acc, q| acc + q)
    }
}

impl<'a> Sum<&'a Quantity> for Quantity {
    fn sum<I: Iterator<Item = &'a Quantity>>(iter: I) -> Quantity {
        iter.copied().sum()
    }
}

#[derive(Serialize)]
struct TaggedOut<'a> {
    #[serde(rename = "__type")]
    kind: &'a str,
    value: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QuantityRepr {
    Tagged {
        #[serde(rename = "__type")]
        kind: String,
        value: String,
    },
    Text(String),
    Number(u64),
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        TaggedOut {
            kind: TYPE_TAG,
            value: self.0.to_string(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match QuantityRepr::deserialize(deserializer)? {
            QuantityRepr::Tagged { kind, value } => {
                if kind != TYPE_TAG {
                    return Err(D::Error::custom(format!("unexpected type tag {:?}", kind)));
                }
                value.parse().map_err(D::Error::custom)
            }
            QuantityRepr::Text(text) => text.parse().map_err(D::Error::custom),
            QuantityRepr::Number(n) => Ok(Quantity::from(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_encoding_preserves_large_values() {
        let q = Quantity::new(u128::MAX - 7);
        let json = serde_json::to_string(&q).unwrap();
        assert!(json.contains("\"__type\":\"bigint\""));

        let back: Quantity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, q);
    }

    #[test]
    fn test_accepts_rpc_forms() {
        let hex: Quantity = serde_json::from_str("\"0x10\"").unwrap();
        let text: Quantity = serde_json::from_str("\"5600000000000000000\"").unwrap();
        let number: Quantity = serde_json::from_str("42").unwrap();

        assert_eq!(hex, Quantity::new(16));
        assert_eq!(text, Quantity::new(5_600_000_000_000_000_000));
        assert_eq!(number, Quantity::new(42));
    }

    #[test]
    fn test_rejects_foreign_tag() {
        let result: Result<Quantity, _> =
            serde_json::from_str(r#"{"__type":"float","value":"1.5"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_mul_bps_is_exact() {
        let pool = Quantity::native(8);
        assert_eq!(pool.mul_bps(7_000), Quantity::new(5_600_000_000_000_000_000));
        assert_eq!(pool.mul_bps(3_000), Quantity::new(2_400_000_000_000_000_000));
        assert_eq!(Quantity::new(u128::MAX).mul_bps(10_000), Quantity::new(u128::MAX));
    }

    #[test]
    fn test_native_units_display() {
        let reward = Quantity::new(5_600_000_000_000_000_000);
        assert_eq!(reward.to_native_units().unwrap().to_string(), "5.6");
        assert_eq!(Quantity::native(2).to_native_units().unwrap().to_string(), "2");
    }

    #[test]
    fn test_sum() {
        let total: Quantity = [Quantity::native(1), Quantity::native(2)].iter().sum();
        assert_eq!(total, Quantity::native(3));
    }
}
