use std::collections::BTreeMap;

use super::match_entity::{rank_by_score, MatchResult, Participant, SizeClass};
use super::quantity::Quantity;

const FULL_BPS: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizePolicy {
    pub entry_fee: Quantity,
    /// Share of the prize pool per paid position, in basis points.
    pub split_bps: Vec<u32>,
}

/// Entry fees and reward splits per size class.
///
/// The ledger owns these numbers; the defaults mirror the deployed contract
/// and are replaceable when the ledger reports different ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeSchedule {
    policies: BTreeMap<SizeClass, SizePolicy>,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        let mut policies = BTreeMap::new();
        policies.insert(
            SizeClass::TwoPlayer,
            SizePolicy {
                entry_fee: Quantity::native(1),
                split_bps: vec![10_000],
            },
        );
        policies.insert(
            SizeClass::FourPlayer,
            SizePolicy {
                entry_fee: Quantity::native(2),
                split_bps: vec![7_000, 3_000],
            },
        );
        policies.insert(
            SizeClass::FivePlayer,
            SizePolicy {
                entry_fee: Quantity::native(2),
                split_bps: vec![6_000, 3_000, 1_000],
            },
        );
        policies.insert(
            SizeClass::TenPlayer,
            SizePolicy {
                entry_fee: Quantity::native(2),
                split_bps: vec![5_000, 3_000, 2_000],
            },
        );
        Self { policies }
    }
}

impl FeeSchedule {
    /// Replace one size class; rejects splits that pay out more than the pool.
    pub fn with_policy(mut self, size: SizeClass, policy: SizePolicy) -> Result<Self, String> {
        let total: u32 = policy.split_bps.iter().sum();
        if total > FULL_BPS {
            return Err(format!(
                "split for {}-player matches sums to {} bps",
                size, total
            ));
        }
        self.policies.insert(size, policy);
        Ok(self)
    }

    pub fn policy(&self, size: SizeClass) -> Option<&SizePolicy> {
        self.policies.get(&size)
    }

    pub fn entry_fee(&self, size: SizeClass) -> Quantity {
        self.policy(size)
            .map(|p| p.entry_fee)
            .unwrap_or(Quantity::ZERO)
    }

    pub fn prize_pool(&self, size: SizeClass, participants: usize) -> Quantity {
        self.entry_fee(size)
            .checked_mul(participants as u128)
            .unwrap_or(Quantity::new(u128::MAX))
    }

    /// Rewards for positions 1..=k where k is the number of paid positions that can be filled.
    pub fn expected_rewards(&self, size: SizeClass, participants: usize) -> Vec<Quantity> {
        let pool = self.prize_pool(size, participants);
        self.policy(size)
            .map(|p| {
                p.split_bps
                    .iter()
                    .take(participants)
                    .map(|bps| pool.mul_bps(*bps))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Derive placements from raw scores: descending score, ties by participant order.
    pub fn results_from_scores(
        &self,
        size: SizeClass,
        participants: &[Participant],
        prize_pool: Quantity,
    ) -> Vec<MatchResult> {
        let split = self
            .policy(size)
            .map(|p| p.split_bps.as_slice())
            .unwrap_or(&[]);

        rank_by_score(participants)
            .into_iter()
            .enumerate()
            .map(|(place, index)| {
                let player = &participants[index];
                let reward = split
                    .get(place)
                    .map(|bps| prize_pool.mul_bps(*bps))
                    .unwrap_or(Quantity::ZERO);
                MatchResult {
                    wallet: player.wallet.clone(),
                    position: place as u32 + 1,
                    score: player.score,
                    reward,
                }
            })
            .collect()
    }

    /// Sanity check applied before results are accepted as settlement truth.
    pub fn validate_results(results: &[MatchResult], prize_pool: Quantity) -> Result<(), String> {
        if results.is_empty() {
            return Err("result set is empty".to_string());
        }
        let paid: Quantity = results.iter().map(|r| r.reward).sum();
        if paid > prize_pool {
            return Err(format!(
                "rewards {} exceed prize pool {}",
                paid, prize_pool
            ));
        }
        let mut positions: Vec<u32> = results.iter().map(|r| r.position).collect();
        positions.sort_unstable();
        positions.dedup();
        if positions.len() != results.len() || positions.first() != Some(&1) {
            return Err("positions must be unique and start at 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn players(n: usize) -> Vec<Participant> {
        (0..n)
            .map(|i| Participant {
                wallet: format!("0x{:040x}", i + 1),
                entity_id: i as u64,
                boost: 0,
                score: Quantity::from(100 - i as u64 * 10),
            })
            .collect()
    }

    #[test]
    fn test_two_player_winner_takes_pool() {
        let fees = FeeSchedule::default();
        let pool = fees.prize_pool(SizeClass::TwoPlayer, 2);
        let results = fees.results_from_scores(SizeClass::TwoPlayer, &players(2), pool);

        let paid: Vec<_> = results.iter().filter(|r| !r.reward.is_zero()).collect();
        assert_eq!(paid.len(), 1);
        assert_eq!(paid[0].reward, Quantity::native(2));
        assert_eq!(paid[0].reward, fees.entry_fee(SizeClass::TwoPlayer).checked_mul(2).unwrap());
    }

    #[test]
    fn test_four_player_seventy_thirty() {
        let fees = FeeSchedule::default();
        let rewards = fees.expected_rewards(SizeClass::FourPlayer, 4);
        assert_eq!(
            rewards,
            vec![
                Quantity::new(5_600_000_000_000_000_000),
                Quantity::new(2_400_000_000_000_000_000)
            ]
        );

        let pool = fees.prize_pool(SizeClass::FourPlayer, 4);
        let results = fees.results_from_scores(SizeClass::FourPlayer, &players(4), pool);
        assert_eq!(results.len(), 4);
        assert!(results[2].reward.is_zero());
        assert!(results[3].reward.is_zero());
        assert!(FeeSchedule::validate_results(&results, pool).is_ok());
    }

    #[test]
    fn test_validate_rejects_overpayment() {
        let results = vec![MatchResult {
            wallet: "0xa".to_string(),
            position: 1,
            score: Quantity::from(1u64),
            reward: Quantity::native(3),
        }];
        assert!(FeeSchedule::validate_results(&results, Quantity::native(2)).is_err());
        assert!(FeeSchedule::validate_results(&[], Quantity::native(2)).is_err());
    }

    #[test]
    fn test_with_policy_rejects_oversized_split() {
        let policy = SizePolicy {
            entry_fee: Quantity::native(1),
            split_bps: vec![8_000, 3_000],
        };
        assert!(FeeSchedule::default()
            .with_policy(SizeClass::FourPlayer, policy)
            .is_err());
    }
}
