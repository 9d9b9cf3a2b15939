// Copyright (C) 2024, 2025 Etherpool Developers (see AUTHORS)
//
// This file is part of Etherpool
//
// Etherpool is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Etherpool is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// Etherpool. If not, see <https://www.gnu.org/licenses/>.

//! Per-network monetary policy and round reward distribution.
//!
//! Everything here is pure: big-integer wei amounts in, Shannon credits out.

use crate::config::Network;
use crate::util::shannon;
use num_bigint::{BigInt, BigUint};
use num_rational::BigRational;
use num_traits::{ToPrimitive, Zero};
use std::collections::HashMap;

/// Hard-fork heights and era schedule for one network.
#[derive(Debug, Clone)]
pub struct MonetaryPolicy {
    pub network: Network,
    /// ECIP-1017 era length (Classic family)
    pub ecip1017_era_rounds: u64,
    /// Ethereum-family fork heights
    pub byzantium_height: u64,
    pub constantinople_height: u64,
    pub london_height: u64,
}

impl MonetaryPolicy {
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Classic => Self {
                network,
                ecip1017_era_rounds: 5_000_000,
                byzantium_height: 0,
                constantinople_height: 0,
                london_height: 0,
            },
            Network::Mordor => Self {
                network,
                ecip1017_era_rounds: 2_000_000,
                byzantium_height: 0,
                constantinople_height: 0,
                london_height: 0,
            },
            Network::Ethereum => Self {
                network,
                ecip1017_era_rounds: 0,
                byzantium_height: 4_370_000,
                constantinople_height: 7_280_000,
                london_height: 12_965_000,
            },
            Network::Ropsten => Self {
                network,
                ecip1017_era_rounds: 0,
                byzantium_height: 1_700_000,
                constantinople_height: 4_230_000,
                london_height: 10_499_401,
            },
            Network::Ubiq => Self {
                network,
                ecip1017_era_rounds: 0,
                byzantium_height: 0,
                constantinople_height: 0,
                london_height: 0,
            },
        }
    }
}

fn wei(n: u64) -> BigUint {
    BigUint::from(n) * BigUint::from(1_000_000_000_000_000_000u64)
}

/// Zero-indexed ECIP-1017 era for a block height.
pub fn block_era(height: u64, era_rounds: u64) -> u64 {
    if height == 0 || era_rounds == 0 {
        return 0;
    }
    (height - 1) / era_rounds
}

/// Classic-family static reward: 5 ETC decaying by 4/5 each era, computed
/// exactly as (5e18 * 4^era) / 5^era.
pub fn const_reward_classic(era: u64) -> BigUint {
    let base = wei(5);
    if era == 0 {
        return base;
    }
    let q = BigUint::from(4u32).pow(era as u32);
    let d = BigUint::from(5u32).pow(era as u32);
    base * q / d
}

/// Reward credited to a block for each uncle it includes.
pub fn uncle_inclusion_reward(reward: &BigUint) -> BigUint {
    reward / BigUint::from(32u32)
}

/// Classic-family reward paid to the uncle itself. Era 0 pays the Frontier
/// depth schedule, later eras a flat 1/32.
pub fn uncle_reward_classic(uncle_height: u64, height: u64, era: u64, reward: &BigUint) -> BigUint {
    if era == 0 {
        depth_scaled_reward(uncle_height, height, reward, 8)
    } else {
        uncle_inclusion_reward(reward)
    }
}

/// Ethereum-family static reward by fork schedule.
pub fn static_reward_ethereum(height: u64, policy: &MonetaryPolicy) -> BigUint {
    let mut reward = wei(5);
    if policy.byzantium_height <= height {
        reward = wei(3);
    }
    if policy.constantinople_height <= height {
        reward = wei(2);
    }
    reward
}

/// burntFees = baseFeePerGas * gasUsed
pub fn london_burnt_fees(base_fee_per_gas: &BigUint, gas_used: &BigUint) -> BigUint {
    base_fee_per_gas * gas_used
}

/// Ethereum-family block reward: the static reward minus the London burn,
/// clamped at zero.
pub fn const_reward_ethereum(
    height: u64,
    base_fee_per_gas: &BigUint,
    gas_used: &BigUint,
    policy: &MonetaryPolicy,
) -> BigUint {
    let reward = static_reward_ethereum(height, policy);
    if policy.london_height != 0 && policy.london_height <= height {
        let burnt = london_burnt_fees(base_fee_per_gas, gas_used);
        if burnt >= reward {
            return BigUint::zero();
        }
        return reward - burnt;
    }
    reward
}

/// Ethereum-family uncle reward: (uncleHeight + 8 - height) * reward / 8,
/// never negative.
pub fn uncle_reward_ethereum(uncle_height: u64, height: u64, reward: &BigUint) -> BigUint {
    depth_scaled_reward(uncle_height, height, reward, 8)
}

/// Ubiq piecewise-constant reward schedule.
pub fn const_reward_ubiq(height: u64) -> BigUint {
    let mut reward = wei(8);
    if height > 358_363 {
        reward = wei(7);
    }
    if height > 716_727 {
        reward = wei(6);
    }
    if height > 1_075_090 {
        reward = wei(5);
    }
    if height > 1_433_454 {
        reward = wei(4);
    }
    if height > 1_791_818 {
        reward = wei(3);
    }
    if height > 2_150_181 {
        reward = wei(2);
    }
    if height > 2_508_545 {
        reward = wei(1);
    }
    reward
}

/// Ubiq uncle reward: (uncleHeight + 2 - height) * reward / 2, never
/// negative.
pub fn uncle_reward_ubiq(uncle_height: u64, height: u64, reward: &BigUint) -> BigUint {
    depth_scaled_reward(uncle_height, height, reward, 2)
}

/// (uncleHeight + k - height) * reward / k with the negative case clamped.
fn depth_scaled_reward(uncle_height: u64, height: u64, reward: &BigUint, k: u64) -> BigUint {
    let factor = uncle_height as i128 + k as i128 - height as i128;
    if factor <= 0 {
        return BigUint::zero();
    }
    reward * BigUint::from(factor as u64) / BigUint::from(k)
}

/// Returns (minersProfit, poolProfit) for a round's revenue.
pub fn charge_fee(revenue: &BigRational, fee_percent: f64) -> (BigRational, BigRational) {
    let fee = BigRational::from_float(fee_percent / 100.0).unwrap_or_else(BigRational::zero);
    let pool = revenue * &fee;
    (revenue - &pool, pool)
}

/// PPLNS-by-round split: each login receives its proportional slice of the
/// miners' profit, floored to whole Shannon.
pub fn rewards_for_shares(
    shares: &HashMap<String, u64>,
    total: u64,
    miners_profit: &BigRational,
) -> HashMap<String, i64> {
    let mut rewards = HashMap::new();
    if total == 0 {
        return rewards;
    }
    for (login, n) in shares {
        let percent = BigRational::new(BigInt::from(*n), BigInt::from(total));
        let worker_reward = miners_profit * percent;
        *rewards.entry(login.clone()).or_insert(0) += wei_to_shannon(&worker_reward);
    }
    rewards
}

/// Exact floor division of a wei amount into Shannon.
pub fn wei_to_shannon(amount: &BigRational) -> i64 {
    let in_shannon = amount / BigRational::from_integer(BigInt::from(1_000_000_000u64));
    in_shannon.floor().to_integer().to_i64().unwrap_or(0)
}

pub fn biguint_to_rational(n: &BigUint) -> BigRational {
    BigRational::from_integer(BigInt::from(n.clone()))
}

/// Shannon credit for a plain wei amount, floored.
pub fn wei_biguint_to_shannon(amount: &BigUint) -> i64 {
    (amount / shannon()).to_i64().unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::One;
    use proptest::prelude::*;

    #[test]
    fn test_block_era_boundaries() {
        let rounds = 5_000_000;
        assert_eq!(block_era(0, rounds), 0);
        assert_eq!(block_era(1, rounds), 0);
        assert_eq!(block_era(5_000_000, rounds), 0);
        assert_eq!(block_era(5_000_001, rounds), 1);
        assert_eq!(block_era(10_000_000, rounds), 1);
        assert_eq!(block_era(10_000_001, rounds), 2);
    }

    #[test]
    fn test_const_reward_classic_decay() {
        assert_eq!(const_reward_classic(0), wei(5));
        // era 1: 5e18 * 4/5 = 4e18
        assert_eq!(const_reward_classic(1), wei(4));
        // era 2: 5e18 * 16/25 = 3.2e18
        assert_eq!(
            const_reward_classic(2),
            BigUint::from(3_200_000_000_000_000_000u64)
        );
    }

    #[test]
    fn test_uncle_reward_classic_era0_depth() {
        let reward = const_reward_classic(0);
        // depth 1: 7/8 of the reward
        assert_eq!(
            uncle_reward_classic(2_534_998, 2_534_999, 0, &reward),
            BigUint::from(4_375_000_000_000_000_000u64)
        );
        // era 1 is a flat 1/32
        assert_eq!(
            uncle_reward_classic(6_000_000, 6_000_001, 1, &const_reward_classic(1)),
            const_reward_classic(1) / BigUint::from(32u32)
        );
    }

    #[test]
    fn test_static_reward_ethereum_forks() {
        let policy = MonetaryPolicy::for_network(Network::Ethereum);
        assert_eq!(static_reward_ethereum(4_369_999, &policy), wei(5));
        assert_eq!(static_reward_ethereum(4_370_000, &policy), wei(3));
        assert_eq!(static_reward_ethereum(7_280_000, &policy), wei(2));
    }

    #[test]
    fn test_london_burn_subtracts_and_clamps() {
        let policy = MonetaryPolicy::for_network(Network::Ethereum);
        let base_fee = BigUint::from(100_000_000_000u64); // 100 gwei
        let gas_used = BigUint::from(10_000_000u64);
        // burnt = 1e18, static = 2e18
        assert_eq!(
            const_reward_ethereum(13_000_000, &base_fee, &gas_used, &policy),
            wei(1)
        );
        // pathological burn exceeds the reward
        let huge_fee = BigUint::from(1_000_000_000_000u64);
        assert_eq!(
            const_reward_ethereum(13_000_000, &huge_fee, &BigUint::from(30_000_000u64), &policy),
            BigUint::zero()
        );
        // pre-London ignores base fee
        assert_eq!(
            const_reward_ethereum(12_000_000, &huge_fee, &gas_used, &policy),
            wei(2)
        );
    }

    #[test]
    fn test_const_reward_ubiq_schedule() {
        assert_eq!(const_reward_ubiq(1), wei(8));
        assert_eq!(const_reward_ubiq(358_364), wei(7));
        assert_eq!(const_reward_ubiq(2_508_546), wei(1));
        assert_eq!(const_reward_ubiq(10_000_000), wei(1));
    }

    #[test]
    fn test_uncle_reward_ubiq() {
        let reward = wei(8);
        // depth 1: half
        assert_eq!(uncle_reward_ubiq(999, 1000, &reward), wei(4));
        // depth 2: zero
        assert_eq!(uncle_reward_ubiq(998, 1000, &reward), BigUint::zero());
        // deeper than the schedule allows
        assert_eq!(uncle_reward_ubiq(990, 1000, &reward), BigUint::zero());
    }

    #[test]
    fn test_charge_fee() {
        let revenue = biguint_to_rational(&wei(5));
        let (miners, pool) = charge_fee(&revenue, 1.0);
        assert_eq!(&miners + &pool, revenue);
        assert_eq!(wei_to_shannon(&pool), 50_000_000); // 0.05 coin
    }

    #[test]
    fn test_rewards_for_shares_split() {
        let mut shares = HashMap::new();
        shares.insert("0xaa".to_string(), 60u64);
        shares.insert("0xbb".to_string(), 40u64);
        let profit = biguint_to_rational(&wei(1));
        let rewards = rewards_for_shares(&shares, 100, &profit);
        assert_eq!(rewards["0xaa"], 600_000_000);
        assert_eq!(rewards["0xbb"], 400_000_000);
    }

    #[test]
    fn test_wei_to_shannon_floors() {
        let r = BigRational::new(BigInt::from(2_999_999_999u64), BigInt::one());
        assert_eq!(wei_to_shannon(&r), 2);
        assert_eq!(wei_biguint_to_shannon(&BigUint::from(1_999_999_999u64)), 1);
    }

    proptest! {
        // conservation: distributed Shannon never exceeds the round's floor
        #[test]
        fn reward_conservation(
            reward_wei in 1u128..=8_000_000_000_000_000_000u128,
            share_values in proptest::collection::vec(1u64..=1_000_000u64, 1..12),
        ) {
            let total: u64 = share_values.iter().sum();
            let shares: HashMap<String, u64> = share_values
                .iter()
                .enumerate()
                .map(|(i, n)| (format!("0x{i:040x}"), *n))
                .collect();
            let profit = BigRational::from_integer(BigInt::from(reward_wei));
            let rewards = rewards_for_shares(&shares, total, &profit);

            let distributed: i64 = rewards.values().sum();
            let ceiling = wei_to_shannon(&profit);
            prop_assert!(distributed <= ceiling);
            prop_assert!(rewards.values().all(|r| *r >= 0));
        }

        // era decay is strict across the whole plausible range
        #[test]
        fn era_reward_monotonicity(era in 0u64..96) {
            let current = const_reward_classic(era);
            let next = const_reward_classic(era + 1);
            prop_assert!(next < current);
        }

        // 5e18 carries 5^19, so the 4/5 ratio is exact while 5^era divides
        // the numerator
        #[test]
        fn era_reward_exact_ratio(era in 0u64..19) {
            let current = const_reward_classic(era);
            let next = const_reward_classic(era + 1);
            prop_assert_eq!(&next * BigUint::from(5u32), current * BigUint::from(4u32));
        }

        // uncle rewards stay within [0, staticReward] and vanish below the
        // depth window
        #[test]
        fn uncle_reward_bounds(height in 10u64..10_000_000, depth in 1u64..20) {
            let uncle_height = height.saturating_sub(depth);
            let policy = MonetaryPolicy::for_network(Network::Ethereum);
            let reward = static_reward_ethereum(height, &policy);
            let uncle = uncle_reward_ethereum(uncle_height, height, &reward);
            prop_assert!(uncle <= reward);
            if depth >= 8 {
                prop_assert_eq!(uncle, BigUint::zero());
            }

            let ubiq_reward = const_reward_ubiq(height);
            let ubiq_uncle = uncle_reward_ubiq(uncle_height, height, &ubiq_reward);
            prop_assert!(ubiq_uncle <= ubiq_reward);
            if depth >= 2 {
                prop_assert_eq!(ubiq_uncle, BigUint::zero());
            }
        }

        // London reward never goes negative on any input
        #[test]
        fn london_burn_never_negative(
            base_fee in any::<u64>(),
            gas_used in any::<u32>(),
            height in 12_965_000u64..20_000_000,
        ) {
            let policy = MonetaryPolicy::for_network(Network::Ethereum);
            let reward = const_reward_ethereum(
                height,
                &BigUint::from(base_fee),
                &BigUint::from(gas_used),
                &policy,
            );
            prop_assert!(reward <= static_reward_ethereum(height, &policy));
        }
    }
}
