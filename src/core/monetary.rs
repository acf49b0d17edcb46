//! Monetary units and the block reward schedule
//!
//! ## Units
//! - **Flake**: the smallest unit; every value on chain is in flakes
//! - **Snow**: 1,000,000 flakes
//! - **Block reward**: 50 snow at height 0, halving every four years of blocks

use crate::core::params::NetworkParams;

/// Number of flakes in one snow
pub const FLAKES_PER_SNOW: u64 = 1_000_000;

/// Block reward at height zero (50 snow)
pub const INITIAL_BLOCK_REWARD: u64 = 50 * FLAKES_PER_SNOW;

const DAYS_PER_HALVING: u64 = 4 * 365;

/// Blocks between reward halvings for this network's block time
pub fn halving_interval(params: &NetworkParams) -> u64 {
    let blocks_per_day = (86_400_000 / params.block_time_target.max(1)).max(1) as u64;
    blocks_per_day * DAYS_PER_HALVING
}

/// Coinbase allowance at `height`, before fees
///
/// ```
/// use frostline::core::monetary::{block_reward, INITIAL_BLOCK_REWARD};
/// use frostline::core::NetworkParams;
/// assert_eq!(block_reward(&NetworkParams::regtest(), 0), INITIAL_BLOCK_REWARD);
/// ```
pub fn block_reward(params: &NetworkParams, height: u32) -> u64 {
    let halvings = height as u64 / halving_interval(params);
    if halvings >= 64 {
        return 0;
    }
    INITIAL_BLOCK_REWARD >> halvings
}

/// Formats a flake amount as snow for display
pub fn format_snow(flakes: u64) -> String {
    format!(
        "{}.{:06}",
        flakes / FLAKES_PER_SNOW,
        flakes % FLAKES_PER_SNOW
    )
}
