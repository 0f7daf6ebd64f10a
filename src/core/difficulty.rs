use crate::core::Block;
use log::info;

// Difficulty adjustment constants
const TARGET_BLOCK_TIME: u64 = 120_000; // 2 minutes in milliseconds
const DIFFICULTY_ADJUSTMENT_PERIOD: u64 = 10; // Adjust every 10 blocks
const INITIAL_DIFFICULTY: u32 = 1;
const MIN_DIFFICULTY: u32 = 1;

/// Difficulty adjustment for maintaining consistent block times.
///
/// Adjustment happens only at period boundaries: if the last period ran in
/// less than half the expected time the difficulty steps up by one, if it
/// took more than double it steps down by one (never below the minimum),
/// otherwise it is unchanged. Off-boundary blocks inherit the tip's value.
pub struct DifficultyAdjustment;

impl DifficultyAdjustment {
    /// Difficulty for the block that would extend the given chain
    pub fn next_difficulty(chain: &[Block]) -> u32 {
        let next_index = chain.len() as u64;
        let current = chain
            .last()
            .map(|block| block.get_difficulty())
            .unwrap_or(INITIAL_DIFFICULTY);

        if next_index < DIFFICULTY_ADJUSTMENT_PERIOD
            || next_index % DIFFICULTY_ADJUSTMENT_PERIOD != 0
        {
            return current;
        }

        let window = &chain[chain.len() - DIFFICULTY_ADJUSTMENT_PERIOD as usize..];
        let first = window[0].get_timestamp();
        let last = window[window.len() - 1].get_timestamp();
        let actual_time = last.saturating_sub(first).max(0) as u64;
        let target_time = TARGET_BLOCK_TIME * DIFFICULTY_ADJUSTMENT_PERIOD;

        let adjusted = if actual_time < target_time / 2 {
            current + 1
        } else if actual_time > target_time * 2 {
            current.saturating_sub(1).max(MIN_DIFFICULTY)
        } else {
            current
        };

        if adjusted != current {
            info!(
                "Difficulty adjustment at height {next_index}: {current} -> {adjusted} (actual: {actual_time}ms, target: {target_time}ms)"
            );
        }

        adjusted
    }

    pub fn get_initial_difficulty() -> u32 {
        INITIAL_DIFFICULTY
    }

    pub fn get_adjustment_period() -> u64 {
        DIFFICULTY_ADJUSTMENT_PERIOD
    }

    pub fn get_target_block_time() -> u64 {
        TARGET_BLOCK_TIME
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Transaction, ZERO_HASH};

    fn block_at(index: u64, timestamp: i64, difficulty: u32) -> Block {
        let coinbase = Transaction::new_coinbase("miner".to_string(), 50).unwrap();
        Block::from_parts(
            index,
            timestamp,
            vec![coinbase],
            ZERO_HASH.to_string(),
            "irrelevant".to_string(),
            0,
            difficulty,
            ZERO_HASH.to_string(),
            None,
            None,
        )
    }

    fn chain_with_spacing(len: u64, spacing_ms: i64, difficulty: u32) -> Vec<Block> {
        (0..len)
            .map(|i| block_at(i, i as i64 * spacing_ms, difficulty))
            .collect()
    }

    #[test]
    fn empty_chain_uses_initial_difficulty() {
        assert_eq!(DifficultyAdjustment::next_difficulty(&[]), INITIAL_DIFFICULTY);
    }

    #[test]
    fn off_boundary_inherits_tip_difficulty() {
        let chain = chain_with_spacing(7, 1_000, 3);
        assert_eq!(DifficultyAdjustment::next_difficulty(&chain), 3);
    }

    #[test]
    fn fast_window_steps_up() {
        // 10 blocks, 10s apart: 90s elapsed vs 1200s expected
        let chain = chain_with_spacing(10, 10_000, 4);
        assert_eq!(DifficultyAdjustment::next_difficulty(&chain), 5);
    }

    #[test]
    fn slow_window_steps_down() {
        // 10 blocks, 300s apart: 2700s elapsed vs 1200s expected
        let chain = chain_with_spacing(10, 300_000, 4);
        assert_eq!(DifficultyAdjustment::next_difficulty(&chain), 3);
    }

    #[test]
    fn on_pace_window_is_unchanged() {
        // 10 blocks at the target spacing
        let chain = chain_with_spacing(10, TARGET_BLOCK_TIME as i64, 4);
        assert_eq!(DifficultyAdjustment::next_difficulty(&chain), 4);
    }

    #[test]
    fn difficulty_never_drops_below_minimum() {
        let chain = chain_with_spacing(10, 10_000_000, MIN_DIFFICULTY);
        assert_eq!(
            DifficultyAdjustment::next_difficulty(&chain),
            MIN_DIFFICULTY
        );
    }
}
