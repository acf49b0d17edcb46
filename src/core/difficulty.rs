use crate::core::block::{BlockHeader, BlockSummary};
use crate::core::params::NetworkParams;
use log::debug;
use num_bigint::{BigInt, Sign};

/// Largest per-block change of the target, in thousandths
const MAX_SCALE: i64 = 500;

/// Work credited to a block is `max_target * WORK_MULTIPLIER / target`
const WORK_MULTIPLIER: i64 = 1024;

// Timestamps come from peers, so elapsed times are computed in BigInt and
// only brought back to i64 once averaged
fn saturate_i64(value: &BigInt) -> i64 {
    i64::try_from(value).unwrap_or(if value.sign() == Sign::Minus {
        i64::MIN
    } else {
        i64::MAX
    })
}

/// Retargeting from rolling weighted averages of solve time and target
pub struct DifficultyAdjustment;

impl DifficultyAdjustment {
    /// Target the next block must carry.
    ///
    /// `prev` is the parent summary; `None` or the start summary (timestamp 0)
    /// means the block is block zero. Larger targets are easier.
    pub fn calc_next_target(
        prev: Option<&BlockSummary>,
        params: &NetworkParams,
        clock_time: i64,
    ) -> BigInt {
        let prev = match prev {
            Some(p) if p.header.timestamp != 0 => p,
            _ => return params.max_target.clone(),
        };

        let weight = params.avg_weight;
        let decay = 1000 - weight;
        let delta = BigInt::from(clock_time) - prev.header.timestamp;

        let average_time =
            (BigInt::from(prev.blocktime_average_ms) * decay + &delta * weight) / 1000;
        let raw_scale: BigInt = (average_time * 1000 / params.block_time_target - 1000) / 2;
        let scale = raw_scale.clamp(BigInt::from(-MAX_SCALE), BigInt::from(MAX_SCALE));

        let prev_target_avg = prev.target_average();
        let new_target: BigInt = &prev_target_avg + &prev_target_avg * &scale / 1000;

        debug!("Retarget at {clock_time}: scale {scale}, elapsed {delta}ms");
        new_target.min(params.max_target.clone())
    }

    /// Derives the summary for `header` given its parent's summary.
    pub fn new_summary(
        header: &BlockHeader,
        prev: &BlockSummary,
        params: &NetworkParams,
    ) -> BlockSummary {
        let target = header.target_int();
        let work_in_block = if target > BigInt::from(0) {
            &params.max_target * WORK_MULTIPLIER / &target
        } else {
            BigInt::from(0)
        };
        let work_sum = prev.work_sum() + work_in_block;

        let weight = params.avg_weight;
        let decay = 1000 - weight;

        let (block_time, prev_block_time, prev_target_avg) = if prev.header.timestamp == 0 {
            (
                BigInt::from(params.block_time_target),
                BigInt::from(params.block_time_target),
                params.max_target.clone(),
            )
        } else {
            (
                BigInt::from(header.timestamp) - prev.header.timestamp,
                BigInt::from(prev.blocktime_average_ms),
                prev.target_average(),
            )
        };

        let blocktime_average =
            saturate_i64(&((prev_block_time * decay + block_time * weight) / 1000));
        let target_average = (prev_target_avg * decay + &target * weight) / 1000;

        let mut activated_field = prev.activated_field;
        if let Some(next) = params.get_snow_field(activated_field + 1) {
            if target_average < next.activation_target {
                activated_field += 1;
            }
        }

        BlockSummary::new(
            header.clone(),
            &work_sum,
            blocktime_average,
            &target_average,
            activated_field,
        )
    }
}
