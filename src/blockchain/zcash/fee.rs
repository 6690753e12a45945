//! Action-count fee policy and output planning
//!
//! `min_fee = max(floor, max(inputs, outputs) * per_action_fee)`, after the
//! conventional fee of ZIP 317 restricted to transparent actions.

use serde::Serialize;

use crate::blockchain::zcash::transaction::TxOutput;
use crate::config::InscriptionConfig;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeePolicy {
    pub per_action_fee: u64,
    pub fee_floor: u64,
    pub dust_limit: u64,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            per_action_fee: 5_000,
            fee_floor: 10_000,
            dust_limit: 546,
        }
    }
}

/// Outputs of a funding transaction together with the fee they leave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPlan {
    pub outputs: Vec<TxOutput>,
    pub fee: u64,
    /// Change value when a change output was appended
    pub change: Option<u64>,
}

impl FeePolicy {
    pub fn from_config(config: &InscriptionConfig) -> Self {
        Self {
            per_action_fee: config.per_action_fee,
            fee_floor: config.fee_floor,
            dust_limit: config.dust_limit,
        }
    }

    pub fn min_fee(&self, input_count: usize, output_count: usize) -> u64 {
        let actions = input_count.max(output_count) as u64;
        self.fee_floor.max(actions.saturating_mul(self.per_action_fee))
    }

    /// Outputs at or below the dust limit are not relayed
    pub fn is_dust(&self, value: u64) -> bool {
        value <= self.dust_limit
    }

    /// Smallest inscription output that still pays the reveal fee and
    /// leaves a non-dust reveal output
    pub fn min_inscription_value(&self, reveal_fee: u64) -> u64 {
        reveal_fee + self.dust_limit + 1
    }

    /// Raise a too-small inscription value to the minimum instead of failing
    pub fn adjust_inscription_value(&self, requested: u64, reveal_fee: u64) -> u64 {
        let minimum = self.min_inscription_value(reveal_fee);
        if requested < minimum {
            tracing::info!(
                "Inscription value {} below minimum {} (reveal fee {} + dust {}), raising",
                requested,
                minimum,
                reveal_fee,
                self.dust_limit
            );
            minimum
        } else {
            requested
        }
    }

    /// Value the inputs must cover for `primary` outputs, an optional
    /// platform fee and a change output
    pub fn required_funding(
        &self,
        input_count: usize,
        primary: &[TxOutput],
        platform_fee: Option<&TxOutput>,
    ) -> u64 {
        let output_count = primary.len() + usize::from(platform_fee.is_some()) + 1;
        let primary_total: u64 = primary.iter().map(|o| o.value).sum();
        primary_total
            + platform_fee.map(|o| o.value).unwrap_or(0)
            + self.min_fee(input_count, output_count)
    }

    /// Lay out `primary`, then the platform fee, then change. Change at or
    /// below the dust limit is dropped and left to the miner.
    pub fn plan_outputs(
        &self,
        funding_total: u64,
        input_count: usize,
        primary: Vec<TxOutput>,
        platform_fee: Option<TxOutput>,
        change_script: Vec<u8>,
    ) -> AppResult<OutputPlan> {
        let required = self.required_funding(input_count, &primary, platform_fee.as_ref());
        if funding_total < required {
            return Err(AppError::InputUnavailable(format!(
                "inputs carry {} zatoshis, {} required",
                funding_total, required
            )));
        }

        let fee = self.min_fee(
            input_count,
            primary.len() + usize::from(platform_fee.is_some()) + 1,
        );
        let mut outputs = primary;
        outputs.extend(platform_fee);

        let change = funding_total - required;
        if self.is_dust(change) {
            if change > 0 {
                tracing::debug!("Change {} zatoshis below dust threshold, adding to fee", change);
            }
            Ok(OutputPlan {
                outputs,
                fee: fee + change,
                change: None,
            })
        } else {
            outputs.push(TxOutput {
                value: change,
                script_pubkey: change_script,
            });
            Ok(OutputPlan {
                outputs,
                fee,
                change: Some(change),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn out(value: u64, tag: u8) -> TxOutput {
        TxOutput { value, script_pubkey: vec![tag] }
    }

    #[test]
    fn test_fee_floor_and_actions() {
        let policy = FeePolicy::default();
        for inputs in 0..12 {
            for outputs in 0..12 {
                let fee = policy.min_fee(inputs, outputs);
                assert!(fee >= policy.fee_floor);
                assert!(fee >= inputs.max(outputs) as u64 * policy.per_action_fee);
            }
        }
        assert_eq!(policy.min_fee(1, 1), 10_000);
        assert_eq!(policy.min_fee(1, 3), 15_000);
        assert_eq!(policy.min_fee(5, 2), 25_000);
    }

    #[test]
    fn test_inscription_value_adjusted_upward() {
        let policy = FeePolicy::default();
        assert_eq!(policy.min_inscription_value(10_000), 10_547);
        assert_eq!(policy.adjust_inscription_value(1_000, 10_000), 10_547);
        assert_eq!(policy.adjust_inscription_value(10_547, 10_000), 10_547);
        assert_eq!(policy.adjust_inscription_value(60_000, 10_000), 60_000);
    }

    #[test]
    fn test_plan_with_change() {
        let policy = FeePolicy::default();
        let plan = policy
            .plan_outputs(71_000, 1, vec![out(60_000, 1)], None, vec![9])
            .unwrap();
        assert_eq!(plan.fee, 10_000);
        assert_eq!(plan.change, Some(1_000));
        assert_eq!(plan.outputs, vec![out(60_000, 1), out(1_000, 9)]);
    }

    #[test]
    fn test_platform_fee_is_second_output() {
        let policy = FeePolicy::default();
        let plan = policy
            .plan_outputs(200_000, 1, vec![out(60_000, 1)], Some(out(20_000, 2)), vec![9])
            .unwrap();
        // three outputs -> 15_000
        assert_eq!(plan.fee, 15_000);
        assert_eq!(plan.outputs[0], out(60_000, 1));
        assert_eq!(plan.outputs[1], out(20_000, 2));
        assert_eq!(plan.outputs[2], out(105_000, 9));
    }

    #[test]
    fn test_dust_change_dropped() {
        let policy = FeePolicy::default();
        let plan = policy
            .plan_outputs(70_500, 1, vec![out(60_000, 1)], None, vec![9])
            .unwrap();
        assert_eq!(plan.change, None);
        assert_eq!(plan.outputs.len(), 1);
        assert_eq!(plan.fee, 10_500);
    }

    #[test]
    fn test_insufficient_funding() {
        let policy = FeePolicy::default();
        let err = policy
            .plan_outputs(69_999, 1, vec![out(60_000, 1)], None, vec![9])
            .unwrap_err();
        assert!(matches!(err, AppError::InputUnavailable(ref msg) if msg.contains("70000")));
    }
}
