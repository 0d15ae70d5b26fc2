//! Transaction fee calculation
//!
//! Fees are `fee_rate × estimated vsize`. Sizes are estimated for the
//! wallet's only script type, P2WSH 2-of-3 sortedmulti.

use bitcoin::FeeRate;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Fixed transaction overhead (version, locktime, counts, segwit marker), vbytes
pub const TX_OVERHEAD_VBYTES: u64 = 11;

/// P2WSH 2-of-3 input: outpoint, sequence, empty scriptSig and a witness with
/// two signatures and the 105-byte witness script, vbytes (rounded up)
pub const P2WSH_2OF3_INPUT_VBYTES: u64 = 105;

/// P2WSH output, vbytes
pub const P2WSH_OUTPUT_VBYTES: u64 = 43;

/// Outputs below this value are non-standard for P2WSH
pub const P2WSH_OUTPUT_DUST_LIMIT: u64 = 330;

/// Minimum relay fee rate (1 sat/vB)
pub const MIN_RELAY_FEE_RATE: FeeRate = FeeRate::from_sat_per_kwu(250);

/// Maximum fee (safety limit, in satoshis)
/// 0.01 BTC = 1,000,000 sats
pub const MAX_FEE: u64 = 1_000_000;

/// Fee calculator for P2WSH 2-of-3 spends
#[derive(Debug, Clone)]
pub struct FeeCalculator;

impl FeeCalculator {
    /// Create new fee calculator
    pub fn new() -> Self {
        Self
    }

    /// Estimated virtual size of a transaction
    pub fn estimate_vsize(&self, num_inputs: usize, num_outputs: usize) -> u64 {
        TX_OVERHEAD_VBYTES
            + P2WSH_2OF3_INPUT_VBYTES * num_inputs as u64
            + P2WSH_OUTPUT_VBYTES * num_outputs as u64
    }

    /// Calculate fee for the given shape at `fee_rate`
    pub fn calculate_fee(&self, num_inputs: usize, num_outputs: usize, fee_rate: FeeRate) -> Result<u64> {
        if num_inputs == 0 {
            return Err(Error::FeeCalculation("transaction has no inputs".to_string()));
        }
        let rate = fee_rate.max(MIN_RELAY_FEE_RATE);
        let weight = self.estimate_vsize(num_inputs, num_outputs) * 4;
        let fee = rate
            .to_sat_per_kwu()
            .checked_mul(weight)
            .map(|sat_kwu| sat_kwu.div_ceil(1000))
            .ok_or_else(|| {
                Error::FeeTooHigh(format!(
                    "fee rate {} sat/kwu over {} weight units overflows",
                    rate.to_sat_per_kwu(),
                    weight
                ))
            })?;

        if fee > MAX_FEE {
            return Err(Error::FeeTooHigh(format!(
                "Calculated fee {} exceeds maximum {}",
                fee, MAX_FEE
            )));
        }

        tracing::debug!(
            "Fee for {} inputs / {} outputs at {} sat/kwu: {} sats",
            num_inputs,
            num_outputs,
            rate.to_sat_per_kwu(),
            fee
        );

        Ok(fee)
    }

    /// Calculate fee for a sweep (N inputs, 1 output)
    pub fn calculate_sweep_fee(&self, num_inputs: usize, fee_rate: FeeRate) -> Result<u64> {
        self.calculate_fee(num_inputs, 1, fee_rate)
    }
}

impl Default for FeeCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Confirmation-speed policy shared by regular sends and sweeps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeePriority {
    /// Next block
    Fastest,
    /// About three blocks
    #[default]
    ThirtyMinutes,
    /// About six blocks
    SixtyMinutes,
    /// Explicit rate in sat/vB
    Custom(u64),
}

impl FeePriority {
    /// Confirmation target in blocks
    pub fn target_blocks(&self) -> u16 {
        match self {
            FeePriority::Fastest => 1,
            FeePriority::ThirtyMinutes => 3,
            FeePriority::SixtyMinutes => 6,
            FeePriority::Custom(_) => 3,
        }
    }

    /// Resolve against an estimator result; custom rates ignore the estimate
    pub fn apply(&self, estimated: FeeRate) -> FeeRate {
        match self {
            FeePriority::Custom(sat_per_vb) => {
                FeeRate::from_sat_per_kwu(sat_per_vb.saturating_mul(250)).max(MIN_RELAY_FEE_RATE)
            }
            _ => estimated.max(MIN_RELAY_FEE_RATE),
        }
    }
}

/// Convert an Esplora-style sat/vB float into a fee rate, rounding up
pub fn fee_rate_from_sat_per_vb(sat_per_vb: f64) -> FeeRate {
    if !sat_per_vb.is_finite() || sat_per_vb <= 0.0 {
        return MIN_RELAY_FEE_RATE;
    }
    FeeRate::from_sat_per_kwu((sat_per_vb * 250.0).ceil() as u64).max(MIN_RELAY_FEE_RATE)
}
