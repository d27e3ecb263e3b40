use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Smallest accepted base-fee multiplier. Anything lower risks the fee cap falling
/// below the next block's base fee.
pub const MIN_BASEFEE_MULTIPLIER: u64 = 2;

/// How a submission is priced and driven to inclusion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionMode {
    /// Price once from the network's suggestions, send once, wait for the receipt.
    Simple,
    /// Start from a minimal tip and escalate the fee cap under the same nonce until mined.
    #[default]
    Optimized,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Simple => write!(f, "simple"),
            ExecutionMode::Optimized => write!(f, "optimized"),
        }
    }
}

/// Caller-supplied pricing overrides, validated when the work item is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawFeeOverrides")]
pub struct FeeOverrides {
    basefee_multiplier: Option<u64>,
    gas_limit_multiplier: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFeeOverrides {
    basefee_multiplier: Option<u64>,
    gas_limit_multiplier: Option<f64>,
}

impl TryFrom<RawFeeOverrides> for FeeOverrides {
    type Error = EngineError;

    fn try_from(raw: RawFeeOverrides) -> Result<Self, Self::Error> {
        FeeOverrides::new(raw.basefee_multiplier, raw.gas_limit_multiplier)
    }
}

impl FeeOverrides {
    pub fn new(
        basefee_multiplier: Option<u64>,
        gas_limit_multiplier: Option<f64>,
    ) -> Result<Self, EngineError> {
        if let Some(multiplier) = basefee_multiplier.filter(|m| *m < MIN_BASEFEE_MULTIPLIER) {
            return Err(EngineError::validation(format!(
                "basefee multiplier must be at least {MIN_BASEFEE_MULTIPLIER}, got {multiplier}"
            )));
        }

        if let Some(multiplier) =
            gas_limit_multiplier.filter(|m| !m.is_finite() || *m < 0.0)
        {
            return Err(EngineError::validation(format!(
                "gas limit multiplier must be a non-negative number, got {multiplier}"
            )));
        }

        Ok(Self {
            basefee_multiplier,
            // zero means "use the default"
            gas_limit_multiplier: gas_limit_multiplier.filter(|m| *m > 0.0),
        })
    }

    /// Whether the caller asked for anything other than the defaults.
    pub fn is_adaptive(&self) -> bool {
        self.basefee_multiplier.is_some() || self.gas_limit_multiplier.is_some()
    }

    pub fn basefee_multiplier(&self) -> u64 {
        self.basefee_multiplier.unwrap_or(MIN_BASEFEE_MULTIPLIER)
    }

    pub fn gas_limit_multiplier(&self) -> f64 {
        self.gas_limit_multiplier.unwrap_or(1.0)
    }
}
