use alloy::{network::TransactionBuilder, rpc::types::TransactionRequest};
use keeper_core::{chain::Chain, error::EngineError, execution_options::FeeOverrides};
use serde::{Deserialize, Serialize};

/// Tip used by the optimized pricing path.
pub const MIN_PRIORITY_FEE: u128 = 1;

/// Base-fee multiplier used by the optimized pricing path.
pub const DEFAULT_BASEFEE_MULTIPLIER: u128 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeOffer {
    /// Priority fee per gas. Zero for legacy offers.
    pub tip: u128,
    /// Max fee per gas, or the gas price for legacy offers.
    pub fee_cap: u128,
    pub gas_limit: u64,
    /// Factor applied to the previous fee cap to produce this one.
    pub multiplier: f64,
    /// Number of the broadcast this offer was built for, 0 before the first escalation.
    pub attempt: u32,
    /// The network reported no base fee, so this offer prices a legacy transaction.
    pub legacy: bool,
}

#[derive(Debug, thiserror::Error, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "type")]
pub enum FeeError {
    #[error("network {network} reports no base fee; use the simple handler")]
    BaseFeeUnavailable { network: String },

    #[error("failed to read fee data: {inner_error}")]
    FeeDataUnavailable { inner_error: EngineError },

    #[error("gas estimation failed: {inner_error}")]
    GasEstimationFailed { inner_error: EngineError },
}

/// Prices one logical transaction and raises its fee cap across resends.
///
/// `request` is the unsigned call being priced; only its target, sender and input matter.
pub struct FeeEscalator<'a, C> {
    chain: &'a C,
    request: TransactionRequest,
    gas_limit_multiplier: f64,
}

impl<'a, C: Chain> FeeEscalator<'a, C> {
    pub fn new(chain: &'a C, request: TransactionRequest) -> Self {
        Self {
            chain,
            request,
            gas_limit_multiplier: 1.0,
        }
    }

    pub fn with_gas_limit_multiplier(mut self, multiplier: f64) -> Self {
        if multiplier.is_finite() && multiplier > 0.0 {
            self.gas_limit_multiplier = multiplier;
        }
        self
    }

    /// Minimal-tip offer: `tip = 1 wei`, `fee_cap = tip + 2 * base_fee`.
    pub async fn initial(&self) -> Result<FeeOffer, FeeError> {
        let base_fee = self.base_fee().await?.ok_or_else(|| FeeError::BaseFeeUnavailable {
            network: self.chain.network().to_string(),
        })?;

        let tip = MIN_PRIORITY_FEE;
        let fee_cap = tip.saturating_add(base_fee.saturating_mul(DEFAULT_BASEFEE_MULTIPLIER));
        let gas_limit = self.estimate(tip, fee_cap, false).await?;

        Ok(FeeOffer {
            tip,
            fee_cap,
            gas_limit,
            multiplier: 1.0,
            attempt: 0,
            legacy: false,
        })
    }

    /// Offer priced from the network's own suggestions and the caller's overrides.
    ///
    /// Falls back to a legacy gas price when the latest block has no base fee.
    pub async fn adaptive(&self, overrides: &FeeOverrides) -> Result<FeeOffer, FeeError> {
        let Some(base_fee) = self.base_fee().await? else {
            let gas_price = self
                .chain
                .gas_price()
                .await
                .map_err(|inner_error| FeeError::FeeDataUnavailable { inner_error })?;
            let gas_limit = self.estimate(0, gas_price, true).await?;
            return Ok(FeeOffer {
                tip: 0,
                fee_cap: gas_price,
                gas_limit,
                multiplier: 1.0,
                attempt: 0,
                legacy: true,
            });
        };

        let tip = self
            .chain
            .suggested_priority_fee()
            .await
            .map_err(|inner_error| FeeError::FeeDataUnavailable { inner_error })?;
        let fee_cap = tip.saturating_add(
            base_fee.saturating_mul(u128::from(overrides.basefee_multiplier())),
        );
        let gas_limit = self.estimate(tip, fee_cap, false).await?;

        Ok(FeeOffer {
            tip,
            fee_cap,
            gas_limit,
            multiplier: 1.0,
            attempt: 0,
            legacy: false,
        })
    }

    /// Offer for broadcast number `attempt` (1-based): the previous fee cap scaled by
    /// `1.0 + 0.1 * (attempt - 1)`, with the gas limit re-simulated at the new price.
    pub async fn escalate(&self, prev: &FeeOffer, attempt: u32) -> Result<FeeOffer, FeeError> {
        let fee_cap = escalated_fee_cap(prev.fee_cap, attempt);
        let tip = prev.tip.min(fee_cap);
        let gas_limit = self.estimate(tip, fee_cap, prev.legacy).await?;

        Ok(FeeOffer {
            tip,
            fee_cap,
            gas_limit,
            multiplier: attempt_multiplier(attempt),
            attempt,
            legacy: prev.legacy,
        })
    }

    async fn base_fee(&self) -> Result<Option<u128>, FeeError> {
        self.chain
            .base_fee()
            .await
            .map_err(|inner_error| FeeError::FeeDataUnavailable { inner_error })
    }

    async fn estimate(&self, tip: u128, fee_cap: u128, legacy: bool) -> Result<u64, FeeError> {
        let request = if legacy {
            self.request.clone().with_gas_price(fee_cap)
        } else {
            self.request
                .clone()
                .with_max_fee_per_gas(fee_cap)
                .with_max_priority_fee_per_gas(tip)
        };

        let estimated = self
            .chain
            .estimate_gas(request)
            .await
            .map_err(|inner_error| FeeError::GasEstimationFailed { inner_error })?;

        Ok(scale_gas_limit(estimated, self.gas_limit_multiplier))
    }
}

/// `1.0 + 0.1 * (attempt - 1)`; attempt 0 is treated as the first attempt.
pub fn attempt_multiplier(attempt: u32) -> f64 {
    1.0 + 0.1 * f64::from(attempt.saturating_sub(1))
}

/// Scales `fee_cap` by the attempt multiplier in exact tenths, rounding up.
///
/// From the second attempt on the result is strictly greater than `fee_cap`.
pub fn escalated_fee_cap(fee_cap: u128, attempt: u32) -> u128 {
    let tenths = 10 + u128::from(attempt.saturating_sub(1));
    let scaled = fee_cap.saturating_mul(tenths).div_ceil(10);
    if tenths > 10 {
        scaled.max(fee_cap.saturating_add(1))
    } else {
        scaled
    }
}

fn scale_gas_limit(gas: u64, multiplier: f64) -> u64 {
    if multiplier == 1.0 {
        return gas;
    }
    let scaled = (gas as f64 * multiplier).ceil();
    if scaled >= u64::MAX as f64 {
        u64::MAX
    } else {
        scaled as u64
    }
}
