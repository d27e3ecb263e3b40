use std::str::FromStr;

use alloy::primitives::{Address, Bytes, U256};
use keeper_core::{
    execution_options::{ExecutionMode, FeeOverrides},
    order::{Order, OrderPayload, SwapRoute},
};
use serde::{Deserialize, Serialize};

pub mod error;
pub mod handler;

pub use error::LimitKeeperError;
pub use handler::{KeeperOutcome, LimitOrderHandler, SubmissionConfig};

/// Dispatcher retry budget for order execution.
pub const EXECUTE_MAX_RETRIES: u32 = 0;
/// Dispatcher retry budget for order cancellation.
pub const CANCEL_MAX_RETRIES: u32 = 5;

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UpkeepTargetRequest {
    pub network: String,
    pub contract_address: String,
    pub keeper_address: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderIdentityRequest {
    pub account: Address,
    pub index: Option<U256>,
    pub order_type: Option<U256>,
    pub execute_fee: Option<U256>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SwapRouteRequest {
    pub dex_id: u8,
    pub token_in: Address,
    pub token_out: Address,
    pub amount_in: U256,
    pub amount_out_min: U256,
    #[serde(default)]
    pub extra_data: Bytes,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct FeeOverridesRequest {
    pub basefee_multiplier: Option<u64>,
    pub gas_limit_multiplier: Option<f64>,
}

/// Execute an order that the order book reports as fillable.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteOrderRequest {
    #[serde(flatten)]
    pub target: UpkeepTargetRequest,
    pub order: OrderIdentityRequest,
    pub token_in: Address,
    pub token_out: Address,
    #[serde(default)]
    pub remaining_amount_in: U256,
    #[serde(default)]
    pub routes: Vec<SwapRouteRequest>,
    pub amount_in: Option<U256>,
    #[serde(default)]
    pub amount_out_min: U256,
    #[serde(default)]
    pub amount_out_expected: U256,
    #[serde(default, flatten)]
    pub fee_overrides: FeeOverridesRequest,
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
}

/// Cancel an order. Only the order identity travels with it.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CancelOrderRequest {
    #[serde(flatten)]
    pub target: UpkeepTargetRequest,
    pub order: OrderIdentityRequest,
    #[serde(default, flatten)]
    pub fee_overrides: FeeOverridesRequest,
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LimitOrderRequest {
    Execute(ExecuteOrderRequest),
    Cancel(CancelOrderRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderAction {
    Execute,
    Cancel,
}

impl std::fmt::Display for OrderAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderAction::Execute => write!(f, "execute"),
            OrderAction::Cancel => write!(f, "cancel"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpkeepTarget {
    pub network: String,
    pub contract: Address,
    pub keeper: Address,
}

/// A validated work item, ready to be handed to [`LimitOrderHandler`].
#[derive(Debug, Clone)]
pub struct LimitOrderJobData {
    pub action: OrderAction,
    pub target: UpkeepTarget,
    pub payload: OrderPayload,
    pub fee_overrides: FeeOverrides,
    pub mode: Option<ExecutionMode>,
}

impl LimitOrderJobData {
    pub fn max_retries(&self) -> u32 {
        match self.action {
            OrderAction::Execute => EXECUTE_MAX_RETRIES,
            OrderAction::Cancel => CANCEL_MAX_RETRIES,
        }
    }
}

fn parse_address(field: &str, value: &str) -> Result<Address, LimitKeeperError> {
    if value.is_empty() {
        return Err(LimitKeeperError::validation(format!("{field} is required")));
    }
    Address::from_str(value)
        .map_err(|_| LimitKeeperError::validation(format!("{field} {value} is not a valid address")))
}

impl TryFrom<&UpkeepTargetRequest> for UpkeepTarget {
    type Error = LimitKeeperError;

    fn try_from(request: &UpkeepTargetRequest) -> Result<Self, Self::Error> {
        if request.network.is_empty() {
            return Err(LimitKeeperError::validation("network is required"));
        }

        Ok(UpkeepTarget {
            network: request.network.clone(),
            contract: parse_address("contract address", &request.contract_address)?,
            keeper: parse_address("keeper address", &request.keeper_address)?,
        })
    }
}

impl TryFrom<&FeeOverridesRequest> for FeeOverrides {
    type Error = LimitKeeperError;

    fn try_from(request: &FeeOverridesRequest) -> Result<Self, Self::Error> {
        FeeOverrides::new(request.basefee_multiplier, request.gas_limit_multiplier)
            .map_err(|e| LimitKeeperError::validation(e.to_string()))
    }
}

fn order_identity(
    request: &OrderIdentityRequest,
    default_execute_fee: Option<U256>,
) -> Result<Order, LimitKeeperError> {
    if request.account.is_zero() {
        return Err(LimitKeeperError::validation("order account is required"));
    }

    Ok(Order {
        account: request.account,
        index: request
            .index
            .ok_or_else(|| LimitKeeperError::validation("order index is required"))?,
        orderType: request
            .order_type
            .ok_or_else(|| LimitKeeperError::validation("order type is required"))?,
        executeFee: request
            .execute_fee
            .or(default_execute_fee)
            .ok_or_else(|| LimitKeeperError::validation("order execute fee is required"))?,
    })
}

impl TryFrom<ExecuteOrderRequest> for LimitOrderJobData {
    type Error = LimitKeeperError;

    fn try_from(request: ExecuteOrderRequest) -> Result<Self, Self::Error> {
        let target = UpkeepTarget::try_from(&request.target)?;
        let amount_in = request
            .amount_in
            .ok_or_else(|| LimitKeeperError::validation("amount in is required"))?;
        let order = order_identity(&request.order, None)?;
        let fee_overrides = FeeOverrides::try_from(&request.fee_overrides)?;

        let routes = request
            .routes
            .into_iter()
            .map(|route| SwapRoute {
                dexId: route.dex_id,
                tokenIn: route.token_in,
                tokenOut: route.token_out,
                amountIn: route.amount_in,
                amountOutMin: route.amount_out_min,
                extraData: route.extra_data,
            })
            .collect();

        Ok(LimitOrderJobData {
            action: OrderAction::Execute,
            payload: OrderPayload {
                order,
                is_cancel: false,
                token_in: request.token_in,
                token_out: request.token_out,
                remaining_amount_in: request.remaining_amount_in,
                routes,
                amount_in,
                amount_out_min: request.amount_out_min,
                amount_out_expected: request.amount_out_expected,
                keeper: target.keeper,
            },
            target,
            fee_overrides,
            mode: request.mode,
        })
    }
}

impl TryFrom<CancelOrderRequest> for LimitOrderJobData {
    type Error = LimitKeeperError;

    fn try_from(request: CancelOrderRequest) -> Result<Self, Self::Error> {
        let target = UpkeepTarget::try_from(&request.target)?;
        let order = order_identity(&request.order, Some(U256::ZERO))?;
        let fee_overrides = FeeOverrides::try_from(&request.fee_overrides)?;

        Ok(LimitOrderJobData {
            action: OrderAction::Cancel,
            payload: OrderPayload::cancel(order, target.keeper),
            target,
            fee_overrides,
            mode: request.mode,
        })
    }
}

impl TryFrom<LimitOrderRequest> for LimitOrderJobData {
    type Error = LimitKeeperError;

    fn try_from(request: LimitOrderRequest) -> Result<Self, Self::Error> {
        match request {
            LimitOrderRequest::Execute(request) => request.try_into(),
            LimitOrderRequest::Cancel(request) => request.try_into(),
        }
    }
}
