use alloy::{
    primitives::{Address, Bytes, U256},
    sol,
    sol_types::{SolCall, SolValue},
};

use crate::error::{ContractInteractionErrorKind, EngineError};

sol! {
    #[derive(Debug, PartialEq, Eq)]
    struct Order {
        address account;
        uint256 index;
        uint256 orderType;
        uint256 executeFee;
    }

    #[derive(Debug, PartialEq, Eq)]
    struct SwapRoute {
        uint8 dexId;
        address tokenIn;
        address tokenOut;
        uint256 amountIn;
        uint256 amountOutMin;
        bytes extraData;
    }

    /// Chainlink-style automation surface exposed by the order book.
    interface IAutomationCompatible {
        function checkUpkeep(bytes calldata checkData) external returns (bool upkeepNeeded, bytes memory performData);
        function performUpkeep(bytes calldata performData) external;
    }
}

/// ABI parameter list shared by `checkData` and `performData`.
pub type OrderPayloadParams = (
    Order,
    bool,
    Address,
    Address,
    U256,
    Vec<SwapRoute>,
    U256,
    U256,
    U256,
    Address,
);

/// Order execution (or cancellation) input handed to the order book contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderPayload {
    pub order: Order,
    pub is_cancel: bool,
    pub token_in: Address,
    pub token_out: Address,
    pub remaining_amount_in: U256,
    pub routes: Vec<SwapRoute>,
    pub amount_in: U256,
    pub amount_out_min: U256,
    pub amount_out_expected: U256,
    pub keeper: Address,
}

impl OrderPayload {
    /// Cancellation carries only the order identity; every trade field is zeroed.
    pub fn cancel(order: Order, keeper: Address) -> Self {
        Self {
            order,
            is_cancel: true,
            token_in: Address::ZERO,
            token_out: Address::ZERO,
            remaining_amount_in: U256::ZERO,
            routes: Vec::new(),
            amount_in: U256::ZERO,
            amount_out_min: U256::ZERO,
            amount_out_expected: U256::ZERO,
            keeper,
        }
    }

    pub fn abi_encode(&self) -> Bytes {
        let params: OrderPayloadParams = (
            self.order.clone(),
            self.is_cancel,
            self.token_in,
            self.token_out,
            self.remaining_amount_in,
            self.routes.clone(),
            self.amount_in,
            self.amount_out_min,
            self.amount_out_expected,
            self.keeper,
        );
        params.abi_encode_params().into()
    }

    pub fn check_upkeep_calldata(&self) -> Bytes {
        IAutomationCompatible::checkUpkeepCall {
            checkData: self.abi_encode(),
        }
        .abi_encode()
        .into()
    }

    pub fn perform_upkeep_calldata(&self) -> Bytes {
        IAutomationCompatible::performUpkeepCall {
            performData: self.abi_encode(),
        }
        .abi_encode()
        .into()
    }
}

/// Decodes the `checkUpkeep` return data into the `upkeepNeeded` flag.
///
/// Empty return data means there is no code at the target.
pub fn decode_check_upkeep(
    contract: Address,
    chain_id: u64,
    data: &[u8],
) -> Result<bool, EngineError> {
    if data.is_empty() {
        return Err(EngineError::contract_error(
            Some(contract),
            chain_id,
            ContractInteractionErrorKind::ZeroData {
                function: "checkUpkeep".to_string(),
            },
        ));
    }

    IAutomationCompatible::checkUpkeepCall::abi_decode_returns(data)
        .map(|ret| ret.upkeepNeeded)
        .map_err(|e| {
            EngineError::contract_error(
                Some(contract),
                chain_id,
                ContractInteractionErrorKind::AbiError {
                    message: e.to_string(),
                },
            )
        })
}
