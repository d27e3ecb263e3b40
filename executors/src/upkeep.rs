use alloy::{network::TransactionBuilder, primitives::Address, rpc::types::TransactionRequest};
use keeper_core::{
    chain::Chain,
    error::{ContractInteractionErrorKind, EngineError, RpcErrorKind},
    order::{OrderPayload, decode_check_upkeep},
};

/// Read-only `checkUpkeep` against the order book, issued as the keeper.
///
/// `Ok(false)` means the order is not executable right now.
#[tracing::instrument(skip_all, fields(contract = ?contract, keeper = ?keeper))]
pub async fn check_upkeep<C: Chain>(
    chain: &C,
    contract: Address,
    keeper: Address,
    payload: &OrderPayload,
) -> Result<bool, EngineError> {
    let request = TransactionRequest::default()
        .with_from(keeper)
        .with_to(contract)
        .with_input(payload.check_upkeep_calldata());

    let data = chain.call(request).await.map_err(|e| revert_to_contract_error(e, contract))?;
    let upkeep_needed = decode_check_upkeep(contract, chain.chain_id(), &data)?;

    tracing::debug!(upkeep_needed, "Upkeep checked");
    Ok(upkeep_needed)
}

/// Node responses that report a revert become contract errors so they are never retried.
fn revert_to_contract_error(error: EngineError, contract: Address) -> EngineError {
    match &error {
        EngineError::RpcError {
            chain_id,
            kind: RpcErrorKind::ErrorResp(resp),
            ..
        } if resp.message.to_lowercase().contains("revert") => EngineError::contract_error(
            Some(contract),
            *chain_id,
            ContractInteractionErrorKind::Reverted {
                message: resp.message.clone(),
            },
        ),
        _ => error,
    }
}

#[cfg(test)]
mod tests {
    use keeper_core::error::RpcErrorResponse;

    use super::*;

    fn rpc_error(kind: RpcErrorKind) -> EngineError {
        EngineError::RpcError {
            chain_id: 1,
            rpc_url: "http://localhost:8545/".to_string(),
            message: kind.to_string(),
            kind,
        }
    }

    #[test]
    fn test_reverts_become_contract_errors() {
        let contract = Address::repeat_byte(0xcc);
        let reverted = rpc_error(RpcErrorKind::ErrorResp(RpcErrorResponse {
            code: 3,
            message: "execution reverted: order filled".to_string(),
            data: None,
        }));

        assert!(matches!(
            revert_to_contract_error(reverted, contract),
            EngineError::ContractInteractionError {
                contract_address: Some(address),
                kind: ContractInteractionErrorKind::Reverted { .. },
                ..
            } if address == contract
        ));

        let timeout = rpc_error(RpcErrorKind::OtherTransportError {
            message: "timed out".to_string(),
        });
        assert!(matches!(
            revert_to_contract_error(timeout, contract),
            EngineError::RpcError { .. }
        ));
    }
}
