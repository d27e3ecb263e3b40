use std::time::Duration;

use alloy::primitives::{Address, TxHash};
use keeper_core::{
    error::{EngineError, RpcErrorKind},
    job::{JobError, ToJobError},
};
use serde::{Deserialize, Serialize};

use crate::{fee_escalator::FeeError, receipt::ReceiptError};

const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Serialize, Deserialize, Debug, Clone, thiserror::Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum LimitKeeperError {
    #[error("Invalid work item: {message}")]
    ValidationError { message: String },

    #[error("Chain service error for network {network}: {message}")]
    ChainServiceError { network: String, message: String },

    #[error("Contract not deployed at {contract_address}")]
    #[serde(rename_all = "camelCase")]
    ContractNotDeployed {
        contract_address: Address,
        chain_id: u64,
    },

    #[error("Upkeep check on {contract_address} failed: {message}")]
    #[serde(rename_all = "camelCase")]
    UpkeepCheckFailed {
        contract_address: Address,
        message: String,
        inner_error: EngineError,
    },

    #[error("Failed to lease a nonce for {keeper}: {message}")]
    NonceLeaseFailed {
        keeper: Address,
        message: String,
        inner_error: EngineError,
    },

    #[error("Network {network} does not support EIP-1559 fees, use the simple handler")]
    Eip1559Unsupported { network: String },

    #[error("Fee data unavailable: {message}")]
    #[serde(rename_all = "camelCase")]
    FeeDataUnavailable {
        message: String,
        inner_error: EngineError,
    },

    #[error("Gas estimation for {contract_address} failed: {message}")]
    #[serde(rename_all = "camelCase")]
    GasEstimationFailed {
        contract_address: Address,
        message: String,
        inner_error: EngineError,
    },

    #[error("Transaction signing failed: {message}")]
    #[serde(rename_all = "camelCase")]
    SigningError {
        message: String,
        inner_error: EngineError,
    },

    #[error("Broadcast {attempt} failed: {message}")]
    #[serde(rename_all = "camelCase")]
    TransactionSendError {
        attempt: u32,
        message: String,
        inner_error: EngineError,
    },

    #[error("Transaction {transaction_hash} to {contract_address} failed on chain")]
    #[serde(rename_all = "camelCase")]
    TransactionReverted {
        contract_address: Address,
        transaction_hash: TxHash,
        block_number: Option<u64>,
    },

    #[error("Transaction to {contract_address} not mined after {attempts} fee escalations")]
    #[serde(rename_all = "camelCase")]
    EscalationBudgetExhausted {
        contract_address: Address,
        attempts: u32,
        last_transaction_hash: Option<TxHash>,
    },

    #[error("Transaction {transaction_hash} to {contract_address} never appeared on chain")]
    #[serde(rename_all = "camelCase")]
    TransactionNotFound {
        contract_address: Address,
        transaction_hash: TxHash,
    },

    #[error("Receipt lookup failed: {message}")]
    #[serde(rename_all = "camelCase")]
    ReceiptQueryFailed {
        transaction_hash: TxHash,
        message: String,
        inner_error: EngineError,
    },

    #[error("Cancelled while {stage}")]
    #[serde(rename_all = "camelCase")]
    Cancelled {
        stage: String,
        transaction_hash: Option<TxHash>,
    },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl LimitKeeperError {
    pub fn validation(message: impl Into<String>) -> Self {
        LimitKeeperError::ValidationError {
            message: message.into(),
        }
    }

    pub fn cancelled(stage: impl Into<String>) -> Self {
        LimitKeeperError::Cancelled {
            stage: stage.into(),
            transaction_hash: None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            LimitKeeperError::NonceLeaseFailed { .. }
            | LimitKeeperError::ReceiptQueryFailed { .. }
            | LimitKeeperError::TransactionNotFound { .. }
            | LimitKeeperError::Cancelled { .. } => true,
            LimitKeeperError::UpkeepCheckFailed { inner_error, .. }
            | LimitKeeperError::FeeDataUnavailable { inner_error, .. }
            | LimitKeeperError::GasEstimationFailed { inner_error, .. }
            | LimitKeeperError::TransactionSendError { inner_error, .. } => {
                is_transient(inner_error)
            }
            LimitKeeperError::ValidationError { .. }
            | LimitKeeperError::ChainServiceError { .. }
            | LimitKeeperError::ContractNotDeployed { .. }
            | LimitKeeperError::Eip1559Unsupported { .. }
            | LimitKeeperError::SigningError { .. }
            | LimitKeeperError::TransactionReverted { .. }
            | LimitKeeperError::EscalationBudgetExhausted { .. }
            | LimitKeeperError::InternalError { .. } => false,
        }
    }

    pub fn handle(self) -> JobError<LimitKeeperError> {
        if self.is_retryable() {
            self.nack(Some(RETRY_DELAY))
        } else {
            self.fail()
        }
    }

    pub(crate) fn from_upkeep_error(contract_address: Address, error: EngineError) -> Self {
        match error {
            EngineError::ContractInteractionError {
                kind: keeper_core::error::ContractInteractionErrorKind::ZeroData { .. },
                chain_id,
                ..
            } => LimitKeeperError::ContractNotDeployed {
                contract_address,
                chain_id,
            },
            inner_error => LimitKeeperError::UpkeepCheckFailed {
                contract_address,
                message: inner_error.to_string(),
                inner_error,
            },
        }
    }

    pub(crate) fn from_fee_error(contract_address: Address, error: FeeError) -> Self {
        match error {
            FeeError::BaseFeeUnavailable { network } => {
                LimitKeeperError::Eip1559Unsupported { network }
            }
            FeeError::FeeDataUnavailable { inner_error } => LimitKeeperError::FeeDataUnavailable {
                message: inner_error.to_string(),
                inner_error,
            },
            FeeError::GasEstimationFailed { inner_error } => {
                LimitKeeperError::GasEstimationFailed {
                    contract_address,
                    message: inner_error.to_string(),
                    inner_error,
                }
            }
        }
    }

    pub(crate) fn from_receipt_error(contract_address: Address, error: ReceiptError) -> Self {
        match error {
            ReceiptError::Cancelled { transaction_hash } => LimitKeeperError::Cancelled {
                stage: "waiting for receipt".to_string(),
                transaction_hash,
            },
            ReceiptError::Reverted {
                transaction_hash,
                block_number,
                ..
            } => LimitKeeperError::TransactionReverted {
                contract_address,
                transaction_hash,
                block_number,
            },
            ReceiptError::QueryFailed {
                transaction_hash,
                inner_error,
            } => LimitKeeperError::ReceiptQueryFailed {
                transaction_hash,
                message: inner_error.to_string(),
                inner_error,
            },
            ReceiptError::NotFound {
                transaction_hash, ..
            } => LimitKeeperError::TransactionNotFound {
                contract_address,
                transaction_hash,
            },
            ReceiptError::EscalationBudgetExhausted {
                attempts,
                last_transaction_hash,
            } => LimitKeeperError::EscalationBudgetExhausted {
                contract_address,
                attempts,
                last_transaction_hash,
            },
        }
    }

    pub(crate) fn from_send_error(attempt: u32, inner_error: EngineError) -> Self {
        LimitKeeperError::TransactionSendError {
            attempt,
            message: inner_error.to_string(),
            inner_error,
        }
    }

    pub(crate) fn from_signing_error(inner_error: EngineError) -> Self {
        LimitKeeperError::SigningError {
            message: inner_error.to_string(),
            inner_error,
        }
    }
}

/// Transport-level failures are worth another try, anything the node answered is not.
pub fn is_transient(error: &EngineError) -> bool {
    error
        .rpc_kind()
        .is_some_and(|kind| !matches!(kind, RpcErrorKind::ErrorResp(_)) && kind.is_retryable())
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendErrorClassification {
    /// "nonce too low", "already known" etc. The transaction or a sibling is in the mempool.
    PossiblySent,
    DeterministicFailure,
}

#[tracing::instrument(skip_all, fields(error = %error))]
pub fn classify_send_error(error: &EngineError) -> SendErrorClassification {
    let EngineError::RpcError {
        kind: RpcErrorKind::ErrorResp(resp),
        ..
    } = error
    else {
        return SendErrorClassification::DeterministicFailure;
    };

    let message = resp.message.to_lowercase();
    if message.contains("nonce too low")
        || message.contains("already known")
        || message.contains("replacement transaction underpriced")
        || message.contains("transaction already imported")
    {
        return SendErrorClassification::PossiblySent;
    }

    SendErrorClassification::DeterministicFailure
}
