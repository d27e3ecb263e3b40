use alloy::{
    primitives::Address,
    transports::{RpcError as AlloyRpcError, TransportErrorKind},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::Chain;

#[derive(Debug, Error, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcErrorKind {
    /// The node answered with a JSON-RPC error object.
    #[error("server returned an error response: {0}")]
    ErrorResp(RpcErrorResponse),

    #[error("server returned a null response when a non-null response was expected")]
    NullResp,

    #[error("unsupported feature: {message}")]
    UnsupportedFeature { message: String },

    /// Request never left the process (local signer or filler failure).
    #[error("local usage error: {message}")]
    InternalError { message: String },

    #[error("serialization error: {message}")]
    SerError { message: String },

    #[error("deserialization error: {message}, text: {text}")]
    DeserError {
        message: String,
        /// Raw body the node sent back.
        text: String,
    },

    #[error("HTTP error {status}")]
    TransportHttpError { status: u16, body: String },

    #[error("Other transport error: {message}")]
    OtherTransportError { message: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RpcErrorResponse {
    pub code: i64,
    pub message: String,
    /// Revert data or node-specific detail, stringified.
    pub data: Option<String>,
}

impl std::fmt::Display for RpcErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "code {}: {}", self.code, self.message)?;
        if let Some(data) = &self.data {
            write!(f, ", data: {data}")?;
        }
        Ok(())
    }
}

/// Failures attributable to the contract being called rather than the transport.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractInteractionErrorKind {
    /// The contract returned no data.
    #[error(
        "contract call to `{function}` returned no data (\"0x\"); the called address might not be a contract"
    )]
    ZeroData { function: String },

    /// An error occurred ABI encoding or decoding.
    #[error("ABI error: {message}")]
    AbiError { message: String },

    /// The call reverted on chain.
    #[error("execution reverted: {message}")]
    Reverted { message: String },
}

#[derive(Error, Debug, Serialize, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "type")]
pub enum EngineError {
    #[error("RPC error on chain {chain_id} at {rpc_url}: {message}")]
    RpcError {
        chain_id: u64,
        rpc_url: String,
        message: String,
        kind: RpcErrorKind,
    },

    #[error("Bad RPC configuration: {message}")]
    RpcConfigError { message: String },

    #[error("Contract interaction error: {message}")]
    #[serde(rename_all = "camelCase")]
    ContractInteractionError {
        contract_address: Option<Address>,
        chain_id: u64,
        message: String,
        kind: ContractInteractionErrorKind,
    },

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("Signing error for {address}: {message}")]
    SigningError { address: Address, message: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::ValidationError {
            message: message.into(),
        }
    }

    pub fn contract_error(
        contract_address: Option<Address>,
        chain_id: u64,
        kind: ContractInteractionErrorKind,
    ) -> Self {
        EngineError::ContractInteractionError {
            contract_address,
            chain_id,
            message: kind.to_string(),
            kind,
        }
    }

    /// The structured RPC error kind, if this error came from the node.
    pub fn rpc_kind(&self) -> Option<&RpcErrorKind> {
        match self {
            EngineError::RpcError { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

impl RpcErrorKind {
    /// Whether the same request has a reasonable chance of succeeding later.
    ///
    /// Client-side HTTP errors, unsupported methods and node error responses that
    /// describe the request itself are deterministic; everything else is treated as
    /// transport flakiness.
    pub fn is_retryable(&self) -> bool {
        match self {
            RpcErrorKind::TransportHttpError { status, .. } => !(400..500).contains(status),
            RpcErrorKind::UnsupportedFeature { .. } => false,
            RpcErrorKind::ErrorResp(resp) => {
                let message = resp.message.to_lowercase();
                !(message.contains("invalid chain")
                    || message.contains("invalid opcode")
                    || message.contains("revert"))
            }
            RpcErrorKind::SerError { .. } | RpcErrorKind::InternalError { .. } => false,
            RpcErrorKind::NullResp
            | RpcErrorKind::DeserError { .. }
            | RpcErrorKind::OtherTransportError { .. } => true,
        }
    }
}

pub trait AlloyRpcErrorToEngineError {
    fn to_engine_error(&self, chain: &impl Chain) -> EngineError;
}

fn to_engine_rpc_error_kind(err: &AlloyRpcError<TransportErrorKind>) -> RpcErrorKind {
    match err {
        AlloyRpcError::ErrorResp(err) => RpcErrorKind::ErrorResp(RpcErrorResponse {
            code: err.code,
            message: err.message.to_string(),
            data: err.data.as_ref().map(|data| data.to_string()),
        }),
        AlloyRpcError::NullResp => RpcErrorKind::NullResp,
        AlloyRpcError::UnsupportedFeature(feature) => RpcErrorKind::UnsupportedFeature {
            message: feature.to_string(),
        },
        AlloyRpcError::LocalUsageError(err) => RpcErrorKind::InternalError {
            message: err.to_string(),
        },
        AlloyRpcError::SerError(err) => RpcErrorKind::SerError {
            message: err.to_string(),
        },
        AlloyRpcError::DeserError { err, text } => RpcErrorKind::DeserError {
            message: err.to_string(),
            text: text.to_string(),
        },
        AlloyRpcError::Transport(err) => match err {
            TransportErrorKind::HttpError(err) => RpcErrorKind::TransportHttpError {
                status: err.status,
                body: err.body.to_string(),
            },
            _ => RpcErrorKind::OtherTransportError {
                message: err.to_string(),
            },
        },
    }
}

impl AlloyRpcErrorToEngineError for AlloyRpcError<TransportErrorKind> {
    fn to_engine_error(&self, chain: &impl Chain) -> EngineError {
        EngineError::RpcError {
            chain_id: chain.chain_id(),
            rpc_url: chain.rpc_url(),
            message: self.to_string(),
            kind: to_engine_rpc_error_kind(self),
        }
    }
}
