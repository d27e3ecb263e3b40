use std::collections::HashMap;

use alloy::{
    consensus::{Signed, TypedTransaction},
    eips::BlockNumberOrTag,
    primitives::{Address, Bytes, TxHash},
    providers::{Provider, ProviderBuilder, RootProvider},
    rpc::types::TransactionRequest,
    transports::http::reqwest::Url,
};
use serde::{Deserialize, Serialize};

use crate::error::{AlloyRpcErrorToEngineError, EngineError};

/// The ledger's record of a transaction's outcome, reduced to what the keeper acts on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptSummary {
    pub transaction_hash: TxHash,
    pub block_number: Option<u64>,
    pub status: bool,
    pub gas_used: u64,
}

impl ReceiptSummary {
    pub fn is_included(&self) -> bool {
        self.block_number.is_some_and(|block| block > 0)
    }
}

/// The ledger RPC surface consumed by the keeper.
///
/// Every method is a single round trip against the network's one configured endpoint.
pub trait Chain: Send + Sync {
    fn chain_id(&self) -> u64;
    fn network(&self) -> &str;
    fn rpc_url(&self) -> String;

    /// Next usable nonce for `address`, counting transactions still in the mempool.
    fn pending_nonce(
        &self,
        address: Address,
    ) -> impl Future<Output = Result<u64, EngineError>> + Send;

    /// Base fee of the latest block, `None` on chains without EIP-1559.
    fn base_fee(&self) -> impl Future<Output = Result<Option<u128>, EngineError>> + Send;

    fn suggested_priority_fee(&self) -> impl Future<Output = Result<u128, EngineError>> + Send;

    /// Legacy gas price, for networks without a base fee.
    fn gas_price(&self) -> impl Future<Output = Result<u128, EngineError>> + Send;

    fn estimate_gas(
        &self,
        request: TransactionRequest,
    ) -> impl Future<Output = Result<u64, EngineError>> + Send;

    /// Read-only `eth_call` against the latest block.
    fn call(
        &self,
        request: TransactionRequest,
    ) -> impl Future<Output = Result<Bytes, EngineError>> + Send;

    fn send_transaction(
        &self,
        transaction: Signed<TypedTransaction>,
    ) -> impl Future<Output = Result<TxHash, EngineError>> + Send;

    /// `Ok(None)` while the transaction is unknown or not yet mined.
    fn transaction_receipt(
        &self,
        hash: TxHash,
    ) -> impl Future<Output = Result<Option<ReceiptSummary>, EngineError>> + Send;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    pub network: String,
    pub chain_id: u64,
    pub rpc_url: String,
}

#[derive(Clone, Debug)]
pub struct RpcChain {
    network: String,
    chain_id: u64,
    rpc_url: Url,
    pub provider: RootProvider,
}

impl RpcChain {
    pub fn provider(&self) -> &RootProvider {
        &self.provider
    }
}

impl ChainConfig {
    pub fn to_chain(&self) -> Result<RpcChain, EngineError> {
        if self.network.is_empty() {
            return Err(EngineError::RpcConfigError {
                message: "network name cannot be empty".to_string(),
            });
        }

        let rpc_url = Url::parse(&self.rpc_url).map_err(|e| EngineError::RpcConfigError {
            message: format!("Failed to parse RPC URL for {}: {e}", self.network),
        })?;

        Ok(RpcChain {
            network: self.network.clone(),
            chain_id: self.chain_id,
            provider: ProviderBuilder::new()
                .disable_recommended_fillers()
                .connect_http(rpc_url.clone()),
            rpc_url,
        })
    }
}

impl Chain for RpcChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn network(&self) -> &str {
        &self.network
    }

    fn rpc_url(&self) -> String {
        self.rpc_url.to_string()
    }

    async fn pending_nonce(&self, address: Address) -> Result<u64, EngineError> {
        self.provider
            .get_transaction_count(address)
            .pending()
            .await
            .map_err(|e| e.to_engine_error(self))
    }

    async fn base_fee(&self) -> Result<Option<u128>, EngineError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Latest)
            .await
            .map_err(|e| e.to_engine_error(self))?
            .ok_or_else(|| EngineError::InternalError {
                message: format!("latest block not available on {}", self.network),
            })?;

        Ok(block.header.base_fee_per_gas.map(u128::from))
    }

    async fn suggested_priority_fee(&self) -> Result<u128, EngineError> {
        self.provider
            .get_max_priority_fee_per_gas()
            .await
            .map_err(|e| e.to_engine_error(self))
    }

    async fn gas_price(&self) -> Result<u128, EngineError> {
        self.provider
            .get_gas_price()
            .await
            .map_err(|e| e.to_engine_error(self))
    }

    async fn estimate_gas(&self, request: TransactionRequest) -> Result<u64, EngineError> {
        self.provider
            .estimate_gas(request)
            .await
            .map_err(|e| e.to_engine_error(self))
    }

    async fn call(&self, request: TransactionRequest) -> Result<Bytes, EngineError> {
        self.provider
            .call(request)
            .await
            .map_err(|e| e.to_engine_error(self))
    }

    async fn send_transaction(
        &self,
        transaction: Signed<TypedTransaction>,
    ) -> Result<TxHash, EngineError> {
        self.provider
            .send_tx_envelope(transaction.into())
            .await
            .map(|pending| *pending.tx_hash())
            .map_err(|e| e.to_engine_error(self))
    }

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<ReceiptSummary>, EngineError> {
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| e.to_engine_error(self))?;

        Ok(receipt.map(|receipt| ReceiptSummary {
            transaction_hash: receipt.transaction_hash,
            block_number: receipt.block_number,
            status: receipt.status(),
            gas_used: receipt.gas_used,
        }))
    }
}

/// Resolves a network name to its chain client.
pub trait ChainService: Send + Sync {
    type Chain: Chain + Clone + 'static;

    fn get_chain(&self, network: &str) -> Result<Self::Chain, EngineError>;
}

/// Network name → client map, built once from configuration.
#[derive(Clone, Default)]
pub struct ChainRegistry {
    chains: HashMap<String, RpcChain>,
}

impl ChainRegistry {
    pub fn from_configs(configs: &[ChainConfig]) -> Result<Self, EngineError> {
        let mut chains = HashMap::with_capacity(configs.len());
        for config in configs {
            let chain = config.to_chain()?;
            if chains.insert(config.network.clone(), chain).is_some() {
                return Err(EngineError::RpcConfigError {
                    message: format!("network {} is configured more than once", config.network),
                });
            }
        }
        Ok(Self { chains })
    }

    pub fn networks(&self) -> impl Iterator<Item = &str> {
        self.chains.keys().map(String::as_str)
    }
}

impl ChainService for ChainRegistry {
    type Chain = RpcChain;

    fn get_chain(&self, network: &str) -> Result<RpcChain, EngineError> {
        self.chains
            .get(network)
            .cloned()
            .ok_or_else(|| EngineError::RpcConfigError {
                message: format!("network {network} is not supported"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(network: &str, rpc_url: &str) -> ChainConfig {
        ChainConfig {
            network: network.to_string(),
            chain_id: 31337,
            rpc_url: rpc_url.to_string(),
        }
    }

    #[test]
    fn test_registry_resolves_configured_networks() {
        let registry = ChainRegistry::from_configs(&[
            config("anvil", "http://127.0.0.1:8545"),
            config("sepolia", "https://rpc.sepolia.org"),
        ])
        .unwrap();

        let chain = registry.get_chain("anvil").unwrap();
        assert_eq!(chain.chain_id(), 31337);
        assert_eq!(chain.network(), "anvil");
        assert!(registry.get_chain("mainnet").is_err());
    }

    #[test]
    fn test_registry_rejects_bad_urls_and_duplicates() {
        assert!(matches!(
            ChainRegistry::from_configs(&[config("anvil", "not a url")]),
            Err(EngineError::RpcConfigError { .. })
        ));
        assert!(matches!(
            ChainRegistry::from_configs(&[
                config("anvil", "http://127.0.0.1:8545"),
                config("anvil", "http://127.0.0.1:8546"),
            ]),
            Err(EngineError::RpcConfigError { .. })
        ));
    }

    #[test]
    fn test_receipt_inclusion() {
        let mut receipt = ReceiptSummary {
            transaction_hash: TxHash::ZERO,
            block_number: None,
            status: true,
            gas_used: 21_000,
        };
        assert!(!receipt.is_included());
        receipt.block_number = Some(0);
        assert!(!receipt.is_included());
        receipt.block_number = Some(12);
        assert!(receipt.is_included());
    }
}
