use std::sync::Arc;

use keeper_core::{chain::ChainService, signer::TransactionSigner};

use crate::limit_order::LimitKeeperError;

/// Everything a submission needs from the outside world: network clients and keys.
pub struct KeeperContext<CS, S> {
    pub chains: Arc<CS>,
    pub signer: Arc<S>,
}

impl<CS, S> Clone for KeeperContext<CS, S> {
    fn clone(&self) -> Self {
        Self {
            chains: self.chains.clone(),
            signer: self.signer.clone(),
        }
    }
}

impl<CS: ChainService, S: TransactionSigner> KeeperContext<CS, S> {
    pub fn new(chains: CS, signer: S) -> Self {
        Self {
            chains: Arc::new(chains),
            signer: Arc::new(signer),
        }
    }

    pub fn chain(&self, network: &str) -> Result<CS::Chain, LimitKeeperError> {
        self.chains
            .get_chain(network)
            .map_err(|e| LimitKeeperError::ChainServiceError {
                network: network.to_string(),
                message: e.to_string(),
            })
    }
}
