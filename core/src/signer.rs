use std::{collections::HashMap, path::Path};

use alloy::{
    consensus::{SignableTransaction, Signed, Transaction, TypedTransaction},
    primitives::{Address, ChainId},
    signers::{SignerSync, local::PrivateKeySigner},
};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// EOA signing options
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EoaSigningOptions {
    /// The EOA address to sign with
    pub from: Address,
    /// Chain the signed transaction is bound to
    pub chain_id: ChainId,
}

/// Key-custody collaborator: turns an unsigned transaction into a signed one.
pub trait TransactionSigner: Send + Sync {
    fn sign_transaction(
        &self,
        options: EoaSigningOptions,
        transaction: TypedTransaction,
    ) -> impl Future<Output = Result<Signed<TypedTransaction>, EngineError>> + Send;

    fn has_account(&self, address: Address) -> bool;
}

/// In-process key store holding one local signer per keeper address.
#[derive(Clone, Default)]
pub struct LocalKeystoreSigner {
    signers: HashMap<Address, PrivateKeySigner>,
}

impl LocalKeystoreSigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_signer(&mut self, signer: PrivateKeySigner) -> Address {
        let address = signer.address();
        self.signers.insert(address, signer);
        address
    }

    pub fn add_private_key(&mut self, private_key: &str) -> Result<Address, EngineError> {
        let signer = private_key
            .trim()
            .parse::<PrivateKeySigner>()
            .map_err(|e| EngineError::validation(format!("invalid private key: {e}")))?;
        Ok(self.add_signer(signer))
    }

    /// Decrypts a JSON keystore file (web3 secret storage format).
    pub fn add_keystore(
        &mut self,
        path: impl AsRef<Path>,
        password: impl AsRef<[u8]>,
    ) -> Result<Address, EngineError> {
        let path = path.as_ref();
        let signer = PrivateKeySigner::decrypt_keystore(path, password).map_err(|e| {
            EngineError::validation(format!("failed to decrypt keystore {}: {e}", path.display()))
        })?;
        Ok(self.add_signer(signer))
    }

    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.signers.keys()
    }
}

impl TransactionSigner for LocalKeystoreSigner {
    async fn sign_transaction(
        &self,
        options: EoaSigningOptions,
        transaction: TypedTransaction,
    ) -> Result<Signed<TypedTransaction>, EngineError> {
        let signer = self
            .signers
            .get(&options.from)
            .ok_or_else(|| EngineError::SigningError {
                address: options.from,
                message: "no key for this address in the keystore".to_string(),
            })?;

        if transaction.chain_id() != Some(options.chain_id) {
            return Err(EngineError::SigningError {
                address: options.from,
                message: format!(
                    "transaction chain id {:?} does not match signing chain id {}",
                    transaction.chain_id(),
                    options.chain_id
                ),
            });
        }

        let signature = signer
            .sign_hash_sync(&transaction.signature_hash())
            .map_err(|e| {
                tracing::error!(from = ?options.from, error = ?e, "Error signing transaction");
                EngineError::SigningError {
                    address: options.from,
                    message: e.to_string(),
                }
            })?;

        Ok(transaction.into_signed(signature))
    }

    fn has_account(&self, address: Address) -> bool {
        self.signers.contains_key(&address)
    }
}
