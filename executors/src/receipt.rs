use std::time::Duration;

use alloy::primitives::TxHash;
use keeper_core::{
    chain::{Chain, ReceiptSummary},
    error::EngineError,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReceiptPollConfig {
    /// Delay between receipt lookups while a transaction is pending.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// How long an escalating broadcast is given before the next fee bump.
    #[serde(with = "duration_ms")]
    pub escalation_wait: Duration,
}

impl Default for ReceiptPollConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            escalation_wait: Duration::from_secs(1),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum ReceiptError {
    #[error("stopped waiting for a receipt: cancelled")]
    #[serde(rename_all = "camelCase")]
    Cancelled { transaction_hash: Option<TxHash> },

    #[error("transaction {transaction_hash} failed on chain")]
    #[serde(rename_all = "camelCase")]
    Reverted {
        transaction_hash: TxHash,
        block_number: Option<u64>,
        gas_used: u64,
    },

    #[error("receipt lookup for {transaction_hash} failed: {inner_error}")]
    #[serde(rename_all = "camelCase")]
    QueryFailed {
        transaction_hash: TxHash,
        inner_error: EngineError,
    },

    #[error("no receipt for {transaction_hash} after {polls} lookups")]
    #[serde(rename_all = "camelCase")]
    NotFound { transaction_hash: TxHash, polls: u32 },

    #[error("transaction not mined after {attempts} fee escalations")]
    #[serde(rename_all = "camelCase")]
    EscalationBudgetExhausted {
        attempts: u32,
        last_transaction_hash: Option<TxHash>,
    },
}

impl ReceiptError {
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ReceiptError::Reverted { .. } | ReceiptError::EscalationBudgetExhausted { .. }
        )
    }
}

/// One fee-bumped broadcast of the same logical transaction per call.
pub trait EscalatingSender: Send {
    type Error: Send;

    /// `attempt` starts at 1. Returns the hash of the transaction that was broadcast.
    fn send(&mut self, attempt: u32) -> impl Future<Output = Result<TxHash, Self::Error>> + Send;
}

#[derive(Debug)]
pub enum EscalationError<E> {
    /// The sender could not produce a broadcast for this attempt.
    Send { attempt: u32, error: E },
    Receipt(ReceiptError),
}

impl<E> From<ReceiptError> for EscalationError<E> {
    fn from(error: ReceiptError) -> Self {
        EscalationError::Receipt(error)
    }
}

enum Classification {
    Pending,
    Included(ReceiptSummary),
}

fn classify(hash: TxHash, receipt: Option<ReceiptSummary>) -> Result<Classification, ReceiptError> {
    match receipt {
        None => Ok(Classification::Pending),
        Some(receipt) if !receipt.status => Err(ReceiptError::Reverted {
            transaction_hash: hash,
            block_number: receipt.block_number,
            gas_used: receipt.gas_used,
        }),
        Some(receipt) if receipt.is_included() => Ok(Classification::Included(receipt)),
        Some(_) => Ok(Classification::Pending),
    }
}

/// Polls the ledger for receipts and sorts them into pending, success or failure.
pub struct ReceiptWaiter<'a, C> {
    chain: &'a C,
    config: ReceiptPollConfig,
    cancellation: CancellationToken,
}

impl<'a, C: Chain> ReceiptWaiter<'a, C> {
    pub fn new(chain: &'a C, config: ReceiptPollConfig, cancellation: CancellationToken) -> Self {
        Self {
            chain,
            config,
            cancellation,
        }
    }

    async fn query(&self, hash: TxHash) -> Result<Classification, ReceiptError> {
        let result = tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => {
                return Err(ReceiptError::Cancelled {
                    transaction_hash: Some(hash),
                });
            }
            result = self.chain.transaction_receipt(hash) => result,
        };
        let receipt = result.map_err(|inner_error| ReceiptError::QueryFailed {
            transaction_hash: hash,
            inner_error,
        })?;
        classify(hash, receipt)
    }

    /// Returns `false` if cancelled before `duration` elapsed.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancellation.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Blocks until `hash` is included or fails, polling at the configured interval.
    pub async fn wait(&self, hash: TxHash) -> Result<ReceiptSummary, ReceiptError> {
        self.poll(hash, None).await
    }

    /// Like [`wait`](Self::wait), but gives up with [`ReceiptError::NotFound`] once
    /// `max_polls` lookups found nothing. For hashes the node may never have accepted.
    pub async fn wait_bounded(
        &self,
        hash: TxHash,
        max_polls: u32,
    ) -> Result<ReceiptSummary, ReceiptError> {
        self.poll(hash, Some(max_polls)).await
    }

    #[tracing::instrument(skip_all, fields(transaction_hash = ?hash, max_polls = ?max_polls))]
    async fn poll(
        &self,
        hash: TxHash,
        max_polls: Option<u32>,
    ) -> Result<ReceiptSummary, ReceiptError> {
        let mut polls = 0u32;
        loop {
            polls += 1;
            if let Classification::Included(receipt) = self.query(hash).await? {
                tracing::debug!(polls, block_number = ?receipt.block_number, "Transaction included");
                return Ok(receipt);
            }

            if max_polls.is_some_and(|max| polls >= max) {
                tracing::warn!(polls, "Gave up waiting for a receipt");
                return Err(ReceiptError::NotFound {
                    transaction_hash: hash,
                    polls,
                });
            }

            if !self.sleep(self.config.poll_interval).await {
                tracing::debug!(polls, "Receipt wait cancelled");
                return Err(ReceiptError::Cancelled {
                    transaction_hash: Some(hash),
                });
            }
        }
    }

    /// Broadcasts through `sender`, and on every stall broadcasts again with a higher fee
    /// until a receipt appears or `max_attempts` escalations were spent.
    ///
    /// All hashes broadcast so far are checked on each stall, newest first, since any one
    /// of the replacements may be the one that gets mined.
    #[tracing::instrument(skip_all, fields(max_attempts = max_attempts))]
    pub async fn wait_with_escalation<S: EscalatingSender>(
        &self,
        sender: &mut S,
        max_attempts: u32,
    ) -> Result<ReceiptSummary, EscalationError<S::Error>> {
        let mut hashes: Vec<TxHash> = Vec::new();
        let mut attempt = 1u32;

        loop {
            let sent = tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => {
                    return Err(ReceiptError::Cancelled {
                        transaction_hash: hashes.last().copied(),
                    }
                    .into());
                }
                sent = sender.send(attempt) => sent,
            };
            let hash = sent.map_err(|error| EscalationError::Send { attempt, error })?;
            if !hashes.contains(&hash) {
                hashes.push(hash);
            }
            tracing::debug!(attempt, transaction_hash = ?hash, "Broadcast sent, waiting for receipt");

            if !self.sleep(self.config.escalation_wait).await {
                return Err(ReceiptError::Cancelled {
                    transaction_hash: Some(hash),
                }
                .into());
            }

            for hash in hashes.iter().rev() {
                if let Classification::Included(receipt) = self.query(*hash).await? {
                    tracing::debug!(attempt, transaction_hash = ?hash, "Transaction included");
                    return Ok(receipt);
                }
            }

            if attempt > max_attempts {
                tracing::warn!(attempts = max_attempts, "Escalation budget exhausted");
                return Err(ReceiptError::EscalationBudgetExhausted {
                    attempts: max_attempts,
                    last_transaction_hash: Some(hash),
                }
                .into());
            }

            tracing::info!(attempt, transaction_hash = ?hash, "Transaction stalled, escalating fee");
            attempt += 1;
        }
    }
}
