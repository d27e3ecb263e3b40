use std::time::Instant;

use alloy::{
    consensus::TypedTransaction,
    network::TransactionBuilder,
    primitives::{Address, TxHash, U256},
    rpc::types::TransactionRequest,
};
use keeper_core::{
    chain::{Chain, ChainService, ReceiptSummary},
    execution_options::ExecutionMode,
    job::JobResult,
    signer::{EoaSigningOptions, TransactionSigner},
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    context::KeeperContext,
    fee_escalator::{FeeEscalator, FeeOffer},
    limit_order::{
        LimitOrderJobData,
        error::{LimitKeeperError, SendErrorClassification, classify_send_error},
    },
    metrics::{record_escalation_attempts, record_outcome, record_submission_duration},
    nonce_allocator::{NonceAllocator, NonceLease},
    receipt::{EscalatingSender, EscalationError, ReceiptPollConfig, ReceiptWaiter},
    upkeep::check_upkeep,
};

/// Escalations allowed after the first broadcast in optimized mode.
pub const DEFAULT_MAX_ESCALATIONS: u32 = 3;

/// Receipt lookups spent on a hash the node rejected as a possible duplicate.
pub const POSSIBLY_SENT_MAX_POLLS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionConfig {
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default = "default_max_escalations")]
    pub max_escalations: u32,
    #[serde(flatten)]
    pub receipt: ReceiptPollConfig,
}

fn default_max_escalations() -> u32 {
    DEFAULT_MAX_ESCALATIONS
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            max_escalations: DEFAULT_MAX_ESCALATIONS,
            receipt: ReceiptPollConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum KeeperOutcome {
    /// The order book reported nothing to do. No nonce was leased and nothing was sent.
    NotExecutable,
    #[serde(rename_all = "camelCase")]
    Included {
        transaction_hash: TxHash,
        block_number: Option<u64>,
        gas_used: u64,
        nonce: u64,
        /// Broadcasts made under the nonce, including the first.
        attempts: u32,
    },
}

impl KeeperOutcome {
    fn included(receipt: ReceiptSummary, nonce: u64, attempts: u32) -> Self {
        KeeperOutcome::Included {
            transaction_hash: receipt.transaction_hash,
            block_number: receipt.block_number,
            gas_used: receipt.gas_used,
            nonce,
            attempts,
        }
    }
}

async fn guarded<F: Future>(
    cancellation: &CancellationToken,
    stage: &str,
    future: F,
) -> Result<F::Output, LimitKeeperError> {
    tokio::select! {
        biased;
        _ = cancellation.cancelled() => Err(LimitKeeperError::cancelled(stage)),
        output = future => Ok(output),
    }
}

/// Drives one work item through upkeep check, nonce lease, broadcast and receipt wait.
pub struct LimitOrderHandler<CS, S> {
    pub context: KeeperContext<CS, S>,
    pub nonce_allocator: NonceAllocator,
    pub config: SubmissionConfig,
}

impl<CS, S> LimitOrderHandler<CS, S>
where
    CS: ChainService,
    S: TransactionSigner,
{
    pub fn new(context: KeeperContext<CS, S>, config: SubmissionConfig) -> Self {
        Self {
            context,
            nonce_allocator: NonceAllocator::new(),
            config,
        }
    }

    #[tracing::instrument(skip_all, fields(
        job_id = job_id,
        action = %data.action,
        network = %data.target.network,
        contract = ?data.target.contract,
        keeper = ?data.target.keeper,
        mode = tracing::field::Empty,
    ))]
    pub async fn process(
        &self,
        job_id: &str,
        data: &LimitOrderJobData,
        cancellation: CancellationToken,
    ) -> JobResult<KeeperOutcome, LimitKeeperError> {
        let mode = data.mode.unwrap_or(self.config.mode);
        tracing::Span::current().record("mode", tracing::field::display(mode));

        let started = Instant::now();
        let result = self.run(data, mode, &cancellation).await;
        record_submission_duration(
            &mode.to_string(),
            &data.target.network,
            started.elapsed().as_secs_f64(),
        );

        let action = data.action.to_string();
        match &result {
            Ok(KeeperOutcome::NotExecutable) => {
                record_outcome(&data.target.network, &action, "not_executable");
            }
            Ok(outcome @ KeeperOutcome::Included { attempts, .. }) => {
                record_escalation_attempts(&data.target.network, *attempts);
                record_outcome(&data.target.network, &action, "included");
                tracing::info!(?outcome, "Work item succeeded");
            }
            Err(error) => {
                let kind = if error.is_retryable() {
                    "retryable"
                } else {
                    "failed"
                };
                record_outcome(&data.target.network, &action, kind);
                tracing::warn!(error = ?error, retryable = error.is_retryable(), "Work item failed");
            }
        }

        result.map_err(LimitKeeperError::handle)
    }

    async fn run(
        &self,
        data: &LimitOrderJobData,
        mode: ExecutionMode,
        cancellation: &CancellationToken,
    ) -> Result<KeeperOutcome, LimitKeeperError> {
        let target = &data.target;
        let chain = self.context.chain(&target.network)?;

        if !self.context.signer.has_account(target.keeper) {
            return Err(LimitKeeperError::validation(format!(
                "no signing key available for keeper {}",
                target.keeper
            )));
        }

        tracing::debug!(state = "CHECKING", "Checking upkeep");
        let executable = guarded(
            cancellation,
            "checking upkeep",
            check_upkeep(&chain, target.contract, target.keeper, &data.payload),
        )
        .await?
        .map_err(|e| LimitKeeperError::from_upkeep_error(target.contract, e))?;

        if !executable {
            tracing::info!("Order not executable, nothing to do");
            return Ok(KeeperOutcome::NotExecutable);
        }

        tracing::debug!(state = "LEASING", "Leasing nonce");
        let lease = guarded(
            cancellation,
            "leasing nonce",
            self.nonce_allocator.lease(&chain, target.keeper),
        )
        .await?
        .map_err(|inner_error| LimitKeeperError::NonceLeaseFailed {
            keeper: target.keeper,
            message: inner_error.to_string(),
            inner_error,
        })?;

        let result = match mode {
            ExecutionMode::Simple => self.submit_simple(&chain, data, &lease, cancellation).await,
            ExecutionMode::Optimized => {
                self.submit_optimized(&chain, data, &lease, cancellation)
                    .await
            }
        };

        lease.release();
        result
    }

    fn sender<'a, C: Chain>(
        &'a self,
        chain: &'a C,
        data: &LimitOrderJobData,
        lease: &NonceLease,
    ) -> UpkeepSender<'a, C, S> {
        let target = &data.target;
        let request = TransactionRequest::default()
            .with_from(target.keeper)
            .with_to(target.contract)
            .with_input(data.payload.perform_upkeep_calldata())
            .with_value(U256::ZERO)
            .with_chain_id(chain.chain_id())
            .with_nonce(lease.nonce());

        UpkeepSender {
            chain,
            signer: self.context.signer.as_ref(),
            escalator: FeeEscalator::new(chain, request.clone())
                .with_gas_limit_multiplier(data.fee_overrides.gas_limit_multiplier()),
            request,
            signing: EoaSigningOptions {
                from: target.keeper,
                chain_id: chain.chain_id(),
            },
            contract: target.contract,
            nonce: lease.nonce(),
            offer: None,
            attempts: 0,
        }
    }

    /// Network-suggested pricing, one broadcast, then block on the receipt.
    async fn submit_simple<C: Chain>(
        &self,
        chain: &C,
        data: &LimitOrderJobData,
        lease: &NonceLease,
        cancellation: &CancellationToken,
    ) -> Result<KeeperOutcome, LimitKeeperError> {
        let sender = self.sender(chain, data, lease);

        let offer = guarded(
            cancellation,
            "pricing transaction",
            sender.escalator.adaptive(&data.fee_overrides),
        )
        .await?
        .map_err(|e| LimitKeeperError::from_fee_error(data.target.contract, e))?;

        tracing::debug!(state = "SENDING", nonce = lease.nonce(), "Sending transaction");
        let broadcast = guarded(cancellation, "broadcasting", sender.broadcast(&offer, 1)).await??;
        let hash = broadcast.hash();

        tracing::debug!(state = "WAITING", transaction_hash = ?hash, "Waiting for receipt");
        let waiter = ReceiptWaiter::new(chain, self.config.receipt, cancellation.clone());
        // A rejected duplicate is never resent in simple mode, so its wait must end.
        let receipt = match broadcast {
            Broadcast::Accepted(hash) => waiter.wait(hash).await,
            Broadcast::PossiblySent(hash) => {
                waiter.wait_bounded(hash, POSSIBLY_SENT_MAX_POLLS).await
            }
        }
        .map_err(|e| LimitKeeperError::from_receipt_error(data.target.contract, e))?;

        tracing::info!(state = "SUCCEEDED", transaction_hash = ?hash, "Transaction included");
        Ok(KeeperOutcome::included(receipt, lease.nonce(), 1))
    }

    /// Minimal-tip pricing, escalated under the same nonce until mined or out of budget.
    async fn submit_optimized<C: Chain>(
        &self,
        chain: &C,
        data: &LimitOrderJobData,
        lease: &NonceLease,
        cancellation: &CancellationToken,
    ) -> Result<KeeperOutcome, LimitKeeperError> {
        let mut sender = self.sender(chain, data, lease);

        let priced = if data.fee_overrides.is_adaptive() {
            guarded(
                cancellation,
                "pricing transaction",
                sender.escalator.adaptive(&data.fee_overrides),
            )
            .await?
        } else {
            guarded(cancellation, "pricing transaction", sender.escalator.initial()).await?
        };
        let initial =
            priced.map_err(|e| LimitKeeperError::from_fee_error(data.target.contract, e))?;
        sender.offer = Some(initial);

        tracing::debug!(
            state = "SENDING",
            nonce = lease.nonce(),
            fee_cap = initial.fee_cap,
            tip = initial.tip,
            "Sending transaction with escalation"
        );
        let receipt = ReceiptWaiter::new(chain, self.config.receipt, cancellation.clone())
            .wait_with_escalation(&mut sender, self.config.max_escalations)
            .await
            .map_err(|e| match e {
                EscalationError::Send { error, .. } => error,
                EscalationError::Receipt(error) => {
                    LimitKeeperError::from_receipt_error(data.target.contract, error)
                }
            })?;

        tracing::info!(
            state = "SUCCEEDED",
            transaction_hash = ?receipt.transaction_hash,
            attempts = sender.attempts,
            "Transaction included"
        );
        Ok(KeeperOutcome::included(
            receipt,
            lease.nonce(),
            sender.attempts,
        ))
    }
}

#[derive(Debug, Clone, Copy)]
enum Broadcast {
    Accepted(TxHash),
    /// The node refused it in a way that suggests this or a sibling is already pooled.
    PossiblySent(TxHash),
}

impl Broadcast {
    fn hash(self) -> TxHash {
        match self {
            Broadcast::Accepted(hash) | Broadcast::PossiblySent(hash) => hash,
        }
    }
}

/// Builds, signs and broadcasts the `performUpkeep` call under one leased nonce.
struct UpkeepSender<'a, C, S> {
    chain: &'a C,
    signer: &'a S,
    escalator: FeeEscalator<'a, C>,
    request: TransactionRequest,
    signing: EoaSigningOptions,
    contract: Address,
    nonce: u64,
    offer: Option<FeeOffer>,
    attempts: u32,
}

impl<C: Chain, S: TransactionSigner> UpkeepSender<'_, C, S> {
    fn build_transaction(&self, offer: &FeeOffer) -> Result<TypedTransaction, LimitKeeperError> {
        let request = self.request.clone().with_gas_limit(offer.gas_limit);
        let request = if offer.legacy {
            request.with_gas_price(offer.fee_cap)
        } else {
            request
                .with_max_fee_per_gas(offer.fee_cap)
                .with_max_priority_fee_per_gas(offer.tip)
        };

        request
            .build_typed_tx()
            .map_err(|request| LimitKeeperError::InternalError {
                message: format!("failed to build typed transaction from {request:?}"),
            })
    }

    async fn broadcast(&self, offer: &FeeOffer, attempt: u32) -> Result<Broadcast, LimitKeeperError> {
        let transaction = self.build_transaction(offer)?;
        let signed = self
            .signer
            .sign_transaction(self.signing, transaction)
            .await
            .map_err(LimitKeeperError::from_signing_error)?;
        let hash = *signed.hash();

        match self.chain.send_transaction(signed).await {
            Ok(sent) => {
                tracing::info!(
                    attempt,
                    nonce = self.nonce,
                    fee_cap = offer.fee_cap,
                    tip = offer.tip,
                    gas_limit = offer.gas_limit,
                    transaction_hash = ?sent,
                    "Transaction broadcast"
                );
                Ok(Broadcast::Accepted(sent))
            }
            Err(error) => match classify_send_error(&error) {
                SendErrorClassification::PossiblySent => {
                    tracing::warn!(
                        attempt,
                        nonce = self.nonce,
                        transaction_hash = ?hash,
                        error = %error,
                        "Broadcast rejected but transaction may be in the mempool, waiting on receipt"
                    );
                    Ok(Broadcast::PossiblySent(hash))
                }
                SendErrorClassification::DeterministicFailure => {
                    tracing::warn!(attempt, contract = ?self.contract, error = %error, "Broadcast failed");
                    Err(LimitKeeperError::from_send_error(attempt, error))
                }
            },
        }
    }
}

impl<C: Chain, S: TransactionSigner> EscalatingSender for UpkeepSender<'_, C, S> {
    type Error = LimitKeeperError;

    async fn send(&mut self, attempt: u32) -> Result<TxHash, LimitKeeperError> {
        let current = self.offer.ok_or_else(|| LimitKeeperError::InternalError {
            message: "escalation started without an initial fee offer".to_string(),
        })?;

        let offer = self
            .escalator
            .escalate(&current, attempt)
            .await
            .map_err(|e| LimitKeeperError::from_fee_error(self.contract, e))?;
        if attempt > 1 {
            tracing::info!(
                attempt,
                multiplier = offer.multiplier,
                previous_fee_cap = current.fee_cap,
                fee_cap = offer.fee_cap,
                gas_limit = offer.gas_limit,
                "Escalating fee"
            );
        }

        let hash = self.broadcast(&offer, attempt).await?.hash();
        self.offer = Some(offer);
        self.attempts = attempt;
        Ok(hash)
    }
}
