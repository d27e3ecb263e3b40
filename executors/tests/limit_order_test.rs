
use std::time::Duration;

use alloy::primitives::{Address, Bytes};
use fixtures::*;
use keeper_core::{execution_options::ExecutionMode, job::JobError};
use keeper_executors::limit_order::{
    KeeperOutcome, LimitKeeperError, LimitOrderJobData, LimitOrderRequest, SubmissionConfig,
    handler::POSSIBLY_SENT_MAX_POLLS,
};
use tokio_util::sync::CancellationToken;

fn optimized() -> SubmissionConfig {
    SubmissionConfig {
        receipt: fast_receipts(),
        ..SubmissionConfig::default()
    }
}

fn simple() -> SubmissionConfig {
    SubmissionConfig {
        mode: ExecutionMode::Simple,
        ..optimized()
    }
}

fn execute_item(keeper: Address) -> LimitOrderJobData {
    let request: LimitOrderRequest = serde_json::from_value(serde_json::json!({
        "type": "execute",
        "network": NETWORK,
        "contractAddress": ORDER_BOOK.to_string(),
        "keeperAddress": keeper.to_string(),
        "order": {
            "account": "0x70997970C51812dc3A010C7d01b50e0d17dc79C8",
            "index": "0x7",
            "orderType": "0x0",
            "executeFee": "0x2710"
        },
        "tokenIn": "0x0000000000000000000000000000000000000001",
        "tokenOut": "0x0000000000000000000000000000000000000002",
        "remainingAmountIn": "0x3e8",
        "routes": [{
            "dexId": 2,
            "tokenIn": "0x0000000000000000000000000000000000000001",
            "tokenOut": "0x0000000000000000000000000000000000000002",
            "amountIn": "0x3e8",
            "amountOutMin": "0x3d4"
        }],
        "amountIn": "0x3e8",
        "amountOutMin": "0x3d4",
        "amountOutExpected": "0x3de"
    }))
    .unwrap();
    request.try_into().unwrap()
}

fn cancel_item(keeper: Address) -> LimitOrderJobData {
    let request: LimitOrderRequest = serde_json::from_value(serde_json::json!({
        "type": "cancel",
        "network": NETWORK,
        "contractAddress": ORDER_BOOK.to_string(),
        "keeperAddress": keeper.to_string(),
        "order": {
            "account": "0x70997970C51812dc3A010C7d01b50e0d17dc79C8",
            "index": "0x7",
            "orderType": "0x0"
        }
    }))
    .unwrap();
    request.try_into().unwrap()
}

fn failed(result: Result<KeeperOutcome, JobError<LimitKeeperError>>) -> LimitKeeperError {
    match result {
        Err(JobError::Fail(error)) => error,
        other => panic!("expected a permanent failure, got {other:?}"),
    }
}

fn nacked(result: Result<KeeperOutcome, JobError<LimitKeeperError>>) -> LimitKeeperError {
    match result {
        Err(JobError::Nack { error, delay }) => {
            assert!(delay.is_some());
            error
        }
        other => panic!("expected a retryable failure, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn not_executable_order_sends_nothing() {
    setup_tracing();
    let ledger = FakeLedger::default();
    ledger.configure(|s| s.upkeep_needed = false);
    let (handler, keeper) = keeper_handler(&ledger, optimized());

    let outcome = handler
        .process("job-1", &execute_item(keeper), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, KeeperOutcome::NotExecutable);
    let state = ledger.state();
    assert_eq!(state.calls, 1);
    assert_eq!(state.nonce_queries, 0);
    assert_eq!(state.send_attempts, 0);
    assert_eq!(state.receipt_queries, 0);
}

#[tokio::test(start_paused = true)]
async fn optimized_submission_included_on_first_broadcast() {
    let ledger = FakeLedger::default();
    let (handler, keeper) = keeper_handler(&ledger, optimized());

    let outcome = handler
        .process("job-1", &execute_item(keeper), CancellationToken::new())
        .await
        .unwrap();

    let sent = ledger.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].nonce, 10);
    assert_eq!(sent[0].tip, Some(1));
    assert_eq!(sent[0].fee_cap, 1 + 2 * GWEI);
    assert_eq!(sent[0].gas_limit, 100_000);
    assert_eq!(
        outcome,
        KeeperOutcome::Included {
            transaction_hash: sent[0].hash,
            block_number: Some(100),
            gas_used: 80_000,
            nonce: 10,
            attempts: 1,
        }
    );
    assert_eq!(
        handler
            .nonce_allocator
            .state(CHAIN_ID, keeper)
            .unwrap()
            .active_leases,
        0
    );
}

#[tokio::test(start_paused = true)]
async fn optimized_submission_escalates_under_one_nonce() {
    let ledger = FakeLedger::default();
    ledger.configure(|s| s.mine_on_send = Some(3));
    let (handler, keeper) = keeper_handler(&ledger, optimized());

    let outcome = handler
        .process("job-1", &execute_item(keeper), CancellationToken::new())
        .await
        .unwrap();

    let sent = ledger.sent();
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|tx| tx.nonce == 10));
    assert!(sent.windows(2).all(|pair| pair[1].fee_cap > pair[0].fee_cap));
    assert_eq!(sent[1].fee_cap, (1 + 2 * GWEI) * 11 / 10 + 1);
    assert!(matches!(
        outcome,
        KeeperOutcome::Included { attempts: 3, transaction_hash, .. } if transaction_hash == sent[2].hash
    ));
}

#[tokio::test(start_paused = true)]
async fn exhausted_escalation_budget_is_permanent() {
    let ledger = FakeLedger::default();
    ledger.configure(|s| s.mine_on_send = None);
    let (handler, keeper) = keeper_handler(&ledger, optimized());

    let error = failed(
        handler
            .process("job-1", &execute_item(keeper), CancellationToken::new())
            .await,
    );

    let sent = ledger.sent();
    assert_eq!(sent.len(), 4);
    assert!(matches!(
        error,
        LimitKeeperError::EscalationBudgetExhausted { attempts: 3, last_transaction_hash: Some(hash), .. }
            if hash == sent[3].hash
    ));
    assert_eq!(
        handler
            .nonce_allocator
            .state(CHAIN_ID, keeper)
            .unwrap()
            .active_leases,
        0
    );
}

#[tokio::test(start_paused = true)]
async fn simple_submission_uses_network_pricing() {
    let ledger = FakeLedger::default();
    let (handler, keeper) = keeper_handler(&ledger, simple());

    let outcome = handler
        .process("job-1", &execute_item(keeper), CancellationToken::new())
        .await
        .unwrap();

    let sent = ledger.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].tip, Some(2 * GWEI));
    assert_eq!(sent[0].fee_cap, 2 * GWEI + 2 * GWEI);
    assert!(matches!(outcome, KeeperOutcome::Included { attempts: 1, nonce: 10, .. }));
}

#[tokio::test(start_paused = true)]
async fn simple_submission_waits_without_resending() {
    let ledger = FakeLedger::default();
    ledger.configure(|s| s.mine_on_send = None);
    let (handler, keeper) = keeper_handler(&ledger, simple());

    let miner = {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            let hash = ledger.sent()[0].hash;
            ledger.mine(hash, 55, true);
        })
    };

    let outcome = handler
        .process("job-1", &execute_item(keeper), CancellationToken::new())
        .await
        .unwrap();
    miner.await.unwrap();

    assert_eq!(ledger.state().send_attempts, 1);
    assert!(matches!(outcome, KeeperOutcome::Included { block_number: Some(55), .. }));
}

#[tokio::test(start_paused = true)]
async fn simple_submission_falls_back_to_legacy_pricing() {
    let ledger = FakeLedger::default();
    ledger.configure(|s| s.base_fee = None);
    let (handler, keeper) = keeper_handler(&ledger, simple());

    handler
        .process("job-1", &execute_item(keeper), CancellationToken::new())
        .await
        .unwrap();

    let sent = ledger.sent();
    assert_eq!(sent[0].tip, None);
    assert_eq!(sent[0].fee_cap, 3 * GWEI);
}

#[tokio::test(start_paused = true)]
async fn optimized_submission_requires_base_fee() {
    let ledger = FakeLedger::default();
    ledger.configure(|s| s.base_fee = None);
    let (handler, keeper) = keeper_handler(&ledger, optimized());

    let error = failed(
        handler
            .process("job-1", &execute_item(keeper), CancellationToken::new())
            .await,
    );

    assert!(matches!(error, LimitKeeperError::Eip1559Unsupported { network } if network == NETWORK));
    assert_eq!(ledger.state().send_attempts, 0);
    assert_eq!(
        handler
            .nonce_allocator
            .state(CHAIN_ID, keeper)
            .unwrap()
            .active_leases,
        0
    );
}

#[tokio::test(start_paused = true)]
async fn work_item_mode_overrides_configured_mode() {
    let ledger = FakeLedger::default();
    let (handler, keeper) = keeper_handler(&ledger, optimized());
    let mut item = execute_item(keeper);
    item.mode = Some(ExecutionMode::Simple);

    handler
        .process("job-1", &item, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(ledger.sent()[0].tip, Some(2 * GWEI));
}

#[tokio::test(start_paused = true)]
async fn cancellation_item_is_submitted() {
    let ledger = FakeLedger::default();
    let (handler, keeper) = keeper_handler(&ledger, optimized());
    let item = cancel_item(keeper);
    assert_eq!(item.max_retries(), 5);

    let outcome = handler
        .process("job-1", &item, CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(outcome, KeeperOutcome::Included { .. }));
    assert_eq!(ledger.state().calls, 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_items_get_distinct_nonces() {
    let ledger = FakeLedger::default();
    ledger.configure(|s| {
        s.mine_on_send = None;
        s.nonce_delay = Duration::from_millis(100);
    });
    let (handler, keeper) = keeper_handler(&ledger, optimized());
    let item = execute_item(keeper);

    let miner = async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        for tx in ledger.sent() {
            ledger.mine(tx.hash, 101, true);
        }
    };
    let (first, second, _) = tokio::join!(
        handler.process("job-1", &item, CancellationToken::new()),
        handler.process("job-2", &item, CancellationToken::new()),
        miner,
    );

    let mut nonces = vec![first.unwrap(), second.unwrap()]
        .into_iter()
        .map(|outcome| match outcome {
            KeeperOutcome::Included { nonce, .. } => nonce,
            KeeperOutcome::NotExecutable => panic!("item should have been included"),
        })
        .collect::<Vec<_>>();
    nonces.sort_unstable();

    assert_eq!(nonces, vec![10, 11]);
    assert_eq!(ledger.state().nonce_queries, 1);
}

#[tokio::test(start_paused = true)]
async fn missing_contract_code_is_permanent() {
    let ledger = FakeLedger::default();
    ledger.configure(|s| s.upkeep_response = Some(Bytes::new()));
    let (handler, keeper) = keeper_handler(&ledger, optimized());

    let error = failed(
        handler
            .process("job-1", &execute_item(keeper), CancellationToken::new())
            .await,
    );

    assert!(matches!(
        error,
        LimitKeeperError::ContractNotDeployed { contract_address, chain_id: CHAIN_ID }
            if contract_address == ORDER_BOOK
    ));
    assert_eq!(ledger.state().nonce_queries, 0);
}

#[tokio::test(start_paused = true)]
async fn upkeep_check_failures() {
    let ledger = FakeLedger::default();
    let (handler, keeper) = keeper_handler(&ledger, optimized());
    let item = execute_item(keeper);

    ledger.configure(|s| s.call_error = Some(transport_error()));
    let error = nacked(handler.process("job-1", &item, CancellationToken::new()).await);
    assert!(matches!(error, LimitKeeperError::UpkeepCheckFailed { .. }));

    ledger.configure(|s| s.call_error = Some(error_resp("execution reverted: stale order")));
    let error = failed(handler.process("job-2", &item, CancellationToken::new()).await);
    assert!(matches!(error, LimitKeeperError::UpkeepCheckFailed { .. }));

    assert_eq!(ledger.state().send_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn unknown_network_is_permanent() {
    let ledger = FakeLedger::default();
    let (handler, keeper) = keeper_handler(&ledger, optimized());
    let mut item = execute_item(keeper);
    item.target.network = "mainnet".to_string();

    let error = failed(handler.process("job-1", &item, CancellationToken::new()).await);
    assert!(matches!(error, LimitKeeperError::ChainServiceError { network, .. } if network == "mainnet"));
}

#[tokio::test(start_paused = true)]
async fn missing_signing_key_is_a_validation_error() {
    let ledger = FakeLedger::default();
    let (handler, _) = keeper_handler(&ledger, optimized());

    let error = failed(
        handler
            .process(
                "job-1",
                &execute_item(Address::repeat_byte(0x99)),
                CancellationToken::new(),
            )
            .await,
    );

    assert!(matches!(error, LimitKeeperError::ValidationError { .. }));
    assert_eq!(ledger.state().calls, 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_before_start_is_retryable() {
    let ledger = FakeLedger::default();
    let (handler, keeper) = keeper_handler(&ledger, optimized());
    let token = CancellationToken::new();
    token.cancel();

    let error = nacked(handler.process("job-1", &execute_item(keeper), token).await);

    assert!(matches!(error, LimitKeeperError::Cancelled { .. }));
    assert_eq!(ledger.state().calls, 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_while_waiting_releases_lease() {
    let ledger = FakeLedger::default();
    ledger.configure(|s| s.mine_on_send = None);
    let (handler, keeper) = keeper_handler(&ledger, optimized());
    let token = CancellationToken::new();

    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            token.cancel();
        })
    };

    let error = nacked(handler.process("job-1", &execute_item(keeper), token).await);
    canceller.await.unwrap();

    assert!(matches!(
        error,
        LimitKeeperError::Cancelled { transaction_hash: Some(_), .. }
    ));
    assert_eq!(ledger.state().send_attempts, 2);
    assert_eq!(
        handler
            .nonce_allocator
            .state(CHAIN_ID, keeper)
            .unwrap()
            .active_leases,
        0
    );
}

#[tokio::test(start_paused = true)]
async fn possibly_sent_broadcast_keeps_waiting() {
    let ledger = FakeLedger::default();
    ledger.configure(|s| {
        s.send_errors
            .push_back(error_resp("nonce too low: next nonce 11, tx nonce 10"))
    });
    let (handler, keeper) = keeper_handler(&ledger, optimized());

    let outcome = handler
        .process("job-1", &execute_item(keeper), CancellationToken::new())
        .await
        .unwrap();

    let sent = ledger.sent();
    assert!(matches!(
        outcome,
        KeeperOutcome::Included { transaction_hash, .. } if transaction_hash == sent[0].hash
    ));
}

#[tokio::test(start_paused = true)]
async fn simple_mode_possibly_sent_broadcast_is_waited_on() {
    let ledger = FakeLedger::default();
    ledger.configure(|s| {
        s.send_errors
            .push_back(error_resp("nonce too low: next nonce 11, tx nonce 10"))
    });
    let (handler, keeper) = keeper_handler(&ledger, simple());

    let outcome = handler
        .process("job-1", &execute_item(keeper), CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(outcome, KeeperOutcome::Included { attempts: 1, .. }));
    assert_eq!(ledger.state().send_attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn simple_mode_gives_up_on_unmined_duplicate() {
    let ledger = FakeLedger::default();
    ledger.configure(|s| {
        s.mine_on_send = None;
        s.send_errors
            .push_back(error_resp("nonce too low: next nonce 11, tx nonce 10"));
    });
    let (handler, keeper) = keeper_handler(&ledger, simple());

    let result = tokio::time::timeout(
        Duration::from_secs(24 * 60 * 60),
        handler.process("job-1", &execute_item(keeper), CancellationToken::new()),
    )
    .await
    .expect("simple mode must not wait forever on a rejected broadcast");
    let error = nacked(result);

    let sent = ledger.sent();
    assert!(matches!(
        error,
        LimitKeeperError::TransactionNotFound { transaction_hash, .. } if transaction_hash == sent[0].hash
    ));
    assert_eq!(ledger.state().send_attempts, 1);
    assert_eq!(ledger.state().receipt_queries, POSSIBLY_SENT_MAX_POLLS as usize);
    assert_eq!(
        handler
            .nonce_allocator
            .state(CHAIN_ID, keeper)
            .unwrap()
            .active_leases,
        0
    );
}

#[tokio::test(start_paused = true)]
async fn nonce_lease_failure_is_retryable() {
    let ledger = FakeLedger::default();
    ledger.configure(|s| s.nonce_error = Some(error_resp("header not found")));
    let (handler, keeper) = keeper_handler(&ledger, optimized());

    let error = nacked(
        handler
            .process("job-1", &execute_item(keeper), CancellationToken::new())
            .await,
    );

    assert!(matches!(
        error,
        LimitKeeperError::NonceLeaseFailed { keeper: failed_keeper, .. } if failed_keeper == keeper
    ));
    assert_eq!(ledger.state().nonce_queries, 1);
    assert_eq!(ledger.state().send_attempts, 0);
    assert_eq!(
        handler
            .nonce_allocator
            .state(CHAIN_ID, keeper)
            .unwrap()
            .active_leases,
        0
    );
}

#[tokio::test(start_paused = true)]
async fn rejected_broadcast_fails() {
    let ledger = FakeLedger::default();
    ledger.configure(|s| {
        s.mine_on_send = None;
        s.send_errors
            .push_back(error_resp("insufficient funds for gas * price + value"));
    });
    let (handler, keeper) = keeper_handler(&ledger, optimized());

    let error = failed(
        handler
            .process("job-1", &execute_item(keeper), CancellationToken::new())
            .await,
    );

    assert!(matches!(error, LimitKeeperError::TransactionSendError { attempt: 1, .. }));
    assert_eq!(ledger.state().receipt_queries, 0);
}

#[tokio::test(start_paused = true)]
async fn transport_failure_on_broadcast_is_retryable() {
    let ledger = FakeLedger::default();
    ledger.configure(|s| {
        s.mine_on_send = None;
        s.send_errors.push_back(transport_error());
    });
    let (handler, keeper) = keeper_handler(&ledger, simple());

    let error = nacked(
        handler
            .process("job-1", &execute_item(keeper), CancellationToken::new())
            .await,
    );

    assert!(matches!(error, LimitKeeperError::TransactionSendError { .. }));
}

#[tokio::test(start_paused = true)]
async fn reverted_transaction_is_permanent() {
    let ledger = FakeLedger::default();
    ledger.configure(|s| s.mined_status = false);
    let (handler, keeper) = keeper_handler(&ledger, optimized());

    let error = failed(
        handler
            .process("job-1", &execute_item(keeper), CancellationToken::new())
            .await,
    );

    assert!(matches!(
        error,
        LimitKeeperError::TransactionReverted { block_number: Some(100), .. }
    ));
}
