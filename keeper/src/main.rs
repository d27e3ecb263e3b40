use std::sync::Arc;

use keeper_core::{
    chain::{ChainConfig, ChainRegistry},
    signer::LocalKeystoreSigner,
};
use keeper_executors::{
    context::KeeperContext,
    limit_order::LimitOrderHandler,
    metrics::{KeeperMetrics, export_metrics, initialize_metrics},
};
use limit_keeper::{JobRecord, config, parse_work_item, run_with_deadline, run_with_retries};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::get_config()?;

    let subscriber = tracing_subscriber::registry().with(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to debug for our own crates if RUST_LOG is not set
            "limit_keeper=debug,keeper_executors=debug,keeper_core=debug".into()
        }),
    );

    match config.keeper.log_format {
        config::LogFormat::Json => subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        config::LogFormat::Pretty => subscriber.with(tracing_subscriber::fmt::layer()).init(),
    }

    let networks: Vec<ChainConfig> = config.networks.iter().map(ChainConfig::from).collect();
    let chains = ChainRegistry::from_configs(&networks)?;
    tracing::info!(networks = ?chains.networks().collect::<Vec<_>>(), "Chain registry initialized");

    let mut signer = LocalKeystoreSigner::new();
    for private_key in &config.signer.private_keys {
        let keeper = signer.add_private_key(private_key)?;
        tracing::info!(keeper = ?keeper, "Loaded keeper key");
    }
    for keystore in &config.signer.keystores {
        let keeper = signer.add_keystore(&keystore.path, &keystore.password)?;
        tracing::info!(keeper = ?keeper, path = %keystore.path.display(), "Loaded keeper keystore");
    }
    if signer.addresses().next().is_none() {
        tracing::warn!("No keeper keys configured, every work item will be rejected");
    }

    let metrics_registry = Arc::new(prometheus::Registry::new());
    initialize_metrics(KeeperMetrics::new(&metrics_registry)?);
    tracing::info!("Keeper metrics initialized");

    let submission = config.keeper.submission();
    let job_timeout = config.keeper.job_timeout();
    tracing::info!(
        mode = %submission.mode,
        max_escalations = submission.max_escalations,
        ?job_timeout,
        "Keeper configured"
    );
    let handler = Arc::new(LimitOrderHandler::new(
        KeeperContext::new(chains, signer),
        submission,
    ));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Shutdown signal received, cancelling in-flight work");
                    shutdown.cancel();
                }
                Err(e) => tracing::warn!("Failed to listen for Ctrl+C: {}", e),
            }
        });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tasks = Vec::new();

    tracing::info!("Reading work items from stdin");
    loop {
        let line = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            tracing::info!("Input closed, waiting for in-flight work items");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        let data = match parse_work_item(&line) {
            Ok(data) => data,
            Err(error) => {
                tracing::warn!(job_id, error = %error, "Rejected work item");
                emit(JobRecord::new(job_id, None, Err(error)));
                continue;
            }
        };

        let handler = handler.clone();
        let cancellation = shutdown.child_token();
        tasks.push(tokio::spawn(async move {
            let result = run_with_retries(data.max_retries(), &cancellation, |_| {
                run_with_deadline(job_timeout, &cancellation, |deadline| {
                    handler.process(&job_id, &data, deadline)
                })
            })
            .await;
            emit(JobRecord::new(job_id, Some(data.action), result));
        }));
    }

    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            tracing::error!("Work item task panicked: {}", e);
        }
    }

    match export_metrics(&metrics_registry) {
        Ok(metrics) => tracing::debug!(%metrics, "Final keeper metrics"),
        Err(e) => tracing::warn!("Failed to export metrics: {}", e),
    }
    tracing::info!("Keeper stopped");

    Ok(())
}

fn emit(record: JobRecord) {
    match serde_json::to_string(&record) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::error!(job_id = %record.job_id, "Failed to serialize job record: {}", e),
    }
}
