use std::{env, path::PathBuf, time::Duration};

use config::{Config, File};
use keeper_core::{chain::ChainConfig, execution_options::ExecutionMode};
use keeper_executors::{
    limit_order::{SubmissionConfig, handler::DEFAULT_MAX_ESCALATIONS},
    receipt::ReceiptPollConfig,
};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct KeeperAppConfig {
    #[serde(default)]
    pub keeper: KeeperConfig,
    pub networks: Vec<NetworkConfig>,
    #[serde(default)]
    pub signer: SignerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeeperConfig {
    pub log_format: LogFormat,
    pub mode: ExecutionMode,
    pub max_escalations: u32,
    pub poll_interval_ms: u64,
    pub escalation_wait_ms: u64,
    /// Upper bound on a single attempt of a work item.
    pub job_timeout_ms: u64,
}

/// Matches the queue default of thirty minutes per task.
const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30 * 60);

impl Default for KeeperConfig {
    fn default() -> Self {
        let receipt = ReceiptPollConfig::default();
        Self {
            log_format: LogFormat::default(),
            mode: ExecutionMode::default(),
            max_escalations: DEFAULT_MAX_ESCALATIONS,
            poll_interval_ms: receipt.poll_interval.as_millis() as u64,
            escalation_wait_ms: receipt.escalation_wait.as_millis() as u64,
            job_timeout_ms: DEFAULT_JOB_TIMEOUT.as_millis() as u64,
        }
    }
}

impl KeeperConfig {
    pub fn submission(&self) -> SubmissionConfig {
        SubmissionConfig {
            mode: self.mode,
            max_escalations: self.max_escalations,
            receipt: ReceiptPollConfig {
                poll_interval: Duration::from_millis(self.poll_interval_ms),
                escalation_wait: Duration::from_millis(self.escalation_wait_ms),
            },
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url: String,
}

impl From<&NetworkConfig> for ChainConfig {
    fn from(network: &NetworkConfig) -> Self {
        ChainConfig {
            network: network.name.clone(),
            chain_id: network.chain_id,
            rpc_url: network.rpc_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SignerConfig {
    /// Hex private keys, one per keeper account.
    pub private_keys: Vec<String>,
    pub keystores: Vec<KeystoreConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeystoreConfig {
    pub path: PathBuf,
    pub password: String,
}

pub fn get_config() -> anyhow::Result<KeeperAppConfig> {
    let configuration_directory = env::current_dir()?.join("configuration");

    // Detect the running environment
    let environment: Environment = env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(anyhow::Error::msg)?;

    let environment_filename = format!("keeper_{}.yaml", environment.as_str());

    let config = Config::builder()
        .add_source(File::from(configuration_directory.join("keeper_base.yaml")))
        .add_source(File::from(configuration_directory.join(environment_filename)).required(false))
        .add_source(config::Environment::with_prefix("app").separator("__"))
        .build()?;

    config.try_deserialize::<KeeperAppConfig>().map_err(|e| {
        anyhow::anyhow!(
            "{e}. Make sure all required fields are set correctly in your configuration files or environment variables."
        )
    })
}

/// The possible runtime environment for our application.
pub enum Environment {
    Local,
    Development,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "development" => Ok(Self::Development),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{other} is not a supported environment. Use either `local`, `development`, or `production`."
            )),
        }
    }
}
