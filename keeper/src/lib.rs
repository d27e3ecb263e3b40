pub mod config;
pub mod dispatch;

pub use config::{KeeperAppConfig, KeeperConfig, LogFormat, NetworkConfig, SignerConfig};
pub use dispatch::{JobRecord, parse_work_item, run_with_deadline, run_with_retries};
