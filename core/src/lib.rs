pub mod chain;
pub mod error;
pub mod execution_options;
pub mod job;
pub mod order;
pub mod signer;
