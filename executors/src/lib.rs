pub mod context;
pub mod fee_escalator;
pub mod limit_order;
pub mod metrics;
pub mod nonce_allocator;
pub mod receipt;
pub mod upkeep;
