//! Command handlers module.
//!
//! - `migrate.rs`: legacy key migration with preview output
//! - `reap.rs`: one-shot or watched expiry sweeps

mod migrate;
mod reap;

pub use migrate::cmd_migrate;
pub use reap::cmd_reap;
