//! Estate shared crate
//!
//! Domain enums and database plumbing used by the api, billing and worker crates.

pub mod db;
pub mod types;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use types::{AccountRole, ParseEnumError, SubscriptionPlan, SubscriptionStatus};
