//! quota-rs: Storage quota accounting for world content
//!
//! Every stored game entity (characters, items, lineages, ...) counts against
//! its owner's storage allocation. This crate measures, enforces and reports
//! that usage.
//!
//! # Features
//!
//! - **Ledger**: one event-sourced ledger per user, mapping each entity key to
//!   its last known size and world
//! - **Enforcement**: quota checks before content commits, with optimistic
//!   concurrency and a bounded retry loop
//! - **Projections**: per-user summary and per-entity detail tables kept in
//!   step with ledger events, with catch-up and dead letters
//!
//! # Example
//!
//! ```no_run
//! use quota_rs::config::Config;
//! use quota_rs::ledger::{EntityKey, EntityMetadata};
//! use quota_rs::quota::OperationContext;
//! use quota_rs::services::QuotaServices;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let services = QuotaServices::connect(&config).await?;
//!
//!     let metadata = EntityMetadata::new("world-1", EntityKey::new("character", "c-1"), 2048);
//!     let ctx = OperationContext::new("user-1");
//!
//!     services
//!         .enforcer
//!         .execute(&ctx, &metadata, || async {
//!             // persist the character here
//!             Ok::<(), quota_rs::QuotaError>(())
//!         })
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration management
//! - [`error`]: Error types and handling
//! - [`ledger`]: The storage ledger aggregate
//! - [`event_store`]: Ledger event streams
//! - [`quota`]: Quota checks and commits
//! - [`projection`]: Summary and detail read tables
//! - [`sizeable`]: Byte size of storable content
//! - [`api`]: Read-only HTTP API

pub mod api;
pub mod config;
pub mod error;
pub mod event_store;
pub mod ledger;
pub mod logging;
pub mod projection;
pub mod quota;
pub mod services;
pub mod settings;
pub mod sizeable;

// Re-export commonly used types
pub use config::Config;
pub use error::{QuotaError, Result};
pub use quota::{OperationContext, QuotaEnforcer, Reservation};
pub use sizeable::{Sizeable, Storable};
