//! Read-only HTTP API over the storage projections
//!
//! Content handlers live elsewhere; this surface only reports usage and
//! defines how quota errors look on the wire.

pub mod error;
pub mod handlers;
pub mod server;

pub use error::ApiError;
pub use handlers::AppState;
pub use server::ApiServer;
