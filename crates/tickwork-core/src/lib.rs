//! `tickwork-core`: configuration and identifiers shared by every tickwork crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::TickworkConfig;
pub use error::{CoreError, Result};
pub use types::{ExecutionId, JobId, NodeId};
