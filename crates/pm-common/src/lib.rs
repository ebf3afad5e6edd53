//! Shared building blocks for the PrintMaster server and agent:
//! configuration loading, the application error type, and version ordering.

pub mod config;
pub mod error;
pub mod version;

pub use config::{AgentConfig, AppConfig};
pub use error::{AppError, AppResult};
