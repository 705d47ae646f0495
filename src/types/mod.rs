//! Shared types for courier

pub mod error;

pub use error::{GatewayError, Result};
