//! Courier - outbound messaging-gateway connection manager
//!
//! Keeps one or more paired gateway sessions alive and delivers outbound
//! messages through them in order.
//!
//! ## Components
//!
//! - **Session store**: per-client credential directories on disk
//! - **Connection supervisor**: single in-flight connect, transport event
//!   handling, reconnect and hard-init retry scheduling
//! - **Readiness gate**: readiness flag, waiters, and timeout diagnostics
//! - **Fallback poller**: bounded periodic recovery when ready signals go missing
//! - **Send queue**: per-client FIFO delivery with rate-limit backoff
//! - **Gateway facade**: named clients, primary-client sends, admin notifications
//! - **Status server**: `/health` and `/health/wa` endpoints
//!
//! The vendor SDK sits behind the [`transport::Connector`] and
//! [`transport::TransportHandle`] traits.

pub mod config;
pub mod connection;
pub mod gateway;
pub mod server;
pub mod session;
pub mod transport;
pub mod types;

pub use config::{Args, GatewayConfig};
pub use gateway::{GatewayClient, GatewayFacade};
pub use types::{GatewayError, Result};
