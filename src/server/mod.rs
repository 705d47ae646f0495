//! HTTP status server

pub mod status;

pub use status::{run, StatusState};
