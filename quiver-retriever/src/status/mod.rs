//! Status and diagnostics for a running engine
//!
//! Every report is `serde::Serialize` so the CLI can print it as JSON.

pub mod api;
pub mod types;

#[cfg(test)]
mod tests;

pub use api::StatusApi;
pub use types::*;
