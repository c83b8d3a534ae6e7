//! Shared domain types and process configuration for the polyglot
//! execution service. Both the API server and the CLI depend on this crate
//! so the wire format never drifts between them.

pub mod config;
pub mod types;
