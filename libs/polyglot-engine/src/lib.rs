//! Polyglot execution engine
//!
//! Runs untrusted source code in one of several languages under a
//! wall-clock budget and reports a normalized [`ExecutionResult`].
//!
//! Layering, leaves first:
//! - [`backend`]: one strategy per language family (in-process JavaScript,
//!   interpreter subprocess, compile-then-run subprocess)
//! - [`coordinator`]: validation, rate limiting, dispatch, normalization
//! - [`ledger`]: bounded execution history plus aggregate counters
//!
//! [`ExecutionResult`]: polyglot_common::types::ExecutionResult

pub mod artifact;
pub mod backend;
pub mod coordinator;
pub mod error;
pub mod language_config;
pub mod ledger;
pub mod rate_limit;
pub mod sink;


pub use coordinator::{Coordinator, CoordinatorOptions, ExecutionStream};
pub use error::ExecuteError;
pub use language_config::LanguageConfigManager;
pub use ledger::Ledger;
pub use rate_limit::{ClientKey, RateLimiter};
