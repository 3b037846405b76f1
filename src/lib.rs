//! Hybrid job conductor.
//!
//! A job is a directory holding a manifest and a `work_order.yaml`. The
//! [`dispatcher`] loads the manifest into a durable backlog, the
//! [`conductor`] drains that backlog into a local ("metal") worker queue and
//! a rate-limited cloud worker queue, and the [`collector`] records terminal
//! results as workers report them. The three only share the store and the
//! work-order file, so each can run as its own process.

pub mod collector;
pub mod conductor;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod execution_log;
pub mod manifest;
pub mod package;
pub mod rate_budget;
pub mod routing;
pub mod state_machine;
pub mod store;
pub mod ui;

pub use error::{ConductorError, Result};
