//! Command-line runner for surge test plans.
pub mod runtime;

mod error;
mod server;

pub use crate::error::RuntimeError;
pub use crate::runtime::SurgeRuntime;
pub use crate::server::router;
