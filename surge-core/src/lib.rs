mod config;
mod constants;
mod data;
mod error;
mod metrics;
mod stats;
mod threshold;

pub use config::*;
pub use constants::*;
pub use data::*;
pub use error::*;
pub use metrics::*;
pub use stats::*;
pub use threshold::*;

pub use url::Url;
