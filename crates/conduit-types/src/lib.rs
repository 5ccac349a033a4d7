//! Shared types and error hierarchy for Conduit.

pub mod error;
pub mod message;
pub mod provider;
pub mod sse;
mod util;

pub use error::{ApiError, ConduitError, ConfigError};
pub use message::*;
pub use util::truncate_str;
