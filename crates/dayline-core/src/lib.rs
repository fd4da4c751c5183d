//! Error taxonomy, run configuration and service descriptors.

pub mod capabilities;
pub mod config;
pub mod error;

pub use capabilities::{Capability, ServiceDescriptor};
pub use config::RunConfig;
pub use error::{Error, Result};
