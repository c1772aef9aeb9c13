//! buildq core
//!
//! Domain types, wire messages, and collaborator ports shared by the
//! scheduler engine, the service layer, and the command-line tools.
//! This crate has no async runtime dependency.

pub mod error;
pub mod ids;
pub mod logstash;
pub mod platform;
pub mod ports;
pub mod protocol;

pub use error::{Error, Result};
pub use ids::*;
pub use platform::{Platform, Property};
