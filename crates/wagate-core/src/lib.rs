//! # wagate-core
//!
//! Core types, message classification, configuration, error handling,
//! and the client capability trait for the wagate gateway.

pub mod classify;
pub mod clock;
pub mod config;
pub mod error;
pub mod message;
pub mod traits;

pub use config::shellexpand;
pub use error::GatewayError;
