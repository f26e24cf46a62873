//! Avgate Core Library
//!
//! This crate provides the configuration, error taxonomy, and circuit
//! breaker shared across all avgate components.

pub mod breaker;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use config::{GateConfig, LimitsExceededBehaviour};
pub use error::{ErrorMetadata, GateError, LogLevel};
