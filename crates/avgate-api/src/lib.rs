//! Avgate API Library
//!
//! This crate provides the HTTP ingress, the per-request orchestration
//! pipeline, and the application setup for the upload gate.

mod handlers;
mod services;
mod utils;

// Public modules
pub mod error;
pub mod setup;
pub mod state;
pub mod telemetry;

// Re-exports
pub use state::AppState;
