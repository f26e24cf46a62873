//! Avgate Processing Library
//!
//! This crate provides the per-request upload machinery: the hybrid
//! memory/disk spool buffer, content-type detection and validation, and
//! filename/extension checks.

pub mod buffer;
pub mod mime;
pub mod validator;

// Re-export commonly used types
pub use buffer::{BufferError, BufferMode, BufferReader, BufferStats, SpoolBuffer};
pub use mime::{sniff, validate_declared_type, Detection, DetectionMethod, MimeValidation};
pub use validator::{sanitize_filename, validate_extension, UploadValidationError};
