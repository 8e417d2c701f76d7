//! Simperium API - wire model and diff algorithms
//!
//! This crate provides:
//! - JSON diff, patch and transform (`jsondiff`)
//! - diff-match-patch string deltas (`jsondiff::text`)
//! - Websocket command framing (`protocol`)
//! - Ghosts, remote changes and index documents (`model`)
//! - Bucket and object name validation

pub mod error;
pub mod jsondiff;
pub mod model;
pub mod protocol;
pub mod validation;

// Re-export commonly used types
pub use error::{ProtocolError, Result};
pub use jsondiff::{DiffError, JsonDiff};
pub use model::*;
pub use validation::*;
