//! Utilities module
//!
//! Contains error handling, logging, hashing and tracing helpers

pub mod error;
pub mod hash;
pub mod logging;
pub mod tokens;
pub mod trace;
