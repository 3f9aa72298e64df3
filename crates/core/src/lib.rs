//! Shared foundation for the vigil alert engine.
//!
//! This crate provides:
//! - The engine-wide error type with user-visible result codes
//! - Configuration loading (rule/template directories, tick timeout, logging)
//! - The asset database with its layered Basic/Extended/Full views
//! - The metric last-value table with TTL-driven expiry

pub mod asset;
pub mod config;
pub mod error;
pub mod metrics;

pub use error::EngineError;
