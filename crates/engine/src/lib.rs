//! The alert engine: trigger, configurator and their shared state.
//!
//! Three cooperative actors drive the engine:
//! - **trigger-stream** consumes metrics and ticks the evaluator
//! - **trigger-mailbox** serves the rule management request/reply surface
//! - **configurator** watches the asset inventory feed and instantiates
//!   per-asset rules from templates
//!
//! They share the rule store, the metric table, the alert table and the
//! emission queue, each behind its own mutex.

pub mod alert;
pub mod configurator;
pub mod mailbox;
pub mod runtime;
pub mod trigger;

pub use alert::{Alert, AlertState};
pub use trigger::{EngineState, Trigger};
