//! statchat REST API contract types and validation
//!
//! This crate defines the schema types exchanged with the statistics
//! dashboard backend. They are shared between the REST client, the mock
//! client, and the state-management core.

pub mod types;

pub use types::*;
