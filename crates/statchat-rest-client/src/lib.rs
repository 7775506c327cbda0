//! REST API client for the statchat backend
//!
//! This crate provides the HTTP implementation of the `ClientApi` trait.
//! It attaches the bearer token to every authenticated request and maps
//! response statuses onto the client-facing error taxonomy.

pub mod auth;
pub mod client;
pub mod error;

pub use auth::*;
pub use client::*;
pub use error::*;
