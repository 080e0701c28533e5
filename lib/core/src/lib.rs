//! Core domain types and utilities for chatledger.
//!
//! This crate provides the identifiers and error-handling foundation shared
//! by the conversation engine, the completion backends, and the server.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{ParseIdError, ThreadId, TurnId};
