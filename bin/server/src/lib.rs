//! chatledger HTTP server.
//!
//! This crate wires the conversation engine to a SQLite checkpoint store
//! and an OpenAI-compatible completion backend, and exposes it over HTTP.

pub mod config;
pub mod db;
pub mod error;
pub mod routes;

pub use routes::{AppState, router};
