//! Resumable chunked media uploads.
//!
//! The server half (`services`, `handlers`, `routes`) receives chunks,
//! tracks them in a TTL-keyed metadata store and assembles each file exactly
//! once. The client half (`client`) splits files, sends chunks with bounded
//! retry and keeps per-group progress.

pub mod client;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
