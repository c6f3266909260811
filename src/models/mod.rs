//! Data models for the chunked upload service.
//!
//! `upload` is the server's tracking record, `chunk` holds the request and
//! response shapes of the HTTP endpoints, and `artifact` describes an
//! assembled file. All of them serialize as camelCase JSON via `serde`.

pub mod artifact;
pub mod chunk;
pub mod upload;
