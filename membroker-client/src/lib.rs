//! Synchronous client library for talking to `membrokerd`: a per-handle
//! connection type ([`ClientHandle`]) plus a process-wide default instance
//! ([`default`]) mirroring the original library's `mb_register`/
//! `mb_request_pages`/... shorthand.

pub mod client;
pub mod default;
pub mod error;

pub use client::ClientHandle;
pub use error::ClientError;
