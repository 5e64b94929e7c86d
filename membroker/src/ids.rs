//! Identifier newtypes used as back-references instead of owning pointers.
//!
//! Requests and Clients refer to each other only by id; the registry and
//! the request queue are the sole owners of the underlying records.

/// A client-chosen identifier, unique among currently-connected clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub i32);

/// A broker-assigned identifier for a queued request, monotonically
/// increasing within the lifetime of one broker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// An opaque per-connection identifier assigned by the transport layer
/// (typically the raw file descriptor). The engine never interprets this
/// beyond routing outbound sends and resolving disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub i32);
