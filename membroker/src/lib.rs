//! The allocation engine crate: client registry, request queue, solicitation
//! state machine, the fixpoint-driven broker, and the diagnostic dump format
//! built on top of them. Wire framing and types live in `membroker-proto`;
//! this crate only ever speaks decoded [`membroker_proto::Message`]s.
//!
//! `transport` (a separate module, gated behind the `transport` feature so
//! `membroker-client` and tests can depend on the engine without pulling in
//! `mio`) wires a [`engine::Broker`] to real Unix sockets.

pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod ids;
pub mod queue;
pub mod registry;
pub mod solicitation;

#[cfg(feature = "transport")]
pub mod transport;

pub use engine::{Broker, Outbound};
pub use error::BrokerError;
pub use ids::{ClientId, ConnId, RequestId};
pub use queue::{Request, RequestQueue};
pub use registry::{Client, Registry};
pub use solicitation::{RequestKind, Solicitation};
