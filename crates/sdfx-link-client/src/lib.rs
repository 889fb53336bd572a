//! Realtime session client for SDFX / ComfyUI-style backends.
//!
//! A [`Session`] keeps one WebSocket open to the backend, recovers from
//! transient failures with a bounded number of fixed-delay reconnects, and
//! turns the mixed text/binary frame stream into typed [`Event`]s delivered
//! to subscribers. [`RestClient`] covers the request/response side.
//!
//! [`Event`]: sdfx_link_core::events::Event

pub mod dispatcher;
pub mod lifecycle;
pub mod progress;
pub mod rest;
pub mod session;
pub mod stats;
pub mod transport;

#[cfg(test)]
mod mock;

pub use dispatcher::{DispatchError, DispatchReport, Dispatcher, SubscriptionHandle};
pub use lifecycle::{ConnectionState, ReconnectPolicy};
pub use progress::{ProgressSnapshot, ProgressTracker};
pub use rest::{RestClient, RestError};
pub use session::{SendError, Session};
pub use stats::StatsSnapshot;
pub use transport::{Connector, Transport, TransportError, WsConnector};
