//! Core types for sdfx-link: wire protocol, frame codec, event taxonomy,
//! client identity, configuration, and errors.
//!
//! Nothing in this crate performs I/O on the network; the runtime lives in
//! `sdfx-link-client`.

pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod protocol;
pub mod report;
