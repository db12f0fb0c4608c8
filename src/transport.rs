// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport boundary.
//!
//! The engine never manages sockets. It asks a [`Transport`] for a live
//! [`Connection`] to an address and writes packets to it. Connection
//! establishment is the transport's business: a miss in
//! [`resolve_or_connect`](Transport::resolve_or_connect) starts a connect in
//! the background and returns `None`, and the retry channel comes back later.
//!
//! # Example
//!
//! ```rust
//! use node_engine::transport::{Connection, Transport};
//! use node_engine::{Address, Packet};
//! use std::sync::Arc;
//!
//! struct Loopback;
//!
//! impl Connection for Loopback {
//!     fn write(&self, _packet: Packet) -> bool { true }
//!     fn is_live(&self) -> bool { true }
//! }
//!
//! struct AlwaysConnected;
//!
//! impl Transport for AlwaysConnected {
//!     fn resolve_or_connect(&self, _address: &Address) -> Option<Arc<dyn Connection>> {
//!         Some(Arc::new(Loopback))
//!     }
//! }
//! ```

use crate::cluster::Address;
use crate::packet::Packet;
use std::sync::Arc;

/// A live bidirectional channel to one member.
pub trait Connection: Send + Sync {
    /// Queue a packet for writing. Returns whether the transport accepted it.
    fn write(&self, packet: Packet) -> bool;

    /// Whether the connection is still usable.
    fn is_live(&self) -> bool;
}

/// Resolves addresses to live connections.
pub trait Transport: Send + Sync + 'static {
    /// Return a live connection if one exists. Otherwise trigger a
    /// connection attempt (fire-and-forget) and return `None`.
    fn resolve_or_connect(&self, address: &Address) -> Option<Arc<dyn Connection>>;
}

/// A transport with no connections, for standalone engines.
///
/// Every lookup misses, so remote sends exhaust their retry budget and are
/// dropped. Local execution is unaffected.
#[derive(Debug, Clone, Default)]
pub struct NoOpTransport;

impl Transport for NoOpTransport {
    fn resolve_or_connect(&self, address: &Address) -> Option<Arc<dyn Connection>> {
        tracing::trace!(target_address = %address, "NoOp: no connection available");
        None
    }
}
