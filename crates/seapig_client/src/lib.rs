//! # Seapig Client
//!
//! Client engine for the Seapig shared-object synchronization protocol.
//!
//! This crate provides:
//! - Connection manager with heartbeat and reconnect (`Client`)
//! - Consumed objects kept current through versioned updates (`SlaveHandle`)
//! - Produced objects published as snapshots or JSON Patch diffs (`MasterHandle`)
//! - Wildcard containers that materialize children on demand
//! - A WebSocket transport and an async session driver
//!
//! ## Architecture
//!
//! `Client` is a state machine with no I/O of its own. A `Transport` reports
//! link events, the owner feeds them to `Client::handle` and drives timers
//! through `Client::poll`. `Session` does this inside one tokio task over
//! `WsTransport`.
//!
//! ## Key Invariants
//!
//! - A consumed object only advances through updates that build on its version
//! - A master diffs against the content it last uploaded, never across uploads
//! - Consumed objects are invalid while disconnected
//! - Events for a torn-down link are ignored
//! - Registrations reach the coordinator before any upload on a new link

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod error;
mod events;
mod link;
mod master;
mod registry;
mod session;
mod slave;
mod transport;
mod wildcard;
mod ws;

pub use client::{Client, DetachMode};
pub use config::{ClientConfig, ReconnectConfig};
pub use error::{SyncError, SyncResult};
pub use events::{ClientStatus, EventFeed, LinkError, LinkState, ObjectEvent, ObjectEventKind};
pub use master::{
    upload_plan, MasterBump, MasterHandle, MasterOptions, MasterSet, Producer, Publish,
};
pub use registry::{MasterEntry, SlaveEntry};
pub use session::Session;
pub use slave::{SlaveHandle, SlaveOptions};
pub use transport::{LinkEvent, LinkId, MockTransport, Transport, TransportEvent};
pub use wildcard::{WildcardMaster, WildcardSlave};
pub use ws::WsTransport;

pub use seapig_protocol::{
    ClientMessage, MasterVersion, ObjectBody, ObjectPatch, ObjectUpdate, Pattern, ServerMessage,
    SlaveVersion,
};
