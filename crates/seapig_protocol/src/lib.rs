//! # Seapig Protocol
//!
//! Wire types for the Seapig shared-object synchronization protocol.
//!
//! This crate provides:
//! - `ClientMessage` / `ServerMessage` for the JSON frames exchanged with a coordinator
//! - `ObjectBody` for full snapshots and JSON-Patch diffs
//! - `MasterVersion` and `SlaveVersion`
//! - `Pattern` for wildcard subscription keys
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod messages;
mod pattern;
mod version;

pub use error::{ProtocolError, ProtocolResult};
pub use messages::{ClientMessage, ObjectBody, ObjectPatch, ObjectUpdate, ServerMessage};
pub use pattern::{Pattern, WILDCARD};
pub use version::{MasterVersion, SlaveVersion};

/// Re-exported so callers can build patches without naming the dependency.
pub use json_patch::{Patch, PatchOperation};
