//! Notifications for object and connection changes.
//!
//! Observers subscribe to a feed and receive every event emitted after they
//! subscribed. Dropping the receiver cancels the subscription.
//!
//! # Usage
//!
//! ```rust,ignore
//! let room = client.slave("room-1", SlaveOptions::new())?;
//! let events = room.subscribe();
//!
//! std::thread::spawn(move || {
//!     while let Ok(event) = events.recv() {
//!         println!("{} {:?}", event.id, event.kind);
//!     }
//! });
//! ```

use crate::transport::LinkId;
use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender};

/// What happened to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectEventKind {
    /// Content differs from what it was before the update.
    Changed,
    /// Version, validity or initialization may have changed.
    StatusChanged,
    /// The coordinator destroyed the object.
    Destroyed,
}

/// A notification about one concrete object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEvent {
    /// Concrete object id.
    pub id: String,
    /// Type of event.
    pub kind: ObjectEventKind,
}

impl ObjectEvent {
    /// Creates a new object event.
    pub fn new(id: impl Into<String>, kind: ObjectEventKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// Connection state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No link.
    Disconnected,
    /// A link is being opened.
    Connecting,
    /// Frames flow.
    Connected,
}

/// The last connection failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkError {
    /// `"connecting"` or `"connected"`.
    pub during: &'static str,
    /// Error description.
    pub error: String,
}

/// Snapshot published to status observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatus {
    /// Current connection state.
    pub state: LinkState,
    /// Link the state refers to.
    pub link: Option<LinkId>,
    /// Last failure, cleared once a link opens.
    pub error: Option<LinkError>,
}

impl ClientStatus {
    /// Returns true if frames can flow.
    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }
}

/// Distributes events to any number of subscribers.
pub struct EventFeed<E> {
    subscribers: RwLock<Vec<Sender<E>>>,
}

impl<E: Clone> EventFeed<E> {
    /// Creates a new feed.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribes to the feed.
    ///
    /// The receiver should be drained regularly to avoid unbounded memory growth.
    pub fn subscribe(&self) -> Receiver<E> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Emits an event to all subscribers, dropping disconnected ones.
    pub fn emit(&self, event: E) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Returns the number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl<E: Clone> Default for EventFeed<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventFeed<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFeed")
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}
