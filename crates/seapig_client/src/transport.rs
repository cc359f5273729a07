//! Transport layer abstraction.
//!
//! The engine never touches sockets. A transport opens links, carries text
//! frames and reports what happened as [`LinkEvent`]s, which the owner feeds
//! back into [`Client::handle`](crate::Client::handle).

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use seapig_protocol::ClientMessage;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Identifies one connection attempt.
///
/// Every call to `connect` uses a fresh id, so events still in flight from a
/// torn-down link can be recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    /// The id of the first link a client opens.
    pub fn first() -> Self {
        LinkId(1)
    }

    /// Returns the id that follows this one.
    #[must_use]
    pub fn next(self) -> Self {
        LinkId(self.0 + 1)
    }

    /// Returns the raw counter.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Something that happened on a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The link is open and frames can flow.
    Opened,
    /// A text frame arrived.
    Frame(String),
    /// A ping or pong arrived.
    Keepalive,
    /// The link closed.
    Closed {
        /// Close reason.
        reason: String,
    },
    /// The link failed.
    Failed {
        /// Error description.
        error: String,
    },
}

/// A transport event tagged with the link it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    /// Link the event belongs to.
    pub link: LinkId,
    /// What happened.
    pub event: TransportEvent,
}

impl LinkEvent {
    /// Creates a new link event.
    pub fn new(link: LinkId, event: TransportEvent) -> Self {
        Self { link, event }
    }
}

/// A transport carries frames between the client and the coordinator.
///
/// Implementations must not block: `open` starts a connection attempt and
/// reports completion later through [`TransportEvent::Opened`] or
/// [`TransportEvent::Failed`].
pub trait Transport: Send + Sync {
    /// Starts opening a link.
    fn open(&self, link: LinkId) -> SyncResult<()>;

    /// Queues a text frame on a link.
    fn send(&self, link: LinkId, frame: String) -> SyncResult<()>;

    /// Closes a link with a close handshake.
    fn close(&self, link: LinkId);

    /// Drops a link without a close handshake.
    fn detach(&self, link: LinkId);
}

/// A transport that records everything for tests.
#[derive(Debug, Default)]
pub struct MockTransport {
    opened: Mutex<Vec<LinkId>>,
    sent: Mutex<Vec<(LinkId, String)>>,
    closed: Mutex<Vec<LinkId>>,
    detached: Mutex<Vec<LinkId>>,
    fail_open: AtomicBool,
    fail_send: AtomicBool,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent `open` calls fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent `send` calls fail.
    pub fn set_fail_send(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    /// Links opened so far.
    pub fn opened(&self) -> Vec<LinkId> {
        self.opened.lock().clone()
    }

    /// The most recently opened link.
    pub fn last_link(&self) -> Option<LinkId> {
        self.opened.lock().last().copied()
    }

    /// Links closed with a handshake.
    pub fn closed(&self) -> Vec<LinkId> {
        self.closed.lock().clone()
    }

    /// Links dropped without a handshake.
    pub fn detached(&self) -> Vec<LinkId> {
        self.detached.lock().clone()
    }

    /// Raw frames sent so far.
    pub fn sent_frames(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(_, frame)| frame.clone()).collect()
    }

    /// Drains sent frames, decoded.
    pub fn take_sent(&self) -> Vec<ClientMessage> {
        self.sent
            .lock()
            .drain(..)
            .filter_map(|(_, frame)| ClientMessage::decode(&frame).ok())
            .collect()
    }
}

impl Transport for MockTransport {
    fn open(&self, link: LinkId) -> SyncResult<()> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("mock open failure"));
        }
        self.opened.lock().push(link);
        Ok(())
    }

    fn send(&self, link: LinkId, frame: String) -> SyncResult<()> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("mock send failure"));
        }
        self.sent.lock().push((link, frame));
        Ok(())
    }

    fn close(&self, link: LinkId) {
        self.closed.lock().push(link);
    }

    fn detach(&self, link: LinkId) {
        self.detached.lock().push(link);
    }
}
