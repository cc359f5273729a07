//! Shared outbound path.
//!
//! Object handles publish through an [`Uplink`] rather than through the
//! client, so a producer can call `set`/`bump` from a callback. Frames are
//! only handed to the transport while a link is connected; anything sent
//! while disconnected is dropped, since the coordinator asks for a fresh
//! value through `object-produce` after producers re-register.

use crate::error::SyncResult;
use crate::transport::{LinkId, Transport};
use parking_lot::Mutex;
use seapig_protocol::ClientMessage;
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

/// Cloneable handle to the client's outbound path.
#[derive(Clone)]
pub(crate) struct Uplink {
    inner: Arc<UplinkInner>,
}

struct UplinkInner {
    transport: Arc<dyn Transport>,
    connected: Mutex<Option<LinkId>>,
    last_communication: Mutex<Instant>,
    debug: bool,
}

impl Uplink {
    pub(crate) fn new(transport: Arc<dyn Transport>, debug: bool) -> Self {
        Self {
            inner: Arc::new(UplinkInner {
                transport,
                connected: Mutex::new(None),
                last_communication: Mutex::new(Instant::now()),
                debug,
            }),
        }
    }

    /// Writes `handshake` on `link`, then marks it as the connected link.
    ///
    /// The link lock is held throughout: a handle publishing concurrently
    /// either finds no link and drops its frame, or writes after the
    /// handshake.
    pub(crate) fn attach(&self, link: LinkId, handshake: &[ClientMessage]) -> SyncResult<()> {
        let mut connected = self.inner.connected.lock();
        for message in handshake {
            self.write(link, message)?;
        }
        *connected = Some(link);
        Ok(())
    }

    /// Marks the uplink as disconnected.
    pub(crate) fn release(&self) {
        *self.inner.connected.lock() = None;
    }

    /// Records traffic on the link.
    pub(crate) fn touch(&self) {
        *self.inner.last_communication.lock() = Instant::now();
    }

    pub(crate) fn last_communication(&self) -> Instant {
        *self.inner.last_communication.lock()
    }

    /// Sends a message if connected.
    ///
    /// Returns `Ok(false)` when the message was dropped because no link is
    /// connected.
    pub(crate) fn send(&self, message: &ClientMessage) -> SyncResult<bool> {
        let connected = self.inner.connected.lock();
        let Some(link) = *connected else {
            trace!(
                action = message.action(),
                "dropping message while disconnected"
            );
            return Ok(false);
        };
        self.write(link, message)?;
        Ok(true)
    }

    fn write(&self, link: LinkId, message: &ClientMessage) -> SyncResult<()> {
        let frame = message.encode()?;
        if self.inner.debug {
            trace!(%link, %frame, "sending frame");
        }
        self.inner.transport.send(link, frame)?;
        self.touch();
        Ok(())
    }
}

impl std::fmt::Debug for Uplink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uplink")
            .field("connected", &*self.inner.connected.lock())
            .finish()
    }
}
