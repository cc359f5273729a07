//! Connection manager.
//!
//! [`Client`] owns the registry and drives one link at a time through
//! `Disconnected -> Connecting -> Connected`. It performs no I/O of its own:
//! the owner feeds transport events into [`Client::handle`] and calls
//! [`Client::poll`] when [`Client::next_deadline`] passes.
//!
//! Every link carries a [`LinkId`]. Events for any link other than the
//! current one are ignored, which makes teardown from inside a close handler
//! safe: the old link's late events simply no longer apply.

use crate::config::ClientConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{ClientStatus, EventFeed, LinkError, LinkState};
use crate::link::Uplink;
use crate::master::{MasterHandle, MasterOptions, Publish};
use crate::registry::{MasterEntry, Registry, SlaveEntry};
use crate::slave::{SlaveHandle, SlaveOptions};
use crate::transport::{LinkEvent, LinkId, Transport, TransportEvent};
use crate::wildcard::{WildcardMaster, WildcardSlave};
use seapig_protocol::{ClientMessage, ProtocolError, ServerMessage};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// How [`Client::disconnect`] releases the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetachMode {
    /// Close with a handshake.
    #[default]
    Close,
    /// Drop the stream without a handshake.
    Detach,
}

impl DetachMode {
    fn reason(self) -> &'static str {
        match self {
            DetachMode::Close => "close",
            DetachMode::Detach => "detach",
        }
    }
}

/// The synchronization engine.
pub struct Client<T: Transport + 'static> {
    config: ClientConfig,
    transport: Arc<T>,
    uplink: Uplink,
    registry: Registry,
    state: LinkState,
    link: Option<LinkId>,
    next_link: LinkId,
    last_error: Option<LinkError>,
    reconnect_on_close: bool,
    reconnect_at: Option<Instant>,
    heartbeat_at: Option<Instant>,
    attempts: u32,
    status: EventFeed<ClientStatus>,
}

impl<T: Transport + 'static> Client<T> {
    /// Creates a disconnected client.
    pub fn new(config: ClientConfig, transport: T) -> Self {
        let transport = Arc::new(transport);
        let uplink = Uplink::new(transport.clone(), config.debug);
        Self {
            config,
            transport,
            uplink,
            registry: Registry::new(),
            state: LinkState::Disconnected,
            link: None,
            next_link: LinkId::first(),
            last_error: None,
            reconnect_on_close: true,
            reconnect_at: None,
            heartbeat_at: None,
            attempts: 0,
            status: EventFeed::new(),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Opens a new link, tearing down the current one first.
    ///
    /// A retryable failure to start the link runs the normal failure path
    /// and schedules a reconnect; only non-retryable failures are returned.
    pub fn connect(&mut self) -> SyncResult<LinkId> {
        if self.link.is_some() {
            self.reconnect_on_close = false;
            self.release(DetachMode::Close);
        }
        self.reconnect_on_close = true;
        self.reconnect_at = None;

        let now = Instant::now();
        self.heartbeat_at = Some(now + self.config.heartbeat_interval);
        self.uplink.touch();

        let link = self.next_link;
        self.next_link = link.next();
        self.link = Some(link);
        self.state = LinkState::Connecting;
        info!(%link, url = %self.config.url, "connecting to coordinator");
        self.notify_status();

        if let Err(error) = self.transport.open(link) {
            if !error.is_retryable() {
                self.last_error = Some(LinkError {
                    during: "connecting",
                    error: error.to_string(),
                });
                self.reconnect_on_close = false;
                self.close_path("open failed");
                return Err(error);
            }
            self.fail(link, error.to_string());
        }
        Ok(link)
    }

    /// Tears the link down and stops reconnecting. Idempotent.
    pub fn disconnect(&mut self, mode: DetachMode) {
        self.reconnect_on_close = false;
        self.heartbeat_at = None;
        self.reconnect_at = None;
        if self.link.is_some() {
            self.release(mode);
        }
    }

    /// Releases the underlying stream without a close handshake.
    pub fn detach(&mut self) {
        self.disconnect(DetachMode::Detach);
    }

    /// Processes one transport event.
    ///
    /// Connection faults fail the link and schedule a reconnect. Returned
    /// errors mean local state can no longer be trusted.
    pub fn handle(&mut self, event: LinkEvent) -> SyncResult<()> {
        if self.link != Some(event.link) {
            trace!(link = %event.link, "ignoring event for stale link");
            return Ok(());
        }
        match event.event {
            TransportEvent::Opened => self.on_open(event.link),
            TransportEvent::Frame(frame) => self.on_frame(event.link, &frame),
            TransportEvent::Keepalive => {
                self.uplink.touch();
                Ok(())
            }
            TransportEvent::Closed { reason } => {
                let error = SyncError::TransportClosed { reason };
                self.last_error = Some(LinkError {
                    during: self.during(),
                    error: error.to_string(),
                });
                self.close_path(&error.to_string());
                Ok(())
            }
            TransportEvent::Failed { error } => {
                self.fail(event.link, error);
                Ok(())
            }
        }
    }

    /// Fires due timers.
    pub fn poll(&mut self, now: Instant) -> SyncResult<()> {
        if self.reconnect_at.is_some_and(|at| now >= at) {
            self.reconnect_at = None;
            info!(attempt = self.attempts, "reconnecting");
            self.connect()?;
        }

        if self.heartbeat_at.is_some_and(|at| now >= at) {
            self.heartbeat_at = Some(now + self.config.heartbeat_interval);
            if self.link.is_some() {
                let elapsed = now.saturating_duration_since(self.uplink.last_communication());
                if elapsed > self.config.heartbeat_timeout {
                    let error = SyncError::HeartbeatTimeout { elapsed };
                    warn!(%error, "forcing reconnect");
                    self.last_error = Some(LinkError {
                        during: self.during(),
                        error: error.to_string(),
                    });
                    self.connect()?;
                }
            }
        }
        Ok(())
    }

    /// When [`poll`](Self::poll) next has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.reconnect_at, self.heartbeat_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Subscribes to connection status changes.
    pub fn on_status_change(&self) -> Receiver<ClientStatus> {
        self.status.subscribe()
    }

    /// Current connection status.
    pub fn status(&self) -> ClientStatus {
        ClientStatus {
            state: self.state,
            link: self.link,
            error: self.last_error.clone(),
        }
    }

    /// Returns true if frames can flow.
    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// The last link failure, cleared when a link opens.
    pub fn last_error(&self) -> Option<&LinkError> {
        self.last_error.as_ref()
    }

    /// Subscribes to an object or wildcard pattern.
    ///
    /// `object` and `version` in `options` must be given together.
    pub fn slave(&mut self, id: &str, options: SlaveOptions) -> SyncResult<SlaveEntry> {
        let entry = self.registry.slave(id, options)?;
        debug!(
            pattern = id,
            version = entry.version(),
            "registered consumer"
        );
        self.send(&ClientMessage::ObjectConsumerRegister {
            pattern: id.to_owned(),
            version_known: entry.version(),
        })?;
        Ok(entry)
    }

    /// Registers an object or wildcard pattern this client produces.
    pub fn master(&mut self, id: &str, options: MasterOptions) -> SyncResult<MasterEntry> {
        let entry = self.registry.master(id, options, &self.uplink)?;
        debug!(pattern = id, version = %entry.version(), "registered producer");
        self.send(&ClientMessage::ObjectProducerRegister {
            pattern: id.to_owned(),
            version_known: entry.version(),
        })?;
        Ok(entry)
    }

    /// Drops every registration for `id`.
    pub fn unlink(&mut self, id: &str) -> SyncResult<()> {
        let (slave, master) = self.registry.unlink(id);
        if slave.is_none() && master.is_none() {
            debug!(pattern = id, "nothing registered to unlink");
            return Ok(());
        }
        if slave.is_some() {
            self.send(&ClientMessage::ObjectConsumerUnregister {
                pattern: id.to_owned(),
            })?;
        }
        if master.is_some() {
            self.send(&ClientMessage::ObjectProducerUnregister {
                pattern: id.to_owned(),
            })?;
        }
        debug!(pattern = id, "unlinked");
        Ok(())
    }

    /// Applies a `set` or `bump` to the object produced under `id`.
    ///
    /// Wildcard producers materialize the child for `id`. A broken writer
    /// fails the link like any other send.
    pub fn publish(&mut self, id: &str, publish: Publish) -> SyncResult<()> {
        let master = self
            .registry
            .publisher(id)
            .ok_or_else(|| SyncError::UnknownProducer(id.to_owned()))?;
        match (master.apply(publish), self.link) {
            (Err(error), Some(link)) => self.recover(link, error),
            (result, _) => result,
        }
    }

    /// The plain consumer registered under `id`.
    pub fn slave_handle(&self, id: &str) -> Option<SlaveHandle> {
        self.registry
            .slave_entry(id)
            .and_then(SlaveEntry::as_plain)
            .cloned()
    }

    /// The plain producer registered under `id`.
    pub fn master_handle(&self, id: &str) -> Option<MasterHandle> {
        self.registry
            .master_entry(id)
            .and_then(MasterEntry::as_plain)
            .cloned()
    }

    /// The wildcard consumer registered under `pattern`.
    pub fn wildcard_slave(&self, pattern: &str) -> Option<WildcardSlave> {
        self.registry
            .slave_entry(pattern)
            .and_then(SlaveEntry::as_wildcard)
            .cloned()
    }

    /// The wildcard producer registered under `pattern`.
    pub fn wildcard_master(&self, pattern: &str) -> Option<WildcardMaster> {
        self.registry
            .master_entry(pattern)
            .and_then(MasterEntry::as_wildcard)
            .cloned()
    }

    fn on_open(&mut self, link: LinkId) -> SyncResult<()> {
        let mut handshake = vec![ClientMessage::ClientOptionsSet {
            options: self.config.wire_options(),
        }];
        for (pattern, entry) in self.registry.slaves() {
            handshake.push(ClientMessage::ObjectConsumerRegister {
                pattern: pattern.to_string(),
                version_known: entry.version(),
            });
        }
        for (pattern, entry) in self.registry.masters() {
            handshake.push(ClientMessage::ObjectProducerRegister {
                pattern: pattern.to_string(),
                version_known: entry.version(),
            });
        }
        if let Err(error) = self.uplink.attach(link, &handshake) {
            return self.recover(link, error);
        }

        info!(%link, registrations = handshake.len() - 1, "connected to coordinator");
        self.state = LinkState::Connected;
        self.last_error = None;
        self.attempts = 0;
        for (_, entry) in self.registry.slaves() {
            entry.validate();
        }
        self.notify_status();
        Ok(())
    }

    fn on_frame(&mut self, link: LinkId, frame: &str) -> SyncResult<()> {
        if self.config.debug {
            trace!(%frame, "received frame");
        }
        let message = ServerMessage::decode(frame).map_err(|error| match error {
            ProtocolError::UnsupportedAction(action) => SyncError::UnsupportedMessage(action),
            other => SyncError::Protocol(other),
        })?;

        match message {
            ServerMessage::ObjectUpdate(update) => {
                if self.registry.update(&update)? == 0 {
                    debug!(id = %update.id, "update for an object nobody consumes");
                }
            }
            ServerMessage::ObjectDestroy { id } => {
                let matched = self.registry.destroy(&id);
                debug!(%id, matched, "object destroyed");
            }
            ServerMessage::ObjectProduce {
                id,
                version_inferred,
            } => {
                match self.registry.produce(&id, version_inferred.as_ref()) {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(%id, "coordinator requested an object this client does not produce");
                    }
                    Err(error) => return self.recover(link, error),
                }
            }
        }
        self.uplink.touch();
        Ok(())
    }

    /// Sends a message, treating a retryable transport error as a link failure.
    fn send(&mut self, message: &ClientMessage) -> SyncResult<()> {
        match (self.uplink.send(message), self.link) {
            (Err(error), Some(link)) => self.recover(link, error),
            (result, _) => result.map(|_| ()),
        }
    }

    /// Fails the link on a retryable error and returns anything else.
    fn recover(&mut self, link: LinkId, error: SyncError) -> SyncResult<()> {
        if error.is_retryable() {
            self.fail(link, error.to_string());
            Ok(())
        } else {
            Err(error)
        }
    }

    fn during(&self) -> &'static str {
        match self.state {
            LinkState::Connected => "connected",
            _ => "connecting",
        }
    }

    fn fail(&mut self, link: LinkId, error: String) {
        warn!(%link, %error, during = self.during(), "link failed");
        self.last_error = Some(LinkError {
            during: self.during(),
            error: error.clone(),
        });
        self.transport.detach(link);
        self.close_path(&error);
    }

    fn release(&mut self, mode: DetachMode) {
        if let Some(link) = self.link {
            match mode {
                DetachMode::Close => self.transport.close(link),
                DetachMode::Detach => self.transport.detach(link),
            }
        }
        self.close_path(mode.reason());
    }

    fn close_path(&mut self, reason: &str) {
        let link = self.link.take();
        self.uplink.release();
        self.state = LinkState::Disconnected;
        self.heartbeat_at = None;
        self.reconnect_at = None;

        for (_, entry) in self.registry.slaves() {
            entry.invalidate();
        }
        for (_, entry) in self.registry.masters() {
            entry.desync();
        }
        info!(link = ?link, reason, "link closed");
        self.notify_status();

        if self.reconnect_on_close {
            let delay = self.config.reconnect.delay_for_attempt(self.attempts);
            self.attempts = self.attempts.saturating_add(1);
            self.reconnect_at = Some(Instant::now() + delay);
            debug!(?delay, "reconnect scheduled");
        }
    }

    fn notify_status(&self) {
        self.status.emit(self.status());
    }
}

impl<T: Transport + 'static> std::fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.config.url)
            .field("state", &self.state)
            .field("link", &self.link)
            .field("registry", &self.registry)
            .finish()
    }
}
