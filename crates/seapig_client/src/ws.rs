//! WebSocket transport.
//!
//! Each link runs in its own tokio task that connects, then multiplexes the
//! socket's read half with an outgoing frame queue. Everything the task
//! observes is reported on the event channel returned by [`WsTransport::new`].

use crate::error::{SyncError, SyncResult};
use crate::transport::{LinkEvent, LinkId, Transport, TransportEvent};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};

struct LinkTask {
    outgoing: UnboundedSender<Message>,
    task: JoinHandle<()>,
}

/// [`Transport`] over `tokio-tungstenite`.
///
/// Must be used from within a tokio runtime.
pub struct WsTransport {
    url: String,
    events: UnboundedSender<LinkEvent>,
    links: Mutex<HashMap<LinkId, LinkTask>>,
}

impl WsTransport {
    /// Creates a transport for `url` and the receiver its events arrive on.
    pub fn new(url: impl Into<String>) -> (Self, UnboundedReceiver<LinkEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Self {
            url: url.into(),
            events,
            links: Mutex::new(HashMap::new()),
        };
        (transport, rx)
    }

    /// Coordinator URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Number of links whose task is still running.
    pub fn active_links(&self) -> usize {
        self.links
            .lock()
            .values()
            .filter(|link| !link.task.is_finished())
            .count()
    }
}

impl Transport for WsTransport {
    fn open(&self, link: LinkId) -> SyncResult<()> {
        let runtime =
            Handle::try_current().map_err(|e| SyncError::transport_fatal(e.to_string()))?;
        let (outgoing, queue) = mpsc::unbounded_channel();
        let task = runtime.spawn(run_link(
            self.url.clone(),
            link,
            queue,
            self.events.clone(),
        ));

        let mut links = self.links.lock();
        links.retain(|_, existing| !existing.task.is_finished());
        links.insert(link, LinkTask { outgoing, task });
        Ok(())
    }

    fn send(&self, link: LinkId, frame: String) -> SyncResult<()> {
        let links = self.links.lock();
        let entry = links.get(&link).ok_or(SyncError::NotConnected)?;
        entry
            .outgoing
            .send(Message::text(frame))
            .map_err(|_| SyncError::transport_retryable(format!("{link} writer has stopped")))
    }

    fn close(&self, link: LinkId) {
        if let Some(entry) = self.links.lock().remove(&link) {
            if entry.outgoing.send(Message::Close(None)).is_err() {
                entry.task.abort();
            }
        }
    }

    fn detach(&self, link: LinkId) {
        if let Some(entry) = self.links.lock().remove(&link) {
            entry.task.abort();
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        for (_, entry) in self.links.lock().drain() {
            entry.task.abort();
        }
    }
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("url", &self.url)
            .field("links", &self.links.lock().len())
            .finish()
    }
}

fn emit(events: &UnboundedSender<LinkEvent>, link: LinkId, event: TransportEvent) {
    // The receiver is gone once the owning session has stopped.
    let _ = events.send(LinkEvent::new(link, event));
}

async fn run_link(
    url: String,
    link: LinkId,
    mut queue: UnboundedReceiver<Message>,
    events: UnboundedSender<LinkEvent>,
) {
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(error) => {
            emit(&events, link, TransportEvent::Failed {
                error: error.to_string(),
            });
            return;
        }
    };
    debug!(%link, %url, "websocket open");
    emit(&events, link, TransportEvent::Opened);

    let (mut writer, mut reader) = stream.split();
    loop {
        tokio::select! {
            incoming = reader.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    emit(&events, link, TransportEvent::Frame(text.as_str().to_owned()));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    emit(&events, link, TransportEvent::Keepalive);
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|frame| format!("{} {}", frame.code, frame.reason.as_str()))
                        .unwrap_or_else(|| "closed by peer".to_owned());
                    emit(&events, link, TransportEvent::Closed { reason });
                    return;
                }
                Some(Ok(other)) => {
                    trace!(%link, len = other.len(), "ignoring non-text frame");
                }
                Some(Err(error)) => {
                    emit(&events, link, TransportEvent::Failed {
                        error: error.to_string(),
                    });
                    return;
                }
                None => {
                    emit(&events, link, TransportEvent::Closed {
                        reason: "stream ended".to_owned(),
                    });
                    return;
                }
            },
            outgoing = queue.recv() => {
                let Some(message) = outgoing else {
                    return;
                };
                let closing = message.is_close();
                if let Err(error) = writer.send(message).await {
                    emit(&events, link, TransportEvent::Failed {
                        error: error.to_string(),
                    });
                    return;
                }
                if closing {
                    debug!(%link, "websocket closed locally");
                    return;
                }
            }
        }
    }
}
