//! Async session driver.
//!
//! A [`Session`] runs a [`Client`] over a [`WsTransport`] inside a single
//! tokio task. Registry and connection state never leave that task; callers
//! talk to it through a command queue and get answers on oneshot channels.
//! Publishing through [`Session::set`] and [`Session::bump`] runs on that
//! task too. Object handles returned from the session are internally
//! synchronized; publishing straight through a handle is also ordered after
//! the registration handshake of the current link.
//!
//! # Usage
//!
//! ```rust,ignore
//! let session = Session::spawn(ClientConfig::new("ws://127.0.0.1:3001"))?;
//! let room = session.slave("room-1", SlaveOptions::new()).await?;
//! let stats = session.master("stats", MasterOptions::new()).await?;
//! session.set("stats", MasterSet::object(json!({"users": 1}))).await?;
//! session.disconnect(DetachMode::Close).await?;
//! ```

use crate::client::{Client, DetachMode};
use crate::config::ClientConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::ClientStatus;
use crate::master::{MasterBump, MasterOptions, MasterSet, Publish};
use crate::registry::{MasterEntry, SlaveEntry};
use crate::slave::SlaveOptions;
use crate::transport::LinkEvent;
use crate::ws::WsTransport;
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

enum Command {
    Slave {
        id: String,
        options: SlaveOptions,
        reply: oneshot::Sender<SyncResult<SlaveEntry>>,
    },
    Master {
        id: String,
        options: MasterOptions,
        reply: oneshot::Sender<SyncResult<MasterEntry>>,
    },
    Unlink {
        id: String,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Publish {
        id: String,
        publish: Publish,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Status {
        reply: oneshot::Sender<ClientStatus>,
    },
    Watch {
        reply: oneshot::Sender<Receiver<ClientStatus>>,
    },
    Disconnect {
        mode: DetachMode,
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running client task.
#[derive(Debug)]
pub struct Session {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<SyncResult<()>>,
}

impl Session {
    /// Starts a client task and begins connecting.
    ///
    /// Fails if called outside a tokio runtime.
    pub fn spawn(config: ClientConfig) -> SyncResult<Self> {
        let runtime =
            Handle::try_current().map_err(|e| SyncError::transport_fatal(e.to_string()))?;
        let (transport, events) = WsTransport::new(config.url.clone());
        let (commands, queue) = mpsc::channel(config.command_capacity.max(1));
        let tick = config.tick_interval;
        let client = Client::new(config, transport);
        let task = runtime.spawn(run(client, events, queue, tick));
        Ok(Self { commands, task })
    }

    /// Subscribes to an object or wildcard pattern.
    pub async fn slave(
        &self,
        id: impl Into<String>,
        options: SlaveOptions,
    ) -> SyncResult<SlaveEntry> {
        let id = id.into();
        self.request(|reply| Command::Slave { id, options, reply })
            .await?
    }

    /// Registers an object or wildcard pattern this client produces.
    pub async fn master(
        &self,
        id: impl Into<String>,
        options: MasterOptions,
    ) -> SyncResult<MasterEntry> {
        let id = id.into();
        self.request(|reply| Command::Master { id, options, reply })
            .await?
    }

    /// Drops every registration for `id`.
    pub async fn unlink(&self, id: impl Into<String>) -> SyncResult<()> {
        let id = id.into();
        self.request(|reply| Command::Unlink { id, reply }).await?
    }

    /// Replaces the content of the object produced under `id` and publishes it.
    pub async fn set(&self, id: impl Into<String>, options: MasterSet) -> SyncResult<()> {
        self.publish(id.into(), Publish::Set(options)).await
    }

    /// Publishes the current content of the object produced under `id`.
    pub async fn bump(&self, id: impl Into<String>, options: MasterBump) -> SyncResult<()> {
        self.publish(id.into(), Publish::Bump(options)).await
    }

    async fn publish(&self, id: String, publish: Publish) -> SyncResult<()> {
        self.request(|reply| Command::Publish { id, publish, reply })
            .await?
    }

    /// Current connection status.
    pub async fn status(&self) -> SyncResult<ClientStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Subscribes to connection status changes.
    pub async fn on_status_change(&self) -> SyncResult<Receiver<ClientStatus>> {
        self.request(|reply| Command::Watch { reply }).await
    }

    /// Returns true while the client task is running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Tears the link down, stops the task and waits for it.
    pub async fn disconnect(self, mode: DetachMode) -> SyncResult<()> {
        // A stopped task has already released its link.
        let _ = self.request(|reply| Command::Disconnect { mode, reply }).await;
        self.join().await
    }

    /// Waits for the task to end, returning the fatal error that stopped it.
    pub async fn join(self) -> SyncResult<()> {
        drop(self.commands);
        self.task
            .await
            .map_err(|e| SyncError::transport_fatal(e.to_string()))?
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> SyncResult<R> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SyncError::SessionClosed)?;
        answer.await.map_err(|_| SyncError::SessionClosed)
    }
}

async fn run(
    mut client: Client<WsTransport>,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    mut commands: mpsc::Receiver<Command>,
    tick: Duration,
) -> SyncResult<()> {
    client.connect()?;
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let outcome = tokio::select! {
            Some(event) = events.recv() => client.handle(event),
            command = commands.recv() => match command {
                Some(Command::Disconnect { mode, reply }) => {
                    client.disconnect(mode);
                    let _ = reply.send(());
                    info!("session stopped");
                    return Ok(());
                }
                Some(command) => {
                    apply(&mut client, command);
                    Ok(())
                }
                None => {
                    client.disconnect(DetachMode::Close);
                    info!("session handle dropped, stopping");
                    return Ok(());
                }
            },
            _ = ticker.tick() => client.poll(Instant::now()),
        };

        match outcome {
            Ok(()) => {}
            Err(error) if error.is_retryable() => {
                warn!(%error, "connection fault, waiting for reconnect");
            }
            Err(fatal) => {
                error!(error = %fatal, "synchronization failed, stopping session");
                client.disconnect(DetachMode::Close);
                return Err(fatal);
            }
        }
    }
}

fn apply(client: &mut Client<WsTransport>, command: Command) {
    // Replies are dropped when the caller stopped waiting.
    match command {
        Command::Slave { id, options, reply } => {
            let _ = reply.send(client.slave(&id, options));
        }
        Command::Master { id, options, reply } => {
            let _ = reply.send(client.master(&id, options));
        }
        Command::Unlink { id, reply } => {
            let _ = reply.send(client.unlink(&id));
        }
        Command::Publish { id, publish, reply } => {
            let _ = reply.send(client.publish(&id, publish));
        }
        Command::Status { reply } => {
            let _ = reply.send(client.status());
        }
        Command::Watch { reply } => {
            let _ = reply.send(client.on_status_change());
        }
        Command::Disconnect { mode, reply } => {
            client.disconnect(mode);
            let _ = reply.send(());
        }
    }
}
