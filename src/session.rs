//! Per-connection session state.
//!
//! A [`Session`] is owned by its connection handler and walks through
//! `Connecting -> Naming -> Active -> Leaving -> Closed`. The broker never sees the
//! `Session` itself, only a [`SessionHandle`]: the peer's identity plus the sending half
//! of its outgoing queue.

use std::sync::Arc;

use async_std::channel;
use tracing::{debug, info};
use uuid::Uuid;

use crate::broker::Broadcaster;
use crate::error::ServerError;
use crate::{AsyncStdReceiver, AsyncStdSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Naming,
    Active,
    Leaving,
    Closed,
}

/// What the broker knows about a session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    peer_id: Uuid,
    address: Arc<str>,
    name: Arc<str>,
    outgoing: AsyncStdSender<String>,
}

impl SessionHandle {
    pub fn new(peer_id: Uuid, address: &str, name: &str, outgoing: AsyncStdSender<String>) -> SessionHandle {
        SessionHandle {
            peer_id,
            address: Arc::from(address),
            name: Arc::from(name),
            outgoing,
        }
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn outgoing(&self) -> AsyncStdSender<String> {
        self.outgoing.clone()
    }

    /// Closes the outgoing queue, returns `false` if it was already closed.
    pub fn close_outgoing(&self) -> bool {
        self.outgoing.close()
    }
}

#[derive(Debug)]
pub struct Session {
    peer_id: Uuid,
    address: String,
    name: Option<String>,
    outgoing: AsyncStdSender<String>,
    state: SessionState,
}

impl Session {
    /// Creates a session for a freshly accepted peer, together with the receiving half of
    /// its outgoing queue which belongs to the delivery worker.
    pub fn new(address: String, queue_capacity: usize) -> (Session, AsyncStdReceiver<String>) {
        let (outgoing, outgoing_receiver) = channel::bounded::<String>(queue_capacity);
        let session = Session {
            peer_id: Uuid::new_v4(),
            address,
            name: None,
            outgoing,
            state: SessionState::Connecting,
        };
        (session, outgoing_receiver)
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The chosen name, or the peer's address until naming completes.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }

    pub fn begin_naming(&mut self) {
        if self.state == SessionState::Connecting {
            self.state = SessionState::Naming;
        }
    }

    /// Any line is accepted as a name, empty and duplicate names included.
    pub fn set_name(&mut self, name: String) {
        debug!(peer_id = ?self.peer_id, name, "Client {} picked a name", self.peer_id);
        self.name = Some(name);
    }

    /// Enqueues a line for this peer only. Waits while the queue is full, and silently
    /// drops the line once the queue has been closed.
    pub async fn send(&self, line: impl Into<String>) {
        if self.outgoing.send(line.into()).await.is_err() {
            debug!(peer_id = ?self.peer_id, "Outgoing queue of client {} is closed, dropping line", self.peer_id);
        }
    }

    /// Enqueues a line for this peer only if there is room for it right now.
    /// Returns whether the line was queued.
    pub fn try_send(&self, line: impl Into<String>) -> bool {
        match self.outgoing.try_send(line.into()) {
            Ok(()) => true,
            Err(e) => {
                debug!(peer_id = ?self.peer_id, full = e.is_full(), "Dropping line for client {}", self.peer_id);
                false
            }
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle::new(self.peer_id, &self.address, self.display_name(), self.outgoing.clone())
    }

    /// Registers the session with the hub and announces the arrival to everyone else.
    pub async fn register(&mut self, hub: &Broadcaster) -> Result<(), ServerError> {
        if self.state != SessionState::Naming {
            return Err(ServerError::StateError(format!(
                "client {} attempted to register while in state {:?}",
                self.peer_id, self.state
            )));
        }
        hub.register(self.handle()).await?;
        self.state = SessionState::Active;
        info!(peer_id = ?self.peer_id, address = %self.address, name = self.display_name(), "Client {} is active", self.peer_id);
        hub.broadcast(self.peer_id, format!("{} has arrived", self.address)).await
    }

    /// Tears the session down. Only the first call has any effect, later calls return `Ok(false)`.
    ///
    /// An active session is unregistered (the broker closes its queue) and its departure
    /// announced. A session that never became active closes its own queue.
    pub async fn leave(&mut self, hub: &Broadcaster) -> Result<bool, ServerError> {
        match self.state {
            SessionState::Leaving | SessionState::Closed => Ok(false),
            SessionState::Active => {
                self.state = SessionState::Leaving;
                info!(peer_id = ?self.peer_id, address = %self.address, "Client {} is leaving", self.peer_id);
                if let Err(e) = hub.unregister(self.peer_id).await {
                    // the broker is gone and will never close the queue for us
                    self.outgoing.close();
                    return Err(e);
                }
                hub.broadcast(self.peer_id, format!("{} has left", self.address)).await?;
                Ok(true)
            }
            SessionState::Connecting | SessionState::Naming => {
                self.state = SessionState::Leaving;
                debug!(peer_id = ?self.peer_id, "Client {} left before becoming active", self.peer_id);
                self.outgoing.close();
                Ok(true)
            }
        }
    }

    /// Marks the session terminal once its connection has been shut down.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}
