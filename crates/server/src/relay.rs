//! Relay channel: fans server messages out to every connected UI client.
//!
//! Each client owns a bounded queue drained by its WebSocket writer task.
//! Broadcasting never waits on a client: a full queue drops the message for
//! that client only, a closed queue unregisters the client. Delivery is
//! at-most-once, in send order per client.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use ultra_protocol::ServerMessage;

pub type ClientId = u64;

const DEFAULT_CLIENT_QUEUE: usize = 256;

pub struct RelayChannel {
    clients: DashMap<ClientId, mpsc::Sender<ServerMessage>>,
    next_client_id: AtomicU64,
    ready: AtomicBool,
    queue_capacity: usize,
}

impl Default for RelayChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayChannel {
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_CLIENT_QUEUE)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            clients: DashMap::new(),
            next_client_id: AtomicU64::new(1),
            ready: AtomicBool::new(false),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a client and return its id plus the queue to drain.
    ///
    /// A client connecting after `mark_ready` gets `ServerReady` first.
    pub fn connect(&self) -> (ClientId, mpsc::Receiver<ServerMessage>) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        if self.is_ready() {
            let _ = tx.try_send(ServerMessage::ServerReady);
        }
        self.clients.insert(client_id, tx);
        info!(
            component = "relay",
            event = "relay.client.connected",
            client_id,
            clients = self.clients.len(),
            "Relay client connected"
        );
        (client_id, rx)
    }

    pub fn disconnect(&self, client_id: ClientId) {
        if self.clients.remove(&client_id).is_some() {
            info!(
                component = "relay",
                event = "relay.client.disconnected",
                client_id,
                clients = self.clients.len(),
                "Relay client disconnected"
            );
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Send to every client. Returns how many clients accepted the message.
    pub fn broadcast(&self, msg: ServerMessage) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        for entry in self.clients.iter() {
            match entry.value().try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        component = "relay",
                        event = "relay.client.lagging",
                        client_id = *entry.key(),
                        "Client queue full, dropping message"
                    );
                }
                Err(TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }

        // Removal has to wait until the shard guards from `iter` are released.
        for client_id in closed {
            debug!(
                component = "relay",
                event = "relay.client.pruned",
                client_id,
                "Dropping client with closed queue"
            );
            self.clients.remove(&client_id);
        }

        delivered
    }

    /// Send to one client only. Returns `false` when it is gone or lagging.
    pub fn send_to(&self, client_id: ClientId, msg: ServerMessage) -> bool {
        let Some(tx) = self.clients.get(&client_id).map(|entry| entry.value().clone()) else {
            return false;
        };
        match tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    component = "relay",
                    event = "relay.client.lagging",
                    client_id,
                    "Client queue full, dropping direct message"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.clients.remove(&client_id);
                false
            }
        }
    }

    /// Announce that the server accepts traffic. Only the first call broadcasts.
    pub fn mark_ready(&self) {
        if !self.ready.swap(true, Ordering::SeqCst) {
            info!(
                component = "relay",
                event = "relay.ready",
                clients = self.clients.len(),
                "Relay ready"
            );
            self.broadcast(ServerMessage::ServerReady);
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
