//! Shared handle to one registered connection.

use std::sync::{Arc, PoisonError, RwLock};

use switchyard_transport::{CloseReason, ConnectionId};
use uuid::Uuid;

use crate::auth::Identity;
use crate::outbound::OutboundQueue;

#[derive(Debug)]
struct Inner {
    connection_id: ConnectionId,
    user_id: Uuid,
    username: RwLock<String>,
    queue: OutboundQueue,
}

/// A cheap, cloneable reference to a connection's identity and outbound queue.
///
/// The hub keeps one per online user; the connection's own loops hold
/// another. The user id is fixed at handshake, the display name can change on
/// token refresh.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    inner: Arc<Inner>,
}

impl ClientHandle {
    /// Create a handle for a freshly verified identity.
    #[must_use]
    pub fn new(identity: Identity, queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                connection_id: ConnectionId::generate(),
                user_id: identity.user_id,
                username: RwLock::new(identity.username),
                queue: OutboundQueue::new(queue_capacity),
            }),
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.inner.connection_id
    }

    #[must_use]
    pub fn user_id(&self) -> Uuid {
        self.inner.user_id
    }

    /// Current display name.
    #[must_use]
    pub fn username(&self) -> String {
        self.inner
            .username
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_username(&self, username: String) {
        *self
            .inner
            .username
            .write()
            .unwrap_or_else(PoisonError::into_inner) = username;
    }

    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity::new(self.user_id(), self.username())
    }

    #[must_use]
    pub fn queue(&self) -> &OutboundQueue {
        &self.inner.queue
    }

    /// Close the outbound queue, asking the writer to send `reason`.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.inner.queue.close_with(reason)
    }

    /// Whether two handles refer to the same connection.
    #[must_use]
    pub fn same_connection(&self, other: &ClientHandle) -> bool {
        self.inner.connection_id == other.inner.connection_id
    }
}
