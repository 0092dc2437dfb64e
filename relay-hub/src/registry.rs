//! Shared map of registered names to their outbound paths.
//!
//! The map sits behind one mutex and every critical section is a plain
//! insert, remove, or clone. Nothing here touches a socket: callers take a
//! snapshot, drop the guard, and only then enqueue frames on the peers they
//! got back.

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use tokio::sync::{
    Mutex,
    mpsc::{self, error::TrySendError},
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{DeliveryError, RegisterError},
    message::ServerFrame,
};

pub type SessionId = u64;

/// One unit of work for a session's writer task.
#[derive(Debug)]
pub enum Outbound {
    Frame(ServerFrame),
    /// A file header followed by its body. The writer streams chunks from
    /// `body` until the sending side closes it, so nothing else can be
    /// written inside the body.
    File {
        header: ServerFrame,
        body: mpsc::Receiver<Bytes>,
    },
}

/// Handle to a registered session's outbound path.
///
/// Cloning is cheap; clones are handed out by registry lookups and never
/// give access to the session's inbound stream.
#[derive(Debug, Clone)]
pub struct Peer {
    id: SessionId,
    name: String,
    outbound: mpsc::Sender<Outbound>,
    closed: CancellationToken,
}

impl Peer {
    pub fn new(
        id: SessionId,
        name: String,
        outbound: mpsc::Sender<Outbound>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            id,
            name,
            outbound,
            closed,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn deliver(&self, frame: ServerFrame) -> Result<(), DeliveryError> {
        self.enqueue(Outbound::Frame(frame))
    }

    /// Queues an item without waiting, so one stalled reader never holds
    /// up its senders.
    pub fn enqueue(&self, item: Outbound) -> Result<(), DeliveryError> {
        self.outbound.try_send(item).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryError::QueueFull {
                name: self.name.clone(),
            },
            TrySendError::Closed(_) => DeliveryError::Closed {
                name: self.name.clone(),
            },
        })
    }

    /// Signals the owning session to shut down.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

pub struct Registry {
    peers: Mutex<HashMap<String, Peer>>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Inserts `peer` under its name. An existing entry is never replaced.
    pub async fn register(&self, peer: Peer) -> Result<(), RegisterError> {
        let mut peers = self.peers.lock().await;
        match peers.entry(peer.name.clone()) {
            Entry::Occupied(_) => Err(RegisterError::NameTaken),
            Entry::Vacant(slot) => {
                slot.insert(peer);
                Ok(())
            }
        }
    }

    /// Removes the entry for `peer` if it still belongs to that session.
    /// Returns whether membership changed.
    pub async fn remove(&self, peer: &Peer) -> bool {
        let mut peers = self.peers.lock().await;
        match peers.get(&peer.name) {
            Some(current) if current.id == peer.id => {
                peers.remove(&peer.name);
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, name: &str) -> Option<Peer> {
        self.peers.lock().await.get(name).cloned()
    }

    pub async fn snapshot(&self) -> Vec<Peer> {
        self.peers.lock().await.values().cloned().collect()
    }

    pub async fn names(&self) -> Vec<String> {
        self.peers.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(registry: &Registry, name: &str) -> (Peer, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(4);
        let peer = Peer::new(
            registry.next_id(),
            name.to_string(),
            tx,
            CancellationToken::new(),
        );
        (peer, rx)
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected_without_replacing() {
        let registry = Registry::new();
        let (first, _first_rx) = peer(&registry, "alice");
        let (second, _second_rx) = peer(&registry, "alice");

        registry.register(first.clone()).await.expect("first registration");
        assert_eq!(
            registry.register(second).await,
            Err(RegisterError::NameTaken)
        );

        let current = registry.lookup("alice").await.expect("alice present");
        assert_eq!(current.id(), first.id());
    }

    #[tokio::test]
    async fn stale_handle_does_not_remove_newer_session() {
        let registry = Registry::new();
        let (old, _old_rx) = peer(&registry, "bob");
        registry.register(old.clone()).await.expect("register old");
        assert!(registry.remove(&old).await);
        assert!(!registry.remove(&old).await);

        let (new, _new_rx) = peer(&registry, "bob");
        registry.register(new.clone()).await.expect("register new");
        assert!(!registry.remove(&old).await);
        assert_eq!(registry.lookup("bob").await.map(|p| p.id()), Some(new.id()));
    }

    #[tokio::test]
    async fn snapshot_is_not_affected_by_later_membership_changes() {
        let registry = Registry::new();
        let (alice, _alice_rx) = peer(&registry, "alice");
        registry.register(alice.clone()).await.expect("register alice");

        let snapshot = registry.snapshot().await;

        let (carol, _carol_rx) = peer(&registry, "carol");
        registry.register(carol).await.expect("register carol");
        registry.remove(&alice).await;

        let names: Vec<_> = snapshot.iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["alice".to_string()]);
        assert_eq!(registry.names().await, vec!["carol".to_string()]);
    }

    #[tokio::test]
    async fn only_a_closed_queue_means_the_peer_is_gone() {
        let registry = Registry::new();
        let (tx, rx) = mpsc::channel(1);
        let dave = Peer::new(registry.next_id(), "dave".into(), tx, CancellationToken::new());

        dave.deliver(ServerFrame::ok("one")).expect("first fits");
        let full = dave.deliver(ServerFrame::ok("two")).expect_err("queue full");
        assert_eq!(
            full,
            DeliveryError::QueueFull {
                name: "dave".into()
            }
        );
        assert!(!full.is_closed());

        drop(rx);
        let closed = dave.deliver(ServerFrame::ok("three")).expect_err("closed");
        assert_eq!(
            closed,
            DeliveryError::Closed {
                name: "dave".into()
            }
        );
        assert!(closed.is_closed());
    }
}
