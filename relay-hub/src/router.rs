use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    message::ServerFrame,
    registry::{Peer, Registry},
};

pub const USER_NOT_ONLINE: &str = "user not online";
pub const RECIPIENT_BUSY: &str = "recipient busy";

/// Resolves destinations against the registry and enqueues deliveries.
///
/// Every method takes its snapshot or lookup first and delivers afterwards,
/// so the registry lock is never held while a frame is queued.
#[derive(Clone)]
pub struct Router {
    registry: Arc<Registry>,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Routes a chat message. An absent or empty `to` broadcasts to every
    /// member, the sender included.
    pub async fn route_message(&self, sender: &Peer, to: Option<String>, text: String) {
        let frame = ServerFrame::Message {
            from: sender.name().to_string(),
            text,
        };

        match to.filter(|name| !name.is_empty()) {
            Some(name) => self.direct(sender, &name, frame).await,
            None => self.broadcast(frame).await,
        }
    }

    async fn direct(&self, sender: &Peer, to: &str, frame: ServerFrame) {
        let Some(recipient) = self.registry.lookup(to).await else {
            self.reply(sender, ServerFrame::error(USER_NOT_ONLINE)).await;
            return;
        };

        match recipient.deliver(frame) {
            Ok(()) => debug!(from = sender.name(), to, "direct message delivered"),
            Err(err) if err.is_closed() => {
                warn!(error = %err, "direct message could not be delivered");
                self.evict(&recipient).await;
                self.reply(sender, ServerFrame::error(USER_NOT_ONLINE)).await;
            }
            Err(err) => {
                warn!(error = %err, "direct message dropped");
                self.reply(sender, ServerFrame::error(RECIPIENT_BUSY)).await;
            }
        }
    }

    /// Delivers `frame` to every member registered when the snapshot is
    /// taken. Peers whose session is gone are evicted once the fan-out
    /// completes; peers that are merely behind miss this frame.
    pub async fn broadcast(&self, frame: ServerFrame) {
        let members = self.registry.snapshot().await;
        let failed = deliver_all(&members, &frame);
        if self.drop_peers(failed).await {
            self.announce_members().await;
        }
    }

    /// Answers a `list` request with the current member names.
    pub async fn list(&self, requester: &Peer) {
        let names = self.registry.names().await;
        self.reply(requester, ServerFrame::Users { names }).await;
    }

    /// Sends the member list to every member. Repeats while evictions
    /// during the fan-out keep changing membership.
    pub async fn announce_members(&self) {
        loop {
            let members = self.registry.snapshot().await;
            let names = members.iter().map(|peer| peer.name().to_string()).collect();
            let failed = deliver_all(&members, &ServerFrame::Users { names });
            if !self.drop_peers(failed).await {
                break;
            }
        }
    }

    /// Queues a frame for one peer, evicting it if its session is gone.
    pub async fn reply(&self, peer: &Peer, frame: ServerFrame) {
        match peer.deliver(frame) {
            Ok(()) => {}
            Err(err) if err.is_closed() => {
                warn!(error = %err, "reply could not be delivered");
                self.evict(peer).await;
            }
            Err(err) => warn!(error = %err, "reply dropped"),
        }
    }

    /// Removes a peer whose outbound path failed and tells the others.
    pub async fn evict(&self, peer: &Peer) {
        if self.drop_peers(vec![peer.clone()]).await {
            self.announce_members().await;
        }
    }

    /// Teardown path for a session leaving on its own.
    pub async fn leave(&self, peer: &Peer) -> bool {
        let removed = self.registry.remove(peer).await;
        if removed {
            self.announce_members().await;
        }
        removed
    }

    async fn drop_peers(&self, peers: Vec<Peer>) -> bool {
        let mut changed = false;
        for peer in peers {
            peer.close();
            if self.registry.remove(&peer).await {
                warn!(name = peer.name(), "evicted unreachable peer");
                changed = true;
            }
        }
        changed
    }
}

/// Returns the members whose session turned out to be gone.
fn deliver_all(members: &[Peer], frame: &ServerFrame) -> Vec<Peer> {
    let mut gone = Vec::new();
    for peer in members {
        match peer.deliver(frame.clone()) {
            Ok(()) => {}
            Err(err) if err.is_closed() => gone.push(peer.clone()),
            Err(err) => warn!(error = %err, "frame dropped for lagging peer"),
        }
    }
    gone
}
