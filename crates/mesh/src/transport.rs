//! Transport collaborator boundary and an in-process implementation.
//!
//! Inbound traffic and membership changes arrive on a single bounded
//! channel per peer rather than through registered callbacks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use cogwheel_core::PeerId;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::MeshError;
use crate::message::Message;

/// Inbound queue depth for [`MemoryHub`] members.
pub const DEFAULT_INBOX_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(Message),
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
}

/// Reaches other peers.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn local_peer(&self) -> &PeerId;

    async fn send(&self, peer: &PeerId, message: Message) -> Result<(), MeshError>;

    async fn broadcast(&self, message: Message) -> Result<(), MeshError>;

    /// The inbound event stream. Yields `Some` once.
    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>>;
}

#[async_trait]
impl<T: PeerTransport + ?Sized> PeerTransport for Arc<T> {
    fn local_peer(&self) -> &PeerId {
        (**self).local_peer()
    }

    async fn send(&self, peer: &PeerId, message: Message) -> Result<(), MeshError> {
        (**self).send(peer, message).await
    }

    async fn broadcast(&self, message: Message) -> Result<(), MeshError> {
        (**self).broadcast(message).await
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        (**self).take_events()
    }
}

type Inboxes = Arc<RwLock<HashMap<PeerId, mpsc::Sender<TransportEvent>>>>;

fn poisoned<T>(_: T) -> MeshError {
    MeshError::Transport("hub lock poisoned".into())
}

/// In-process switchboard connecting [`MemoryTransport`]s.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inboxes: Inboxes,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer. Existing members and the newcomer are told about
    /// each other.
    pub fn join(&self, peer: PeerId) -> Result<MemoryTransport, MeshError> {
        let (tx, rx) = mpsc::channel(DEFAULT_INBOX_CAPACITY);
        let mut inboxes = self.inboxes.write().map_err(poisoned)?;
        for (other, inbox) in inboxes.iter() {
            if *other == peer {
                continue;
            }
            let _ = inbox.try_send(TransportEvent::PeerConnected(peer.clone()));
            let _ = tx.try_send(TransportEvent::PeerConnected(other.clone()));
        }
        inboxes.insert(peer.clone(), tx);
        debug!(peer = %peer, members = inboxes.len(), "joined hub");
        Ok(MemoryTransport {
            peer,
            inboxes: Arc::clone(&self.inboxes),
            events: Mutex::new(Some(rx)),
        })
    }

    /// Unregister a peer and tell the remaining members.
    pub fn leave(&self, peer: &PeerId) -> Result<(), MeshError> {
        let mut inboxes = self.inboxes.write().map_err(poisoned)?;
        if inboxes.remove(peer).is_some() {
            for inbox in inboxes.values() {
                let _ = inbox.try_send(TransportEvent::PeerDisconnected(peer.clone()));
            }
            debug!(peer = %peer, "left hub");
        }
        Ok(())
    }

    pub fn members(&self) -> Vec<PeerId> {
        self.inboxes
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }
}

pub struct MemoryTransport {
    peer: PeerId,
    inboxes: Inboxes,
    events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl MemoryTransport {
    fn deliver(
        &self,
        peer: &PeerId,
        inbox: &mpsc::Sender<TransportEvent>,
        message: Message,
    ) -> Result<(), MeshError> {
        inbox
            .try_send(TransportEvent::Message(message))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Closed(_) => MeshError::PeerUnavailable(peer.clone()),
                mpsc::error::TrySendError::Full(_) => {
                    MeshError::Transport(format!("inbox of {peer} is full"))
                }
            })
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn local_peer(&self) -> &PeerId {
        &self.peer
    }

    async fn send(&self, peer: &PeerId, message: Message) -> Result<(), MeshError> {
        let inbox = {
            let inboxes = self.inboxes.read().map_err(poisoned)?;
            inboxes
                .get(peer)
                .cloned()
                .ok_or_else(|| MeshError::PeerUnavailable(peer.clone()))?
        };
        self.deliver(peer, &inbox, message)
    }

    async fn broadcast(&self, message: Message) -> Result<(), MeshError> {
        let targets: Vec<(PeerId, mpsc::Sender<TransportEvent>)> = {
            let inboxes = self.inboxes.read().map_err(poisoned)?;
            inboxes
                .iter()
                .filter(|(p, _)| **p != self.peer)
                .map(|(p, tx)| (p.clone(), tx.clone()))
                .collect()
        };
        for (peer, inbox) in targets {
            if let Err(e) = self.deliver(&peer, &inbox, message.clone()) {
                warn!(peer = %peer, error = %e, "broadcast delivery failed");
            }
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.lock().ok().and_then(|mut slot| slot.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MerkleClock;

    fn msg(from: &str) -> Message {
        let mut clock = MerkleClock::new(PeerId::from(from), 4);
        Message::new("cogwheel.test", PeerId::from(from), clock.stamp("t"), &1u8).unwrap()
    }

    #[tokio::test]
    async fn join_announces_both_ways() {
        let hub = MemoryHub::new();
        let a = hub.join(PeerId::from("a")).unwrap();
        let mut a_events = a.take_events().unwrap();
        let b = hub.join(PeerId::from("b")).unwrap();
        let mut b_events = b.take_events().unwrap();

        assert!(matches!(a_events.recv().await, Some(TransportEvent::PeerConnected(p)) if p == PeerId::from("b")));
        assert!(matches!(b_events.recv().await, Some(TransportEvent::PeerConnected(p)) if p == PeerId::from("a")));
        assert!(a.take_events().is_none());
    }

    #[tokio::test]
    async fn send_and_broadcast() {
        let hub = MemoryHub::new();
        let a = hub.join(PeerId::from("a")).unwrap();
        let b = hub.join(PeerId::from("b")).unwrap();
        let c = hub.join(PeerId::from("c")).unwrap();
        let mut b_events = b.take_events().unwrap();
        let mut c_events = c.take_events().unwrap();

        a.send(&PeerId::from("b"), msg("a")).await.unwrap();
        a.broadcast(msg("a")).await.unwrap();

        let mut b_messages = 0;
        while let Ok(event) = b_events.try_recv() {
            if matches!(event, TransportEvent::Message(_)) {
                b_messages += 1;
            }
        }
        assert_eq!(b_messages, 2);

        let mut c_messages = 0;
        while let Ok(event) = c_events.try_recv() {
            if let TransportEvent::Message(m) = event {
                assert_eq!(m.sender, PeerId::from("a"));
                c_messages += 1;
            }
        }
        assert_eq!(c_messages, 1);
    }

    #[tokio::test]
    async fn unknown_peer_is_unavailable() {
        let hub = MemoryHub::new();
        let a = hub.join(PeerId::from("a")).unwrap();
        let err = a.send(&PeerId::from("ghost"), msg("a")).await.unwrap_err();
        assert!(matches!(err, MeshError::PeerUnavailable(p) if p == PeerId::from("ghost")));
    }

    #[tokio::test]
    async fn leave_notifies_members() {
        let hub = MemoryHub::new();
        let a = hub.join(PeerId::from("a")).unwrap();
        let mut a_events = a.take_events().unwrap();
        let _b = hub.join(PeerId::from("b")).unwrap();
        hub.leave(&PeerId::from("b")).unwrap();

        assert!(matches!(a_events.recv().await, Some(TransportEvent::PeerConnected(_))));
        assert!(matches!(a_events.recv().await, Some(TransportEvent::PeerDisconnected(p)) if p == PeerId::from("b")));
        assert_eq!(hub.members(), vec![PeerId::from("a")]);
        assert!(a.send(&PeerId::from("b"), msg("a")).await.is_err());
    }
}
