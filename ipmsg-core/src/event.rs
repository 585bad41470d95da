//! Change notifications published by the core. Any number of consumers may subscribe; each gets
//! its own channel so a slow consumer never blocks the publisher.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use crate::lock;
use crate::message::InboundMessage;
use crate::peer::PeerKey;

#[derive(Debug, Clone)]
pub enum CenterEvent {
    /// The peer directory gained, lost or reordered a peer.
    PeerListChanged,
    /// A pending outbound attachment was added, completed or disposed.
    AttachmentListChanged,
    MessageReceived(Box<InboundMessage>),
    /// The recipient acknowledged the packet.
    Delivered { packet_no: u64, peer: PeerKey },
    /// Retry ceiling reached without acknowledgement.
    DeliveryFailed { packet_no: u64, peer: PeerKey },
    /// The recipient opened a sealed message.
    SealOpened { packet_no: u64, peer: PeerKey },
}

#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<CenterEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::Receiver<CenterEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    /// Deliver to every live subscriber; dropped receivers are forgotten.
    pub fn publish(&self, event: CenterEvent) {
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &lock(&self.subscribers).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_receives() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.publish(CenterEvent::PeerListChanged);
        assert!(matches!(a.try_recv(), Ok(CenterEvent::PeerListChanged)));
        assert!(matches!(b.try_recv(), Ok(CenterEvent::PeerListChanged)));
    }

    #[test]
    fn dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        drop(bus.subscribe());
        bus.publish(CenterEvent::AttachmentListChanged);
        assert_eq!(lock(&bus.subscribers).len(), 1);
        assert!(a.try_recv().is_ok());
    }
}
