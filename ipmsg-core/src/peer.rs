//! Known peers keyed by (login name, address), kept sorted for display.

use std::cmp::Ordering;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Mutex;

use serde::Serialize;

use crate::capability::CryptoCapability;
use crate::crypto::PublicKey;
use crate::event::{CenterEvent, EventBus};
use crate::lock;

/// Identity of a peer. Display names may collide; this may not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PeerKey {
    pub login_name: String,
    pub address: SocketAddr,
}

impl PeerKey {
    pub fn new(login_name: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            login_name: login_name.into(),
            address,
        }
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.login_name, self.address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    key: PeerKey,
    pub host_name: String,
    /// Display name; falls back to the login name when empty.
    pub user_name: String,
    pub group_name: String,
    pub absence: bool,
    pub dialup: bool,
    pub attachment: bool,
    pub encryption: bool,
    pub ext_encryption: bool,
    pub utf8: bool,
    /// Capability negotiated with this peer; empty until its public key is known.
    pub crypto: CryptoCapability,
    pub public_key: Option<PublicKey>,
    /// Version string from the peer's SENDINFO answer.
    pub version: Option<String>,
}

impl Peer {
    pub fn new(login_name: impl Into<String>, address: SocketAddr, host_name: impl Into<String>) -> Self {
        Self {
            key: PeerKey::new(login_name, address),
            host_name: host_name.into(),
            user_name: String::new(),
            group_name: String::new(),
            absence: false,
            dialup: false,
            attachment: false,
            encryption: false,
            ext_encryption: false,
            utf8: false,
            crypto: CryptoCapability::default(),
            public_key: None,
            version: None,
        }
    }

    pub fn key(&self) -> &PeerKey {
        &self.key
    }

    pub fn login_name(&self) -> &str {
        &self.key.login_name
    }

    pub fn address(&self) -> SocketAddr {
        self.key.address
    }

    pub fn display_name(&self) -> &str {
        if self.user_name.is_empty() {
            &self.key.login_name
        } else {
            &self.user_name
        }
    }

    pub fn fingerprint(&self) -> Option<[u8; 16]> {
        self.public_key.as_ref().map(PublicKey::fingerprint)
    }

    fn display_order(&self, other: &Self) -> Ordering {
        self.group_name
            .to_lowercase()
            .cmp(&other.group_name.to_lowercase())
            .then_with(|| {
                self.display_name()
                    .to_lowercase()
                    .cmp(&other.display_name().to_lowercase())
            })
            .then_with(|| self.key.cmp(&other.key))
    }
}

/// Thread-safe, display-sorted peer list. Structural changes publish `PeerListChanged`.
#[derive(Debug)]
pub struct PeerDirectory {
    peers: Mutex<Vec<Peer>>,
    events: EventBus,
}

impl PeerDirectory {
    pub fn new(events: EventBus) -> Self {
        Self {
            peers: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Find or create the peer, then apply `update` to it under the lock.
    /// Returns a snapshot of the stored peer and whether it was created.
    pub fn upsert<F>(&self, login_name: &str, address: SocketAddr, host_name: &str, update: F) -> (Peer, bool)
    where
        F: FnOnce(&mut Peer),
    {
        let (snapshot, created, changed) = {
            let mut peers = lock(&self.peers);
            let index = peers
                .iter()
                .position(|p| p.key.login_name == login_name && p.key.address == address);
            let (index, created) = match index {
                Some(i) => (i, false),
                None => {
                    peers.push(Peer::new(login_name, address, host_name));
                    (peers.len() - 1, true)
                }
            };
            let before = peers[index].clone();
            update(&mut peers[index]);
            let peer = peers[index].clone();
            let changed = created || before != peer;
            if changed {
                peers.sort_by(Peer::display_order);
            }
            (peer, created, changed)
        };
        if changed {
            self.events.publish(CenterEvent::PeerListChanged);
        }
        (snapshot, created)
    }

    /// Insert a fully built peer. A second peer with the same identity is an error.
    pub fn append(&self, peer: Peer) -> Result<(), DirectoryError> {
        {
            let mut peers = lock(&self.peers);
            if peers.iter().any(|p| p.key == peer.key) {
                return Err(DirectoryError::DuplicatePeer(peer.key));
            }
            peers.push(peer);
            peers.sort_by(Peer::display_order);
        }
        self.events.publish(CenterEvent::PeerListChanged);
        Ok(())
    }

    /// Apply `update` to an existing peer.
    pub fn update<F>(&self, key: &PeerKey, update: F) -> Option<Peer>
    where
        F: FnOnce(&mut Peer),
    {
        let (peer, changed) = {
            let mut peers = lock(&self.peers);
            let index = peers.iter().position(|p| &p.key == key)?;
            let before = peers[index].clone();
            update(&mut peers[index]);
            let peer = peers[index].clone();
            let changed = before != peer;
            if changed {
                peers.sort_by(Peer::display_order);
            }
            (peer, changed)
        };
        if changed {
            self.events.publish(CenterEvent::PeerListChanged);
        }
        Some(peer)
    }

    pub fn remove(&self, key: &PeerKey) -> Option<Peer> {
        let removed = {
            let mut peers = lock(&self.peers);
            let index = peers.iter().position(|p| &p.key == key)?;
            peers.remove(index)
        };
        self.events.publish(CenterEvent::PeerListChanged);
        Some(removed)
    }

    pub fn remove_all(&self) {
        let had_peers = {
            let mut peers = lock(&self.peers);
            let had = !peers.is_empty();
            peers.clear();
            had
        };
        if had_peers {
            self.events.publish(CenterEvent::PeerListChanged);
        }
    }

    pub fn find(&self, login_name: &str, address: SocketAddr) -> Option<Peer> {
        lock(&self.peers)
            .iter()
            .find(|p| p.key.login_name == login_name && p.key.address == address)
            .cloned()
    }

    pub fn get(&self, key: &PeerKey) -> Option<Peer> {
        self.find(&key.login_name, key.address)
    }

    /// Snapshot in display order.
    pub fn list(&self) -> Vec<Peer> {
        lock(&self.peers).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.peers).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.peers).is_empty()
    }

    /// Addresses of dial-up peers, which never see subnet broadcasts.
    pub fn dialup_addresses(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = lock(&self.peers)
            .iter()
            .filter(|p| p.dialup)
            .map(|p| p.key.address)
            .collect();
        addrs.sort();
        addrs.dedup();
        addrs
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("peer {0} is already in the directory")]
    DuplicatePeer(PeerKey),
}
