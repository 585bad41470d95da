//! Outbound attachments waiting for their recipients to download them.

use std::collections::BTreeSet;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::attachment::Attachment;
use crate::event::{CenterEvent, EventBus};
use crate::lock;
use crate::peer::PeerKey;

pub const DEFAULT_DISPOSAL_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentSource {
    Path(PathBuf),
    Clipboard(Arc<Vec<u8>>),
}

/// An attachment offered with an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendAttachment {
    pub attachment: Attachment,
    pub source: AttachmentSource,
}

impl SendAttachment {
    /// Describe a file or directory to offer. The file id is assigned when the message is sent.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let meta = std::fs::metadata(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
        Ok(Self {
            attachment: Attachment::from_metadata(0, name, &meta),
            source: AttachmentSource::Path(path.to_path_buf()),
        })
    }

    /// Inline image shown at `position` in the message text.
    pub fn clipboard(name: impl Into<String>, data: Vec<u8>, position: u32) -> Self {
        Self {
            attachment: Attachment::clipboard(0, name, data.len() as u64, position),
            source: AttachmentSource::Clipboard(Arc::new(data)),
        }
    }
}

/// One attachment of one sent packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAttachment {
    pub packet_no: u64,
    pub attachment: SendAttachment,
    /// Recipients that have not finished downloading.
    pub remaining: BTreeSet<PeerKey>,
    empty_since: Option<Instant>,
}

impl PendingAttachment {
    pub fn file_id(&self) -> u32 {
        self.attachment.attachment.file_id
    }
}

/// All pending outbound attachments under one lock. Disposal happens a grace period after the
/// last recipient completes, checked under the same lock as completion.
#[derive(Debug)]
pub struct SendRegistry {
    entries: Mutex<Vec<PendingAttachment>>,
    grace: Duration,
    events: EventBus,
}

impl SendRegistry {
    pub fn new(grace: Duration, events: EventBus) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            grace,
            events,
        }
    }

    pub fn register(&self, packet_no: u64, attachments: &[SendAttachment], recipients: &[PeerKey]) {
        if attachments.is_empty() || recipients.is_empty() {
            return;
        }
        let remaining: BTreeSet<PeerKey> = recipients.iter().cloned().collect();
        lock(&self.entries).extend(attachments.iter().map(|a| PendingAttachment {
            packet_no,
            attachment: a.clone(),
            remaining: remaining.clone(),
            empty_since: None,
        }));
        self.events.publish(CenterEvent::AttachmentListChanged);
    }

    pub fn list(&self) -> Vec<PendingAttachment> {
        lock(&self.entries).clone()
    }

    pub fn find(&self, packet_no: u64, file_id: u32) -> Option<PendingAttachment> {
        lock(&self.entries)
            .iter()
            .find(|e| e.packet_no == packet_no && e.file_id() == file_id)
            .cloned()
    }

    /// Attachment a requester at `ip` may download, with the recipient it belongs to.
    pub fn lookup_for(&self, packet_no: u64, file_id: u32, ip: IpAddr) -> Option<(SendAttachment, PeerKey)> {
        let entries = lock(&self.entries);
        let entry = entries
            .iter()
            .find(|e| e.packet_no == packet_no && e.file_id() == file_id)?;
        let recipient = entry.remaining.iter().find(|k| k.address.ip() == ip)?;
        Some((entry.attachment.clone(), recipient.clone()))
    }

    /// Cancel one attachment regardless of remaining recipients.
    pub fn remove(&self, packet_no: u64, file_id: u32) -> bool {
        let removed = {
            let mut entries = lock(&self.entries);
            let before = entries.len();
            entries.retain(|e| !(e.packet_no == packet_no && e.file_id() == file_id));
            entries.len() != before
        };
        if removed {
            self.events.publish(CenterEvent::AttachmentListChanged);
        }
        removed
    }

    /// `recipient` finished downloading one attachment. `false` if it was not pending for them,
    /// including when the attachment was already disposed.
    pub fn complete(&self, packet_no: u64, file_id: u32, recipient: &PeerKey, now: Instant) -> bool {
        let done = {
            let mut entries = lock(&self.entries);
            match entries
                .iter_mut()
                .find(|e| e.packet_no == packet_no && e.file_id() == file_id)
            {
                Some(entry) => Self::drop_recipient(entry, recipient, now),
                None => false,
            }
        };
        if done {
            self.events.publish(CenterEvent::AttachmentListChanged);
        }
        done
    }

    /// `recipient` no longer wants any attachment of `packet_no`. Returns how many it was
    /// removed from.
    pub fn release(&self, packet_no: u64, recipient: &PeerKey, now: Instant) -> usize {
        let mut count = 0;
        for entry in lock(&self.entries).iter_mut() {
            if entry.packet_no == packet_no && Self::drop_recipient(entry, recipient, now) {
                count += 1;
            }
        }
        if count > 0 {
            self.events.publish(CenterEvent::AttachmentListChanged);
        }
        count
    }

    fn drop_recipient(entry: &mut PendingAttachment, recipient: &PeerKey, now: Instant) -> bool {
        if !entry.remaining.remove(recipient) {
            return false;
        }
        if entry.remaining.is_empty() {
            entry.empty_since = Some(now);
        }
        true
    }

    /// Remove attachments whose recipients have all completed at least `grace` ago.
    pub fn dispose_expired(&self, now: Instant) -> Vec<PendingAttachment> {
        let disposed: Vec<PendingAttachment> = {
            let mut entries = lock(&self.entries);
            let (expired, kept): (Vec<_>, Vec<_>) = entries.drain(..).partition(|e| {
                e.remaining.is_empty()
                    && e.empty_since
                        .is_some_and(|t| now.saturating_duration_since(t) >= self.grace)
            });
            *entries = kept;
            expired
        };
        if !disposed.is_empty() {
            tracing::debug!(count = disposed.len(), "disposed completed attachments");
            self.events.publish(CenterEvent::AttachmentListChanged);
        }
        disposed
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerKey {
        PeerKey::new(format!("u{n}"), ([10, 1, 1, n], 2425).into())
    }

    fn clip(id: u32) -> SendAttachment {
        let mut a = SendAttachment::clipboard("shot.png", vec![1, 2, 3], 0);
        a.attachment.file_id = id;
        a
    }

    fn registry() -> SendRegistry {
        SendRegistry::new(Duration::from_secs(30), EventBus::new())
    }

    #[test]
    fn disposed_only_after_grace_with_no_recipients() {
        let reg = registry();
        let t0 = Instant::now();
        reg.register(10, &[clip(0)], &[peer(1), peer(2)]);
        assert!(reg.complete(10, 0, &peer(1), t0));
        assert!(reg.dispose_expired(t0 + Duration::from_secs(60)).is_empty());
        assert!(reg.complete(10, 0, &peer(2), t0));
        assert!(reg.dispose_expired(t0 + Duration::from_secs(29)).is_empty());
        assert_eq!(reg.dispose_expired(t0 + Duration::from_secs(30)).len(), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn late_completion_after_disposal_is_ignored() {
        let reg = registry();
        let t0 = Instant::now();
        reg.register(10, &[clip(0)], &[peer(1)]);
        reg.complete(10, 0, &peer(1), t0);
        reg.dispose_expired(t0 + Duration::from_secs(31));
        assert!(!reg.complete(10, 0, &peer(1), t0 + Duration::from_secs(32)));
    }

    #[test]
    fn release_drops_recipient_from_every_attachment_of_packet() {
        let reg = registry();
        let now = Instant::now();
        reg.register(10, &[clip(0), clip(1)], &[peer(1), peer(2)]);
        reg.register(11, &[clip(0)], &[peer(1)]);
        assert_eq!(reg.release(10, &peer(1), now), 2);
        assert_eq!(reg.release(10, &peer(1), now), 0);
        assert!(reg.find(11, 0).unwrap().remaining.contains(&peer(1)));
        assert!(reg.find(10, 1).unwrap().remaining.contains(&peer(2)));
    }

    #[test]
    fn lookup_requires_pending_recipient_address() {
        let reg = registry();
        let now = Instant::now();
        reg.register(10, &[clip(0)], &[peer(1)]);
        let ip = peer(1).address.ip();
        assert!(reg.lookup_for(10, 0, ip).is_some());
        assert!(reg.lookup_for(10, 0, peer(2).address.ip()).is_none());
        assert!(reg.lookup_for(10, 5, ip).is_none());
        reg.complete(10, 0, &peer(1), now);
        assert!(reg.lookup_for(10, 0, ip).is_none());
    }

    #[test]
    fn remove_publishes_change() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let reg = SendRegistry::new(Duration::from_secs(1), bus);
        reg.register(1, &[clip(0)], &[peer(1)]);
        assert!(reg.remove(1, 0));
        assert!(!reg.remove(1, 0));
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn from_path_describes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.txt");
        std::fs::write(&path, b"12345").unwrap();
        let a = SendAttachment::from_path(&path).unwrap();
        assert_eq!(a.attachment.name, "plan.txt");
        assert_eq!(a.attachment.size, 5);
        assert_eq!(a.source, AttachmentSource::Path(path));
    }
}
