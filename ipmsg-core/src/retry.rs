//! Bounded resend of packets that need an acknowledgement.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::lock;
use crate::peer::PeerKey;
use crate::protocol::Command;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_CEILING: u32 = 3;

/// Packets to the same recipient are told apart by packet number, never by content.
pub type RetryKey = (u64, PeerKey);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEntry {
    pub packet_no: u64,
    pub recipient: PeerKey,
    pub command: Command,
    pub message: String,
    pub extension: String,
    /// Resends so far; the initial transmission is not counted.
    pub attempts: u32,
    last_sent: Instant,
}

impl RetryEntry {
    pub fn key(&self) -> RetryKey {
        (self.packet_no, self.recipient.clone())
    }
}

/// Outcome of one sweep.
#[derive(Debug, Default)]
pub struct RetrySweep {
    pub resend: Vec<RetryEntry>,
    /// Entries that hit the ceiling. They are gone from the tracker.
    pub failed: Vec<RetryEntry>,
}

#[derive(Debug)]
pub struct RetryTracker {
    entries: Mutex<HashMap<RetryKey, RetryEntry>>,
    interval: Duration,
    ceiling: u32,
}

impl RetryTracker {
    pub fn new(interval: Duration, ceiling: u32) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
            ceiling,
        }
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Track a packet that was just transmitted at `now`.
    pub fn register(
        &self,
        packet_no: u64,
        command: Command,
        recipient: PeerKey,
        message: impl Into<String>,
        extension: impl Into<String>,
        now: Instant,
    ) -> RetryEntry {
        let entry = RetryEntry {
            packet_no,
            recipient,
            command,
            message: message.into(),
            extension: extension.into(),
            attempts: 0,
            last_sent: now,
        };
        lock(&self.entries).insert(entry.key(), entry.clone());
        entry
    }

    /// Remove the entry; `None` if it was unknown or already settled.
    pub fn acknowledge(&self, packet_no: u64, recipient: &PeerKey) -> Option<RetryEntry> {
        lock(&self.entries).remove(&(packet_no, recipient.clone()))
    }

    /// Resend entries idle for at least the interval. An entry already resent `ceiling` times is
    /// dropped and reported as failed instead.
    pub fn sweep(&self, now: Instant) -> RetrySweep {
        let mut sweep = RetrySweep::default();
        let mut entries = lock(&self.entries);
        let due: Vec<RetryKey> = entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_sent) >= self.interval)
            .map(|(k, _)| k.clone())
            .collect();
        for key in due {
            let Some(entry) = entries.get_mut(&key) else {
                continue;
            };
            if entry.attempts >= self.ceiling {
                if let Some(entry) = entries.remove(&key) {
                    sweep.failed.push(entry);
                }
            } else {
                entry.attempts += 1;
                entry.last_sent = now;
                sweep.resend.push(entry.clone());
            }
        }
        sweep.resend.sort_by_key(|e| e.packet_no);
        sweep.failed.sort_by_key(|e| e.packet_no);
        sweep
    }

    pub fn contains(&self, packet_no: u64, recipient: &PeerKey) -> bool {
        lock(&self.entries).contains_key(&(packet_no, recipient.clone()))
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

impl Default for RetryTracker {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_INTERVAL, DEFAULT_RETRY_CEILING)
    }
}
