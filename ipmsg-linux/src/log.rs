//! Message log: one JSON object per line.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use ipmsg_core::{InboundMessage, MessageLog, OutboundMessage, Peer, PeerKey, SecurityLevel};
use serde::Serialize;
use tracing::warn;

#[derive(Serialize)]
#[serde(tag = "direction", rename_all = "lowercase")]
enum Record<'a> {
    Inbound {
        at: u64,
        packet_no: u64,
        from: &'a PeerKey,
        name: &'a str,
        text: &'a str,
        security: SecurityLevel,
        doubt: bool,
        sealed: bool,
        attachments: Vec<&'a str>,
    },
    Outbound {
        at: u64,
        packet_no: u64,
        to: Vec<&'a PeerKey>,
        text: &'a str,
        sealed: bool,
        locked: bool,
        attachments: Vec<&'a str>,
    },
}

pub struct JsonLog {
    file: Mutex<File>,
}

impl JsonLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn write(&self, record: &Record<'_>) {
        let mut line = match serde_json::to_vec(record) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "failed to serialise log record");
                return;
            }
        };
        line.push(b'\n');
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = file.write_all(&line) {
            warn!(error = %e, "failed to write message log");
        }
    }
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

impl MessageLog for JsonLog {
    fn record_inbound(&self, m: &InboundMessage) {
        self.write(&Record::Inbound {
            at: unix_secs(m.received_at),
            packet_no: m.packet_no,
            from: m.sender.key(),
            name: m.sender.display_name(),
            text: &m.text,
            security: m.security,
            doubt: m.doubt,
            sealed: m.sealed,
            attachments: m.attachments.iter().map(|a| a.attachment.name.as_str()).collect(),
        });
    }

    fn record_outbound(&self, m: &OutboundMessage, recipients: &[Peer]) {
        self.write(&Record::Outbound {
            at: unix_secs(SystemTime::now()),
            packet_no: m.packet_no,
            to: recipients.iter().map(|p| p.key()).collect(),
            text: &m.text,
            sealed: m.sealed,
            locked: m.locked,
            attachments: m.attachments.iter().map(|a| a.attachment.name.as_str()).collect(),
        });
    }
}
