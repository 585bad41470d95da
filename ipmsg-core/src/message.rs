//! Message records exchanged between MessageCenter and its caller.

use std::time::SystemTime;

use serde::Serialize;

use crate::attachment::RecvAttachment;
use crate::capability::{CryptoCapability, KeySize, SymmetricSuite};
use crate::peer::Peer;
use crate::registry::SendAttachment;

/// How an inbound message was protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    /// Plaintext.
    None,
    /// RSA-1024 or Blowfish-128.
    Legacy,
    /// RSA-2048 with AES-256.
    Standard,
    /// Standard plus a verified signature.
    Signed,
}

impl SecurityLevel {
    pub fn of(capability: &CryptoCapability, signature_valid: bool) -> Self {
        match (capability.key_size(), capability.suite()) {
            (Some(KeySize::Rsa2048), Some(SymmetricSuite::Aes256)) if signature_valid => {
                SecurityLevel::Signed
            }
            (Some(KeySize::Rsa2048), Some(SymmetricSuite::Aes256)) => SecurityLevel::Standard,
            (Some(_), Some(_)) => SecurityLevel::Legacy,
            _ => SecurityLevel::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub packet_no: u64,
    pub received_at: SystemTime,
    /// Snapshot of the sender at receive time.
    pub sender: Peer,
    /// Decrypted text, or the raw payload when `doubt` is set and decryption failed.
    pub text: String,
    pub security: SecurityLevel,
    /// Integrity suspect: decryption or signature verification failed.
    pub doubt: bool,
    /// Covered until the user opens it.
    pub sealed: bool,
    /// Password protected.
    pub locked: bool,
    pub multicast: bool,
    pub broadcast: bool,
    /// Received while we were marked absent.
    pub absence: bool,
    /// The sender's own absence auto-reply.
    pub auto_reply: bool,
    pub attachments: Vec<RecvAttachment>,
    pub clipboards: Vec<RecvAttachment>,
    pub need_log: bool,
}

/// A message to send. The packet number is assigned by `MessageCenter::send`.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub packet_no: u64,
    pub text: String,
    pub attachments: Vec<SendAttachment>,
    pub sealed: bool,
    pub locked: bool,
}

impl OutboundMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn sealed(mut self) -> Self {
        self.sealed = true;
        self
    }

    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }

    pub fn with_attachment(mut self, attachment: SendAttachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

/// Sink for finished message records; formatting and storage are up to the implementor.
pub trait MessageLog: Send + Sync {
    fn record_inbound(&self, message: &InboundMessage);
    fn record_outbound(&self, message: &OutboundMessage, recipients: &[Peer]);
}
