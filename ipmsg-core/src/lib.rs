//! IP Messenger protocol engine.
//! Host-driven: no network I/O; the host passes datagrams and ticks and receives actions.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod attachment;
pub mod capability;
pub mod center;
pub mod config;
pub mod crypto;
pub mod download;
pub mod event;
pub mod message;
pub mod peer;
pub mod protocol;
pub mod refuse;
pub mod registry;
pub mod retry;
pub mod transfer;
pub mod wire;

pub use attachment::{Attachment, AttachmentKind, DescriptorError, RecvAttachment};
pub use capability::{CryptoCapability, KeySize, SignHash, SymmetricSuite};
pub use center::{MessageCenter, OutboundAction, SendError, SendReport, ServeTicket};
pub use config::CenterConfig;
pub use crypto::{CryptoEngine, CryptoError, PublicKey};
pub use download::{
    DownloadError, DownloadListener, DownloadProgress, DownloadSession, DownloadState,
    DownloaderContext, NoopListener,
};
pub use event::{CenterEvent, EventBus};
pub use message::{InboundMessage, MessageLog, OutboundMessage, SecurityLevel};
pub use peer::{Peer, PeerDirectory, PeerKey};
pub use protocol::{Command, Mode, DEFAULT_PORT, PROTOCOL_VERSION};
pub use refuse::{RefuseCondition, RefuseRule, RefuseTarget};
pub use registry::{AttachmentSource, PendingAttachment, SendAttachment};
pub use transfer::{StreamEntry, StreamHeader, TransferRequest};
pub use wire::{decode_packet, encode_packet, Packet, PacketDecodeError, PacketEncodeError};

/// Shared state stays usable after a panicking holder; every critical section leaves it
/// consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
