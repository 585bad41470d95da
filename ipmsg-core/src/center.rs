//! Host-driven coordinator: the host passes in datagrams and timer ticks, MessageCenter returns
//! the datagrams to transmit and publishes `CenterEvent`s.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::attachment::{decode_descriptors, encode_descriptors, Attachment, RecvAttachment};
use crate::capability::{CryptoCapability, KeySize};
use crate::config::CenterConfig;
use crate::crypto::{CryptoEngine, CryptoError, PublicKey, SignatureCheck};
use crate::download::{DownloadListener, DownloadSession, DownloaderContext};
use crate::event::{CenterEvent, EventBus};
use crate::lock;
use crate::message::{InboundMessage, MessageLog, OutboundMessage, SecurityLevel};
use crate::peer::{Peer, PeerDirectory, PeerKey};
use crate::protocol::{opt, Command, Mode};
use crate::refuse::{is_refused, RefuseSubject};
use crate::registry::{PendingAttachment, SendAttachment, SendRegistry};
use crate::retry::RetryTracker;
use crate::transfer::TransferRequest;
use crate::wire::{decode_packet, encode_packet, Packet, PacketEncodeError};

/// (peer, packet number) pairs remembered for duplicate suppression.
const RECENT_PACKETS: usize = 256;

/// Action for the host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    /// Transmit one datagram.
    SendPacket(SocketAddr, Vec<u8>),
}

/// Result of `send`: one packet number for the message, one outcome per recipient.
#[derive(Debug)]
pub struct SendReport {
    pub packet_no: u64,
    pub actions: Vec<OutboundAction>,
    pub results: Vec<(PeerKey, Result<(), SendError>)>,
}

impl SendReport {
    pub fn failed(&self) -> impl Iterator<Item = (&PeerKey, &SendError)> {
        self.results
            .iter()
            .filter_map(|(k, r)| r.as_ref().err().map(|e| (k, e)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("unknown peer {0}")]
    UnknownPeer(PeerKey),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Encode(#[from] PacketEncodeError),
}

/// An accepted file-endpoint request: what to stream and for whom.
#[derive(Debug, Clone)]
pub struct ServeTicket {
    pub request: TransferRequest,
    pub attachment: SendAttachment,
    pub recipient: PeerKey,
}

pub struct MessageCenter {
    config: CenterConfig,
    crypto: Option<Arc<CryptoEngine>>,
    events: EventBus,
    peers: PeerDirectory,
    retry: RetryTracker,
    registry: SendRegistry,
    packet_no: AtomicU64,
    absence: Mutex<Option<String>>,
    recent: Mutex<VecDeque<(PeerKey, u64)>>,
    downloads: Mutex<Vec<Arc<DownloaderContext>>>,
    log: Option<Arc<dyn MessageLog>>,
}

impl MessageCenter {
    /// `crypto = None` runs plaintext only.
    pub fn new(config: CenterConfig, crypto: Option<Arc<CryptoEngine>>) -> Self {
        let config = config.sanitized();
        let events = EventBus::new();
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            peers: PeerDirectory::new(events.clone()),
            retry: RetryTracker::new(config.retry_interval, config.retry_ceiling),
            registry: SendRegistry::new(config.disposal_grace, events.clone()),
            events,
            crypto,
            config,
            packet_no: AtomicU64::new(seed),
            absence: Mutex::new(None),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_PACKETS)),
            downloads: Mutex::new(Vec::new()),
            log: None,
        }
    }

    pub fn with_log(mut self, log: Arc<dyn MessageLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn config(&self) -> &CenterConfig {
        &self.config
    }

    pub fn subscribe(&self) -> mpsc::Receiver<CenterEvent> {
        self.events.subscribe()
    }

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    pub fn retry(&self) -> &RetryTracker {
        &self.retry
    }

    pub fn crypto(&self) -> Option<&Arc<CryptoEngine>> {
        self.crypto.as_ref()
    }

    pub fn capability(&self) -> CryptoCapability {
        self.crypto
            .as_ref()
            .map(|c| c.capability())
            .unwrap_or_default()
    }

    /// Process-wide, strictly increasing.
    pub fn next_packet_no(&self) -> u64 {
        self.packet_no.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_absent(&self) -> bool {
        lock(&self.absence).is_some()
    }

    /// Enter (`Some`) or leave (`None`) absence and announce it. An empty text uses the
    /// configured absence message.
    pub fn set_absence(&self, text: Option<String>) -> Vec<OutboundAction> {
        let text = text.map(|t| {
            if t.is_empty() {
                self.config.absence_message.clone()
            } else {
                t
            }
        });
        *lock(&self.absence) = text;
        self.broadcast_absence()
    }

    /// Forget every peer and pending retry.
    pub fn reset(&self) {
        self.peers.remove_all();
        self.retry.clear();
        lock(&self.recent).clear();
    }

    fn packet(&self, packet_no: u64, command: Command, message: impl Into<String>) -> Packet {
        Packet::new(
            packet_no,
            &self.config.login_name,
            &self.config.host_name,
            command,
            message,
        )
    }

    fn push_packet(&self, to: SocketAddr, packet: &Packet, actions: &mut Vec<OutboundAction>) {
        match encode_packet(packet) {
            Ok(bytes) => actions.push(OutboundAction::SendPacket(to, bytes)),
            Err(e) => warn!(%to, command = packet.command.0, error = %e, "failed to encode packet"),
        }
    }

    fn reply(&self, to: SocketAddr, command: Command, message: impl Into<String>, actions: &mut Vec<OutboundAction>) {
        let packet = self.packet(self.next_packet_no(), command, message);
        self.push_packet(to, &packet, actions);
    }

    fn presence_command(&self, mode: Mode) -> Command {
        let mut flags = opt::UTF8 | opt::CAPUTF8 | opt::FILEATTACH | opt::CLIPBOARD;
        if self.crypto.is_some() {
            flags |= opt::ENCRYPT;
        }
        if self.is_absent() {
            flags |= opt::ABSENCE;
        }
        if self.config.dialup {
            flags |= opt::DIALUP;
        }
        Command::new(mode).with(flags)
    }

    fn broadcast(&self, mode: Mode) -> Vec<OutboundAction> {
        let packet = self
            .packet(
                self.next_packet_no(),
                self.presence_command(mode),
                self.config.user_name.clone(),
            )
            .with_extension(self.config.group_name.clone());
        let bytes = match encode_packet(&packet) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to encode broadcast");
                return Vec::new();
            }
        };
        let mut targets: Vec<SocketAddr> = self
            .config
            .broadcast_addresses
            .iter()
            .map(|ip| SocketAddr::new(*ip, self.config.port))
            .collect();
        targets.extend(self.peers.dialup_addresses());
        targets.sort();
        targets.dedup();
        debug!(command = packet.command.0, targets = targets.len(), "broadcast");
        targets
            .into_iter()
            .map(|to| OutboundAction::SendPacket(to, bytes.clone()))
            .collect()
    }

    pub fn broadcast_entry(&self) -> Vec<OutboundAction> {
        self.broadcast(Mode::BrEntry)
    }

    pub fn broadcast_absence(&self) -> Vec<OutboundAction> {
        self.broadcast(Mode::BrAbsence)
    }

    pub fn broadcast_exit(&self) -> Vec<OutboundAction> {
        self.broadcast(Mode::BrExit)
    }

    pub fn on_packet(&self, from: SocketAddr, bytes: &[u8]) -> Vec<OutboundAction> {
        self.on_packet_at(from, bytes, Instant::now())
    }

    /// Handle one inbound datagram. Malformed packets, our own looped-back broadcasts and
    /// unknown commands are ignored.
    pub fn on_packet_at(&self, from: SocketAddr, bytes: &[u8], now: Instant) -> Vec<OutboundAction> {
        let packet = match decode_packet(bytes) {
            Ok(p) => p,
            Err(e) => {
                debug!(%from, error = %e, "dropping malformed packet");
                return Vec::new();
            }
        };
        if packet.login_name == self.config.login_name && packet.host_name == self.config.host_name {
            return Vec::new();
        }
        let Some(mode) = packet.command.mode() else {
            debug!(%from, command = packet.command.0, "ignoring unknown command");
            return Vec::new();
        };
        let key = PeerKey::new(packet.login_name.clone(), from);
        let mut actions = Vec::new();
        match mode {
            Mode::BrEntry => {
                if self.observe_presence(&packet, from, &mut actions).is_some() {
                    let answer = self
                        .packet(
                            self.next_packet_no(),
                            self.presence_command(Mode::AnsEntry),
                            self.config.user_name.clone(),
                        )
                        .with_extension(self.config.group_name.clone());
                    self.push_packet(from, &answer, &mut actions);
                }
            }
            Mode::AnsEntry | Mode::BrAbsence => {
                self.observe_presence(&packet, from, &mut actions);
            }
            Mode::BrExit => {
                if self.peers.remove(&key).is_some() {
                    info!(peer = %key, "peer left");
                }
            }
            Mode::SendMsg => self.on_send_msg(&packet, from, &mut actions),
            Mode::RecvMsg => {
                let Ok(packet_no) = packet.message.trim().parse::<u64>() else {
                    debug!(peer = %key, "malformed acknowledgement");
                    return actions;
                };
                if self.retry.acknowledge(packet_no, &key).is_some() {
                    debug!(peer = %key, packet_no, "delivered");
                    self.events.publish(CenterEvent::Delivered { packet_no, peer: key });
                }
            }
            Mode::ReadMsg => {
                if let Ok(packet_no) = packet.message.trim().parse::<u64>() {
                    self.events.publish(CenterEvent::SealOpened {
                        packet_no,
                        peer: key,
                    });
                }
                if packet.command.has(opt::READCHECK) {
                    self.reply(
                        from,
                        Command::new(Mode::AnsReadMsg),
                        packet.packet_no.to_string(),
                        &mut actions,
                    );
                }
            }
            Mode::AnsReadMsg | Mode::DelMsg => {
                debug!(peer = %key, command = packet.command.0, "read notice");
            }
            Mode::GetInfo => {
                self.reply(
                    from,
                    Command::new(Mode::SendInfo),
                    self.config.version.clone(),
                    &mut actions,
                );
            }
            Mode::SendInfo => {
                let version = packet.message.clone();
                self.peers.update(&key, |p| p.version = Some(version));
            }
            Mode::GetPubKey => self.on_get_pub_key(&packet, from, &mut actions),
            Mode::AnsPubKey => self.on_ans_pub_key(&packet, from),
            Mode::ReleaseFiles => {
                if let Ok(packet_no) = packet.message.trim().parse::<u64>() {
                    let released = self.registry.release(packet_no, &key, now);
                    debug!(peer = %key, packet_no, released, "attachments released");
                }
            }
            Mode::GetFileData | Mode::GetDirFiles | Mode::NoOperation => {
                debug!(%from, command = packet.command.0, "ignoring command on packet listener");
            }
        }
        actions
    }

    fn refused(&self, packet: &Packet, user_name: &str, from: SocketAddr) -> bool {
        let subject = RefuseSubject {
            user_name: if user_name.is_empty() {
                &packet.login_name
            } else {
                user_name
            },
            group_name: &packet.extension,
            host_name: &packet.host_name,
            login_name: &packet.login_name,
            address: from.ip(),
        };
        is_refused(&self.config.refuse, &subject)
    }

    /// Entry, entry answer and absence: refresh the sender's directory entry.
    fn observe_presence(&self, packet: &Packet, from: SocketAddr, actions: &mut Vec<OutboundAction>) -> Option<Peer> {
        let cmd = packet.command;
        let user_name = packet.message.trim_end();
        if self.refused(packet, user_name, from) {
            debug!(%from, login = %packet.login_name, "refused peer");
            self.peers
                .remove(&PeerKey::new(packet.login_name.clone(), from));
            return None;
        }
        let (peer, created) = self.peers.upsert(&packet.login_name, from, &packet.host_name, |p| {
            p.host_name = packet.host_name.clone();
            p.user_name = user_name.to_string();
            p.group_name = packet.extension.clone();
            p.absence = cmd.has(opt::ABSENCE);
            p.dialup = cmd.has(opt::DIALUP);
            p.attachment = cmd.has(opt::FILEATTACH);
            p.encryption = cmd.has(opt::ENCRYPT);
            p.ext_encryption = cmd.has(opt::ENCEXTMSG);
            p.utf8 = cmd.has(opt::UTF8) || cmd.has(opt::CAPUTF8);
        });
        if created {
            info!(peer = %peer.key(), name = peer.display_name(), "peer joined");
        }
        if let Some(crypto) = &self.crypto {
            if peer.encryption && peer.public_key.is_none() {
                self.reply(
                    from,
                    Command::new(Mode::GetPubKey),
                    crypto.capability().to_hex(),
                    actions,
                );
            }
        }
        Some(peer)
    }

    /// Known peer, or a new one created from a non-presence packet unless refused.
    fn ensure_peer(&self, packet: &Packet, from: SocketAddr) -> Option<Peer> {
        if let Some(peer) = self.peers.find(&packet.login_name, from) {
            return Some(peer);
        }
        if self.refused(packet, "", from) {
            debug!(%from, login = %packet.login_name, "refused peer");
            return None;
        }
        let (peer, _) = self
            .peers
            .upsert(&packet.login_name, from, &packet.host_name, |_| {});
        Some(peer)
    }

    fn on_get_pub_key(&self, packet: &Packet, from: SocketAddr, actions: &mut Vec<OutboundAction>) {
        let Some(crypto) = &self.crypto else {
            return;
        };
        let requested = packet.message.split(':').next().unwrap_or_default();
        let Some(theirs) = CryptoCapability::from_hex(requested) else {
            debug!(%from, "malformed public key request");
            return;
        };
        let Some(size) = crypto.capability().intersect(&theirs).key_size() else {
            debug!(%from, "no common key size");
            return;
        };
        let answer = format!(
            "{}:{}",
            crypto.capability().to_hex(),
            crypto.public_key(size).to_wire()
        );
        self.reply(from, Command::new(Mode::AnsPubKey), answer, actions);
    }

    fn on_ans_pub_key(&self, packet: &Packet, from: SocketAddr) {
        let Some(crypto) = &self.crypto else {
            return;
        };
        let parsed = packet.message.split_once(':').and_then(|(cap, key)| {
            Some((CryptoCapability::from_hex(cap)?, PublicKey::from_wire(key)?))
        });
        let Some((theirs, key)) = parsed else {
            debug!(%from, "malformed public key answer");
            return;
        };
        if self.ensure_peer(packet, from).is_none() {
            return;
        }
        let Some(size) = key.key_size() else {
            debug!(%from, "unsupported public key size");
            return;
        };
        // Negotiate only the key size actually delivered.
        let offered = CryptoCapability {
            rsa_1024: theirs.rsa_1024 && size == KeySize::Rsa1024,
            rsa_2048: theirs.rsa_2048 && size == KeySize::Rsa2048,
            ..theirs
        };
        let negotiated = crypto.capability().intersect(&offered);
        let peer_key = PeerKey::new(packet.login_name.clone(), from);
        self.peers.update(&peer_key, |p| {
            p.encryption = true;
            p.crypto = negotiated;
            p.public_key = Some(key);
        });
        debug!(peer = %peer_key, capability = %negotiated.to_hex(), "public key stored");
    }

    /// Returns false if this (peer, packet) pair was already accepted recently.
    fn remember(&self, key: &PeerKey, packet_no: u64) -> bool {
        let mut recent = lock(&self.recent);
        if recent.iter().any(|(k, n)| *n == packet_no && k == key) {
            return false;
        }
        if recent.len() == RECENT_PACKETS {
            recent.pop_front();
        }
        recent.push_back((key.clone(), packet_no));
        true
    }

    fn on_send_msg(&self, packet: &Packet, from: SocketAddr, actions: &mut Vec<OutboundAction>) {
        let Some(peer) = self.ensure_peer(packet, from) else {
            return;
        };
        let cmd = packet.command;
        let key = peer.key().clone();
        let broadcast = cmd.has(opt::BROADCAST);
        let auto_reply = cmd.has(opt::AUTORET);
        if cmd.has(opt::SENDCHECK) && !broadcast && !auto_reply {
            self.reply(
                from,
                Command::new(Mode::RecvMsg),
                packet.packet_no.to_string(),
                actions,
            );
        }
        if !self.remember(&key, packet.packet_no) {
            debug!(peer = %key, packet_no = packet.packet_no, "duplicate message");
            return;
        }
        let (text, security, doubt) = self.open_payload(packet, &peer);
        let (clipboards, attachments) = self.parse_attachments(packet, &key);
        let absence = lock(&self.absence).clone();
        if let Some(reply) = &absence {
            if !broadcast && !auto_reply {
                self.reply(
                    from,
                    Command::new(Mode::SendMsg).with(opt::AUTORET | opt::UTF8),
                    reply.clone(),
                    actions,
                );
            }
        }
        let locked = cmd.has(opt::PASSWORD);
        let message = InboundMessage {
            packet_no: packet.packet_no,
            received_at: SystemTime::now(),
            sender: peer,
            text,
            security,
            doubt,
            sealed: cmd.has(opt::SECRET),
            locked,
            multicast: cmd.has(opt::MULTICAST),
            broadcast,
            absence: absence.is_some(),
            auto_reply,
            attachments,
            clipboards,
            need_log: !locked,
        };
        if message.need_log {
            if let Some(log) = &self.log {
                log.record_inbound(&message);
            }
        }
        info!(peer = %key, packet_no = packet.packet_no, doubt, "message received");
        self.events
            .publish(CenterEvent::MessageReceived(Box::new(message)));
    }

    /// Decrypt when the packet says it is encrypted. Failure keeps the raw text and sets doubt.
    fn open_payload(&self, packet: &Packet, peer: &Peer) -> (String, SecurityLevel, bool) {
        if !packet.command.has(opt::ENCRYPT) {
            return (packet.message.clone(), SecurityLevel::None, false);
        }
        let Some(crypto) = &self.crypto else {
            warn!(peer = %peer.key(), "encrypted message but encryption is unavailable");
            return (packet.message.clone(), SecurityLevel::None, true);
        };
        match crypto.unseal(&packet.message, peer.public_key.as_ref()) {
            Ok(opened) => {
                let valid = opened.signature == SignatureCheck::Valid;
                let doubt = opened.signature == SignatureCheck::Invalid;
                if doubt {
                    warn!(peer = %peer.key(), "signature did not verify");
                }
                (opened.text, SecurityLevel::of(&opened.capability, valid), doubt)
            }
            Err(e) => {
                warn!(peer = %peer.key(), error = %e, "could not open encrypted message");
                (packet.message.clone(), SecurityLevel::None, true)
            }
        }
    }

    /// (clipboards, other attachments).
    fn parse_attachments(&self, packet: &Packet, key: &PeerKey) -> (Vec<RecvAttachment>, Vec<RecvAttachment>) {
        if !packet.command.has(opt::FILEATTACH) || packet.extension.is_empty() {
            return (Vec::new(), Vec::new());
        }
        match decode_descriptors(&packet.extension) {
            Ok(list) => list
                .into_iter()
                .map(RecvAttachment::new)
                .partition(|a| a.attachment.is_clipboard()),
            Err(e) => {
                warn!(peer = %key, error = %e, "bad attachment descriptor");
                (Vec::new(), Vec::new())
            }
        }
    }

    pub fn send(&self, message: &OutboundMessage, recipients: &[PeerKey]) -> SendReport {
        self.send_at(message, recipients, Instant::now())
    }

    /// Encode, encrypt where negotiated, register for retry and queue one packet per recipient.
    /// All recipients share one packet number; failures are reported per recipient.
    pub fn send_at(&self, message: &OutboundMessage, recipients: &[PeerKey], now: Instant) -> SendReport {
        let packet_no = self.next_packet_no();
        let mut attachments = message.attachments.clone();
        for (id, a) in (0u32..).zip(attachments.iter_mut()) {
            a.attachment.file_id = id;
        }
        let descriptors: Vec<Attachment> = attachments.iter().map(|a| a.attachment.clone()).collect();
        let extension = encode_descriptors(&descriptors);
        let mut report = SendReport {
            packet_no,
            actions: Vec::new(),
            results: Vec::new(),
        };
        let mut sent_to = Vec::new();
        let mut sent_peers = Vec::new();
        for key in recipients {
            let result = self.send_one(
                message,
                packet_no,
                &extension,
                key,
                recipients.len() > 1,
                now,
                &mut report.actions,
            );
            match result {
                Ok(peer) => {
                    sent_to.push(key.clone());
                    sent_peers.push(peer);
                    report.results.push((key.clone(), Ok(())));
                }
                Err(e) => {
                    warn!(peer = %key, packet_no, error = %e, "send failed");
                    report.results.push((key.clone(), Err(e)));
                }
            }
        }
        self.registry.register(packet_no, &attachments, &sent_to);
        if !sent_peers.is_empty() {
            if let Some(log) = &self.log {
                let logged = OutboundMessage {
                    packet_no,
                    attachments,
                    ..message.clone()
                };
                log.record_outbound(&logged, &sent_peers);
            }
        }
        report
    }

    #[allow(clippy::too_many_arguments)]
    fn send_one(
        &self,
        message: &OutboundMessage,
        packet_no: u64,
        extension: &str,
        key: &PeerKey,
        multicast: bool,
        now: Instant,
        actions: &mut Vec<OutboundAction>,
    ) -> Result<Peer, SendError> {
        let peer = self
            .peers
            .get(key)
            .ok_or_else(|| SendError::UnknownPeer(key.clone()))?;
        let mut command = Command::new(Mode::SendMsg).with(opt::SENDCHECK | opt::UTF8);
        if message.sealed {
            command = command.with(opt::SECRET | opt::READCHECK);
        }
        if message.locked {
            command = command.with(opt::PASSWORD);
        }
        if multicast {
            command = command.with(opt::MULTICAST);
        }
        if !extension.is_empty() {
            command = command.with(opt::FILEATTACH);
        }
        // No mutual cipher: the body goes out in clear, PASSWORD stays set.
        let text = match self.seal_for(&peer, &message.text) {
            Ok(Some(sealed)) => {
                command = command.with(opt::ENCRYPT);
                sealed
            }
            Ok(None) => message.text.clone(),
            Err(e) if message.locked => return Err(e),
            Err(e) => {
                warn!(peer = %key, error = %e, "encryption failed, sending in clear");
                message.text.clone()
            }
        };
        let packet = self
            .packet(packet_no, command, text)
            .with_extension(extension);
        let bytes = encode_packet(&packet)?;
        self.retry
            .register(packet_no, command, key.clone(), packet.message, packet.extension, now);
        actions.push(OutboundAction::SendPacket(key.address, bytes));
        Ok(peer)
    }

    fn seal_for(&self, peer: &Peer, text: &str) -> Result<Option<String>, SendError> {
        let (Some(crypto), Some(key)) = (&self.crypto, &peer.public_key) else {
            return Ok(None);
        };
        if !peer.crypto.support_encryption() {
            return Ok(None);
        }
        Ok(Some(crypto.seal(text, key, &peer.crypto)?))
    }

    /// Tell the sender we opened its sealed message.
    pub fn send_open_seal_message(&self, message: &InboundMessage) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        self.reply(
            message.sender.address(),
            Command::new(Mode::ReadMsg),
            message.packet_no.to_string(),
            &mut actions,
        );
        actions
    }

    /// Tell the sender we no longer need the attachments of `packet_no`.
    pub fn send_release_attachment_message(&self, peer: &PeerKey, packet_no: u64) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        self.reply(
            peer.address,
            Command::new(Mode::ReleaseFiles),
            packet_no.to_string(),
            &mut actions,
        );
        actions
    }

    /// Outbound attachments still waiting for recipients.
    pub fn sent_attachments(&self) -> Vec<PendingAttachment> {
        self.registry.list()
    }

    pub fn remove_attachment(&self, packet_no: u64, file_id: u32) -> bool {
        self.registry.remove(packet_no, file_id)
    }

    /// Prepare a download of `attachments` (from the message `packet_no` sent by `from`) into
    /// `save_dir`. The host drives the returned session on its own worker.
    pub fn start_download(
        &self,
        attachments: Vec<RecvAttachment>,
        packet_no: u64,
        from: &PeerKey,
        save_dir: impl Into<PathBuf>,
        listener: Arc<dyn DownloadListener>,
    ) -> DownloadSession {
        let context = Arc::new(DownloaderContext::new(packet_no, from.clone(), save_dir.into()));
        lock(&self.downloads).push(context.clone());
        info!(peer = %from, packet_no, id = %context.id(), "download started");
        DownloadSession::new(context, listener, attachments)
    }

    /// Cancel a running download. The worker stops before its next read or write.
    pub fn stop_download(&self, context: &DownloaderContext) -> bool {
        let downloads = lock(&self.downloads);
        match downloads.iter().find(|c| c.id() == context.id()) {
            Some(c) => {
                c.cancel();
                true
            }
            None => false,
        }
    }

    pub fn downloads(&self) -> Vec<Arc<DownloaderContext>> {
        lock(&self.downloads).clone()
    }

    /// Request packet a download worker sends to the file endpoint.
    pub fn transfer_packet(&self, request: &TransferRequest) -> Result<Vec<u8>, PacketEncodeError> {
        let packet = self.packet(self.next_packet_no(), request.command(), request.message());
        encode_packet(&packet)
    }

    /// Validate a request received on the file endpoint. Only a pending recipient at the
    /// requesting address may download.
    pub fn serve_lookup(&self, bytes: &[u8], from: IpAddr) -> Option<ServeTicket> {
        let packet = decode_packet(bytes).ok()?;
        let request = TransferRequest::parse(packet.command, &packet.message)?;
        let (attachment, recipient) =
            self.registry
                .lookup_for(request.packet_no, request.file_id, from)?;
        if request.directory != attachment.attachment.is_directory() {
            return None;
        }
        Some(ServeTicket {
            request,
            attachment,
            recipient,
        })
    }

    /// The recipient received the whole attachment.
    pub fn serve_completed(&self, ticket: &ServeTicket) -> bool {
        self.registry.complete(
            ticket.request.packet_no,
            ticket.request.file_id,
            &ticket.recipient,
            Instant::now(),
        )
    }

    pub fn tick(&self) -> Vec<OutboundAction> {
        self.tick_at(Instant::now())
    }

    /// Periodic driver: resend due packets, fail exhausted ones, dispose released attachments.
    pub fn tick_at(&self, now: Instant) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        let sweep = self.retry.sweep(now);
        for entry in sweep.resend {
            debug!(peer = %entry.recipient, packet_no = entry.packet_no, attempt = entry.attempts, "resending");
            let packet = self
                .packet(entry.packet_no, entry.command, entry.message)
                .with_extension(entry.extension);
            self.push_packet(entry.recipient.address, &packet, &mut actions);
        }
        for entry in sweep.failed {
            warn!(peer = %entry.recipient, packet_no = entry.packet_no, "delivery failed");
            self.events.publish(CenterEvent::DeliveryFailed {
                packet_no: entry.packet_no,
                peer: entry.recipient,
            });
        }
        self.registry.dispose_expired(now);
        lock(&self.downloads).retain(|c| !c.state().is_terminal());
        actions
    }
}
