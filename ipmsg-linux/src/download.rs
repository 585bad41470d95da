//! Download worker: drives a `DownloadSession` over one TCP connection per target.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ipmsg_core::{DownloadError, DownloadListener, DownloadProgress, DownloadSession, MessageCenter};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Longest silence from the sender before the download fails.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Granularity of cancellation checks while waiting for data.
const POLL_INTERVAL: Duration = Duration::from_millis(250);
const READ_BUF: usize = 64 * 1024;

/// Run the session to its end. The session's listener sees exactly one `finished`.
pub async fn run_download(center: Arc<MessageCenter>, mut session: DownloadSession) -> Result<(), DownloadError> {
    session.begin();
    let addr = session.context().peer().address;
    match transfer_all(&center, &mut session, addr).await {
        Ok(()) => session.complete(),
        Err(e) => {
            session.fail(e.clone());
            Err(e)
        }
    }
}

async fn transfer_all(center: &MessageCenter, session: &mut DownloadSession, addr: SocketAddr) -> Result<(), DownloadError> {
    let mut connected = false;
    while let Some(request) = session.next_request()? {
        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| DownloadError::Timeout)?
            .map_err(|e| DownloadError::Connect(e.to_string()))?;
        if !connected {
            session.connected();
            connected = true;
        }
        let packet = center
            .transfer_packet(&request)
            .map_err(|e| DownloadError::Internal(e.to_string()))?;
        stream
            .write_all(&packet)
            .await
            .map_err(|e| DownloadError::Socket(e.to_string()))?;
        debug!(%addr, packet_no = request.packet_no, file_id = request.file_id, "requested attachment");

        let mut buf = vec![0u8; READ_BUF];
        let mut idle = Duration::ZERO;
        while !session.target_complete() {
            if session.context().is_cancelled() {
                return Err(DownloadError::UserStop);
            }
            let n = match tokio::time::timeout(POLL_INTERVAL, stream.read(&mut buf)).await {
                Err(_) => {
                    idle += POLL_INTERVAL;
                    if idle >= IDLE_TIMEOUT {
                        return Err(DownloadError::Timeout);
                    }
                    continue;
                }
                Ok(read) => read.map_err(|e| DownloadError::Communication(e.to_string()))?,
            };
            if n == 0 {
                return Err(DownloadError::Disconnected);
            }
            idle = Duration::ZERO;
            session.feed(&buf[..n])?;
        }
        session.close_target()?;
    }
    Ok(())
}

/// Reports progress through the log.
pub struct LogListener;

impl DownloadListener for LogListener {
    fn will_start(&self, p: &DownloadProgress) {
        info!(targets = p.total_targets, files = p.total_files, dirs = p.total_dirs, bytes = p.total_size, "download starting");
    }

    fn file_changed(&self, p: &DownloadProgress) {
        debug!(file = %p.current_file, "receiving");
    }

    fn finished(&self, p: &DownloadProgress, result: &Result<(), DownloadError>) {
        match result {
            Ok(()) => info!(files = p.downloaded_files, bytes = p.downloaded_size, "download complete"),
            Err(e) => warn!(error = %e, bytes = p.downloaded_size, "download ended"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::run_file_server;
    use ipmsg_core::{
        CenterConfig, DownloadState, InboundMessage, OutboundAction, OutboundMessage, SendAttachment,
    };
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    fn center(login: &str) -> Arc<MessageCenter> {
        Arc::new(MessageCenter::new(
            CenterConfig {
                login_name: login.into(),
                host_name: format!("{login}-pc"),
                ..CenterConfig::default()
            },
            None,
        ))
    }

    /// Alice offers `msg` to bob over loopback; returns what bob received and the sender's
    /// file endpoint address.
    async fn offer(alice: &Arc<MessageCenter>, bob: &MessageCenter, msg: OutboundMessage) -> (InboundMessage, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let alice_addr = listener.local_addr().unwrap();
        tokio::spawn(run_file_server(listener, alice.clone()));
        let (peer, _) = alice
            .peers()
            .upsert("bob", "127.0.0.1:2425".parse().unwrap(), "bob-pc", |_| {});
        let rx = bob.subscribe();
        let report = alice.send(&msg, &[peer.key().clone()]);
        for OutboundAction::SendPacket(_, bytes) in report.actions {
            bob.on_packet(alice_addr, &bytes);
        }
        let inbound = rx
            .try_iter()
            .find_map(|e| match e {
                ipmsg_core::CenterEvent::MessageReceived(m) => Some(*m),
                _ => None,
            })
            .unwrap();
        (inbound, alice_addr)
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Result<(), DownloadError>>>);

    impl DownloadListener for Recorder {
        fn finished(&self, _p: &DownloadProgress, result: &Result<(), DownloadError>) {
            self.0.lock().unwrap().push(result.clone());
        }
    }

    #[tokio::test]
    async fn downloads_file_and_directory_over_loopback() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), vec![b'x'; 100]).unwrap();
        let docs = src.path().join("docs");
        std::fs::create_dir(&docs).unwrap();
        std::fs::write(docs.join("b.txt"), vec![b'y'; 50]).unwrap();

        let alice = center("alice");
        let bob = center("bob");
        let msg = OutboundMessage::new("files")
            .with_attachment(SendAttachment::from_path(src.path().join("a.txt")).unwrap())
            .with_attachment(SendAttachment::from_path(&docs).unwrap());
        let (inbound, _) = offer(&alice, &bob, msg).await;
        assert_eq!(inbound.attachments.len(), 2);

        let dest = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let session = bob.start_download(
            inbound.attachments.clone(),
            inbound.packet_no,
            inbound.sender.key(),
            dest.path(),
            recorder.clone(),
        );
        let ctx = session.context().clone();
        run_download(bob.clone(), session).await.unwrap();

        assert_eq!(std::fs::read(dest.path().join("a.txt")).unwrap(), vec![b'x'; 100]);
        assert_eq!(std::fs::read(dest.path().join("docs/b.txt")).unwrap(), vec![b'y'; 50]);
        let progress = ctx.progress();
        assert_eq!(progress.state, DownloadState::Completed);
        assert_eq!(progress.downloaded_size, 150);
        assert_eq!(*recorder.0.lock().unwrap(), vec![Ok(())]);
        assert!(alice.sent_attachments().iter().all(|a| a.remaining.is_empty()));
    }

    #[tokio::test]
    async fn cancelled_download_stops() {
        let alice = center("alice");
        let bob = center("bob");
        let msg = OutboundMessage::new("clip").with_attachment(SendAttachment::clipboard("s.png", vec![1; 10], 0));
        let (inbound, _) = offer(&alice, &bob, msg).await;
        let recorder = Arc::new(Recorder::default());
        let dest = tempfile::tempdir().unwrap();
        let session = bob.start_download(
            inbound.clipboards.clone(),
            inbound.packet_no,
            inbound.sender.key(),
            dest.path(),
            recorder.clone(),
        );
        assert!(bob.stop_download(session.context()));
        let ctx = session.context().clone();
        let result = run_download(bob.clone(), session).await;
        assert_eq!(result, Err(DownloadError::UserStop));
        assert_eq!(ctx.state(), DownloadState::Stopped);
        assert_eq!(*recorder.0.lock().unwrap(), vec![Err(DownloadError::UserStop)]);
    }

    #[tokio::test]
    async fn unreachable_sender_fails_to_connect() {
        let bob = center("bob");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);
        let dest = tempfile::tempdir().unwrap();
        let session = bob.start_download(
            vec![ipmsg_core::RecvAttachment::new(ipmsg_core::Attachment::regular(0, "a.txt", 5))],
            1,
            &ipmsg_core::PeerKey::new("alice", dead),
            dest.path(),
            Arc::new(ipmsg_core::NoopListener),
        );
        let result = run_download(bob, session).await;
        assert!(matches!(result, Err(DownloadError::Connect(_))));
    }
}
