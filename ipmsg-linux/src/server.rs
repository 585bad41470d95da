//! Network host for MessageCenter: UDP packet listener, file endpoint and timer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ipmsg_core::{MessageCenter, OutboundAction};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::transport;

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const MAX_DATAGRAM: usize = 65536;

struct Running {
    socket: Arc<UdpSocket>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct MessageServer {
    center: Arc<MessageCenter>,
    bind: SocketAddr,
    running: Mutex<Option<Running>>,
}

impl MessageServer {
    pub fn new(center: Arc<MessageCenter>, bind: SocketAddr) -> Self {
        Self {
            center,
            bind,
            running: Mutex::new(None),
        }
    }

    pub fn center(&self) -> &Arc<MessageCenter> {
        &self.center
    }

    /// Bind the UDP listener and the TCP file endpoint on the same port and start serving.
    /// Returns false if either bind fails; nothing is left running in that case.
    pub async fn startup_server(&self) -> bool {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return true;
        }
        let socket = match bind_udp(self.bind).await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                error!(addr = %self.bind, error = %e, "cannot bind packet listener");
                return false;
            }
        };
        let local = match socket.local_addr() {
            Ok(a) => a,
            Err(e) => {
                error!(error = %e, "cannot read listener address");
                return false;
            }
        };
        let listener = match TcpListener::bind(local).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = %local, error = %e, "cannot bind file endpoint");
                return false;
            }
        };
        let tasks = vec![
            tokio::spawn(recv_loop(socket.clone(), self.center.clone())),
            tokio::spawn(tick_loop(socket.clone(), self.center.clone())),
            tokio::spawn(transport::run_file_server(listener, self.center.clone())),
        ];
        info!(addr = %local, "server started");
        *running = Some(Running { socket, tasks });
        true
    }

    /// Stop all server tasks and release both endpoints.
    pub async fn shutdown_server(&self) {
        if let Some(running) = self.running.lock().await.take() {
            for task in running.tasks {
                task.abort();
            }
            info!("server stopped");
        }
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let running = self.running.lock().await;
        running.as_ref().and_then(|r| r.socket.local_addr().ok())
    }

    /// Transmit actions returned by the center. A no-op while stopped.
    pub async fn dispatch(&self, actions: Vec<OutboundAction>) {
        let socket = match self.running.lock().await.as_ref() {
            Some(r) => r.socket.clone(),
            None => {
                debug!(count = actions.len(), "server stopped, dropping packets");
                return;
            }
        };
        transmit(&socket, actions).await;
    }
}

async fn bind_udp(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr).await?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

async fn transmit(socket: &UdpSocket, actions: Vec<OutboundAction>) {
    for OutboundAction::SendPacket(to, bytes) in actions {
        if let Err(e) = socket.send_to(&bytes, to).await {
            warn!(%to, error = %e, "send failed");
        }
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, center: Arc<MessageCenter>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                let actions = center.on_packet(from, &buf[..n]);
                transmit(&socket, actions).await;
            }
            Err(e) => {
                warn!(error = %e, "receive failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn tick_loop(socket: Arc<UdpSocket>, center: Arc<MessageCenter>) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    loop {
        interval.tick().await;
        let actions = center.tick();
        transmit(&socket, actions).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipmsg_core::{CenterConfig, CenterEvent, OutboundMessage};
    use std::net::{IpAddr, Ipv4Addr};

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn server(login: &str) -> MessageServer {
        let center = MessageCenter::new(
            CenterConfig {
                login_name: login.into(),
                host_name: "test-host".into(),
                user_name: login.to_uppercase(),
                broadcast_addresses: Vec::new(),
                ..CenterConfig::default()
            },
            None,
        );
        MessageServer::new(Arc::new(center), SocketAddr::new(LOOPBACK, 0))
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn two_servers_exchange_entry_and_message() {
        let a = server("alice");
        let b = server("bob");
        assert!(a.startup_server().await);
        assert!(b.startup_server().await);
        let b_addr = b.local_addr().await.unwrap();
        let events = b.center().subscribe();

        // Broadcasts are disabled; announce directly to bob instead.
        let entry = a.center().broadcast_entry();
        assert!(entry.is_empty());
        let packet = ipmsg_core::Packet::new(
            a.center().next_packet_no(),
            "alice",
            "test-host",
            ipmsg_core::Command::new(ipmsg_core::Mode::BrEntry),
            "ALICE",
        );
        a.dispatch(vec![OutboundAction::SendPacket(
            b_addr,
            ipmsg_core::encode_packet(&packet).unwrap(),
        )])
        .await;
        wait_for(|| a.center().peers().find("bob", b_addr).is_some()).await;

        let bob = a.center().peers().find("bob", b_addr).unwrap();
        let report = a.center().send(&OutboundMessage::new("hi bob"), &[bob.key().clone()]);
        a.dispatch(report.actions).await;
        wait_for(|| a.center().retry().is_empty()).await;

        let text = events.try_iter().find_map(|e| match e {
            CenterEvent::MessageReceived(m) => Some(m.text),
            _ => None,
        });
        assert_eq!(text.as_deref(), Some("hi bob"));

        a.shutdown_server().await;
        b.shutdown_server().await;
        assert!(a.local_addr().await.is_none());
    }

    #[tokio::test]
    async fn port_in_use_reports_false() {
        let a = server("alice");
        assert!(a.startup_server().await);
        let taken = a.local_addr().await.unwrap();
        let b = MessageServer::new(a.center().clone(), taken);
        assert!(!b.startup_server().await);
        a.shutdown_server().await;
    }
}
