// IP Messenger daemon for Linux: packet listener, file endpoint, download workers.

mod config;
mod download;
mod log;
mod server;
mod transport;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use anyhow::Context;
use ipmsg_core::{CenterEvent, CryptoEngine, InboundMessage, MessageCenter, OutboundMessage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::server::MessageServer;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("ipmsg-linux {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load().context("loading configuration")?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let crypto = if cfg.disable_encryption {
        None
    } else {
        match tokio::task::spawn_blocking(CryptoEngine::startup).await? {
            Ok(engine) => Some(Arc::new(engine)),
            Err(e) => {
                warn!(error = %e, "encryption unavailable, running plaintext only");
                None
            }
        }
    };

    let mut center = MessageCenter::new(cfg.center(), crypto);
    if let Some(path) = &cfg.log_file {
        match log::JsonLog::open(path) {
            Ok(sink) => center = center.with_log(Arc::new(sink)),
            Err(e) => warn!(path = %path.display(), error = %e, "message log disabled"),
        }
    }
    let center = Arc::new(center);

    let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), cfg.port);
    let server = Arc::new(MessageServer::new(center.clone(), bind));
    if !server.startup_server().await {
        anyhow::bail!("cannot listen on port {}", cfg.port);
    }
    server.dispatch(center.broadcast_entry()).await;

    let events = center.subscribe();
    let handle = tokio::runtime::Handle::current();
    let drain_center = center.clone();
    let download_dir = cfg.download_dir.clone();
    tokio::task::spawn_blocking(move || drain_events(events, drain_center, download_dir, handle));

    tokio::select! {
        res = shutdown_signal() => res?,
        res = command_loop(server.clone()) => res?,
    }

    info!("shutting down");
    server.dispatch(center.broadcast_exit()).await;
    server.shutdown_server().await;
    Ok(())
}

/// Log center events; attachments of received messages are downloaded into `download_dir`.
fn drain_events(events: mpsc::Receiver<CenterEvent>, center: Arc<MessageCenter>, download_dir: PathBuf, rt: tokio::runtime::Handle) {
    for event in events {
        match event {
            CenterEvent::MessageReceived(m) => {
                print_message(&m);
                start_downloads(&center, &m, &download_dir, &rt);
            }
            CenterEvent::Delivered { packet_no, peer } => info!(%peer, packet_no, "delivered"),
            CenterEvent::DeliveryFailed { packet_no, peer } => {
                warn!(%peer, packet_no, "delivery failed")
            }
            CenterEvent::SealOpened { packet_no, peer } => info!(%peer, packet_no, "seal opened"),
            CenterEvent::PeerListChanged | CenterEvent::AttachmentListChanged => {}
        }
    }
}

fn print_message(m: &InboundMessage) {
    let mut flags = Vec::new();
    if m.sealed {
        flags.push("sealed");
    }
    if m.auto_reply {
        flags.push("auto-reply");
    }
    if m.doubt {
        flags.push("UNVERIFIED");
    }
    println!(
        "[{}] {} ({:?}{}{}): {}",
        m.packet_no,
        m.sender.display_name(),
        m.security,
        if flags.is_empty() { "" } else { ", " },
        flags.join(", "),
        m.text
    );
}

fn start_downloads(center: &Arc<MessageCenter>, m: &InboundMessage, dir: &std::path::Path, rt: &tokio::runtime::Handle) {
    let targets: Vec<_> = m.attachments.iter().chain(&m.clipboards).cloned().collect();
    if targets.is_empty() {
        return;
    }
    let session = center.start_download(
        targets,
        m.packet_no,
        m.sender.key(),
        dir,
        Arc::new(download::LogListener),
    );
    rt.spawn(download::run_download(center.clone(), session));
}

/// Console command.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    List,
    Send { index: usize, text: String },
    Absent(Option<String>),
    Present,
    Quit,
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match word {
        "/list" => Some(Command::List),
        "/quit" => Some(Command::Quit),
        "/present" => Some(Command::Present),
        "/absent" => Some(Command::Absent((!rest.is_empty()).then(|| rest.to_string()))),
        "/send" => {
            let (n, text) = rest.split_once(' ')?;
            let index = n.parse().ok()?;
            Some(Command::Send {
                index,
                text: text.trim().to_string(),
            })
        }
        _ => None,
    }
}

/// Read console commands until `/quit` or end of input.
async fn command_loop(server: Arc<MessageServer>) -> anyhow::Result<()> {
    let center = server.center().clone();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Some(Command::List) => {
                for (i, peer) in center.peers().list().iter().enumerate() {
                    println!(
                        "{i:3} {} [{}] {}{}",
                        peer.display_name(),
                        peer.group_name,
                        peer.key(),
                        if peer.absence { " (away)" } else { "" }
                    );
                }
            }
            Some(Command::Send { index, text }) => match center.peers().list().get(index) {
                Some(peer) => {
                    let report = center.send(&OutboundMessage::new(text), &[peer.key().clone()]);
                    for (peer, err) in report.failed() {
                        error!(%peer, error = %err, "send failed");
                    }
                    server.dispatch(report.actions).await;
                }
                None => println!("no peer {index}; try /list"),
            },
            Some(Command::Absent(text)) => {
                server.dispatch(center.set_absence(Some(text.unwrap_or_default()))).await
            }
            Some(Command::Present) => server.dispatch(center.set_absence(None)).await,
            Some(Command::Quit) => return Ok(()),
            None => println!("commands: /list, /send <n> <text>, /absent [text], /present, /quit"),
        }
    }
    // Stdin closed (e.g. running under systemd): keep serving until a signal arrives.
    std::future::pending::<()>().await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_console_commands() {
        assert_eq!(parse_command("/list"), Some(Command::List));
        assert_eq!(
            parse_command("/send 2 hello there "),
            Some(Command::Send {
                index: 2,
                text: "hello there".into()
            })
        );
        assert_eq!(parse_command("/send x hi"), None);
        assert_eq!(parse_command("/send 1"), None);
        assert_eq!(parse_command("/absent"), Some(Command::Absent(None)));
        assert_eq!(
            parse_command("/absent at lunch"),
            Some(Command::Absent(Some("at lunch".into())))
        );
        assert_eq!(parse_command("hello"), None);
    }
}
