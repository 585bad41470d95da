//! File endpoint: TCP server answering GETFILEDATA / GETDIRFILES for pending attachments.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ipmsg_core::transfer::{directory_entries, encode_stream_header};
use ipmsg_core::{AttachmentSource, MessageCenter, ServeTicket};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REQUEST_LEN: usize = 2048;

/// Accept connections until the listener fails; each connection serves one request.
pub async fn run_file_server(listener: TcpListener, center: Arc<MessageCenter>) {
    loop {
        match listener.accept().await {
            Ok((stream, from)) => {
                let center = center.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, from, center).await {
                        warn!(%from, error = %e, "file transfer failed");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "file endpoint accept failed");
                break;
            }
        }
    }
}

async fn serve_connection(mut stream: TcpStream, from: SocketAddr, center: Arc<MessageCenter>) -> anyhow::Result<()> {
    let request = tokio::time::timeout(REQUEST_TIMEOUT, read_request(&mut stream))
        .await
        .context("request timed out")??;
    let Some(ticket) = center.serve_lookup(&request, from.ip()) else {
        debug!(%from, "rejected file request");
        return Ok(());
    };
    let name = ticket.attachment.attachment.name.clone();
    if ticket.request.directory {
        let AttachmentSource::Path(root) = &ticket.attachment.source else {
            anyhow::bail!("directory request for in-memory attachment");
        };
        send_directory(&mut stream, root).await?;
    } else {
        send_file(&mut stream, &ticket).await?;
    }
    stream.flush().await?;
    stream.shutdown().await?;
    center.serve_completed(&ticket);
    info!(peer = %ticket.recipient, packet_no = ticket.request.packet_no, name = %name, "attachment sent");
    Ok(())
}

/// Read one request: through its first NUL, to end of stream, or up to the size cap.
async fn read_request<R: AsyncRead + Unpin>(src: &mut R) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];
    while !buf.contains(&0) && buf.len() < MAX_REQUEST_LEN {
        let n = src.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    buf.truncate(MAX_REQUEST_LEN);
    Ok(buf)
}

async fn send_file<W: AsyncWrite + Unpin>(out: &mut W, ticket: &ServeTicket) -> anyhow::Result<()> {
    let offset = ticket.request.offset;
    let size = ticket.attachment.attachment.size;
    if offset > size {
        anyhow::bail!("offset {offset} beyond size {size}");
    }
    match &ticket.attachment.source {
        AttachmentSource::Clipboard(data) => {
            let start = usize::try_from(offset)?;
            out.write_all(data.get(start..).unwrap_or_default()).await?;
        }
        AttachmentSource::Path(path) => {
            let mut file = tokio::fs::File::open(path).await?;
            file.seek(std::io::SeekFrom::Start(offset)).await?;
            copy_exact(&mut file, out, size - offset).await?;
        }
    }
    Ok(())
}

/// Stream the directory as headers and file contents in depth-first order.
async fn send_directory<W: AsyncWrite + Unpin>(out: &mut W, root: &Path) -> anyhow::Result<()> {
    let root = root.to_path_buf();
    let entries = tokio::task::spawn_blocking(move || directory_entries(&root)).await??;
    for entry in entries {
        out.write_all(&encode_stream_header(&entry.attachment)?).await?;
        if let Some(path) = &entry.source {
            let mut file = tokio::fs::File::open(path).await?;
            copy_exact(&mut file, out, entry.attachment.size).await?;
        }
    }
    Ok(())
}

/// The announced size is binding; a file that shrank since is an error.
async fn copy_exact<R, W>(src: &mut R, out: &mut W, len: u64) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut src.take(len), out).await?;
    if copied != len {
        anyhow::bail!("file shrank: sent {copied} of {len} bytes");
    }
    Ok(())
}
