//! Raft RPCs over TCP.
//!
//! Each message is one JSON document on its own line. A client opens a
//! connection per call, writes the request and waits for a single reply
//! line. The server answers any number of requests on a connection, one at
//! a time, until the peer closes it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::NodeId;
use crate::error::Result;
use crate::raft::message::{RaftRequest, RaftResponse};
use crate::transport::{dispatch, RaftService, RaftTransport};

/// Largest frame a peer may send, newline excluded.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Read one frame of at most [`MAX_FRAME_BYTES`]. `None` at end of stream.
pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    read_message_limited(reader, MAX_FRAME_BYTES).await
}

/// Like [`read_message`] with an explicit frame limit. A longer line is an
/// `InvalidData` error; the connection is not usable afterwards.
pub async fn read_message_limited<R, T>(reader: &mut R, max_len: usize) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        // One byte over the limit leaves room for the newline.
        let read = (&mut *reader)
            .take(max_len as u64 + 1)
            .read_line(&mut line)
            .await?;
        if read == 0 {
            return Ok(None);
        }
        if !line.ends_with('\n') && read > max_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds {max_len} bytes"),
            ));
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }
        let message = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(message));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Client for one peer reachable at `addr`.
pub struct TcpTransport {
    peer_id: NodeId,
    addr: String,
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(peer_id: NodeId, addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            peer_id,
            addr: addr.into(),
            timeout,
        }
    }

    async fn round_trip(&self, request: &RaftRequest) -> io::Result<RaftResponse> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        write_message(&mut writer, request).await?;
        read_message(&mut reader).await?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed before reply")
        })
    }
}

#[async_trait]
impl RaftTransport for TcpTransport {
    async fn call(&self, request: RaftRequest) -> Option<RaftResponse> {
        let method = request.method();
        match tokio::time::timeout(self.timeout, self.round_trip(&request)).await {
            Ok(Ok(response)) => Some(response),
            Ok(Err(e)) => {
                tracing::trace!(peer_id = self.peer_id, addr = %self.addr, method, error = %e, "RPC failed");
                None
            }
            Err(_) => {
                tracing::trace!(peer_id = self.peer_id, addr = %self.addr, method, "RPC timed out");
                None
            }
        }
    }
}

/// Bind `addr` and answer Raft RPCs with `service` until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    service: Arc<dyn RaftService>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_listener(listener, service, shutdown).await
}

/// Like [`serve`] on an already bound listener.
pub async fn serve_listener(
    listener: TcpListener,
    service: Arc<dyn RaftService>,
    shutdown: CancellationToken,
) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "Raft RPC server listening");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Raft RPC server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                let service = service.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, service, shutdown).await {
                        tracing::debug!(peer = %peer_addr, error = %e, "Connection closed with error");
                    }
                });
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    service: Arc<dyn RaftService>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let request: RaftRequest = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            message = read_message(&mut reader) => match message? {
                Some(request) => request,
                None => return Ok(()),
            },
        };
        let response = dispatch(service.as_ref(), request).await;
        write_message(&mut writer, &response).await?;
    }
}
