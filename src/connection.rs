//! Per-connection echo handler.
//!
//! Each accepted connection gets its own task running [`handle_connection`].
//! The handler reads up to [`CHUNK_SIZE`] bytes at a time and writes the same
//! bytes straight back, strictly in order, until the peer closes, an I/O error
//! occurs, or the server stops running.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Maximum number of bytes read from a connection per round.
pub const CHUNK_SIZE: usize = 1024;

/// Serve one client until it disconnects.
///
/// Errors are logged and end this connection only. The stream is always
/// shut down and a disconnect is logged, whichever way the loop ended.
pub async fn handle_connection<S>(mut stream: S, peer: SocketAddr, running: Arc<AtomicBool>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    info!("Client connected: {peer}");

    if let Err(e) = echo_loop(&mut stream, peer, &running).await {
        warn!("Client error [{peer}]: {e}");
    }

    if let Err(e) = stream.shutdown().await {
        debug!("Shutdown error [{peer}]: {e}");
    }
    drop(stream);
    info!("Client disconnected: {peer}");
}

async fn echo_loop<S>(stream: &mut S, peer: SocketAddr, running: &AtomicBool) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; CHUNK_SIZE];

    // Only checked between reads; a blocked read is not interrupted by stop
    while running.load(Ordering::Acquire) {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            // Peer closed its write side
            break;
        }

        let data = &buf[..n];
        let text = String::from_utf8_lossy(data);
        let text = text.trim();
        info!("Received [{peer}]: {text}");

        stream.write_all(data).await?;
        info!("Sent [{peer}]: {text}");
    }

    Ok(())
}
