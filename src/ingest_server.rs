//! TCP ingestion server for bridge-device telemetry.
//!
//! Bridges keep one socket open and write one binary frame at a time; the
//! server answers every frame with a single status byte on the same
//! connection, written only after the reading store call has resolved.
//! Connections share nothing but the reading store handle, so one bridge's
//! fault never touches another's stream.

use crate::config::ServerConfig;
use crate::frame::{self, FrameError};
use crate::store::{ReadingKey, ReadingStore};
use anyhow::{Context, Result};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Ack byte for a stored (or already stored) frame.
pub const ACK_SUCCESS: u8 = b'2';

/// Ack byte for a rejected frame or a failed/timed-out store write.
pub const ACK_FAILURE: u8 = b'5';

/// Listener plus the shared state every connection task gets a handle to.
pub struct IngestServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    readings: Arc<dyn ReadingStore>,
    store_timeout: Duration,
    read_buffer_bytes: usize,
    shutdown: CancellationToken,
    connections: Arc<AtomicU64>,
}

impl IngestServer {
    /// Bind the configured address. The server does not accept until
    /// [`run`](Self::run) is called.
    pub async fn bind(
        config: &ServerConfig,
        readings: Arc<dyn ReadingStore>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind)
            .await
            .with_context(|| format!("Failed to bind {}", config.bind))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to read listener address")?;

        Ok(Self {
            listener,
            local_addr,
            readings,
            store_timeout: config.store_timeout(),
            read_buffer_bytes: config.read_buffer_bytes,
            shutdown,
            connections: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Actual bound address; differs from the configured one when binding
    /// port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept loop. Returns after the shutdown token fires; connection
    /// tasks observe the same token and drain on their own.
    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr, "Ingestion server listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Ingestion server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let active = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
                            debug!(peer = %peer, active, "Accepted bridge connection");
                            metrics::counter!("gateway.connections.accepted").increment(1);
                            metrics::gauge!("gateway.connections.active").increment(1.0);

                            let readings = self.readings.clone();
                            let shutdown = self.shutdown.clone();
                            let connections = self.connections.clone();
                            let store_timeout = self.store_timeout;
                            let read_buffer_bytes = self.read_buffer_bytes;
                            tokio::spawn(async move {
                                handle_connection(
                                    stream,
                                    peer,
                                    readings,
                                    store_timeout,
                                    read_buffer_bytes,
                                    shutdown,
                                )
                                .await;
                                connections.fetch_sub(1, Ordering::Relaxed);
                                metrics::gauge!("gateway.connections.active").decrement(1.0);
                            });
                        }
                        Err(e) => {
                            // Transient accept failures (fd exhaustion and
                            // the like) must not take the listener down.
                            warn!(error = %e, "Accept failed");
                        }
                    }
                }
            }
        }
    }
}

/// Per-connection loop: read a chunk, treat it as one frame, answer with
/// one status byte. Any socket fault ends only this connection.
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    readings: Arc<dyn ReadingStore>,
    store_timeout: Duration,
    read_buffer_bytes: usize,
    shutdown: CancellationToken,
) {
    let mut buf = BytesMut::with_capacity(read_buffer_bytes);

    loop {
        buf.clear();
        // TODO: if a bridge firmware revision ever fragments frames across
        // writes, replace chunk-per-frame with a carry buffer driven by the
        // declared length byte.
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(peer = %peer, "Closing connection for shutdown");
                return;
            }
            read = stream.read_buf(&mut buf) => {
                match read {
                    Ok(0) => {
                        debug!(peer = %peer, "Bridge closed connection");
                        return;
                    }
                    Ok(_) => {
                        let ack = process_frame(&buf[..], &readings, store_timeout, peer).await;
                        if let Err(e) = stream.write_all(&[ack]).await {
                            warn!(peer = %peer, error = %e, "Failed to write ack");
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "Socket read failed");
                        return;
                    }
                }
            }
        }
    }
}

/// Decode one frame and write it through. The returned ack byte is the
/// whole protocol answer; it reports failure for malformed frames and for
/// store errors or timeouts alike.
async fn process_frame(
    bytes: &[u8],
    readings: &Arc<dyn ReadingStore>,
    store_timeout: Duration,
    peer: SocketAddr,
) -> u8 {
    let reading = match frame::decode(bytes) {
        Ok(reading) => reading,
        Err(e) => {
            reject_frame(&e, bytes.len(), peer);
            return ACK_FAILURE;
        }
    };

    let key = ReadingKey::for_reading(&reading);
    match timeout(store_timeout, readings.insert_if_absent(&key, &reading)).await {
        Ok(Ok(inserted)) => {
            debug!(peer = %peer, key = %key.source, inserted, "Frame stored");
            metrics::counter!("gateway.frames.accepted").increment(1);
            ACK_SUCCESS
        }
        Ok(Err(e)) => {
            error!(peer = %peer, key = %key.source, error = %e, "Reading store write failed");
            metrics::counter!("gateway.frames.store_errors").increment(1);
            ACK_FAILURE
        }
        Err(_) => {
            error!(
                peer = %peer,
                key = %key.source,
                timeout_ms = store_timeout.as_millis() as u64,
                "Reading store write timed out"
            );
            metrics::counter!("gateway.frames.store_timeouts").increment(1);
            ACK_FAILURE
        }
    }
}

fn reject_frame(e: &FrameError, len: usize, peer: SocketAddr) {
    warn!(peer = %peer, len, error = %e, "Rejected frame");
    metrics::counter!("gateway.frames.rejected").increment(1);
}
