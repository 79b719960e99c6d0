//! Client side of the tunnel
//!
//! One persistent connection is shared by every remote query. Callers never
//! touch the stream: a writer task owns the sink, a reader task owns the
//! stream, and replies are routed back to their callers by call id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::protocol::{framed, Frame, TunnelCall};
use crate::error::TunnelError;

type ReplySender = oneshot::Sender<Result<Vec<u8>, TunnelError>>;

/// Resolves a query on the far side of the tunnel
#[async_trait]
pub trait RemoteResolver: Send + Sync {
    /// Returns the raw DNS answer produced by the remote upstream
    async fn resolve(&self, call: TunnelCall) -> Result<Vec<u8>, TunnelError>;
}

/// Calls awaiting a reply, plus whether the connection is still usable
#[derive(Default)]
struct Pending {
    closed: bool,
    waiters: HashMap<u64, ReplySender>,
}

impl Pending {
    /// Mark the connection gone and fail every waiting call
    fn close(&mut self) {
        self.closed = true;
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.send(Err(TunnelError::Closed));
        }
    }
}

pub struct TunnelClient {
    next_id: AtomicU64,
    outbound: mpsc::Sender<Bytes>,
    pending: Arc<Mutex<Pending>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl TunnelClient {
    /// Take ownership of an established stream and start serving calls on it
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut sink, mut frames) = framed(stream).split();
        let (outbound, mut outbound_rx) = mpsc::channel::<Bytes>(256);
        let pending = Arc::new(Mutex::new(Pending::default()));

        let writer_pending = pending.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    error!("Tunnel write failed: {}", e);
                    break;
                }
            }
            writer_pending.lock().await.close();
        });

        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                let frame = match frame {
                    Ok(bytes) => Frame::from_bytes(&bytes),
                    Err(e) => {
                        error!("Tunnel read failed: {}", e);
                        break;
                    }
                };
                match frame {
                    Ok(Frame::Reply { id, result }) => {
                        let waiter = reader_pending.lock().await.waiters.remove(&id);
                        match waiter {
                            Some(waiter) => {
                                let _ = waiter.send(result.map_err(TunnelError::Remote));
                            }
                            None => warn!("Dropping tunnel reply for unknown call {}", id),
                        }
                    }
                    Ok(Frame::Call { id, .. }) => {
                        warn!("Ignoring unexpected call {} from tunnel server", id);
                    }
                    Err(e) => {
                        error!("Tunnel framing lost: {}", e);
                        break;
                    }
                }
            }
            debug!("Tunnel connection closed");
            reader_pending.lock().await.close();
        });

        Self {
            next_id: AtomicU64::new(1),
            outbound,
            pending,
            reader,
            writer,
        }
    }

    /// Issue one resolve call and wait for its reply
    pub async fn call(&self, call: TunnelCall) -> Result<Vec<u8>, TunnelError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::resolve(id, call).to_bytes()?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(TunnelError::Closed);
            }
            pending.waiters.insert(id, tx);
        }

        if self.outbound.send(frame).await.is_err() {
            self.pending.lock().await.waiters.remove(&id);
            return Err(TunnelError::Closed);
        }

        rx.await.unwrap_or(Err(TunnelError::Closed))
    }

    /// Whether the underlying connection has gone away
    pub async fn is_closed(&self) -> bool {
        self.pending.lock().await.closed
    }
}

#[async_trait]
impl RemoteResolver for TunnelClient {
    async fn resolve(&self, call: TunnelCall) -> Result<Vec<u8>, TunnelError> {
        self.call(call).await
    }
}

impl Drop for TunnelClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
