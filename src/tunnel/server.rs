//! Server side of the tunnel

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use super::protocol::{framed, Frame, TunnelCall, RESOLVE_METHOD};
use crate::dns::{self, Upstreams};
use crate::error::{Error, Result, TunnelError};
use crate::listener::SOCKET_ERROR_BACKOFF;

/// Answers tunneled calls against the server's own upstream resolver
#[derive(Debug, Clone)]
pub struct CallHandler {
    upstreams: Arc<Upstreams>,
    forward_dns: SocketAddr,
}

impl CallHandler {
    pub fn new(upstreams: Arc<Upstreams>, forward_dns: SocketAddr) -> Self {
        Self {
            upstreams,
            forward_dns,
        }
    }

    /// Decode, exchange on the hinted network, re-encode
    pub async fn handle(&self, call: &TunnelCall) -> Result<Vec<u8>> {
        let request = dns::decode(&call.msg)?;
        let client = self.upstreams.client(call.network);
        let answer = client.exchange(&request, self.forward_dns).await?;
        dns::encode(&answer)
    }

    async fn reply(&self, id: u64, method: &str, call: &TunnelCall) -> Frame {
        let result = if method == RESOLVE_METHOD {
            self.handle(call).await.map_err(|e| {
                warn!("Tunnel call {} failed: {}", id, e);
                e.to_string()
            })
        } else {
            warn!("Tunnel call {} names unknown method '{}'", id, method);
            Err(format!("unknown method: {}", method))
        };
        Frame::Reply { id, result }
    }
}

/// Serve calls on one tunnel connection until the peer goes away.
///
/// Each call runs in its own task; a failing call is answered with an error
/// reply and leaves the session up. Only stream errors and undecodable
/// frames end the session.
pub async fn serve_session<S>(stream: S, handler: CallHandler) -> std::result::Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut sink, mut frames) = framed(stream).split();
    let (replies, mut replies_rx) = mpsc::channel::<Bytes>(256);

    let writer = tokio::spawn(async move {
        while let Some(reply) = replies_rx.recv().await {
            if let Err(e) = sink.send(reply).await {
                debug!("Tunnel session write failed: {}", e);
                return Err(TunnelError::Io(e));
            }
        }
        Ok(())
    });

    let mut outcome = Ok(());
    while let Some(frame) = frames.next().await {
        let bytes = match frame {
            Ok(bytes) => bytes,
            Err(e) => {
                outcome = Err(TunnelError::Io(e));
                break;
            }
        };
        match Frame::from_bytes(&bytes) {
            Ok(Frame::Call { id, method, call }) => {
                let handler = handler.clone();
                let replies = replies.clone();
                tokio::spawn(async move {
                    let reply = handler.reply(id, &method, &call).await;
                    match reply.to_bytes() {
                        Ok(bytes) => {
                            let _ = replies.send(bytes).await;
                        }
                        Err(e) => error!("Failed to encode reply for call {}: {}", id, e),
                    }
                });
            }
            Ok(Frame::Reply { id, .. }) => {
                warn!("Ignoring unexpected reply {} from tunnel client", id);
            }
            Err(e) => {
                outcome = Err(e);
                break;
            }
        }
    }

    // Let in-flight calls finish and flush their replies
    drop(replies);
    match writer.await {
        Ok(Err(e)) if outcome.is_ok() => outcome = Err(e),
        _ => {}
    }
    outcome
}

/// Encrypted listener accepting any number of concurrent tunnel sessions
pub struct TunnelServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handler: CallHandler,
}

impl TunnelServer {
    pub async fn bind(addr: SocketAddr, acceptor: TlsAcceptor, handler: CallHandler) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| Error::Listen {
            addr: addr.to_string(),
            source: e,
        })?;
        Ok(Self {
            listener,
            acceptor,
            handler,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Every connection gets its own task that owns the TLS
    /// handshake and the session; nothing is shared between sessions.
    pub async fn run(self) -> Result<()> {
        info!("Tunnel server listening on {}", self.local_addr()?);

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("New tunnel connection from {}", peer);
                    let acceptor = self.acceptor.clone();
                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        let stream = match acceptor.accept(stream).await {
                            Ok(stream) => stream,
                            Err(e) => {
                                warn!("TLS handshake with {} failed: {}", peer, e);
                                return;
                            }
                        };
                        info!("Tunnel session from {} established", peer);
                        match serve_session(stream, handler).await {
                            Ok(()) => info!("Tunnel session from {} closed", peer),
                            Err(e) => warn!("Tunnel session from {} ended: {}", peer, e),
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept tunnel connection: {}", e);
                    tokio::time::sleep(SOCKET_ERROR_BACKOFF).await;
                }
            }
        }
    }
}
