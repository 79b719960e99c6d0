//! DNS front-ends the local stub resolver talks to

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info};

use crate::config::Network;
use crate::dns::MAX_MESSAGE_SIZE;
use crate::error::{Error, Result};
use crate::router::QueryRouter;

/// Pause after a socket-level receive or accept error, so a persistent
/// failure such as descriptor exhaustion does not spin the loop
pub(crate) const SOCKET_ERROR_BACKOFF: Duration = Duration::from_millis(100);

enum Socket {
    Udp(Arc<UdpSocket>),
    Tcp(TcpListener),
}

/// One bound front-end, either UDP or TCP. The transport a query arrives on
/// is the network hint used for its upstream exchange.
pub struct DnsListener {
    socket: Socket,
    router: Arc<QueryRouter>,
}

impl DnsListener {
    pub async fn bind(addr: SocketAddr, network: Network, router: Arc<QueryRouter>) -> Result<Self> {
        let listen_err = |e| Error::Listen {
            addr: format!("{}/{}", addr, network),
            source: e,
        };
        let socket = match network {
            Network::Udp => Socket::Udp(Arc::new(UdpSocket::bind(addr).await.map_err(listen_err)?)),
            Network::Tcp => Socket::Tcp(TcpListener::bind(addr).await.map_err(listen_err)?),
        };
        Ok(Self { socket, router })
    }

    pub fn network(&self) -> Network {
        match self.socket {
            Socket::Udp(_) => Network::Udp,
            Socket::Tcp(_) => Network::Tcp,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let addr = match &self.socket {
            Socket::Udp(socket) => socket.local_addr()?,
            Socket::Tcp(listener) => listener.local_addr()?,
        };
        Ok(addr)
    }

    /// Serve until the socket fails
    pub async fn run(self) -> Result<()> {
        info!("DNS {} listener on {}", self.network(), self.local_addr()?);
        match self.socket {
            Socket::Udp(socket) => serve_udp(socket, self.router).await,
            Socket::Tcp(listener) => serve_tcp(listener, self.router).await,
        }
    }
}

async fn serve_udp(socket: Arc<UdpSocket>, router: Arc<QueryRouter>) -> Result<()> {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                // ICMP errors from earlier replies surface here on some platforms
                debug!("DNS udp recv error: {}", e);
                tokio::time::sleep(SOCKET_ERROR_BACKOFF).await;
                continue;
            }
        };
        let query = buf[..len].to_vec();
        let socket = socket.clone();
        let router = router.clone();
        tokio::spawn(async move {
            match router.answer(&query, Network::Udp).await {
                Some(reply) => {
                    if let Err(e) = socket.send_to(&reply, src).await {
                        error!("Failed to send DNS reply to {}: {}", src, e);
                    }
                }
                None => debug!("Dropping {}-byte datagram from {}", query.len(), src),
            }
        });
    }
}

async fn serve_tcp(listener: TcpListener, router: Arc<QueryRouter>) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("New DNS tcp connection from {}", peer);
                let router = router.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_tcp_connection(stream, router).await {
                        debug!("DNS tcp connection from {} ended: {}", peer, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept DNS tcp connection: {}", e);
                tokio::time::sleep(SOCKET_ERROR_BACKOFF).await;
            }
        }
    }
}

/// Length-prefixed messages, answered one after another until EOF
async fn handle_tcp_connection(stream: TcpStream, router: Arc<QueryRouter>) -> Result<()> {
    let codec = LengthDelimitedCodec::builder()
        .length_field_length(2)
        .max_frame_length(MAX_MESSAGE_SIZE)
        .new_codec();
    let mut framed = Framed::new(stream, codec);

    while let Some(query) = framed.next().await {
        let query = query?;
        match router.answer(&query, Network::Tcp).await {
            Some(reply) => framed.send(Bytes::from(reply)).await?,
            None => break,
        }
    }
    Ok(())
}
