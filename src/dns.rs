//! Upstream DNS exchange and wire-format helpers

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;
use trust_dns_proto::op::{Message, MessageType, ResponseCode};

use crate::config::Network;
use crate::error::{Error, Result};

/// Largest DNS message accepted over either transport
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// Read timeout applied to every upstream exchange
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);

pub fn decode(bytes: &[u8]) -> Result<Message> {
    Message::from_vec(bytes).map_err(|e| Error::Decode(e.to_string()))
}

pub fn encode(message: &Message) -> Result<Vec<u8>> {
    message.to_vec().map_err(|e| Error::Encode(e.to_string()))
}

/// Question names without the trailing root dot
pub fn question_names(message: &Message) -> Vec<String> {
    message
        .queries()
        .iter()
        .map(|q| q.name().to_ascii().trim_end_matches('.').to_string())
        .collect()
}

/// SERVFAIL reply echoing the request's ID, opcode and questions
pub fn servfail(request: &Message) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(ResponseCode::ServFail)
        .add_queries(request.queries().to_vec());
    reply
}

/// SERVFAIL for a message that could not be decoded. Only the ID is
/// recoverable; `None` when not even that is present.
pub fn servfail_for_raw(bytes: &[u8]) -> Option<Message> {
    if bytes.len() < 2 {
        return None;
    }
    let mut reply = Message::new();
    reply
        .set_id(u16::from_be_bytes([bytes[0], bytes[1]]))
        .set_message_type(MessageType::Response)
        .set_response_code(ResponseCode::ServFail);
    Some(reply)
}

/// Client for one transport network. Holds only configuration, so one
/// instance serves any number of concurrent exchanges.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    network: Network,
    read_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(network: Network) -> Self {
        Self::with_timeout(network, DEFAULT_UPSTREAM_TIMEOUT)
    }

    pub fn with_timeout(network: Network, read_timeout: Duration) -> Self {
        Self {
            network,
            read_timeout,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Send `request` to `upstream` once and return its answer
    pub async fn exchange(&self, request: &Message, upstream: SocketAddr) -> Result<Message> {
        let query = encode(request)?;
        let response = self.exchange_raw(&query, upstream).await?;
        let answer = decode(&response)?;
        if answer.id() != request.id() {
            return Err(Error::upstream(
                upstream,
                format!("reply id {} does not match query id {}", answer.id(), request.id()),
            ));
        }
        Ok(answer)
    }

    async fn exchange_raw(&self, query: &[u8], upstream: SocketAddr) -> Result<Vec<u8>> {
        debug!("{} exchange with {} ({} bytes)", self.network, upstream, query.len());
        match self.network {
            Network::Udp => self.exchange_udp(query, upstream).await,
            Network::Tcp => self.exchange_tcp(query, upstream).await,
        }
    }

    async fn exchange_udp(&self, query: &[u8], upstream: SocketAddr) -> Result<Vec<u8>> {
        let bind_addr = match upstream.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| Error::upstream(upstream, format!("failed to bind UDP socket: {}", e)))?;
        socket
            .connect(upstream)
            .await
            .map_err(|e| Error::upstream(upstream, format!("failed to connect UDP socket: {}", e)))?;
        socket
            .send(query)
            .await
            .map_err(|e| Error::upstream(upstream, format!("failed to send query: {}", e)))?;

        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        match timeout(self.read_timeout, socket.recv(&mut buf)).await {
            Ok(Ok(len)) => {
                buf.truncate(len);
                Ok(buf)
            }
            Ok(Err(e)) => Err(Error::upstream(upstream, format!("failed to receive reply: {}", e))),
            Err(_) => Err(Error::upstream(upstream, "read timed out")),
        }
    }

    async fn exchange_tcp(&self, query: &[u8], upstream: SocketAddr) -> Result<Vec<u8>> {
        let mut stream = match timeout(self.read_timeout, TcpStream::connect(upstream)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Error::upstream(upstream, format!("TCP connect failed: {}", e))),
            Err(_) => return Err(Error::upstream(upstream, "TCP connect timed out")),
        };

        match timeout(self.read_timeout, exchange_over_stream(&mut stream, query)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(Error::upstream(upstream, e.to_string())),
            Err(_) => Err(Error::upstream(upstream, "read timed out")),
        }
    }
}

/// One length-prefixed query/answer round trip on a stream (RFC 1035 4.2.2)
pub async fn exchange_over_stream<S>(stream: &mut S, query: &[u8]) -> std::io::Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = u16::try_from(query.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "DNS query too large")
    })?;
    let mut msg = Vec::with_capacity(2 + query.len());
    msg.extend_from_slice(&len.to_be_bytes());
    msg.extend_from_slice(query);
    stream.write_all(&msg).await?;
    stream.flush().await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let mut response = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut response).await?;
    Ok(response)
}

/// One client per network, created once and shared by every query
#[derive(Debug, Clone)]
pub struct Upstreams {
    tcp: UpstreamClient,
    udp: UpstreamClient,
}

impl Upstreams {
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            tcp: UpstreamClient::with_timeout(Network::Tcp, read_timeout),
            udp: UpstreamClient::with_timeout(Network::Udp, read_timeout),
        }
    }

    pub fn client(&self, network: Network) -> &UpstreamClient {
        match network {
            Network::Tcp => &self.tcp,
            Network::Udp => &self.udp,
        }
    }
}

impl Default for Upstreams {
    fn default() -> Self {
        Self::new(DEFAULT_UPSTREAM_TIMEOUT)
    }
}
