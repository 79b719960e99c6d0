#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;
use trust_dns_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use trust_dns_proto::rr::{Name, RData, Record, RecordType};

use split_dns::dns::{self, Upstreams};
use split_dns::tunnel::{serve_session, CallHandler, TunnelClient};
use split_dns::{DnsListener, DomainFilter, Network, QueryRouter};

/// Authoritative-looking resolver answering every question with one A record
/// `marker.0.0.1`, so tests can tell which upstream produced an answer
pub struct MockUpstream {
    pub addr: SocketAddr,
    pub queries: Arc<AtomicUsize>,
}

impl MockUpstream {
    pub async fn start(marker: u8) -> Self {
        let (udp, tcp) = bind_pair().await;
        let addr = udp.local_addr().unwrap();
        let queries = Arc::new(AtomicUsize::new(0));

        let udp_queries = queries.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            loop {
                let (len, src) = match udp.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(_) => continue,
                };
                udp_queries.fetch_add(1, Ordering::SeqCst);
                if let Some(reply) = answer(&buf[..len], marker) {
                    let _ = udp.send_to(&reply, src).await;
                }
            }
        });

        let tcp_queries = queries.clone();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match tcp.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => continue,
                };
                let tcp_queries = tcp_queries.clone();
                tokio::spawn(async move {
                    loop {
                        let mut len_buf = [0u8; 2];
                        if stream.read_exact(&mut len_buf).await.is_err() {
                            return;
                        }
                        let mut query = vec![0u8; u16::from_be_bytes(len_buf) as usize];
                        if stream.read_exact(&mut query).await.is_err() {
                            return;
                        }
                        tcp_queries.fetch_add(1, Ordering::SeqCst);
                        let Some(reply) = answer(&query, marker) else { return };
                        let mut framed = (reply.len() as u16).to_be_bytes().to_vec();
                        framed.extend_from_slice(&reply);
                        if stream.write_all(&framed).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        Self { addr, queries }
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

/// UDP socket and TCP listener sharing one loopback port
async fn bind_pair() -> (UdpSocket, TcpListener) {
    for _ in 0..32 {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = udp.local_addr().unwrap().port();
        if let Ok(tcp) = TcpListener::bind(("127.0.0.1", port)).await {
            return (udp, tcp);
        }
    }
    panic!("no loopback port free for both UDP and TCP");
}

fn answer(query: &[u8], marker: u8) -> Option<Vec<u8>> {
    let request = Message::from_vec(query).ok()?;
    let mut reply = Message::new();
    reply
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(ResponseCode::NoError)
        .add_queries(request.queries().to_vec());
    for q in request.queries() {
        reply.add_answer(Record::from_rdata(
            q.name().clone(),
            60,
            RData::A(Ipv4Addr::new(marker, 0, 0, 1).into()),
        ));
    }
    reply.to_vec().ok()
}

pub fn query(id: u16, names: &[&str]) -> Message {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    for name in names {
        message.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
    }
    message
}

/// First octet of the first A record, i.e. the marker of the answering upstream
pub fn answer_marker(message: &Message) -> Option<u8> {
    message.answers().iter().find_map(|record| match record.data() {
        Some(RData::A(a)) => Some(a.0.octets()[0]),
        _ => None,
    })
}

pub async fn udp_exchange(server: SocketAddr, bytes: &[u8]) -> Vec<u8> {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(bytes, server).await.unwrap();
    let mut buf = vec![0u8; 65535];
    let (len, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("UDP reply timed out")
        .unwrap();
    buf.truncate(len);
    buf
}

pub async fn udp_query(server: SocketAddr, message: &Message) -> Message {
    let reply = udp_exchange(server, &dns::encode(message).unwrap()).await;
    dns::decode(&reply).unwrap()
}

pub async fn tcp_query(server: SocketAddr, message: &Message) -> Message {
    let mut stream = TcpStream::connect(server).await.unwrap();
    let reply = timeout(
        Duration::from_secs(5),
        dns::exchange_over_stream(&mut stream, &dns::encode(message).unwrap()),
    )
    .await
    .expect("TCP reply timed out")
    .unwrap();
    dns::decode(&reply).unwrap()
}

/// Plain-TCP tunnel server; the session logic is identical to the TLS one
pub async fn start_tunnel_server(upstream: SocketAddr) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = CallHandler::new(Arc::new(Upstreams::new(Duration::from_secs(5))), upstream);
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => continue,
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let _ = serve_session(stream, handler).await;
            });
        }
    });
    addr
}

/// A running client: both front-ends plus the tunnel they share
pub struct ClientProxy {
    pub udp: SocketAddr,
    pub tcp: SocketAddr,
    pub tunnel: Arc<TunnelClient>,
}

pub async fn start_client(domains: &[&str], forward_dns: SocketAddr, tunnel_server: SocketAddr) -> ClientProxy {
    let stream = TcpStream::connect(tunnel_server).await.unwrap();
    start_client_with_tunnel(domains, forward_dns, Arc::new(TunnelClient::new(stream))).await
}

/// Client front-ends over an already established tunnel
pub async fn start_client_with_tunnel(
    domains: &[&str],
    forward_dns: SocketAddr,
    tunnel: Arc<TunnelClient>,
) -> ClientProxy {
    let router = Arc::new(QueryRouter::new(
        Arc::new(DomainFilter::compile(domains).unwrap()),
        Arc::new(Upstreams::new(Duration::from_secs(5))),
        forward_dns,
        tunnel.clone(),
    ));

    let udp = DnsListener::bind("127.0.0.1:0".parse().unwrap(), Network::Udp, router.clone())
        .await
        .unwrap();
    let tcp = DnsListener::bind("127.0.0.1:0".parse().unwrap(), Network::Tcp, router)
        .await
        .unwrap();
    let udp_addr = udp.local_addr().unwrap();
    let tcp_addr = tcp.local_addr().unwrap();
    tokio::spawn(udp.run());
    tokio::spawn(tcp.run());

    ClientProxy {
        udp: udp_addr,
        tcp: tcp_addr,
        tunnel,
    }
}

pub const LOCAL_MARKER: u8 = 10;
pub const REMOTE_MARKER: u8 = 20;
