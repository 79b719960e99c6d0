//! Per-query routing: answer locally or through the tunnel

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};
use trust_dns_proto::op::Message;

use crate::config::Network;
use crate::dns::{self, Upstreams};
use crate::error::Result;
use crate::filter::{DomainFilter, RoutingDecision};
use crate::tunnel::{RemoteResolver, TunnelCall};

/// Shared by both front-ends; all state is read-only after construction
pub struct QueryRouter {
    filter: Arc<DomainFilter>,
    upstreams: Arc<Upstreams>,
    forward_dns: SocketAddr,
    remote: Arc<dyn RemoteResolver>,
}

impl QueryRouter {
    pub fn new(
        filter: Arc<DomainFilter>,
        upstreams: Arc<Upstreams>,
        forward_dns: SocketAddr,
        remote: Arc<dyn RemoteResolver>,
    ) -> Self {
        Self {
            filter,
            upstreams,
            forward_dns,
            remote,
        }
    }

    pub fn classify(&self, request: &Message) -> RoutingDecision {
        self.filter.classify(dns::question_names(request))
    }

    /// Answer `request`, which arrived on `network`
    pub async fn route(&self, request: &Message, network: Network) -> Result<Message> {
        let names = dns::question_names(request);
        let logged = names.join("|");

        match self.filter.classify(&names) {
            RoutingDecision::Local => {
                info!("local query: |{}", logged);
                self.upstreams
                    .client(network)
                    .exchange(request, self.forward_dns)
                    .await
            }
            RoutingDecision::Remote => {
                info!("forward query: |{}", logged);
                let call = TunnelCall {
                    msg: dns::encode(request)?,
                    network,
                };
                let answer = self.remote.resolve(call).await?;
                dns::decode(&answer)
            }
        }
    }

    /// Route raw wire bytes and always produce a reply: on any failure the
    /// querier gets a SERVFAIL for its own ID and question. `None` only when
    /// the input is too short to carry an ID.
    pub async fn answer(&self, query: &[u8], network: Network) -> Option<Vec<u8>> {
        let request = match dns::decode(query) {
            Ok(request) => request,
            Err(e) => {
                warn!("Malformed {} query: {}", network, e);
                return dns::servfail_for_raw(query).and_then(|reply| dns::encode(&reply).ok());
            }
        };

        match self.route(&request, network).await.and_then(|answer| dns::encode(&answer)) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("{} query failed: {}", network, e);
                dns::encode(&dns::servfail(&request)).ok()
            }
        }
    }
}
