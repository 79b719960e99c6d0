use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tracing::info;

use crate::config::{Config, Mode, Network};
use crate::dns::Upstreams;
use crate::filter::DomainFilter;
use crate::listener::DnsListener;
use crate::router::QueryRouter;
use crate::tls::{self, TlsSettings};
use crate::tunnel::{CallHandler, TunnelClient, TunnelServer};

/// Run the configured side until it stops or ctrl-c is received
pub async fn run(config: Config) -> Result<()> {
    let service = async {
        match config.mode {
            Mode::Client => run_client(&config).await,
            Mode::Server => run_server(&config).await,
        }
    };

    tokio::select! {
        result = service => result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("Shutdown requested");
            Ok(())
        }
    }
}

pub fn load_filter(config: &Config) -> Result<DomainFilter> {
    match &config.domain_file {
        Some(path) => {
            let filter = DomainFilter::from_file(path)
                .with_context(|| format!("failed to load domain list {}", path.display()))?;
            info!("Loaded {} local domains from {}", filter.len(), path.display());
            Ok(filter)
        }
        None => {
            info!("No domain list configured, every query goes through the tunnel");
            Ok(DomainFilter::empty())
        }
    }
}

/// Client side: one tunnel connection, dialed once, shared by a UDP and a
/// TCP front-end. Returns an error as soon as either front-end fails.
pub async fn run_client(config: &Config) -> Result<()> {
    let filter = Arc::new(load_filter(config)?);
    let forward_dns = config.forward_dns_addr()?;
    let local_dns = config.local_dns_addr()?;

    let connector = TlsSettings::from_config(config)
        .connector()
        .context("failed to build TLS client context")?;
    let tunnel_addr = config.tunnel_addr();
    let stream = tls::dial(&connector, &tunnel_addr, config.tls_server_name()).await?;
    info!("Tunnel connected to {}", tunnel_addr);
    let tunnel = Arc::new(TunnelClient::new(stream));

    let router = Arc::new(QueryRouter::new(
        filter,
        Arc::new(Upstreams::new(config.upstream_timeout())),
        forward_dns,
        tunnel,
    ));

    let udp = DnsListener::bind(local_dns, Network::Udp, router.clone()).await?;
    let tcp = DnsListener::bind(local_dns, Network::Tcp, router).await?;

    serve_front_ends(udp.run(), tcp.run()).await
}

/// Drive both front-ends; the first one to fail ends the client with its error
async fn serve_front_ends<U, T>(udp: U, tcp: T) -> Result<()>
where
    U: Future<Output = crate::Result<()>>,
    T: Future<Output = crate::Result<()>>,
{
    tokio::try_join!(
        async { udp.await.context("DNS udp listener stopped") },
        async { tcp.await.context("DNS tcp listener stopped") }
    )?;
    Ok(())
}

/// Server side: accept tunnel sessions and resolve their calls upstream
pub async fn run_server(config: &Config) -> Result<()> {
    let acceptor = TlsSettings::from_config(config)
        .acceptor()
        .context("failed to build TLS server context")?;
    let handler = CallHandler::new(
        Arc::new(Upstreams::new(config.upstream_timeout())),
        config.forward_dns_addr()?,
    );

    let server = TunnelServer::bind(config.listen_addr(), acceptor, handler).await?;
    server.run().await?;
    Ok(())
}
