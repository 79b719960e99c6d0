// Library module for the split-horizon DNS proxy
// Used by the binary and by the integration tests

pub mod config;
pub mod dns;
pub mod error;
pub mod filter;
pub mod listener;
pub mod logging;
pub mod router;
pub mod service;
pub mod tls;
pub mod tunnel;

// Re-export main types for external use
pub use config::{Config, Mode, Network};
pub use dns::{UpstreamClient, Upstreams};
pub use error::{Error, Result, TunnelError};
pub use filter::{DomainFilter, RoutingDecision};
pub use listener::DnsListener;
pub use router::QueryRouter;
pub use service::{run, run_client, run_server};
pub use tls::TlsSettings;
pub use tunnel::{CallHandler, RemoteResolver, TunnelCall, TunnelClient, TunnelServer};
