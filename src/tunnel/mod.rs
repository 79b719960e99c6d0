//! Encrypted call/reply tunnel between the client and server proxies

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{RemoteResolver, TunnelClient};
pub use protocol::{Frame, TunnelCall, RESOLVE_METHOD};
pub use server::{serve_session, CallHandler, TunnelServer};
