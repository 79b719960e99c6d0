use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default port for DNS addresses given without one
pub const DNS_PORT: u16 = 53;

/// Which side of the tunnel this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Client,
    Server,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "client" => Ok(Mode::Client),
            "server" => Ok(Mode::Server),
            other => bail!("unknown mode '{}', expected 'client' or 'server'", other),
        }
    }
}

/// Transport network of a DNS exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: Mode,
    /// Tunnel server host the client dials
    pub server: String,
    /// Tunnel port; the server listens on it on all interfaces
    pub port: u16,
    /// Upstream resolver, `ip` or `ip:port`
    pub forward_dns: String,
    /// Client front-end bind address, `ip` or `ip:port`
    pub local_dns: String,
    /// Allow-list of domains answered directly; absent means tunnel everything
    pub domain_file: Option<PathBuf>,
    pub cert_pem: PathBuf,
    pub key_pem: PathBuf,
    /// Trust root for the peer certificate; defaults to `cert_pem`
    pub ca_pem: Option<PathBuf>,
    /// Name checked against the server certificate; defaults to `server`
    pub server_name: Option<String>,
    pub upstream_timeout_seconds: u64,
    /// `stdout`, `stderr` or a file path
    pub log_output: String,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Client,
            server: String::new(),
            port: 8853,
            forward_dns: "8.8.8.8:53".to_string(),
            local_dns: "127.0.0.1:53".to_string(),
            domain_file: None,
            cert_pem: PathBuf::from("cert.pem"),
            key_pem: PathBuf::from("key.pem"),
            ca_pem: None,
            server_name: None,
            upstream_timeout_seconds: 60,
            log_output: "stdout".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("can't open config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&config_str)
            .with_context(|| format!("parse config file {} error", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            bail!("tunnel port must not be 0");
        }
        self.forward_dns_addr()?;
        if self.mode == Mode::Client {
            if self.server.trim().is_empty() {
                bail!("client mode requires a tunnel 'server' host");
            }
            self.local_dns_addr()?;
        }
        if self.upstream_timeout_seconds == 0 {
            bail!("upstream_timeout_seconds must be positive");
        }
        Ok(())
    }

    pub fn forward_dns_addr(&self) -> anyhow::Result<SocketAddr> {
        parse_dns_addr(&self.forward_dns)
            .map_err(|e| anyhow::anyhow!("Invalid forward_dns '{}': {}", self.forward_dns, e))
    }

    pub fn local_dns_addr(&self) -> anyhow::Result<SocketAddr> {
        parse_dns_addr(&self.local_dns)
            .map_err(|e| anyhow::anyhow!("Invalid local_dns '{}': {}", self.local_dns, e))
    }

    /// Address the client dials, `server:port`
    pub fn tunnel_addr(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    /// Address the server listens on
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    pub fn ca_path(&self) -> &Path {
        self.ca_pem.as_deref().unwrap_or(&self.cert_pem)
    }

    pub fn tls_server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.server)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_seconds)
    }
}

/// Parse `ip` or `ip:port`, defaulting to port 53. Bracketed IPv6 is accepted
/// with a port, a bare IPv6 literal without one.
pub fn parse_dns_addr(s: &str) -> Result<SocketAddr, std::net::AddrParseError> {
    let s = s.trim();
    match s.parse::<SocketAddr>() {
        Ok(addr) => Ok(addr),
        Err(e) => match s.parse::<std::net::IpAddr>() {
            Ok(ip) => Ok(SocketAddr::new(ip, DNS_PORT)),
            Err(_) => Err(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn client_config() -> Config {
        Config {
            server: "tunnel.example.net".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.mode, Mode::Client);
        assert_eq!(config.port, 8853);
        assert_eq!(config.forward_dns, "8.8.8.8:53");
        assert_eq!(config.local_dns, "127.0.0.1:53");
        assert_eq!(config.upstream_timeout(), Duration::from_secs(60));
        assert!(config.domain_file.is_none());
    }

    #[test]
    fn test_config_serialization() {
        let config = client_config();
        let json = serde_json::to_string(&config).expect("Failed to serialize config");
        let deserialized: Config = serde_json::from_str(&json).expect("Failed to deserialize config");

        assert_eq!(config.server, deserialized.server);
        assert_eq!(config.port, deserialized.port);
        assert_eq!(config.mode, deserialized.mode);
    }

    #[test]
    fn test_parse_dns_addr() {
        assert_eq!(parse_dns_addr("1.1.1.1").unwrap().to_string(), "1.1.1.1:53");
        assert_eq!(parse_dns_addr("1.1.1.1:5353").unwrap().to_string(), "1.1.1.1:5353");
        assert_eq!(parse_dns_addr("::1").unwrap().to_string(), "[::1]:53");
        assert_eq!(parse_dns_addr("[::1]:54").unwrap().to_string(), "[::1]:54");
        assert!(parse_dns_addr("dns.google").is_err());
    }

    #[test]
    fn test_config_forward_dns_invalid() {
        let mut config = client_config();
        config.forward_dns = "invalid-address".to_string();

        let result = config.forward_dns_addr();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("invalid-address"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_server_in_client_mode() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let server = Config {
            mode: Mode::Server,
            ..Config::default()
        };
        assert!(server.validate().is_ok());
    }

    #[test]
    fn test_tunnel_and_listen_addresses() {
        let config = client_config();
        assert_eq!(config.tunnel_addr(), "tunnel.example.net:8853");
        assert_eq!(config.listen_addr().to_string(), "0.0.0.0:8853");
        assert_eq!(config.tls_server_name(), "tunnel.example.net");
        assert_eq!(config.ca_path(), Path::new("cert.pem"));
    }

    #[test]
    fn test_config_load_from_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("conf.json");

        fs::write(
            &config_path,
            r#"{
                "mode": "server",
                "port": 9953,
                "forward_dns": "9.9.9.9",
                "cert_pem": "/etc/split-dns/cert.pem",
                "key_pem": "/etc/split-dns/key.pem",
                "ca_pem": "/etc/split-dns/ca.pem"
            }"#,
        )
        .expect("Failed to write config file");

        let loaded = Config::load(&config_path).expect("Failed to load config");
        assert_eq!(loaded.mode, Mode::Server);
        assert_eq!(loaded.port, 9953);
        assert_eq!(loaded.forward_dns_addr().unwrap().to_string(), "9.9.9.9:53");
        assert_eq!(loaded.ca_path(), Path::new("/etc/split-dns/ca.pem"));
        assert_eq!(loaded.log_output, "stdout");
    }

    #[test]
    fn test_config_load_missing_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let result = Config::load(temp_dir.path().join("missing.json"));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("can't open config file"));
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("client".parse::<Mode>().unwrap(), Mode::Client);
        assert_eq!("server".parse::<Mode>().unwrap(), Mode::Server);
        assert!("relay".parse::<Mode>().is_err());
    }

    #[test]
    fn test_network_serde_names() {
        assert_eq!(serde_json::to_string(&Network::Tcp).unwrap(), "\"tcp\"");
        assert_eq!(Network::Udp.to_string(), "udp");
    }
}
