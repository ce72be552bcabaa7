//! DHCP server configuration

use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Standard DHCP server port
pub const DHCP_PORT: u16 = 67;

/// Port ProxyDHCP clients send their follow-up requests to
pub const BINL_PORT: u16 = 4011;

/// DHCP server configuration
#[derive(Debug, Clone)]
pub struct DhcpConfig {
    /// Interfaces to serve; empty serves every interface
    pub interfaces: Vec<String>,

    /// IP address to bind sockets to
    pub bind_ip: Ipv4Addr,

    /// UDP port to listen on
    pub port: u16,

    /// Address to identify as when no local network matches a client
    pub server_ip: Ipv4Addr,

    /// Local addresses (with prefix length) the server answers from
    ///
    /// A directly attached client is looked up through these addresses
    /// and replies carry the one sharing the client's network as their
    /// server identifier.
    pub networks: Vec<Ipv4Network>,

    /// Only answer PXE clients with boot information, never hand out
    /// addresses
    pub proxy_only: bool,

    /// How long to wait for an address-in-use probe
    pub probe_timeout: Duration,
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            interfaces: Vec::new(),
            bind_ip: Ipv4Addr::UNSPECIFIED,
            port: DHCP_PORT,
            server_ip: Ipv4Addr::UNSPECIFIED,
            networks: Vec::new(),
            proxy_only: false,
            probe_timeout: Duration::from_secs(3),
        }
    }
}

impl DhcpConfig {
    /// Create a new DHCP config with server IP
    pub fn new(server_ip: Ipv4Addr) -> Self {
        Self {
            server_ip,
            ..Default::default()
        }
    }

    /// Restrict the server to the named interfaces
    pub fn with_interfaces<I, S>(mut self, interfaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interfaces = interfaces
            .into_iter()
            .map(Into::into)
            .map(|s: String| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_bind_ip(mut self, ip: Ipv4Addr) -> Self {
        self.bind_ip = ip;
        self
    }

    /// Add a local address the server answers from
    pub fn with_network(mut self, network: Ipv4Network) -> Self {
        self.networks.push(network);
        self
    }

    /// Serve as a ProxyDHCP/BINL responder only
    pub fn with_proxy_only(mut self, proxy_only: bool) -> Self {
        self.proxy_only = proxy_only;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Local addresses used as relay (`via`) addresses for directly
    /// attached clients
    pub fn listen_ips(&self) -> Vec<Ipv4Addr> {
        if self.networks.is_empty() {
            return vec![self.server_ip];
        }
        self.networks.iter().map(|n| n.ip()).collect()
    }

    /// The local address to answer a client at `addr` from
    pub fn respond_from(&self, addr: Ipv4Addr) -> Ipv4Addr {
        self.networks
            .iter()
            .find(|n| n.contains(addr))
            .or_else(|| self.networks.first())
            .map(|n| n.ip())
            .unwrap_or(self.server_ip)
    }

    /// Whether `addr` is one of the server's own addresses
    pub fn is_local(&self, addr: Ipv4Addr) -> bool {
        addr == self.server_ip || self.networks.iter().any(|n| n.ip() == addr)
    }
}
