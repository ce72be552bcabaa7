//! Configuration for `provision serve`
//!
//! Settings come from an optional YAML file; command line flags win over
//! whatever the file says.

use color_eyre::eyre::{eyre, Result, WrapErr};
use ipnetwork::Ipv4Network;
use provision_dhcp::DhcpConfig;
use provision_store::{StoreConfig, TrackerConfig};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ServeConfig {
    /// Where objects are persisted
    pub backend: StoreConfig,
    /// Directory holding the database and boot files when they are not
    /// configured separately
    pub data_dir: Option<PathBuf>,
    pub file_root: Option<PathBuf>,
    /// Address advertised to clients when nothing better is known
    pub static_ip: Option<Ipv4Addr>,
    pub api_port: Option<u16>,
    pub static_port: Option<u16>,
    pub dhcp: DhcpSettings,
    /// Preferences applied at startup
    pub prefs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct DhcpSettings {
    pub enabled: bool,
    pub interfaces: Vec<String>,
    pub bind_ip: Ipv4Addr,
    pub port: u16,
    pub server_ip: Option<Ipv4Addr>,
    /// Local addresses in CIDR form, e.g. `10.0.0.1/24`
    pub networks: Vec<String>,
    pub proxy_only: bool,
    pub probe_timeout_secs: u64,
}

impl Default for DhcpSettings {
    fn default() -> Self {
        let base = DhcpConfig::default();
        Self {
            enabled: true,
            interfaces: base.interfaces,
            bind_ip: base.bind_ip,
            port: base.port,
            server_ip: None,
            networks: Vec::new(),
            proxy_only: base.proxy_only,
            probe_timeout_secs: base.probe_timeout.as_secs(),
        }
    }
}

impl ServeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&raw).wrap_err_with(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// The backend to open; a bare `data_dir` selects a redb database in it
    pub fn store(&self) -> StoreConfig {
        match (&self.backend, &self.data_dir) {
            (StoreConfig::Memory, Some(dir)) => StoreConfig::Redb {
                path: dir.join("provision.redb").to_string_lossy().into_owned(),
            },
            (backend, _) => backend.clone(),
        }
    }

    pub fn tracker(&self) -> TrackerConfig {
        let mut config = TrackerConfig::default();
        match (&self.file_root, &self.data_dir) {
            (Some(root), _) => config.file_root = root.clone(),
            (None, Some(dir)) => config.file_root = dir.join("tftpboot"),
            (None, None) => {}
        }
        config.static_ip = self.static_ip;
        if let Some(port) = self.api_port {
            config.api_port = port;
        }
        if let Some(port) = self.static_port {
            config.static_port = port;
        }
        config
    }

    pub fn dhcp(&self) -> Result<DhcpConfig> {
        let d = &self.dhcp;
        let server_ip = d
            .server_ip
            .or(self.static_ip)
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let mut config = DhcpConfig::new(server_ip)
            .with_interfaces(d.interfaces.iter().cloned())
            .with_bind_ip(d.bind_ip)
            .with_port(d.port)
            .with_proxy_only(d.proxy_only)
            .with_probe_timeout(Duration::from_secs(d.probe_timeout_secs));
        for net in &d.networks {
            let net: Ipv4Network = net
                .parse()
                .map_err(|e| eyre!("invalid DHCP network {}: {}", net, e))?;
            config = config.with_network(net);
        }
        Ok(config)
    }
}
