//! Engine configuration.

use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Size morphing strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MorphKind {
    /// Frames go out as single packets, no size shaping.
    #[default]
    None,
    /// Random fragment sizes in a band below the MTU.
    Randsize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonConfig {
    /// Pre-shared key.
    pub key: String,
    /// Tunnel MTU.
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// Seconds of silence before a peer is kicked. 0 disables the watcher.
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout: u64,
    #[serde(default)]
    pub morph: MorphKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the UDP sockets bind to.
    #[serde(default = "default_listen")]
    pub listen: IpAddr,
    /// Inclusive port range to listen and hop across.
    pub port_range: [u16; 2],
    /// Subnet tunnel addresses are assigned from, CIDR notation.
    pub tunnel_network: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub common: CommonConfig,
    pub server: ServerConfig,
}

fn default_mtu() -> usize {
    porthop_protocol::DEFAULT_MTU
}

fn default_peer_timeout() -> u64 {
    600
}

fn default_listen() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let text = std::fs::read_to_string(path)?;
        Config::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Config> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.common.key.is_empty() {
            return Err(Error::Config("key must not be empty".into()));
        }
        if self.common.mtu < 576 || self.common.mtu > 9000 {
            return Err(Error::Config(format!(
                "mtu {} out of range (576..=9000)",
                self.common.mtu
            )));
        }
        let [start, end] = self.server.port_range;
        if start == 0 || start > end {
            return Err(Error::Config(format!(
                "bad port range {start}..={end}"
            )));
        }
        porthop_protocol::Ipv4Pool::from_cidr(&self.server.tunnel_network)
            .map_err(|e| Error::Config(format!("tunnel_network: {e}")))?;
        Ok(())
    }

    /// Number of listening ports.
    pub fn port_count(&self) -> usize {
        let [start, end] = self.server.port_range;
        (end - start) as usize + 1
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        let [start, end] = self.server.port_range;
        start..=end
    }

    /// A commented sample configuration.
    pub fn sample() -> &'static str {
        r#"# porthop server configuration

[common]
# pre-shared key, must match the clients
key = "change me"
# tunnel MTU
mtu = 1400
# seconds of silence before a peer is dropped; 0 disables the check
peer_timeout = 600
# packet size shaping: "none" or "randsize"
morph = "none"

[server]
# address the UDP sockets bind to
listen = "0.0.0.0"
# inclusive UDP port range to hop across
port_range = [40000, 40050]
# subnet for tunnel addresses; the first host is the server's
tunnel_network = "10.1.1.0/24"
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_parses_and_validates() {
        let config = Config::from_toml(Config::sample()).unwrap();
        assert_eq!(config.common.mtu, 1400);
        assert_eq!(config.common.morph, MorphKind::None);
        assert_eq!(config.port_count(), 51);
    }

    #[test]
    fn defaults_apply() {
        let config = Config::from_toml(
            r#"
            [common]
            key = "k"
            [server]
            port_range = [40000, 40004]
            tunnel_network = "10.1.1.0/24"
            "#,
        )
        .unwrap();
        assert_eq!(config.common.peer_timeout, 600);
        assert_eq!(config.common.mtu, 1400);
        assert!(config.server.listen.is_unspecified());
    }

    #[test]
    fn rejects_inverted_port_range() {
        let err = Config::from_toml(
            r#"
            [common]
            key = "k"
            [server]
            port_range = [40010, 40000]
            tunnel_network = "10.1.1.0/24"
            "#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn rejects_bad_network() {
        let err = Config::from_toml(
            r#"
            [common]
            key = "k"
            [server]
            port_range = [40000, 40001]
            tunnel_network = "not a subnet"
            "#,
        );
        assert!(err.is_err());
    }
}
