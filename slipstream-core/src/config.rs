use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Pre-shared key length in raw bytes (64 hex characters on the wire of the
/// config file).
pub const PSK_LEN: usize = 32;

fn default_upstream_dns() -> Vec<Ipv4Addr> {
    vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)]
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration as it appears on disk. The PSK is hex-encoded here and
/// decoded during validation into a [`ProxyConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Hostname presented in the TLS SNI and the HTTP Host header
    pub sni_host: String,
    /// Relay address (IPv4 literal or domain) for the TCP+TLS connect
    pub relay_address: String,
    /// Relay port
    pub relay_port: u16,
    /// WebSocket upgrade path, must begin with '/'
    pub ws_path: String,
    /// Pre-shared key, 64 hex characters
    pub psk: String,
    /// Verify the relay certificate chain instead of accepting any
    /// certificate. The PSK handshake authenticates the endpoint either way.
    #[serde(default)]
    pub verify_certificates: bool,
    /// Upstream DNS resolvers for forwarded UDP/53 queries
    #[serde(default = "default_upstream_dns")]
    pub upstream_dns: Vec<Ipv4Addr>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl ConfigFile {
    /// Validate the file form and decode it into the in-memory config the
    /// core consumes.
    pub fn into_proxy_config(self) -> Result<ProxyConfig> {
        if self.sni_host.is_empty() {
            return Err(Error::config("sni_host cannot be empty"));
        }
        if self.relay_address.is_empty() {
            return Err(Error::config("relay_address cannot be empty"));
        }
        if self.relay_port == 0 {
            return Err(Error::config("relay_port must be between 1 and 65535"));
        }
        if !self.ws_path.starts_with('/') {
            return Err(Error::config("ws_path must begin with '/'"));
        }
        let psk = decode_psk(&self.psk)?;

        Ok(ProxyConfig {
            sni_host: self.sni_host,
            relay_address: self.relay_address,
            relay_port: self.relay_port,
            ws_path: self.ws_path,
            psk,
            verify_certificates: self.verify_certificates,
            upstream_dns: if self.upstream_dns.is_empty() {
                default_upstream_dns()
            } else {
                self.upstream_dns
            },
        })
    }
}

/// Decode a 64-hex-character pre-shared key into its 32 raw bytes.
pub fn decode_psk(input: &str) -> Result<[u8; PSK_LEN]> {
    let trimmed = input.trim();
    if trimmed.len() != PSK_LEN * 2 {
        return Err(Error::config(format!(
            "psk must be {} hex characters, got {}",
            PSK_LEN * 2,
            trimmed.len()
        )));
    }
    let raw = hex::decode(trimmed)
        .map_err(|e| Error::config(format!("psk is not valid hex: {}", e)))?;
    let mut psk = [0u8; PSK_LEN];
    psk.copy_from_slice(&raw);
    Ok(psk)
}

/// Validated, immutable configuration for the proxy core.
///
/// All fields are checked before construction; the core assumes validity.
#[derive(Clone)]
pub struct ProxyConfig {
    pub sni_host: String,
    pub relay_address: String,
    pub relay_port: u16,
    pub ws_path: String,
    pub psk: [u8; PSK_LEN],
    pub verify_certificates: bool,
    pub upstream_dns: Vec<Ipv4Addr>,
}

impl ProxyConfig {
    /// The relay WebSocket URL, e.g. `wss://relay.example.net:443/tunnel`.
    pub fn relay_url(&self) -> String {
        format!(
            "wss://{}:{}{}",
            self.relay_address, self.relay_port, self.ws_path
        )
    }

    /// First configured upstream resolver.
    pub fn primary_dns(&self) -> Ipv4Addr {
        self.upstream_dns
            .first()
            .copied()
            .unwrap_or(Ipv4Addr::new(8, 8, 8, 8))
    }
}

// Keep the PSK out of debug output.
impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("sni_host", &self.sni_host)
            .field("relay_address", &self.relay_address)
            .field("relay_port", &self.relay_port)
            .field("ws_path", &self.ws_path)
            .field("psk", &"[redacted]")
            .field("verify_certificates", &self.verify_certificates)
            .field("upstream_dns", &self.upstream_dns)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file() -> ConfigFile {
        ConfigFile {
            sni_host: "cdn.example.com".to_string(),
            relay_address: "relay.example.net".to_string(),
            relay_port: 443,
            ws_path: "/tunnel".to_string(),
            psk: "00".repeat(32),
            verify_certificates: false,
            upstream_dns: vec![],
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = sample_file().into_proxy_config().unwrap();
        assert_eq!(config.psk, [0u8; 32]);
        assert_eq!(config.relay_url(), "wss://relay.example.net:443/tunnel");
        assert_eq!(config.primary_dns(), Ipv4Addr::new(8, 8, 8, 8));
    }

    #[test]
    fn test_psk_wrong_length() {
        let mut file = sample_file();
        file.psk = "00".repeat(16);
        assert!(file.into_proxy_config().is_err());
    }

    #[test]
    fn test_psk_bad_hex() {
        let mut file = sample_file();
        file.psk = "zz".repeat(32);
        assert!(file.into_proxy_config().is_err());
    }

    #[test]
    fn test_port_zero_rejected() {
        let mut file = sample_file();
        file.relay_port = 0;
        assert!(file.into_proxy_config().is_err());
    }

    #[test]
    fn test_path_must_start_with_slash() {
        let mut file = sample_file();
        file.ws_path = "tunnel".to_string();
        assert!(file.into_proxy_config().is_err());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let yaml = r#"
sni_host: cdn.example.com
relay_address: 203.0.113.10
relay_port: 8443
ws_path: /ws
psk: "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
"#;
        let file: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        let config = file.into_proxy_config().unwrap();
        assert_eq!(config.relay_port, 8443);
        assert!(!config.verify_certificates);
        assert_eq!(config.upstream_dns.len(), 2);
        assert_eq!(config.psk[0], 0x01);
        assert_eq!(config.psk[31], 0xef);
    }

    #[test]
    fn test_debug_redacts_psk() {
        let config = sample_file().into_proxy_config().unwrap();
        let rendered = format!("{:?}", config);
        assert!(rendered.contains("[redacted]"));
        assert!(!rendered.contains("0000"));
    }
}
