use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::{fs, net::SocketAddr, path::Path, time::Duration};

use crate::security::parse_trusted_proxies;

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    pub log_file: Option<String>,
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub limits: Limits,
    pub standalone: Option<StandaloneConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListenConfig {
    /// Replaces the port of every bind address handed to us.
    pub port: Option<u16>,
    #[serde(default)]
    pub disable_tls: bool,
    pub tls: Option<TlsConfig>,
    pub trusted_proxies: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

/// Bind addresses and backend used when no managed-transport environment is present.
#[derive(Debug, Deserialize)]
pub struct StandaloneConfig {
    pub bind: Vec<SocketAddr>,
    pub backend: SocketAddr,
}

/// Protocol constants of the relay. The defaults are what clients expect;
/// changing them is mostly useful for tests and lab deployments.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Session ids shorter than this are rejected, as a weak defense against
    /// clients sending empty or easily colliding ids.
    pub min_session_id_length: usize,
    /// Largest accepted request body and largest chunk returned in a response.
    pub max_payload_length: usize,
    /// How long a transaction waits for backend output before answering.
    pub turnaround_timeout_ms: u64,
    pub read_write_timeout_secs: u64,
    /// Idle time after which a session and its backend connection are culled.
    pub max_session_staleness_secs: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            min_session_id_length: 32,
            max_payload_length: 0x10000,
            turnaround_timeout_ms: 10,
            read_write_timeout_secs: 20,
            max_session_staleness_secs: 120,
        }
    }
}

impl Limits {
    #[must_use]
    pub const fn turnaround_timeout(&self) -> Duration {
        Duration::from_millis(self.turnaround_timeout_ms)
    }

    #[must_use]
    pub const fn read_write_timeout(&self) -> Duration {
        Duration::from_secs(self.read_write_timeout_secs)
    }

    #[must_use]
    pub const fn max_session_staleness(&self) -> Duration {
        Duration::from_secs(self.max_session_staleness_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.max_payload_length == 0 {
            bail!("limits.max_payload_length must be greater than zero");
        }
        if self.turnaround_timeout_ms == 0 {
            bail!("limits.turnaround_timeout_ms must be greater than zero");
        }
        if self.read_write_timeout_secs == 0 {
            bail!("limits.read_write_timeout_secs must be greater than zero");
        }
        if self.max_session_staleness_secs == 0 {
            bail!("limits.max_session_staleness_secs must be greater than zero");
        }
        Ok(())
    }
}

impl Config {
    /// Checks option combinations that cannot be expressed in the TOML schema.
    pub fn validate(&self) -> Result<()> {
        match (self.listen.disable_tls, &self.listen.tls) {
            (true, Some(_)) => {
                bail!("The [listen.tls] cert_file and key_file options are not allowed with disable_tls")
            }
            (false, None) => {
                bail!("The [listen.tls] cert_file and key_file options are required unless disable_tls is set")
            }
            _ => {}
        }

        if let Some(entries) = &self.listen.trusted_proxies {
            parse_trusted_proxies(entries)?;
        }

        self.limits.validate()
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).context("Failed to parse configuration as valid TOML")
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_config(&content).with_context(|| format!("Invalid configuration in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"
        log_file = "relay.log"

        [listen]
        port = 8443
        trusted_proxies = ["10.0.0.0/8", "192.0.2.7"]

        [listen.tls]
        cert_file = "cert.pem"
        key_file = "key.pem"

        [limits]
        turnaround_timeout_ms = 25

        [standalone]
        bind = ["127.0.0.1:8080", "[::1]:8080"]
        backend = "127.0.0.1:9001"
    "#;

    #[test]
    fn parses_full_config() {
        let config = parse_config(FULL_CONFIG).unwrap();
        assert_eq!(config.log_file.as_deref(), Some("relay.log"));
        assert_eq!(config.listen.port, Some(8443));
        assert!(!config.listen.disable_tls);
        assert_eq!(config.listen.tls.as_ref().unwrap().cert_file, "cert.pem");
        assert_eq!(config.limits.turnaround_timeout(), Duration::from_millis(25));
        assert_eq!(config.limits.max_payload_length, 0x10000);

        let standalone = config.standalone.as_ref().unwrap();
        assert_eq!(standalone.bind.len(), 2);
        assert_eq!(standalone.backend, "127.0.0.1:9001".parse().unwrap());
        config.validate().unwrap();
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.limits.min_session_id_length, 32);
        assert_eq!(config.limits.max_session_staleness(), Duration::from_secs(120));
        assert!(config.standalone.is_none());
    }

    #[test]
    fn requires_tls_files_unless_disabled() {
        let config = parse_config("").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("required"));

        let config = parse_config("[listen]\ndisable_tls = true\n").unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn rejects_tls_files_with_disable_tls() {
        let config = parse_config(
            "[listen]\ndisable_tls = true\n[listen.tls]\ncert_file = \"c\"\nkey_file = \"k\"\n",
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[test]
    fn rejects_invalid_trusted_proxy() {
        let config = parse_config(
            "[listen]\ndisable_tls = true\ntrusted_proxies = [\"not-an-ip\"]\n",
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_limits() {
        let config =
            parse_config("[listen]\ndisable_tls = true\n[limits]\nmax_payload_length = 0\n")
                .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reports_missing_file() {
        let err = load_config("/nonexistent/meek-relay.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }
}
