//! Daemon configuration, deserialized from a single config file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Which resolver backend drives DNS lookups.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResolverBackend {
    /// A stub client that sends UDP queries to `name_server` over one
    /// socket owned by the proxy.
    Stub,
    /// A self-contained resolver library with DNSSEC validation; it owns
    /// its sockets and timers.
    #[default]
    Validating,
}

/// Top-level proxy configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct ProxyConfig {
    /// TCP endpoints accepting client connections.
    pub listen: Vec<SocketAddr>,

    /// Path of the Unix-domain statistics socket. Disabled when unset.
    #[serde(default)]
    pub stat_socket: Option<PathBuf>,

    /// Local endpoint outbound origin connections are bound to.
    /// Unset, or an unspecified address with port zero, lets the kernel
    /// choose.
    #[serde(default)]
    pub outbound_http: Option<SocketAddr>,

    /// Local endpoint the stub resolver socket is bound to.
    #[serde(default)]
    pub outbound_dns: Option<SocketAddr>,

    /// Name server used by the stub backend; also used by the validating
    /// backend instead of the system configuration when present.
    #[serde(default)]
    pub name_server: Option<SocketAddr>,

    /// Resolver backend selection.
    #[serde(default)]
    pub resolver: ResolverBackend,

    /// Idle-read timeout applied per relay channel.
    #[serde(default = "default_receive_timeout", with = "humantime_serde")]
    pub receive_timeout: Duration,

    /// Timeout for each outbound connect attempt.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Timeout for resolving the request host, enforced per session.
    #[serde(default = "default_resolve_timeout", with = "humantime_serde")]
    pub resolve_timeout: Duration,

    /// Header names forwarded to the origin.
    #[serde(default)]
    pub allow_headers: Vec<String>,

    /// Header rename rules, `Original:Replacement`. A rename implies the
    /// original name is allowed.
    #[serde(default)]
    pub rename_headers: Vec<String>,

    /// Directory holding `<status>.http` canned response files.
    #[serde(default = "default_error_pages")]
    pub error_pages: PathBuf,

    /// Log filter directive, overridable with `RUST_LOG`.
    #[serde(default = "default_log")]
    pub log: String,
}

fn default_receive_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_resolve_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_error_pages() -> PathBuf {
    PathBuf::from("/etc/spliced/errors")
}

fn default_log() -> String {
    "info".to_owned()
}

impl Default for ProxyConfig {
    fn default() -> ProxyConfig {
        ProxyConfig {
            listen: Vec::new(),
            stat_socket: None,
            outbound_http: None,
            outbound_dns: None,
            name_server: None,
            resolver: ResolverBackend::default(),
            receive_timeout: default_receive_timeout(),
            connect_timeout: default_connect_timeout(),
            resolve_timeout: default_resolve_timeout(),
            allow_headers: Vec::new(),
            rename_headers: Vec::new(),
            error_pages: default_error_pages(),
            log: default_log(),
        }
    }
}

impl ProxyConfig {
    /// Loads and validates the configuration from `path`.
    pub fn load(path: &Path) -> crate::Result<ProxyConfig> {
        let cfg: ProxyConfig = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(crate::Error::new_config)?
            .try_deserialize()
            .map_err(crate::Error::new_config)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks cross-field requirements that serde cannot express.
    pub fn validate(&self) -> crate::Result<()> {
        if self.listen.is_empty() {
            return Err(crate::Error::new_config("no listen endpoints configured"));
        }
        if self.resolver == ResolverBackend::Stub && self.name_server.is_none() {
            return Err(crate::Error::new_config(
                "the stub resolver backend requires name_server",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_backend_requires_name_server() {
        let cfg = ProxyConfig {
            listen: vec!["127.0.0.1:0".parse().unwrap()],
            resolver: ResolverBackend::Stub,
            ..ProxyConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ProxyConfig {
            name_server: Some("127.0.0.1:53".parse().unwrap()),
            ..cfg
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn listen_must_not_be_empty() {
        assert!(ProxyConfig::default().validate().is_err());
    }

    #[test]
    fn defaults_match_daemon_contract() {
        let cfg = ProxyConfig::default();
        assert_eq!(cfg.receive_timeout, Duration::from_secs(3600));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(3));
        assert_eq!(cfg.resolve_timeout, Duration::from_secs(3));
        assert_eq!(cfg.resolver, ResolverBackend::Validating);
    }
}
