//! Service configuration from environment variables.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::jobs::PipelineConfig;
use crate::runtime::{LxdConfig, LxdEndpoint};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(var: &'static str, value: &str, reason: impl ToString) -> Self {
        Self::Invalid {
            var,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Everything the binary needs to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub bind: SocketAddr,
    pub lxd: LxdConfig,
    /// Used when a request names no destination.
    pub default_destination: PathBuf,
    pub retention: Duration,
    pub prune_interval: Duration,
    /// Zero disables the synchronous grace window.
    pub accept_grace: Duration,
    pub pipeline: PipelineConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080),
            lxd: LxdConfig::default(),
            default_destination: PathBuf::from("/var/backups/ctbackup"),
            retention: Duration::from_secs(120 * 60),
            prune_interval: Duration::from_secs(60),
            accept_grace: Duration::ZERO,
            pipeline: PipelineConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or blank keys keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut cfg = Self::default();

        let port = match get("PORT") {
            Some(v) => v
                .trim()
                .parse::<u16>()
                .map_err(|e| ConfigError::invalid("PORT", &v, e))?,
            None => cfg.bind.port(),
        };
        let ip = match get("BIND_ADDR") {
            Some(v) => v
                .trim()
                .parse::<IpAddr>()
                .map_err(|e| ConfigError::invalid("BIND_ADDR", &v, e))?,
            None => cfg.bind.ip(),
        };
        cfg.bind = SocketAddr::new(ip, port);

        // LXD_URL wins over LXD_SOCKET, which wins over LXD_DIR.
        if let Some(dir) = get("LXD_DIR") {
            cfg.lxd.endpoint = LxdEndpoint::Unix(PathBuf::from(dir.trim()).join("unix.socket"));
        }
        if let Some(socket) = get("LXD_SOCKET") {
            cfg.lxd.endpoint = unix_endpoint("LXD_SOCKET", socket.trim())?;
        }
        if let Some(url) = get("LXD_URL") {
            let url = url.trim().trim_end_matches('/');
            cfg.lxd.endpoint = if let Some(path) = url.strip_prefix("unix://") {
                unix_endpoint("LXD_URL", path)?
            } else if url.starts_with("https://") || url.starts_with("http://") {
                LxdEndpoint::Remote(url.to_string())
            } else {
                return Err(ConfigError::invalid(
                    "LXD_URL",
                    url,
                    "expected an http(s):// or unix:// URL",
                ));
            };
        }
        cfg.lxd.client_cert = get("LXD_CLIENT_CERT").map(PathBuf::from);
        cfg.lxd.client_key = get("LXD_CLIENT_KEY").map(PathBuf::from);
        if cfg.lxd.client_cert.is_some() != cfg.lxd.client_key.is_some() {
            return Err(ConfigError::invalid(
                "LXD_CLIENT_KEY",
                "",
                "LXD_CLIENT_CERT and LXD_CLIENT_KEY must be set together",
            ));
        }
        if let Some(v) = get("LXD_ACCEPT_INVALID_CERTS") {
            cfg.lxd.accept_invalid_certs = parse_bool("LXD_ACCEPT_INVALID_CERTS", &v)?;
        }

        if let Some(v) = get("BACKUP_DESTINATION") {
            let dest = PathBuf::from(v.trim());
            if !dest.is_absolute() {
                return Err(ConfigError::invalid(
                    "BACKUP_DESTINATION",
                    &v,
                    "must be an absolute path",
                ));
            }
            cfg.default_destination = dest;
        }

        if let Some(v) = get("RETENTION_MINUTES") {
            cfg.retention = Duration::from_secs(parse_positive("RETENTION_MINUTES", &v)? * 60);
        }
        if let Some(v) = get("PRUNE_INTERVAL_SECS") {
            cfg.prune_interval = Duration::from_secs(parse_positive("PRUNE_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = get("ACCEPT_GRACE_MS") {
            cfg.accept_grace = Duration::from_millis(parse_u64("ACCEPT_GRACE_MS", &v)?);
        }
        if let Some(v) = get("START_TIMEOUT_SECS") {
            cfg.pipeline.start_timeout =
                Duration::from_secs(parse_positive("START_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("STOP_TIMEOUT_SECS") {
            cfg.pipeline.stop_timeout =
                Duration::from_secs(parse_positive("STOP_TIMEOUT_SECS", &v)?);
        }

        Ok(cfg)
    }
}

fn unix_endpoint(var: &'static str, raw: &str) -> Result<LxdEndpoint, ConfigError> {
    let path = PathBuf::from(raw);
    if !path.is_absolute() {
        return Err(ConfigError::invalid(var, raw, "socket path must be absolute"));
    }
    Ok(LxdEndpoint::Unix(path))
}

fn parse_u64(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|e| ConfigError::invalid(var, raw, e))
}

fn parse_positive(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    match parse_u64(var, raw)? {
        0 => Err(ConfigError::invalid(var, raw, "must be greater than zero")),
        n => Ok(n),
    }
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(var, raw, "expected a boolean")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<ServiceConfig, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg, ServiceConfig::default());
        assert_eq!(cfg.bind.to_string(), "0.0.0.0:8080");
        assert_eq!(cfg.retention, Duration::from_secs(7200));
        assert_eq!(cfg.pipeline.stop_timeout, Duration::from_secs(2));
        assert!(cfg.accept_grace.is_zero());
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = load(&[
            ("PORT", "9000"),
            ("BIND_ADDR", "127.0.0.1"),
            ("LXD_URL", "https://lxd.local:8443/"),
            ("LXD_CLIENT_CERT", "/etc/ctbackup/client.crt"),
            ("LXD_CLIENT_KEY", "/etc/ctbackup/client.key"),
            ("LXD_ACCEPT_INVALID_CERTS", "yes"),
            ("BACKUP_DESTINATION", "/srv/backups"),
            ("RETENTION_MINUTES", "30"),
            ("ACCEPT_GRACE_MS", "250"),
            ("START_TIMEOUT_SECS", "10"),
        ])
        .unwrap();

        assert_eq!(cfg.bind.to_string(), "127.0.0.1:9000");
        assert_eq!(
            cfg.lxd.endpoint,
            LxdEndpoint::Remote("https://lxd.local:8443".to_string())
        );
        assert!(cfg.lxd.accept_invalid_certs);
        assert_eq!(
            cfg.lxd.client_key,
            Some(PathBuf::from("/etc/ctbackup/client.key"))
        );
        assert_eq!(cfg.default_destination, PathBuf::from("/srv/backups"));
        assert_eq!(cfg.retention, Duration::from_secs(1800));
        assert_eq!(cfg.accept_grace, Duration::from_millis(250));
        assert_eq!(cfg.pipeline.start_timeout, Duration::from_secs(10));
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(matches!(
            load(&[("PORT", "http")]),
            Err(ConfigError::Invalid { var: "PORT", .. })
        ));
        assert!(load(&[("RETENTION_MINUTES", "0")]).is_err());
        assert!(load(&[("LXD_ACCEPT_INVALID_CERTS", "maybe")]).is_err());
        assert!(load(&[("BACKUP_DESTINATION", "relative")]).is_err());
        assert!(load(&[("LXD_URL", "ftp://lxd.local")]).is_err());
        assert!(load(&[("LXD_SOCKET", "relative/unix.socket")]).is_err());
        assert!(load(&[("LXD_CLIENT_CERT", "/only/cert.pem")]).is_err());
    }

    #[test]
    fn unix_socket_endpoints() {
        let cfg = load(&[]).unwrap();
        assert!(matches!(cfg.lxd.endpoint, LxdEndpoint::Unix(_)));

        let cfg = load(&[("LXD_SOCKET", "/run/lxd.socket")]).unwrap();
        assert_eq!(
            cfg.lxd.endpoint,
            LxdEndpoint::Unix(PathBuf::from("/run/lxd.socket"))
        );

        let cfg = load(&[("LXD_DIR", "/srv/lxd")]).unwrap();
        assert_eq!(
            cfg.lxd.endpoint,
            LxdEndpoint::Unix(PathBuf::from("/srv/lxd/unix.socket"))
        );

        let cfg = load(&[
            ("LXD_SOCKET", "/run/lxd.socket"),
            ("LXD_URL", "unix:///var/lib/lxd/unix.socket"),
        ])
        .unwrap();
        assert_eq!(
            cfg.lxd.endpoint,
            LxdEndpoint::Unix(PathBuf::from("/var/lib/lxd/unix.socket"))
        );
    }

    #[test]
    fn blank_values_keep_defaults() {
        let cfg = load(&[("PORT", "  "), ("STOP_TIMEOUT_SECS", "")]).unwrap();
        assert_eq!(cfg.bind.port(), 8080);
        assert_eq!(cfg.pipeline.stop_timeout, Duration::from_secs(2));
    }
}
