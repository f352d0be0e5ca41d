use config::ConfigError as ConfigLibError;
use hyper::header::HeaderValue;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use url::{Host, Url};

/// Origin every inbound request is forwarded to
pub const DEFAULT_UPSTREAM: &str = "https://huggingface.co";

/// SOCKS5 proxy used when neither the environment nor the config file names one
pub const DEFAULT_SOCKS_PROXY: &str = "http-proxy-to-socks:8080";

/// Environment variable holding the SOCKS5 proxy `host:port`
pub const SOCKS_PROXY_ENV: &str = "SOCKS_PROXY";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse config file: {0}")]
    ParseError(String),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Invalid upstream origin '{0}': {1}")]
    InvalidUpstream(String, String),
    #[error("Config library error: {0}")]
    ConfigLibError(#[from] ConfigLibError),
}

/// Configuration structure
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Listen address
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Upstream origin URL
    #[serde(default = "default_upstream")]
    pub upstream: String,
    /// SOCKS5 proxy address, overridden by `SOCKS_PROXY`
    #[serde(default)]
    pub socks_proxy: Option<String>,
    /// Log configuration
    #[serde(default)]
    pub log: LoggerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggerConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file path
    #[serde(default = "default_log_path")]
    pub path: String,
    /// Log file archive pattern
    #[serde(default = "default_archive_pattern")]
    pub archive_pattern: String,
    /// Number of log files to keep
    #[serde(default = "default_file_count")]
    pub file_count: u32,
    /// Size of each log file (MB)
    #[serde(default = "default_file_size")]
    pub file_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            upstream: default_upstream(),
            socks_proxy: None,
            log: LoggerConfig::default(),
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            path: default_log_path(),
            archive_pattern: default_archive_pattern(),
            file_count: default_file_count(),
            file_size: default_file_size(),
        }
    }
}

/// Default listen address
fn default_listen_address() -> String {
    "0.0.0.0:6767".to_string()
}

fn default_upstream() -> String {
    DEFAULT_UPSTREAM.to_string()
}

/// Default log level
fn default_log_level() -> String {
    "Info".to_string()
}

/// Default log path
fn default_log_path() -> String {
    "logs/hf-proxy.log".to_string()
}

/// Default archive pattern
fn default_archive_pattern() -> String {
    "logs/archive/hf-proxy-{}.log".to_string()
}

/// Default file count
fn default_file_count() -> u32 {
    5
}

/// Default file size in MB
fn default_file_size() -> u64 {
    10
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(ConfigError::ConfigLibError)?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate if configuration is valid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_address.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "Listen address cannot be empty".to_string(),
            ));
        }

        if self.listen_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid listen address format: {}",
                self.listen_address
            )));
        }

        UpstreamOrigin::parse(&self.upstream)?;

        if self.log.file_count == 0 || self.log.file_size == 0 {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid log rotation: {} files of {} MB",
                self.log.file_count, self.log.file_size
            )));
        }

        Ok(())
    }

    /// Resolve the SOCKS5 proxy address against the process environment.
    pub fn socks_address(&self) -> SocksAddress {
        let from_env = std::env::var(SOCKS_PROXY_ENV).ok();
        resolve_socks_address(from_env.as_deref(), self.socks_proxy.as_deref())
    }
}

/// Where the SOCKS5 proxy address came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksAddressSource {
    Environment,
    ConfigFile,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksAddress {
    pub address: String,
    pub source: SocksAddressSource,
}

impl SocksAddress {
    pub fn used_default(&self) -> bool {
        self.source == SocksAddressSource::Default
    }
}

/// Picks the first non-empty of the environment value and the configured
/// value, falling back to [`DEFAULT_SOCKS_PROXY`].
pub fn resolve_socks_address(env_value: Option<&str>, configured: Option<&str>) -> SocksAddress {
    if let Some(address) = env_value.filter(|v| !v.is_empty()) {
        return SocksAddress {
            address: address.to_string(),
            source: SocksAddressSource::Environment,
        };
    }
    if let Some(address) = configured.filter(|v| !v.is_empty()) {
        return SocksAddress {
            address: address.to_string(),
            source: SocksAddressSource::ConfigFile,
        };
    }
    SocksAddress {
        address: DEFAULT_SOCKS_PROXY.to_string(),
        source: SocksAddressSource::Default,
    }
}

/// Parsed upstream origin together with the header values derived from it.
#[derive(Debug, Clone)]
pub struct UpstreamOrigin {
    url: Url,
    dial_host: String,
    port: u16,
    host_header: HeaderValue,
    referer_header: HeaderValue,
}

impl UpstreamOrigin {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidUpstream(raw.to_string(), reason);

        let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
        }

        let dial_host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(invalid("missing host".to_string())),
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("missing port".to_string()))?;

        // `host_str` keeps IPv6 brackets; `port` is only set when non-default.
        let host_str = url.host_str().unwrap_or_default();
        let host = match url.port() {
            Some(port) => format!("{}:{}", host_str, port),
            None => host_str.to_string(),
        };

        let mut referer = url.origin().ascii_serialization();
        if url.path() != "/" {
            referer.push_str(url.path());
        }
        if let Some(query) = url.query() {
            referer.push('?');
            referer.push_str(query);
        }

        let host_header = HeaderValue::from_str(&host).map_err(|e| invalid(e.to_string()))?;
        let referer_header =
            HeaderValue::from_str(&referer).map_err(|e| invalid(e.to_string()))?;

        Ok(UpstreamOrigin {
            url,
            dial_host,
            port,
            host_header,
            referer_header,
        })
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn is_tls(&self) -> bool {
        self.url.scheme() == "https"
    }

    /// Authority as sent in the `Host` header.
    pub fn host(&self) -> &str {
        self.host_header.to_str().unwrap_or_default()
    }

    /// Host name or IP literal to dial, without brackets.
    pub fn dial_host(&self) -> &str {
        &self.dial_host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_path(&self) -> &str {
        self.url.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.url.query()
    }

    pub fn host_header(&self) -> &HeaderValue {
        &self.host_header
    }

    /// Full origin URL, e.g. `https://huggingface.co`.
    pub fn referer(&self) -> &str {
        self.referer_header.to_str().unwrap_or_default()
    }

    pub fn referer_header(&self) -> &HeaderValue {
        &self.referer_header
    }
}
