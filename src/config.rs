use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use toml::{Table, Value};

/// Schema version written by this build
pub const CURRENT_CONFIG_VERSION: i64 = 2;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: i64, supported: i64 },

    #[error("config field 'version' must be an integer")]
    InvalidVersion,

    #[error("Configuration errors:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Schema version (stamped by [`migrate`])
    pub version: i64,

    /// Listener and on-disk layout settings
    #[serde(default)]
    pub server: ServerConfig,

    /// FastCGI worker pool
    #[serde(default)]
    pub fastcgi: FastCgiConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Virtual hosts, in resolution order
    #[serde(default)]
    pub sites: Vec<SiteConfig>,

    /// Reverse proxy routes, in match order
    #[serde(default)]
    pub proxies: Vec<ProxyRoute>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP port (default: 80, set to 0 to disable)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// HTTPS port (default: 443, set to 0 to disable)
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Parent of every `<host>/public_www` document root
    #[serde(default = "default_www_root")]
    pub www_root: PathBuf,

    /// Holds `<domain>/certificate.crt` + `<domain>/private.key` and the `no_cert` fallback
    #[serde(default = "default_cert_root")]
    pub cert_root: PathBuf,

    /// Holds `<domain>_vAccess.conf` files for proxied domains
    #[serde(default = "default_proxy_access_root")]
    pub proxy_access_root: PathBuf,

    /// HTML page served for not-found outcomes
    #[serde(default = "default_error_page")]
    pub error_page: PathBuf,

    /// Global switch for the reverse proxy
    #[serde(default)]
    pub proxy_enabled: bool,

    /// Certificate issuance is handled outside the gateway; carried for the issuer
    #[serde(default)]
    pub acme_enabled: bool,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl ServerConfig {
    /// Document root for a canonical host
    pub fn document_root(&self, host: &str) -> PathBuf {
        self.site_dir(host).join("public_www")
    }

    /// Directory holding the site's root rule file
    pub fn site_dir(&self, host: &str) -> PathBuf {
        self.www_root.join(host)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            www_root: default_www_root(),
            cert_root: default_cert_root(),
            proxy_access_root: default_proxy_access_root(),
            error_page: default_error_page(),
            proxy_enabled: false,
            acme_enabled: false,
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FastCgiConfig {
    /// Start the worker pool with the service (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Worker executable (default: php-cgi)
    #[serde(default = "default_fastcgi_command")]
    pub command: String,

    /// Loopback address the workers bind to
    #[serde(default = "default_fastcgi_host")]
    pub host: String,

    /// Port of worker 0; worker i listens on base_port + i
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    #[serde(default = "default_workers")]
    pub workers: u16,

    /// Delay between worker launches
    #[serde(default = "default_start_stagger")]
    pub start_stagger_ms: u64,

    /// Back-off before a crashed worker is respawned
    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle limit for each read of the response stream
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Passed to workers as PHP_FCGI_MAX_REQUESTS
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// File extensions executed through FastCGI (default: [".php"])
    #[serde(default = "default_script_extensions")]
    pub script_extensions: Vec<String>,
}

impl FastCgiConfig {
    /// Ports of the pool, worker 0 first
    pub fn ports(&self) -> Vec<u16> {
        (0..self.workers)
            .filter_map(|i| self.base_port.checked_add(i))
            .collect()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn start_stagger(&self) -> Duration {
        Duration::from_millis(self.start_stagger_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    /// Whether a file should be executed rather than transferred
    pub fn is_script(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let name = name.to_ascii_lowercase();
        self.script_extensions
            .iter()
            .any(|ext| name.ends_with(&ext.to_ascii_lowercase()))
    }
}

impl Default for FastCgiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: default_fastcgi_command(),
            host: default_fastcgi_host(),
            base_port: default_base_port(),
            workers: default_workers(),
            start_stagger_ms: default_start_stagger(),
            restart_delay_ms: default_restart_delay(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            max_requests: default_max_requests(),
            script_extensions: default_script_extensions(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default filter level when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// A virtual host
#[derive(Debug, Deserialize, Clone)]
pub struct SiteConfig {
    #[serde(default)]
    pub name: String,

    /// Canonical host name; also the directory name under www_root
    pub host: String,

    /// Secondary host names resolving to this site
    #[serde(default)]
    pub alias: Vec<String>,

    /// "active" or "inactive"
    #[serde(default = "default_site_status")]
    pub status: String,

    /// Comma-separated index file names, in priority order
    #[serde(default = "default_root_file")]
    pub root_file: String,

    /// Route unmatched paths to the root file
    #[serde(default)]
    pub root_file_routing: bool,

    /// Certificate issuance is handled outside the gateway; carried for the issuer
    #[serde(default)]
    pub auto_create_ssl: bool,
}

impl SiteConfig {
    pub fn is_active(&self) -> bool {
        self.status.trim().eq_ignore_ascii_case("active")
    }

    /// Index file candidates, in priority order
    pub fn root_files(&self) -> Vec<String> {
        let files: Vec<String> = self
            .root_file
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(String::from)
            .collect();

        if files.is_empty() {
            vec![default_root_file()]
        } else {
            files
        }
    }

    pub fn answers_to(&self, host: &str) -> bool {
        self.host.eq_ignore_ascii_case(host)
            || self.alias.iter().any(|a| a.eq_ignore_ascii_case(host))
    }
}

/// Maps an external host name to a local backend
#[derive(Debug, Deserialize, Clone)]
pub struct ProxyRoute {
    #[serde(default)]
    pub enable: bool,

    pub external_domain: String,

    #[serde(default = "default_local_address")]
    pub local_address: String,

    /// Kept as a string to stay compatible with existing config files
    pub local_port: String,

    /// Backend speaks HTTPS (its certificate is not verified)
    #[serde(default)]
    pub service_https_use: bool,

    /// Redirect plain HTTP requests to HTTPS before forwarding
    #[serde(default)]
    pub auto_https: bool,

    /// Certificate issuance is handled outside the gateway; carried for the issuer
    #[serde(default)]
    pub auto_create_ssl: bool,
}

impl ProxyRoute {
    pub fn local_scheme(&self) -> &'static str {
        if self.service_https_use {
            "https"
        } else {
            "http"
        }
    }

    /// `scheme://address:port` of the backend, without a trailing slash
    pub fn backend_url(&self) -> String {
        format!(
            "{}://{}:{}",
            self.local_scheme(),
            self.local_address,
            self.local_port.trim()
        )
    }

    pub fn matches(&self, host: &str) -> bool {
        self.enable && self.external_domain.eq_ignore_ascii_case(host)
    }
}

fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_www_root() -> PathBuf {
    PathBuf::from("WebServer/www")
}

fn default_cert_root() -> PathBuf {
    PathBuf::from("WebServer/cert")
}

fn default_proxy_access_root() -> PathBuf {
    PathBuf::from("WebServer/tools/Proxy_vAccess")
}

fn default_error_page() -> PathBuf {
    PathBuf::from("WebServer/tools/error_page/index.html")
}

fn default_fastcgi_command() -> String {
    "php-cgi".to_string()
}

fn default_fastcgi_host() -> String {
    "127.0.0.1".to_string()
}

fn default_base_port() -> u16 {
    9000
}

fn default_workers() -> u16 {
    4
}

fn default_start_stagger() -> u64 {
    200 // milliseconds
}

fn default_restart_delay() -> u64 {
    1000 // milliseconds
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_read_timeout() -> u64 {
    30
}

fn default_max_requests() -> u32 {
    1000
}

fn default_script_extensions() -> Vec<String> {
    vec![".php".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_site_status() -> String {
    "active".to_string()
}

fn default_root_file() -> String {
    "index.html".to_string()
}

fn default_local_address() -> String {
    "127.0.0.1".to_string()
}

/// Upgrade a raw config document to [`CURRENT_CONFIG_VERSION`].
///
/// Returns the upgraded document and the version it started from. Documents
/// without a `version` key are treated as version 1. The input is consumed and
/// a new document is produced; nothing shared is touched.
pub fn migrate(mut doc: Table) -> Result<(Table, i64), ConfigError> {
    let from = match doc.get("version") {
        None => 1,
        Some(Value::Integer(v)) => *v,
        Some(_) => return Err(ConfigError::InvalidVersion),
    };

    if from > CURRENT_CONFIG_VERSION {
        return Err(ConfigError::UnsupportedVersion {
            found: from,
            supported: CURRENT_CONFIG_VERSION,
        });
    }

    if from < 2 {
        // Version 2 introduced the certificate issuance flags
        if let Some(Value::Table(server)) = doc.get_mut("server") {
            server
                .entry("acme_enabled")
                .or_insert(Value::Boolean(false));
        }
        for section in ["sites", "proxies"] {
            if let Some(Value::Array(entries)) = doc.get_mut(section) {
                for entry in entries.iter_mut() {
                    if let Value::Table(entry) = entry {
                        entry
                            .entry("auto_create_ssl")
                            .or_insert(Value::Boolean(false));
                    }
                }
            }
        }
    }

    doc.insert("version".to_string(), Value::Integer(CURRENT_CONFIG_VERSION));
    Ok((doc, from))
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let doc: Table = toml::from_str(content)?;
        let (doc, from) = migrate(doc)?;
        if from != CURRENT_CONFIG_VERSION {
            tracing::info!(
                from,
                to = CURRENT_CONFIG_VERSION,
                "Migrated configuration schema"
            );
        }
        let config: Config = Value::Table(doc).try_into()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        let mut seen_hosts: Vec<String> = Vec::new();
        for (i, site) in self.sites.iter().enumerate() {
            let host = site.host.trim().to_ascii_lowercase();
            if host.is_empty() {
                errors.push(format!("Site #{}: 'host' must not be empty", i + 1));
                continue;
            }
            if seen_hosts.contains(&host) {
                errors.push(format!("Site '{}': host is configured more than once", host));
            }
            seen_hosts.push(host);
        }

        for (i, route) in self.proxies.iter().enumerate() {
            if route.external_domain.trim().is_empty() {
                errors.push(format!(
                    "Proxy #{}: 'external_domain' must not be empty",
                    i + 1
                ));
            }
            match route.local_port.trim().parse::<u16>() {
                Ok(port) if port > 0 => {}
                _ => errors.push(format!(
                    "Proxy '{}': 'local_port' must be a port number, got '{}'",
                    route.external_domain, route.local_port
                )),
            }
        }

        if self.fastcgi.workers == 0 {
            errors.push("FastCGI: 'workers' must be at least 1".to_string());
        } else if u32::from(self.fastcgi.base_port) + u32::from(self.fastcgi.workers) - 1
            > u32::from(u16::MAX)
        {
            errors.push(format!(
                "FastCGI: ports {}..{} do not fit in the port range",
                self.fastcgi.base_port,
                u32::from(self.fastcgi.base_port) + u32::from(self.fastcgi.workers) - 1
            ));
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        Ok(())
    }

    /// Active site for a host or alias, first match wins
    pub fn find_site(&self, host: &str) -> Option<&SiteConfig> {
        self.sites
            .iter()
            .filter(|s| s.is_active())
            .find(|s| s.answers_to(host))
    }

    /// First enabled proxy route for an external host
    pub fn find_proxy(&self, host: &str) -> Option<&ProxyRoute> {
        self.proxies.iter().find(|r| r.matches(host))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CURRENT_CONFIG_VERSION,
            server: ServerConfig::default(),
            fastcgi: FastCgiConfig::default(),
            logging: LoggingConfig::default(),
            sites: Vec::new(),
            proxies: Vec::new(),
        }
    }
}
