//! TOML configuration.
//!
//! ```toml
//! [server]
//! timeout_ms = 1000
//! idle_timeout_ms = 30000
//!
//! [logging]
//! level = "info"
//!
//! [[hosts]]
//! listen = ["127.0.0.1:8080"]
//! server_names = ["a.example"]
//! root = "www/a"
//!
//! [hosts.cgi]
//! ".py" = "/usr/bin/python3"
//!
//! [[hosts.locations]]
//! path = "/cgi-bin"
//! methods = ["GET", "POST"]
//! ```
//!
//! Relative paths are resolved against the directory holding the config file.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::Deserialize;

use crate::error::ServerError;
use crate::http::{Method, StatusCode};
use crate::vhost::{CgiBinding, Location, Redirect, VirtualHost, VirtualHostTable};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub hosts: Vec<HostConfig>,
    #[serde(skip)]
    base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Upper bound on one multiplexing wait; timers are checked this often.
    pub timeout_ms: i32,
    pub max_events: usize,
    pub idle_timeout_ms: u64,
    pub cgi_timeout_ms: u64,
    pub drain_timeout_ms: u64,
    pub max_header_bytes: usize,
    pub max_connections: usize,
    /// Output bytes queued per connection before file/CGI reads pause.
    pub output_high_water: usize,
    /// CGI output buffered to compute a Content-Length on keep-alive
    /// connections before falling back to close-delimited streaming.
    pub max_cgi_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            timeout_ms: 1000,
            max_events: 1024,
            idle_timeout_ms: 30_000,
            cgi_timeout_ms: 10_000,
            drain_timeout_ms: 10_000,
            max_header_bytes: 8 * 1024,
            max_connections: 1024,
            output_high_water: 256 * 1024,
            max_cgi_buffer: 8 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn cgi_timeout(&self) -> Duration {
        Duration::from_millis(self.cgi_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> Result<log::LevelFilter, ServerError> {
        self.level
            .parse()
            .map_err(|_| ServerError::InvalidConfig(format!("unknown log level {:?}", self.level)))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    pub listen: Vec<String>,
    #[serde(default)]
    pub server_names: Vec<String>,
    pub root: PathBuf,
    #[serde(default = "default_index")]
    pub index: String,
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    #[serde(default = "default_body_size")]
    pub client_max_body_size: usize,
    #[serde(default)]
    pub error_pages: HashMap<String, PathBuf>,
    /// Extension to interpreter; an empty interpreter executes the script.
    #[serde(default)]
    pub cgi: HashMap<String, String>,
    #[serde(default)]
    pub redirects: Vec<RedirectConfig>,
    #[serde(default)]
    pub locations: Vec<LocationConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedirectConfig {
    pub from: String,
    pub to: String,
    #[serde(default = "default_redirect_status")]
    pub status: u16,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocationConfig {
    pub path: String,
    pub methods: Option<Vec<String>>,
    pub root: Option<PathBuf>,
    pub index: Option<String>,
    pub redirect: Option<String>,
    #[serde(default = "default_redirect_status")]
    pub redirect_status: u16,
}

fn default_index() -> String {
    "index.html".to_string()
}

fn default_methods() -> Vec<String> {
    vec!["GET".to_string(), "HEAD".to_string()]
}

fn default_body_size() -> usize {
    1024 * 1024
}

fn default_redirect_status() -> u16 {
    301
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ServerError> {
        let content = fs::read_to_string(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        Config::from_toml(&content, &base_dir)
    }

    pub fn from_toml(content: &str, base_dir: &Path) -> Result<Config, ServerError> {
        let mut config: Config = toml::from_str(content)?;
        config.base_dir = base_dir.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.server.max_events == 0 {
            return Err(ServerError::InvalidConfig("max_events cannot be 0".into()));
        }
        if self.server.timeout_ms < 1 {
            return Err(ServerError::InvalidConfig("timeout_ms must be at least 1".into()));
        }
        if self.server.max_connections == 0 {
            return Err(ServerError::InvalidConfig("max_connections cannot be 0".into()));
        }
        if self.server.max_header_bytes < 64 {
            return Err(ServerError::InvalidConfig("max_header_bytes must be at least 64".into()));
        }
        self.logging.level_filter()?;
        self.virtual_hosts().map(|_| ())
    }

    /// Resolves the host sections into the read-only table used for routing.
    pub fn virtual_hosts(&self) -> Result<VirtualHostTable, ServerError> {
        if self.hosts.is_empty() {
            return Err(ServerError::InvalidConfig("at least one [[hosts]] entry is required".into()));
        }
        let hosts = self
            .hosts
            .iter()
            .map(|h| self.resolve_host(h))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(VirtualHostTable::new(hosts))
    }

    fn resolve_host(&self, h: &HostConfig) -> Result<VirtualHost, ServerError> {
        if h.listen.is_empty() {
            return Err(invalid("a host needs at least one listen address"));
        }
        let listen = h
            .listen
            .iter()
            .map(|l| {
                l.parse::<SocketAddr>()
                    .map_err(|_| invalid(format!("invalid listen address {l:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let root = self.resolve_path(&h.root);

        let mut error_pages = HashMap::new();
        for (code, page) in &h.error_pages {
            let status = code
                .parse::<u16>()
                .ok()
                .and_then(StatusCode::from_u16)
                .ok_or_else(|| invalid(format!("invalid error page status {code:?}")))?;
            let page = if page.is_absolute() { page.clone() } else { root.join(page) };
            error_pages.insert(status.as_u16(), page);
        }

        let mut cgi: Vec<CgiBinding> = h
            .cgi
            .iter()
            .map(|(ext, interpreter)| {
                let extension = if ext.starts_with('.') { ext.clone() } else { format!(".{ext}") };
                if extension.len() < 2 || extension.contains('/') {
                    return Err(invalid(format!("invalid CGI extension {ext:?}")));
                }
                let interpreter = (!interpreter.is_empty()).then(|| PathBuf::from(interpreter));
                Ok(CgiBinding { extension, interpreter })
            })
            .collect::<Result<_, _>>()?;
        cgi.sort_by(|a, b| a.extension.cmp(&b.extension));

        let redirects = h
            .redirects
            .iter()
            .map(|r| {
                if !r.from.starts_with('/') {
                    return Err(invalid(format!("redirect source {:?} must start with '/'", r.from)));
                }
                Ok(Redirect {
                    from: r.from.clone(),
                    to: r.to.clone(),
                    status: redirect_status(r.status)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut locations = h
            .locations
            .iter()
            .map(|l| {
                if !l.path.starts_with('/') {
                    return Err(invalid(format!("location {:?} must start with '/'", l.path)));
                }
                let redirect = match &l.redirect {
                    Some(to) => Some((redirect_status(l.redirect_status)?, to.clone())),
                    None => None,
                };
                Ok(Location {
                    path: l.path.clone(),
                    methods: l.methods.as_deref().map(parse_methods).transpose()?,
                    root: l.root.as_deref().map(|p| self.resolve_path(p)),
                    index: l.index.clone(),
                    redirect,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        locations.sort_by(|a, b| b.path.len().cmp(&a.path.len()));

        Ok(VirtualHost {
            listen,
            server_names: h.server_names.iter().map(|n| n.to_ascii_lowercase()).collect(),
            root,
            index: h.index.clone(),
            methods: parse_methods(&h.methods)?,
            locations,
            redirects,
            error_pages,
            client_max_body_size: h.client_max_body_size,
            cgi,
        })
    }

    fn resolve_path(&self, p: &Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base_dir.join(p)
        }
    }
}

fn invalid(msg: impl Into<String>) -> ServerError {
    ServerError::InvalidConfig(msg.into())
}

fn parse_methods(methods: &[String]) -> Result<Vec<Method>, ServerError> {
    methods
        .iter()
        .map(|m| Method::parse(m).ok_or_else(|| invalid(format!("invalid method {m:?}"))))
        .collect()
}

fn redirect_status(code: u16) -> Result<StatusCode, ServerError> {
    match code {
        301 => Ok(StatusCode::MOVED_PERMANENTLY),
        302 => Ok(StatusCode::FOUND),
        other => Err(invalid(format!("redirect status must be 301 or 302, got {other}"))),
    }
}
