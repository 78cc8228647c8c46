//! Resolved, read-only virtual host table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::http::{Method, StatusCode};

#[derive(Debug, Clone)]
pub struct VirtualHost {
    pub listen: Vec<SocketAddr>,
    /// Lowercased; may start with `*.` to match any subdomain.
    pub server_names: Vec<String>,
    pub root: PathBuf,
    pub index: String,
    /// Methods allowed where no location overrides them.
    pub methods: Vec<Method>,
    /// Sorted longest path first.
    pub locations: Vec<Location>,
    pub redirects: Vec<Redirect>,
    pub error_pages: HashMap<u16, PathBuf>,
    pub client_max_body_size: usize,
    pub cgi: Vec<CgiBinding>,
}

#[derive(Debug, Clone)]
pub struct Location {
    pub path: String,
    pub methods: Option<Vec<Method>>,
    /// Alias: the location prefix is replaced by this directory.
    pub root: Option<PathBuf>,
    pub index: Option<String>,
    pub redirect: Option<(StatusCode, String)>,
}

/// Exact-path redirect rule.
#[derive(Debug, Clone)]
pub struct Redirect {
    pub from: String,
    pub to: String,
    pub status: StatusCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiBinding {
    /// Includes the leading dot.
    pub extension: String,
    /// `None` runs the script itself.
    pub interpreter: Option<PathBuf>,
}

impl VirtualHost {
    pub fn matches_name(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.server_names.iter().any(|name| match name.strip_prefix("*.") {
            Some(suffix) => host.len() > suffix.len() + 1
                && host.ends_with(suffix)
                && host.as_bytes()[host.len() - suffix.len() - 1] == b'.',
            None => *name == host,
        })
    }

    /// Longest location whose path is a segment-wise prefix of `path`.
    pub fn find_location(&self, path: &str) -> Option<&Location> {
        self.locations.iter().find(|loc| location_matches(&loc.path, path))
    }

    pub fn find_redirect(&self, path: &str) -> Option<&Redirect> {
        self.redirects.iter().find(|r| r.from == path)
    }

    /// CGI binding for a file name, by suffix.
    pub fn cgi_binding(&self, file_name: &str) -> Option<&CgiBinding> {
        self.cgi
            .iter()
            .filter(|b| file_name.len() > b.extension.len() && file_name.ends_with(&b.extension))
            .max_by_key(|b| b.extension.len())
    }

    pub fn error_page(&self, status: StatusCode) -> Option<&Path> {
        self.error_pages.get(&status.as_u16()).map(PathBuf::as_path)
    }
}

fn location_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" || prefix == path {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => prefix.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

/// All virtual hosts, in configuration order. The first host bound to an
/// address is that address's default.
#[derive(Debug, Clone)]
pub struct VirtualHostTable {
    hosts: Vec<VirtualHost>,
}

impl VirtualHostTable {
    pub fn new(hosts: Vec<VirtualHost>) -> Self {
        VirtualHostTable { hosts }
    }

    pub fn get(&self, index: usize) -> Option<&VirtualHost> {
        self.hosts.get(index)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VirtualHost> {
        self.hosts.iter()
    }

    /// Distinct listen addresses with the hosts bound to each, in
    /// configuration order.
    pub fn bindings(&self) -> Vec<(SocketAddr, Vec<usize>)> {
        let mut out: Vec<(SocketAddr, Vec<usize>)> = Vec::new();
        for (i, host) in self.hosts.iter().enumerate() {
            for addr in &host.listen {
                match out.iter_mut().find(|(a, _)| a == addr) {
                    Some((_, hosts)) => hosts.push(i),
                    None => out.push((*addr, vec![i])),
                }
            }
        }
        out
    }
}
