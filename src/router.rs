//! Virtual host selection and request routing.

use std::path::PathBuf;

use crate::error::HttpError;
use crate::http::{Method, Request, StatusCode};
use crate::vhost::{Location, VirtualHost, VirtualHostTable};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub host: usize,
    pub target: Target,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Redirect { status: StatusCode, location: String },
    Static { path: PathBuf, root: PathBuf, index: String },
    Cgi(CgiTarget),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiTarget {
    pub script: PathBuf,
    pub interpreter: Option<PathBuf>,
    /// URL path of the script itself.
    pub script_name: String,
    /// URL path following the script name, empty when there is none.
    pub path_info: String,
    /// Effective document root the script was found under.
    pub root: PathBuf,
}

/// Picks the host serving a request that arrived on a listener bound for
/// `candidates`. Falls back to the listener's first host when no server name
/// matches, so the result is always one of `candidates`.
pub fn select_host(table: &VirtualHostTable, candidates: &[usize], host_header: Option<&str>) -> usize {
    let default = candidates.first().copied().unwrap_or(0);
    let Some(name) = host_header else {
        return default;
    };
    candidates
        .iter()
        .copied()
        .find(|&i| table.get(i).is_some_and(|h| h.matches_name(name)))
        .unwrap_or(default)
}

pub fn route(table: &VirtualHostTable, host_index: usize, req: &Request) -> Result<Route, HttpError> {
    let host = table
        .get(host_index)
        .ok_or_else(|| HttpError::InternalError(format!("no virtual host {host_index}")))?;
    let target = resolve(host, req)?;
    Ok(Route {
        host: host_index,
        target,
    })
}

fn resolve(host: &VirtualHost, req: &Request) -> Result<Target, HttpError> {
    let raw_path = req.path();
    if !raw_path.starts_with('/') {
        // Only `*` gets here; it names no resource.
        return Err(HttpError::NotFound);
    }

    if let Some(r) = host.find_redirect(raw_path) {
        return Ok(Target::Redirect {
            status: r.status,
            location: r.to.clone(),
        });
    }

    let decoded = percent_decode(raw_path)?;
    let segments = normalize(&decoded)?;
    let mut path = format!("/{}", segments.join("/"));
    if decoded.ends_with('/') && !segments.is_empty() {
        path.push('/');
    }

    let location = host.find_location(&path);
    if let Some((status, to)) = location.and_then(|l| l.redirect.as_ref()) {
        return Ok(Target::Redirect {
            status: *status,
            location: to.clone(),
        });
    }

    let allowed = location
        .and_then(|l| l.methods.as_ref())
        .unwrap_or(&host.methods);
    if !method_allowed(allowed, &req.method) {
        return Err(HttpError::MethodNotAllowed(allowed.clone()));
    }

    let root = location
        .and_then(|l| l.root.clone())
        .unwrap_or_else(|| host.root.clone());

    for (i, segment) in segments.iter().enumerate() {
        if let Some(binding) = host.cgi_binding(segment) {
            let script_name = format!("/{}", segments[..=i].join("/"));
            let path_info = if i + 1 < segments.len() {
                format!("/{}", segments[i + 1..].join("/"))
            } else {
                String::new()
            };
            return Ok(Target::Cgi(CgiTarget {
                script: map_to_fs(host, location, &script_name),
                interpreter: binding.interpreter.clone(),
                script_name,
                path_info,
                root,
            }));
        }
    }

    let index = location
        .and_then(|l| l.index.clone())
        .unwrap_or_else(|| host.index.clone());
    Ok(Target::Static {
        path: map_to_fs(host, location, &path),
        root,
        index,
    })
}

/// GET permits HEAD.
fn method_allowed(allowed: &[Method], method: &Method) -> bool {
    allowed.contains(method) || (*method == Method::Head && allowed.contains(&Method::Get))
}

/// Maps a normalised URL path onto the filesystem, applying a location alias.
fn map_to_fs(host: &VirtualHost, location: Option<&Location>, url_path: &str) -> PathBuf {
    match location.and_then(|l| l.root.as_ref().map(|r| (l, r))) {
        Some((loc, alias)) => {
            let rest = url_path.strip_prefix(loc.path.as_str()).unwrap_or(url_path);
            alias.join(rest.trim_start_matches('/'))
        }
        None => host.root.join(url_path.trim_start_matches('/')),
    }
}

/// Resolves `.` and `..` segments. A `..` that would climb above the root is
/// refused rather than clamped.
fn normalize(path: &str) -> Result<Vec<&str>, HttpError> {
    let mut out: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if out.pop().is_none() {
                    return Err(HttpError::Forbidden);
                }
            }
            s => out.push(s),
        }
    }
    Ok(out)
}

fn percent_decode(path: &str) -> Result<String, HttpError> {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or(HttpError::BadRequest("invalid percent-encoding"))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    if out.contains(&0) {
        return Err(HttpError::BadRequest("NUL byte in path"));
    }
    String::from_utf8(out).map_err(|_| HttpError::BadRequest("path is not UTF-8"))
}
