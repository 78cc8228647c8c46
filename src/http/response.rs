use std::fs::File;

use super::headers::Headers;
use super::status::StatusCode;

pub const SERVER_NAME: &str = concat!("webserv/", env!("CARGO_PKG_VERSION"));

/// Where the bytes of a response body come from.
#[derive(Debug)]
pub enum Body {
    Memory(Vec<u8>),
    File { file: File, len: u64 },
    /// Streamed from the CGI session attached to the connection.
    Pipe,
}

impl Body {
    /// Length when it is known before the first byte is written.
    pub fn len(&self) -> Option<u64> {
        match self {
            Body::Memory(b) => Some(b.len() as u64),
            Body::File { len, .. } => Some(*len),
            Body::Pipe => None,
        }
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Body,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Response {
            status,
            headers: Headers::new(),
            body: Body::Memory(Vec::new()),
        }
    }

    pub fn html(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        let mut response = Response::new(status);
        response.headers.set("Content-Type", "text/html; charset=utf-8");
        response.body = Body::Memory(body.into());
        response
    }

    pub fn redirect(status: StatusCode, location: &str) -> Self {
        let body = format!(
            "<html><head><title>{status}</title></head><body><h1>{status}</h1>\
             <p>Moved to <a href=\"{location}\">{location}</a>.</p></body></html>"
        );
        let mut response = Response::html(status, body);
        response.headers.set("Location", location);
        response
    }

    /// Serializes the status line and header block.
    ///
    /// `Content-Length` is filled in from the body when known and not
    /// already present. `Connection` always reflects `keep_alive`.
    pub fn head_bytes(&self, keep_alive: bool) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {} {}\r\n",
            self.status.as_u16(),
            self.status.reason()
        );
        if !self.headers.contains("Server") {
            out.push_str(&format!("Server: {SERVER_NAME}\r\n"));
        }
        for (name, value) in self.headers.iter() {
            if name.eq_ignore_ascii_case("Connection") {
                continue;
            }
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        if !self.headers.contains("Content-Length") && self.status.allows_body() {
            if let Some(len) = self.body.len() {
                out.push_str(&format!("Content-Length: {len}\r\n"));
            }
        }
        out.push_str(if keep_alive {
            "Connection: keep-alive\r\n"
        } else {
            "Connection: close\r\n"
        });
        out.push_str("\r\n");
        out.into_bytes()
    }
}
