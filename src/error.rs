use std::io;

use thiserror::Error;

use crate::http::{Method, ParseError, StatusCode};

/// Failures that stop the server from starting or running.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse config: {0}")]
    Config(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cannot install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Request-level failures. Each one is turned into a response on the
/// connection that caused it and never reaches the event loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    #[error("bad request: {0}")]
    BadRequest(&'static str),
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("method not allowed")]
    MethodNotAllowed(Vec<Method>),
    #[error("bad gateway: {0}")]
    GatewayError(String),
    #[error("gateway timeout")]
    GatewayTimeout,
    #[error("internal error: {0}")]
    InternalError(String),
}

impl HttpError {
    pub fn status(&self) -> StatusCode {
        match self {
            HttpError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HttpError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            HttpError::Forbidden => StatusCode::FORBIDDEN,
            HttpError::NotFound => StatusCode::NOT_FOUND,
            HttpError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            HttpError::GatewayError(_) => StatusCode::BAD_GATEWAY,
            HttpError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            HttpError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Classifies a filesystem error hit while serving a request.
    pub fn from_io(err: &io::Error) -> HttpError {
        match err.kind() {
            io::ErrorKind::NotFound => HttpError::NotFound,
            io::ErrorKind::PermissionDenied => HttpError::Forbidden,
            _ if err.raw_os_error() == Some(libc::ENOTDIR) => HttpError::NotFound,
            _ => HttpError::InternalError(err.to_string()),
        }
    }
}

impl From<ParseError> for HttpError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::PayloadTooLarge => HttpError::PayloadTooLarge,
            ParseError::RequestLine => HttpError::BadRequest("malformed request line"),
            ParseError::Version => HttpError::BadRequest("unsupported HTTP version"),
            ParseError::HeaderLine => HttpError::BadRequest("malformed header line"),
            ParseError::HeadersTooLarge => HttpError::BadRequest("header section too large"),
            ParseError::ConflictingFraming => HttpError::BadRequest("conflicting body framing"),
            ParseError::ContentLength => HttpError::BadRequest("invalid Content-Length"),
            ParseError::TransferEncoding => HttpError::BadRequest("unsupported Transfer-Encoding"),
            ParseError::Chunk => HttpError::BadRequest("malformed chunked body"),
        }
    }
}
