//! HTTP/1.1 server with virtual hosts and a CGI gateway, driven by a single
//! epoll readiness loop.

pub mod cgi;
pub mod config;
pub mod connection;
pub mod error;
pub mod error_page;
pub mod http;
pub mod poller;
pub mod router;
pub mod server;
pub mod static_files;
pub mod vhost;

pub use config::Config;
pub use error::{HttpError, ServerError};
pub use server::{Server, ShutdownHandle};
