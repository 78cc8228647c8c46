//! Per-client state machine driven by the event loop.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use crate::cgi::{CgiContext, CgiProcess, CgiProgress, CgiSession};
use crate::config::ServerConfig;
use crate::error::HttpError;
use crate::error_page::ErrorPages;
use crate::http::{Body, Method, ParseStatus, Phase, Request, RequestParser, Response, StatusCode};
use crate::poller::{Event, Interest, Poller, Token};
use crate::router::{self, CgiTarget, Target};
use crate::static_files;
use crate::vhost::VirtualHostTable;

const READ_CHUNK: usize = 16 * 1024;
const FILE_CHUNK: usize = 64 * 1024;
/// How long a closing connection waits for the peer's FIN.
const LINGER: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    ReadingHead,
    ReadingBody,
    /// A CGI script is producing the response.
    AwaitingHandler,
    Writing,
    /// Response sent and write side shut down; unread input is discarded.
    Closing,
}

/// What the event loop should do with the connection after a handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Everything a connection borrows from the server while it is handled.
pub struct Context<'a> {
    pub table: &'a VirtualHostTable,
    pub settings: &'a ServerConfig,
    /// Hosts bound to the listener that accepted the connection.
    pub hosts: &'a [usize],
    pub poller: &'a Poller,
    /// Finished or aborted scripts awaiting their reap.
    pub retired: &'a mut Vec<CgiProcess>,
    pub input_cap: usize,
    pub draining: bool,
}

struct FileBody {
    file: File,
    remaining: u64,
}

pub struct Connection {
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    listener: usize,
    state: State,
    parser: RequestParser,
    input: Vec<u8>,
    output: Vec<u8>,
    written: usize,
    file: Option<FileBody>,
    cgi: Option<CgiSession>,
    keep_alive: bool,
    head_only: bool,
    peer_closed: bool,
    /// Host chosen for the current request, for error pages.
    host: Option<usize>,
    request_line: String,
    last_activity: Instant,
    interest: Interest,
    cgi_out: Option<RawFd>,
    cgi_in: Option<RawFd>,
}

impl Connection {
    /// Wraps an accepted stream. The caller registers it for reading under
    /// [`token`](Self::token).
    pub fn new(
        id: u64,
        stream: TcpStream,
        peer: SocketAddr,
        listener: usize,
        max_header_bytes: usize,
    ) -> io::Result<Connection> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let local = stream.local_addr()?;
        Ok(Connection {
            id,
            stream,
            peer,
            local,
            listener,
            state: State::ReadingHead,
            parser: RequestParser::new(max_header_bytes),
            input: Vec::new(),
            output: Vec::new(),
            written: 0,
            file: None,
            cgi: None,
            keep_alive: true,
            head_only: false,
            peer_closed: false,
            host: None,
            request_line: String::new(),
            last_activity: Instant::now(),
            interest: Interest::READ,
            cgi_out: None,
            cgi_in: None,
        })
    }

    pub fn token(&self) -> Token {
        Token::Client(self.id)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn listener(&self) -> usize {
        self.listener
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Readiness on the client socket.
    pub fn on_client_event(&mut self, ev: &Event, ctx: &mut Context<'_>) -> Flow {
        if ev.error {
            return Flow::Close;
        }
        if ev.readable || ev.hangup {
            match self.state {
                State::ReadingHead | State::ReadingBody => return self.on_readable(ctx),
                State::Closing => return self.discard_input(),
                _ => {}
            }
        }
        if ev.hangup {
            return Flow::Close;
        }
        if ev.writable {
            return self.pump(ctx);
        }
        Flow::Continue
    }

    pub fn on_cgi_output(&mut self, ctx: &mut Context<'_>) -> Flow {
        let Some(session) = self.cgi.as_mut() else {
            return Flow::Continue;
        };
        match session.read_output(&mut self.output) {
            Ok(CgiProgress::Pending) => {}
            Ok(CgiProgress::Finished) => {
                self.keep_alive = session.keep_alive();
                log::debug!("cgi pid {} finished for {}", session.pid(), self.peer);
                self.end_cgi(ctx, false);
                self.state = State::Writing;
            }
            Err(err) => {
                let head_sent = session.head_sent();
                log::warn!("cgi pid {} for {}: {}", session.pid(), self.peer, err);
                self.end_cgi(ctx, true);
                if head_sent {
                    return Flow::Close;
                }
                self.respond_error(err, ctx);
            }
        }
        self.pump(ctx)
    }

    pub fn on_cgi_input(&mut self, ctx: &mut Context<'_>) -> Flow {
        if let Some(session) = self.cgi.as_mut() {
            session.write_input();
            if !session.wants_input() {
                if let Some(fd) = self.cgi_in.take() {
                    deregister(ctx.poller, fd);
                }
                session.close_input();
            }
        }
        Flow::Continue
    }

    /// Timer work: CGI deadline, then idle timeout.
    pub fn on_tick(&mut self, now: Instant, ctx: &mut Context<'_>) -> Flow {
        let expired = self
            .cgi
            .as_ref()
            .filter(|s| s.expired(now))
            .map(|s| (s.head_sent(), s.pid()));
        if let Some((head_sent, pid)) = expired {
            log::warn!("cgi pid {} timed out serving {}", pid, self.request_line);
            self.end_cgi(ctx, true);
            if head_sent {
                return Flow::Close;
            }
            self.respond_error(HttpError::GatewayTimeout, ctx);
            return self.pump(ctx);
        }

        let idle = ctx.settings.idle_timeout();
        let limit = if self.state == State::Closing { idle.min(LINGER) } else { idle };
        if self.cgi.is_none() && now.duration_since(self.last_activity) >= limit {
            log::debug!("closing idle connection from {}", self.peer);
            return Flow::Close;
        }
        Flow::Continue
    }

    /// Shutdown has begun: idle keep-alive connections go now, in-flight
    /// ones finish their current response and close.
    pub fn begin_drain(&mut self) -> Flow {
        if self.state == State::ReadingHead && self.input.is_empty() {
            return Flow::Close;
        }
        self.keep_alive = false;
        if let Some(session) = self.cgi.as_mut() {
            session.force_close();
        }
        Flow::Continue
    }

    /// Brings the poller registrations in line with the current state.
    pub fn sync_interest(&mut self, ctx: &Context<'_>) -> io::Result<()> {
        let want = Interest {
            read: matches!(self.state, State::ReadingHead | State::ReadingBody | State::Closing),
            write: self.written < self.output.len(),
        };
        if want != self.interest {
            ctx.poller.reregister(self.stream.as_raw_fd(), self.token(), want)?;
            self.interest = want;
        }

        let pending = self.output.len() - self.written;
        // Paused pipes are removed outright; a registered pipe keeps
        // reporting hangups even with an empty interest set.
        let want_out = self
            .cgi
            .as_ref()
            .and_then(|s| s.stdout_fd())
            .filter(|_| pending < ctx.settings.output_high_water);
        match (self.cgi_out, want_out) {
            (None, Some(fd)) => {
                ctx.poller.register(fd, Token::CgiOutput(self.id), Interest::READ)?;
                self.cgi_out = Some(fd);
            }
            (Some(fd), None) => {
                ctx.poller.deregister(fd)?;
                self.cgi_out = None;
            }
            _ => {}
        }

        let want_in = self
            .cgi
            .as_ref()
            .filter(|s| s.wants_input())
            .and_then(|s| s.stdin_fd());
        match (self.cgi_in, want_in) {
            (None, Some(fd)) => {
                ctx.poller.register(fd, Token::CgiInput(self.id), Interest::WRITE)?;
                self.cgi_in = Some(fd);
            }
            (Some(fd), None) => {
                ctx.poller.deregister(fd)?;
                self.cgi_in = None;
            }
            _ => {}
        }
        Ok(())
    }

    /// Releases every descriptor and hands any script over for reaping.
    pub fn close(mut self, ctx: &mut Context<'_>) {
        deregister(ctx.poller, self.stream.as_raw_fd());
        self.end_cgi(ctx, true);
        log::debug!("connection from {} closed", self.peer);
    }

    fn on_readable(&mut self, ctx: &mut Context<'_>) -> Flow {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.peer_closed = true;
                    break;
                }
                Ok(n) => {
                    self.input.extend_from_slice(&buf[..n]);
                    self.last_activity = Instant::now();
                    if n < buf.len() || self.input.len() > ctx.input_cap {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("read from {} failed: {}", self.peer, e);
                    return Flow::Close;
                }
            }
        }

        self.parse_input(ctx);
        if self.peer_closed {
            if matches!(self.state, State::ReadingHead | State::ReadingBody) {
                return Flow::Close;
            }
            self.keep_alive = false;
        }
        self.pump(ctx)
    }

    fn discard_input(&mut self) -> Flow {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Flow::Close,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Flow::Continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return Flow::Close,
            }
        }
    }

    /// Runs the parser over buffered input until it needs more bytes or a
    /// request has been dispatched.
    fn parse_input(&mut self, ctx: &mut Context<'_>) {
        while matches!(self.state, State::ReadingHead | State::ReadingBody) && !self.input.is_empty() {
            let (table, hosts) = (ctx.table, ctx.hosts);
            let status = self.parser.parse(&self.input, |head| {
                let host = router::select_host(table, hosts, head.host());
                table.get(host).map_or(0, |h| h.client_max_body_size)
            });
            match status {
                ParseStatus::NeedMoreData => {
                    self.state = match self.parser.phase() {
                        Phase::Head => State::ReadingHead,
                        Phase::Body => State::ReadingBody,
                    };
                    // Body bytes already live in the request; the cap
                    // bounds what is still unparsed.
                    let released = self.parser.release_consumed();
                    self.input.drain(..released);
                    if self.input.len() > ctx.input_cap {
                        self.keep_alive = false;
                        self.respond_error(HttpError::PayloadTooLarge, ctx);
                    }
                    return;
                }
                ParseStatus::Complete(request) => {
                    let consumed = self.parser.consumed();
                    self.input.drain(..consumed);
                    self.parser.reset();
                    self.dispatch(request, ctx);
                }
                ParseStatus::Error(err) => {
                    log::debug!("unparseable request from {}: {}", self.peer, err);
                    // Framing is lost, so nothing after this can be trusted.
                    self.input.clear();
                    self.keep_alive = false;
                    self.respond_error(err.into(), ctx);
                }
            }
        }
    }

    fn dispatch(&mut self, request: Request, ctx: &mut Context<'_>) {
        self.keep_alive = request.keep_alive() && !ctx.draining;
        self.head_only = request.method == Method::Head;
        self.request_line = format!("{} {} {}", request.method, request.target, request.version.as_str());
        let host = router::select_host(ctx.table, ctx.hosts, request.host());
        self.host = Some(host);

        let route = match router::route(ctx.table, host, &request) {
            Ok(route) => route,
            Err(err) => return self.respond_error(err, ctx),
        };
        match route.target {
            Target::Redirect { status, location } => {
                self.start_response(Response::redirect(status, &location));
            }
            Target::Static { path, root, index } => {
                match serve_static(&request, &path, &root, &index) {
                    Ok(response) => self.start_response(response),
                    Err(err) => self.respond_error(err, ctx),
                }
            }
            Target::Cgi(target) => self.start_cgi(request, &target, host, ctx),
        }
    }

    fn start_cgi(&mut self, request: Request, target: &CgiTarget, host: usize, ctx: &mut Context<'_>) {
        let server_name = ctx
            .table
            .get(host)
            .and_then(|h| h.server_names.first().cloned())
            .or_else(|| request.host().map(str::to_string))
            .unwrap_or_else(|| self.local.ip().to_string());
        let cgi_ctx = CgiContext {
            server_name: &server_name,
            local: self.local,
            peer: self.peer,
            timeout: ctx.settings.cgi_timeout(),
            max_buffer: ctx.settings.max_cgi_buffer,
        };
        match CgiSession::start(request, target, &cgi_ctx, self.keep_alive) {
            Ok(session) => {
                log::info!("{} \"{}\" cgi pid {}", self.peer, self.request_line, session.pid());
                self.cgi = Some(session);
                self.state = State::AwaitingHandler;
            }
            Err(err) => self.respond_error(err, ctx),
        }
    }

    fn respond_error(&mut self, err: HttpError, ctx: &Context<'_>) {
        let host = self.host.and_then(|h| ctx.table.get(h));
        if let HttpError::InternalError(msg) = &err {
            log::error!("{} \"{}\": {}", self.peer, self.request_line, msg);
        }
        self.start_response(ErrorPages::response(&err, host));
    }

    fn start_response(&mut self, response: Response) {
        log::info!("{} \"{}\" {}", self.peer, self.request_line, response.status.as_u16());
        self.output.extend_from_slice(&response.head_bytes(self.keep_alive));
        let with_body = !self.head_only && response.status.allows_body();
        match response.body {
            Body::Memory(bytes) if with_body => self.output.extend_from_slice(&bytes),
            Body::File { file, len } if with_body => self.file = Some(FileBody { file, remaining: len }),
            _ => {}
        }
        self.state = State::Writing;
    }

    /// Flushes output, refills it from a file body, and moves to the next
    /// request once the response is complete.
    fn pump(&mut self, ctx: &mut Context<'_>) -> Flow {
        loop {
            while self.written < self.output.len() {
                match self.stream.write(&self.output[self.written..]) {
                    Ok(0) => return Flow::Close,
                    Ok(n) => {
                        self.written += n;
                        self.last_activity = Instant::now();
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Flow::Continue,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        log::debug!("write to {} failed: {}", self.peer, e);
                        return Flow::Close;
                    }
                }
            }
            self.output.clear();
            self.written = 0;

            if self.state != State::Writing {
                return Flow::Continue;
            }
            if let Some(body) = self.file.as_mut() {
                if body.remaining > 0 {
                    match body.fill(&mut self.output) {
                        Ok(0) => {
                            log::warn!("file shrank while serving {}", self.request_line);
                            return Flow::Close;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            log::warn!("reading file for {} failed: {}", self.request_line, e);
                            return Flow::Close;
                        }
                    }
                }
                self.file = None;
            }

            if !self.keep_alive || ctx.draining {
                return self.linger();
            }
            self.state = State::ReadingHead;
            self.head_only = false;
            self.host = None;
            // Pipelined requests already buffered are served now.
            self.parse_input(ctx);
        }
    }

    fn linger(&mut self) -> Flow {
        if self.stream.shutdown(Shutdown::Write).is_err() {
            return Flow::Close;
        }
        self.input.clear();
        self.state = State::Closing;
        self.last_activity = Instant::now();
        Flow::Continue
    }

    fn end_cgi(&mut self, ctx: &mut Context<'_>, kill: bool) {
        if let Some(fd) = self.cgi_out.take() {
            deregister(ctx.poller, fd);
        }
        if let Some(fd) = self.cgi_in.take() {
            deregister(ctx.poller, fd);
        }
        if let Some(session) = self.cgi.take() {
            let mut process = session.into_process();
            if kill {
                process.terminate();
            }
            ctx.retired.push(process);
        }
    }
}

impl FileBody {
    /// Appends the next chunk to `out`. Zero means the file ended early.
    fn fill(&mut self, out: &mut Vec<u8>) -> io::Result<usize> {
        let want = self.remaining.min(FILE_CHUNK as u64) as usize;
        let start = out.len();
        out.resize(start + want, 0);
        let result = self.file.read(&mut out[start..]);
        let n = *result.as_ref().unwrap_or(&0);
        out.truncate(start + n);
        self.remaining -= n as u64;
        result
    }
}

fn serve_static(request: &Request, path: &std::path::Path, root: &std::path::Path, index: &str) -> Result<Response, HttpError> {
    match request.method {
        Method::Get | Method::Head => {
            let file = static_files::open(path, root, index)?;
            let mut response = Response::new(StatusCode::OK);
            response.headers.set("Content-Type", file.content_type);
            response.body = Body::File {
                file: file.file,
                len: file.len,
            };
            Ok(response)
        }
        Method::Delete => {
            static_files::delete(path, root)?;
            Ok(Response::new(StatusCode::NO_CONTENT))
        }
        _ => Err(HttpError::MethodNotAllowed(vec![Method::Get, Method::Head, Method::Delete])),
    }
}

fn deregister(poller: &Poller, fd: RawFd) {
    if let Err(e) = poller.deregister(fd) {
        log::debug!("deregister fd {} failed: {}", fd, e);
    }
}
