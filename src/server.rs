//! Listener setup and the readiness loop.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cgi::CgiProcess;
use crate::config::{Config, ServerConfig};
use crate::connection::{Connection, Context, Flow};
use crate::error::ServerError;
use crate::poller::{Interest, Poller, Token};
use crate::vhost::VirtualHostTable;

/// Slack for unparsed framing bytes on top of the largest body a host accepts.
const CHUNK_OVERHEAD: usize = 64 * 1024;

/// Cloneable stop flag, safe to trigger from a signal handler thread.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct Listener {
    /// `None` once draining has started.
    socket: Option<TcpListener>,
    addr: SocketAddr,
    /// Hosts bound to this address, default host first.
    hosts: Vec<usize>,
}

pub struct Server {
    settings: ServerConfig,
    table: VirtualHostTable,
    listeners: Vec<Listener>,
    poller: Poller,
    connections: HashMap<u64, Connection>,
    retired: Vec<CgiProcess>,
    next_id: u64,
    input_cap: usize,
    shutdown: ShutdownHandle,
    drain_deadline: Option<Instant>,
}

impl Server {
    /// Creates one non-blocking listener per distinct configured address.
    pub fn bind(config: &Config) -> Result<Server, ServerError> {
        let table = config.virtual_hosts()?;
        let poller = Poller::new(config.server.max_events)?;

        let mut listeners = Vec::new();
        for (addr, hosts) in table.bindings() {
            let socket = TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
            socket.set_nonblocking(true)?;
            let local = socket.local_addr()?;
            poller.register(socket.as_raw_fd(), Token::Accept(listeners.len()), Interest::READ)?;
            log::info!("listening on http://{}/ ({} host(s))", local, hosts.len());
            listeners.push(Listener {
                socket: Some(socket),
                addr: local,
                hosts,
            });
        }

        let max_body = table.iter().map(|h| h.client_max_body_size).max().unwrap_or(0);
        let input_cap = config
            .server
            .max_header_bytes
            .saturating_add(max_body.saturating_mul(2))
            .saturating_add(CHUNK_OVERHEAD);

        Ok(Server {
            settings: config.server.clone(),
            table,
            listeners,
            poller,
            connections: HashMap::new(),
            retired: Vec::new(),
            next_id: 0,
            input_cap,
            shutdown: ShutdownHandle::default(),
            drain_deadline: None,
        })
    }

    /// Bound addresses, with ephemeral ports resolved.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|l| l.addr).collect()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Serves until the shutdown handle fires and draining completes.
    pub fn run(&mut self) -> Result<(), ServerError> {
        let mut last_tick = Instant::now();
        while !self.should_stop() {
            self.turn(&mut last_tick)?;
        }
        self.finish_drain();
        Ok(())
    }

    /// Starts draining once shutdown is requested; true when the loop is done.
    fn should_stop(&mut self) -> bool {
        if self.shutdown.is_shutdown() && self.drain_deadline.is_none() {
            self.begin_drain();
        }
        match self.drain_deadline {
            Some(deadline) => self.connections.is_empty() || Instant::now() >= deadline,
            None => false,
        }
    }

    /// One wait on the poller, its events, and the timer work when due.
    fn turn(&mut self, last_tick: &mut Instant) -> Result<(), ServerError> {
        let timeout = self.settings.timeout_ms.max(1);
        let events = self.poller.wait(timeout)?;
        for ev in events {
            match ev.token {
                Token::Accept(index) => self.accept(index),
                Token::Client(id) => self.with_connection(id, |conn, ctx| conn.on_client_event(&ev, ctx)),
                Token::CgiOutput(id) => self.with_connection(id, |conn, ctx| conn.on_cgi_output(ctx)),
                Token::CgiInput(id) => self.with_connection(id, |conn, ctx| conn.on_cgi_input(ctx)),
            }
        }

        let now = Instant::now();
        if now.duration_since(*last_tick) >= Duration::from_millis(timeout as u64) {
            *last_tick = now;
            self.on_tick(now);
        }
        Ok(())
    }

    fn accept(&mut self, index: usize) {
        loop {
            let Some(listener) = self.listeners.get(index) else {
                return;
            };
            let Some(socket) = listener.socket.as_ref() else {
                return;
            };
            match socket.accept() {
                Ok((stream, peer)) => {
                    if self.connections.len() >= self.settings.max_connections {
                        log::warn!("connection limit reached, refusing {}", peer);
                        continue;
                    }
                    self.next_id += 1;
                    let conn = match Connection::new(self.next_id, stream, peer, index, self.settings.max_header_bytes) {
                        Ok(conn) => conn,
                        Err(e) => {
                            log::warn!("failed to set up connection from {}: {}", peer, e);
                            continue;
                        }
                    };
                    if let Err(e) = self.poller.register(conn.fd(), conn.token(), Interest::READ) {
                        log::error!("failed to register connection from {}: {}", peer, e);
                        continue;
                    }
                    log::debug!("accepted {} on {}", peer, listener.addr);
                    self.connections.insert(conn.id(), conn);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    // Typically EMFILE; the listener stays readable and is
                    // retried on the next wait.
                    log::error!("accept on {} failed: {}", listener.addr, e);
                    return;
                }
            }
        }
    }

    /// Runs `f` on a live connection, then syncs its registrations or closes
    /// it. Events for connections already closed are dropped.
    fn with_connection<F>(&mut self, id: u64, f: F)
    where
        F: FnOnce(&mut Connection, &mut Context<'_>) -> Flow,
    {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let hosts = self
            .listeners
            .get(conn.listener())
            .map(|l| l.hosts.as_slice())
            .unwrap_or(&[]);
        let mut ctx = Context {
            table: &self.table,
            settings: &self.settings,
            hosts,
            poller: &self.poller,
            retired: &mut self.retired,
            input_cap: self.input_cap,
            draining: self.drain_deadline.is_some(),
        };

        let mut flow = f(conn, &mut ctx);
        if flow == Flow::Continue {
            if let Err(e) = conn.sync_interest(&ctx) {
                log::warn!("poller update for {} failed: {}", conn.peer(), e);
                flow = Flow::Close;
            }
        }
        if flow == Flow::Close {
            if let Some(conn) = self.connections.remove(&id) {
                conn.close(&mut ctx);
            }
        }
    }

    fn live_connections(&self) -> Vec<u64> {
        self.connections.keys().copied().collect()
    }

    fn on_tick(&mut self, now: Instant) {
        for id in self.live_connections() {
            self.with_connection(id, |conn, ctx| conn.on_tick(now, ctx));
        }
        self.reap();
    }

    /// Polls retired scripts. Ones that outlive the CGI timeout after their
    /// connection let go of them are killed.
    fn reap(&mut self) {
        let limit = self.settings.cgi_timeout();
        self.retired.retain_mut(|process| {
            if process.try_reap().is_some() {
                return false;
            }
            if process.elapsed() > limit {
                process.terminate();
            }
            true
        });
    }

    fn begin_drain(&mut self) {
        log::info!("shutting down, draining {} connection(s)", self.connections.len());
        self.drain_deadline = Some(Instant::now() + self.settings.drain_timeout());
        for listener in &mut self.listeners {
            if let Some(socket) = listener.socket.take() {
                if let Err(e) = self.poller.deregister(socket.as_raw_fd()) {
                    log::debug!("deregister listener {} failed: {}", listener.addr, e);
                }
            }
        }
        for id in self.live_connections() {
            self.with_connection(id, |conn, _| conn.begin_drain());
        }
    }

    /// Aborts whatever is left and waits for every script to be reaped.
    fn finish_drain(&mut self) {
        let left = self.live_connections();
        if !left.is_empty() {
            log::warn!("drain timeout, aborting {} connection(s)", left.len());
        }
        for id in left {
            self.with_connection(id, |_, _| Flow::Close);
        }
        for process in &mut self.retired {
            process.terminate();
        }
        let deadline = Instant::now() + Duration::from_secs(1);
        while !self.retired.is_empty() && Instant::now() < deadline {
            self.retired.retain_mut(|p| p.try_reap().is_none());
            std::thread::sleep(Duration::from_millis(5));
        }
        // Stragglers are waited for as they drop.
        self.retired.clear();
        log::info!("server stopped");
    }
}
