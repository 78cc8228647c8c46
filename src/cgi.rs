//! CGI/1.1 gateway.
//!
//! A [`CgiSession`] owns one script execution: it feeds the request body to
//! the script's stdin and turns its stdout into response bytes, one
//! readiness event at a time. The event loop only sees the pipe descriptors.

use std::fs;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use crate::error::HttpError;
use crate::http::{Body, Headers, Method, Request, Response, StatusCode};
use crate::router::CgiTarget;
use crate::static_files;

const READ_CHUNK: usize = 16 * 1024;
/// Largest CGI header block accepted.
const MAX_HEAD_BYTES: usize = 64 * 1024;
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Handle on a spawned script. The child is reaped exactly once: by
/// [`try_reap`](Self::try_reap) on the loop, or by `Drop` as a last resort.
#[derive(Debug)]
pub struct CgiProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    started: Instant,
    status: Option<ExitStatus>,
    killed: bool,
}

impl CgiProcess {
    /// Spawns `program` in its own process group with piped, non-blocking
    /// stdin/stdout. Stderr is discarded.
    pub fn spawn(mut command: Command) -> io::Result<CgiProcess> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0);
        let mut child = command.spawn()?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let mut process = CgiProcess {
            child,
            stdin,
            stdout,
            started: Instant::now(),
            status: None,
            killed: false,
        };
        for fd in [process.stdin_fd(), process.stdout_fd()].into_iter().flatten() {
            if let Err(e) = set_nonblocking(fd) {
                process.terminate();
                return Err(e);
            }
        }
        Ok(process)
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn stdin_fd(&self) -> Option<RawFd> {
        self.stdin.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn stdout_fd(&self) -> Option<RawFd> {
        self.stdout.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    pub fn close_stdout(&mut self) {
        self.stdout = None;
    }

    /// Non-blocking wait. Returns the exit status once the child is gone.
    pub fn try_reap(&mut self) -> Option<ExitStatus> {
        if self.status.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    log::debug!("cgi pid {} exited: {}", self.child.id(), status);
                    self.status = Some(status);
                }
                Ok(None) => {}
                Err(e) => log::warn!("cgi pid {} wait failed: {}", self.child.id(), e),
            }
        }
        self.status
    }

    pub fn is_reaped(&self) -> bool {
        self.status.is_some()
    }

    /// Kills the whole process group and closes both pipes. Reaping is left
    /// to [`try_reap`](Self::try_reap).
    pub fn terminate(&mut self) {
        self.stdin = None;
        self.stdout = None;
        if self.status.is_some() || self.killed {
            return;
        }
        self.killed = true;
        let pid = self.child.id() as libc::pid_t;
        // The group id equals the child's pid; helpers it forked die too.
        let rc = unsafe { libc::kill(-pid, libc::SIGKILL) };
        if rc < 0 {
            let _ = self.child.kill();
        }
    }
}

impl Drop for CgiProcess {
    fn drop(&mut self) {
        if self.status.is_none() {
            self.terminate();
            // SIGKILL was just sent, so this wait is short.
            if let Ok(status) = self.child.wait() {
                self.status = Some(status);
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Connection-level facts the script environment is built from.
#[derive(Debug, Clone, Copy)]
pub struct CgiContext<'a> {
    pub server_name: &'a str,
    pub local: SocketAddr,
    pub peer: SocketAddr,
    pub timeout: Duration,
    pub max_buffer: usize,
}

/// Builds the CGI/1.1 meta-variables for a request.
pub fn build_env(req: &Request, target: &CgiTarget, script: &Path, ctx: &CgiContext<'_>) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = vec![
        ("GATEWAY_INTERFACE".into(), "CGI/1.1".into()),
        ("SERVER_SOFTWARE".into(), crate::http::response::SERVER_NAME.into()),
        ("SERVER_PROTOCOL".into(), req.version.as_str().into()),
        ("SERVER_NAME".into(), ctx.server_name.into()),
        ("SERVER_PORT".into(), ctx.local.port().to_string()),
        ("REQUEST_METHOD".into(), req.method.as_str().into()),
        ("REQUEST_URI".into(), req.target.clone()),
        ("SCRIPT_NAME".into(), target.script_name.clone()),
        ("SCRIPT_FILENAME".into(), script.display().to_string()),
        ("PATH_INFO".into(), target.path_info.clone()),
        ("QUERY_STRING".into(), req.query().into()),
        ("CONTENT_LENGTH".into(), req.body.len().to_string()),
        ("CONTENT_TYPE".into(), req.headers.get("Content-Type").unwrap_or("").into()),
        ("REMOTE_ADDR".into(), ctx.peer.ip().to_string()),
        ("REMOTE_PORT".into(), ctx.peer.port().to_string()),
        ("DOCUMENT_ROOT".into(), target.root.display().to_string()),
        // php-cgi refuses to run without it.
        ("REDIRECT_STATUS".into(), "200".into()),
        ("PATH".into(), std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.into())),
    ];
    if !target.path_info.is_empty() {
        let translated = target.root.join(target.path_info.trim_start_matches('/'));
        env.push(("PATH_TRANSLATED".into(), translated.display().to_string()));
    }
    for (name, value) in req.headers.iter() {
        let key: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        env.push((format!("HTTP_{key}"), value.to_string()));
    }
    env
}

/// Parsed CGI response header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiHead {
    pub status: StatusCode,
    pub headers: Headers,
}

pub fn parse_head(block: &[u8]) -> Result<CgiHead, HttpError> {
    let text = std::str::from_utf8(block)
        .map_err(|_| HttpError::GatewayError("CGI headers are not UTF-8".into()))?;
    let mut status = None;
    let mut headers = Headers::new();
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpError::GatewayError(format!("malformed CGI header {line:?}")))?;
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            return Err(HttpError::GatewayError("empty CGI header name".into()));
        }
        if name.eq_ignore_ascii_case("Status") {
            let code = value
                .get(..3)
                .and_then(|c| c.parse::<u16>().ok())
                .and_then(StatusCode::from_u16)
                .ok_or_else(|| HttpError::GatewayError(format!("invalid CGI status {value:?}")))?;
            status = Some(code);
        } else if is_hop_by_hop(name) {
            continue;
        } else {
            headers.append(name, value);
        }
    }
    let status = status.unwrap_or(if headers.contains("Location") {
        StatusCode::FOUND
    } else {
        StatusCode::OK
    });
    Ok(CgiHead { status, headers })
}

fn is_hop_by_hop(name: &str) -> bool {
    ["connection", "keep-alive", "transfer-encoding", "upgrade"]
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

/// Finds the blank line ending a header block, scanning from `from`.
/// Returns (end of header text, start of body).
fn find_blank_line(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while let Some(off) = buf.get(i..)?.iter().position(|&b| b == b'\n') {
        let nl = i + off;
        let rest = &buf[nl + 1..];
        if rest.starts_with(b"\n") {
            return Some((nl, nl + 2));
        }
        if rest.starts_with(b"\r\n") {
            return Some((nl, nl + 3));
        }
        i = nl + 1;
    }
    None
}

/// How the script's body reaches the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// Script declared Content-Length; forwarded as it arrives.
    Length(u64),
    /// Collected until EOF so a Content-Length can be sent.
    Buffered,
    /// Forwarded as it arrives; the connection closes afterwards.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgiProgress {
    /// More output is expected.
    Pending,
    /// The response is complete in the output buffer.
    Finished,
}

#[derive(Debug)]
pub struct CgiSession {
    process: CgiProcess,
    input: Vec<u8>,
    input_pos: usize,
    head: Vec<u8>,
    head_scan: usize,
    framing: Option<Framing>,
    /// Response head held back while the body is buffered.
    pending: Option<Response>,
    body: Vec<u8>,
    head_sent: bool,
    head_only: bool,
    keep_alive: bool,
    deadline: Instant,
    max_buffer: usize,
}

impl CgiSession {
    /// Validates the script and spawns it. The request body is handed over
    /// to be written as the pipe accepts it.
    pub fn start(req: Request, target: &CgiTarget, ctx: &CgiContext<'_>, keep_alive: bool) -> Result<CgiSession, HttpError> {
        let meta = fs::metadata(&target.script).map_err(|e| HttpError::from_io(&e))?;
        if !meta.is_file() {
            return Err(HttpError::NotFound);
        }
        let script = static_files::contained(&target.script, &target.root)?;

        let mut command = match &target.interpreter {
            Some(interpreter) => {
                let mut c = Command::new(interpreter);
                c.arg(&script);
                c
            }
            None => Command::new(&script),
        };
        command.env_clear().envs(build_env(&req, target, &script, ctx));
        if let Some(dir) = script.parent() {
            command.current_dir(dir);
        }

        let mut process = CgiProcess::spawn(command).map_err(|e| {
            log::error!("cgi spawn {} failed: {}", script.display(), e);
            HttpError::InternalError(format!("spawn failed: {e}"))
        })?;
        log::debug!("cgi pid {} started for {}", process.pid(), script.display());

        if req.body.is_empty() {
            process.close_stdin();
        }
        Ok(CgiSession {
            process,
            input: req.body,
            input_pos: 0,
            head: Vec::new(),
            head_scan: 0,
            framing: None,
            pending: None,
            body: Vec::new(),
            head_sent: false,
            head_only: req.method == Method::Head,
            keep_alive,
            deadline: Instant::now() + ctx.timeout,
            max_buffer: ctx.max_buffer,
        })
    }

    pub fn stdin_fd(&self) -> Option<RawFd> {
        self.process.stdin_fd()
    }

    pub fn stdout_fd(&self) -> Option<RawFd> {
        self.process.stdout_fd()
    }

    pub fn wants_input(&self) -> bool {
        self.process.stdin_fd().is_some() && self.input_pos < self.input.len()
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Whether response bytes have already been queued for the client.
    pub fn head_sent(&self) -> bool {
        self.head_sent
    }

    /// Whether the connection may stay open after this response.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Ends the connection after this response. Only effective while the
    /// head has not been sent yet.
    pub fn force_close(&mut self) {
        if !self.head_sent {
            self.keep_alive = false;
        }
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    /// Closes both pipes and hands the process over for reaping. The caller
    /// deregisters the pipe descriptors first.
    pub fn into_process(mut self) -> CgiProcess {
        self.process.close_stdin();
        self.process.close_stdout();
        self.process
    }

    /// Closes the script's stdin once the body is written or abandoned.
    pub fn close_input(&mut self) {
        self.process.close_stdin();
        self.input = Vec::new();
        self.input_pos = 0;
    }

    /// Writes as much of the request body as the pipe takes. Once
    /// [`wants_input`](Self::wants_input) turns false the caller closes the
    /// pipe with [`close_input`](Self::close_input).
    pub fn write_input(&mut self) {
        let pid = self.process.pid();
        let Some(stdin) = self.process.stdin.as_mut() else {
            return;
        };
        while self.input_pos < self.input.len() {
            match stdin.write(&self.input[self.input_pos..]) {
                Ok(0) => break,
                Ok(n) => self.input_pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // The script stopped reading; its output still matters.
                    log::debug!("cgi pid {} stdin closed early: {}", pid, e);
                    break;
                }
            }
        }
        self.input_pos = self.input.len();
    }

    /// Reads one chunk of script output, appending response bytes to `out`.
    pub fn read_output(&mut self, out: &mut Vec<u8>) -> Result<CgiProgress, HttpError> {
        let Some(stdout) = self.process.stdout.as_mut() else {
            return Ok(CgiProgress::Finished);
        };
        let mut chunk = [0u8; READ_CHUNK];
        let n = match stdout.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
                return Ok(CgiProgress::Pending)
            }
            Err(e) => return Err(HttpError::GatewayError(format!("reading script output: {e}"))),
        };
        if n == 0 {
            return self.finish(out);
        }
        let data = &chunk[..n];

        match self.framing {
            None => {
                self.head.extend_from_slice(data);
                let Some((head_end, body_start)) = find_blank_line(&self.head, self.head_scan) else {
                    if self.head.len() > MAX_HEAD_BYTES {
                        return Err(HttpError::GatewayError("CGI header block too large".into()));
                    }
                    self.head_scan = self.head.len().saturating_sub(2);
                    return Ok(CgiProgress::Pending);
                };
                if head_end == 0 {
                    return Err(HttpError::GatewayError("CGI output has no headers".into()));
                }
                let cgi_head = parse_head(&self.head[..head_end])?;
                let rest = self.head.split_off(body_start);
                self.head.clear();
                self.start_body(cgi_head, out)?;
                self.push_body(&rest, out)
            }
            Some(_) => self.push_body(data, out),
        }
    }

    fn start_body(&mut self, head: CgiHead, out: &mut Vec<u8>) -> Result<(), HttpError> {
        let declared = head
            .headers
            .get("Content-Length")
            .map(|v| v.trim().parse::<u64>())
            .transpose()
            .map_err(|_| HttpError::GatewayError("invalid CGI Content-Length".into()))?;
        let framing = match declared {
            Some(len) => Framing::Length(len),
            None if self.keep_alive => Framing::Buffered,
            None => Framing::Close,
        };
        if framing == Framing::Close {
            self.keep_alive = false;
        }
        let mut response = Response::new(head.status);
        response.headers = head.headers;
        response.body = Body::Pipe;
        if !response.status.allows_body() {
            response.headers.remove("Content-Length");
        }
        self.framing = Some(framing);
        if framing == Framing::Buffered {
            self.pending = Some(response);
        } else {
            out.extend_from_slice(&response.head_bytes(self.keep_alive));
            self.head_sent = true;
        }
        Ok(())
    }

    fn push_body(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<CgiProgress, HttpError> {
        match self.framing {
            Some(Framing::Length(remaining)) => {
                let take = (data.len() as u64).min(remaining) as usize;
                if !self.head_only {
                    out.extend_from_slice(&data[..take]);
                }
                let left = remaining - take as u64;
                self.framing = Some(Framing::Length(left));
                if left == 0 {
                    // Anything past the declared length is dropped.
                    return Ok(CgiProgress::Finished);
                }
            }
            Some(Framing::Buffered) => {
                self.body.extend_from_slice(data);
                if self.body.len() > self.max_buffer {
                    self.fall_back_to_close(out);
                }
            }
            Some(Framing::Close) => {
                if !self.head_only {
                    out.extend_from_slice(data);
                }
            }
            None => {}
        }
        Ok(CgiProgress::Pending)
    }

    /// Output outgrew the buffer: send what we have without a length and
    /// finish the response by closing the connection.
    fn fall_back_to_close(&mut self, out: &mut Vec<u8>) {
        self.keep_alive = false;
        if let Some(response) = self.pending.take() {
            out.extend_from_slice(&response.head_bytes(false));
        }
        if !self.head_only {
            out.append(&mut self.body);
        }
        self.body = Vec::new();
        self.head_sent = true;
        self.framing = Some(Framing::Close);
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<CgiProgress, HttpError> {
        match self.framing {
            None => Err(HttpError::GatewayError(match self.process.try_reap() {
                Some(status) if !status.success() => format!("script exited with {status} before sending headers"),
                _ => "script output ended before headers".to_string(),
            })),
            Some(Framing::Buffered) => {
                if let Some(mut response) = self.pending.take() {
                    if response.status.allows_body() {
                        response.headers.set("Content-Length", self.body.len().to_string());
                    }
                    out.extend_from_slice(&response.head_bytes(self.keep_alive));
                }
                if !self.head_only {
                    out.append(&mut self.body);
                }
                self.head_sent = true;
                Ok(CgiProgress::Finished)
            }
            Some(Framing::Length(left)) if left > 0 => {
                // Short body: the client can only detect it by the close.
                self.keep_alive = false;
                Ok(CgiProgress::Finished)
            }
            Some(_) => Ok(CgiProgress::Finished),
        }
    }
}
