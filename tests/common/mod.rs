//! Test server running the real event loop on a background thread.

#![allow(dead_code)]

use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;

use webserv::{Config, Server, ShutdownHandle};

const CONFIG: &str = r#"
[server]
timeout_ms = 20
idle_timeout_ms = 400
cgi_timeout_ms = 500
drain_timeout_ms = 2000
output_high_water = 16384

[[hosts]]
listen = ["127.0.0.1:0"]
server_names = ["a.example"]
root = "a"
methods = ["GET", "HEAD", "DELETE"]
client_max_body_size = 64

[hosts.error_pages]
"404" = "errors/404.html"

[hosts.cgi]
".sh" = "/bin/sh"

[[hosts.redirects]]
from = "/old"
to = "/hello.txt"

[[hosts.locations]]
path = "/cgi-bin"
methods = ["GET", "POST"]

[[hosts]]
listen = ["127.0.0.1:0"]
server_names = ["b.example"]
root = "b"
"#;

pub struct TestServer {
    addr: SocketAddr,
    shutdown: ShutdownHandle,
    thread: Option<JoinHandle<()>>,
    dir: tempfile::TempDir,
}

impl TestServer {
    pub fn start() -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        write(&a.join("index.html"), "<h1>site a</h1>");
        write(&a.join("hello.txt"), "hello world");
        write(&a.join("delete-me.txt"), "bye");
        write(&a.join("errors/404.html"), "custom not found");
        write(&a.join("cgi-bin/hello.sh"), "printf 'Content-Type: text/plain\\n\\nhello\\n'\n");
        write(
            &a.join("cgi-bin/env.sh"),
            "printf 'Content-Type: text/plain\\r\\n\\r\\n'\n\
             echo \"method=$REQUEST_METHOD\"\n\
             echo \"query=$QUERY_STRING\"\n\
             echo \"script=$SCRIPT_NAME\"\n\
             echo \"path_info=$PATH_INFO\"\n\
             echo \"header=$HTTP_X_TEST\"\n",
        );
        write(&a.join("cgi-bin/echo.sh"), "printf 'Content-Type: text/plain\\r\\n\\r\\n'\ncat\n");
        write(&a.join("cgi-bin/slow.sh"), "echo $$ > slow.pid\nsleep 30\n");
        write(&a.join("cgi-bin/fail.sh"), "exit 1\n");
        write(
            &a.join("cgi-bin/big.sh"),
            "printf 'Content-Type: text/plain\\r\\n\\r\\n'\n\
             head -c 4194304 /dev/zero | tr '\\000' 'x'\n\
             touch big.done\n",
        );
        write(
            &a.join("cgi-bin/status.sh"),
            "printf 'Status: 201 Created\\nContent-Type: text/plain\\nContent-Length: 4\\n\\ndone'\n",
        );
        write(&dir.path().join("b/index.html"), "<h1>site b</h1>");

        let config_path = dir.path().join("config.toml");
        fs::write(&config_path, CONFIG).unwrap();
        let config = Config::load(&config_path).unwrap();
        let mut server = Server::bind(&config).unwrap();
        let addr = server.local_addrs()[0];
        let shutdown = server.shutdown_handle();
        let thread = std::thread::spawn(move || server.run().unwrap());
        TestServer {
            addr,
            shutdown,
            thread: Some(thread),
            dir,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Document root of the default host.
    pub fn root(&self) -> PathBuf {
        self.dir.path().join("a")
    }

    pub fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }

    /// Sends one raw request and reads until the server closes.
    pub fn exchange(&self, raw: &str) -> String {
        let mut stream = self.connect();
        stream.write_all(raw.as_bytes()).unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    pub fn get(&self, path: &str) -> String {
        self.exchange(&format!("GET {path} HTTP/1.1\r\nHost: a.example\r\nConnection: close\r\n\r\n"))
    }

    /// Stops the loop and waits for the thread to finish draining.
    pub fn stop(mut self) {
        self.shutdown.shutdown();
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

pub struct Reply {
    pub head: String,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn status(&self) -> u16 {
        self.head[9..12].parse().unwrap()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.split("\r\n").skip(1).find_map(|line| {
            let (n, v) = line.split_once(':')?;
            n.eq_ignore_ascii_case(name).then(|| v.trim())
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Reads one Content-Length framed response from a keep-alive stream.
pub fn read_reply(stream: &mut TcpStream) -> Reply {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).unwrap();
        assert!(n == 1, "connection closed mid-head: {:?}", String::from_utf8_lossy(&head));
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    let mut reply = Reply { head, body: Vec::new() };
    let len: usize = reply.header("Content-Length").map_or(0, |v| v.parse().unwrap());
    reply.body = vec![0u8; len];
    stream.read_exact(&mut reply.body).unwrap();
    reply
}

/// Splits a close-delimited response.
pub fn parse_reply(raw: &str) -> Reply {
    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw, ""));
    Reply {
        head: format!("{head}\r\n\r\n"),
        body: body.as_bytes().to_vec(),
    }
}
