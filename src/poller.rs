//! Level-triggered epoll wrapper.
//!
//! Every registration carries a [`Token`] naming what kind of descriptor it
//! is, so the event loop dispatches on the token alone.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use libc::{
    epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT,
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const NONE: Interest = Interest { read: false, write: false };
    pub const READ: Interest = Interest { read: true, write: false };
    pub const WRITE: Interest = Interest { read: false, write: true };

    pub fn is_none(self) -> bool {
        !self.read && !self.write
    }

    fn bits(self) -> u32 {
        let mut bits = 0;
        if self.read {
            bits |= EPOLLIN as u32;
        }
        if self.write {
            bits |= EPOLLOUT as u32;
        }
        bits
    }
}

/// Identity of a registered descriptor.
///
/// Client and pipe tokens carry the owning connection's id. Ids are never
/// reused, so events still queued for a closed connection find nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Accept(usize),
    Client(u64),
    CgiOutput(u64),
    CgiInput(u64),
}

/// Ids occupy the low 56 bits; the top byte holds the kind.
pub const ID_MASK: u64 = (1 << 56) - 1;

impl Token {
    pub fn encode(self) -> u64 {
        let (kind, id) = match self {
            Token::Accept(i) => (0u64, i as u64),
            Token::Client(id) => (1, id),
            Token::CgiOutput(id) => (2, id),
            Token::CgiInput(id) => (3, id),
        };
        (kind << 56) | (id & ID_MASK)
    }

    pub fn decode(data: u64) -> Option<Token> {
        let id = data & ID_MASK;
        match data >> 56 {
            0 => Some(Token::Accept(id as usize)),
            1 => Some(Token::Client(id)),
            2 => Some(Token::CgiOutput(id)),
            3 => Some(Token::CgiInput(id)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// Peer hung up or the descriptor is in error.
    pub hangup: bool,
    pub error: bool,
}

pub struct Poller {
    epoll: OwnedFd,
    events: Vec<epoll_event>,
}

impl Poller {
    pub fn new(max_events: usize) -> io::Result<Poller> {
        let fd = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let epoll = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Poller {
            epoll,
            events: vec![epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    pub fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, token, interest)
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, token, interest)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe { epoll_ctl(self.epoll.as_raw_fd(), EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Blocks until a registered descriptor is ready or `timeout_ms` passes.
    /// An interrupted wait yields no events.
    pub fn wait(&mut self, timeout_ms: i32) -> io::Result<Vec<Event>> {
        let n = unsafe {
            epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let mut out = Vec::with_capacity(n as usize);
        for ev in &self.events[..n as usize] {
            let bits = ev.events;
            let data = ev.u64;
            let Some(token) = Token::decode(data) else {
                continue;
            };
            out.push(Event {
                token,
                readable: bits & EPOLLIN as u32 != 0,
                writable: bits & EPOLLOUT as u32 != 0,
                hangup: bits & EPOLLHUP as u32 != 0,
                error: bits & EPOLLERR as u32 != 0,
            });
        }
        Ok(out)
    }

    fn ctl(&self, op: i32, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = epoll_event {
            events: interest.bits(),
            u64: token.encode(),
        };
        let rc = unsafe { epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event as *mut epoll_event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
