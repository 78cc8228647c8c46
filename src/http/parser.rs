//! Incremental HTTP/1.x request parser.
//!
//! The parser never owns the input. The connection keeps appending socket
//! bytes to one buffer and calls [`RequestParser::parse`] with the whole
//! buffer; the parser remembers how much of it is consumed and how far it
//! has already searched for a line end, so each byte is examined once.

use thiserror::Error;

use super::headers::Headers;
use super::method::{is_tchar, Method};
use super::request::{Request, Version};
use super::status::StatusCode;

/// Longest chunk-size line accepted, extensions included.
const MAX_CHUNK_LINE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed request line")]
    RequestLine,
    #[error("unsupported HTTP version")]
    Version,
    #[error("malformed header line")]
    HeaderLine,
    #[error("header section too large")]
    HeadersTooLarge,
    #[error("both Content-Length and Transfer-Encoding present")]
    ConflictingFraming,
    #[error("invalid Content-Length")]
    ContentLength,
    #[error("unsupported Transfer-Encoding")]
    TransferEncoding,
    #[error("malformed chunked body")]
    Chunk,
    #[error("request body exceeds the size limit")]
    PayloadTooLarge,
}

impl ParseError {
    pub fn status(self) -> StatusCode {
        match self {
            ParseError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Debug)]
pub enum ParseStatus {
    NeedMoreData,
    Complete(Request),
    Error(ParseError),
}

/// Coarse position of the parser, reported to the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Head,
    Body,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StartLine,
    Headers,
    Body(BodyState),
    Done,
    Failed(ParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    Length(usize),
    Chunked(Chunk),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size,
    Data(usize),
    DataEnd,
    Trailers,
}

#[derive(Debug)]
pub struct RequestParser {
    state: State,
    /// Bytes of the input consumed so far.
    pos: usize,
    /// Offset up to which the input has been searched for `\n`.
    scan: usize,
    max_header_bytes: usize,
    trailer_bytes: usize,
    content_length: Option<usize>,
    /// Remaining body allowance for chunked bodies.
    budget: usize,
    request: Option<Request>,
    method: Option<Method>,
    target: String,
    version: Version,
    headers: Headers,
}

impl RequestParser {
    pub fn new(max_header_bytes: usize) -> Self {
        RequestParser {
            state: State::StartLine,
            pos: 0,
            scan: 0,
            max_header_bytes,
            trailer_bytes: 0,
            content_length: None,
            budget: 0,
            request: None,
            method: None,
            target: String::new(),
            version: Version::Http11,
            headers: Headers::new(),
        }
    }

    /// Prepares for the next request. The caller must already have removed
    /// the previous request's [`consumed`](Self::consumed) bytes from its
    /// buffer.
    pub fn reset(&mut self) {
        *self = RequestParser::new(self.max_header_bytes);
    }

    /// Bytes of the input belonging to the request parsed so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    pub fn phase(&self) -> Phase {
        match self.state {
            State::Body(_) => Phase::Body,
            _ => Phase::Head,
        }
    }

    /// While a body is being read, the consumed bytes are framing or body
    /// data already copied into the request. Returns how many of them the
    /// caller may drop from the front of its buffer; offsets are rebased so
    /// the next `parse` call sees the shortened buffer.
    pub fn release_consumed(&mut self) -> usize {
        if self.phase() != Phase::Body {
            return 0;
        }
        let n = self.pos;
        self.pos = 0;
        self.scan = self.scan.saturating_sub(n);
        n
    }

    /// Advances over `buf`, which must start with the bytes handed in on
    /// earlier calls since the last reset.
    ///
    /// `body_limit` is consulted once, when the header block is complete,
    /// with the request head (empty body) so the limit can depend on the
    /// selected virtual host.
    pub fn parse<F>(&mut self, buf: &[u8], body_limit: F) -> ParseStatus
    where
        F: FnOnce(&Request) -> usize,
    {
        let mut body_limit = Some(body_limit);
        match self.advance(buf, &mut body_limit) {
            Ok(Some(request)) => ParseStatus::Complete(request),
            Ok(None) => ParseStatus::NeedMoreData,
            Err(err) => {
                self.state = State::Failed(err);
                ParseStatus::Error(err)
            }
        }
    }

    fn advance<F>(&mut self, buf: &[u8], body_limit: &mut Option<F>) -> Result<Option<Request>, ParseError>
    where
        F: FnOnce(&Request) -> usize,
    {
        loop {
            match self.state {
                State::Failed(err) => return Err(err),
                State::Done => return Ok(None),
                State::StartLine | State::Headers => {
                    let Some(line) = self.next_line(buf) else {
                        if self.scan > self.max_header_bytes {
                            return Err(ParseError::HeadersTooLarge);
                        }
                        return Ok(None);
                    };
                    if self.pos > self.max_header_bytes {
                        return Err(ParseError::HeadersTooLarge);
                    }
                    if self.state == State::StartLine {
                        // Stray CRLFs before a request line are tolerated.
                        if !line.is_empty() {
                            self.request_line(line)?;
                            self.state = State::Headers;
                        }
                    } else if line.is_empty() {
                        let limit = body_limit.take().map_or(0, |f| {
                            let head = self.head();
                            f(&head)
                        });
                        if let Some(done) = self.finish_head(limit)? {
                            return Ok(Some(done));
                        }
                    } else {
                        self.header_line(line)?;
                    }
                }
                State::Body(BodyState::Length(remaining)) => {
                    let left = self.copy_body(buf, remaining);
                    if left > 0 {
                        self.state = State::Body(BodyState::Length(left));
                        return Ok(None);
                    }
                    return Ok(Some(self.complete()));
                }
                State::Body(BodyState::Chunked(chunk)) => match chunk {
                    Chunk::Size => {
                        let Some(line) = self.next_line(buf) else {
                            if self.scan - self.pos > MAX_CHUNK_LINE {
                                return Err(ParseError::Chunk);
                            }
                            return Ok(None);
                        };
                        let size = parse_chunk_size(line)?;
                        if size == 0 {
                            self.state = State::Body(BodyState::Chunked(Chunk::Trailers));
                        } else if size > self.budget {
                            return Err(ParseError::PayloadTooLarge);
                        } else {
                            self.budget -= size;
                            if let Some(req) = self.request.as_mut() {
                                req.body.reserve(size);
                            }
                            self.state = State::Body(BodyState::Chunked(Chunk::Data(size)));
                        }
                    }
                    Chunk::Data(remaining) => {
                        let left = self.copy_body(buf, remaining);
                        if left > 0 {
                            self.state = State::Body(BodyState::Chunked(Chunk::Data(left)));
                            return Ok(None);
                        }
                        self.state = State::Body(BodyState::Chunked(Chunk::DataEnd));
                    }
                    Chunk::DataEnd => {
                        let Some(line) = self.next_line(buf) else {
                            if self.scan - self.pos > 2 {
                                return Err(ParseError::Chunk);
                            }
                            return Ok(None);
                        };
                        if !line.is_empty() {
                            return Err(ParseError::Chunk);
                        }
                        self.state = State::Body(BodyState::Chunked(Chunk::Size));
                    }
                    Chunk::Trailers => {
                        let Some(line) = self.next_line(buf) else {
                            if self.trailer_bytes + (self.scan - self.pos) > self.max_header_bytes {
                                return Err(ParseError::HeadersTooLarge);
                            }
                            return Ok(None);
                        };
                        if line.is_empty() {
                            return Ok(Some(self.complete()));
                        }
                        self.trailer_bytes += line.len() + 2;
                        if self.trailer_bytes > self.max_header_bytes {
                            return Err(ParseError::HeadersTooLarge);
                        }
                    }
                },
            }
        }
    }

    /// Returns the next line (without its terminator) and consumes it.
    /// Accepts both CRLF and bare LF.
    fn next_line<'b>(&mut self, buf: &'b [u8]) -> Option<&'b [u8]> {
        let from = self.scan.max(self.pos);
        match buf[from..].iter().position(|&b| b == b'\n') {
            Some(i) => {
                let end = from + i;
                let mut line = &buf[self.pos..end];
                if let Some(stripped) = line.strip_suffix(b"\r") {
                    line = stripped;
                }
                self.pos = end + 1;
                self.scan = self.pos;
                Some(line)
            }
            None => {
                self.scan = buf.len();
                None
            }
        }
    }

    /// Moves up to `remaining` body bytes into the request; returns what is
    /// still missing.
    fn copy_body(&mut self, buf: &[u8], remaining: usize) -> usize {
        let available = buf.len().saturating_sub(self.pos);
        let take = available.min(remaining);
        if let Some(req) = self.request.as_mut() {
            req.body.extend_from_slice(&buf[self.pos..self.pos + take]);
        }
        self.pos += take;
        self.scan = self.pos;
        remaining - take
    }

    fn request_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let line = std::str::from_utf8(line).map_err(|_| ParseError::RequestLine)?;
        let mut parts = line.split(' ');
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseError::RequestLine);
        };

        self.method = Some(Method::parse(method).ok_or(ParseError::RequestLine)?);
        self.target = normalize_target(target).ok_or(ParseError::RequestLine)?;
        self.version = match version {
            "HTTP/1.1" => Version::Http11,
            "HTTP/1.0" => Version::Http10,
            v if v.starts_with("HTTP/") => return Err(ParseError::Version),
            _ => return Err(ParseError::RequestLine),
        };
        Ok(())
    }

    fn header_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        if line.starts_with(b" ") || line.starts_with(b"\t") {
            return Err(ParseError::HeaderLine);
        }
        let line = std::str::from_utf8(line).map_err(|_| ParseError::HeaderLine)?;
        let (name, value) = line.split_once(':').ok_or(ParseError::HeaderLine)?;
        if name.is_empty() || !name.bytes().all(is_tchar) {
            return Err(ParseError::HeaderLine);
        }
        let value = value.trim_matches(|c| c == ' ' || c == '\t');

        if name.eq_ignore_ascii_case("Content-Length") {
            let mut parsed = None;
            for piece in value.split(',') {
                let n = parse_decimal(piece.trim()).ok_or(ParseError::ContentLength)?;
                if parsed.is_some_and(|p| p != n) {
                    return Err(ParseError::ContentLength);
                }
                parsed = Some(n);
            }
            let n = parsed.ok_or(ParseError::ContentLength)?;
            if self.content_length.is_some_and(|p| p != n) {
                return Err(ParseError::ContentLength);
            }
            self.content_length = Some(n);
        }
        self.headers.append(name, value);
        Ok(())
    }

    fn head(&self) -> Request {
        Request {
            method: self.method.clone().unwrap_or(Method::Get),
            target: self.target.clone(),
            version: self.version,
            headers: self.headers.clone(),
            body: Vec::new(),
        }
    }

    /// Picks the body framing. Returns the request when it has no body.
    fn finish_head(&mut self, limit: usize) -> Result<Option<Request>, ParseError> {
        let chunked = match self.headers.get("Transfer-Encoding") {
            Some(te) => {
                if self.content_length.is_some() {
                    return Err(ParseError::ConflictingFraming);
                }
                let mut codings = te.split(',').map(str::trim).filter(|c| !c.is_empty());
                match (codings.next(), codings.next()) {
                    (Some(c), None) if c.eq_ignore_ascii_case("chunked") => true,
                    _ => return Err(ParseError::TransferEncoding),
                }
            }
            None => false,
        };

        self.request = Some(Request {
            method: self.method.take().unwrap_or(Method::Get),
            target: std::mem::take(&mut self.target),
            version: self.version,
            headers: std::mem::take(&mut self.headers),
            body: Vec::new(),
        });

        if chunked {
            self.budget = limit;
            self.state = State::Body(BodyState::Chunked(Chunk::Size));
            return Ok(None);
        }
        match self.content_length {
            Some(n) if n > limit => Err(ParseError::PayloadTooLarge),
            Some(n) if n > 0 => {
                if let Some(req) = self.request.as_mut() {
                    req.body.reserve(n.min(64 * 1024));
                }
                self.state = State::Body(BodyState::Length(n));
                Ok(None)
            }
            _ => Ok(Some(self.complete())),
        }
    }

    fn complete(&mut self) -> Request {
        self.state = State::Done;
        let mut request = self.request.take().unwrap_or_else(|| self.head());
        if request.headers.contains("Transfer-Encoding") {
            // De-chunked bodies are handed on with an explicit length.
            request.headers.remove("Transfer-Encoding");
            request.headers.set("Content-Length", request.body.len().to_string());
        }
        request
    }
}

/// Accepts origin-form, absolute-form (reduced to origin-form) and `*`.
fn normalize_target(target: &str) -> Option<String> {
    if target.is_empty() || target.bytes().any(|b| b <= b' ' || b == 0x7f) {
        return None;
    }
    if target.starts_with('/') || target == "*" {
        return Some(target.to_string());
    }
    let lower = target.to_ascii_lowercase();
    let rest = if lower.starts_with("http://") {
        &target[7..]
    } else if lower.starts_with("https://") {
        &target[8..]
    } else {
        return None;
    };
    match rest.find(['/', '?']) {
        Some(i) if rest.as_bytes()[i] == b'/' => Some(rest[i..].to_string()),
        Some(i) => Some(format!("/{}", &rest[i..])),
        None => Some("/".to_string()),
    }
}

fn parse_decimal(s: &str) -> Option<usize> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, ParseError> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError::Chunk)?;
    let size = line.split(';').next().unwrap_or("").trim_matches(|c| c == ' ' || c == '\t');
    if size.is_empty() || !size.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ParseError::Chunk);
    }
    usize::from_str_radix(size, 16).map_err(|_| ParseError::Chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 1 << 20;

    fn parse_all(msg: &[u8]) -> (ParseStatus, usize) {
        let mut p = RequestParser::new(8192);
        let status = p.parse(msg, |_| LIMIT);
        (status, p.consumed())
    }

    fn parse_bytewise(msg: &[u8]) -> (ParseStatus, usize) {
        let mut p = RequestParser::new(8192);
        let mut buf = Vec::new();
        for &b in msg {
            buf.push(b);
            match p.parse(&buf, |_| LIMIT) {
                ParseStatus::NeedMoreData => continue,
                other => return (other, p.consumed()),
            }
        }
        (ParseStatus::NeedMoreData, p.consumed())
    }

    fn complete(status: ParseStatus) -> Request {
        match status {
            ParseStatus::Complete(r) => r,
            other => panic!("expected complete request, got {other:?}"),
        }
    }

    fn error(status: ParseStatus) -> ParseError {
        match status {
            ParseStatus::Error(e) => e,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn simple_get() {
        let (status, used) = parse_all(b"GET /index.html?a=1 HTTP/1.1\r\nHost: a.example\r\n\r\n");
        let req = complete(status);
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path(), "/index.html");
        assert_eq!(req.query(), "a=1");
        assert_eq!(req.version, Version::Http11);
        assert_eq!(req.headers.get("host"), Some("a.example"));
        assert!(req.body.is_empty());
        assert_eq!(used, 49);
    }

    #[test]
    fn bytewise_feeding_matches_single_read() {
        let messages: &[&[u8]] = &[
            b"GET / HTTP/1.1\r\nHost: x\r\nAccept: a\r\nAccept: b\r\n\r\n",
            b"POST /form HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\n\r\nhello world",
            b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\nX-Trailer: 1\r\n\r\n",
            b"\r\nGET /lf HTTP/1.0\nHost: y\n\n",
        ];
        for msg in messages {
            let (whole, used_whole) = parse_all(msg);
            let (split, used_split) = parse_bytewise(msg);
            assert_eq!(complete(whole), complete(split));
            assert_eq!(used_whole, used_split);
            assert_eq!(used_whole, msg.len());
        }
    }

    #[test]
    fn content_length_stops_at_exact_count() {
        let msg = b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloGET /next HTTP/1.1\r\n\r\n";
        let (status, used) = parse_all(msg);
        let req = complete(status);
        assert_eq!(req.body, b"hello");
        assert_eq!(&msg[used..], b"GET /next HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn chunked_body_is_reassembled() {
        let msg = b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let req = complete(parse_all(msg).0);
        assert_eq!(req.body, b"Wikipedia");
        assert_eq!(req.headers.get("content-length"), Some("9"));
        assert!(!req.headers.contains("transfer-encoding"));
    }

    #[test]
    fn empty_chunked_body_gets_explicit_length() {
        let msg = b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n";
        let req = complete(parse_all(msg).0);
        assert!(req.body.is_empty());
        assert_eq!(req.headers.get("content-length"), Some("0"));
        assert!(!req.headers.contains("transfer-encoding"));

        let req = complete(parse_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").0);
        assert!(!req.headers.contains("content-length"));
    }

    #[test]
    fn released_body_bytes_can_be_dropped() {
        let pad = "a".repeat(40);
        let mut p = RequestParser::new(8192);
        let mut buf = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n1;pa".to_vec();
        assert!(matches!(p.parse(&buf, |_| 64), ParseStatus::NeedMoreData));
        for _ in 0..40 {
            buf.extend_from_slice(format!("d={pad}\r\nx\r\n1;pa").as_bytes());
            assert!(matches!(p.parse(&buf, |_| 64), ParseStatus::NeedMoreData));
            let released = p.release_consumed();
            buf.drain(..released);
            // Only the unfinished chunk-size line is left behind.
            assert_eq!(buf, b"1;pa");
        }
        assert_eq!(p.release_consumed(), 0);
        buf.extend_from_slice(b"d=x\r\nx\r\n0\r\n\r\n");
        let req = complete(p.parse(&buf, |_| 64));
        assert_eq!(req.body, vec![b'x'; 41]);
        assert_eq!(p.consumed(), buf.len());
    }

    #[test]
    fn release_keeps_the_head_until_it_is_parsed() {
        let mut p = RequestParser::new(8192);
        let mut buf = b"POST / HTTP/1.1\r\nContent-Length: 6\r\n".to_vec();
        assert!(matches!(p.parse(&buf, |_| LIMIT), ParseStatus::NeedMoreData));
        assert_eq!(p.release_consumed(), 0);

        buf.extend_from_slice(b"\r\nabc");
        assert!(matches!(p.parse(&buf, |_| LIMIT), ParseStatus::NeedMoreData));
        let released = p.release_consumed();
        assert_eq!(released, buf.len());
        buf.drain(..released);
        buf.extend_from_slice(b"def");
        let req = complete(p.parse(&buf, |_| LIMIT));
        assert_eq!(req.body, b"abcdef");
        assert_eq!(p.consumed(), 3);
    }

    #[test]
    fn needs_more_data_until_body_arrives() {
        let mut p = RequestParser::new(8192);
        let mut buf = b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\nab".to_vec();
        assert!(matches!(p.parse(&buf, |_| LIMIT), ParseStatus::NeedMoreData));
        assert_eq!(p.phase(), Phase::Body);
        buf.extend_from_slice(b"cd");
        assert_eq!(complete(p.parse(&buf, |_| LIMIT)).body, b"abcd");
    }

    #[test]
    fn malformed_request_lines() {
        for msg in [
            &b"GET /\r\n\r\n"[..],
            b"GET  / HTTP/1.1\r\n\r\n",
            b"G(T / HTTP/1.1\r\n\r\n",
            b"GET index.html HTTP/1.1\r\n\r\n",
            b"GET / FTP/1.0\r\n\r\n",
        ] {
            assert_eq!(error(parse_all(msg).0), ParseError::RequestLine, "{msg:?}");
        }
        assert_eq!(error(parse_all(b"GET / HTTP/2.0\r\n\r\n").0), ParseError::Version);
    }

    #[test]
    fn header_without_colon_is_rejected() {
        let e = error(parse_all(b"GET / HTTP/1.1\r\nHost a.example\r\n\r\n").0);
        assert_eq!(e, ParseError::HeaderLine);
        assert_eq!(e.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn obsolete_line_folding_is_rejected() {
        let e = error(parse_all(b"GET / HTTP/1.1\r\nX-A: 1\r\n  continued\r\n\r\n").0);
        assert_eq!(e, ParseError::HeaderLine);
    }

    #[test]
    fn conflicting_framing_is_rejected() {
        let msg = b"POST / HTTP/1.1\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n";
        assert_eq!(error(parse_all(msg).0), ParseError::ConflictingFraming);
        let msg = b"POST / HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\n";
        assert_eq!(error(parse_all(msg).0), ParseError::ContentLength);
        let msg = b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n";
        assert_eq!(error(parse_all(msg).0), ParseError::TransferEncoding);
    }

    #[test]
    fn oversized_bodies_are_rejected() {
        let mut p = RequestParser::new(8192);
        let msg = b"POST / HTTP/1.1\r\nContent-Length: 11\r\n\r\n";
        let e = error(p.parse(msg, |_| 10));
        assert_eq!(e, ParseError::PayloadTooLarge);
        assert_eq!(e.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let mut p = RequestParser::new(8192);
        let msg = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n6\r\nabcdef\r\n6\r\n";
        assert_eq!(error(p.parse(msg, |_| 10)), ParseError::PayloadTooLarge);
    }

    #[test]
    fn body_limit_sees_request_head() {
        let mut p = RequestParser::new(8192);
        let msg = b"POST / HTTP/1.1\r\nHost: small.example\r\nContent-Length: 4\r\n\r\nabcd";
        let status = p.parse(msg, |head| {
            if head.host() == Some("small.example") {
                2
            } else {
                LIMIT
            }
        });
        assert_eq!(error(status), ParseError::PayloadTooLarge);
    }

    #[test]
    fn header_section_is_bounded() {
        let mut p = RequestParser::new(64);
        let mut msg = b"GET / HTTP/1.1\r\nX-Long: ".to_vec();
        msg.extend(std::iter::repeat(b'a').take(100));
        assert_eq!(error(p.parse(&msg, |_| LIMIT)), ParseError::HeadersTooLarge);
    }

    #[test]
    fn bad_chunk_framing() {
        let msg = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n";
        assert_eq!(error(parse_all(msg).0), ParseError::Chunk);
        let msg = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nabX\r\n";
        assert_eq!(error(parse_all(msg).0), ParseError::Chunk);
    }

    #[test]
    fn absolute_form_is_reduced() {
        let req = complete(parse_all(b"GET http://a.example/p?q=1 HTTP/1.1\r\n\r\n").0);
        assert_eq!(req.target, "/p?q=1");
        let req = complete(parse_all(b"GET http://a.example HTTP/1.1\r\n\r\n").0);
        assert_eq!(req.target, "/");
    }

    #[test]
    fn unknown_methods_parse() {
        let req = complete(parse_all(b"BREW /pot HTTP/1.1\r\n\r\n").0);
        assert_eq!(req.method, Method::Extension("BREW".into()));
    }

    #[test]
    fn reset_allows_next_request() {
        let mut buf = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n".to_vec();
        let mut p = RequestParser::new(8192);
        assert_eq!(complete(p.parse(&buf, |_| LIMIT)).target, "/a");
        buf.drain(..p.consumed());
        p.reset();
        assert_eq!(complete(p.parse(&buf, |_| LIMIT)).target, "/b");
    }
}
