//! Decode HTTP requests on the server.
//!
//! [`RequestParser`] is push based: bytes go in through [`RequestParser::feed`]
//! and come out as a sequence of [`Event`]s. It never touches a socket, so the
//! same input produces the same events no matter how it was fragmented.

use std::fmt;
use std::str::FromStr;

use http_types::{Body, Method, Request, Url, Version};

use crate::chunked::{ChunkedDecoder, Decoded};
use crate::registry::ConnInfo;
use crate::{Error, Result, MAX_HEADERS, MAX_HEAD_LENGTH};

/// The number returned from httparse when the request is HTTP 1.1
const HTTP_1_1_VERSION: u8 = 1;

/// The number returned from httparse when the request is HTTP 1.0
const HTTP_1_0_VERSION: u8 = 0;

const CONTINUE_HEADER_VALUE: &str = "100-continue";

/// Request header fields in arrival order.
///
/// Lookups ignore ASCII case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    fields: Vec<(String, String)>,
}

impl HeaderList {
    /// The first value for `name`.
    pub fn get<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.get_all(name).next()
    }

    /// Every value for `name`, in arrival order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Iterate over `(name, value)` pairs in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of fields, counting repeated names separately.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether there are no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn push(&mut self, name: &str, value: &str) {
        self.fields.push((name.to_owned(), value.to_owned()));
    }

    /// Comma separated tokens across every value of `name`.
    fn tokens<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

/// How the request body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head.
    None,
    /// Exactly this many bytes follow.
    Length(u64),
    /// A chunked body follows.
    Chunked,
}

/// A parsed request head.
#[derive(Clone, PartialEq, Eq)]
pub struct RequestHead {
    method: Method,
    target: String,
    version: Version,
    headers: HeaderList,
    framing: BodyFraming,
}

impl fmt::Debug for RequestHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHead")
            .field("method", &self.method)
            .field("target", &self.target)
            .field("version", &self.version)
            .field("headers", &self.headers.len())
            .field("framing", &self.framing)
            .finish()
    }
}

impl RequestHead {
    fn from_httparse(req: &httparse::Request<'_, '_>) -> Result<Self> {
        let method = req.method.ok_or_else(|| Error::malformed("no method found"))?;
        let method = Method::from_str(method)
            .map_err(|_| Error::malformed(format!("unknown method {}", method)))?;

        let version = match req.version {
            Some(HTTP_1_1_VERSION) => Version::Http1_1,
            Some(HTTP_1_0_VERSION) => Version::Http1_0,
            Some(other) => return Err(Error::UnsupportedVersion(other)),
            None => return Err(Error::malformed("no version found")),
        };

        let target = req.path.ok_or_else(|| Error::malformed("no uri found"))?;

        let mut headers = HeaderList::default();
        for header in req.headers.iter() {
            // http-types only stores ASCII header values.
            let value = std::str::from_utf8(header.value)
                .ok()
                .filter(|v| v.is_ascii())
                .ok_or_else(|| {
                    Error::malformed(format!("invalid value for header {}", header.name))
                })?;
            headers.push(header.name, value);
        }

        let framing = framing(&headers)?;
        Ok(Self {
            method,
            target: target.to_owned(),
            version,
            headers,
            framing,
        })
    }

    /// The request method.
    pub fn method(&self) -> Method {
        self.method
    }

    /// The raw request target, as sent.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The HTTP version of the request.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The header fields, in arrival order.
    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    /// How the body is delimited.
    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    /// Whether a body follows the head.
    pub fn has_body(&self) -> bool {
        match self.framing {
            BodyFraming::None | BodyFraming::Length(0) => false,
            BodyFraming::Length(_) | BodyFraming::Chunked => true,
        }
    }

    /// The declared body length, if the body is length delimited.
    pub fn content_length(&self) -> Option<u64> {
        match self.framing {
            BodyFraming::Length(len) => Some(len),
            _ => None,
        }
    }

    /// Whether the client asked for the connection to persist.
    ///
    /// HTTP/1.1 persists unless told otherwise, HTTP/1.0 only on request.
    pub fn keep_alive(&self) -> bool {
        let mut keep_alive = self.version == Version::Http1_1;
        for token in self.headers.tokens("connection") {
            if token.eq_ignore_ascii_case("close") {
                return false;
            } else if token.eq_ignore_ascii_case("keep-alive") {
                keep_alive = true;
            }
        }
        keep_alive
    }

    /// Whether the client waits for `100 Continue` before sending the body.
    ///
    /// Fails for expectations other than `100-continue`.
    pub fn expects_continue(&self) -> Result<bool> {
        if !self.has_body() {
            return Ok(false);
        }
        match self.headers.get("expect") {
            None => Ok(false),
            Some(value) if value.eq_ignore_ascii_case(CONTINUE_HEADER_VALUE) => Ok(true),
            Some(value) => Err(Error::ExpectationFailed(value.to_owned())),
        }
    }

    /// Whether this is a `HEAD` request, whose response carries no body.
    pub fn is_head(&self) -> bool {
        self.method == Method::Head
    }
}

fn framing(headers: &HeaderList) -> Result<BodyFraming> {
    let transfer_encoding = headers.tokens("transfer-encoding").last();
    let mut lengths = headers.get_all("content-length");
    let content_length = lengths.next();

    match (transfer_encoding, content_length) {
        (Some(_), Some(_)) => Err(Error::malformed("unexpected content-length header")),
        (Some(coding), None) if coding.eq_ignore_ascii_case("chunked") => {
            Ok(BodyFraming::Chunked)
        }
        (Some(coding), None) => Err(Error::malformed(format!(
            "unsupported transfer-encoding {}",
            coding
        ))),
        (None, Some(len)) => {
            if lengths.any(|other| other != len) {
                return Err(Error::malformed("conflicting content-length headers"));
            }
            if len.is_empty() || !len.bytes().all(|b| b.is_ascii_digit()) {
                return Err(Error::malformed("invalid content-length header"));
            }
            let len = len
                .parse::<u64>()
                .map_err(|_| Error::malformed("invalid content-length header"))?;
            Ok(BodyFraming::Length(len))
        }
        (None, None) => Ok(BodyFraming::None),
    }
}

/// Progress reported by [`RequestParser`].
#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    /// The head of a new request was parsed.
    Head(RequestHead),
    /// A piece of the current request's body.
    Data(Vec<u8>),
    /// The current request is complete.
    Complete,
}

#[derive(Debug)]
enum State {
    Head,
    Length { remaining: u64 },
    Chunked(ChunkedDecoder),
    Failed,
}

/// An incremental HTTP/1.x request parser.
///
/// Bytes past the end of the current message stay buffered for the next one,
/// which is how pipelined requests survive.
#[derive(Debug)]
pub struct RequestParser {
    buf: Vec<u8>,
    state: State,
    max_head: usize,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new(MAX_HEAD_LENGTH)
    }
}

impl RequestParser {
    /// Create a parser that rejects heads longer than `max_head` bytes.
    pub fn new(max_head: usize) -> Self {
        Self {
            buf: Vec::new(),
            state: State::Head,
            max_head,
        }
    }

    /// Append `bytes` and iterate over the events they complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Events<'_> {
        self.buf.extend_from_slice(bytes);
        Events { parser: self }
    }

    /// Bytes received but not yet turned into events.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Whether the parser sits between two messages.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Head)
    }

    /// The next event from the buffered bytes, `None` if more are needed.
    ///
    /// After an error the parser is poisoned and yields nothing further.
    pub fn next_event(&mut self) -> Result<Option<Event>> {
        match self.advance() {
            Err(err) => {
                self.state = State::Failed;
                Err(err)
            }
            ok => ok,
        }
    }

    fn advance(&mut self) -> Result<Option<Event>> {
        match &mut self.state {
            State::Head => self.parse_head(),
            State::Length { remaining } => {
                if *remaining == 0 {
                    self.state = State::Head;
                    return Ok(Some(Event::Complete));
                }
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let amt = (*remaining).min(self.buf.len() as u64) as usize;
                *remaining -= amt as u64;
                let data = self.buf.drain(..amt).collect();
                Ok(Some(Event::Data(data)))
            }
            State::Chunked(decoder) => {
                let (consumed, decoded) = decoder.decode(&self.buf)?;
                let event = match decoded {
                    Some(Decoded::Data(range)) => Some(Event::Data(self.buf[range].to_vec())),
                    Some(Decoded::End) => Some(Event::Complete),
                    None => None,
                };
                self.buf.drain(..consumed);
                match event {
                    Some(Event::Complete) => self.state = State::Head,
                    // Only an unfinished trailer section can stall here.
                    None if self.buf.len() > self.max_head => return Err(Error::HeadersTooLarge),
                    _ => {}
                }
                Ok(event)
            }
            State::Failed => Ok(None),
        }
    }

    fn parse_head(&mut self) -> Result<Option<Event>> {
        // Tolerate stray line breaks between pipelined requests.
        let blank = self
            .buf
            .iter()
            .take_while(|b| **b == b'\r' || **b == b'\n')
            .count();
        self.buf.drain(..blank);

        let end = match self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
            Some(pos) => pos + 4,
            None if self.buf.len() >= self.max_head => return Err(Error::HeadersTooLarge),
            None => return Ok(None),
        };
        // Prevent CWE-400 DDOS with large HTTP Headers.
        if end > self.max_head {
            return Err(Error::HeadersTooLarge);
        }

        let head = {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut httparse_req = httparse::Request::new(&mut headers);
            let status = httparse_req.parse(&self.buf[..end])?;
            if status.is_partial() {
                return Err(Error::malformed("malformed HTTP head"));
            }
            RequestHead::from_httparse(&httparse_req)?
        };
        self.buf.drain(..end);

        self.state = match head.framing() {
            BodyFraming::None => State::Length { remaining: 0 },
            BodyFraming::Length(len) => State::Length { remaining: len },
            BodyFraming::Chunked => State::Chunked(ChunkedDecoder::new()),
        };
        Ok(Some(Event::Head(head)))
    }
}

/// Iterator over the events completed by one [`RequestParser::feed`] call.
#[derive(Debug)]
pub struct Events<'a> {
    parser: &'a mut RequestParser,
}

impl Iterator for Events<'_> {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        self.parser.next_event().transpose()
    }
}

/// Build the handler-facing request from a parsed head.
pub(crate) fn build_request(head: &RequestHead, body: Body, info: ConnInfo) -> Result<Request> {
    let url = url_from_head(head)?;
    let mut req = Request::new(head.method(), url);
    req.set_version(Some(head.version()));
    for (name, value) in head.headers().iter() {
        req.append_header(name, value);
    }
    req.set_body(body);
    req.ext_mut().insert(info);
    req.ext_mut().insert(head.clone());
    Ok(req)
}

fn url_from_head(head: &RequestHead) -> Result<Url> {
    let path = head.target();

    if path.starts_with("http://") || path.starts_with("https://") {
        // The host header MUST be ignored for absolute targets.
        return Url::parse(path).map_err(|e| Error::malformed(e.to_string()));
    }

    let host = match head.headers().get("host") {
        Some(host) => host,
        None if head.version() == Version::Http1_0 => "localhost",
        None => return Err(Error::malformed("mandatory host header missing")),
    };

    if path.starts_with('/') {
        let mut url = Url::parse(&format!("http://{}/", host))
            .map_err(|e| Error::malformed(e.to_string()))?;
        let (path, query) = match path.find('?') {
            Some(idx) => (&path[..idx], Some(&path[idx + 1..])),
            None => (path, None),
        };
        url.set_path(path);
        url.set_query(query);
        Ok(url)
    } else if head.method() == Method::Connect {
        Url::parse(&format!("http://{}/", path)).map_err(|e| Error::malformed(e.to_string()))
    } else {
        Err(Error::malformed("unexpected uri format"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn head(s: &str) -> RequestHead {
        let mut parser = RequestParser::default();
        match parser.feed(s.as_bytes()).next() {
            Some(Ok(Event::Head(head))) => head,
            other => panic!("expected a head, got {:?}", other),
        }
    }

    fn head_err(s: &str) -> Error {
        let mut parser = RequestParser::default();
        match parser.feed(s.as_bytes()).next() {
            Some(Err(err)) => err,
            other => panic!("expected an error, got {:?}", other),
        }
    }

    /// The head plus the concatenated body, however the events arrived.
    fn collect(parser: &mut RequestParser, pieces: &[&[u8]]) -> Vec<(RequestHead, Vec<u8>)> {
        let mut messages = Vec::new();
        let mut current: Option<(RequestHead, Vec<u8>)> = None;
        for piece in pieces {
            for event in parser.feed(piece) {
                match event.unwrap() {
                    Event::Head(head) => current = Some((head, Vec::new())),
                    Event::Data(data) => current.as_mut().unwrap().1.extend(data),
                    Event::Complete => messages.push(current.take().unwrap()),
                }
            }
        }
        messages
    }

    const CHUNKED_POST: &str = "POST /upload?x=1 HTTP/1.1\r\n\
        Host: example.com\r\n\
        X-Trace: a\r\n\
        Transfer-Encoding: chunked\r\n\
        x-trace: b\r\n\r\n\
        5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\n\r\n";

    #[test]
    fn fragmentation_does_not_change_the_request() {
        let whole = collect(&mut RequestParser::default(), &[CHUNKED_POST.as_bytes()]);
        assert_eq!(whole.len(), 1);
        assert_eq!(whole[0].1, b"hello world".to_vec());

        for size in 1..CHUNKED_POST.len() {
            let pieces: Vec<&[u8]> = CHUNKED_POST.as_bytes().chunks(size).collect();
            let fragmented = collect(&mut RequestParser::default(), &pieces);
            assert_eq!(fragmented, whole, "fragment size {}", size);
        }
    }

    #[test]
    fn pipelined_requests_stay_buffered() {
        let input = "GET /a HTTP/1.1\r\nHost: x\r\n\r\n\
                     POST /b HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\nabc\
                     GET /c HTTP/1.1\r\nHost: x\r\n\r\n";
        let mut parser = RequestParser::default();
        let messages = collect(&mut parser, &[input.as_bytes()]);
        let targets: Vec<_> = messages.iter().map(|(h, _)| h.target().to_owned()).collect();
        assert_eq!(targets, vec!["/a", "/b", "/c"]);
        assert_eq!(messages[1].1, b"abc".to_vec());
        assert_eq!(parser.buffered(), 0);
        assert!(parser.is_idle());
    }

    #[test]
    fn parsing_pauses_between_messages() {
        let input = "GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n";
        let mut parser = RequestParser::default();
        let mut events = parser.feed(input.as_bytes());
        assert!(matches!(events.next(), Some(Ok(Event::Head(_)))));
        assert!(matches!(events.next(), Some(Ok(Event::Complete))));
        drop(events);
        // The second request is untouched until someone asks for it.
        assert!(parser.buffered() > 0);
        assert!(matches!(parser.next_event(), Ok(Some(Event::Head(_)))));
    }

    #[test]
    fn headers_keep_order_and_ignore_case() {
        let head = head(CHUNKED_POST);
        let names: Vec<_> = head.headers().iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Host", "X-Trace", "Transfer-Encoding", "x-trace"]);
        assert_eq!(head.headers().get("HOST"), Some("example.com"));
        let traces: Vec<_> = head.headers().get_all("X-TRACE").collect();
        assert_eq!(traces, vec!["a", "b"]);
        assert_eq!(head.framing(), BodyFraming::Chunked);
    }

    #[test]
    fn keep_alive_follows_version_and_connection_header() {
        assert!(head("GET / HTTP/1.1\r\nHost: x\r\n\r\n").keep_alive());
        assert!(!head("GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").keep_alive());
        assert!(!head("GET / HTTP/1.0\r\n\r\n").keep_alive());
        assert!(head("GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n").keep_alive());
    }

    #[test]
    fn expect_is_only_checked_with_a_body() {
        let h = head("POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\nExpect: 100-continue\r\n\r\n");
        assert!(h.expects_continue().unwrap());
        let h = head("POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\nExpect: teapot\r\n\r\n");
        assert!(matches!(h.expects_continue(), Err(Error::ExpectationFailed(_))));
        let h = head("GET / HTTP/1.1\r\nHost: x\r\nExpect: teapot\r\n\r\n");
        assert!(!h.expects_continue().unwrap());
    }

    #[test]
    fn ambiguous_framing_is_rejected() {
        let err = head_err(
            "POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        assert!(matches!(err, Error::Malformed(_)));
        let err = head_err("POST / HTTP/1.1\r\nHost: x\r\nContent-Length: -3\r\n\r\n");
        assert!(matches!(err, Error::Malformed(_)));
        let err = head_err("POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: gzip\r\n\r\n");
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn oversized_heads_fail_before_the_terminator() {
        let mut parser = RequestParser::new(64);
        let mut input = b"GET / HTTP/1.1\r\nX-Long: ".to_vec();
        input.extend(vec![b'a'; 64]);
        let first = parser.feed(&input).next();
        assert!(matches!(first, Some(Err(Error::HeadersTooLarge))));
        // poisoned
        assert!(parser.feed(b"\r\n\r\n").next().is_none());
    }

    #[test]
    fn garbage_is_malformed() {
        let err = head_err("\x01\x02 nonsense\r\n\r\n");
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn url_for_connect() {
        let head = head("CONNECT server.example.com:443 HTTP/1.1\r\nHost: server.example.com:443\r\n\r\n");
        let url = url_from_head(&head).unwrap();
        assert_eq!(url.as_str(), "http://server.example.com:443/");
    }

    #[test]
    fn url_for_host_plus_path() {
        let head = head("GET /some/resource?q=1 HTTP/1.1\r\nHost: server.example.com:443\r\n\r\n");
        let url = url_from_head(&head).unwrap();
        assert_eq!(url.as_str(), "http://server.example.com:443/some/resource?q=1");
    }

    #[test]
    fn url_for_host_plus_absolute_url() {
        let head = head("GET http://domain.com/some/resource HTTP/1.1\r\nHost: server.example.com\r\n\r\n");
        let url = url_from_head(&head).unwrap();
        assert_eq!(url.as_str(), "http://domain.com/some/resource");
    }

    #[test]
    fn url_for_malformed_resource_path() {
        let head = head("GET not-a-url HTTP/1.1\r\nHost: server.example.com\r\n\r\n");
        assert!(url_from_head(&head).is_err());
    }

    #[test]
    fn url_without_host() {
        let head_1_1 = head("GET / HTTP/1.1\r\n\r\n");
        assert!(url_from_head(&head_1_1).is_err());
        let head_1_0 = head("GET /x HTTP/1.0\r\n\r\n");
        assert_eq!(url_from_head(&head_1_0).unwrap().as_str(), "http://localhost/x");
    }
}
