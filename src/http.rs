// src/http.rs - HTTP request parsing and response assembly
//
// Line-oriented incremental parser: bytes accumulate in the connection's
// input buffer and are consumed as complete lines arrive. Only the handful
// of headers the gateway routes on are retained.

use bytes::{BufMut, Bytes, BytesMut};

/// Upper bound on a request line / header line we accept.
pub const MAX_LINE: usize = 2048;
/// Upper bound on a request body (API form posts only).
pub const MAX_BODY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpStatus {
    Ok200,
    BadRequest400,
    Unauthorized401,
    NotFound404,
    Internal500,
    NotImplemented501,
    Unavailable503,
}

impl HttpStatus {
    pub fn line(self) -> &'static str {
        match self {
            HttpStatus::Ok200 => "200 OK",
            HttpStatus::BadRequest400 => "400 Bad Request",
            HttpStatus::Unauthorized401 => "401 Unauthorized",
            HttpStatus::NotFound404 => "404 Not Found",
            HttpStatus::Internal500 => "500 Internal Server Error",
            HttpStatus::NotImplemented501 => "501 Not Implemented",
            HttpStatus::Unavailable503 => "503 Service Unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Mp2t,
    Html,
    M3u,
    Sse,
    Json,
}

impl ContentType {
    pub fn mime(self) -> &'static str {
        match self {
            ContentType::Mp2t => "video/mp2t",
            ContentType::Html => "text/html; charset=utf-8",
            ContentType::M3u => "audio/x-mpegurl",
            ContentType::Sse => "text/event-stream",
            ContentType::Json => "application/json",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    RequestLine,
    Headers,
    Body,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseResult {
    NeedMore,
    Complete,
    Error,
}

/// Parsed request, filled incrementally across reads.
#[derive(Debug, Default)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub hostname: String,
    pub user_agent: String,
    pub accept: String,
    pub is_http_11: bool,
    pub content_length: usize,
    pub body: Vec<u8>,
    state: Option<ParseState>,
}

impl HttpRequest {
    pub fn new() -> Self {
        HttpRequest {
            state: Some(ParseState::RequestLine),
            ..Default::default()
        }
    }

    fn state(&self) -> ParseState {
        self.state.unwrap_or(ParseState::RequestLine)
    }

    /// True once the request line has been consumed (the connection state
    /// machine advances ReadRequestLine -> ReadHeaders on this).
    pub fn past_request_line(&self) -> bool {
        !matches!(self.state(), ParseState::RequestLine)
    }

    /// Path component of the URL, without the query string.
    pub fn path(&self) -> &str {
        match self.url.find('?') {
            Some(i) => &self.url[..i],
            None => &self.url,
        }
    }

    /// Query string without the leading '?', if any.
    pub fn query(&self) -> Option<&str> {
        self.url.find('?').map(|i| &self.url[i + 1..])
    }
}

/// Incremental parse step. Consumes complete lines from `inbuf`; leftover
/// partial data stays for the next read.
pub fn parse_request(inbuf: &mut Vec<u8>, req: &mut HttpRequest) -> ParseResult {
    loop {
        match req.state() {
            ParseState::RequestLine | ParseState::Headers => {
                let Some(eol) = find_crlf(inbuf) else {
                    if inbuf.len() > MAX_LINE {
                        return ParseResult::Error;
                    }
                    return ParseResult::NeedMore;
                };
                let line: Vec<u8> = inbuf.drain(..eol + 2).take(eol).collect();
                let Ok(line) = std::str::from_utf8(&line) else {
                    return ParseResult::Error;
                };
                if req.state() == ParseState::RequestLine {
                    if !parse_request_line(line, req) {
                        return ParseResult::Error;
                    }
                    req.state = Some(ParseState::Headers);
                } else if line.is_empty() {
                    // End of headers.
                    if req.content_length > 0 {
                        if req.content_length > MAX_BODY {
                            return ParseResult::Error;
                        }
                        req.state = Some(ParseState::Body);
                    } else {
                        req.state = Some(ParseState::Complete);
                        return ParseResult::Complete;
                    }
                } else {
                    parse_header_line(line, req);
                }
            }
            ParseState::Body => {
                if inbuf.len() < req.content_length {
                    return ParseResult::NeedMore;
                }
                req.body = inbuf.drain(..req.content_length).collect();
                req.state = Some(ParseState::Complete);
                return ParseResult::Complete;
            }
            ParseState::Complete => return ParseResult::Complete,
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_request_line(line: &str, req: &mut HttpRequest) -> bool {
    let mut parts = line.split_whitespace();
    let (Some(method), Some(url), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    if !url.starts_with('/') || parts.next().is_some() {
        return false;
    }
    req.method = method.to_string();
    req.url = url.to_string();
    req.is_http_11 = version.eq_ignore_ascii_case("HTTP/1.1");
    true
}

fn parse_header_line(line: &str, req: &mut HttpRequest) {
    let Some((name, value)) = line.split_once(':') else {
        return;
    };
    let value = value.trim();
    if name.eq_ignore_ascii_case("Host") {
        req.hostname = value.to_string();
    } else if name.eq_ignore_ascii_case("User-Agent") {
        req.user_agent = value.to_string();
    } else if name.eq_ignore_ascii_case("Accept") {
        req.accept = value.to_string();
    } else if name.eq_ignore_ascii_case("Content-Length") {
        req.content_length = value.parse().unwrap_or(0);
    }
}

/// Assemble response headers. `extra` lines must be CRLF-terminated.
pub fn build_headers(status: HttpStatus, ctype: ContentType, extra: Option<&str>) -> Bytes {
    let mut out = BytesMut::with_capacity(256);
    out.put_slice(b"HTTP/1.1 ");
    out.put_slice(status.line().as_bytes());
    out.put_slice(b"\r\nServer: tsgate\r\nContent-Type: ");
    out.put_slice(ctype.mime().as_bytes());
    out.put_slice(b"\r\n");
    if ctype == ContentType::Sse {
        out.put_slice(b"Cache-Control: no-cache\r\n");
    }
    out.put_slice(b"Connection: close\r\n");
    if let Some(extra) = extra {
        out.put_slice(extra.as_bytes());
    }
    out.put_slice(b"\r\n");
    out.freeze()
}

/// Headers plus a minimal text body, for pre-stream error responses.
pub fn build_error_response(status: HttpStatus) -> Bytes {
    let body = status.line();
    let mut out = BytesMut::with_capacity(192);
    out.put_slice(b"HTTP/1.1 ");
    out.put_slice(body.as_bytes());
    out.put_slice(b"\r\nServer: tsgate\r\nContent-Type: text/plain\r\nContent-Length: ");
    out.put_slice(body.len().to_string().as_bytes());
    out.put_slice(b"\r\nConnection: close\r\n\r\n");
    out.put_slice(body.as_bytes());
    out.freeze()
}

/// Decode percent-encoded sequences. Returns `None` on malformed input.
pub fn url_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = hex_val(*bytes.get(i + 1)?)?;
                let lo = hex_val(*bytes.get(i + 2)?)?;
                out.push(hi << 4 | lo);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Percent-encode per RFC 3986; unreserved characters and '/' pass through.
pub fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Look up a parameter in a query or form-encoded string. Parameter names
/// compare case-insensitively; the raw (still-encoded) value is returned.
pub fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    for pair in query.split('&') {
        let (k, v) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        if k.eq_ignore_ascii_case(name) {
            return Some(v);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(req: &mut HttpRequest, data: &[u8]) -> (Vec<u8>, ParseResult) {
        let mut buf = data.to_vec();
        let res = parse_request(&mut buf, req);
        (buf, res)
    }

    #[test]
    fn test_parse_simple_get() {
        let mut req = HttpRequest::new();
        let (rest, res) = feed(
            &mut req,
            b"GET /ch1?a=b HTTP/1.1\r\nHost: gw.local\r\nUser-Agent: vlc/3.0\r\n\r\n",
        );
        assert_eq!(res, ParseResult::Complete);
        assert!(rest.is_empty());
        assert_eq!(req.method, "GET");
        assert_eq!(req.url, "/ch1?a=b");
        assert_eq!(req.path(), "/ch1");
        assert_eq!(req.query(), Some("a=b"));
        assert_eq!(req.hostname, "gw.local");
        assert_eq!(req.user_agent, "vlc/3.0");
        assert!(req.is_http_11);
    }

    #[test]
    fn test_parse_incremental() {
        let mut req = HttpRequest::new();
        let mut buf = b"GET /ch1 HT".to_vec();
        assert_eq!(parse_request(&mut buf, &mut req), ParseResult::NeedMore);
        assert!(!req.past_request_line());

        buf.extend_from_slice(b"TP/1.1\r\nHos");
        assert_eq!(parse_request(&mut buf, &mut req), ParseResult::NeedMore);
        assert!(req.past_request_line());

        buf.extend_from_slice(b"t: x\r\n\r\n");
        assert_eq!(parse_request(&mut buf, &mut req), ParseResult::Complete);
        assert_eq!(req.hostname, "x");
    }

    #[test]
    fn test_parse_post_body() {
        let mut req = HttpRequest::new();
        let (_, res) = feed(
            &mut req,
            b"POST /status/api/disconnect HTTP/1.1\r\nContent-Length: 12\r\n\r\nclient_id=42",
        );
        assert_eq!(res, ParseResult::Complete);
        assert_eq!(req.body, b"client_id=42");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let mut req = HttpRequest::new();
        let (_, res) = feed(&mut req, b"NONSENSE\r\n\r\n");
        assert_eq!(res, ParseResult::Error);

        let mut req = HttpRequest::new();
        let (_, res) = feed(&mut req, b"GET noslash HTTP/1.1\r\n\r\n");
        assert_eq!(res, ParseResult::Error);
    }

    #[test]
    fn test_parse_oversized_line_errors() {
        let mut req = HttpRequest::new();
        let line = vec![b'a'; MAX_LINE + 10];
        let mut buf = line;
        assert_eq!(parse_request(&mut buf, &mut req), ParseResult::Error);
    }

    #[test]
    fn test_build_headers_mp2t() {
        let h = build_headers(HttpStatus::Ok200, ContentType::Mp2t, None);
        let s = std::str::from_utf8(&h).unwrap();
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Type: video/mp2t\r\n"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_build_headers_sse_has_no_cache() {
        let h = build_headers(HttpStatus::Ok200, ContentType::Sse, None);
        let s = std::str::from_utf8(&h).unwrap();
        assert!(s.contains("text/event-stream"));
        assert!(s.contains("Cache-Control: no-cache"));
    }

    #[test]
    fn test_url_decode() {
        assert_eq!(url_decode("a%20b+c").as_deref(), Some("a b c"));
        assert_eq!(url_decode("%E4%B8%AD").as_deref(), Some("中"));
        assert!(url_decode("bad%zz").is_none());
        assert!(url_decode("trunc%2").is_none());
    }

    #[test]
    fn test_url_encode_roundtrip() {
        let original = "CCTV-1 综合/hd";
        let encoded = url_encode(original);
        assert!(!encoded.contains(' '));
        assert_eq!(url_decode(&encoded).as_deref(), Some(original));
    }

    #[test]
    fn test_query_param() {
        assert_eq!(query_param("a=1&B=2&c", "b"), Some("2"));
        assert_eq!(query_param("a=1&b=2", "missing"), None);
        assert_eq!(query_param("r2h-token=secret%21", "r2h-token"), Some("secret%21"));
        assert_eq!(query_param("flag", "flag"), Some(""));
    }
}
