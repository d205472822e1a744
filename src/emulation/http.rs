use std::sync::OnceLock;

use log::trace;
use regex::Regex;

use super::emulator::{Consumed, ProtocolEmulator};
use crate::configuration::types::ProtocolTag;
use crate::error_handling::types::SessionFault;
use crate::event::Summary;

/// Largest request head (request line plus headers) accepted.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

pub const DEFAULT_SERVER_HEADER: &str = "Apache/2.4.52 (Ubuntu)";

const REQUEST_LINE_PATTERN: &str = r"^([A-Z]{1,16}) (\S{1,2048}) (HTTP/\d\.\d)$";

const INDEX_PAGE: &str = "<!DOCTYPE html>\n<html><head><title>Welcome</title></head>\n\
<body><h1>It works!</h1><p>This is the default web page for this server.</p></body></html>\n";

static REQUEST_LINE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

fn request_line_regex() -> Result<&'static Regex, SessionFault> {
    REQUEST_LINE
        .get_or_init(|| Regex::new(REQUEST_LINE_PATTERN))
        .as_ref()
        .map_err(|e| SessionFault::malformed(format!("request line matcher unavailable: {}", e)))
}

/// Offset just past the blank line ending the request head.
fn head_end(buf: &[u8]) -> Option<usize> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4);
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Single-request HTTP/1.x server answering every request with a static page.
pub struct HttpEmulator {
    server: String,
    head: Vec<u8>,
    request: Option<Summary>,
}

impl HttpEmulator {
    /// `server` overrides the `Server` response header.
    pub fn new(server: Option<String>) -> Self {
        Self {
            server: server.unwrap_or_else(|| DEFAULT_SERVER_HEADER.to_string()),
            head: Vec::new(),
            request: None,
        }
    }

    fn parse_head(head: &[u8]) -> Result<Summary, SessionFault> {
        let text = String::from_utf8_lossy(head);
        let mut lines = text.lines();
        let request_line = lines.next().unwrap_or_default();

        let captures = request_line_regex()?
            .captures(request_line)
            .ok_or_else(|| SessionFault::malformed("invalid HTTP request line"))?;

        let mut summary = Summary::new()
            .with("request_line", request_line)
            .with("method", &captures[1])
            .with("path", &captures[2])
            .with("version", &captures[3]);

        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim();
            if name.eq_ignore_ascii_case("host") {
                summary.insert("host", value.trim());
            } else if name.eq_ignore_ascii_case("user-agent") {
                summary.insert("user_agent", value.trim());
            }
        }
        Ok(summary)
    }

    fn response(&self, method: Option<&str>) -> Vec<u8> {
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nServer: {}\r\nContent-Type: text/html; charset=UTF-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.server,
            INDEX_PAGE.len()
        );
        if method != Some("HEAD") {
            response.push_str(INDEX_PAGE);
        }
        response.into_bytes()
    }
}

impl ProtocolEmulator for HttpEmulator {
    fn protocol(&self) -> ProtocolTag {
        ProtocolTag::Http
    }

    fn consume(&mut self, bytes: &[u8]) -> Result<Consumed, SessionFault> {
        let mut out = Consumed::default();
        if self.request.is_some() {
            // a body or a pipelined request; the answer is already out
            return Ok(out);
        }

        self.head.extend_from_slice(bytes);
        let end = match head_end(&self.head) {
            Some(end) if end <= MAX_HEADER_BYTES => end,
            Some(_) => return Err(SessionFault::oversized("request head exceeds 8 KiB")),
            None if self.head.len() > MAX_HEADER_BYTES => {
                return Err(SessionFault::oversized("request head exceeds 8 KiB"));
            }
            None => return Ok(out),
        };

        let summary = Self::parse_head(&self.head[..end])?;
        trace!("HTTP request {:?}", summary.get("request_line"));
        out.respond(self.response(summary.get("method")));
        out.terminate();
        self.request = Some(summary);
        Ok(out)
    }

    fn summary(&self) -> Summary {
        if let Some(request) = &self.request {
            return request.clone();
        }
        let mut summary = Summary::new();
        if !self.head.is_empty() {
            let text = String::from_utf8_lossy(&self.head);
            summary.insert("partial_request", text.lines().next().unwrap_or_default());
        }
        summary
    }
}
