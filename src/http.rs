/**
 * Copyright (c) 2024-2025 ArcX, Inc.
 *
 * This file is part of ArcX Gateway
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Minimal HTTP/1.x request-line + header parser and response writer over
//! a raw `TcpStream`, per spec §4.7. This deliberately does not replicate
//! the teacher's full keepalive/offset/duplex machinery — HTTP/1.0-style
//! close-per-request is the documented default here and keep-alive is
//! best-effort.

use std::collections::HashMap;

use http::{HeaderMap, HeaderName, HeaderValue, Method, Version};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::error::ProxyError;

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 128;

#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: Method,
    pub raw_target: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ParsedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn is_keepalive_requested(&self) -> bool {
        match self.header("connection") {
            Some(v) => v.eq_ignore_ascii_case("keep-alive"),
            None => self.version == Version::HTTP_11,
        }
    }

    /// True when `raw_target` is absolute-form (`http://host/path`), the
    /// signature of forward-proxy traffic per spec §4.7.
    pub fn is_absolute_form(&self) -> bool {
        self.raw_target.starts_with("http://") || self.raw_target.starts_with("https://")
    }
}

/// Reads one HTTP/1.x request (request-line + headers + optional body)
/// from `stream`. Honors `Content-Length`; chunked *request* bodies are
/// not supported (forward-proxy traffic here is GET-shaped).
pub async fn read_request(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
) -> Result<ParsedRequest, ProxyError> {
    let mut header_bytes = Vec::new();
    let mut total = 0usize;
    loop {
        let mut line = Vec::new();
        let n = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| ProxyError::BadRequest(e.to_string()))?;
        if n == 0 {
            return Err(ProxyError::BadRequest("connection closed before headers".into()));
        }
        total += n;
        if total > MAX_HEADER_BYTES {
            return Err(ProxyError::BadRequest("headers too large".into()));
        }
        let is_blank = matches!(line.as_slice(), b"\r\n" | b"\n");
        header_bytes.extend_from_slice(&line);
        if is_blank {
            break;
        }
    }

    let header_text =
        std::str::from_utf8(&header_bytes).map_err(|e| ProxyError::BadRequest(e.to_string()))?;
    let mut lines = header_text.split("\r\n").filter(|l| !l.is_empty());

    let request_line = lines
        .next()
        .ok_or_else(|| ProxyError::BadRequest("missing request line".into()))?;
    let mut parts = request_line.split(' ');
    let method_str = parts
        .next()
        .ok_or_else(|| ProxyError::BadRequest("missing method".into()))?;
    let raw_target = parts
        .next()
        .ok_or_else(|| ProxyError::BadRequest("missing target".into()))?
        .to_string();
    let version_str = parts
        .next()
        .ok_or_else(|| ProxyError::BadRequest("missing version".into()))?;

    let method = Method::from_bytes(method_str.as_bytes())
        .map_err(|_| ProxyError::BadRequest(format!("invalid method {method_str:?}")))?;
    let version = match version_str.trim() {
        "HTTP/1.0" => Version::HTTP_10,
        "HTTP/1.1" => Version::HTTP_11,
        other => return Err(ProxyError::BadRequest(format!("unsupported version {other:?}"))),
    };

    let mut headers = HeaderMap::new();
    for line in lines {
        if headers.len() >= MAX_HEADERS {
            return Err(ProxyError::BadRequest("too many headers".into()));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::BadRequest(format!("malformed header line {line:?}")))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| ProxyError::BadRequest(format!("invalid header name {name:?}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| ProxyError::BadRequest(format!("invalid header value {value:?}")))?;
        headers.append(name, value);
    }

    let content_length = headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader
            .read_exact(&mut body)
            .await
            .map_err(|e| ProxyError::BadRequest(e.to_string()))?;
    }

    Ok(ParsedRequest {
        method,
        raw_target,
        version,
        headers,
        body,
    })
}

pub struct ResponseBuilder {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl ResponseBuilder {
    pub fn new(status: u16) -> Self {
        ResponseBuilder {
            status,
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn status_text(status: u16) -> &'static str {
        match status {
            200 => "OK",
            302 => "Found",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            500 => "Internal Server Error",
            502 => "Bad Gateway",
            504 => "Gateway Timeout",
            _ => "Unknown",
        }
    }

    pub fn head_bytes(&self, body_len: usize) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {} {}\r\n",
            self.status,
            Self::status_text(self.status)
        );
        let mut seen_content_length = false;
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("content-length") {
                seen_content_length = true;
            }
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        if !seen_content_length {
            out.push_str(&format!("Content-Length: {body_len}\r\n"));
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// Writes a full, non-streamed response (used for error pages and JSON
/// admin endpoints, where throttling does not apply).
pub async fn write_response(
    stream: &mut (impl AsyncWriteExt + Unpin),
    builder: ResponseBuilder,
    body: &[u8],
) -> std::io::Result<()> {
    let head = builder.head_bytes(body.len());
    stream.write_all(&head).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

/// Splits an owned `TcpStream` into a buffered reader half and a writer
/// half, mirroring the teacher's downstream/reader-writer split without
/// its keepalive bookkeeping.
pub fn split_stream(
    stream: TcpStream,
) -> (
    BufReader<tokio::net::tcp::OwnedReadHalf>,
    tokio::net::tcp::OwnedWriteHalf,
) {
    let (read_half, write_half) = stream.into_split();
    (BufReader::new(read_half), write_half)
}

pub fn parse_query_params(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| {
            (
                urlencoding_decode(k),
                urlencoding_decode(v),
            )
        })
        .collect()
}

fn urlencoding_decode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '+' => out.push(' '),
            '%' => {
                let hi = chars.next();
                let lo = chars.next();
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    if let Ok(byte) = u8::from_str_radix(&format!("{hi}{lo}"), 16) {
                        out.push(byte as char);
                        continue;
                    }
                }
                out.push('%');
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_builder_adds_content_length_when_absent() {
        let builder = ResponseBuilder::new(200).header("Content-Type", "text/plain");
        let head = String::from_utf8(builder.head_bytes(5)).unwrap();
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Length: 5\r\n"));
    }

    #[test]
    fn response_builder_respects_explicit_content_length() {
        let builder = ResponseBuilder::new(200).header("Content-Length", "0");
        let head = String::from_utf8(builder.head_bytes(5)).unwrap();
        assert_eq!(head.matches("Content-Length").count(), 1);
    }

    #[test]
    fn parse_query_params_decodes_percent_and_plus() {
        let params = parse_query_params("q=hello+world&tier=curated");
        assert_eq!(params.get("q").unwrap(), "hello world");
        assert_eq!(params.get("tier").unwrap(), "curated");
    }
}
