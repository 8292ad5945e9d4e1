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

use thiserror::Error;

/// Errors surfaced by the cache store. A store outage degrades the proxy,
/// it never crashes the request path.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),
    #[error("cache entry could not be decoded: {0}")]
    Corrupt(String),
}

/// Errors from the Wayback Machine client, per spec §4.2.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("url is not archived")]
    NotArchived,
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    #[error("upstream request timed out")]
    Timeout,
    #[error("too many redirects")]
    TooManyRedirects,
    #[error("redirect loop detected")]
    LoopDetected,
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

/// Errors surfaced while rewriting archived bytes.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("body is not valid utf-8: {0}")]
    InvalidEncoding(#[from] std::str::Utf8Error),
}

/// Top-level error kind used by the request pipeline to pick a status code
/// and a themed error page, per spec §7.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("allowlist denied")]
    AllowlistDenied,
    #[error("not archived")]
    NotArchived,
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("upstream timeout")]
    UpstreamTimeout,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("admin unauthorized")]
    AdminUnauthorized,
    #[error("not found")]
    NotFound,
}

impl ProxyError {
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::AllowlistDenied => 403,
            ProxyError::NotArchived => 404,
            ProxyError::NotFound => 404,
            ProxyError::UpstreamUnavailable(_) => 502,
            ProxyError::UpstreamTimeout => 504,
            ProxyError::AdminUnauthorized => 401,
            ProxyError::BadRequest(_) => 400,
        }
    }
}

impl From<UpstreamError> for ProxyError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::NotArchived => ProxyError::NotArchived,
            UpstreamError::Timeout => ProxyError::UpstreamTimeout,
            UpstreamError::TooManyRedirects | UpstreamError::LoopDetected => {
                ProxyError::UpstreamUnavailable(err.to_string())
            }
            UpstreamError::Unavailable(msg) => ProxyError::UpstreamUnavailable(msg),
            UpstreamError::InvalidUrl(msg) => ProxyError::BadRequest(msg),
        }
    }
}

/// Fatal startup errors (bind failure, config parse) exit the process with
/// code 1, per spec §6.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid --date value {0:?}, expected YYYYMMDD")]
    InvalidDate(String),
}
