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

use std::collections::HashSet;
use std::time::Duration;

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CachedResponse;
use crate::error::UpstreamError;

const MAX_REDIRECTS: u32 = 10;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

static HOP_BY_HOP_HEADERS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "connection",
        "keep-alive",
        "transfer-encoding",
        "te",
        "trailer",
        "upgrade",
        "proxy-authenticate",
        "proxy-authorization",
    ]
    .into_iter()
    .collect()
});

/// Lowercases scheme/host, strips default ports, preserves path/query/
/// fragment and trailing-slash, per spec §4.2 step 1. Idempotent and
/// cache-key-stable: `normalize(normalize(u)) == normalize(u)`.
pub fn normalize_url(raw: &str) -> Result<Url, UpstreamError> {
    let mut url = Url::parse(raw).map_err(|e| UpstreamError::InvalidUrl(e.to_string()))?;

    let scheme = url.scheme().to_ascii_lowercase();
    url.set_scheme(&scheme)
        .map_err(|_| UpstreamError::InvalidUrl(raw.to_string()))?;

    if let Some(host) = url.host_str() {
        let lower = host.to_ascii_lowercase();
        url.set_host(Some(&lower))
            .map_err(|e| UpstreamError::InvalidUrl(e.to_string()))?;
    }

    let is_default_port = matches!(
        (url.scheme(), url.port()),
        ("http", Some(80)) | ("https", Some(443))
    );
    if is_default_port {
        let _ = url.set_port(None);
    }

    Ok(url)
}

fn sniff_content_type(body: &[u8]) -> String {
    let prefix = String::from_utf8_lossy(&body[..body.len().min(512)]).to_ascii_lowercase();
    if prefix.trim_start().starts_with("<!doctype html") || prefix.contains("<html") {
        "text/html".to_string()
    } else if prefix.starts_with("{") || prefix.starts_with("[") {
        "application/json".to_string()
    } else {
        "application/octet-stream".to_string()
    }
}

/// Parses an archive-internal `Location` of the form `/web/{date}{mod}/{url}`.
/// Returns `None` for anything that isn't this exact shape (including
/// redirects to the live web, which the caller treats as terminal).
fn parse_archive_location(location: &str) -> Option<(String, String)> {
    let rest = location.strip_prefix("/web/")?;
    let (segment, url_part) = rest.split_once('/')?;
    let date: String = segment.chars().take_while(|c| c.is_ascii_digit()).collect();
    if date.len() != 14 && date.len() != 8 {
        return None;
    }
    Some((date, url_part.to_string()))
}

const DEFAULT_BASE_URL: &str = "https://web.archive.org";

pub struct WaybackClient {
    http: reqwest::Client,
    user_agent: String,
    tolerance_days: i64,
    base_url: String,
}

impl WaybackClient {
    pub fn new(user_agent: impl Into<String>, tolerance_days: i64) -> Self {
        Self::new_with_base_url(user_agent, tolerance_days, DEFAULT_BASE_URL)
    }

    /// Like `new`, but against an arbitrary base instead of the real
    /// archive, so tests can point this at a mock server.
    pub fn new_with_base_url(
        user_agent: impl Into<String>,
        tolerance_days: i64,
        base_url: impl Into<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .expect("reqwest client builds with static config");
        WaybackClient {
            http,
            user_agent: user_agent.into(),
            tolerance_days,
            base_url: base_url.into(),
        }
    }

    fn archive_url(&self, date: &str, url: &str) -> String {
        format!("{}/web/{date}id_/{url}", self.base_url)
    }

    /// Fetches the closest archived snapshot for `(url, date)`, following
    /// the archive's own redirect chain, per spec §4.2.
    pub async fn fetch_snapshot(
        &self,
        url: &str,
        date: &str,
    ) -> Result<CachedResponse, UpstreamError> {
        let normalized = normalize_url(url)?;
        let normalized_str = normalized.to_string();

        let mut current_date = date.to_string();
        let mut current_url = normalized_str.clone();
        let mut visited: HashSet<(String, String)> = HashSet::new();
        let mut redirects_followed: u32 = 0;

        loop {
            if !visited.insert((current_date.clone(), current_url.clone())) {
                return Err(UpstreamError::LoopDetected);
            }

            let archive_url = self.archive_url(&current_date, &current_url);
            debug!(archive_url, redirects_followed, "fetching wayback snapshot");

            let response = self
                .http
                .get(&archive_url)
                .header("User-Agent", &self.user_agent)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        UpstreamError::Timeout
                    } else {
                        UpstreamError::Unavailable(e.to_string())
                    }
                })?;

            let status = response.status();

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| UpstreamError::Unavailable("redirect missing Location".into()))?
                    .to_string();

                match parse_archive_location(&location) {
                    Some((next_date, next_url)) => {
                        if redirects_followed >= MAX_REDIRECTS {
                            return Err(UpstreamError::TooManyRedirects);
                        }
                        redirects_followed += 1;
                        current_date = next_date;
                        current_url = next_url;
                        continue;
                    }
                    None => {
                        info!(url = %normalized_str, "archive redirected to live web, no snapshot");
                        return Err(UpstreamError::NotArchived);
                    }
                }
            }

            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(UpstreamError::NotArchived);
            }

            if status.is_server_error() {
                return Err(UpstreamError::Unavailable(format!("upstream status {status}")));
            }

            if !status.is_success() {
                return Err(UpstreamError::Unavailable(format!("upstream status {status}")));
            }

            let mut headers = Vec::new();
            let mut content_type = None;
            for (name, value) in response.headers().iter() {
                let lower = name.as_str().to_ascii_lowercase();
                if HOP_BY_HOP_HEADERS.contains(lower.as_str()) {
                    continue;
                }
                let value_str = value.to_str().unwrap_or_default().to_string();
                if lower == "content-type" {
                    content_type = Some(value_str.clone());
                }
                headers.push((name.as_str().to_string(), value_str));
            }

            let body = response
                .bytes()
                .await
                .map_err(|e| UpstreamError::Unavailable(e.to_string()))?
                .to_vec();

            let content_type = content_type.unwrap_or_else(|| sniff_content_type(&body));

            let served_date = normalize_served_date(&current_date);
            if date_distance_days(date, &served_date) > self.tolerance_days {
                warn!(
                    requested = date,
                    served = served_date,
                    "served snapshot outside date tolerance, accepting closest match"
                );
            }

            return Ok(CachedResponse {
                status_code: status.as_u16(),
                headers,
                body,
                content_type,
                stored_at: chrono::Utc::now().timestamp(),
                source_url: normalized_str,
                archive_date: served_date,
            });
        }
    }
}

/// The archive's timestamp segment is `YYYYMMDDhhmmss`; we only track the
/// date portion.
fn normalize_served_date(segment: &str) -> String {
    segment.chars().take(8).collect()
}

fn date_distance_days(requested: &str, served: &str) -> i64 {
    let parse = |s: &str| NaiveDate::parse_from_str(s, "%Y%m%d").ok();
    match (parse(requested), parse(served)) {
        (Some(a), Some(b)) => (b - a).num_days().abs(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_lowercases_scheme_and_host() {
        let url = normalize_url("HTTP://Example.COM/Path").unwrap();
        assert_eq!(url.scheme(), "http");
        assert_eq!(url.host_str(), Some("example.com"));
        assert_eq!(url.path(), "/Path");
    }

    #[test]
    fn normalize_strips_default_ports() {
        let url = normalize_url("http://example.com:80/").unwrap();
        assert_eq!(url.port(), None);
        let url = normalize_url("https://example.com:443/").unwrap();
        assert_eq!(url.port(), None);
    }

    #[test]
    fn normalize_keeps_nondefault_ports() {
        let url = normalize_url("http://example.com:8080/").unwrap();
        assert_eq!(url.port(), Some(8080));
    }

    #[test]
    fn normalize_is_idempotent_and_cache_key_stable() {
        let once = normalize_url("HTTP://Example.com:80/Path?q=1").unwrap();
        let twice = normalize_url(once.as_str()).unwrap();
        assert_eq!(once.as_str(), twice.as_str());
        assert_eq!(
            crate::cache::url_hash(once.as_str()),
            crate::cache::url_hash(twice.as_str())
        );
    }

    #[test]
    fn preserves_trailing_slash_distinction() {
        let with_slash = normalize_url("http://example.com/a/").unwrap();
        let without_slash = normalize_url("http://example.com/a").unwrap();
        assert_ne!(with_slash.as_str(), without_slash.as_str());
    }

    #[test]
    fn parse_archive_location_recognizes_archive_internal_redirect() {
        let parsed = parse_archive_location("/web/20010915123456/http://example.com/");
        assert_eq!(
            parsed,
            Some(("20010915123456".to_string(), "http://example.com/".to_string()))
        );
    }

    #[test]
    fn parse_archive_location_rejects_live_web_redirect() {
        assert_eq!(parse_archive_location("http://example.com/"), None);
    }

    #[test]
    fn date_distance_computes_absolute_day_difference() {
        assert_eq!(date_distance_days("20010101", "20010111"), 10);
        assert_eq!(date_distance_days("20010111", "20010101"), 10);
    }

    #[test]
    fn sniff_content_type_detects_html_prefix() {
        assert_eq!(sniff_content_type(b"<!DOCTYPE html><html>"), "text/html");
        assert_eq!(sniff_content_type(b"{\"a\":1}"), "application/json");
        assert_eq!(sniff_content_type(b"\x89PNG\r\n"), "application/octet-stream");
    }
}
