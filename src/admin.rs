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

//! Admin surface mounted under `/_admin/`, per spec §4.6. Generalizes the
//! teacher's `AuthProvider::basic_key` "returns true if the request should
//! stop" shape to HTTP Basic instead of Bearer.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use tracing::warn;

use crate::cache::CacheStore;
use crate::config::ConfigHandle;
use crate::crawler::Crawler;
use crate::http::{parse_query_params, ResponseBuilder};

pub struct AdminSurface {
    pub cache: Arc<CacheStore>,
    pub crawler: Arc<Crawler>,
    pub config: ConfigHandle,
}

#[derive(Serialize)]
struct JsonError {
    status_code: u16,
    message: String,
}

fn json_response(status: u16, body: impl Serialize) -> (ResponseBuilder, Vec<u8>) {
    let bytes = serde_json::to_vec(&body).unwrap_or_default();
    (
        ResponseBuilder::new(status).header("Content-Type", "application/json"),
        bytes,
    )
}

impl AdminSurface {
    /// Returns `true` ("stop the request, a response has already been
    /// written") when auth fails, mirroring the teacher's
    /// `AuthProvider::basic_key`. The caller writes `response.1` with
    /// `response.0` when this returns `Some`.
    pub fn check_auth(&self, authorization_header: Option<&str>) -> Option<(ResponseBuilder, Vec<u8>)> {
        let cfg = self.config.load();
        let Some(configured_password) = &cfg.admin_password else {
            warn!("admin surface has no password configured, refusing to serve");
            return Some(json_response(
                401,
                JsonError {
                    status_code: 401,
                    message: "admin surface not configured".to_string(),
                },
            ));
        };

        let unauthorized = || {
            Some((
                ResponseBuilder::new(401).header("WWW-Authenticate", "Basic realm=\"admin\""),
                serde_json::to_vec(&JsonError {
                    status_code: 401,
                    message: "unauthorized".to_string(),
                })
                .unwrap_or_default(),
            ))
        };

        let Some(header) = authorization_header else {
            return unauthorized();
        };
        let Some(encoded) = header.strip_prefix("Basic ") else {
            return unauthorized();
        };
        let Ok(decoded) = BASE64.decode(encoded.trim()) else {
            return unauthorized();
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return unauthorized();
        };
        let Some((_user, password)) = decoded.split_once(':') else {
            return unauthorized();
        };
        if password != configured_password {
            return unauthorized();
        }
        None
    }

    pub async fn dispatch(
        &self,
        method: &http::Method,
        path: &str,
        query: &str,
        body: &[u8],
    ) -> (ResponseBuilder, Vec<u8>) {
        match (method.as_str(), path) {
            ("GET", "/_admin/") | ("GET", "/_admin") => self.render_dashboard(),
            ("POST", "/_admin/seeds") => self.handle_seeds(body),
            ("POST", "/_admin/crawl/start") => self.handle_crawl_start(body),
            ("POST", "/_admin/crawl/stop") => self.handle_crawl_stop(),
            ("POST", "/_admin/crawl/recrawl") => self.handle_crawl_recrawl(body),
            ("GET", "/_admin/cache") => self.handle_cache_list(query),
            ("POST", "/_admin/cache/delete") => self.handle_cache_delete(body),
            ("POST", "/_admin/cache/clear") => self.handle_cache_clear(body),
            ("GET", "/_admin/log") => self.handle_log(query),
            ("GET", "/_admin/status.json") => self.handle_status_json(),
            _ => (ResponseBuilder::new(404), b"not found".to_vec()),
        }
    }

    fn render_dashboard(&self) -> (ResponseBuilder, Vec<u8>) {
        let status = self.crawler.status();
        let stats = self.cache.stats();
        let html = format!(
            r#"<html><head><title>Wayback Cache Proxy Admin</title></head><body>
<h1>Wayback Cache Proxy</h1>
<p>Crawl state: {:?}</p>
<p>URLs seen: {} fetched: {} failed: {}</p>
<p>Curated entries: {} Hot entries: {}</p>
</body></html>"#,
            status.state, status.urls_seen, status.urls_fetched, status.urls_failed,
            stats.curated_count, stats.hot_count,
        );
        (
            ResponseBuilder::new(200).header("Content-Type", "text/html"),
            html.into_bytes(),
        )
    }

    fn handle_seeds(&self, body: &[u8]) -> (ResponseBuilder, Vec<u8>) {
        #[derive(serde::Deserialize)]
        struct SeedRequest {
            url: String,
            depth: Option<usize>,
            remove: Option<bool>,
        }
        let Ok(req): Result<SeedRequest, _> = serde_json::from_slice(body) else {
            return json_response(400, JsonError { status_code: 400, message: "invalid seed body".into() });
        };
        if req.remove.unwrap_or(false) {
            self.crawler.remove_seed(&req.url);
        } else {
            self.crawler.add_seed(req.url, req.depth.unwrap_or(0));
        }
        json_response(200, serde_json::json!({ "ok": true }))
    }

    fn handle_crawl_start(&self, body: &[u8]) -> (ResponseBuilder, Vec<u8>) {
        #[derive(serde::Deserialize, Default)]
        struct StartRequest {
            depth: Option<usize>,
        }
        let req: StartRequest = serde_json::from_slice(body).unwrap_or_default();
        self.crawler.start(req.depth);
        json_response(200, serde_json::json!({ "ok": true }))
    }

    fn handle_crawl_stop(&self) -> (ResponseBuilder, Vec<u8>) {
        self.crawler.stop();
        json_response(200, serde_json::json!({ "ok": true }))
    }

    fn handle_crawl_recrawl(&self, body: &[u8]) -> (ResponseBuilder, Vec<u8>) {
        #[derive(serde::Deserialize, Default)]
        struct RecrawlRequest {
            depth: Option<usize>,
        }
        let req: RecrawlRequest = serde_json::from_slice(body).unwrap_or_default();
        self.crawler.recrawl(req.depth);
        json_response(200, serde_json::json!({ "ok": true }))
    }

    /// Paginated, searchable per-tier listing, per spec §4.6.
    fn handle_cache_list(&self, query: &str) -> (ResponseBuilder, Vec<u8>) {
        let params = parse_query_params(query);
        let tier_name = params.get("tier").map(String::as_str).unwrap_or("curated");
        let Some(tier) = parse_tier(tier_name) else {
            return json_response(400, JsonError { status_code: 400, message: "invalid tier".into() });
        };
        let page: usize = params.get("page").and_then(|p| p.parse().ok()).unwrap_or(0);
        let per_page: usize = params.get("per_page").and_then(|p| p.parse().ok()).unwrap_or(50).max(1);
        let search = params.get("q").map(String::as_str).unwrap_or("");

        let mut entries = self.cache.list_tier(tier);
        if !search.is_empty() {
            entries.retain(|e| e.source_url.contains(search));
        }
        let total = entries.len();
        let summaries: Vec<String> = entries
            .iter()
            .map(|e| format!("{} ({})", e.source_url, e.archive_date))
            .collect();
        let page_entries = crate::cache::paginate_keys(&summaries, page, per_page);
        let stats = self.cache.stats();

        json_response(
            200,
            serde_json::json!({
                "tier": tier_name,
                "page": page,
                "per_page": per_page,
                "total": total,
                "entries": page_entries,
                "curated_count": stats.curated_count,
                "hot_count": stats.hot_count,
            }),
        )
    }

    fn handle_cache_delete(&self, body: &[u8]) -> (ResponseBuilder, Vec<u8>) {
        #[derive(serde::Deserialize)]
        struct DeleteRequest {
            url: String,
            tier: String,
        }
        let Ok(req): Result<DeleteRequest, _> = serde_json::from_slice(body) else {
            return json_response(400, JsonError { status_code: 400, message: "invalid delete body".into() });
        };
        let Some(tier) = parse_tier(&req.tier) else {
            return json_response(400, JsonError { status_code: 400, message: "invalid tier".into() });
        };
        self.cache.delete(&req.url, tier);
        json_response(200, serde_json::json!({ "ok": true }))
    }

    fn handle_cache_clear(&self, body: &[u8]) -> (ResponseBuilder, Vec<u8>) {
        #[derive(serde::Deserialize)]
        struct ClearRequest {
            tier: String,
        }
        let Ok(req): Result<ClearRequest, _> = serde_json::from_slice(body) else {
            return json_response(400, JsonError { status_code: 400, message: "invalid clear body".into() });
        };
        let Some(tier) = parse_tier(&req.tier) else {
            return json_response(400, JsonError { status_code: 400, message: "invalid tier".into() });
        };
        self.cache.clear(tier);
        json_response(200, serde_json::json!({ "ok": true }))
    }

    fn handle_log(&self, query: &str) -> (ResponseBuilder, Vec<u8>) {
        let params = parse_query_params(query);
        let n: usize = params.get("n").and_then(|v| v.parse().ok()).unwrap_or(50);
        let lines = self.crawler.log(n);
        json_response(200, serde_json::json!({ "lines": lines }))
    }

    fn handle_status_json(&self) -> (ResponseBuilder, Vec<u8>) {
        let status = self.crawler.status();
        json_response(
            200,
            serde_json::json!({
                "state": format!("{:?}", status.state),
                "started_at": status.started_at,
                "urls_seen": status.urls_seen,
                "urls_fetched": status.urls_fetched,
                "urls_failed": status.urls_failed,
                "current_depth": status.current_depth,
                "current_url": status.current_url,
            }),
        )
    }
}

fn parse_tier(s: &str) -> Option<crate::cache::Tier> {
    match s {
        "curated" => Some(crate::cache::Tier::Curated),
        "hot" => Some(crate::cache::Tier::Hot),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::config::Config;
    use crate::wayback::WaybackClient;

    fn make_admin(password: Option<&str>) -> AdminSurface {
        let mut cfg = Config::default();
        cfg.admin_password = password.map(String::from);
        let config = ConfigHandle::new(cfg);
        let cache = Arc::new(CacheStore::new("redis://127.0.0.1:6379", 7).unwrap());
        let wayback = Arc::new(WaybackClient::new("test-agent", 365));
        let crawler = Arc::new(Crawler::new(Arc::clone(&cache), wayback, config.clone()));
        AdminSurface { cache, crawler, config }
    }

    #[test]
    fn refuses_to_serve_when_no_password_configured() {
        let admin = make_admin(None);
        let result = admin.check_auth(Some("Basic dXNlcjpwYXNz"));
        assert!(result.is_some());
        assert_eq!(result.unwrap().0.status, 401);
    }

    #[test]
    fn rejects_missing_authorization_header() {
        let admin = make_admin(Some("secret"));
        let result = admin.check_auth(None);
        assert!(result.is_some());
    }

    #[test]
    fn rejects_wrong_password() {
        let admin = make_admin(Some("secret"));
        let encoded = BASE64.encode("user:wrong");
        let header = format!("Basic {encoded}");
        let result = admin.check_auth(Some(&header));
        assert!(result.is_some());
    }

    #[test]
    fn accepts_correct_password_any_username() {
        let admin = make_admin(Some("secret"));
        let encoded = BASE64.encode("anyone:secret");
        let header = format!("Basic {encoded}");
        let result = admin.check_auth(Some(&header));
        assert!(result.is_none());
    }
}
