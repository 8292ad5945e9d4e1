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

//! TCP accept loop, HTTP parse, and dispatch between admin, forward-proxy,
//! and landing page, per spec §4.7.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admin::AdminSurface;
use crate::cache::{CachedResponse, Tier};
use crate::config::ConfigHandle;
use crate::domain::registrable_domain;
use crate::error::ProxyError;
use crate::http::{read_request, split_stream, ResponseBuilder};
use crate::throttle;
use crate::transform;
use crate::wayback::WaybackClient;

const READ_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Server {
    pub config: ConfigHandle,
    pub cache: Arc<crate::cache::CacheStore>,
    pub wayback: Arc<WaybackClient>,
    pub admin: Arc<AdminSurface>,
}

impl Server {
    /// Accepts connections until `shutdown` is cancelled, then stops
    /// accepting and allows in-flight responses a grace window before
    /// returning, per spec §5.
    pub async fn run(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        let mut in_flight = tokio::task::JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("server shutting down, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!(%addr, "accepted connection");
                            let this = Arc::clone(&self);
                            let conn_shutdown = shutdown.clone();
                            in_flight.spawn(async move {
                                if let Err(e) = this.handle_connection(stream, conn_shutdown).await {
                                    warn!(error = %e, "connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
            }
        }

        tokio::select! {
            _ = async { while in_flight.join_next().await.is_some() {} } => {}
            _ = tokio::time::sleep(SHUTDOWN_GRACE) => {
                warn!("shutdown grace window elapsed with connections still active");
            }
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        let (mut reader, mut writer) = split_stream(stream);

        let request = match tokio::time::timeout(READ_TIMEOUT, read_request(&mut reader)).await {
            Ok(Ok(req)) => req,
            Ok(Err(e)) => {
                let (builder, body) = error_response(ProxyError::BadRequest(e.to_string()));
                return crate::http::write_response(&mut writer, builder, &body).await;
            }
            Err(_) => {
                return Ok(());
            }
        };

        let cfg = self.config.load();
        let host_header = request.header("host").unwrap_or_default().to_string();
        let own_address = format!("{}:{}", cfg.host, cfg.port);

        // A child of the process-wide shutdown token: it's cancelled if the
        // whole server shuts down, but also independently the moment this
        // connection's own client goes away, so a mid-stream throttle sleep
        // aborts on either event instead of only on full-process shutdown.
        let conn_cancel = shutdown.child_token();
        let disconnect_watch = {
            let conn_cancel = conn_cancel.clone();
            tokio::spawn(async move {
                let mut probe = [0u8; 1];
                if reader.read(&mut probe).await.unwrap_or(0) == 0 {
                    conn_cancel.cancel();
                }
            })
        };

        let result = if request.raw_target.starts_with("/_admin/") && host_header == own_address {
            if !cfg.admin_enabled {
                let (builder, body) = error_response(ProxyError::NotFound);
                crate::http::write_response(&mut writer, builder, &body).await
            } else {
                self.handle_admin(&request, &mut writer).await
            }
        } else if request.is_absolute_form() {
            self.handle_forward_proxy(&request, &mut writer, &conn_cancel).await
        } else if (request.raw_target == "/" || request.raw_target.is_empty()) && cfg.landing_page_enabled {
            let body = b"<html><body><h1>Wayback Cache Proxy</h1><p>Configure your browser to use this host as an HTTP proxy.</p></body></html>".to_vec();
            let builder = ResponseBuilder::new(200).header("Content-Type", "text/html");
            crate::http::write_response(&mut writer, builder, &body).await
        } else {
            let (builder, body) = error_response(ProxyError::BadRequest(
                "request-URI must be absolute-form for forward proxying".to_string(),
            ));
            crate::http::write_response(&mut writer, builder, &body).await
        };

        disconnect_watch.abort();
        result
    }

    async fn handle_admin(
        &self,
        request: &crate::http::ParsedRequest,
        writer: &mut (impl tokio::io::AsyncWriteExt + Unpin),
    ) -> std::io::Result<()> {
        if let Some((builder, body)) = self.admin.check_auth(request.header("authorization")) {
            return crate::http::write_response(writer, builder, &body).await;
        }

        let (path, query) = match request.raw_target.split_once('?') {
            Some((p, q)) => (p, q),
            None => (request.raw_target.as_str(), ""),
        };
        let (builder, body) = self
            .admin
            .dispatch(&request.method, path, query, &request.body)
            .await;
        crate::http::write_response(writer, builder, &body).await
    }

    async fn handle_forward_proxy(
        &self,
        request: &crate::http::ParsedRequest,
        writer: &mut (impl tokio::io::AsyncWriteExt + Unpin),
        shutdown: &CancellationToken,
    ) -> std::io::Result<()> {
        let cfg = self.config.load();

        let normalized = match crate::wayback::normalize_url(&request.raw_target) {
            Ok(url) => url,
            Err(e) => {
                let (builder, body) = error_response(ProxyError::BadRequest(e.to_string()));
                return crate::http::write_response(writer, builder, &body).await;
            }
        };
        let normalized_str = normalized.to_string();

        if cfg.access_mode == crate::config::AccessMode::Allowlist
            && !self.cache.allowlist_check(&cfg.allowlist, &normalized_str)
        {
            let (builder, body) = error_response(ProxyError::AllowlistDenied);
            return crate::http::write_response(writer, builder, &body).await;
        }

        let (cached, tier) = self.cache.get(&normalized_str);
        let (resp, cache_header) = match (cached, tier) {
            (Some(resp), Some(Tier::Curated)) => (resp, "hit-curated"),
            (Some(resp), Some(Tier::Hot)) => (resp, "hit-hot"),
            _ => match self.fetch_and_store(&normalized_str, &cfg).await {
                Ok(resp) => (resp, "miss"),
                Err(e) => {
                    let (builder, body) = error_response(e);
                    return crate::http::write_response(writer, builder, &body).await;
                }
            },
        };

        let domain = registrable_domain(&normalized);
        self.cache.track_view(&domain);

        self.stream_response(writer, &cfg, &resp, cache_header, request, shutdown)
            .await
    }

    async fn fetch_and_store(
        &self,
        normalized_url: &str,
        cfg: &crate::config::Config,
    ) -> Result<CachedResponse, ProxyError> {
        let resp = self
            .wayback
            .fetch_snapshot(normalized_url, &cfg.target_date)
            .await?;
        let transformed_body = transform::transform(cfg, &resp.content_type, &resp.body, &resp.archive_date);
        let mut stored = resp;
        stored.body = transformed_body;
        self.cache.put_hot(normalized_url, &stored);
        Ok(stored)
    }

    async fn stream_response(
        &self,
        writer: &mut (impl tokio::io::AsyncWriteExt + Unpin),
        cfg: &crate::config::Config,
        resp: &CachedResponse,
        cache_header: &str,
        request: &crate::http::ParsedRequest,
        shutdown: &CancellationToken,
    ) -> std::io::Result<()> {
        let mut body = resp.body.clone();
        if cfg.header_bar_enabled && transform::is_html(&resp.content_type) {
            if let Ok(html) = String::from_utf8(body.clone()) {
                let fragment = throttle::header_bar_fragment(
                    &resp.source_url,
                    &resp.archive_date,
                    &cfg.header_bar_text,
                    cfg.speed_selector,
                );
                body = throttle::inject_header_bar(&html, &fragment).into_bytes();
            }
        }

        let cookie_speed = request
            .header("cookie")
            .and_then(|c| extract_cookie(c, "wayback_speed"));
        let speed_name = throttle::effective_speed(&cfg.throttle_speed, cfg.speed_selector, cookie_speed.as_deref());
        let rate = throttle::speed_bytes_per_second(speed_name);

        let mut builder = ResponseBuilder::new(resp.status_code)
            .header("Server", "WaybackCacheProxy")
            .header("X-Archive-Date", &resp.archive_date)
            .header("X-Cache", cache_header)
            .header("Content-Type", &resp.content_type)
            .header("Content-Length", body.len().to_string());
        for (name, value) in &resp.headers {
            if name.eq_ignore_ascii_case("content-type") || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            builder = builder.header(name.clone(), value.clone());
        }

        let head = builder.head_bytes(body.len());
        tokio::io::AsyncWriteExt::write_all(writer, &head).await?;
        let cancel = shutdown.clone();
        throttle::throttled_write(writer, &body, rate, &cancel).await
    }
}

fn extract_cookie(cookie_header: &str, name: &str) -> Option<String> {
    cookie_header.split(';').find_map(|part| {
        let part = part.trim();
        part.strip_prefix(&format!("{name}="))
            .map(|v| v.to_string())
    })
}

fn error_response(err: ProxyError) -> (ResponseBuilder, Vec<u8>) {
    let status = err.status_code();
    if status >= 500 {
        error!(error = %err, status, "upstream error");
    } else {
        info!(error = %err, status, "request rejected");
    }
    let mut builder = ResponseBuilder::new(status).header("Content-Type", "text/html");
    if matches!(err, ProxyError::AdminUnauthorized) {
        builder = builder.header("WWW-Authenticate", "Basic realm=\"admin\"");
    }
    let body = format!(
        "<html><body><h1>{status}</h1><p>{}</p></body></html>",
        html_escape(&err.to_string())
    )
    .into_bytes();
    (builder, body)
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_cookie_finds_named_value_among_others() {
        let header = "a=1; wayback_speed=56k; b=2";
        assert_eq!(extract_cookie(header, "wayback_speed"), Some("56k".to_string()));
    }

    #[test]
    fn extract_cookie_returns_none_when_absent() {
        let header = "a=1; b=2";
        assert_eq!(extract_cookie(header, "wayback_speed"), None);
    }

    #[test]
    fn error_response_maps_status_codes() {
        let (builder, _) = error_response(ProxyError::AllowlistDenied);
        assert_eq!(builder.status, 403);
        let (builder, _) = error_response(ProxyError::NotArchived);
        assert_eq!(builder.status, 404);
    }
}
