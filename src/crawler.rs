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

//! Breadth-first, depth-bounded prefetch crawler, per spec §4.5. A single
//! instance runs as a background task; `start`/`stop`/`recrawl` are
//! fire-and-forget control points, `status`/`log` read a live snapshot.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::config::ConfigHandle;
use crate::transform;
use crate::wayback::WaybackClient;

const DEFAULT_WORKERS: usize = 4;
const LOG_RING_CAPACITY: usize = 200;
const MAX_BACKOFF_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlState {
    Idle,
    Running,
    Stopping,
}

#[derive(Debug, Clone)]
pub struct CrawlStatus {
    pub state: CrawlState,
    pub started_at: Option<i64>,
    pub urls_seen: u64,
    pub urls_fetched: u64,
    pub urls_failed: u64,
    pub current_depth: usize,
    pub current_url: Option<String>,
}

impl Default for CrawlStatus {
    fn default() -> Self {
        CrawlStatus {
            state: CrawlState::Idle,
            started_at: None,
            urls_seen: 0,
            urls_fetched: 0,
            urls_failed: 0,
            current_depth: 0,
            current_url: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrawlSeed {
    pub url: String,
    pub depth: usize,
}

struct Frontier {
    queue: VecDeque<(String, usize)>,
    seen: HashSet<String>,
}

/// Fixed-capacity ring of human-readable log lines, oldest evicted on
/// overflow, per spec §3.
struct LogRing {
    lines: VecDeque<String>,
}

impl LogRing {
    fn new() -> Self {
        LogRing {
            lines: VecDeque::with_capacity(LOG_RING_CAPACITY),
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == LOG_RING_CAPACITY {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn tail(&self, n: usize) -> Vec<String> {
        self.lines.iter().rev().take(n).rev().cloned().collect()
    }
}

struct CrawlerState {
    status: std::sync::Mutex<CrawlStatus>,
    log: std::sync::Mutex<LogRing>,
    seeds: std::sync::Mutex<Vec<CrawlSeed>>,
    stopping: std::sync::atomic::AtomicBool,
    generation: AtomicU64,
}

/// Single-instance background prefetch worker. Clone-cheap (`Arc` inside);
/// the crawler itself is shared across the admin surface and the request
/// pipeline via `Arc<Crawler>`.
pub struct Crawler {
    state: Arc<CrawlerState>,
    cache: Arc<CacheStore>,
    wayback: Arc<WaybackClient>,
    config: ConfigHandle,
    workers: usize,
}

impl Crawler {
    pub fn new(
        cache: Arc<CacheStore>,
        wayback: Arc<WaybackClient>,
        config: ConfigHandle,
    ) -> Self {
        Crawler {
            state: Arc::new(CrawlerState {
                status: std::sync::Mutex::new(CrawlStatus::default()),
                log: std::sync::Mutex::new(LogRing::new()),
                seeds: std::sync::Mutex::new(Vec::new()),
                stopping: std::sync::atomic::AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
            cache,
            wayback,
            config,
            workers: DEFAULT_WORKERS,
        }
    }

    pub fn add_seed(&self, url: String, depth: usize) {
        self.state.seeds.lock().unwrap().push(CrawlSeed { url, depth });
    }

    pub fn remove_seed(&self, url: &str) {
        self.state.seeds.lock().unwrap().retain(|s| s.url != url);
    }

    pub fn status(&self) -> CrawlStatus {
        self.state.status.lock().unwrap().clone()
    }

    pub fn log(&self, tail_n: usize) -> Vec<String> {
        self.state.log.lock().unwrap().tail(tail_n)
    }

    /// Starts a crawl if one is not already running. Spawns the worker
    /// pool as a background task and returns immediately, per spec §4.6's
    /// requirement that long operations return without blocking the admin
    /// request.
    pub fn start(self: &Arc<Self>, depth_override: Option<usize>) {
        {
            let mut status = self.state.status.lock().unwrap();
            if status.state != CrawlState::Idle {
                return;
            }
            *status = CrawlStatus {
                state: CrawlState::Running,
                started_at: Some(chrono::Utc::now().timestamp()),
                ..CrawlStatus::default()
            };
        }
        self.state.stopping.store(false, Ordering::SeqCst);
        let generation = self.state.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run(depth_override, generation).await;
        });
    }

    /// Transitions state to `stopping`. Workers observe the flag between
    /// fetches; in-flight fetches complete, no new URL is dequeued.
    pub fn stop(&self) {
        self.state.stopping.store(true, Ordering::SeqCst);
        let mut status = self.state.status.lock().unwrap();
        if status.state == CrawlState::Running {
            status.state = CrawlState::Stopping;
        }
    }

    /// Clears the hot tier then starts a fresh crawl.
    pub fn recrawl(self: &Arc<Self>, depth_override: Option<usize>) {
        self.cache.clear(crate::cache::Tier::Hot);
        self.start(depth_override);
    }

    /// Spawns `self.workers` persistent fetchers sharing one frontier, per
    /// spec §4.5. Each worker loops: dequeue, fetch, on success enqueue
    /// same-origin links, on 429/transport-error back off before its own
    /// next dequeue. `stop()` is observed between fetches.
    async fn run(self: Arc<Self>, depth_override: Option<usize>, generation: u64) {
        let seeds = self.state.seeds.lock().unwrap().clone();
        let frontier = Arc::new(Mutex::new(Frontier {
            queue: seeds
                .iter()
                .map(|s| (s.url.clone(), depth_override.unwrap_or(s.depth)))
                .collect(),
            seen: HashSet::new(),
        }));
        let active_workers = Arc::new(AtomicUsize::new(self.workers));

        let handles: Vec<_> = (0..self.workers)
            .map(|_| {
                let this = Arc::clone(&self);
                let frontier = Arc::clone(&frontier);
                let active_workers = Arc::clone(&active_workers);
                tokio::spawn(async move {
                    this.worker_loop(frontier, active_workers, generation).await;
                })
            })
            .collect();

        for handle in handles {
            let _ = handle.await;
        }

        {
            let mut status = self.state.status.lock().unwrap();
            status.state = CrawlState::Idle;
        }
        info!("crawl finished, state idle");
    }

    async fn worker_loop(
        &self,
        frontier: Arc<Mutex<Frontier>>,
        active_workers: Arc<AtomicUsize>,
        generation: u64,
    ) {
        let mut backoff_secs = 1u64;
        loop {
            if self.state.generation.load(Ordering::SeqCst) != generation {
                break;
            }
            if self.state.stopping.load(Ordering::SeqCst) {
                break;
            }

            let next = {
                let mut f = frontier.lock().await;
                f.queue.pop_front()
            };

            let Some((url, depth_remaining)) = next else {
                active_workers.fetch_sub(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                if frontier.lock().await.queue.is_empty() && active_workers.load(Ordering::SeqCst) == 0 {
                    return;
                }
                active_workers.fetch_add(1, Ordering::SeqCst);
                continue;
            };

            let should_back_off = self.fetch_one(&url, depth_remaining, &frontier).await;
            if should_back_off {
                tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
            } else {
                backoff_secs = 1;
            }
        }
        active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Fetches and stores one URL, enqueueing same-origin links on success.
    /// Returns whether the *next* dequeue on this worker should back off.
    async fn fetch_one(&self, url: &str, depth_remaining: usize, frontier: &Mutex<Frontier>) -> bool {
        {
            let mut status = self.state.status.lock().unwrap();
            status.urls_seen += 1;
            status.current_depth = depth_remaining;
            status.current_url = Some(url.to_string());
        }

        let cfg = self.config.load();
        match self.wayback.fetch_snapshot(url, &cfg.target_date).await {
            Ok(resp) => {
                let content_type = resp.content_type.clone();
                let body = transform::transform(&cfg, &content_type, &resp.body, &resp.archive_date);
                let mut stored = resp.clone();
                stored.body = body;
                self.cache.put_curated(url, &stored);

                {
                    let mut status = self.state.status.lock().unwrap();
                    status.urls_fetched += 1;
                }
                self.push_log(format!("fetched {url} (depth remaining {depth_remaining})"));

                if depth_remaining > 0 && transform::is_html(&content_type) {
                    let links = extract_same_origin_links(url, &stored.body);
                    let mut f = frontier.lock().await;
                    for link in links {
                        if f.seen.insert(link.clone()) {
                            f.queue.push_back((link, depth_remaining - 1));
                        }
                    }
                }
                false
            }
            Err(e) => {
                let is_backoff_error = matches!(e, crate::error::UpstreamError::Unavailable(_));
                {
                    let mut status = self.state.status.lock().unwrap();
                    status.urls_failed += 1;
                }
                self.push_log(format!("failed {url}: {e}"));
                warn!(url, error = %e, "crawl fetch failed");
                is_backoff_error
            }
        }
    }

    fn push_log(&self, line: String) {
        self.state.log.lock().unwrap().push(line);
    }
}

/// Extracts `href`/`src` attribute values that resolve to the same
/// scheme://host as `seed_url`, per spec §4.5 step 3.
fn extract_same_origin_links(seed_url: &str, html: &[u8]) -> Vec<String> {
    let Ok(seed) = url::Url::parse(seed_url) else {
        return Vec::new();
    };
    let Ok(html) = std::str::from_utf8(html) else {
        return Vec::new();
    };
    let mut results = Vec::new();
    for attr in ["href=\"", "src=\""] {
        let mut rest = html;
        while let Some(pos) = rest.find(attr) {
            let after = &rest[pos + attr.len()..];
            let Some(end) = after.find('"') else {
                break;
            };
            let candidate = &after[..end];
            if let Ok(resolved) = seed.join(candidate) {
                if resolved.scheme() == seed.scheme() && resolved.host_str() == seed.host_str() {
                    results.push(resolved.to_string());
                }
            }
            rest = &after[end..];
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_ring_evicts_oldest_past_capacity() {
        let mut ring = LogRing::new();
        for i in 0..(LOG_RING_CAPACITY + 10) {
            ring.push(format!("line {i}"));
        }
        assert_eq!(ring.lines.len(), LOG_RING_CAPACITY);
        assert_eq!(ring.lines.front().unwrap(), "line 10");
    }

    #[test]
    fn log_ring_tail_returns_in_order() {
        let mut ring = LogRing::new();
        ring.push("a".to_string());
        ring.push("b".to_string());
        ring.push("c".to_string());
        assert_eq!(ring.tail(2), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn extract_same_origin_links_filters_cross_origin() {
        let html = br#"<a href="http://foo.test/a">x</a><a href="http://other.test/b">y</a>"#;
        let links = extract_same_origin_links("http://foo.test/", html);
        assert_eq!(links, vec!["http://foo.test/a".to_string()]);
    }

    #[test]
    fn extract_same_origin_links_resolves_relative_paths() {
        let html = br#"<img src="/logo.png">"#;
        let links = extract_same_origin_links("http://foo.test/page", html);
        assert_eq!(links, vec!["http://foo.test/logo.png".to_string()]);
    }
}
