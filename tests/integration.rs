//! End-to-end coverage of the request pipeline: a real `TcpListener`
//! driving `Server::run`, a `wiremock` server standing in for the Wayback
//! Machine, and a real local Redis for the cache store. These assume a
//! Redis instance reachable at `redis://127.0.0.1:6379`, the same
//! assumption the inline unit tests in `admin.rs`/`cache.rs` make.

use std::io::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use wayback_cache_proxy::admin::AdminSurface;
use wayback_cache_proxy::cache::{CacheStore, CachedResponse};
use wayback_cache_proxy::config::{
    build_config, reload_from_disk, AccessMode, Cli, Config, ConfigHandle,
};
use wayback_cache_proxy::crawler::Crawler;
use wayback_cache_proxy::server::Server;
use wayback_cache_proxy::wayback::WaybackClient;

fn test_cli() -> Cli {
    Cli {
        config: None,
        port: None,
        date: None,
        redis: None,
        header_bar: None,
        header_bar_position: None,
        header_bar_text: None,
        speed: None,
        speed_selector: None,
        admin: None,
        admin_password: None,
        allowlist: None,
        error_pages: None,
        no_landing_page: false,
    }
}

async fn spawn_server(cfg: Config, wayback_base_url: &str) -> (std::net::SocketAddr, Arc<Crawler>) {
    let config_handle = ConfigHandle::new(cfg.clone());
    let cache = Arc::new(CacheStore::new(&cfg.redis_url, cfg.hot_ttl_days).unwrap());
    let wayback = Arc::new(WaybackClient::new_with_base_url(
        "wayback-cache-proxy-test/0.1",
        cfg.date_tolerance_days,
        wayback_base_url,
    ));
    let crawler = Arc::new(Crawler::new(Arc::clone(&cache), Arc::clone(&wayback), config_handle.clone()));
    let admin = Arc::new(AdminSurface {
        cache: Arc::clone(&cache),
        crawler: Arc::clone(&crawler),
        config: config_handle.clone(),
    });
    let server = Arc::new(Server {
        config: config_handle,
        cache,
        wayback,
        admin,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(async move {
        server.run(listener, shutdown).await;
    });
    // give the accept loop a moment to start listening
    tokio::time::sleep(Duration::from_millis(20)).await;
    (addr, crawler)
}

async fn send_raw_request(addr: std::net::SocketAddr, request: &str) -> (u16, Vec<(String, String)>, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();

    let split_at = raw.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
    let head = std::str::from_utf8(&raw[..split_at]).unwrap();
    let body = raw[split_at + 4..].to_vec();

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap();
    let status: u16 = status_line.split_whitespace().nth(1).unwrap().parse().unwrap();
    let headers = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();
    (status, headers, body)
}

#[tokio::test]
async fn cache_hit_curated_skips_upstream() {
    let wayback_mock = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&wayback_mock)
        .await;

    let cfg = Config {
        redis_url: "redis://127.0.0.1:6379".to_string(),
        ..Config::default()
    };
    let cache = CacheStore::new(&cfg.redis_url, cfg.hot_ttl_days).unwrap();
    cache.put_curated(
        "http://foo.test/",
        &CachedResponse {
            status_code: 200,
            headers: vec![],
            body: b"<html>cached copy</html>".to_vec(),
            content_type: "text/html".to_string(),
            stored_at: 0,
            source_url: "http://foo.test/".to_string(),
            archive_date: "20010915".to_string(),
        },
    );

    let (addr, _crawler) = spawn_server(cfg, &wayback_mock.uri()).await;
    let request = format!(
        "GET http://foo.test/ HTTP/1.1\r\nHost: foo.test\r\nConnection: close\r\n\r\n"
    );
    let (status, headers, body) = send_raw_request(addr, &request).await;

    assert_eq!(status, 200);
    assert_eq!(
        headers.iter().find(|(k, _)| k == "x-cache").map(|(_, v)| v.as_str()),
        Some("hit-curated")
    );
    assert!(String::from_utf8_lossy(&body).contains("cached copy"));
}

#[tokio::test]
async fn hot_promotion_rewrites_base_tag_and_promotes_to_hit_hot() {
    let wayback_mock = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/web/.*$"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(
                    r#"<html><base href="https://web.archive.org/web/20010915000000/http://foo.test/"></html>"#,
                )
                .insert_header("content-type", "text/html; charset=utf-8"),
        )
        .expect(1)
        .mount(&wayback_mock)
        .await;

    let cfg = Config {
        redis_url: "redis://127.0.0.1:6379".to_string(),
        target_date: "20010915".to_string(),
        ..Config::default()
    };
    let (addr, _crawler) = spawn_server(cfg, &wayback_mock.uri()).await;
    let request = "GET http://foo.test/ HTTP/1.1\r\nHost: foo.test\r\nConnection: close\r\n\r\n";

    let (status, headers, body) = send_raw_request(addr, request).await;
    assert_eq!(status, 200);
    assert_eq!(
        headers.iter().find(|(k, _)| k == "x-cache").map(|(_, v)| v.as_str()),
        Some("miss")
    );
    let body_str = String::from_utf8_lossy(&body);
    assert!(body_str.contains(r#"<base href="http://foo.test/">"#));
    assert!(!body_str.contains("web.archive.org"));

    let (status2, headers2, _) = send_raw_request(addr, request).await;
    assert_eq!(status2, 200);
    assert_eq!(
        headers2.iter().find(|(k, _)| k == "x-cache").map(|(_, v)| v.as_str()),
        Some("hit-hot")
    );
}

#[tokio::test]
async fn allowlist_denial_returns_403_without_upstream_call() {
    let wayback_mock = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&wayback_mock)
        .await;

    let cfg = Config {
        redis_url: "redis://127.0.0.1:6379".to_string(),
        access_mode: AccessMode::Allowlist,
        allowlist: vec!["*.art".to_string()],
        ..Config::default()
    };
    let (addr, _crawler) = spawn_server(cfg, &wayback_mock.uri()).await;
    let request = "GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n";
    let (status, _headers, _body) = send_raw_request(addr, request).await;
    assert_eq!(status, 403);
}

#[tokio::test]
async fn upstream_down_returns_502_and_creates_no_hot_entry() {
    let wayback_mock = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&wayback_mock)
        .await;

    let cfg = Config {
        redis_url: "redis://127.0.0.1:6379".to_string(),
        ..Config::default()
    };
    let cache = CacheStore::new(&cfg.redis_url, cfg.hot_ttl_days).unwrap();
    let (addr, _crawler) = spawn_server(cfg, &wayback_mock.uri()).await;
    let request = "GET http://down.test/ HTTP/1.1\r\nHost: down.test\r\nConnection: close\r\n\r\n";
    let (status, _headers, _body) = send_raw_request(addr, request).await;
    assert_eq!(status, 502);

    let (cached, tier) = cache.get("http://down.test/");
    assert!(cached.is_none());
    assert!(tier.is_none());
}

#[tokio::test]
async fn throttled_delivery_takes_the_expected_wall_clock_window() {
    let wayback_mock = MockServer::start().await;
    let body = "x".repeat(18_000);
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(body)
                .insert_header("content-type", "text/plain"),
        )
        .mount(&wayback_mock)
        .await;

    let cfg = Config {
        redis_url: "redis://127.0.0.1:6379".to_string(),
        throttle_speed: "14.4k".to_string(),
        header_bar_enabled: false,
        ..Config::default()
    };
    let (addr, _crawler) = spawn_server(cfg, &wayback_mock.uri()).await;
    let request = "GET http://slow.test/ HTTP/1.1\r\nHost: slow.test\r\nConnection: close\r\n\r\n";

    let start = Instant::now();
    let (status, _headers, body) = send_raw_request(addr, request).await;
    let elapsed = start.elapsed();

    assert_eq!(status, 200);
    assert_eq!(body.len(), 18_000);
    assert!(elapsed >= Duration::from_secs(9), "delivered too fast: {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(12), "delivered too slow: {elapsed:?}");
}

#[tokio::test]
async fn live_reload_picks_up_an_edited_speed_without_restart() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "proxy:\n  port: 8099\nthrottle:\n  speed: unlimited\n").unwrap();

    let mut cli = test_cli();
    cli.config = Some(file.path().to_string_lossy().to_string());
    let initial = build_config(&cli).unwrap();
    assert_eq!(initial.throttle_speed, "unlimited");

    let handle = ConfigHandle::new(initial);

    let mut file = file.into_file();
    file.set_len(0).unwrap();
    use std::io::Seek;
    file.seek(std::io::SeekFrom::Start(0)).unwrap();
    writeln!(file, "proxy:\n  port: 8099\nthrottle:\n  speed: 56k\n").unwrap();
    file.flush().unwrap();

    reload_from_disk(&handle, &cli);

    assert_eq!(handle.load().throttle_speed, "56k");
}
