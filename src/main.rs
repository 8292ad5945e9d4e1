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

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use wayback_cache_proxy::admin::AdminSurface;
use wayback_cache_proxy::cache::CacheStore;
use wayback_cache_proxy::config::{build_config, reload_from_disk, Cli, ConfigHandle};
use wayback_cache_proxy::crawler::Crawler;
use wayback_cache_proxy::server::Server;
use wayback_cache_proxy::wayback::WaybackClient;

const RELOAD_CHANNEL: &str = "wayback:config:reload";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;
    let redis_url = config.redis_url.clone();
    let hot_ttl_days = config.hot_ttl_days;
    let date_tolerance_days = config.date_tolerance_days;
    let listen_addr = format!("{}:{}", config.host, config.port);
    let config_handle = ConfigHandle::new(config);

    let cache = Arc::new(CacheStore::new(&redis_url, hot_ttl_days)?);
    let wayback = Arc::new(WaybackClient::new("WaybackCacheProxy/0.1", date_tolerance_days));
    let crawler = Arc::new(Crawler::new(Arc::clone(&cache), Arc::clone(&wayback), config_handle.clone()));
    let admin = Arc::new(AdminSurface {
        cache: Arc::clone(&cache),
        crawler: Arc::clone(&crawler),
        config: config_handle.clone(),
    });

    let shutdown = CancellationToken::new();

    if cli.config.is_some() {
        tokio::spawn(watch_config_reload(config_handle.clone(), cli.clone(), redis_url, shutdown.clone()));
    }

    let listener = TcpListener::bind(&listen_addr).await?;
    info!(addr = %listen_addr, "listening");

    let server = Arc::new(Server {
        config: config_handle,
        cache,
        wayback,
        admin,
    });

    let run_shutdown = shutdown.clone();
    let server_task = tokio::spawn(async move { server.run(listener, run_shutdown).await });

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    shutdown.cancel();
    crawler.stop();

    if let Err(e) = server_task.await {
        error!(error = %e, "server task panicked");
    }

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Subscribes to the Redis reload channel and reloads config on message,
/// mirroring the teacher's `DiscoveryBackgroundService::start` shape
/// (`tokio::select!` racing a shutdown signal against the work loop).
async fn watch_config_reload(
    handle: ConfigHandle,
    cli: Cli,
    redis_url: String,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let client = match redis::Client::open(redis_url.as_str()) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "could not build redis client for config reload, retrying in 5s");
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                continue;
            }
        };
        let conn = match client.get_connection() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "could not connect for config reload pubsub, retrying in 5s");
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                continue;
            }
        };
        let subscribed = tokio::task::spawn_blocking(move || {
            let mut pubsub = conn.into_pubsub();
            pubsub.subscribe(RELOAD_CHANNEL)?;
            Ok::<_, redis::RedisError>(pubsub)
        })
        .await;
        let mut pubsub = match subscribed {
            Ok(Ok(pubsub)) => pubsub,
            Ok(Err(e)) => {
                warn!(error = %e, "could not subscribe to reload channel, retrying in 5s");
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                continue;
            }
            Err(e) => {
                warn!(error = %e, "reload subscriber task panicked, retrying in 5s");
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                continue;
            }
        };

        loop {
            let next_message = tokio::task::spawn_blocking(move || {
                let msg = pubsub.get_message();
                (pubsub, msg)
            });

            tokio::select! {
                _ = shutdown.cancelled() => return,
                result = next_message => {
                    match result {
                        Ok((returned_pubsub, Ok(_))) => {
                            pubsub = returned_pubsub;
                            info!("config reload message received");
                            reload_from_disk(&handle, &cli);
                        }
                        Ok((_, Err(e))) => {
                            warn!(error = %e, "reload pubsub connection lost, reconnecting");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "reload listener task panicked, reconnecting");
                            break;
                        }
                    }
                }
            }
        }
    }
}
