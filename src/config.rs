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

use std::fs::File;
use std::sync::Arc;

use arc_swap::ArcSwap;
use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::ConfigError;

/// CLI flags, per spec §6. Anything left `None` falls through to the
/// environment, then the YAML file, then the hardcoded default.
#[derive(Debug, Parser, Clone)]
#[command(name = "wayback-cache-proxy", version, about)]
pub struct Cli {
    /// Path to a YAML config file. When given, the process subscribes to
    /// the `wayback:config:reload` channel for live reload.
    #[arg(long, env = "CONFIG")]
    pub config: Option<String>,

    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Target replay date, YYYYMMDD.
    #[arg(long, env = "TARGET_DATE")]
    pub date: Option<String>,

    #[arg(long, env = "REDIS_URL")]
    pub redis: Option<String>,

    #[arg(long = "header-bar", env = "HEADER_BAR")]
    pub header_bar: Option<bool>,

    #[arg(long = "header-bar-position", env = "HEADER_BAR_POSITION")]
    pub header_bar_position: Option<String>,

    #[arg(long = "header-bar-text", env = "HEADER_BAR_TEXT")]
    pub header_bar_text: Option<String>,

    #[arg(long, env = "SPEED")]
    pub speed: Option<String>,

    #[arg(long = "speed-selector", env = "SPEED_SELECTOR")]
    pub speed_selector: Option<bool>,

    #[arg(long, env = "ADMIN")]
    pub admin: Option<bool>,

    #[arg(long = "admin-password", env = "ADMIN_PASSWORD")]
    pub admin_password: Option<String>,

    /// Comma-separated glob patterns. Presence implies allowlist mode.
    #[arg(long, env = "ALLOWLIST")]
    pub allowlist: Option<String>,

    #[arg(long = "error-pages", env = "ERROR_PAGES")]
    pub error_pages: Option<String>,

    #[arg(long = "no-landing-page", env = "NO_LANDING_PAGE")]
    pub no_landing_page: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Open,
    Allowlist,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HeaderBarPosition {
    Top,
    Bottom,
}

/// Mirrors the `proxy{}` YAML section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProxySection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub target_date: Option<String>,
    pub date_tolerance_days: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CacheSection {
    pub redis_url: Option<String>,
    pub hot_ttl_days: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AccessSection {
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TransformSection {
    pub remove_wayback_toolbar: Option<bool>,
    pub remove_wayback_scripts: Option<bool>,
    pub fix_base_tags: Option<bool>,
    pub fix_asset_urls: Option<bool>,
    pub normalize_links: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HeaderBarSection {
    pub enabled: Option<bool>,
    pub position: Option<String>,
    pub text: Option<String>,
    pub speed_selector: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ThrottleSection {
    pub speed: Option<String>,
    pub selector: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AdminSection {
    pub enabled: Option<bool>,
    pub password: Option<String>,
}

/// Raw, all-optional view of the YAML file. `serde(deny_unknown_fields)`
/// enforces §6's "unknown keys are rejected".
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawFileConfig {
    #[serde(default)]
    proxy: ProxySection,
    #[serde(default)]
    cache: CacheSection,
    #[serde(default)]
    access: AccessSection,
    #[serde(default)]
    transform: TransformSection,
    #[serde(default)]
    header_bar: HeaderBarSection,
    #[serde(default)]
    throttle: ThrottleSection,
    #[serde(default)]
    admin: AdminSection,
}

/// The fully resolved, in-memory config record described in spec §3/§6.
/// Constructed once at startup, replaced wholesale on reload — never
/// mutated field-by-field (spec §9).
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub target_date: String,
    pub date_tolerance_days: i64,

    pub redis_url: String,
    pub hot_ttl_days: i64,

    pub access_mode: AccessMode,

    pub remove_wayback_toolbar: bool,
    pub remove_wayback_scripts: bool,
    pub fix_base_tags: bool,
    pub fix_asset_urls: bool,
    pub normalize_links: bool,

    pub header_bar_enabled: bool,
    pub header_bar_position: HeaderBarPosition,
    pub header_bar_text: String,
    pub speed_selector: bool,

    pub throttle_speed: String,

    pub admin_enabled: bool,
    pub admin_password: Option<String>,

    pub allowlist: Vec<String>,
    pub error_pages_dir: Option<String>,
    pub landing_page_enabled: bool,

    /// Present only when started with `--config`; used to decide whether
    /// to subscribe to the reload channel.
    pub config_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "0.0.0.0".to_string(),
            port: 8080,
            target_date: chrono_today_yyyymmdd(),
            date_tolerance_days: 365,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            hot_ttl_days: 7,
            access_mode: AccessMode::Open,
            remove_wayback_toolbar: true,
            remove_wayback_scripts: true,
            fix_base_tags: true,
            fix_asset_urls: true,
            normalize_links: true,
            header_bar_enabled: true,
            header_bar_position: HeaderBarPosition::Top,
            header_bar_text: "Wayback Cache Proxy".to_string(),
            speed_selector: false,
            throttle_speed: "unlimited".to_string(),
            admin_enabled: false,
            admin_password: None,
            allowlist: Vec::new(),
            error_pages_dir: None,
            landing_page_enabled: true,
            config_path: None,
        }
    }
}

fn chrono_today_yyyymmdd() -> String {
    chrono::Utc::now().format("%Y%m%d").to_string()
}

fn validate_date(date: &str) -> Result<(), ConfigError> {
    if date.len() != 8 || !date.chars().all(|c| c.is_ascii_digit()) {
        return Err(ConfigError::InvalidDate(date.to_string()));
    }
    chrono::NaiveDate::parse_from_str(date, "%Y%m%d")
        .map(|_| ())
        .map_err(|_| ConfigError::InvalidDate(date.to_string()))
}

fn load_yaml(path: &str) -> Result<RawFileConfig, ConfigError> {
    let file = File::open(path).map_err(|source| ConfigError::Read {
        path: path.to_string(),
        source,
    })?;
    serde_yaml::from_reader(file).map_err(|source| ConfigError::Parse {
        path: path.to_string(),
        source,
    })
}

/// Builds the final `Config` from (highest to lowest priority) CLI flags,
/// environment variables (already merged into `cli` by clap's `env`
/// attribute), and the YAML file, per spec §6.
pub fn build_config(cli: &Cli) -> Result<Config, ConfigError> {
    let mut cfg = Config::default();

    if let Some(path) = &cli.config {
        let file_cfg = load_yaml(path)?;
        apply_file_config(&mut cfg, file_cfg)?;
        cfg.config_path = Some(path.clone());
        info!(path, "loaded config file");
    }

    apply_cli_overrides(&mut cfg, cli)?;

    validate_date(&cfg.target_date)?;
    Ok(cfg)
}

fn apply_file_config(cfg: &mut Config, file: RawFileConfig) -> Result<(), ConfigError> {
    if let Some(v) = file.proxy.host {
        cfg.host = v;
    }
    if let Some(v) = file.proxy.port {
        cfg.port = v;
    }
    if let Some(v) = file.proxy.target_date {
        cfg.target_date = v;
    }
    if let Some(v) = file.proxy.date_tolerance_days {
        cfg.date_tolerance_days = v;
    }
    if let Some(v) = file.cache.redis_url {
        cfg.redis_url = v;
    }
    if let Some(v) = file.cache.hot_ttl_days {
        cfg.hot_ttl_days = v;
    }
    if let Some(v) = file.access.mode {
        cfg.access_mode = parse_access_mode(&v)?;
    }
    if let Some(v) = file.transform.remove_wayback_toolbar {
        cfg.remove_wayback_toolbar = v;
    }
    if let Some(v) = file.transform.remove_wayback_scripts {
        cfg.remove_wayback_scripts = v;
    }
    if let Some(v) = file.transform.fix_base_tags {
        cfg.fix_base_tags = v;
    }
    if let Some(v) = file.transform.fix_asset_urls {
        cfg.fix_asset_urls = v;
    }
    if let Some(v) = file.transform.normalize_links {
        cfg.normalize_links = v;
    }
    if let Some(v) = file.header_bar.enabled {
        cfg.header_bar_enabled = v;
    }
    if let Some(v) = file.header_bar.position {
        cfg.header_bar_position = parse_position(&v);
    }
    if let Some(v) = file.header_bar.text {
        cfg.header_bar_text = v;
    }
    if let Some(v) = file.header_bar.speed_selector {
        cfg.speed_selector = v;
    }
    if let Some(v) = file.throttle.speed {
        cfg.throttle_speed = v;
    }
    if let Some(v) = file.throttle.selector {
        cfg.speed_selector = v;
    }
    if let Some(v) = file.admin.enabled {
        cfg.admin_enabled = v;
    }
    if let Some(v) = file.admin.password {
        cfg.admin_password = Some(v);
    }
    Ok(())
}

fn parse_access_mode(v: &str) -> Result<AccessMode, ConfigError> {
    match v {
        "open" => Ok(AccessMode::Open),
        "allowlist" => Ok(AccessMode::Allowlist),
        other => Err(ConfigError::InvalidDate(format!(
            "invalid access.mode {other:?}, expected open|allowlist"
        ))),
    }
}

fn parse_position(v: &str) -> HeaderBarPosition {
    match v {
        "bottom" => HeaderBarPosition::Bottom,
        _ => HeaderBarPosition::Top,
    }
}

fn apply_cli_overrides(cfg: &mut Config, cli: &Cli) -> Result<(), ConfigError> {
    if let Some(v) = &cli.port {
        cfg.port = *v;
    }
    if let Some(v) = &cli.date {
        cfg.target_date = v.clone();
    }
    if let Some(v) = &cli.redis {
        cfg.redis_url = v.clone();
    }
    if let Some(v) = cli.header_bar {
        cfg.header_bar_enabled = v;
    }
    if let Some(v) = &cli.header_bar_position {
        cfg.header_bar_position = parse_position(v);
    }
    if let Some(v) = &cli.header_bar_text {
        cfg.header_bar_text = v.clone();
    }
    if let Some(v) = &cli.speed {
        cfg.throttle_speed = v.clone();
    }
    if let Some(v) = cli.speed_selector {
        cfg.speed_selector = v;
    }
    if let Some(v) = cli.admin {
        cfg.admin_enabled = v;
    }
    if let Some(v) = &cli.admin_password {
        cfg.admin_password = Some(v.clone());
    }
    if let Some(v) = &cli.allowlist {
        cfg.allowlist = v.split(',').map(|s| s.trim().to_string()).collect();
        cfg.access_mode = AccessMode::Allowlist;
    }
    if let Some(v) = &cli.error_pages {
        cfg.error_pages_dir = Some(v.clone());
    }
    if cli.no_landing_page {
        cfg.landing_page_enabled = false;
    }
    Ok(())
}

/// Shared, atomically-swappable config handle. Many readers load through
/// the same `Arc`; the reload listener is the only writer and replaces the
/// whole snapshot in one store, per spec §5/§9.
#[derive(Clone)]
pub struct ConfigHandle(Arc<ArcSwap<Config>>);

impl ConfigHandle {
    pub fn new(initial: Config) -> Self {
        ConfigHandle(Arc::new(ArcSwap::from_pointee(initial)))
    }

    pub fn load(&self) -> Arc<Config> {
        self.0.load_full()
    }

    pub fn store(&self, new_config: Config) {
        self.0.store(Arc::new(new_config));
    }
}

/// Reload the config from disk, falling back to the prior config on
/// failure so a bad edit never takes the proxy down (spec §7).
pub fn reload_from_disk(handle: &ConfigHandle, cli: &Cli) {
    let Some(path) = &cli.config else {
        warn!("reload requested but process was not started with --config");
        return;
    };
    match load_yaml(path) {
        Ok(file_cfg) => {
            let mut next = (*handle.load()).clone();
            match apply_file_config(&mut next, file_cfg) {
                Ok(()) => {
                    if let Err(e) = validate_date(&next.target_date) {
                        warn!(error = %e, "reload produced invalid config, keeping prior config");
                        return;
                    }
                    handle.store(next);
                    info!("config reloaded");
                }
                Err(e) => warn!(error = %e, "reload failed, keeping prior config"),
            }
        }
        Err(e) => warn!(error = %e, "reload failed, keeping prior config"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.access_mode, AccessMode::Open);
    }

    #[test]
    fn validate_date_rejects_malformed_input() {
        assert!(validate_date("2001091").is_err());
        assert!(validate_date("20011315").is_err());
        assert!(validate_date("not-a-date").is_err());
        assert!(validate_date("20010915").is_ok());
    }

    #[test]
    fn file_config_rejects_unknown_keys() {
        let yaml = "proxy:\n  port: 8080\nbogus_section:\n  x: 1\n";
        let result: Result<RawFileConfig, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn cli_overrides_win_over_file_config() {
        let mut cfg = Config::default();
        apply_file_config(
            &mut cfg,
            RawFileConfig {
                throttle: ThrottleSection {
                    speed: Some("56k".to_string()),
                    selector: None,
                },
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.throttle_speed, "56k");

        let cli = Cli {
            config: None,
            port: None,
            date: None,
            redis: None,
            header_bar: None,
            header_bar_position: None,
            header_bar_text: None,
            speed: Some("unlimited".to_string()),
            speed_selector: None,
            admin: None,
            admin_password: None,
            allowlist: None,
            error_pages: None,
            no_landing_page: false,
        };
        apply_cli_overrides(&mut cfg, &cli).unwrap();
        assert_eq!(cfg.throttle_speed, "unlimited");
    }
}
