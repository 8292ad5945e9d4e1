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

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use redis::Commands;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::CacheError;

/// Which tier a lookup landed in, per spec §3/§4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Curated,
    Hot,
}

impl Tier {
    fn prefix(self) -> &'static str {
        match self {
            Tier::Curated => "curated",
            Tier::Hot => "hot",
        }
    }
}

/// First 16 hex chars of SHA-256 over the normalized URL, per spec §3.
pub fn url_hash(normalized_url: &str) -> String {
    let digest = Sha256::digest(normalized_url.as_bytes());
    hex::encode(digest)[..16].to_string()
}

fn cache_key(tier: Tier, hash: &str) -> String {
    format!("{}:{}", tier.prefix(), hash)
}

/// Serializable record for an archived response, per spec §3. Stored as a
/// JSON envelope with the body base64-encoded so binary assets survive a
/// string-only store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedResponse {
    pub status_code: u16,
    /// Ordered, duplicates-preserved; case-insensitive comparison is the
    /// caller's responsibility since names are transported verbatim here.
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,
    pub content_type: String,
    pub stored_at: i64,
    pub source_url: String,
    pub archive_date: String,
}

mod body_base64 {
    use super::BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub curated_count: u64,
    pub hot_count: u64,
    pub approx_bytes: u64,
}

/// Two-tier cache over Redis, per spec §4.1. Curated entries never expire;
/// hot entries carry a TTL. Reads consult curated before hot; a write to
/// one tier never touches the other.
pub struct CacheStore {
    client: redis::Client,
    hot_ttl_seconds: i64,
}

impl CacheStore {
    pub fn new(redis_url: &str, hot_ttl_days: i64) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)?;
        Ok(CacheStore {
            client,
            hot_ttl_seconds: hot_ttl_days.max(0) * 86_400,
        })
    }

    fn connection(&self) -> Result<redis::Connection, CacheError> {
        Ok(self.client.get_connection()?)
    }

    /// Looks up curated first, then hot. Returns the tier it was found in.
    pub fn get(&self, normalized_url: &str) -> (Option<CachedResponse>, Option<Tier>) {
        let hash = url_hash(normalized_url);
        match self.try_get(&hash) {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "cache store unavailable, serving in degraded mode");
                (None, None)
            }
        }
    }

    fn try_get(&self, hash: &str) -> Result<(Option<CachedResponse>, Option<Tier>), CacheError> {
        let mut conn = self.connection()?;
        let curated_key = cache_key(Tier::Curated, hash);
        let raw: Option<String> = conn.get(&curated_key)?;
        if let Some(raw) = raw {
            let resp = decode_entry(&raw)?;
            return Ok((Some(resp), Some(Tier::Curated)));
        }
        let hot_key = cache_key(Tier::Hot, hash);
        let raw: Option<String> = conn.get(&hot_key)?;
        if let Some(raw) = raw {
            let resp = decode_entry(&raw)?;
            return Ok((Some(resp), Some(Tier::Hot)));
        }
        Ok((None, None))
    }

    pub fn put_hot(&self, normalized_url: &str, resp: &CachedResponse) {
        if self.hot_ttl_seconds <= 0 {
            return;
        }
        if let Err(e) = self.put(Tier::Hot, normalized_url, resp, Some(self.hot_ttl_seconds)) {
            warn!(error = %e, "cache write (hot) failed, continuing uncached");
        }
    }

    pub fn put_curated(&self, normalized_url: &str, resp: &CachedResponse) {
        if let Err(e) = self.put(Tier::Curated, normalized_url, resp, None) {
            warn!(error = %e, "cache write (curated) failed, continuing uncached");
        }
    }

    fn put(
        &self,
        tier: Tier,
        normalized_url: &str,
        resp: &CachedResponse,
        ttl_seconds: Option<i64>,
    ) -> Result<(), CacheError> {
        let hash = url_hash(normalized_url);
        let key = cache_key(tier, &hash);
        let encoded = serde_json::to_string(resp)
            .map_err(|e| CacheError::Corrupt(e.to_string()))?;
        let mut conn = self.connection()?;
        match ttl_seconds {
            Some(ttl) if ttl > 0 => {
                let _: () = conn.set_ex(&key, encoded, ttl as u64)?;
            }
            _ => {
                let _: () = conn.set(&key, encoded)?;
            }
        }
        Ok(())
    }

    pub fn delete(&self, normalized_url: &str, tier: Tier) {
        let hash = url_hash(normalized_url);
        let key = cache_key(tier, &hash);
        if let Ok(mut conn) = self.connection() {
            let _: Result<i64, _> = conn.del(&key);
        } else {
            warn!("cache store unavailable, delete skipped");
        }
    }

    pub fn clear(&self, tier: Tier) {
        let pattern = format!("{}:*", tier.prefix());
        match self.connection() {
            Ok(mut conn) => match conn.keys::<_, Vec<String>>(&pattern) {
                Ok(keys) if !keys.is_empty() => {
                    let _: Result<i64, _> = conn.del(keys);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "cache clear failed"),
            },
            Err(e) => warn!(error = %e, "cache store unavailable, clear skipped"),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        let Ok(mut conn) = self.connection() else {
            warn!("cache store unavailable, stats unavailable");
            return stats;
        };
        if let Ok(keys) = conn.keys::<_, Vec<String>>("curated:*") {
            stats.curated_count = keys.len() as u64;
        }
        if let Ok(keys) = conn.keys::<_, Vec<String>>("hot:*") {
            stats.hot_count = keys.len() as u64;
        }
        stats
    }

    /// Increments the view counter for a registrable domain, per spec §3.
    pub fn track_view(&self, domain: &str) {
        match self.connection() {
            Ok(mut conn) => {
                let _: Result<f64, _> = conn.zincr("views:urls", domain, 1);
            }
            Err(e) => warn!(error = %e, "cache store unavailable, view not tracked"),
        }
    }

    pub fn top_views(&self, n: isize) -> Vec<(String, i64)> {
        match self.connection() {
            Ok(mut conn) => conn
                .zrevrange_withscores("views:urls", 0, n.saturating_sub(1))
                .unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "cache store unavailable, top_views unavailable");
                Vec::new()
            }
        }
    }

    pub fn allowlist_check(&self, patterns: &[String], url: &str) -> bool {
        patterns.iter().any(|p| crate::domain::glob_match(p, url))
    }

    pub fn allowlist_set(&self, patterns: &[String]) {
        match self.connection() {
            Ok(mut conn) => {
                let _: Result<i64, _> = conn.del("allowlist:urls");
                if !patterns.is_empty() {
                    let _: Result<i64, _> = conn.rpush("allowlist:urls", patterns);
                }
            }
            Err(e) => warn!(error = %e, "cache store unavailable, allowlist not persisted"),
        }
    }

    pub fn load_allowlist(&self) -> Vec<String> {
        match self.connection() {
            Ok(mut conn) => conn.lrange("allowlist:urls", 0, -1).unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "cache store unavailable, allowlist unavailable");
                Vec::new()
            }
        }
    }

    /// All entries currently stored in one tier, used by the admin
    /// cache-listing view (paginated and searched by the caller).
    pub fn list_tier(&self, tier: Tier) -> Vec<CachedResponse> {
        let pattern = format!("{}:*", tier.prefix());
        let mut conn = match self.connection() {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "cache store unavailable, list unavailable");
                return Vec::new();
            }
        };
        let keys: Vec<String> = conn.keys(&pattern).unwrap_or_default();
        keys.into_iter()
            .filter_map(|key| {
                let raw: Option<String> = conn.get(&key).ok()?;
                decode_entry(&raw?).ok()
            })
            .collect()
    }
}

fn decode_entry(raw: &str) -> Result<CachedResponse, CacheError> {
    serde_json::from_str(raw).map_err(|e| CacheError::Corrupt(e.to_string()))
}

/// Snapshot of raw key listings used by the admin cache-listing view, kept
/// here since it shares the connection/tier plumbing above.
pub fn paginate_keys(raw_keys: &[String], page: usize, per_page: usize) -> Vec<String> {
    raw_keys
        .iter()
        .skip(page * per_page)
        .take(per_page)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_response() -> CachedResponse {
        CachedResponse {
            status_code: 200,
            headers: vec![("Content-Type".to_string(), "text/html".to_string())],
            body: (0u8..=255u8).collect(),
            content_type: "text/html".to_string(),
            stored_at: 1_000_000,
            source_url: "http://example.com/".to_string(),
            archive_date: "20010915".to_string(),
        }
    }

    #[test]
    fn cache_key_uses_first_16_hex_chars_of_sha256() {
        let hash = url_hash("http://example.com/");
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn url_hash_is_deterministic() {
        assert_eq!(url_hash("http://example.com/"), url_hash("http://example.com/"));
        assert_ne!(url_hash("http://example.com/"), url_hash("http://example.org/"));
    }

    #[test]
    fn cached_response_round_trips_full_byte_range_through_json_envelope() {
        let resp = sample_response();
        let encoded = serde_json::to_string(&resp).unwrap();
        let decoded: CachedResponse = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, resp);
        assert_eq!(decoded.body.len(), 256);
    }

    #[test]
    fn cache_key_format_matches_tier_prefix() {
        assert_eq!(cache_key(Tier::Curated, "abc"), "curated:abc");
        assert_eq!(cache_key(Tier::Hot, "abc"), "hot:abc");
    }
}
