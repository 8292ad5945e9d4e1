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

//! Response-shaping middleware: header-bar injection and bandwidth
//! throttling, per spec §4.4. Applied after cache retrieval so cached
//! bytes stay tier-stable across config changes.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

const CHUNK_DURATION: Duration = Duration::from_millis(100);

/// Named speed profiles in bytes/second, per spec §4.4. `None` means
/// unlimited.
pub fn speed_bytes_per_second(name: &str) -> Option<u64> {
    match name {
        "14.4k" => Some(1_800),
        "28.8k" => Some(3_600),
        "56k" => Some(7_000),
        "isdn" => Some(16_000),
        "dsl" => Some(128_000),
        _ => None,
    }
}

/// Resolves the effective throttle speed for a request: the cookie value
/// wins if `speed_selector` is enabled and the cookie names a known
/// profile, else the config default.
pub fn effective_speed<'a>(
    config_default: &'a str,
    speed_selector_enabled: bool,
    cookie_value: Option<&'a str>,
) -> &'a str {
    if speed_selector_enabled {
        if let Some(cookie) = cookie_value {
            if speed_bytes_per_second(cookie).is_some() || cookie == "unlimited" {
                return cookie;
            }
        }
    }
    config_default
}

/// Streams `body` to `writer` in chunks paced to approximate
/// `bytes_per_second`, yielding between chunks so a cooperative
/// cancellation (client disconnect, shutdown) aborts the sleep
/// immediately rather than after the whole body drains.
pub async fn throttled_write<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    body: &[u8],
    bytes_per_second: Option<u64>,
    cancel: &CancellationToken,
) -> std::io::Result<()> {
    let Some(rate) = bytes_per_second else {
        return writer.write_all(body).await;
    };

    // Floor at 1 byte, not a fixed byte count: a fixed floor overshoots the
    // configured rate on slow profiles (e.g. 14.4k's ideal chunk is 180
    // bytes/100ms) because it can only ever shrink the per-chunk sleep, never
    // grow it.
    let chunk_size = ((rate as f64) * CHUNK_DURATION.as_secs_f64()).round() as usize;
    let chunk_size = chunk_size.max(1);

    for chunk in body.chunks(chunk_size) {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    "client disconnected during throttled write",
                ));
            }
            result = writer.write_all(chunk) => {
                result?;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    "client disconnected during throttled write",
                ));
            }
            _ = tokio::time::sleep(CHUNK_DURATION) => {}
        }
    }
    Ok(())
}

/// IE4/IE5-compatible header bar fragment: no modern DOM APIs, no arrow
/// functions, no `let`/`const`. Injected immediately after the opening
/// `<body>` tag, or prepended if absent.
pub fn header_bar_fragment(url: &str, archive_date: &str, brand_text: &str, speed_selector: bool) -> String {
    let selector_html = if speed_selector {
        r#"<select name="wayback_speed" onchange="document.cookie='wayback_speed='+this.value+'; path=/'; window.location.reload();">
<option value="unlimited">Unlimited</option>
<option value="dsl">DSL</option>
<option value="isdn">ISDN</option>
<option value="56k">56k modem</option>
<option value="28.8k">28.8k modem</option>
<option value="14.4k">14.4k modem</option>
</select>"#
    } else {
        ""
    };

    format!(
        r#"<div id="wayback-header-bar" style="background:#336699;color:#fff;font-family:Arial,sans-serif;font-size:12px;padding:4px 8px;">
{brand} &mdash; viewing {url} as archived {date} {selector}
</div>
"#,
        brand = html_escape(brand_text),
        url = html_escape(url),
        date = html_escape(archive_date),
        selector = selector_html,
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Injects the header bar fragment into an HTML body, per spec §4.4.
pub fn inject_header_bar(html: &str, fragment: &str) -> String {
    match html.find("<body") {
        Some(open_start) => match html[open_start..].find('>') {
            Some(rel) => {
                let insert_at = open_start + rel + 1;
                let mut out = String::with_capacity(html.len() + fragment.len());
                out.push_str(&html[..insert_at]);
                out.push_str(fragment);
                out.push_str(&html[insert_at..]);
                out
            }
            None => format!("{fragment}{html}"),
        },
        None => format!("{fragment}{html}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_speed_prefers_cookie_when_selector_enabled() {
        assert_eq!(effective_speed("unlimited", true, Some("56k")), "56k");
    }

    #[test]
    fn effective_speed_falls_back_to_default_when_selector_disabled() {
        assert_eq!(effective_speed("unlimited", false, Some("56k")), "unlimited");
    }

    #[test]
    fn effective_speed_ignores_unknown_cookie_value() {
        assert_eq!(effective_speed("dsl", true, Some("bogus")), "dsl");
    }

    #[test]
    fn speed_profiles_match_spec_table() {
        assert_eq!(speed_bytes_per_second("14.4k"), Some(1_800));
        assert_eq!(speed_bytes_per_second("28.8k"), Some(3_600));
        assert_eq!(speed_bytes_per_second("56k"), Some(7_000));
        assert_eq!(speed_bytes_per_second("isdn"), Some(16_000));
        assert_eq!(speed_bytes_per_second("dsl"), Some(128_000));
        assert_eq!(speed_bytes_per_second("unlimited"), None);
    }

    #[test]
    fn inject_header_bar_after_opening_body_tag() {
        let html = "<html><body class=\"x\"><p>hi</p></body></html>";
        let out = inject_header_bar(html, "BAR");
        assert_eq!(out, "<html><body class=\"x\">BAR<p>hi</p></body></html>");
    }

    #[test]
    fn inject_header_bar_prepends_when_body_missing() {
        let html = "<p>no body tag</p>";
        let out = inject_header_bar(html, "BAR");
        assert_eq!(out, "BAR<p>no body tag</p>");
    }

    #[test]
    fn header_bar_fragment_has_no_modern_js_syntax() {
        let fragment = header_bar_fragment("http://example.com/", "20010915", "Wayback", true);
        assert!(!fragment.contains("=>"));
        assert!(!fragment.contains("let "));
        assert!(!fragment.contains("const "));
    }

    #[tokio::test]
    async fn throttled_write_delivers_full_body_unlimited() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();
        let body = vec![1u8; 1000];
        let body_clone = body.clone();
        let writer = tokio::spawn(async move {
            throttled_write(&mut server, &body_clone, None, &cancel).await.unwrap();
        });
        let mut received = vec![0u8; 1000];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut received)
            .await
            .unwrap();
        writer.await.unwrap();
        assert_eq!(received, body);
    }

    #[tokio::test]
    async fn throttled_write_aborts_immediately_on_cancel() {
        let (_client, mut server) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let body = vec![1u8; 1000];
        let result = throttled_write(&mut server, &body, Some(100), &cancel).await;
        assert!(result.is_err());
    }
}
