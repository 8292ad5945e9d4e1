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

//! Pure transform from archived bytes+metadata to cleaned bytes+metadata,
//! per spec §4.3. Non-HTML bodies pass through unchanged. Every step is
//! idempotent and the pipeline as a whole is idempotent.

use crate::config::Config;

const TOOLBAR_BEGIN: &str = "<!-- BEGIN WAYBACK TOOLBAR INSERT -->";
const TOOLBAR_END: &str = "<!-- END WAYBACK TOOLBAR INSERT -->";

pub fn is_html(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("html")
}

/// Runs the steps enabled in `cfg`, in spec order, over `body`. Returns the
/// body unchanged if `content_type` is not HTML.
pub fn transform(cfg: &Config, content_type: &str, body: &[u8], archive_date: &str) -> Vec<u8> {
    if !is_html(content_type) {
        return body.to_vec();
    }
    let Ok(mut html) = String::from_utf8(body.to_vec()) else {
        return body.to_vec();
    };

    if cfg.remove_wayback_toolbar {
        html = remove_toolbar(&html);
    }
    if cfg.remove_wayback_scripts {
        html = remove_wayback_scripts(&html);
    }
    if cfg.fix_base_tags {
        html = fix_base_tags(&html, archive_date);
    }
    if cfg.fix_asset_urls {
        html = fix_asset_urls(&html);
    }
    if cfg.normalize_links {
        html = normalize_links(&html);
    }
    html.into_bytes()
}

/// Deletes the region delimited by the toolbar markers, inclusive,
/// dot-matches-newline.
fn remove_toolbar(html: &str) -> String {
    let mut result = String::with_capacity(html.len());
    let mut rest = html;
    loop {
        match rest.find(TOOLBAR_BEGIN) {
            Some(start) => {
                result.push_str(&rest[..start]);
                let after_begin = &rest[start..];
                match after_begin.find(TOOLBAR_END) {
                    Some(end) => {
                        let end_abs = end + TOOLBAR_END.len();
                        rest = &after_begin[end_abs..];
                    }
                    None => {
                        // no matching end marker; drop the rest to stay safe
                        rest = "";
                        break;
                    }
                }
            }
            None => {
                result.push_str(rest);
                rest = "";
                break;
            }
        }
    }
    let _ = rest;
    result
}

/// Deletes `<script ...src="...<archive>/_static/js/...">...</script>` spans.
fn remove_wayback_scripts(html: &str) -> String {
    let mut result = String::with_capacity(html.len());
    let mut rest = html;
    loop {
        match rest.find("<script") {
            Some(start) => {
                let tag_end = match rest[start..].find('>') {
                    Some(rel) => start + rel + 1,
                    None => {
                        result.push_str(rest);
                        rest = "";
                        break;
                    }
                };
                let opening_tag = &rest[start..tag_end];
                if !opening_tag.contains("/_static/js/") {
                    result.push_str(&rest[..tag_end]);
                    rest = &rest[tag_end..];
                    continue;
                }
                match rest[tag_end..].find("</script>") {
                    Some(rel) => {
                        result.push_str(&rest[..start]);
                        let close_end = tag_end + rel + "</script>".len();
                        rest = &rest[close_end..];
                    }
                    None => {
                        result.push_str(&rest[..start]);
                        rest = "";
                        break;
                    }
                }
            }
            None => {
                result.push_str(rest);
                rest = "";
                break;
            }
        }
    }
    let _ = rest;
    result
}

/// Rewrites `<base href="...web.archive.org/web/{date}/...">` to point at
/// the original origin.
fn fix_base_tags(html: &str, _archive_date: &str) -> String {
    let marker = "web.archive.org/web/";
    let mut result = String::with_capacity(html.len());
    let mut rest = html;
    loop {
        match rest.find("<base") {
            Some(start) => {
                let tag_end = match rest[start..].find('>') {
                    Some(rel) => start + rel + 1,
                    None => {
                        result.push_str(rest);
                        rest = "";
                        break;
                    }
                };
                let tag = &rest[start..tag_end];
                result.push_str(&rest[..start]);
                result.push_str(&strip_archive_prefix_in_tag(tag, marker));
                rest = &rest[tag_end..];
            }
            None => {
                result.push_str(rest);
                rest = "";
                break;
            }
        }
    }
    let _ = rest;
    result
}

fn strip_archive_prefix_in_tag(tag: &str, marker: &str) -> String {
    if let Some(marker_pos) = tag.find(marker) {
        let after_marker = &tag[marker_pos + marker.len()..];
        // after_marker looks like "{date}[a-z_]*/{url}..."
        if let Some(slash) = after_marker.find('/') {
            let date_and_mods = &after_marker[..slash];
            if date_and_mods.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                let remainder = &after_marker[slash + 1..];
                let before_scheme = find_scheme_start(tag, marker_pos);
                return format!("{}{}", &tag[..before_scheme], remainder);
            }
        }
    }
    tag.to_string()
}

fn find_scheme_start(tag: &str, marker_pos: usize) -> usize {
    let prefixes = ["https://", "http://"];
    for p in prefixes {
        if marker_pos >= p.len() && tag[marker_pos - p.len()..marker_pos] == *p {
            return marker_pos - p.len();
        }
    }
    marker_pos
}

/// Collapses `/web/\d+[a-z_]*/{originalURL}` to `{originalURL}` anywhere it
/// appears.
fn fix_asset_urls(html: &str) -> String {
    collapse_web_prefix(html, false)
}

/// Strips `https?://web.archive.org/web/\d+/` prefixes anywhere they
/// appear.
fn normalize_links(html: &str) -> String {
    collapse_web_prefix(html, true)
}

fn collapse_web_prefix(html: &str, require_host: bool) -> String {
    let needle = "/web/";
    let mut result = String::with_capacity(html.len());
    let mut rest = html;
    loop {
        match rest.find(needle) {
            Some(pos) => {
                let after = &rest[pos + needle.len()..];
                let digits: String = after.chars().take_while(|c| c.is_ascii_digit()).collect();
                if digits.is_empty() {
                    result.push_str(&rest[..pos + needle.len()]);
                    rest = after;
                    continue;
                }
                let after_digits = &after[digits.len()..];
                let mods_len = after_digits
                    .chars()
                    .take_while(|c| c.is_ascii_lowercase() || *c == '_')
                    .count();
                let after_mods = &after_digits[mods_len..];
                if let Some(rest_after_slash) = after_mods.strip_prefix('/') {
                    // `fix_asset_urls` (require_host = false) is the narrower
                    // of the two steps: it only ever collapses the bare
                    // `/web/{date}{mods}/` span, never reaching back across a
                    // preceding scheme+host. Consuming that host is exclusively
                    // `normalize_links`'s job.
                    let host_start = if require_host {
                        find_host_prefix_start(rest, pos)
                    } else {
                        pos
                    };
                    if require_host && host_start == pos {
                        result.push_str(&rest[..pos + needle.len()]);
                        rest = after;
                        continue;
                    }
                    result.push_str(&rest[..host_start]);
                    rest = rest_after_slash;
                } else {
                    result.push_str(&rest[..pos + needle.len()]);
                    rest = after;
                }
            }
            None => {
                result.push_str(rest);
                rest = "";
                break;
            }
        }
    }
    let _ = rest;
    result
}

fn find_host_prefix_start(html: &str, web_pos: usize) -> usize {
    let host = "web.archive.org";
    let candidate_start = web_pos.saturating_sub(host.len());
    if web_pos >= host.len() && &html[candidate_start..web_pos] == host {
        let schemes = ["https://", "http://"];
        for scheme in schemes {
            let scheme_start = candidate_start.saturating_sub(scheme.len());
            if candidate_start >= scheme.len() && &html[scheme_start..candidate_start] == scheme {
                return scheme_start;
            }
        }
        return candidate_start;
    }
    web_pos
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_toolbar_region_inclusive() {
        let html = "before<!-- BEGIN WAYBACK TOOLBAR INSERT -->junk\nmore junk<!-- END WAYBACK TOOLBAR INSERT -->after";
        assert_eq!(remove_toolbar(html), "beforeafter");
    }

    #[test]
    fn removes_wayback_script_spans() {
        let html = r#"<p>keep</p><script src="https://web.archive.org/_static/js/foo.js">var x=1;</script><p>keep2</p>"#;
        let out = remove_wayback_scripts(html);
        assert_eq!(out, "<p>keep</p><p>keep2</p>");
    }

    #[test]
    fn keeps_non_wayback_scripts() {
        let html = r#"<script src="/app.js"></script>"#;
        assert_eq!(remove_wayback_scripts(html), html);
    }

    #[test]
    fn fixes_base_tag_to_original_origin() {
        let html = r#"<html><base href="https://web.archive.org/web/20010915000000/http://foo.test/"></html>"#;
        let out = fix_base_tags(html, "20010915");
        assert_eq!(out, r#"<html><base href="http://foo.test/"></html>"#);
    }

    #[test]
    fn collapses_asset_url_archive_prefix() {
        let html = r#"<img src="/web/20010915im_/http://foo.test/logo.png">"#;
        let out = fix_asset_urls(html);
        assert_eq!(out, r#"<img src="http://foo.test/logo.png">"#);
    }

    #[test]
    fn normalizes_link_targets_stripping_full_archive_prefix() {
        let html = r#"<a href="https://web.archive.org/web/20010915/http://foo.test/page">link</a>"#;
        let out = normalize_links(html);
        assert_eq!(out, r#"<a href="http://foo.test/page">link</a>"#);
    }

    #[test]
    fn fix_asset_urls_alone_leaves_the_host_prefix_untouched() {
        // fix_asset_urls is the narrower step: with normalize_links off it
        // must never reach back across a scheme+host to strip it — that
        // span collapsing is normalize_links's job alone.
        let html = r#"<img src="https://web.archive.org/web/20010915im_/http://foo.test/logo.png">"#;
        let out = fix_asset_urls(html);
        assert_eq!(out, r#"<img src="https://web.archive.orghttp://foo.test/logo.png">"#);
    }

    #[test]
    fn transform_pipeline_is_idempotent() {
        let mut cfg = Config::default();
        cfg.remove_wayback_toolbar = true;
        cfg.remove_wayback_scripts = true;
        cfg.fix_base_tags = true;
        cfg.fix_asset_urls = true;
        cfg.normalize_links = true;

        let html = r#"<html><base href="https://web.archive.org/web/20010915000000/http://foo.test/">
<!-- BEGIN WAYBACK TOOLBAR INSERT -->toolbar<!-- END WAYBACK TOOLBAR INSERT -->
<img src="/web/20010915im_/http://foo.test/logo.png">
<a href="https://web.archive.org/web/20010915/http://foo.test/page">link</a>
</html>"#;

        let once = transform(&cfg, "text/html", html.as_bytes(), "20010915");
        let twice = transform(&cfg, "text/html", &once, "20010915");
        assert_eq!(once, twice);
    }

    #[test]
    fn non_html_passes_through_unchanged() {
        let cfg = Config::default();
        let bytes = vec![0u8, 1, 2, 255];
        let out = transform(&cfg, "image/png", &bytes, "20010915");
        assert_eq!(out, bytes);
    }
}
