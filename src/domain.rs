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

//! Registrable-domain extraction and allowlist glob matching, per spec §3/§9.
//!
//! The spec's Open Questions explicitly flag that naive last-two-labels
//! domain extraction misclassifies multi-part public suffixes like
//! `.co.uk`. We take the naive approach anyway rather than pull in a public
//! suffix list dependency the corpus never uses — this is a known, accepted
//! limitation, not an oversight.

use url::Url;

/// Naive last-two-labels registrable domain, used to key the view counter.
/// `foo.bar.example.com` -> `example.com`; `example.com` -> `example.com`;
/// `localhost` -> `localhost`.
pub fn registrable_domain(url: &Url) -> String {
    let host = match url.host_str() {
        Some(h) => h,
        None => return String::new(),
    };
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        host.to_string()
    } else {
        labels[labels.len() - 2..].join(".")
    }
}

/// Glob match per spec §3: `*` matches a run of non-`/` characters, `**`
/// matches any run including `/`. Patterns are matched against the full
/// (normalized) URL string.
///
/// A leading `*` (the first token of the pattern) is unanchored — it has
/// no preceding literal fixing its position within the URL, so it is
/// allowed to span the scheme/host slashes the way `**` does. A `*` that
/// follows a literal stays confined to the current path segment.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let tokens = tokenize(pattern);
    match_tokens(&tokens, text, true)
}

#[derive(Debug, PartialEq, Eq)]
enum Token<'a> {
    Literal(&'a str),
    Star,
    DoubleStar,
}

fn tokenize(pattern: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let bytes = pattern.as_bytes();
    let mut i = 0;
    let mut lit_start = 0;
    while i < bytes.len() {
        if bytes[i] == b'*' {
            if lit_start < i {
                tokens.push(Token::Literal(&pattern[lit_start..i]));
            }
            if i + 1 < bytes.len() && bytes[i + 1] == b'*' {
                tokens.push(Token::DoubleStar);
                i += 2;
            } else {
                tokens.push(Token::Star);
                i += 1;
            }
            lit_start = i;
        } else {
            i += 1;
        }
    }
    if lit_start < bytes.len() {
        tokens.push(Token::Literal(&pattern[lit_start..]));
    }
    tokens
}

fn match_tokens(tokens: &[Token], text: &str, is_leading: bool) -> bool {
    match tokens.split_first() {
        None => text.is_empty(),
        Some((Token::Literal(lit), rest)) => match text.strip_prefix(lit) {
            Some(remainder) => match_tokens(rest, remainder, false),
            None => false,
        },
        Some((Token::Star, rest)) => {
            if is_leading {
                // No literal has anchored our position yet, so this star
                // may span any slash the same way `**` would.
                for idx in 0..=text.len() {
                    if text.is_char_boundary(idx) && match_tokens(rest, &text[idx..], false) {
                        return true;
                    }
                }
                false
            } else {
                let limit = text.find('/').unwrap_or(text.len());
                try_star(rest, text, limit)
            }
        }
        Some((Token::DoubleStar, rest)) => {
            for idx in 0..=text.len() {
                if text.is_char_boundary(idx) && match_tokens(rest, &text[idx..], false) {
                    return true;
                }
            }
            false
        }
    }
}

/// `*` may consume any prefix of `text` up to (not including) the first
/// `/`, trying shortest-to-longest.
fn try_star(rest: &[Token], text: &str, max_len: usize) -> bool {
    for idx in 0..=max_len {
        if !text.is_char_boundary(idx) {
            continue;
        }
        if text[..idx].contains('/') {
            break;
        }
        if match_tokens(rest, &text[idx..], false) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain_of(s: &str) -> String {
        registrable_domain(&Url::parse(s).unwrap())
    }

    #[test]
    fn registrable_domain_keeps_last_two_labels() {
        assert_eq!(domain_of("http://foo.bar.example.com/"), "example.com");
        assert_eq!(domain_of("http://example.com/"), "example.com");
    }

    #[test]
    fn registrable_domain_known_limitation_on_multipart_suffixes() {
        // Known, accepted limitation per spec §9: this misclassifies
        // `.co.uk`-style suffixes.
        assert_eq!(domain_of("http://example.co.uk/"), "co.uk");
    }

    #[test]
    fn star_does_not_cross_slash() {
        assert!(glob_match("http://example.com/*", "http://example.com/page"));
        assert!(!glob_match("http://example.com/*", "http://example.com/a/b"));
    }

    #[test]
    fn double_star_crosses_slash() {
        assert!(glob_match("http://example.com/**", "http://example.com/a/b/c"));
    }

    #[test]
    fn suffix_glob_matches_extension() {
        assert!(glob_match("*.art", "http://example.com/gallery.art"));
        assert!(!glob_match("*.art", "http://example.com/gallery.com"));
    }

    #[test]
    fn empty_allowlist_denies_everything() {
        let patterns: Vec<String> = Vec::new();
        assert!(!patterns.iter().any(|p| glob_match(p, "http://example.com/")));
    }
}
