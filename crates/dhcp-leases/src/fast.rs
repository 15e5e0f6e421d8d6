//! Regex-driven lease parser.
//!
//! Quoted strings and comments are scrubbed first so that neither can fake a stanza
//! boundary, then flat `lease|host <key> { ... }` blocks are picked out with a single
//! pattern. Nested blocks inside a lease or host are not supported; dhcpd never writes them.

use crate::model::{normalise_key, Expiry, LeaseRecord, StanzaKind};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static SCRUB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)"(?:[^"\\]|\\.)*"?|#[^\n]*"#).unwrap_or_else(|e| panic!("scrub regex: {e}"))
});

static STANZA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b(lease|host)\s+([^\s{};#"]+)\s*\{([^{}]*)\}"#)
        .unwrap_or_else(|e| panic!("stanza regex: {e}"))
});

static HARDWARE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^hardware\s+ethernet\s+([^\s"]+)$"#)
        .unwrap_or_else(|e| panic!("hardware regex: {e}"))
});

static FIXED_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^fixed-address6?\s+([^\s"]+)$"#)
        .unwrap_or_else(|e| panic!("fixed-address regex: {e}"))
});

static ENDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^ends(?:\s+(.*))?$").unwrap_or_else(|e| panic!("ends regex: {e}"))
});

/// Replaces every string literal with `""` and drops every comment.
fn scrub(text: &str) -> String {
    SCRUB
        .replace_all(text, |caps: &regex::Captures<'_>| {
            if caps[0].starts_with('"') { "\"\"" } else { "" }
        })
        .into_owned()
}

/// A stanza keyword only counts at the start of a declaration.
fn at_declaration_start(text: &str, offset: usize) -> bool {
    match text.as_bytes()[..offset].last() {
        None => true,
        Some(b) => b.is_ascii_whitespace() || matches!(b, b';' | b'}' | b'"'),
    }
}

struct Fields<'a> {
    mac: Option<&'a str>,
    ip: Option<&'a str>,
    ends: Option<Expiry>,
    deleted: bool,
}

fn fields(body: &str) -> Fields<'_> {
    let mut out = Fields {
        mac: None,
        ip: None,
        ends: None,
        deleted: false,
    };
    let mut statements: Vec<&str> = body.split(';').collect();
    // Whatever follows the last `;` is unterminated.
    statements.pop();
    for statement in statements.into_iter().map(str::trim) {
        if let Some(caps) = HARDWARE.captures(statement) {
            out.mac = caps.get(1).map(|m| m.as_str());
        } else if let Some(caps) = FIXED_ADDRESS.captures(statement) {
            out.ip = caps.get(1).map(|m| m.as_str());
        } else if let Some(caps) = ENDS.captures(statement) {
            // Scrubbed strings are not part of the date.
            let value = caps.get(1).map(|m| m.as_str().replace("\"\"", " ")).unwrap_or_default();
            let words: Vec<&str> = value.split_whitespace().collect();
            out.ends = Expiry::parse(&words);
        } else if statement == "deleted" {
            out.deleted = true;
        }
    }
    out
}

/// Fast parse of `text` evaluated at `now`.
///
/// Resolves in a single forward pass: each host remembers its slot so that a later
/// rubout can tombstone it in place.
pub fn parse_leases_fast_at(text: &str, now: DateTime<Utc>) -> Vec<LeaseRecord> {
    let text = scrub(text);
    let mut slots: Vec<Option<LeaseRecord>> = Vec::new();
    let mut hosts: HashMap<String, Vec<usize>> = HashMap::new();

    for caps in STANZA.captures_iter(&text) {
        let (Some(whole), Some(keyword), Some(key), Some(body)) =
            (caps.get(0), caps.get(1), caps.get(2), caps.get(3))
        else {
            continue;
        };
        if !at_declaration_start(&text, whole.start()) {
            continue;
        }
        let key = key.as_str();
        let f = fields(body.as_str());
        let kind = match (keyword.as_str(), f.deleted) {
            ("lease", _) => StanzaKind::Lease,
            (_, true) => StanzaKind::Rubout,
            (_, false) => StanzaKind::Host,
        };

        match kind {
            StanzaKind::Lease => {
                let live = f.ends.is_none_or(|ends| ends.is_live_at(now));
                if let (true, Some(mac)) = (live, f.mac) {
                    slots.push(Some(LeaseRecord::new(key, mac)));
                }
            }
            StanzaKind::Host => {
                if let (Some(ip), Some(mac)) = (f.ip, f.mac) {
                    hosts.entry(normalise_key(key)).or_default().push(slots.len());
                    slots.push(Some(LeaseRecord::new(ip, mac)));
                }
            }
            StanzaKind::Rubout => {
                for idx in hosts.remove(&normalise_key(key)).unwrap_or_default() {
                    slots[idx] = None;
                }
            }
        }
    }

    slots.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrub_strings_and_comments() {
        assert_eq!(
            scrub("uid \"{x}#\"; # lease 1.2.3.4 { }\nnext"),
            "uid \"\"; \nnext"
        );
    }

    #[test]
    fn test_scrub_escaped_quote() {
        assert_eq!(scrub(r#"a "b\"c" d"#), r#"a "" d"#);
    }

    #[test]
    fn test_fields_ignores_unterminated_tail() {
        let f = fields(" hardware ethernet aa:bb:cc:dd:ee:ff; fixed-address 10.0.0.1 ");
        assert_eq!(f.mac, Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(f.ip, None);
    }

    #[test]
    fn test_quote_before_keyword_is_a_boundary() {
        let now = Utc::now();
        let records = parse_leases_fast_at(
            "option x \"y\"lease 10.0.0.1 { hardware ethernet aa:bb:cc:dd:ee:ff; }",
            now,
        );
        assert_eq!(records, vec![LeaseRecord::new("10.0.0.1", "aa:bb:cc:dd:ee:ff")]);
    }

    #[test]
    fn test_keyword_inside_word_is_not_a_stanza() {
        let now = Utc::now();
        assert!(parse_leases_fast_at("x-lease 10.0.0.1 { hardware ethernet a; }", now).is_empty());
    }
}
