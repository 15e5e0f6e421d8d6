//! Lease file data types shared by both parsers.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// One `(ip, mac)` pair extracted from a lease file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Dotted-quad or IPv6 address.
    pub ip: String,
    /// Lowercase, colon-separated.
    pub mac: String,
}

impl LeaseRecord {
    /// Creates a record from anything string-like.
    pub fn new(ip: impl Into<String>, mac: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            mac: mac.into(),
        }
    }
}

impl From<(&str, &str)> for LeaseRecord {
    fn from((ip, mac): (&str, &str)) -> Self {
        Self::new(ip, mac)
    }
}

/// What kind of declaration a stanza is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    /// `lease <ip> { ... }`
    Lease,
    /// `host <name> { ... }` without `deleted;`
    Host,
    /// `host <name> { ... deleted; }`
    Rubout,
}

/// One `lease` or `host` block, before shadowing is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStanza {
    /// Lease, host or rubout.
    pub kind: StanzaKind,
    /// IP for leases, the declared name (a MAC or an IP) for hosts and rubouts.
    pub key: String,
    /// `fixed-address`, hosts only.
    pub fixed_address: Option<String>,
    /// `hardware ethernet`, lowercased.
    pub hardware_mac: Option<String>,
    /// `ends`; `None` when absent or not a date.
    pub ends: Option<Expiry>,
}

impl ParsedStanza {
    /// A stanza without an `ends` statement never expires.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.ends.is_none_or(|ends| ends.is_live_at(now))
    }
}

/// Value of an `ends` statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Never,
    At(DateTime<Utc>),
}

impl Expiry {
    /// Interprets the words following `ends`.
    ///
    /// Accepts `never`, `epoch <seconds>` and `<weekday> <yyyy/mm/dd> <hh:mm:ss>` (UTC).
    /// Anything else yields `None`, which both parsers treat as "no expiry given".
    pub fn parse(words: &[&str]) -> Option<Self> {
        match words {
            ["never"] => Some(Self::Never),
            ["epoch", seconds] => seconds
                .parse::<i64>()
                .ok()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                .map(Self::At),
            [weekday, date, time] if weekday.bytes().all(|b| b.is_ascii_digit()) => {
                NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y/%m/%d %H:%M:%S")
                    .ok()
                    .map(|naive| Self::At(naive.and_utc()))
            }
            _ => None,
        }
    }

    /// `never` is always live; a timestamp is live only when strictly after `now`.
    pub fn is_live_at(self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Never => true,
            Self::At(at) => at > now,
        }
    }
}

/// Host keys are MACs or IPs; rubouts match them regardless of hex case.
pub(crate) fn normalise_key(key: &str) -> String {
    key.to_ascii_lowercase()
}
