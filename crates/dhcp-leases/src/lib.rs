//! ISC dhcpd lease file parser
//!
//! Turns the text of a `dhcpd.leases` file into the ordered `(ip, mac)` pairs it currently
//! asserts. Two implementations are provided and are expected to agree on every input:
//!
//! - [`parse_leases`]: lexes the file and walks its declarations. Authoritative.
//! - [`parse_leases_fast`]: scrubs strings and comments, then matches stanzas with regexes.
//!
//! Shadowing rules shared by both:
//!
//! - A lease is kept when its `ends` is absent, `never`, or strictly after "now".
//! - A host declaration behaves like a lease that never expires.
//! - A host with `deleted;` (a rubout) cancels earlier hosts declared under the same key.
//! - Records keep file order; [`leases_to_mapping`] lets the last one for an IP win.
//!
//! # Example
//!
//! ```
//! let text = "lease 10.0.0.5 { hardware ethernet 00:11:22:33:44:55; ends never; }";
//! let leases = dhcp_leases::parse_leases(text);
//! assert_eq!(leases, vec![dhcp_leases::LeaseRecord::new("10.0.0.5", "00:11:22:33:44:55")]);
//! ```

pub mod error;
pub mod fast;
pub mod grammar;
pub mod model;

pub use error::*;
pub use model::{Expiry, LeaseRecord, ParsedStanza, StanzaKind};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Parses lease text with the grammar parser, relative to the current time.
pub fn parse_leases(text: &str) -> Vec<LeaseRecord> {
    grammar::parse_leases_at(text, Utc::now())
}

/// Parses lease text with the grammar parser, relative to `now`.
pub fn parse_leases_at(text: &str, now: DateTime<Utc>) -> Vec<LeaseRecord> {
    grammar::parse_leases_at(text, now)
}

/// Parses lease text with the regex parser, relative to the current time.
pub fn parse_leases_fast(text: &str) -> Vec<LeaseRecord> {
    fast::parse_leases_fast_at(text, Utc::now())
}

/// Parses lease text with the regex parser, relative to `now`.
pub fn parse_leases_fast_at(text: &str, now: DateTime<Utc>) -> Vec<LeaseRecord> {
    fast::parse_leases_fast_at(text, now)
}

/// Folds records into an IP to MAC map; later records for the same IP win.
pub fn leases_to_mapping<'a, I>(records: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = &'a LeaseRecord>,
{
    records
        .into_iter()
        .map(|record| (record.ip.clone(), record.mac.clone()))
        .collect()
}

/// Reads and parses a lease file.
///
/// dhcpd rewrites the file in place, so a partial read is expected now and then; the
/// parser drops a truncated trailing stanza.
pub fn read_lease_file(path: impl AsRef<Path>) -> Result<Vec<LeaseRecord>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    let leases = parse_leases_fast(&text);
    debug!("Parsed {} lease records from {}", leases.len(), path.display());
    Ok(leases)
}

/// [`read_lease_file`] on the blocking pool.
pub async fn read_lease_file_async(path: impl AsRef<Path>) -> Result<Vec<LeaseRecord>> {
    let path = path.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || read_lease_file(path))
        .await
        .map_err(|e| LeaseError::Join(e.to_string()))?
}
