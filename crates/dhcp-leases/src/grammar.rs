//! Grammar-driven lease parser.
//!
//! The input is lexed into words, quoted strings and the punctuation `{`, `}` and `;`,
//! with `#` comments discarded. Top-level declarations are then walked one at a time:
//! `lease <ip> { ... }` and `host <name> { ... }` become [`ParsedStanza`]s, every other
//! declaration (server-duid, failover blocks, stray garbage) is skipped. A stanza whose
//! block never closes contributes nothing; the walk resumes at the next stanza keyword, so
//! a half-written stanza does not hide the ones after it.
//!
//! This is the authoritative implementation; [`crate::fast`] must agree with it.

use crate::model::{normalise_key, Expiry, LeaseRecord, ParsedStanza, StanzaKind};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    Word(&'a str),
    Quoted(&'a str),
    Open,
    Close,
    Semicolon,
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn is_word_byte(b: u8) -> bool {
        !(b.is_ascii_whitespace() || matches!(b, b'{' | b'}' | b';' | b'#' | b'"'))
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        let bytes = self.src.as_bytes();
        loop {
            let b = *bytes.get(self.pos)?;
            match b {
                b if b.is_ascii_whitespace() => self.pos += 1,
                b'#' => {
                    self.pos = match self.src[self.pos..].find('\n') {
                        Some(offset) => self.pos + offset + 1,
                        None => bytes.len(),
                    };
                }
                b'{' => {
                    self.pos += 1;
                    return Some(Token::Open);
                }
                b'}' => {
                    self.pos += 1;
                    return Some(Token::Close);
                }
                b';' => {
                    self.pos += 1;
                    return Some(Token::Semicolon);
                }
                b'"' => {
                    let start = self.pos + 1;
                    let mut i = start;
                    while i < bytes.len() && bytes[i] != b'"' {
                        if bytes[i] == b'\\' {
                            i += 1;
                        }
                        i += 1;
                    }
                    let end = i.min(bytes.len());
                    self.pos = (i + 1).min(bytes.len());
                    return Some(Token::Quoted(&self.src[start..end]));
                }
                _ => {
                    let start = self.pos;
                    while self.pos < bytes.len() && Self::is_word_byte(bytes[self.pos]) {
                        self.pos += 1;
                    }
                    return Some(Token::Word(&self.src[start..self.pos]));
                }
            }
        }
    }
}

/// Returns the stanza kind and key when `tokens[i..]` opens a lease or host block.
fn stanza_start<'a>(tokens: &[Token<'a>], i: usize) -> Option<(StanzaKind, &'a str)> {
    match tokens.get(i..i + 3)? {
        [Token::Word("lease"), Token::Word(key), Token::Open] => Some((StanzaKind::Lease, *key)),
        [Token::Word("host"), Token::Word(key), Token::Open] => Some((StanzaKind::Host, *key)),
        _ => None,
    }
}

/// Index of the `}` closing the block whose body starts at `start`.
fn block_end(tokens: &[Token<'_>], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (offset, token) in tokens[start..].iter().enumerate() {
        match token {
            Token::Open => depth += 1,
            Token::Close if depth == 0 => return Some(start + offset),
            Token::Close => depth -= 1,
            _ => {}
        }
    }
    None
}

/// Skips one uninteresting top-level declaration, returning the index after it.
fn skip_declaration(tokens: &[Token<'_>], i: usize) -> usize {
    let mut j = i;
    while j < tokens.len() {
        if j > i && stanza_start(tokens, j).is_some() {
            return j;
        }
        match tokens[j] {
            Token::Semicolon | Token::Close => return j + 1,
            Token::Open => {
                return block_end(tokens, j + 1).map_or(tokens.len(), |end| end + 1);
            }
            _ => j += 1,
        }
    }
    tokens.len()
}

/// Index of the first stanza opening at or after `from`, or the end of the input.
fn next_stanza_start(tokens: &[Token<'_>], from: usize) -> usize {
    (from..tokens.len())
        .find(|&j| stanza_start(tokens, j).is_some())
        .unwrap_or(tokens.len())
}

/// Splits a block body into `;`-terminated statements, skipping nested blocks.
/// A trailing statement without its `;` is ignored.
fn statements<'t, 'a>(body: &'t [Token<'a>]) -> Vec<&'t [Token<'a>]> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < body.len() {
        match body[i] {
            Token::Semicolon => {
                out.push(&body[start..i]);
                start = i + 1;
                i += 1;
            }
            Token::Open => {
                i = block_end(body, i + 1).map_or(body.len(), |end| end + 1);
                start = i;
            }
            _ => i += 1,
        }
    }
    out
}

fn build_stanza(kind: StanzaKind, key: &str, body: &[Token<'_>]) -> ParsedStanza {
    let mut stanza = ParsedStanza {
        kind,
        key: key.to_string(),
        fixed_address: None,
        hardware_mac: None,
        ends: None,
    };
    let mut deleted = false;
    for statement in statements(body) {
        match statement {
            [Token::Word("hardware"), Token::Word("ethernet"), Token::Word(mac)] => {
                stanza.hardware_mac = Some((*mac).to_string());
            }
            [Token::Word("fixed-address" | "fixed-address6"), Token::Word(ip)] => {
                stanza.fixed_address = Some((*ip).to_string());
            }
            [Token::Word("ends"), rest @ ..] => {
                let words: Vec<&str> = rest
                    .iter()
                    .filter_map(|token| match token {
                        Token::Word(word) => Some(*word),
                        _ => None,
                    })
                    .collect();
                stanza.ends = Expiry::parse(&words);
            }
            [Token::Word("deleted")] => deleted = true,
            _ => {}
        }
    }
    if deleted && kind == StanzaKind::Host {
        stanza.kind = StanzaKind::Rubout;
    }
    stanza
}

/// Parses every complete `lease` and `host` stanza, in file order.
pub fn parse_stanzas(text: &str) -> Vec<ParsedStanza> {
    let tokens: Vec<Token<'_>> = Lexer::new(text).collect();
    let mut stanzas = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let Some((kind, key)) = stanza_start(&tokens, i) else {
            i = skip_declaration(&tokens, i);
            continue;
        };
        let body_start = i + 3;
        let Some(end) = block_end(&tokens, body_start) else {
            i = next_stanza_start(&tokens, i + 1);
            continue;
        };
        stanzas.push(build_stanza(kind, key, &tokens[body_start..end]));
        i = end + 1;
    }
    stanzas
}

/// Folds stanzas into `(ip, mac)` records.
///
/// Walks backwards so that a rubout is seen before the hosts it cancels.
pub fn resolve(stanzas: &[ParsedStanza], now: DateTime<Utc>) -> Vec<LeaseRecord> {
    let mut rubbed_out = HashSet::new();
    let mut records = Vec::new();
    for stanza in stanzas.iter().rev() {
        match stanza.kind {
            StanzaKind::Rubout => {
                rubbed_out.insert(normalise_key(&stanza.key));
            }
            StanzaKind::Host => {
                if rubbed_out.contains(&normalise_key(&stanza.key)) {
                    continue;
                }
                if let (Some(ip), Some(mac)) = (&stanza.fixed_address, &stanza.hardware_mac) {
                    records.push(LeaseRecord::new(ip.as_str(), mac.as_str()));
                }
            }
            StanzaKind::Lease => {
                if !stanza.is_live_at(now) {
                    continue;
                }
                if let Some(mac) = &stanza.hardware_mac {
                    records.push(LeaseRecord::new(stanza.key.as_str(), mac.as_str()));
                }
            }
        }
    }
    records.reverse();
    records
}

/// Grammar parse of `text` evaluated at `now`.
pub fn parse_leases_at(text: &str, now: DateTime<Utc>) -> Vec<LeaseRecord> {
    resolve(&parse_stanzas(text), now)
}
