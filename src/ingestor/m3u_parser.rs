//! Extended M3U playlist parser
//!
//! Turns raw playlist text into flat [`Entry`] records in a single linear
//! pass. A `#EXTINF` metadata line opens a record and the next non-comment
//! line closes it with the stream URL:
//!
//! ```text
//! #EXTM3U
//! #EXTINF:-1 tvg-id="cctv1" tvg-logo="http://logo/cctv1.png" group-title="News",CCTV-1
//! #EXTVLCOPT:http-user-agent=Mozilla/5.0
//! http://live.example.com/cctv1/index.m3u8
//! ```
//!
//! Malformed input never fails the parse. Records without a URL and URLs
//! without a record are dropped and only counted in [`ParseStats`].

use std::collections::BTreeMap;
use tracing::{debug, trace};

use crate::models::{tag, Entry};

const EXTINF_PREFIX: &str = "#EXTINF:";
const EXTVLCOPT_PREFIX: &str = "#EXTVLCOPT:";
const HEADER_PREFIX: &str = "#EXTM3U";

/// Counters for input the parser recovered from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub entries: usize,
    /// Metadata records that never received a URL line
    pub dropped_records: usize,
    /// Non-comment lines that did not follow a metadata record
    pub orphan_lines: usize,
}

/// Metadata line waiting for its URL
#[derive(Debug)]
struct PendingRecord {
    name: String,
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct M3uParser;

impl M3uParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, content: &str) -> Vec<Entry> {
        self.parse_with_stats(content).0
    }

    pub fn parse_with_stats(&self, content: &str) -> (Vec<Entry>, ParseStats) {
        let mut entries = Vec::new();
        let mut stats = ParseStats::default();
        let mut pending: Option<PendingRecord> = None;

        for (line_num, raw_line) in content.lines().enumerate() {
            let line = raw_line.trim();

            if line.is_empty() || starts_with_ignore_case(line, HEADER_PREFIX) {
                continue;
            }

            if starts_with_ignore_case(line, EXTINF_PREFIX) {
                if pending.is_some() {
                    trace!("Dropping metadata record without URL before line {}", line_num + 1);
                    stats.dropped_records += 1;
                }
                pending = Some(parse_extinf_line(&line[EXTINF_PREFIX.len()..]));
            } else if starts_with_ignore_case(line, EXTVLCOPT_PREFIX) {
                if let Some(record) = pending.as_mut() {
                    apply_vlc_option(&line[EXTVLCOPT_PREFIX.len()..], &mut record.tags);
                }
            } else if line.starts_with('#') {
                continue;
            } else if let Some(record) = pending.take() {
                entries.push(Entry {
                    name: record.name,
                    url: line.to_string(),
                    tags: record.tags,
                });
            } else {
                trace!("Ignoring line {} outside of a metadata record", line_num + 1);
                stats.orphan_lines += 1;
            }
        }

        if pending.is_some() {
            stats.dropped_records += 1;
        }
        stats.entries = entries.len();

        debug!(
            "Parsed {} entries ({} incomplete records dropped, {} orphan lines ignored)",
            stats.entries, stats.dropped_records, stats.orphan_lines
        );

        (entries, stats)
    }
}

/// Parse playlist text into entries, in file order
pub fn parse(content: &str) -> Vec<Entry> {
    M3uParser::new().parse(content)
}

fn starts_with_ignore_case(line: &str, prefix: &str) -> bool {
    line.len() >= prefix.len()
        && line.is_char_boundary(prefix.len())
        && line[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Parse everything after `#EXTINF:`
///
/// The display name is the text after the last comma on the line; the
/// attribute section is everything before it.
fn parse_extinf_line(body: &str) -> PendingRecord {
    let (attributes_part, display_name) = match body.rfind(',') {
        Some(comma_pos) => (&body[..comma_pos], body[comma_pos + 1..].trim()),
        None => (body, ""),
    };

    let mut tags = BTreeMap::new();
    for (key, value) in parse_attributes(skip_duration(attributes_part)) {
        tags.entry(canonical_key(&key)).or_insert(value);
    }

    let name = if display_name.is_empty() {
        tags.get(tag::TVG_NAME)
            .map(|n: &String| n.trim().to_string())
            .unwrap_or_default()
    } else {
        display_name.to_string()
    };

    PendingRecord { name, tags }
}

/// Skip the leading duration token (`-1`, `0`, `3.5`)
fn skip_duration(attributes: &str) -> &str {
    let trimmed = attributes.trim_start();
    let end = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '-' || c == '+' || c == '.'))
        .unwrap_or(trimmed.len());
    &trimmed[end..]
}

/// Scan `key="value"` pairs; unquoted values end at whitespace
fn parse_attributes(attributes: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let mut chars = attributes.chars().peekable();

    loop {
        while chars.peek().map_or(false, |c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&ch) = chars.peek() {
            if ch == '=' || ch.is_whitespace() {
                break;
            }
            key.push(ch);
            chars.next();
        }

        if chars.peek() != Some(&'=') {
            // bare word without a value
            continue;
        }
        chars.next();

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            for ch in chars.by_ref() {
                if ch == '"' {
                    break;
                }
                value.push(ch);
            }
        } else {
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() {
                    break;
                }
                value.push(ch);
                chars.next();
            }
        }

        if !key.is_empty() {
            attrs.push((key, value));
        }
    }

    attrs
}

/// Map a raw attribute key onto its canonical tag name
///
/// Keys are case-insensitive. Unknown keys are kept lowercased.
fn canonical_key(raw: &str) -> String {
    let key = raw.trim().to_ascii_lowercase();
    let canonical = match key.as_str() {
        "tvg-id" => tag::TVG_ID,
        "tvg-name" => tag::TVG_NAME,
        "tvg-logo" | "logo" => tag::TVG_LOGO,
        "group-title" => tag::GROUP_TITLE,
        "user-agent" | "http-user-agent" => tag::USER_AGENT,
        "referer" | "referrer" | "http-referer" | "http-referrer" => tag::REFERRER,
        "country" | "tvg-country" => tag::COUNTRY,
        "language" | "tvg-language" => tag::LANGUAGE,
        _ => return key,
    };
    canonical.to_string()
}

/// `#EXTVLCOPT:http-user-agent=...` style options; metadata attributes win
fn apply_vlc_option(option: &str, tags: &mut BTreeMap<String, String>) {
    let Some((key, value)) = option.split_once('=') else {
        return;
    };
    let canonical = canonical_key(key);
    if canonical == tag::USER_AGENT || canonical == tag::REFERRER {
        let value = value.trim().trim_matches('"');
        if !value.is_empty() {
            tags.entry(canonical).or_insert_with(|| value.to_string());
        }
    }
}
