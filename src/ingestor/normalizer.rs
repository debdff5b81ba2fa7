//! Entry normalization and same-name channel merging
//!
//! Every parsed [`Entry`] becomes exactly one [`Stream`]. Entries sharing a
//! trimmed display name fold into one [`Channel`] whose identity comes from
//! the first entry of the group.

use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::models::{tag, Channel, Entry, Stream};
use crate::utils::logo::LogoTrust;
use crate::utils::truncate_chars;

const SLUG_MAX_CHARS: usize = 20;

/// Output of a normalization pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Normalized {
    /// First-seen order of merge groups
    pub channels: Vec<Channel>,
    /// Original entry order
    pub streams: Vec<Stream>,
}

#[derive(Debug, Clone, Default)]
pub struct EntryNormalizer {
    logo_trust: LogoTrust,
}

impl EntryNormalizer {
    pub fn new(logo_trust: LogoTrust) -> Self {
        Self { logo_trust }
    }

    pub fn normalize(&self, entries: &[Entry]) -> Normalized {
        let mut channels: Vec<Channel> = Vec::new();
        let mut streams = Vec::with_capacity(entries.len());
        // merge key -> position in `channels`
        let mut groups: HashMap<String, usize> = HashMap::new();
        let mut empty_names = 0usize;

        for (index, entry) in entries.iter().enumerate() {
            let merge_key = entry.name.trim().to_string();
            if merge_key.is_empty() {
                empty_names += 1;
            }

            let position = match groups.get(&merge_key) {
                Some(&position) => {
                    self.merge_into(&mut channels[position], entry);
                    position
                }
                None => {
                    channels.push(new_channel(index, &merge_key, entry));
                    groups.insert(merge_key, channels.len() - 1);
                    channels.len() - 1
                }
            };

            streams.push(Stream {
                channel_id: channels[position].id.clone(),
                url: entry.url.clone(),
                http_referrer: entry.tag(tag::REFERRER).map(str::to_string),
                user_agent: entry.tag(tag::USER_AGENT).map(str::to_string),
            });
        }

        if empty_names > 0 {
            debug!("{} entries had an empty display name", empty_names);
        }
        debug!(
            "Normalized {} entries into {} channels",
            streams.len(),
            channels.len()
        );

        Normalized { channels, streams }
    }

    fn merge_into(&self, channel: &mut Channel, entry: &Entry) {
        channel.categories.extend(entry.categories());
        if let Some(alt) = entry.tag(tag::TVG_NAME) {
            channel.alternate_names.insert(alt.to_string());
        }
        if let Some(language) = entry.tag(tag::LANGUAGE) {
            channel.languages.insert(language.to_string());
        }
        if channel.tvg_id.is_none() {
            channel.tvg_id = entry.tag(tag::TVG_ID).map(str::to_string);
        }
        if channel.country.is_none() {
            channel.country = entry.tag(tag::COUNTRY).map(str::to_string);
        }
        if let Some(logo) = entry.tag(tag::TVG_LOGO) {
            if self.logo_trust.should_replace(&channel.logo_url, logo) {
                channel.logo_url = logo.to_string();
            }
        }
    }
}

/// Normalize with the default logo trust list
pub fn normalize(entries: &[Entry]) -> Normalized {
    EntryNormalizer::default().normalize(entries)
}

fn new_channel(index: usize, name: &str, entry: &Entry) -> Channel {
    Channel {
        id: channel_id(index, name, &entry.url),
        name: name.to_string(),
        alternate_names: entry
            .tag(tag::TVG_NAME)
            .map(|n| BTreeSet::from([n.to_string()]))
            .unwrap_or_default(),
        categories: entry.categories().into_iter().collect(),
        logo_url: entry.tag(tag::TVG_LOGO).unwrap_or_default().to_string(),
        tvg_id: entry.tag(tag::TVG_ID).map(str::to_string),
        country: entry.tag(tag::COUNTRY).map(str::to_string),
        languages: entry
            .tag(tag::LANGUAGE)
            .map(|l| BTreeSet::from([l.to_string()]))
            .unwrap_or_default(),
    }
}

/// Deterministic channel id: `ch_{index}_{slug}_{hash8}`
///
/// The entry index keeps ids unique even when names collide before merging.
pub fn channel_id(index: usize, name: &str, url: &str) -> String {
    format!("ch_{}_{}_{}", index, slugify(name), url_hash(url))
}

/// First 8 hex digits of the SHA-256 of the URL
pub fn url_hash(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let hex = format!("{:x}", digest);
    hex[..8].to_string()
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_was_sep = false;
    for ch in name.trim().chars() {
        if ch.is_alphanumeric() {
            slug.push(ch);
            last_was_sep = false;
        } else if !last_was_sep {
            slug.push('_');
            last_was_sep = true;
        }
    }
    truncate_chars(slug.trim_matches('_'), SLUG_MAX_CHARS).to_string()
}
