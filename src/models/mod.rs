use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub mod validation;

pub use validation::{ValidationReport, ValidationResult, ValidationStatus};

/// Canonical tag names recorded on an [`Entry`]
///
/// The parser folds the various spellings found in the wild onto these keys.
pub mod tag {
    pub const TVG_ID: &str = "tvg-id";
    pub const TVG_NAME: &str = "tvg-name";
    pub const TVG_LOGO: &str = "tvg-logo";
    pub const GROUP_TITLE: &str = "group-title";
    pub const USER_AGENT: &str = "user-agent";
    pub const REFERRER: &str = "referrer";
    pub const COUNTRY: &str = "country";
    pub const LANGUAGE: &str = "language";
}

/// One (metadata, url) record straight out of the playlist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    pub url: String,
    pub tags: BTreeMap<String, String>, // canonical key -> raw value
}

impl Entry {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.tags.insert(key.to_string(), value.into());
        self
    }

    /// Non-empty tag value, if present
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Category labels carried by the group tag (`;` separates several)
    pub fn categories(&self) -> Vec<String> {
        self.tag(tag::GROUP_TITLE)
            .map(|group| {
                group
                    .split(';')
                    .map(str::trim)
                    .filter(|g| !g.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Merged logical channel, unique by trimmed display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub alternate_names: BTreeSet<String>,
    pub categories: BTreeSet<String>,
    pub logo_url: String, // empty when no logo is known
    pub tvg_id: Option<String>,
    pub country: Option<String>,
    pub languages: BTreeSet<String>,
}

impl Channel {
    pub fn has_logo(&self) -> bool {
        !self.logo_url.trim().is_empty()
    }

    pub fn is_hd(&self) -> bool {
        let name = self.name.to_lowercase();
        name.contains("hd") || name.contains("高清")
    }

    pub fn is_4k(&self) -> bool {
        let name = self.name.to_lowercase();
        name.contains("4k") || name.contains("超清")
    }
}

/// One concrete playable source for a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    pub channel_id: String,
    pub url: String,
    pub http_referrer: Option<String>,
    pub user_agent: Option<String>,
}
