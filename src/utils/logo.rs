//! Logo source trust
//!
//! Playlists frequently list the same channel several times with logos from
//! different hosts. Logos served from a small set of well-known asset hosts
//! are preferred over whatever was seen first.

use super::url::UrlUtils;

/// Allow-list of asset hosts whose logos win a merge
#[derive(Debug, Clone, PartialEq)]
pub struct LogoTrust {
    trusted_hosts: Vec<String>,
}

impl LogoTrust {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            trusted_hosts: hosts
                .into_iter()
                .map(|h| h.into().trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }

    pub fn default_hosts() -> Vec<String> {
        vec![
            "gitee.com".to_string(),
            "github.com".to_string(),
            "githubusercontent.com".to_string(),
            "github.io".to_string(),
        ]
    }

    /// Whether the logo URL is served from a trusted host
    pub fn is_trusted(&self, logo_url: &str) -> bool {
        match UrlUtils::extract_host(logo_url) {
            Some(host) => self
                .trusted_hosts
                .iter()
                .any(|domain| UrlUtils::host_matches(&host, domain)),
            None => false,
        }
    }

    /// Decide whether `incoming` replaces `existing` during a merge
    ///
    /// An empty existing logo is always replaced. Otherwise the incoming logo
    /// must be trusted while the existing one is not.
    pub fn should_replace(&self, existing: &str, incoming: &str) -> bool {
        if incoming.trim().is_empty() {
            return false;
        }
        if existing.trim().is_empty() {
            return true;
        }
        self.is_trusted(incoming) && !self.is_trusted(existing)
    }
}

impl Default for LogoTrust {
    fn default() -> Self {
        Self::new(Self::default_hosts())
    }
}
