use md5::{Digest, Md5};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static VALID_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(http://|https://)[a-z0-9]+([-.][a-z0-9]+)*\.[a-z]{2,5}(:[0-9]{1,5})?(/.*)?$")
        .expect("valid regex")
});

/// A subscribed feed as stored in `feeds.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSource {
    /// Cache key for the feed's entries, always `derive_id(url)`
    #[serde(rename = "fid", default)]
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub active: bool,
    /// Local time of the last fetch attempt
    #[serde(rename = "updated", default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl FeedSource {
    pub fn new(name: &str, url: &str, active: bool) -> Self {
        Self {
            id: derive_id(url),
            name: name.to_string(),
            url: url.to_string(),
            active,
            last_updated: None,
            last_error: None,
        }
    }

    /// The stored id, or the derived one when the record has none yet.
    pub fn feed_id(&self) -> String {
        if self.id.is_empty() {
            derive_id(&self.url)
        } else {
            self.id.clone()
        }
    }

    /// Changes the URL and recomputes the id. Returns the previous id when it
    /// changed, so the caller can move cached entries.
    pub fn set_url(&mut self, url: &str) -> Option<String> {
        self.url = url.to_string();
        let new_id = derive_id(url);
        if new_id == self.id {
            return None;
        }
        Some(std::mem::replace(&mut self.id, new_id))
    }
}

/// MD5 of the URL bytes as 32 lowercase hex characters. No normalization.
pub fn derive_id(url: &str) -> String {
    let digest = Md5::digest(url.as_bytes());
    format!("{:x}", digest)
}

pub fn is_valid_url(url: &str) -> bool {
    VALID_URL.is_match(url)
}
