//! Feed parsing pipeline.
//!
//! Raw feed text goes through format detection, then the Atom or RSS 2.0
//! extractor, which produces a bounded list of [`NewsEntry`] values with
//! HTML stripped from the free-text fields. Nothing in here holds state;
//! storage and scheduling belong to the caller.

pub mod format;
pub mod parser;
pub mod sanitize;
pub mod source;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use format::{classify, FeedFormat};
pub use parser::{parse_atom, parse_rss2};
pub use sanitize::strip_html;
pub use source::{derive_id, is_valid_url, FeedSource};

/// Number of entries kept per feed unless configured otherwise.
pub const DEFAULT_MAX_ENTRIES: usize = 80;

/// Errors produced while turning a feed URL into entries.
///
/// None of these are retried. A failure only concerns one fetch of one feed.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Transport error, non-2xx status or a body that is not UTF-8
    #[error("fetch failed: {0}")]
    FetchFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The body is not well-formed XML
    #[error("malformed XML: {0}")]
    MalformedXml(#[from] roxmltree::Error),
    /// Well-formed, but neither Atom nor RSS 2.0
    #[error("data is not in Atom or RSS 2.0 format")]
    UnrecognizedFormat,
    /// RSS document without a channel element
    #[error("RSS document has no channel element")]
    MissingChannel,
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        FeedError::FetchFailed(Box::new(err))
    }
}

impl From<std::string::FromUtf8Error> for FeedError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        FeedError::FetchFailed(Box::new(err))
    }
}

/// One article of a feed, normalized across formats.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsEntry {
    pub title: String,
    pub summary: String,
    pub link: String,
    pub published: String,
    pub updated: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOptions {
    pub strip_html: bool,
    pub max_entries: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            strip_html: true,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

/// Detects the feed format and runs the matching extractor.
pub fn parse_news(raw: &str, options: &ParseOptions) -> Result<Vec<NewsEntry>, FeedError> {
    match classify(raw) {
        FeedFormat::Atom => parse_atom(raw, options.strip_html, options.max_entries),
        FeedFormat::Rss2 => parse_rss2(raw, options.strip_html, options.max_entries),
        FeedFormat::Unrecognized => Err(FeedError::UnrecognizedFormat),
    }
}
