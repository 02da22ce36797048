use once_cell::sync::Lazy;
use regex::Regex;

// Matched against the raw text so that documents with broken markup further
// down are still classified.
static ATOM_ROOT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<feed\s[^>]*xmlns=["']http://www\.w3\.org/2005/Atom"#).expect("valid regex")
});
static RSS_CONTENT_NS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<rss\s[^>]*xmlns:content=["']http://purl\.org/rss/1\.0/modules/content/"#)
        .expect("valid regex")
});
static RSS_VERSION_2: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<rss\s[^>]*version=["']2\.0["']"#).expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFormat {
    Atom,
    Rss2,
    Unrecognized,
}

/// Classifies raw feed text. Atom is tested first and wins when both match.
pub fn classify(raw: &str) -> FeedFormat {
    if ATOM_ROOT.is_match(raw) {
        FeedFormat::Atom
    } else if RSS_CONTENT_NS.is_match(raw) || RSS_VERSION_2.is_match(raw) {
        FeedFormat::Rss2
    } else {
        FeedFormat::Unrecognized
    }
}
