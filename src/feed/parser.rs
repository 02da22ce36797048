use roxmltree::{Document, Node, ParsingOptions};

use super::sanitize::strip_html;
use super::{FeedError, NewsEntry};

const ATOM_NS: &str = "http://www.w3.org/2005/Atom";

fn parse_document(raw: &str) -> Result<Document<'_>, FeedError> {
    // Plenty of feeds still carry a DOCTYPE.
    let mut options = ParsingOptions::default();
    options.allow_dtd = true;
    Ok(Document::parse_with_options(raw, options)?)
}

/// First child element with the given namespace and local name.
fn child<'a, 'input>(
    node: Node<'a, 'input>,
    namespace: Option<&str>,
    name: &str,
) -> Option<Node<'a, 'input>> {
    node.children().find(|c| {
        c.is_element() && c.tag_name().namespace() == namespace && c.tag_name().name() == name
    })
}

fn text_of(node: Option<Node<'_, '_>>) -> String {
    node.and_then(|n| n.text()).unwrap_or_default().to_string()
}

/// Builds an entry, or `None` when the title is missing or empty.
fn build_entry(
    title: Option<Node<'_, '_>>,
    summary: String,
    link: String,
    published: String,
    updated: String,
    strip: bool,
) -> Option<NewsEntry> {
    let title = title?.text()?;
    let (title, summary) = if strip {
        (strip_html(title), strip_html(&summary))
    } else {
        (title.to_string(), summary)
    };
    if title.is_empty() {
        return None;
    }

    Some(NewsEntry {
        title,
        summary,
        link,
        published,
        updated,
    })
}

fn atom_entry(entry: Node<'_, '_>, strip: bool) -> Option<NewsEntry> {
    let field = |name: &str| child(entry, Some(ATOM_NS), name);
    let link = field("link")
        .and_then(|l| l.attribute("href"))
        .unwrap_or_default()
        .to_string();

    build_entry(
        field("title"),
        text_of(field("summary")),
        link,
        text_of(field("published")),
        text_of(field("updated")),
        strip,
    )
}

fn rss_item(item: Node<'_, '_>, strip: bool) -> Option<NewsEntry> {
    let field = |name: &str| child(item, None, name);
    let published = text_of(field("pubDate"));

    build_entry(
        field("title"),
        text_of(field("description")),
        text_of(field("link")),
        published.clone(),
        published,
        strip,
    )
}

/// Extracts up to `max_entries` entries from an Atom document, in document
/// order. Entries without a title are skipped and do not count.
pub fn parse_atom(
    raw: &str,
    strip: bool,
    max_entries: usize,
) -> Result<Vec<NewsEntry>, FeedError> {
    let doc = parse_document(raw)?;

    let entries = doc
        .root_element()
        .children()
        .filter(|n| n.has_tag_name((ATOM_NS, "entry")))
        .filter_map(|entry| atom_entry(entry, strip))
        .take(max_entries)
        .collect();

    Ok(entries)
}

/// Extracts up to `max_entries` items from the channel of an RSS 2.0
/// document. `pubDate` fills both `published` and `updated`.
pub fn parse_rss2(
    raw: &str,
    strip: bool,
    max_entries: usize,
) -> Result<Vec<NewsEntry>, FeedError> {
    let doc = parse_document(raw)?;
    let channel = child(doc.root_element(), None, "channel").ok_or(FeedError::MissingChannel)?;

    let entries = channel
        .children()
        .filter(|n| n.is_element() && n.tag_name().namespace().is_none())
        .filter(|n| n.tag_name().name() == "item")
        .filter_map(|item| rss_item(item, strip))
        .take(max_entries)
        .collect();

    Ok(entries)
}
