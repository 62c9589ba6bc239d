use feed_rs::model::{Entry, FeedType};
use feed_rs::parser;

use crate::storage::{ContentBlock, EntryInfo};

/// A fetched feed document reduced to what the aggregator consumes.
///
/// `format` is `None` when the bytes were not recognized as any feed format;
/// such a document has no entries. `etag`, `last_modified` and `encoding`
/// come from the transport and are filled in by the fetcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedFeed {
    pub format: Option<String>,
    pub entries: Vec<EntryInfo>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub encoding: Option<String>,
}

impl ParsedFeed {
    /// Whether the document was recognized or produced any entries.
    pub fn has_content(&self) -> bool {
        self.format.is_some() || !self.entries.is_empty()
    }
}

fn format_name(feed_type: &FeedType) -> &'static str {
    match feed_type {
        FeedType::Atom => "atom10",
        FeedType::JSON => "json",
        FeedType::RSS0 => "rss090",
        FeedType::RSS1 => "rss10",
        FeedType::RSS2 => "rss20",
    }
}

/// Parse RSS, Atom or JSON Feed bytes.
///
/// Never fails: unparseable input yields a document with no format and no
/// entries, which the merge step classifies as unrecognized content.
pub fn parse_feed(bytes: &[u8]) -> ParsedFeed {
    // Entries without an id keep an empty one, so a missing id stays
    // distinguishable from a feed-supplied one.
    let feed = match parser::Builder::new()
        .id_generator(|_, _, _| String::new())
        .build()
        .parse(bytes)
    {
        Ok(feed) => feed,
        Err(e) => {
            tracing::debug!(error = %e, "Document is not a recognized feed");
            return ParsedFeed::default();
        }
    };

    ParsedFeed {
        format: Some(format_name(&feed.feed_type).to_owned()),
        title: feed.title.map(|t| t.content),
        link: feed.links.first().map(|l| l.href.clone()),
        entries: feed.entries.into_iter().map(entry_info).collect(),
        ..ParsedFeed::default()
    }
}

fn entry_info(entry: Entry) -> EntryInfo {
    let content = entry
        .content
        .and_then(|c| {
            let content_type = c.content_type.to_string();
            c.body.map(|value| ContentBlock {
                value,
                content_type: Some(content_type),
            })
        })
        .into_iter()
        .collect();

    EntryInfo {
        id: Some(entry.id).filter(|id| !id.is_empty()),
        title: entry.title.map(|t| t.content),
        link: entry.links.first().map(|l| l.href.clone()),
        content,
        summary: entry.summary.map(|s| ContentBlock {
            value: s.content,
            content_type: Some(s.content_type.to_string()),
        }),
        published: entry.published.map(|dt| dt.timestamp()),
        updated: entry.updated.map(|dt| dt.timestamp()),
        created: None,
        author: entry.authors.first().map(|a| a.name.clone()),
        categories: entry.categories.into_iter().map(|c| c.term).collect(),
    }
}
