//! Listing enumeration and detail-page extraction for the Trac markup
//! contract.
//!
//! The markup shapes this module understands (summary/description regions,
//! properties table, change blocks, attachments block, `/ticket/<digits>`
//! anchors) are a versioned contract with the remote tracker. Extraction is
//! behind the [`TicketPageExtractor`] trait so the contract can evolve or be
//! swapped without touching normalization or persistence.

use scraper::{ElementRef, Html, Selector};
use tracmine_core::{FieldChange, RawAttachment, RawComment, RawTicket};
use tracmine_storage::{FetchError, PageFetcher};

pub const CRATE_NAME: &str = "tracmine-scrape";

/// Where to scrape: the tracker base URL and the report used for listings.
#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    base_url: String,
    report_id: u32,
}

impl ScrapeConfig {
    pub fn new(base_url: impl Into<String>, report_id: u32) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            report_id,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn listing_url(&self, page: u32, page_size: u32) -> String {
        format!(
            "{}/report/{}?asc=1&sort=id&page={}&max={}",
            self.base_url, self.report_id, page, page_size
        )
    }

    pub fn ticket_url(&self, ticket_id: u32) -> String {
        format!("{}/ticket/{}", self.base_url, ticket_id)
    }
}

/// Extracts the numeric id from an anchor href matching `/ticket/<digits>`.
/// Deeper paths (attachments) and non-numeric tails are rejected; a query
/// string or fragment after the digits is fine.
pub fn ticket_id_from_href(href: &str) -> Option<u32> {
    let idx = href.find("/ticket/")?;
    let rest = &href[idx + "/ticket/".len()..];
    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if digits_end == 0 {
        return None;
    }
    let (digits, tail) = rest.split_at(digits_end);
    if !(tail.is_empty() || tail.starts_with('?') || tail.starts_with('#')) {
        return None;
    }
    digits.parse().ok()
}

/// Scans listing markup for ticket-detail links in document order.
/// Duplicates are preserved; no links means an empty list, not an error.
pub fn scan_listing(markup: &str) -> Vec<u32> {
    let document = Html::parse_document(markup);
    let Ok(anchors) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    document
        .select(&anchors)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(ticket_id_from_href)
        .collect()
}

/// Fetches one listing page and returns the ticket ids it links to.
/// Fetch failures propagate unchanged so callers can abort the whole run.
pub async fn list_ticket_ids(
    fetcher: &dyn PageFetcher,
    config: &ScrapeConfig,
    page: u32,
    page_size: u32,
) -> Result<Vec<u32>, FetchError> {
    let url = config.listing_url(page, page_size);
    let markup = fetcher.fetch_page(&url).await?;
    Ok(scan_listing(&markup))
}

/// Strategy seam over the detail-page markup contract.
pub trait TicketPageExtractor: Send + Sync {
    /// `None` means the page has no summary region: the ticket does not exist
    /// or is inaccessible. That is a skip signal, not an error.
    fn extract_ticket(&self, markup: &str) -> Option<RawTicket>;
}

/// Default extractor for stock Trac detail pages.
#[derive(Debug, Clone)]
pub struct TracHtmlExtractor {
    base_url: String,
}

impl TracHtmlExtractor {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn read_properties(&self, document: &Html, raw: &mut RawTicket) {
        let Ok(rows) = Selector::parse("table.properties tr") else {
            return;
        };
        for row in document.select(&rows) {
            let Some(header) = element_text(row, "th") else {
                continue;
            };
            let Some(value) = element_text(row, "td") else {
                continue;
            };
            let key = header.trim_end_matches(':').trim().to_ascii_lowercase();
            raw.set_property(&key, &collapse_whitespace(&value));
        }
    }

    fn read_comments(&self, document: &Html) -> Vec<RawComment> {
        let Ok(blocks) = Selector::parse("div.change") else {
            return Vec::new();
        };
        let mut comments = Vec::new();
        for block in document.select(&blocks) {
            let author = element_text(block, ".trac-author");
            let timestamp = element_attr(block, ".trac-datetime", "title")
                .or_else(|| element_text(block, ".trac-datetime"));
            let content = element_text(block, ".comment.searchable")
                .or_else(|| element_text(block, ".comment"))
                .unwrap_or_default();
            let changes = changes_in_block(block);
            // A block with neither content nor changes carries no information.
            if content.is_empty() && changes.is_empty() {
                continue;
            }
            comments.push(RawComment {
                author,
                timestamp,
                content,
                changes,
            });
        }
        comments
    }

    fn read_attachments(&self, document: &Html) -> Vec<RawAttachment> {
        let Ok(entries) = Selector::parse("#attachments dt") else {
            return Vec::new();
        };
        let mut attachments = Vec::new();
        for entry in document.select(&entries) {
            let Some(link) = first_element(entry, "a") else {
                continue;
            };
            let filename = match text_or_none(link.text().collect::<String>()) {
                Some(name) => name,
                None => continue,
            };
            // Filename and uploader are both required; anything else is
            // normalizer territory.
            let Some(uploaded_by) = element_text(entry, ".trac-author") else {
                continue;
            };
            let size_text = element_text(entry, ".trac-file-size")
                .or_else(|| parenthesized_text(&entry.text().collect::<String>()));
            let uploaded_at = element_attr(entry, ".trac-datetime", "title")
                .or_else(|| element_text(entry, ".trac-datetime"));
            let description = entry
                .next_siblings()
                .filter_map(ElementRef::wrap)
                .next()
                .filter(|el| el.value().name() == "dd")
                .and_then(|el| text_or_none(el.text().collect::<String>()));
            let url = self.resolve_url(link.value().attr("href").unwrap_or_default());
            attachments.push(RawAttachment {
                filename,
                size_text,
                uploaded_by,
                uploaded_at,
                description,
                url,
            });
        }
        attachments
    }

    fn resolve_url(&self, href: &str) -> String {
        if href.starts_with("http://") || href.starts_with("https://") {
            href.to_string()
        } else if href.starts_with('/') {
            format!("{}{}", self.base_url, href)
        } else {
            format!("{}/{}", self.base_url, href)
        }
    }
}

impl TicketPageExtractor for TracHtmlExtractor {
    fn extract_ticket(&self, markup: &str) -> Option<RawTicket> {
        let document = Html::parse_document(markup);

        let title = select_first_text(&document, "#ticket .summary")
            .or_else(|| select_first_text(&document, ".summary"))?;
        let description = select_first_text(&document, "#ticket .description .searchable")
            .or_else(|| select_first_text(&document, ".description .searchable"))
            .unwrap_or_default();

        let mut raw = RawTicket::new(title, description);
        self.read_properties(&document, &mut raw);
        raw.comments = self.read_comments(&document);
        raw.attachments = self.read_attachments(&document);

        let mut searchable = raw.description.clone();
        for comment in &raw.comments {
            searchable.push('\n');
            searchable.push_str(&comment.content);
        }
        raw.changeset_revisions = scan_changeset_revisions(&searchable);

        Some(raw)
    }
}

/// Parses one `<field> changed from <old> to <new>` line into a structured
/// change. The last ` to ` wins so old values containing the word survive.
pub fn parse_field_change(text: &str) -> Option<FieldChange> {
    let text = collapse_whitespace(text);
    let idx = text.find(" changed from ")?;
    let field = text[..idx].trim();
    let tail = &text[idx + " changed from ".len()..];
    let to_idx = tail.rfind(" to ")?;
    let old_value = tail[..to_idx].trim();
    let new_value = tail[to_idx + " to ".len()..].trim();
    if field.is_empty() || new_value.is_empty() {
        return None;
    }
    Some(FieldChange {
        field: field.to_string(),
        old_value: old_value.to_string(),
        new_value: new_value.to_string(),
    })
}

/// Finds source-control references in free text: `[<digits>]`, `r<digits>`,
/// or `changeset:<digits>`, deduplicated by revision in discovery order.
pub fn scan_changeset_revisions(text: &str) -> Vec<u32> {
    let bytes = text.as_bytes();
    let mut revisions: Vec<u32> = Vec::new();
    let mut push = |revisions: &mut Vec<u32>, rev: u32| {
        if !revisions.contains(&rev) {
            revisions.push(rev);
        }
    };

    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'[' {
            if let Some((rev, next)) = take_digits(bytes, i + 1) {
                if next < bytes.len() && bytes[next] == b']' {
                    push(&mut revisions, rev);
                    i = next + 1;
                    continue;
                }
            }
            i += 1;
        } else if bytes[i..].starts_with(b"changeset:") && boundary_before(bytes, i) {
            let after = i + "changeset:".len();
            if let Some((rev, next)) = take_digits(bytes, after) {
                push(&mut revisions, rev);
                i = next;
                continue;
            }
            i = after;
        } else if bytes[i] == b'r' && boundary_before(bytes, i) {
            if let Some((rev, next)) = take_digits(bytes, i + 1) {
                if next >= bytes.len() || !bytes[next].is_ascii_alphanumeric() {
                    push(&mut revisions, rev);
                    i = next;
                    continue;
                }
            }
            i += 1;
        } else {
            i += 1;
        }
    }
    revisions
}

fn take_digits(bytes: &[u8], start: usize) -> Option<(u32, usize)> {
    let mut end = start;
    let mut value: u64 = 0;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        value = value.saturating_mul(10) + u64::from(bytes[end] - b'0');
        end += 1;
    }
    if end == start {
        return None;
    }
    let value = u32::try_from(value).ok()?;
    Some((value, end))
}

fn boundary_before(bytes: &[u8], i: usize) -> bool {
    i == 0 || !bytes[i - 1].is_ascii_alphanumeric()
}

fn changes_in_block(block: ElementRef<'_>) -> Vec<FieldChange> {
    let Ok(lines) = Selector::parse("ul.changes li") else {
        return Vec::new();
    };
    block
        .select(&lines)
        .filter_map(|li| parse_field_change(&li.text().collect::<String>()))
        .collect()
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(document: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn first_element<'a>(scope: ElementRef<'a>, selector: &str) -> Option<ElementRef<'a>> {
    let sel = Selector::parse(selector).ok()?;
    scope.select(&sel).next()
}

fn element_text(scope: ElementRef<'_>, selector: &str) -> Option<String> {
    first_element(scope, selector).and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn element_attr(scope: ElementRef<'_>, selector: &str, attr: &str) -> Option<String> {
    first_element(scope, selector)
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

fn parenthesized_text(input: &str) -> Option<String> {
    let open = input.find('(')?;
    let close = input[open + 1..].find(')')?;
    text_or_none(input[open + 1..open + 1 + close].to_string())
}
