//! Canonical ticket model and field normalization for tracmine.
//!
//! The scrape layer hands over a [`RawTicket`] (every field optional, values
//! still source strings); [`normalize`] turns that into a complete canonical
//! [`Ticket`]. Normalization is total: unrecognized enum values, malformed
//! sizes and unparseable dates all fall back to explicit defaults instead of
//! failing the ingestion of an otherwise healthy ticket.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tracmine-core";

/// Ticket classification as reported by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketType {
    #[serde(rename = "defect")]
    Defect,
    #[serde(rename = "enhancement")]
    Enhancement,
    #[serde(rename = "feature request")]
    FeatureRequest,
    #[serde(rename = "task")]
    Task,
}

impl TicketType {
    /// Case-insensitive coercion with a fixed default. `"bug"` is accepted as
    /// an alias for defect; anything unrecognized or missing is a defect.
    pub fn normalize(input: Option<&str>) -> Self {
        match input.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("defect") | Some("bug") => Self::Defect,
            Some("enhancement") => Self::Enhancement,
            Some("feature request") | Some("feature") => Self::FeatureRequest,
            Some("task") => Self::Task,
            _ => Self::Defect,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Defect => "defect",
            Self::Enhancement => "enhancement",
            Self::FeatureRequest => "feature request",
            Self::Task => "task",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    New,
    Assigned,
    Accepted,
    Reviewing,
    Testing,
    Closed,
}

impl TicketStatus {
    pub fn normalize(input: Option<&str>) -> Self {
        match input.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("new") => Self::New,
            Some("assigned") => Self::Assigned,
            Some("accepted") => Self::Accepted,
            Some("reviewing") => Self::Reviewing,
            Some("testing") => Self::Testing,
            Some("closed") => Self::Closed,
            _ => Self::New,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Assigned => "assigned",
            Self::Accepted => "accepted",
            Self::Reviewing => "reviewing",
            Self::Testing => "testing",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketPriority {
    Trivial,
    Minor,
    Normal,
    Major,
    Critical,
    Blocker,
}

impl TicketPriority {
    pub fn normalize(input: Option<&str>) -> Self {
        match input.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("trivial") => Self::Trivial,
            Some("minor") => Self::Minor,
            Some("normal") => Self::Normal,
            Some("major") => Self::Major,
            Some("critical") => Self::Critical,
            Some("blocker") => Self::Blocker,
            _ => Self::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trivial => "trivial",
            Self::Minor => "minor",
            Self::Normal => "normal",
            Self::Major => "major",
            Self::Critical => "critical",
            Self::Blocker => "blocker",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketSeverity {
    Trivial,
    Minor,
    Normal,
    Major,
    Critical,
}

impl TicketSeverity {
    pub fn normalize(input: Option<&str>) -> Self {
        match input.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("trivial") => Self::Trivial,
            Some("minor") => Self::Minor,
            Some("normal") => Self::Normal,
            Some("major") => Self::Major,
            Some("critical") => Self::Critical,
            _ => Self::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trivial => "trivial",
            Self::Minor => "minor",
            Self::Normal => "normal",
            Self::Major => "major",
            Self::Critical => "critical",
        }
    }
}

/// A property transition recorded alongside a comment
/// (`<field> changed from <old> to <new>`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old_value: String,
    pub new_value: String,
}

/// Ordered ticket comment. Ids are 1-based ingestion order, not a
/// source-supplied identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: u32,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    #[serde(default)]
    pub changes: Vec<FieldChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub size: u64,
    pub uploaded_by: String,
    pub uploaded_at: DateTime<Utc>,
    pub description: Option<String>,
    pub url: String,
}

/// Placeholder reference to a source-control revision mentioned in the
/// ticket text. The detail page does not expose changeset metadata, so author
/// and message are fixed stub values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesetRef {
    pub revision: u32,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default)]
    pub files: Vec<String>,
    pub url: String,
}

/// Canonical persisted ticket. Re-ingestion replaces the whole document, so
/// every field must be populated on each sync (full overwrite, never merge).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub ticket_id: u32,
    pub url: String,
    pub title: String,
    pub description: String,
    pub kind: TicketType,
    pub status: TicketStatus,
    pub priority: TicketPriority,
    pub severity: Option<TicketSeverity>,
    pub component: String,
    pub version: Option<String>,
    pub milestone: Option<String>,
    pub owner: Option<String>,
    pub reporter: String,
    pub resolution: Option<String>,
    pub resolution_date: Option<DateTime<Utc>>,
    pub keywords: Vec<String>,
    pub focuses: Vec<String>,
    pub cc_list: Vec<String>,
    /// Reserved for a future relationship-extraction pass; never populated by
    /// this pipeline but always persisted so upserts cannot drop them.
    pub blocked_by: Vec<u32>,
    pub blocking: Vec<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub comments: Vec<Comment>,
    pub attachments: Vec<Attachment>,
    pub changesets: Vec<ChangesetRef>,
}

/// Typed extraction intermediate. Values are untouched source strings; the
/// extractor fills what it finds and leaves the rest `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTicket {
    pub title: String,
    pub description: String,
    pub kind: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub severity: Option<String>,
    pub component: Option<String>,
    pub version: Option<String>,
    pub milestone: Option<String>,
    pub owner: Option<String>,
    pub reporter: Option<String>,
    pub keywords: Option<String>,
    pub focuses: Option<String>,
    pub cc: Option<String>,
    pub time: Option<String>,
    pub changetime: Option<String>,
    pub resolution: Option<String>,
    pub comments: Vec<RawComment>,
    pub attachments: Vec<RawAttachment>,
    pub changeset_revisions: Vec<u32>,
}

impl RawTicket {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            ..Self::default()
        }
    }

    /// Routes one properties-table row into the matching typed field.
    /// `key` is the lower-cased, trimmed row header. Unknown keys and empty
    /// values are ignored.
    pub fn set_property(&mut self, key: &str, value: &str) {
        let value = value.trim();
        if value.is_empty() {
            return;
        }
        let slot = match key {
            "type" => &mut self.kind,
            "status" => &mut self.status,
            "priority" => &mut self.priority,
            "severity" => &mut self.severity,
            "component" => &mut self.component,
            "version" => &mut self.version,
            "milestone" => &mut self.milestone,
            "owner" | "owned by" => &mut self.owner,
            "reporter" | "reported by" => &mut self.reporter,
            "keywords" => &mut self.keywords,
            "focuses" => &mut self.focuses,
            "cc" => &mut self.cc,
            "time" | "opened" => &mut self.time,
            "changetime" | "last modified" => &mut self.changetime,
            "resolution" => &mut self.resolution,
            _ => return,
        };
        *slot = Some(value.to_string());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawComment {
    pub author: Option<String>,
    pub timestamp: Option<String>,
    pub content: String,
    pub changes: Vec<FieldChange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttachment {
    pub filename: String,
    pub size_text: Option<String>,
    pub uploaded_by: String,
    pub uploaded_at: Option<String>,
    pub description: Option<String>,
    pub url: String,
}

/// Splits a whitespace/comma-delimited source string into trimmed, non-empty,
/// order-preserving unique tokens. Missing input yields an empty list.
pub fn split_list(input: Option<&str>) -> Vec<String> {
    let Some(input) = input else {
        return Vec::new();
    };
    let mut out: Vec<String> = Vec::new();
    for token in input.split(|c: char| c.is_whitespace() || c == ',') {
        let token = token.trim();
        if token.is_empty() || out.iter().any(|t| t.as_str() == token) {
            continue;
        }
        out.push(token.to_string());
    }
    out
}

/// Parses `<number><unit>?` into integer bytes using binary multiples.
/// Surrounding parentheses (as rendered on attachment rows) are tolerated.
/// Anything unparseable yields 0.
pub fn parse_size(input: &str) -> u64 {
    let trimmed = input
        .trim()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .trim();
    let mut number = String::new();
    let mut unit = "";
    for (i, ch) in trimmed.char_indices() {
        if ch.is_ascii_digit() || ch == '.' {
            number.push(ch);
        } else {
            unit = &trimmed[i..];
            break;
        }
    }
    let Ok(value) = number.parse::<f64>() else {
        return 0;
    };
    let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" | "byte" | "bytes" => 1.0,
        "kb" => 1024.0,
        "mb" => 1024.0 * 1024.0,
        "gb" => 1024.0 * 1024.0 * 1024.0,
        _ => return 0,
    };
    (value * multiplier).round() as u64
}

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %H:%M:%S",
    "%b %d, %Y, %I:%M:%S %p",
];

/// Tolerant date parse. `None` means "no value": the caller decides the
/// fallback (ingestion time), never a sentinel date.
pub fn parse_date(input: &str) -> Option<DateTime<Utc>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%z") {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(dt.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Some(dt.and_utc());
        }
    }
    None
}

const CHANGESET_STUB_AUTHOR: &str = "Unknown";
const CHANGESET_STUB_MESSAGE: &str = "Referenced in ticket";

/// Assembles the complete canonical ticket from a raw extraction.
///
/// `now` is the ingestion instant, used as the fallback wherever the source
/// omitted or mangled a timestamp. `base_url` anchors the ticket and
/// changeset URLs.
pub fn normalize(raw: RawTicket, ticket_id: u32, base_url: &str, now: DateTime<Utc>) -> Ticket {
    let base = base_url.trim_end_matches('/');
    let created_at = raw.time.as_deref().and_then(parse_date).unwrap_or(now);
    let updated_at = raw.changetime.as_deref().and_then(parse_date).unwrap_or(now);

    let resolution = raw.resolution.filter(|r| !r.trim().is_empty());
    let resolution_date = resolution.as_ref().map(|_| updated_at);

    let comments = raw
        .comments
        .into_iter()
        .enumerate()
        .map(|(index, comment)| Comment {
            id: index as u32 + 1,
            author: comment.author.unwrap_or_else(|| "anonymous".to_string()),
            timestamp: comment
                .timestamp
                .as_deref()
                .and_then(parse_date)
                .unwrap_or(now),
            content: comment.content,
            changes: comment.changes,
        })
        .collect();

    let attachments = raw
        .attachments
        .into_iter()
        .map(|attachment| Attachment {
            filename: attachment.filename,
            size: attachment
                .size_text
                .as_deref()
                .map(parse_size)
                .unwrap_or(0),
            uploaded_by: attachment.uploaded_by,
            uploaded_at: attachment
                .uploaded_at
                .as_deref()
                .and_then(parse_date)
                .unwrap_or(now),
            description: attachment.description,
            url: attachment.url,
        })
        .collect();

    let changesets = raw
        .changeset_revisions
        .into_iter()
        .map(|revision| ChangesetRef {
            revision,
            author: CHANGESET_STUB_AUTHOR.to_string(),
            timestamp: now,
            message: CHANGESET_STUB_MESSAGE.to_string(),
            files: Vec::new(),
            url: format!("{base}/changeset/{revision}"),
        })
        .collect();

    Ticket {
        ticket_id,
        url: format!("{base}/ticket/{ticket_id}"),
        title: raw.title,
        description: raw.description,
        kind: TicketType::normalize(raw.kind.as_deref()),
        status: TicketStatus::normalize(raw.status.as_deref()),
        priority: TicketPriority::normalize(raw.priority.as_deref()),
        severity: raw
            .severity
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(|s| TicketSeverity::normalize(Some(s))),
        component: raw.component.unwrap_or_default(),
        version: raw.version,
        milestone: raw.milestone,
        owner: raw.owner,
        reporter: raw.reporter.unwrap_or_default(),
        resolution,
        resolution_date,
        keywords: split_list(raw.keywords.as_deref()),
        focuses: split_list(raw.focuses.as_deref()),
        cc_list: split_list(raw.cc.as_deref()),
        blocked_by: Vec::new(),
        blocking: Vec::new(),
        created_at,
        updated_at,
        comments,
        attachments,
        changesets,
    }
}
