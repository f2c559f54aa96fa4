//! Core domain model for opsync: raw OpenProject work packages, normalized
//! task records, and the destination-store attribute schema.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "opsync-core";

/// Namespace prefix of every per-target configuration key.
pub const CONFIG_PREFIX: &str = "openproject";

/// Type title that moves a work package's due date from `dueDate` to `date`.
pub const MILESTONE_TYPE: &str = "Milestone";

/// Prefix of the source-id tag (`OP#<id>`).
pub const SOURCE_TAG_PREFIX: &str = "OP";

/// `_links` entry as returned by the API (`{"href": ..., "title": ...}`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LinkRef {
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// Embedded object exposing only a display name (e.g. `category`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NamedRef {
    #[serde(default)]
    pub name: Option<String>,
}

/// Formattable text block (`{"format": "markdown", "raw": ..., "html": ...}`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Formattable {
    #[serde(default)]
    pub raw: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawLinks {
    #[serde(default, rename = "self")]
    pub self_link: Option<LinkRef>,
    #[serde(default, rename = "type")]
    pub work_type: Option<LinkRef>,
    #[serde(default)]
    pub project: Option<LinkRef>,
    #[serde(default)]
    pub status: Option<LinkRef>,
    #[serde(default)]
    pub author: Option<LinkRef>,
    #[serde(default)]
    pub priority: Option<LinkRef>,
    #[serde(default)]
    pub assignee: Option<LinkRef>,
    #[serde(default)]
    pub category: Option<LinkRef>,
}

/// A work package as delivered by the remote API, validated at the boundary.
///
/// Every field is optional here; the normalizer decides which absences are
/// fatal for a single item.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawItem {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub description: Option<Formattable>,
    #[serde(default)]
    pub category: Option<NamedRef>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub spent_time: Option<String>,
    #[serde(default)]
    pub estimated_time: Option<String>,
    #[serde(default, rename = "_links")]
    pub links: RawLinks,
}

impl RawItem {
    pub fn from_value(value: &JsonValue) -> Result<Self, serde_json::Error> {
        RawItem::deserialize(value)
    }

    pub fn type_title(&self) -> Option<&str> {
        link_title(&self.links.work_type)
    }

    pub fn project_title(&self) -> Option<&str> {
        link_title(&self.links.project)
    }

    pub fn status_title(&self) -> Option<&str> {
        link_title(&self.links.status)
    }

    pub fn author_title(&self) -> Option<&str> {
        link_title(&self.links.author)
    }

    pub fn priority_title(&self) -> Option<&str> {
        link_title(&self.links.priority)
    }

    pub fn assignee_title(&self) -> Option<&str> {
        link_title(&self.links.assignee)
    }

    /// Category name, preferring the embedded object over the link title.
    pub fn category_name(&self) -> Option<&str> {
        self.category
            .as_ref()
            .and_then(|c| c.name.as_deref())
            .or_else(|| link_title(&self.links.category))
    }

    pub fn self_href(&self) -> Option<&str> {
        self.links.self_link.as_ref().and_then(|l| l.href.as_deref())
    }
}

fn link_title(link: &Option<LinkRef>) -> Option<&str> {
    link.as_ref().and_then(|l| l.title.as_deref())
}

/// Best-effort id lookup on an unvalidated item, for error context.
pub fn raw_item_id(value: &JsonValue) -> Option<i64> {
    value.get("id").and_then(JsonValue::as_i64)
}

/// Five-level priority code stored in the destination task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PriorityCode {
    L,
    M,
    H,
    U,
    I,
}

impl PriorityCode {
    /// Maps the remote priority vocabulary; anything else is `None`.
    pub fn from_external(title: &str) -> Option<Self> {
        match title {
            "Low" => Some(Self::L),
            "Normal" => Some(Self::M),
            "High" => Some(Self::H),
            "Urgent" => Some(Self::U),
            "Immediate" => Some(Self::I),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::L => "L",
            Self::M => "M",
            Self::H => "H",
            Self::U => "U",
            Self::I => "I",
        }
    }
}

impl Default for PriorityCode {
    fn default() -> Self {
        Self::M
    }
}

impl fmt::Display for PriorityCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown priority code {0:?}; expected one of L, M, H, U, I")]
pub struct UnknownPriority(pub String);

impl FromStr for PriorityCode {
    type Err = UnknownPriority;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "L" => Ok(Self::L),
            "M" => Ok(Self::M),
            "H" => Ok(Self::H),
            "U" => Ok(Self::U),
            "I" => Ok(Self::I),
            _ => Err(UnknownPriority(s.to_string())),
        }
    }
}

/// Per-target values the normalizer needs from the service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Origin {
    pub default_priority: PriorityCode,
    pub project_name: Option<String>,
}

/// Flat task record ready for the destination store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub id: i64,
    pub subject: String,
    /// Default task description: `(bw)<Type>#<id> - <subject>`.
    pub summary: String,
    pub url: Option<String>,
    pub description: String,
    pub work_type: String,
    pub tracker: Option<String>,
    pub status: Option<String>,
    pub author: Option<String>,
    pub category: Option<String>,
    pub assigned_to: Option<String>,
    pub project: Option<String>,
    pub scheduled: Option<DateTime<Utc>>,
    pub entry: Option<DateTime<Utc>>,
    pub updated_on: Option<DateTime<Utc>>,
    pub due: Option<DateTime<Utc>>,
    pub estimated_hours: Option<String>,
    pub spent_hours: Option<String>,
    pub priority: PriorityCode,
    pub tags: Vec<String>,
}

impl NormalizedRecord {
    /// The `OP#<id>` tag carried by every record.
    pub fn source_tag(id: i64) -> String {
        format!("{SOURCE_TAG_PREFIX}#{id}")
    }

    /// Renders the record keyed by destination attribute names. Absent
    /// optional values are emitted as `null` so stale values get cleared.
    pub fn to_task_fields(&self) -> JsonMap<String, JsonValue> {
        let mut out = JsonMap::new();
        out.insert("description".into(), self.summary.clone().into());
        out.insert("priority".into(), self.priority.as_str().into());
        out.insert("project".into(), opt_str(&self.project));
        out.insert("tags".into(), self.tags.clone().into());
        out.insert("due".into(), opt_date(self.due));
        out.insert("scheduled".into(), opt_date(self.scheduled));
        out.insert("entry".into(), opt_date(self.entry));
        out.insert("etc".into(), opt_str(&self.estimated_hours));
        out.insert(uda::ID.into(), self.id.into());
        out.insert(uda::SUBJECT.into(), self.subject.clone().into());
        out.insert(uda::URL.into(), opt_str(&self.url));
        out.insert(uda::DESCRIPTION.into(), self.description.clone().into());
        out.insert(uda::TYPE.into(), self.work_type.clone().into());
        out.insert(uda::TRACKER.into(), opt_str(&self.tracker));
        out.insert(uda::STATUS.into(), opt_str(&self.status));
        out.insert(uda::AUTHOR.into(), opt_str(&self.author));
        out.insert(uda::CATEGORY.into(), opt_str(&self.category));
        out.insert(uda::ASSIGNED_TO.into(), opt_str(&self.assigned_to));
        out.insert(uda::SPENT_HOURS.into(), opt_str(&self.spent_hours));
        out.insert(uda::UPDATED_ON.into(), opt_date(self.updated_on));
        out
    }
}

/// Taskwarrior's compact UTC date form.
pub fn task_date(value: DateTime<Utc>) -> String {
    value.format("%Y%m%dT%H%M%SZ").to_string()
}

fn opt_str(value: &Option<String>) -> JsonValue {
    value.clone().map(JsonValue::String).unwrap_or(JsonValue::Null)
}

fn opt_date(value: Option<DateTime<Utc>>) -> JsonValue {
    value
        .map(|v| JsonValue::String(task_date(v)))
        .unwrap_or(JsonValue::Null)
}

/// Destination user-defined attribute names.
pub mod uda {
    pub const URL: &str = "openprojecturl";
    pub const SUBJECT: &str = "openprojectsubject";
    pub const TYPE: &str = "openprojecttype";
    pub const ID: &str = "openprojectid";
    pub const DESCRIPTION: &str = "openprojectdescription";
    pub const TRACKER: &str = "openprojecttracker";
    pub const STATUS: &str = "openprojectstatus";
    pub const AUTHOR: &str = "openprojectauthor";
    pub const CATEGORY: &str = "openprojectcategory";
    pub const SPENT_HOURS: &str = "openprojectspenthours";
    pub const ESTIMATED_HOURS: &str = "etc";
    pub const UPDATED_ON: &str = "openprojectupdatedon";
    pub const ASSIGNED_TO: &str = "openprojectassignedto";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UdaKind {
    String,
    Numeric,
    Duration,
    Date,
}

impl UdaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Numeric => "numeric",
            Self::Duration => "duration",
            Self::Date => "date",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UdaField {
    pub name: &'static str,
    pub kind: UdaKind,
    pub label: &'static str,
}

/// Custom attributes the destination store must declare before import.
/// The record's unique key is [`uda::ID`].
pub const UDA_FIELDS: &[UdaField] = &[
    UdaField { name: uda::URL, kind: UdaKind::String, label: "OpenProject URL" },
    UdaField { name: uda::SUBJECT, kind: UdaKind::String, label: "OpenProject Subject" },
    UdaField { name: uda::ID, kind: UdaKind::Numeric, label: "OpenProject ID" },
    UdaField { name: uda::DESCRIPTION, kind: UdaKind::String, label: "OpenProject Description" },
    UdaField { name: uda::TRACKER, kind: UdaKind::String, label: "OpenProject Tracker" },
    UdaField { name: uda::STATUS, kind: UdaKind::String, label: "OpenProject Status" },
    UdaField { name: uda::AUTHOR, kind: UdaKind::String, label: "OpenProject Author" },
    UdaField { name: uda::CATEGORY, kind: UdaKind::String, label: "OpenProject Category" },
    UdaField { name: uda::SPENT_HOURS, kind: UdaKind::Duration, label: "OpenProject Spent Hours" },
    UdaField { name: uda::ESTIMATED_HOURS, kind: UdaKind::Duration, label: "OpenProject Estimated Hours" },
    UdaField { name: uda::UPDATED_ON, kind: UdaKind::Date, label: "OpenProject Updated On" },
    UdaField { name: uda::ASSIGNED_TO, kind: UdaKind::String, label: "OpenProject Assigned To" },
    UdaField { name: uda::TYPE, kind: UdaKind::String, label: "OpenProject Type" },
];

pub fn uda_taskrc_lines() -> Vec<String> {
    UDA_FIELDS
        .iter()
        .flat_map(|field| {
            [
                format!("uda.{}.type={}", field.name, field.kind.as_str()),
                format!("uda.{}.label={}", field.name, field.label),
            ]
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("spawning duration calculator: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("duration calculator exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("duration calculator returned no output for {0:?}")]
    Empty(String),
    #[error("cannot render {0} hours as a duration")]
    OutOfRange(f64),
}

/// Turns an hour count into the destination store's native duration value.
///
/// `rendered` is the human form (`"2.5 hours"`); `hours` is the same value
/// as a number, for implementations that do not need to parse text.
pub trait DurationFormatter: Send + Sync {
    fn format_hours(&self, rendered: &str, hours: f64) -> Result<String, FormatError>;
}

/// In-process formatter producing Taskwarrior's ISO-8601 duration output
/// (`P1DT6H`, `PT2H30M`).
#[derive(Debug, Clone, Copy, Default)]
pub struct IsoDurationFormatter;

impl DurationFormatter for IsoDurationFormatter {
    fn format_hours(&self, _rendered: &str, hours: f64) -> Result<String, FormatError> {
        if !hours.is_finite() || hours < 0.0 || hours > (u64::MAX / 3600) as f64 {
            return Err(FormatError::OutOfRange(hours));
        }
        let total = (hours * 3600.0).round() as u64;
        let (days, rest) = (total / 86_400, total % 86_400);
        let (h, m, s) = (rest / 3600, rest % 3600 / 60, rest % 60);

        let mut out = String::from("P");
        if days > 0 {
            out.push_str(&format!("{days}D"));
        }
        if rest > 0 || days == 0 {
            out.push('T');
            if h > 0 {
                out.push_str(&format!("{h}H"));
            }
            if m > 0 {
                out.push_str(&format!("{m}M"));
            }
            if s > 0 || rest == 0 {
                out.push_str(&format!("{s}S"));
            }
        }
        Ok(out)
    }
}
