//! Work-package normalization: maps a raw OpenProject item onto the flat task
//! record the destination store imports.

use std::sync::{Arc, LazyLock};

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use opsync_core::{
    raw_item_id, DurationFormatter, FormatError, NormalizedRecord, Origin, PriorityCode, RawItem,
    MILESTONE_TYPE,
};
use regex::{Captures, Regex};
use scraper::Html;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::trace;
use url::Url;

pub const CRATE_NAME: &str = "opsync-normalize";

/// Wall-clock zone the remote system's timestamps are written in.
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::America::Mexico_City;

fn item_label(item_id: &Option<i64>) -> String {
    match item_id {
        Some(id) => format!("work package #{id}"),
        None => "work package without id".to_string(),
    }
}

#[derive(Debug, Error)]
pub enum NormalizationError {
    #[error("{}: malformed item: {reason}", item_label(.item_id))]
    Malformed { item_id: Option<i64>, reason: String },
    #[error("{}: missing required field `{field}`", item_label(.item_id))]
    MissingField {
        item_id: Option<i64>,
        field: &'static str,
    },
    #[error("work package #{item_id}: unparseable timestamp {value:?} in `{field}`")]
    InvalidTimestamp {
        item_id: i64,
        field: &'static str,
        value: String,
    },
    #[error("work package #{item_id}: invalid duration {value:?} in `{field}`: {reason}")]
    InvalidDuration {
        item_id: i64,
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("work package #{item_id}: project title {title:?} has no alphanumeric characters")]
    EmptyProjectSlug { item_id: i64, title: String },
    #[error("work package #{item_id}: formatting `{field}`: {source}")]
    Format {
        item_id: i64,
        field: &'static str,
        #[source]
        source: FormatError,
    },
}

impl NormalizationError {
    pub fn item_id(&self) -> Option<i64> {
        match self {
            Self::Malformed { item_id, .. } | Self::MissingField { item_id, .. } => *item_id,
            Self::InvalidTimestamp { item_id, .. }
            | Self::InvalidDuration { item_id, .. }
            | Self::EmptyProjectSlug { item_id, .. }
            | Self::Format { item_id, .. } => Some(*item_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationParseError {
    #[error("not an ISO-8601 duration")]
    Syntax,
    #[error("year and month components have no fixed length")]
    CalendarComponent,
}

static ISO_DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^P(?:(?P<y>\d+(?:[.,]\d+)?)Y)?(?:(?P<mo>\d+(?:[.,]\d+)?)M)?(?:(?P<w>\d+(?:[.,]\d+)?)W)?(?:(?P<d>\d+(?:[.,]\d+)?)D)?(?:T(?:(?P<h>\d+(?:[.,]\d+)?)H)?(?:(?P<mi>\d+(?:[.,]\d+)?)M)?(?:(?P<s>\d+(?:[.,]\d+)?)S)?)?$",
    )
    .expect("duration pattern is valid")
});

static CHARACTER_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(?:#[0-9]+|#[xX][0-9a-fA-F]+|[A-Za-z][A-Za-z0-9]*);?")
        .expect("character reference pattern is valid")
});

/// Parses an ISO-8601 duration (`PT2H30M`, `P1DT4H`, `PT0.5H`) into hours.
/// Weeks and days count as fixed 7 × 24 and 24 hours.
pub fn parse_iso_duration_hours(value: &str) -> Result<f64, DurationParseError> {
    let value = value.trim();
    let caps = ISO_DURATION
        .captures(value)
        .ok_or(DurationParseError::Syntax)?;
    if value == "P" || value.ends_with('T') {
        return Err(DurationParseError::Syntax);
    }
    if caps.name("y").is_some() || caps.name("mo").is_some() {
        return Err(DurationParseError::CalendarComponent);
    }

    let component = |name: &str| -> f64 {
        caps.name(name)
            .and_then(|m| m.as_str().replace(',', ".").parse::<f64>().ok())
            .unwrap_or(0.0)
    };
    let seconds = component("w") * 604_800.0
        + component("d") * 86_400.0
        + component("h") * 3_600.0
        + component("mi") * 60.0
        + component("s");
    Ok(seconds / 3_600.0)
}

/// Human form handed to the duration formatter (`2.5 hours`, `1.0 hours`,
/// `1e-07 hours`).
pub fn render_hours(hours: f64) -> String {
    format!("{} hours", float_repr(hours))
}

/// Shortest round-trip decimal: positional for exponents in `-4..16`,
/// otherwise `<mantissa>e<sign><two or more digits>`.
fn float_repr(value: f64) -> String {
    let scientific = format!("{value:e}");
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return format!("{value:?}");
    };
    let Ok(exponent) = exponent.parse::<i32>() else {
        return format!("{value:?}");
    };
    if (-4..16).contains(&exponent) {
        let positional = value.to_string();
        if positional.contains('.') {
            positional
        } else {
            format!("{positional}.0")
        }
    } else {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.abs())
    }
}

/// Parses a remote timestamp into wall-clock time, discarding any offset and
/// sub-second precision. Date-only values land on midnight.
pub fn parse_naive_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    let naive = if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        dt.naive_local()
    } else if let Some(dt) = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
    {
        dt
    } else {
        NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .ok()?
            .and_hms_opt(0, 0, 0)?
    };
    naive.with_nanosecond(0)
}

/// Interprets `naive` as wall-clock time in `tz` and converts to UTC.
///
/// Ambiguous times take standard time (the later instant); times inside a
/// DST gap move forward one hour.
pub fn anchor_local(naive: NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    tz.from_local_datetime(&naive)
        .latest()
        .or_else(|| tz.from_local_datetime(&(naive + TimeDelta::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| naive.and_utc())
}

/// Same day at 23:59:59.
pub fn end_of_day(naive: NaiveDateTime) -> NaiveDateTime {
    naive.date().and_hms_opt(23, 59, 59).unwrap_or(naive)
}

/// Decodes HTML character references (`&amp;`, `&#39;`, `&eacute;`) the way
/// a browser does. Text outside a reference, markup and control characters
/// included, is returned untouched.
pub fn decode_html_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    CHARACTER_REFERENCE
        .replace_all(text, |caps: &Captures| decode_reference(&caps[0]))
        .into_owned()
}

fn decode_reference(reference: &str) -> String {
    Html::parse_fragment(reference)
        .root_element()
        .text()
        .collect()
}

/// Alphanumeric-only, lowercased project title (`"Core API"` → `"coreapi"`).
pub fn project_slug(title: &str) -> String {
    title
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_ascii_lowercase()
}

pub fn resolve_priority(title: Option<&str>, fallback: PriorityCode) -> PriorityCode {
    title.and_then(PriorityCode::from_external).unwrap_or(fallback)
}

pub fn default_description(work_type: &str, id: i64, subject: &str) -> String {
    format!("(bw){work_type}#{id} - {subject}")
}

pub struct Normalizer {
    timezone: Tz,
    base_url: Option<Url>,
    formatter: Arc<dyn DurationFormatter>,
}

impl Normalizer {
    pub fn new(formatter: Arc<dyn DurationFormatter>) -> Self {
        Self {
            timezone: DEFAULT_TIMEZONE,
            base_url: None,
            formatter,
        }
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    /// Base against which `_links.self.href` is resolved into the record URL.
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Validates one raw JSON element and normalizes it.
    pub fn normalize(
        &self,
        raw: &JsonValue,
        origin: &Origin,
    ) -> Result<NormalizedRecord, NormalizationError> {
        let item = RawItem::from_value(raw).map_err(|e| NormalizationError::Malformed {
            item_id: raw_item_id(raw),
            reason: e.to_string(),
        })?;
        self.normalize_item(&item, origin)
    }

    pub fn normalize_item(
        &self,
        item: &RawItem,
        origin: &Origin,
    ) -> Result<NormalizedRecord, NormalizationError> {
        let id = item.id.ok_or(NormalizationError::MissingField {
            item_id: None,
            field: "id",
        })?;
        let raw_subject = item.subject.as_deref().ok_or(NormalizationError::MissingField {
            item_id: Some(id),
            field: "subject",
        })?;
        let work_type = item.type_title().ok_or(NormalizationError::MissingField {
            item_id: Some(id),
            field: "_links.type.title",
        })?;

        let is_milestone = work_type == MILESTONE_TYPE;
        let (due_field, due_raw) = if is_milestone {
            ("date", item.date.as_deref())
        } else {
            ("dueDate", item.due_date.as_deref())
        };

        let due = self.timestamp(id, due_field, due_raw, !is_milestone)?;
        let scheduled = self.timestamp(id, "startDate", item.start_date.as_deref(), false)?;
        let entry = self.timestamp(id, "createdAt", item.created_at.as_deref(), false)?;
        let updated_on = self.timestamp(id, "updatedAt", item.updated_at.as_deref(), false)?;

        let spent_hours = self.duration(id, "spentTime", item.spent_time.as_deref())?;
        let estimated_hours = self.duration(id, "estimatedTime", item.estimated_time.as_deref())?;

        let subject = decode_html_entities(raw_subject);
        let project_tag = self.project_tag(id, item, origin)?;

        let record = NormalizedRecord {
            id,
            summary: default_description(work_type, id, &subject),
            subject,
            url: self.record_url(item),
            description: item
                .description
                .as_ref()
                .and_then(|d| d.raw.clone())
                .unwrap_or_default(),
            work_type: work_type.to_string(),
            tracker: item.author_title().map(ToString::to_string),
            status: item.status_title().map(ToString::to_string),
            author: item.author_title().map(ToString::to_string),
            category: item.category_name().map(ToString::to_string),
            assigned_to: item.assignee_title().map(ToString::to_string),
            project: item.project_title().map(ToString::to_string),
            scheduled,
            entry,
            updated_on,
            due,
            estimated_hours,
            spent_hours,
            priority: resolve_priority(item.priority_title(), origin.default_priority),
            tags: vec![NormalizedRecord::source_tag(id), project_tag],
        };
        trace!(id, "normalized work package");
        Ok(record)
    }

    fn timestamp(
        &self,
        id: i64,
        field: &'static str,
        value: Option<&str>,
        force_end_of_day: bool,
    ) -> Result<Option<DateTime<Utc>>, NormalizationError> {
        let Some(value) = value else {
            return Ok(None);
        };
        let naive = parse_naive_timestamp(value).ok_or_else(|| NormalizationError::InvalidTimestamp {
            item_id: id,
            field,
            value: value.to_string(),
        })?;
        let naive = if force_end_of_day { end_of_day(naive) } else { naive };
        Ok(Some(anchor_local(naive, self.timezone)))
    }

    /// `None` for absent and for exactly-zero durations; otherwise the
    /// formatter's rendering of `"<hours> hours"`.
    fn duration(
        &self,
        id: i64,
        field: &'static str,
        value: Option<&str>,
    ) -> Result<Option<String>, NormalizationError> {
        let Some(value) = value else {
            return Ok(None);
        };
        let hours = parse_iso_duration_hours(value).map_err(|e| NormalizationError::InvalidDuration {
            item_id: id,
            field,
            value: value.to_string(),
            reason: e.to_string(),
        })?;
        if hours == 0.0 {
            return Ok(None);
        }
        let rendered = render_hours(hours);
        self.formatter
            .format_hours(&rendered, hours)
            .map(Some)
            .map_err(|source| NormalizationError::Format {
                item_id: id,
                field,
                source,
            })
    }

    fn project_tag(
        &self,
        id: i64,
        item: &RawItem,
        origin: &Origin,
    ) -> Result<String, NormalizationError> {
        if let Some(name) = origin.project_name.as_deref().filter(|n| !n.is_empty()) {
            return Ok(name.to_string());
        }
        let title = item.project_title().ok_or(NormalizationError::MissingField {
            item_id: Some(id),
            field: "_links.project.title",
        })?;
        let slug = project_slug(title);
        if slug.is_empty() {
            return Err(NormalizationError::EmptyProjectSlug {
                item_id: id,
                title: title.to_string(),
            });
        }
        Ok(slug)
    }

    fn record_url(&self, item: &RawItem) -> Option<String> {
        let href = item.self_href()?;
        match &self.base_url {
            Some(base) => Some(
                base.join(href)
                    .map(|u| u.to_string())
                    .unwrap_or_else(|_| href.to_string()),
            ),
            None => Some(href.to_string()),
        }
    }
}
