//! Core job model and shared result types for jobwatch.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "jobwatch-core";

/// A posting normalized from any ATS vendor.
///
/// `id` is `<vendor>_<company_slug>_<vendor_id>` and never changes for a posting;
/// every other field may drift between fetches without affecting identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub url: String,
    #[serde(default)]
    pub posted_at: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
}

impl Job {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        company: impl Into<String>,
        location: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            company: company.into(),
            location: location.into(),
            url: url.into(),
            posted_at: None,
            department: None,
        }
    }

    pub fn with_posted_at(mut self, posted_at: impl Into<String>) -> Self {
        self.posted_at = Some(posted_at.into());
        self
    }

    pub fn with_department(mut self, department: impl Into<String>) -> Self {
        self.department = Some(department.into());
        self
    }

    /// Posting time if the vendor supplied something parseable.
    pub fn posted_at_utc(&self) -> Option<DateTime<Utc>> {
        self.posted_at.as_deref().and_then(parse_timestamp)
    }
}

/// What the history file remembers about a job id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub title: String,
    pub company: String,
    pub url: String,
    #[serde(with = "lenient_utc")]
    pub first_seen: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn first_observed(job: &Job, now: DateTime<Utc>) -> Self {
        Self {
            title: job.title.clone(),
            company: job.company.clone(),
            url: job.url.clone(),
            first_seen: now,
        }
    }
}

/// A value produced by a boundary that degrades instead of failing.
///
/// Warnings describe what was skipped or defaulted on the way.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Outcome<T> {
    pub value: T,
    pub warnings: Vec<String>,
}

impl<T> Outcome<T> {
    pub fn clean(value: T) -> Self {
        Self {
            value,
            warnings: Vec::new(),
        }
    }

    pub fn with_warning(value: T, warning: impl Into<String>) -> Self {
        Self {
            value,
            warnings: vec![warning.into()],
        }
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn into_parts(self) -> (T, Vec<String>) {
        (self.value, self.warnings)
    }
}

/// Parse vendor timestamps: RFC 3339 (including a trailing `Z`), naive ISO-8601
/// date-times read as UTC, and bare `YYYY-MM-DD` dates. Anything else is `None`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    let naive = raw.trim_end_matches(['Z', 'z']);
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(naive, format) {
            return Some(parsed.and_utc());
        }
    }
    NaiveDate::parse_from_str(naive, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|parsed| parsed.and_utc())
}

/// Serde adapter for history timestamps. Writes RFC 3339 and reads anything
/// [`parse_timestamp`] accepts, so files written without a zone still load.
pub mod lenient_utc {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw)
            .ok_or_else(|| D::Error::custom(format!("unrecognized timestamp {raw:?}")))
    }
}
