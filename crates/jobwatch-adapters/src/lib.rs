//! Source adapter contract + ATS job-board adapters (Greenhouse, Ashby, Lever).

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use jobwatch_core::{Job, Outcome};
use jobwatch_storage::HttpFetcher;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobwatch-adapters";

const UNKNOWN_TITLE: &str = "Unknown Title";
const UNKNOWN_LOCATION: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Greenhouse,
    Ashby,
    Lever,
}

impl Vendor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Vendor::Greenhouse => "greenhouse",
            Vendor::Ashby => "ashby",
            Vendor::Lever => "lever",
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            Vendor::Greenhouse => "https://boards-api.greenhouse.io/v1/boards",
            Vendor::Ashby => "https://api.ashbyhq.com/posting-api/job-board",
            Vendor::Lever => "https://api.lever.co/v0/postings",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{vendor}:{slug}: board document is not valid JSON of the expected shape: {source}")]
    Document {
        vendor: Vendor,
        slug: String,
        source: serde_json::Error,
    },
}

/// One company's board on one ATS vendor.
///
/// `fetch_jobs` never fails: transport errors and unusable documents become an
/// empty list with a warning, and records that cannot be mapped are skipped
/// one at a time.
#[async_trait]
pub trait JobSource: Send + Sync {
    fn vendor(&self) -> Vendor;
    fn slug(&self) -> &str;
    fn display_name(&self) -> &str;
    fn board_url(&self) -> String;

    fn parse_board(&self, body: &[u8]) -> Result<Outcome<Vec<Job>>, AdapterError>;

    fn source_id(&self) -> String {
        format!("{}:{}", self.vendor(), self.slug())
    }

    async fn fetch_jobs(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Outcome<Vec<Job>> {
        let source_id = self.source_id();
        let url = self.board_url();
        let response = match http.fetch_bytes(ctx.run_id, &source_id, &url).await {
            Ok(response) => response,
            Err(err) => {
                warn!(%source_id, error = %err, "fetch failed; treating board as empty");
                return Outcome::with_warning(
                    Vec::new(),
                    format!("{source_id}: error fetching jobs for {}: {err}", self.display_name()),
                );
            }
        };

        match self.parse_board(&response.body) {
            Ok(outcome) => {
                for warning in &outcome.warnings {
                    warn!(%source_id, "{warning}");
                }
                info!(%source_id, jobs = outcome.value.len(), "fetched board");
                outcome
            }
            Err(err) => {
                warn!(%source_id, error = %err, "unparseable board; treating as empty");
                Outcome::with_warning(Vec::new(), err.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Board {
    vendor: Vendor,
    slug: String,
    display_name: String,
    base_url: String,
}

impl Board {
    fn new(vendor: Vendor, slug: &str, display_name: &str) -> Self {
        Self {
            vendor,
            slug: slug.to_string(),
            display_name: display_name.to_string(),
            base_url: vendor.default_base_url().to_string(),
        }
    }

    fn job_id(&self, vendor_id: &str) -> String {
        format!("{}_{}_{}", self.vendor, self.slug, vendor_id)
    }

    fn skipped(&self, index: usize, reason: impl fmt::Display) -> String {
        format!("{}:{}: skipped record {index}: {reason}", self.vendor, self.slug)
    }

    fn document_error(&self, source: serde_json::Error) -> AdapterError {
        AdapterError::Document {
            vendor: self.vendor,
            slug: self.slug.clone(),
            source,
        }
    }

    /// Deserialize each record on its own so one bad record only costs itself.
    fn map_records<R, F>(&self, records: Vec<JsonValue>, mut to_job: F) -> Outcome<Vec<Job>>
    where
        R: DeserializeOwned,
        F: FnMut(&Self, R) -> Result<Job, String>,
    {
        let mut outcome = Outcome::clean(Vec::with_capacity(records.len()));
        for (index, raw) in records.into_iter().enumerate() {
            let record = match serde_json::from_value::<R>(raw) {
                Ok(record) => record,
                Err(err) => {
                    outcome.warn(self.skipped(index, err));
                    continue;
                }
            };
            match to_job(self, record) {
                Ok(job) => outcome.value.push(job),
                Err(reason) => outcome.warn(self.skipped(index, reason)),
            }
        }
        outcome
    }
}

#[derive(Debug, Deserialize)]
struct JobsEnvelope {
    #[serde(default)]
    jobs: Vec<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GreenhouseRecord {
    #[serde(default)]
    id: Option<JsonValue>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    location: Option<JsonValue>,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    departments: Option<Vec<NamedRef>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AshbyRecord {
    #[serde(default)]
    id: Option<JsonValue>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    job_url: Option<String>,
    #[serde(default)]
    published_at: Option<String>,
    #[serde(default)]
    department: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LeverCategories {
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    team: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeverRecord {
    #[serde(default)]
    id: Option<JsonValue>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    hosted_url: Option<String>,
    #[serde(default)]
    created_at: Option<JsonValue>,
    #[serde(default)]
    categories: Option<LeverCategories>,
}

fn scalar_id(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text_or_none(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Lever reports epoch milliseconds; everything downstream expects ISO-8601.
fn lever_timestamp(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::Number(n) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Secs, true)),
        JsonValue::String(s) => text_or_none(Some(s.clone())),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreenhouseBoard(Board);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AshbyBoard(Board);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeverBoard(Board);

macro_rules! board_constructors {
    ($ty:ident, $vendor:expr) => {
        impl $ty {
            pub fn new(slug: &str, display_name: &str) -> Self {
                Self(Board::new($vendor, slug, display_name))
            }

            /// Point the adapter at a different API root (mirrors, tests).
            pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
                self.0.base_url = base_url.into().trim_end_matches('/').to_string();
                self
            }
        }
    };
}

board_constructors!(GreenhouseBoard, Vendor::Greenhouse);
board_constructors!(AshbyBoard, Vendor::Ashby);
board_constructors!(LeverBoard, Vendor::Lever);

#[async_trait]
impl JobSource for GreenhouseBoard {
    fn vendor(&self) -> Vendor {
        self.0.vendor
    }

    fn slug(&self) -> &str {
        &self.0.slug
    }

    fn display_name(&self) -> &str {
        &self.0.display_name
    }

    fn board_url(&self) -> String {
        format!("{}/{}/jobs", self.0.base_url, self.0.slug)
    }

    fn parse_board(&self, body: &[u8]) -> Result<Outcome<Vec<Job>>, AdapterError> {
        let envelope: JobsEnvelope =
            serde_json::from_slice(body).map_err(|e| self.0.document_error(e))?;
        Ok(self.0.map_records(envelope.jobs, |board, record: GreenhouseRecord| {
            let vendor_id = scalar_id(record.id.as_ref()).ok_or("missing id")?;
            let location = record
                .location
                .as_ref()
                .and_then(|loc| loc.get("name"))
                .and_then(JsonValue::as_str)
                .map(ToString::to_string)
                .unwrap_or_else(|| UNKNOWN_LOCATION.to_string());
            let department = record
                .departments
                .and_then(|departments| departments.into_iter().next())
                .and_then(|department| text_or_none(department.name));
            Ok(Job {
                id: board.job_id(&vendor_id),
                title: record.title.unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
                company: board.display_name.clone(),
                location,
                url: format!("https://boards.greenhouse.io/{}/jobs/{}", board.slug, vendor_id),
                posted_at: text_or_none(record.updated_at),
                department,
            })
        }))
    }
}

#[async_trait]
impl JobSource for AshbyBoard {
    fn vendor(&self) -> Vendor {
        self.0.vendor
    }

    fn slug(&self) -> &str {
        &self.0.slug
    }

    fn display_name(&self) -> &str {
        &self.0.display_name
    }

    fn board_url(&self) -> String {
        format!("{}/{}", self.0.base_url, self.0.slug)
    }

    fn parse_board(&self, body: &[u8]) -> Result<Outcome<Vec<Job>>, AdapterError> {
        let envelope: JobsEnvelope =
            serde_json::from_slice(body).map_err(|e| self.0.document_error(e))?;
        Ok(self.0.map_records(envelope.jobs, |board, record: AshbyRecord| {
            let vendor_id = scalar_id(record.id.as_ref()).ok_or("missing id")?;
            let url = text_or_none(record.job_url).unwrap_or_else(|| {
                format!("https://jobs.ashbyhq.com/{}/{}", board.slug, vendor_id)
            });
            Ok(Job {
                id: board.job_id(&vendor_id),
                title: record.title.unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
                company: board.display_name.clone(),
                location: record.location.unwrap_or_else(|| UNKNOWN_LOCATION.to_string()),
                url,
                posted_at: text_or_none(record.published_at),
                department: text_or_none(record.department),
            })
        }))
    }
}

#[async_trait]
impl JobSource for LeverBoard {
    fn vendor(&self) -> Vendor {
        self.0.vendor
    }

    fn slug(&self) -> &str {
        &self.0.slug
    }

    fn display_name(&self) -> &str {
        &self.0.display_name
    }

    fn board_url(&self) -> String {
        format!("{}/{}", self.0.base_url, self.0.slug)
    }

    fn parse_board(&self, body: &[u8]) -> Result<Outcome<Vec<Job>>, AdapterError> {
        let records: Vec<JsonValue> =
            serde_json::from_slice(body).map_err(|e| self.0.document_error(e))?;
        Ok(self.0.map_records(records, |board, record: LeverRecord| {
            let vendor_id = scalar_id(record.id.as_ref()).ok_or("missing id")?;
            let categories = record.categories.unwrap_or_default();
            let url = text_or_none(record.hosted_url)
                .unwrap_or_else(|| format!("https://jobs.lever.co/{}/{}", board.slug, vendor_id));
            Ok(Job {
                id: board.job_id(&vendor_id),
                title: record.text.unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
                company: board.display_name.clone(),
                location: categories
                    .location
                    .unwrap_or_else(|| UNKNOWN_LOCATION.to_string()),
                url,
                posted_at: lever_timestamp(record.created_at.as_ref()),
                department: text_or_none(categories.team),
            })
        }))
    }
}

pub fn greenhouse_board(slug: &str, display_name: &str) -> GreenhouseBoard {
    GreenhouseBoard::new(slug, display_name)
}

pub fn ashby_board(slug: &str, display_name: &str) -> AshbyBoard {
    AshbyBoard::new(slug, display_name)
}

pub fn lever_board(slug: &str, display_name: &str) -> LeverBoard {
    LeverBoard::new(slug, display_name)
}

pub fn adapter_for(vendor: Vendor, slug: &str, display_name: &str) -> Box<dyn JobSource> {
    match vendor {
        Vendor::Greenhouse => Box::new(greenhouse_board(slug, display_name)),
        Vendor::Ashby => Box::new(ashby_board(slug, display_name)),
        Vendor::Lever => Box::new(lever_board(slug, display_name)),
    }
}

/// Read a saved board response from disk and run it through the adapter's parser.
pub fn parse_board_file(source: &dyn JobSource, path: impl AsRef<Path>) -> Result<Outcome<Vec<Job>>> {
    let path = path.as_ref();
    let body = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    source
        .parse_board(&body)
        .with_context(|| format!("parsing {}", path.display()))
}
