//! Seen-job history persistence + HTTP fetch utilities for jobwatch.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use jobwatch_core::{HistoryRecord, Job, Outcome};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobwatch-storage";

pub const DEFAULT_HISTORY_FILE: &str = "job_history.json";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("reading history file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing history file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("serializing history: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("writing history file {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// On-disk shape of the history file. Unknown fields are ignored so newer
/// writers stay readable.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HistoryFile {
    #[serde(default)]
    last_updated: Option<String>,
    #[serde(default)]
    jobs: BTreeMap<String, HistoryRecord>,
}

/// Result of reconciling history against the currently open set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncDelta {
    pub inserted: usize,
    pub removed: usize,
}

impl SyncDelta {
    pub fn is_empty(&self) -> bool {
        self.inserted == 0 && self.removed == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryStats {
    pub total_tracked: usize,
    pub path: PathBuf,
}

/// Job ids already reported to the user, keyed to when they were first seen.
///
/// Every mutation builds the next map aside, rewrites the whole file through a
/// temp file + rename, and only then replaces the in-memory map. A failed write
/// leaves both the file and the store as they were.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
    records: BTreeMap<String, HistoryRecord>,
}

impl HistoryStore {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: BTreeMap::new(),
        }
    }

    /// Load the store, starting empty (with a warning) when the file is
    /// unreadable or malformed. A missing file is a clean empty store.
    pub async fn load(path: impl Into<PathBuf>) -> Outcome<Self> {
        let path = path.into();
        match read_history_file(&path).await {
            Ok(records) => {
                info!(path = %path.display(), tracked = records.len(), "loaded job history");
                Outcome::clean(Self { path, records })
            }
            Err(err) => {
                warn!(error = %err, "could not load job history; starting empty");
                Outcome::with_warning(Self::empty(path), err.to_string())
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, job_id: &str) -> Option<&HistoryRecord> {
        self.records.get(job_id)
    }

    pub fn records(&self) -> &BTreeMap<String, HistoryRecord> {
        &self.records
    }

    pub fn is_new(&self, job: &Job) -> bool {
        !self.records.contains_key(&job.id)
    }

    pub fn first_seen(&self, job: &Job) -> Option<DateTime<Utc>> {
        self.records.get(&job.id).map(|r| r.first_seen)
    }

    /// Jobs with no history record, in input order.
    pub fn filter_new(&self, jobs: &[Job]) -> Vec<Job> {
        jobs.iter().filter(|job| self.is_new(job)).cloned().collect()
    }

    /// Make the store hold exactly the ids in `current`: records for ids that
    /// are gone are dropped as closed, unseen ids get `first_seen = now`, and
    /// existing records are left untouched.
    pub async fn sync(&mut self, current: &[Job], now: DateTime<Utc>) -> Result<SyncDelta, HistoryError> {
        let current_ids: HashSet<&str> = current.iter().map(|job| job.id.as_str()).collect();

        let mut next = self.records.clone();
        let before = next.len();
        next.retain(|id, _| current_ids.contains(id.as_str()));
        let removed = before - next.len();

        let mut inserted = 0usize;
        for job in current {
            if !next.contains_key(&job.id) {
                next.insert(job.id.clone(), HistoryRecord::first_observed(job, now));
                inserted += 1;
            }
        }

        let delta = SyncDelta { inserted, removed };
        if delta.is_empty() {
            return Ok(delta);
        }

        self.commit(next, now).await?;
        info!(inserted, removed, tracked = self.records.len(), "synced job history");
        Ok(delta)
    }

    /// Drop records first seen more than `max_age_days` before `now`. A window
    /// reaching past the earliest representable time prunes nothing.
    pub async fn cleanup(&mut self, max_age_days: u32, now: DateTime<Utc>) -> Result<usize, HistoryError> {
        let Some(cutoff) = chrono::Duration::try_days(i64::from(max_age_days))
            .and_then(|window| now.checked_sub_signed(window))
        else {
            return Ok(0);
        };
        let mut next = self.records.clone();
        next.retain(|_, record| record.first_seen >= cutoff);
        let pruned = self.records.len() - next.len();
        if pruned == 0 {
            return Ok(0);
        }

        self.commit(next, now).await?;
        info!(pruned, max_age_days, "pruned stale job history");
        Ok(pruned)
    }

    /// Forget everything and persist the empty store.
    pub async fn reset(&mut self, now: DateTime<Utc>) -> Result<usize, HistoryError> {
        let cleared = self.records.len();
        self.commit(BTreeMap::new(), now).await?;
        Ok(cleared)
    }

    pub fn stats(&self) -> HistoryStats {
        HistoryStats {
            total_tracked: self.records.len(),
            path: self.path.clone(),
        }
    }

    async fn commit(
        &mut self,
        next: BTreeMap<String, HistoryRecord>,
        now: DateTime<Utc>,
    ) -> Result<(), HistoryError> {
        let file = HistoryFile {
            last_updated: Some(now.to_rfc3339_opts(SecondsFormat::Micros, true)),
            jobs: next,
        };
        let bytes = serde_json::to_vec_pretty(&file).map_err(HistoryError::Serialize)?;
        write_atomically(&self.path, &bytes)
            .await
            .map_err(|source| HistoryError::Write {
                path: self.path.clone(),
                source,
            })?;
        self.records = file.jobs;
        Ok(())
    }
}

async fn read_history_file(path: &Path) -> Result<BTreeMap<String, HistoryRecord>, HistoryError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(source) => {
            return Err(HistoryError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let file: HistoryFile = serde_json::from_slice(&bytes).map_err(|source| HistoryError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(file.jobs)
}

/// Replace `path` with `bytes` via a sibling temp file and rename, so readers
/// only ever see the old or the new contents.
async fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let written = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if written.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    written
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

/// One GET per call with a fixed timeout. No retries: a failure is reported
/// once and the caller decides how to degrade.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
