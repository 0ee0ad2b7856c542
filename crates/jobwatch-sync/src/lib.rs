//! Poll-filter-notify pipeline: source registry, search rules and the run that
//! ties adapters, history and digest delivery together.

pub mod filter;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use jobwatch_adapters::{adapter_for, AdapterContext, JobSource, Vendor};
use jobwatch_digest::{Digest, DryRunNotifier, Notifier, NotifierConfig, SendGridNotifier};
use jobwatch_storage::{HistoryStore, HttpClientConfig, HttpFetcher, DEFAULT_HISTORY_FILE};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use filter::{FilterEngine, RankMode, SearchCriteria, UNRANKED_TIER};

pub const CRATE_NAME: &str = "jobwatch-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub vendor: Vendor,
    pub slug: String,
    pub display_name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled_adapters(&self) -> Vec<Box<dyn JobSource>> {
        self.sources
            .iter()
            .filter(|s| s.enabled)
            .map(|s| adapter_for(s.vendor, &s.slug, &s.display_name))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub history_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub retention_days: u32,
    pub dry_run: bool,
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(false)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            workspace_root: std::env::var("JOBWATCH_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            history_path: std::env::var("JOBWATCH_HISTORY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_HISTORY_FILE)),
            user_agent: std::env::var("JOBWATCH_USER_AGENT")
                .unwrap_or_else(|_| format!("jobwatch/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: std::env::var("JOBWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            retention_days: std::env::var("JOBWATCH_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(90),
            dry_run: env_flag("DRY_RUN"),
        }
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    /// Relative history paths resolve against the workspace root.
    pub fn resolved_history_path(&self) -> PathBuf {
        self.workspace_root.join(&self.history_path)
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn criteria_path(&self) -> PathBuf {
        self.workspace_root.join("rules").join("search.yaml")
    }

    pub fn reports_dir(&self, run_id: Uuid) -> PathBuf {
        self.workspace_root.join("reports").join(run_id.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub dry_run: bool,
    pub no_filter: bool,
    pub reset_history: bool,
    pub rank_mode: RankMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub sources: usize,
    pub fetched: usize,
    pub matched: usize,
    pub unique: usize,
    pub new: usize,
    pub delivered: bool,
    pub inserted: usize,
    pub removed: usize,
    pub pruned: usize,
    pub warnings: Vec<String>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    run_id: Uuid,
    http: HttpFetcher,
    sources: Vec<Box<dyn JobSource>>,
    engine: FilterEngine,
    notifier: Box<dyn Notifier>,
}

impl SyncPipeline {
    /// Builds the pipeline with the notifier implied by `config.dry_run`.
    pub fn new(config: SyncConfig, sources: Vec<Box<dyn JobSource>>, engine: FilterEngine) -> Result<Self> {
        let run_id = Uuid::new_v4();
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let notifier_config = NotifierConfig::from_env();
        let notifier: Box<dyn Notifier> = if config.dry_run {
            Box::new(DryRunNotifier::new(notifier_config.to_emails).with_preview_dir(config.reports_dir(run_id)))
        } else {
            Box::new(SendGridNotifier::new(notifier_config, http.client().clone()))
        };
        Ok(Self {
            config,
            run_id,
            http,
            sources,
            engine,
            notifier,
        })
    }

    /// Reads `sources.yaml` and `rules/search.yaml` under the workspace root.
    pub async fn from_workspace(config: SyncConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.sources_path()).await?;
        let criteria = SearchCriteria::load(&config.criteria_path()).await?;
        let sources = registry.enabled_adapters();
        Self::new(config, sources, FilterEngine::new(&criteria))
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub async fn run_once(&self, options: &RunOptions) -> Result<SyncRunSummary> {
        let span = info_span!("sync_run", run_id = %self.run_id, rank = %options.rank_mode);
        self.run_inner(options).instrument(span).await
    }

    async fn run_inner(&self, options: &RunOptions) -> Result<SyncRunSummary> {
        let run_id = self.run_id;
        let mut warnings = Vec::new();

        let (mut history, load_warnings) = HistoryStore::load(self.config.resolved_history_path())
            .await
            .into_parts();
        warnings.extend(load_warnings);

        if options.reset_history {
            match history.reset(Utc::now()).await {
                Ok(cleared) => info!(cleared, "job history reset"),
                Err(err) => {
                    warn!(error = %err, "could not reset job history");
                    warnings.push(err.to_string());
                }
            }
        }

        let ctx = AdapterContext { run_id };
        let mut fetched = Vec::new();
        for source in &self.sources {
            let (jobs, source_warnings) = source.fetch_jobs(&self.http, &ctx).await.into_parts();
            info!(source = %source.display_name(), jobs = jobs.len(), "source done");
            fetched.extend(jobs);
            warnings.extend(source_warnings);
        }
        let fetched_count = fetched.len();

        let matched = if options.no_filter {
            info!("skipping keyword filters");
            fetched
        } else {
            for warning in self.engine.criteria_warnings() {
                warn!("{warning}");
                warnings.push(warning);
            }
            self.engine.filter(fetched)
        };
        let matched_count = matched.len();
        let unique = self.engine.deduplicate(matched);
        let ranked = self.engine.rank(unique, options.rank_mode);
        let hot = history.filter_new(&ranked);
        info!(
            fetched = fetched_count,
            matched = matched_count,
            unique = ranked.len(),
            new = hot.len(),
            "jobs reconciled"
        );

        let new_count = hot.len();
        let unique_count = ranked.len();
        let digest = Digest::compose(hot, ranked, self.sources.len(), Utc::now());
        let delivered = match self.notifier.deliver(&digest).await {
            Ok(receipt) => {
                info!(channel = receipt.channel, recipients = receipt.recipients, "digest delivered");
                true
            }
            Err(err) => {
                warn!(channel = self.notifier.channel(), error = %err, "digest delivery failed; history not advanced");
                warnings.push(format!("{}: {err}", self.notifier.channel()));
                false
            }
        };

        let (mut inserted, mut removed, mut pruned) = (0, 0, 0);
        if delivered {
            match history.sync(&digest.all, Utc::now()).await {
                Ok(delta) => {
                    inserted = delta.inserted;
                    removed = delta.removed;
                    info!(inserted, removed, tracked = history.len(), "job history synced");
                }
                Err(err) => {
                    warn!(error = %err, "could not persist job history");
                    warnings.push(err.to_string());
                }
            }
        } else {
            match history.cleanup(self.config.retention_days, Utc::now()).await {
                Ok(count) => {
                    pruned = count;
                    if count > 0 {
                        info!(pruned, retention_days = self.config.retention_days, "pruned old history records");
                    }
                }
                Err(err) => {
                    warn!(error = %err, "could not persist pruned job history");
                    warnings.push(err.to_string());
                }
            }
        }

        Ok(SyncRunSummary {
            run_id,
            sources: self.sources.len(),
            fetched: fetched_count,
            matched: matched_count,
            unique: unique_count,
            new: new_count,
            delivered,
            inserted,
            removed,
            pruned,
            warnings,
        })
    }
}

/// Loads config from the environment, overlays `options`, and runs once.
pub async fn run_sync_once_from_env(options: RunOptions, workspace: Option<PathBuf>) -> Result<SyncRunSummary> {
    let mut config = SyncConfig::from_env();
    if let Some(root) = workspace {
        config = config.with_workspace_root(root);
    }
    config.dry_run |= options.dry_run;
    let options = RunOptions {
        dry_run: config.dry_run,
        ..options
    };
    let pipeline = SyncPipeline::from_workspace(config).await?;
    pipeline.run_once(&options).await
}
