use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use jobwatch_adapters::{greenhouse_board, AdapterContext, AdapterError, JobSource, Vendor};
use jobwatch_core::{Job, Outcome};
use jobwatch_digest::{DeliveryReceipt, Digest, Notifier, NotifyError};
use jobwatch_storage::{HistoryStore, HttpFetcher};
use jobwatch_sync::{FilterEngine, RankMode, RunOptions, SearchCriteria, SyncConfig, SyncPipeline};
use tempfile::tempdir;

struct FixedSource {
    jobs: Vec<Job>,
}

#[async_trait]
impl JobSource for FixedSource {
    fn vendor(&self) -> Vendor {
        Vendor::Greenhouse
    }

    fn slug(&self) -> &str {
        "fixed"
    }

    fn display_name(&self) -> &str {
        "Fixed"
    }

    fn board_url(&self) -> String {
        "http://127.0.0.1:9/unused".to_string()
    }

    fn parse_board(&self, _body: &[u8]) -> Result<Outcome<Vec<Job>>, AdapterError> {
        Ok(Outcome::clean(self.jobs.clone()))
    }

    async fn fetch_jobs(&self, _http: &HttpFetcher, _ctx: &AdapterContext) -> Outcome<Vec<Job>> {
        Outcome::clean(self.jobs.clone())
    }
}

/// Records each digest it sees and fails when told to.
struct RecordingNotifier {
    fail: bool,
    calls: Arc<AtomicUsize>,
    last_hot: Arc<std::sync::Mutex<Vec<String>>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn channel(&self) -> &'static str {
        "recording"
    }

    async fn deliver(&self, digest: &Digest) -> Result<DeliveryReceipt, NotifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut hot) = self.last_hot.lock() {
            *hot = digest.hot.iter().map(|j| j.id.clone()).collect();
        }
        if self.fail {
            return Err(NotifyError::Rejected {
                status: 500,
                body: "boom".into(),
            });
        }
        Ok(DeliveryReceipt {
            channel: "recording",
            recipients: 1,
            status: Some(202),
            preview_path: None,
        })
    }
}

fn config(root: PathBuf) -> SyncConfig {
    SyncConfig {
        workspace_root: root,
        history_path: PathBuf::from("job_history.json"),
        user_agent: "jobwatch-test".into(),
        http_timeout_secs: 1,
        retention_days: 90,
        dry_run: false,
    }
}

fn criteria() -> SearchCriteria {
    SearchCriteria {
        title_include: vec!["accountant".into()],
        title_exclude: vec!["manager".into()],
        location_include: vec!["remote".into(), "san francisco".into()],
        location_exclude: Vec::new(),
        location_priority: BTreeMap::from([("san francisco".to_string(), 1), ("remote".to_string(), 2)]),
    }
}

fn jobs() -> Vec<Job> {
    vec![
        Job::new("greenhouse_fixed_1", "Senior Accountant", "Fixed", "Remote", "https://x/1")
            .with_posted_at("2024-01-02T00:00:00Z"),
        Job::new("greenhouse_fixed_2", "Accounting Manager", "Fixed", "Remote", "https://x/2"),
        Job::new("greenhouse_fixed_3", "Staff Accountant", "Fixed", "San Francisco, CA", "https://x/3"),
        Job::new("greenhouse_fixed_4", "Staff Accountant (dup)", "Fixed", "Remote", "https://x/3"),
    ]
}

fn pipeline(
    root: PathBuf,
    jobs: Vec<Job>,
    fail: bool,
) -> (SyncPipeline, Arc<AtomicUsize>, Arc<std::sync::Mutex<Vec<String>>>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let last_hot = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sources: Vec<Box<dyn JobSource>> = vec![Box::new(FixedSource { jobs })];
    let pipeline = SyncPipeline::new(config(root), sources, FilterEngine::new(&criteria()))
        .unwrap()
        .with_notifier(Box::new(RecordingNotifier {
            fail,
            calls: calls.clone(),
            last_hot: last_hot.clone(),
        }));
    (pipeline, calls, last_hot)
}

#[tokio::test]
async fn failed_delivery_leaves_history_file_untouched() {
    let dir = tempdir().unwrap();
    let (pipeline, calls, _) = pipeline(dir.path().to_path_buf(), jobs(), true);

    let summary = pipeline.run_once(&RunOptions::default()).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!summary.delivered);
    assert_eq!(summary.new, 2);
    assert_eq!(summary.inserted, 0);
    assert!(!dir.path().join("job_history.json").exists());
    assert!(summary.warnings.iter().any(|w| w.starts_with("recording:")));
}

#[tokio::test]
async fn failed_delivery_keeps_records_for_postings_missing_from_the_fetch() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("job_history.json");
    let mut seeded = HistoryStore::empty(&path);
    let closed = Job::new("greenhouse_fixed_closed", "Staff Accountant", "Fixed", "Remote", "https://x/closed");
    seeded.sync(&[closed], chrono::Utc::now()).await.unwrap();
    let before = std::fs::read(&path).unwrap();

    let (pipeline, _, _) = pipeline(dir.path().to_path_buf(), jobs(), true);
    let summary = pipeline.run_once(&RunOptions::default()).await.unwrap();

    assert!(!summary.delivered);
    assert_eq!((summary.inserted, summary.removed, summary.pruned), (0, 0, 0));
    assert_eq!(std::fs::read(&path).unwrap(), before);
    let reloaded = HistoryStore::load(&path).await.value;
    assert!(reloaded.get("greenhouse_fixed_closed").is_some());
    assert!(reloaded.get("greenhouse_fixed_1").is_none());
}

#[tokio::test]
async fn successful_delivery_syncs_history_and_second_run_has_nothing_new() {
    let dir = tempdir().unwrap();
    let (first, _, first_hot) = pipeline(dir.path().to_path_buf(), jobs(), false);

    let summary = first.run_once(&RunOptions::default()).await.unwrap();
    assert!(summary.delivered);
    assert_eq!(summary.fetched, 4);
    assert_eq!(summary.matched, 3);
    assert_eq!(summary.unique, 2);
    assert_eq!(summary.inserted, 2);
    // San Francisco outranks the newer remote job.
    assert_eq!(
        *first_hot.lock().unwrap(),
        vec!["greenhouse_fixed_3".to_string(), "greenhouse_fixed_1".to_string()]
    );

    let text = std::fs::read_to_string(dir.path().join("job_history.json")).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert!(doc["jobs"]["greenhouse_fixed_1"]["first_seen"].is_string());
    assert!(doc["jobs"].get("greenhouse_fixed_2").is_none());

    let (second, _, second_hot) = pipeline(dir.path().to_path_buf(), jobs(), false);
    let summary = second.run_once(&RunOptions::default()).await.unwrap();
    assert!(summary.delivered);
    assert_eq!(summary.new, 0);
    assert_eq!((summary.inserted, summary.removed), (0, 0));
    assert!(second_hot.lock().unwrap().is_empty());
}

#[tokio::test]
async fn closed_postings_drop_out_of_history_after_delivery() {
    let dir = tempdir().unwrap();
    let (first, _, _) = pipeline(dir.path().to_path_buf(), jobs(), false);
    first.run_once(&RunOptions::default()).await.unwrap();

    let still_open = vec![jobs().remove(0)];
    let (second, _, _) = pipeline(dir.path().to_path_buf(), still_open, false);
    let summary = second.run_once(&RunOptions::default()).await.unwrap();
    assert_eq!(summary.removed, 1);

    let text = std::fs::read_to_string(dir.path().join("job_history.json")).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert!(doc["jobs"].get("greenhouse_fixed_3").is_none());
    assert!(doc["jobs"].get("greenhouse_fixed_1").is_some());
}

#[tokio::test]
async fn no_filter_and_reset_history_report_everything_as_new() {
    let dir = tempdir().unwrap();
    let (first, _, _) = pipeline(dir.path().to_path_buf(), jobs(), false);
    first.run_once(&RunOptions::default()).await.unwrap();

    let (second, _, _) = pipeline(dir.path().to_path_buf(), jobs(), false);
    let options = RunOptions {
        no_filter: true,
        reset_history: true,
        rank_mode: RankMode::Company,
        ..RunOptions::default()
    };
    let summary = second.run_once(&options).await.unwrap();
    assert_eq!(summary.matched, 4);
    assert_eq!(summary.unique, 3);
    assert_eq!(summary.new, 3);
}

#[tokio::test]
async fn unreachable_board_degrades_to_a_warning() {
    let dir = tempdir().unwrap();
    let sources: Vec<Box<dyn JobSource>> =
        vec![Box::new(greenhouse_board("figma", "Figma").with_base_url("http://127.0.0.1:9"))];
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = SyncPipeline::new(config(dir.path().to_path_buf()), sources, FilterEngine::new(&criteria()))
        .unwrap()
        .with_notifier(Box::new(RecordingNotifier {
            fail: false,
            calls: calls.clone(),
            last_hot: Arc::new(std::sync::Mutex::new(Vec::new())),
        }));

    let summary = pipeline.run_once(&RunOptions::default()).await.unwrap();
    assert_eq!(summary.fetched, 0);
    assert!(summary.delivered);
    assert!(summary.warnings.iter().any(|w| w.contains("Figma")));
}
