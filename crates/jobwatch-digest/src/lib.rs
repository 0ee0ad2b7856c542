//! Digest composition, askama rendering and delivery channels for jobwatch.

use std::path::PathBuf;

use askama::Template;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_core::Job;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "jobwatch-digest";

pub const SENDGRID_ENDPOINT: &str = "https://api.sendgrid.com/v3/mail/send";

/// A report of new and currently open matches, ready to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    pub hot: Vec<Job>,
    pub all: Vec<Job>,
    pub source_count: usize,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct DigestRow {
    title: String,
    company: String,
    location: String,
    department: String,
    url: String,
}

impl From<&Job> for DigestRow {
    fn from(job: &Job) -> Self {
        Self {
            title: job.title.clone(),
            company: job.company.clone(),
            location: job.location.clone(),
            department: job.department.clone().unwrap_or_default(),
            url: job.url.clone(),
        }
    }
}

#[derive(Template)]
#[template(path = "digest.html")]
struct DigestHtmlTemplate {
    date_line: String,
    hot: Vec<DigestRow>,
    all: Vec<DigestRow>,
    source_count: usize,
}

#[derive(Template)]
#[template(path = "digest.txt")]
struct DigestTextTemplate {
    date_line: String,
    hot: Vec<DigestRow>,
    all: Vec<DigestRow>,
    source_count: usize,
}

impl Digest {
    pub fn compose(hot: Vec<Job>, all: Vec<Job>, source_count: usize, generated_at: DateTime<Utc>) -> Self {
        Self {
            hot,
            all,
            source_count,
            generated_at,
        }
    }

    pub fn subject(&self) -> String {
        let date = self.generated_at.format("%b %d");
        if self.hot.is_empty() {
            format!("Job Digest: {} open positions ({date})", self.all.len())
        } else {
            format!(
                "Job Digest: {} new, {} open positions ({date})",
                self.hot.len(),
                self.all.len()
            )
        }
    }

    fn date_line(&self) -> String {
        self.generated_at.format("%A, %B %d, %Y").to_string()
    }

    fn rows(jobs: &[Job]) -> Vec<DigestRow> {
        jobs.iter().map(DigestRow::from).collect()
    }

    pub fn render_html(&self) -> Result<String, NotifyError> {
        let tpl = DigestHtmlTemplate {
            date_line: self.date_line(),
            hot: Self::rows(&self.hot),
            all: Self::rows(&self.all),
            source_count: self.source_count,
        };
        Ok(tpl.render()?)
    }

    pub fn render_text(&self) -> Result<String, NotifyError> {
        let tpl = DigestTextTemplate {
            date_line: self.date_line(),
            hot: Self::rows(&self.hot),
            all: Self::rows(&self.all),
            source_count: self.source_count,
        };
        Ok(tpl.render()?)
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("{0} not configured")]
    MissingCredentials(&'static str),
    #[error("rendering digest: {0}")]
    Render(#[from] askama::Error),
    #[error("sending digest: {0}")]
    Request(#[from] reqwest::Error),
    #[error("mail provider rejected digest with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("writing digest preview {}: {source}", .path.display())]
    Preview {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub channel: &'static str,
    pub recipients: usize,
    pub status: Option<u16>,
    pub preview_path: Option<PathBuf>,
}

/// A delivery channel. The pipeline only looks at whether `deliver` succeeded.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn channel(&self) -> &'static str;

    async fn deliver(&self, digest: &Digest) -> Result<DeliveryReceipt, NotifyError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifierConfig {
    pub api_key: Option<String>,
    pub from_email: Option<String>,
    pub to_emails: Vec<String>,
}

impl NotifierConfig {
    pub fn from_env() -> Self {
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            api_key: non_empty("SENDGRID_API_KEY"),
            from_email: non_empty("FROM_EMAIL"),
            to_emails: std::env::var("TO_EMAIL")
                .map(|v| split_recipients(&v))
                .unwrap_or_default(),
        }
    }
}

/// `TO_EMAIL` may hold several comma-separated addresses.
pub fn split_recipients(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[derive(Debug, Serialize)]
struct SendGridAddress<'a> {
    email: &'a str,
}

#[derive(Debug, Serialize)]
struct SendGridPersonalization<'a> {
    to: Vec<SendGridAddress<'a>>,
}

#[derive(Debug, Serialize)]
struct SendGridContent {
    #[serde(rename = "type")]
    content_type: &'static str,
    value: String,
}

#[derive(Debug, Serialize)]
struct SendGridMessage<'a> {
    personalizations: Vec<SendGridPersonalization<'a>>,
    from: SendGridAddress<'a>,
    subject: String,
    content: Vec<SendGridContent>,
}

pub struct SendGridNotifier {
    config: NotifierConfig,
    client: reqwest::Client,
    endpoint: String,
}

impl SendGridNotifier {
    pub fn new(config: NotifierConfig, client: reqwest::Client) -> Self {
        Self {
            config,
            client,
            endpoint: SENDGRID_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn message<'a>(&'a self, from: &'a str, digest: &Digest) -> Result<SendGridMessage<'a>, NotifyError> {
        Ok(SendGridMessage {
            personalizations: vec![SendGridPersonalization {
                to: self
                    .config
                    .to_emails
                    .iter()
                    .map(|email| SendGridAddress { email })
                    .collect(),
            }],
            from: SendGridAddress { email: from },
            subject: digest.subject(),
            content: vec![
                SendGridContent {
                    content_type: "text/plain",
                    value: digest.render_text()?,
                },
                SendGridContent {
                    content_type: "text/html",
                    value: digest.render_html()?,
                },
            ],
        })
    }
}

#[async_trait]
impl Notifier for SendGridNotifier {
    fn channel(&self) -> &'static str {
        "sendgrid"
    }

    async fn deliver(&self, digest: &Digest) -> Result<DeliveryReceipt, NotifyError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(NotifyError::MissingCredentials("SENDGRID_API_KEY"))?;
        let from = self
            .config
            .from_email
            .as_deref()
            .ok_or(NotifyError::MissingCredentials("FROM_EMAIL"))?;
        if self.config.to_emails.is_empty() {
            return Err(NotifyError::MissingCredentials("TO_EMAIL"));
        }

        let message = self.message(from, digest)?;
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&message)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !matches!(status, 200 | 201 | 202) {
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected { status, body });
        }

        info!(
            recipients = self.config.to_emails.len(),
            subject = %message.subject,
            "digest email sent"
        );
        Ok(DeliveryReceipt {
            channel: self.channel(),
            recipients: self.config.to_emails.len(),
            status: Some(status),
            preview_path: None,
        })
    }
}

/// Logs what would be sent and optionally keeps the rendered HTML on disk.
#[derive(Debug, Clone, Default)]
pub struct DryRunNotifier {
    preview_dir: Option<PathBuf>,
    to_emails: Vec<String>,
}

impl DryRunNotifier {
    pub fn new(to_emails: Vec<String>) -> Self {
        Self {
            preview_dir: None,
            to_emails,
        }
    }

    pub fn with_preview_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.preview_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl Notifier for DryRunNotifier {
    fn channel(&self) -> &'static str {
        "dry-run"
    }

    async fn deliver(&self, digest: &Digest) -> Result<DeliveryReceipt, NotifyError> {
        let html = digest.render_html()?;
        info!(
            to = %self.to_emails.join(","),
            subject = %digest.subject(),
            hot = digest.hot.len(),
            open = digest.all.len(),
            "dry run: digest not sent"
        );

        let preview_path = match &self.preview_dir {
            Some(dir) => {
                let path = dir.join("digest.html");
                let written = async {
                    fs::create_dir_all(dir).await?;
                    fs::write(&path, html.as_bytes()).await
                }
                .await;
                if let Err(source) = written {
                    warn!(path = %path.display(), error = %source, "could not write digest preview");
                    return Err(NotifyError::Preview { path, source });
                }
                Some(path)
            }
            None => None,
        };

        Ok(DeliveryReceipt {
            channel: self.channel(),
            recipients: self.to_emails.len(),
            status: None,
            preview_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn sample_digest(hot: usize) -> Digest {
        let all = vec![
            Job::new("a", "Senior Accountant", "Figma", "San Francisco, CA", "https://x/a")
                .with_department("Finance"),
            Job::new("b", "Staff Accountant <Remote>", "Ramp", "Remote", "https://x/b"),
        ];
        let hot = all.iter().take(hot).cloned().collect();
        Digest::compose(
            hot,
            all,
            3,
            Utc.with_ymd_and_hms(2024, 3, 5, 8, 0, 0).single().unwrap(),
        )
    }

    #[test]
    fn subject_mentions_new_count_only_when_present() {
        assert_eq!(sample_digest(1).subject(), "Job Digest: 1 new, 2 open positions (Mar 05)");
        assert_eq!(sample_digest(0).subject(), "Job Digest: 2 open positions (Mar 05)");
    }

    #[test]
    fn html_render_escapes_and_lists_sections() {
        let html = sample_digest(1).render_html().unwrap();
        assert!(html.contains("Tuesday, March 05, 2024"));
        assert!(html.contains("1 New Since Last Digest"));
        assert!(html.contains("Staff Accountant &lt;Remote&gt;"));
        assert!(html.contains("Finance"));
        assert!(html.contains("Monitoring 3 job boards"));
    }

    #[test]
    fn html_render_omits_new_section_when_nothing_is_new() {
        let html = sample_digest(0).render_html().unwrap();
        assert!(!html.contains("New Since Last Digest"));
        assert!(html.contains("All Open Positions"));
    }

    #[test]
    fn text_render_is_unescaped() {
        let text = sample_digest(1).render_text().unwrap();
        assert!(text.contains("Staff Accountant <Remote>"));
        assert!(text.contains("Figma | San Francisco, CA | Finance"));
    }

    #[test]
    fn recipients_are_split_and_trimmed() {
        assert_eq!(
            split_recipients(" a@x.com, ,b@y.org,"),
            vec!["a@x.com".to_string(), "b@y.org".to_string()]
        );
    }

    #[tokio::test]
    async fn sendgrid_without_api_key_fails_before_any_request() {
        let notifier = SendGridNotifier::new(
            NotifierConfig {
                api_key: None,
                from_email: Some("jobs@example.com".into()),
                to_emails: vec!["me@example.com".into()],
            },
            reqwest::Client::new(),
        );
        let err = notifier.deliver(&sample_digest(1)).await.unwrap_err();
        assert!(matches!(err, NotifyError::MissingCredentials("SENDGRID_API_KEY")));
    }

    #[tokio::test]
    async fn sendgrid_transport_failure_is_an_error() {
        let notifier = SendGridNotifier::new(
            NotifierConfig {
                api_key: Some("key".into()),
                from_email: Some("jobs@example.com".into()),
                to_emails: vec!["me@example.com".into()],
            },
            reqwest::Client::new(),
        )
        .with_endpoint("http://127.0.0.1:9/v3/mail/send");
        let err = notifier.deliver(&sample_digest(1)).await.unwrap_err();
        assert!(matches!(err, NotifyError::Request(_)));
    }

    #[test]
    fn sendgrid_message_puts_plain_text_before_html() {
        let notifier = SendGridNotifier::new(
            NotifierConfig {
                api_key: Some("key".into()),
                from_email: Some("jobs@example.com".into()),
                to_emails: vec!["a@x.com".into(), "b@y.org".into()],
            },
            reqwest::Client::new(),
        );
        let digest = sample_digest(1);
        let message = notifier.message("jobs@example.com", &digest).unwrap();
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["personalizations"][0]["to"][1]["email"], "b@y.org");
        assert_eq!(value["content"][0]["type"], "text/plain");
        assert_eq!(value["content"][1]["type"], "text/html");
        assert_eq!(value["subject"], "Job Digest: 1 new, 2 open positions (Mar 05)");
    }

    #[tokio::test]
    async fn dry_run_writes_preview_and_succeeds() {
        let dir = tempdir().unwrap();
        let notifier = DryRunNotifier::new(vec!["me@example.com".into()])
            .with_preview_dir(dir.path().join("reports").join("run-1"));
        let receipt = notifier.deliver(&sample_digest(1)).await.unwrap();
        let path = receipt.preview_path.expect("preview path");
        assert!(std::fs::read_to_string(path).unwrap().contains("Senior Accountant"));
        assert_eq!(receipt.channel, "dry-run");
    }
}
