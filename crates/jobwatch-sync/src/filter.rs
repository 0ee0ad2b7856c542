//! Keyword filtering, url de-duplication and ranking of fetched jobs.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use jobwatch_core::Job;
use serde::{Deserialize, Serialize};
use tokio::fs;

/// Tier assigned to a location that hits no priority keyword.
pub const UNRANKED_TIER: u32 = 999;

/// Keyword rules read from `rules/search.yaml`.
///
/// An empty `title_include` list matches nothing; the engine reports that as a
/// criteria warning rather than silently letting every title through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchCriteria {
    #[serde(default)]
    pub title_include: Vec<String>,
    #[serde(default)]
    pub title_exclude: Vec<String>,
    #[serde(default)]
    pub location_include: Vec<String>,
    #[serde(default)]
    pub location_exclude: Vec<String>,
    #[serde(default)]
    pub location_priority: BTreeMap<String, u32>,
}

impl SearchCriteria {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing search criteria")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RankMode {
    /// Priority tier of the location, newest first within a tier.
    #[default]
    LocationTier,
    Company,
    Recency,
}

impl RankMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RankMode::LocationTier => "location-tier",
            RankMode::Company => "company",
            RankMode::Recency => "recency",
        }
    }
}

impl fmt::Display for RankMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RankMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "location-tier" | "tier" => Ok(RankMode::LocationTier),
            "company" => Ok(RankMode::Company),
            "recency" | "date" => Ok(RankMode::Recency),
            other => Err(format!(
                "unknown rank mode {other:?} (expected location-tier, company or recency)"
            )),
        }
    }
}

/// Case-folded view of a [`SearchCriteria`]. Every method is pure.
#[derive(Debug, Clone)]
pub struct FilterEngine {
    title_include: Vec<String>,
    title_exclude: Vec<String>,
    location_include: Vec<String>,
    location_exclude: Vec<String>,
    location_priority: Vec<(String, u32)>,
}

/// Lowercases keywords as written; surrounding spaces stay part of the match.
fn fold_all(keywords: &[String]) -> Vec<String> {
    keywords
        .iter()
        .filter(|k| !k.is_empty())
        .map(|k| k.to_lowercase())
        .collect()
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle.as_str()))
}

impl FilterEngine {
    pub fn new(criteria: &SearchCriteria) -> Self {
        Self {
            title_include: fold_all(&criteria.title_include),
            title_exclude: fold_all(&criteria.title_exclude),
            location_include: fold_all(&criteria.location_include),
            location_exclude: fold_all(&criteria.location_exclude),
            location_priority: criteria
                .location_priority
                .iter()
                .filter(|(k, _)| !k.is_empty())
                .map(|(k, tier)| (k.to_lowercase(), *tier))
                .collect(),
        }
    }

    pub fn criteria_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.title_include.is_empty() {
            warnings.push("title_include is empty; no job can match".to_string());
        }
        if self.location_include.is_empty() {
            warnings.push("location_include is empty; no job can match".to_string());
        }
        warnings
    }

    pub fn matches_title(&self, title: &str) -> bool {
        let title = title.to_lowercase();
        contains_any(&title, &self.title_include) && !contains_any(&title, &self.title_exclude)
    }

    pub fn matches_location(&self, location: &str) -> bool {
        let location = location.to_lowercase();
        if location.trim().is_empty() {
            return false;
        }
        contains_any(&location, &self.location_include) && !contains_any(&location, &self.location_exclude)
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.matches_title(&job.title) && self.matches_location(&job.location)
    }

    pub fn filter(&self, jobs: Vec<Job>) -> Vec<Job> {
        jobs.into_iter().filter(|job| self.matches(job)).collect()
    }

    /// Drops later jobs whose url was already seen; order is kept.
    pub fn deduplicate(&self, jobs: Vec<Job>) -> Vec<Job> {
        let mut seen = HashSet::new();
        jobs.into_iter()
            .filter(|job| seen.insert(job.url.clone()))
            .collect()
    }

    /// Lowest tier among priority keywords found in the location.
    pub fn location_tier(&self, location: &str) -> u32 {
        let location = location.to_lowercase();
        self.location_priority
            .iter()
            .filter(|(keyword, _)| location.contains(keyword.as_str()))
            .map(|(_, tier)| *tier)
            .min()
            .unwrap_or(UNRANKED_TIER)
    }

    /// Stable: jobs with equal keys keep their input order.
    pub fn rank(&self, mut jobs: Vec<Job>, mode: RankMode) -> Vec<Job> {
        match mode {
            RankMode::LocationTier => {
                jobs.sort_by_cached_key(|job| (self.location_tier(&job.location), Reverse(job.posted_at_utc())))
            }
            RankMode::Company => jobs.sort_by_cached_key(|job| job.company.to_lowercase()),
            RankMode::Recency => jobs.sort_by_cached_key(|job| Reverse(job.posted_at_utc())),
        }
        jobs
    }

    /// filter, dedupe, rank.
    pub fn process(&self, jobs: Vec<Job>, mode: RankMode) -> Vec<Job> {
        self.rank(self.deduplicate(self.filter(jobs)), mode)
    }
}
