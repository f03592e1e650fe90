//! Scraper contract + drivers producing raw tender-result records.
//!
//! How a page becomes fields is the driver's business; everything downstream only
//! sees [`RawCandidate`]s.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use resao_core::RawCandidate;
use resao_storage::{FeedFetchConfig, FeedFetcher, FetchError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "resao-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl ScrapeContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("reading scraper output {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("scraper output is not a record list: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("scraper command `{program}` exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("spawning scraper command `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait TenderScraper: Send + Sync {
    fn name(&self) -> &str;

    /// Runs one scrape to completion. Output is all-or-nothing.
    async fn scrape(&self, ctx: &ScrapeContext) -> Result<Vec<RawCandidate>, ScrapeError>;
}

/// Driver selection as written in `scraper.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScraperConfig {
    Fixture {
        path: PathBuf,
    },
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        /// JSON file the command leaves behind.
        output: PathBuf,
        #[serde(default)]
        working_dir: Option<PathBuf>,
    },
    HttpFeed {
        url: String,
        #[serde(default)]
        user_agent: Option<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
}

pub fn scraper_from_config(config: &ScraperConfig) -> anyhow::Result<Box<dyn TenderScraper>> {
    Ok(match config {
        ScraperConfig::Fixture { path } => Box::new(FixtureScraper::new(path.clone())),
        ScraperConfig::Command {
            program,
            args,
            output,
            working_dir,
        } => Box::new(CommandScraper {
            program: program.clone(),
            args: args.clone(),
            output: output.clone(),
            working_dir: working_dir.clone(),
        }),
        ScraperConfig::HttpFeed {
            url,
            user_agent,
            timeout_secs,
        } => {
            let mut fetch = FeedFetchConfig {
                user_agent: user_agent.clone(),
                ..Default::default()
            };
            if let Some(secs) = timeout_secs {
                fetch.timeout = Duration::from_secs(*secs);
            }
            Box::new(HttpFeedScraper::new(url.clone(), FeedFetcher::new(fetch)?))
        }
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RecordEnvelope {
    List(Vec<RawCandidate>),
    Wrapped {
        #[serde(alias = "data", alias = "results")]
        records: Vec<RawCandidate>,
    },
}

/// Accepts either a bare JSON array or an object with a `records`/`data`/`results` array.
pub fn parse_raw_records(bytes: &[u8]) -> Result<Vec<RawCandidate>, ScrapeError> {
    let envelope: RecordEnvelope = serde_json::from_slice(bytes)?;
    Ok(match envelope {
        RecordEnvelope::List(records) | RecordEnvelope::Wrapped { records } => records,
    })
}

async fn read_records(path: &Path) -> Result<Vec<RawCandidate>, ScrapeError> {
    let bytes = fs::read(path).await.map_err(|source| ScrapeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_raw_records(&bytes)
}

/// Replays a captured scraper output file.
#[derive(Debug, Clone)]
pub struct FixtureScraper {
    path: PathBuf,
}

impl FixtureScraper {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TenderScraper for FixtureScraper {
    fn name(&self) -> &str {
        "fixture"
    }

    async fn scrape(&self, ctx: &ScrapeContext) -> Result<Vec<RawCandidate>, ScrapeError> {
        let records = read_records(&self.path).await?;
        debug!(
            run_id = %ctx.run_id,
            count = records.len(),
            path = %self.path.display(),
            "fixture replayed"
        );
        Ok(records)
    }
}

/// Runs an external browser-automation script and reads the JSON file it writes.
///
/// The child is killed if the scrape future is dropped, so a timed-out run
/// cannot keep writing behind the gate's back.
#[derive(Debug, Clone)]
pub struct CommandScraper {
    pub program: String,
    pub args: Vec<String>,
    pub output: PathBuf,
    pub working_dir: Option<PathBuf>,
}

#[async_trait]
impl TenderScraper for CommandScraper {
    fn name(&self) -> &str {
        "command"
    }

    async fn scrape(&self, ctx: &ScrapeContext) -> Result<Vec<RawCandidate>, ScrapeError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("RESAO_RUN_ID", ctx.run_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        info!(run_id = %ctx.run_id, program = %self.program, "launching scraper command");
        let output = command
            .output()
            .await
            .map_err(|source| ScrapeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ScrapeError::CommandFailed {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: stderr.trim().chars().take(2000).collect(),
            });
        }

        let output_path = match &self.working_dir {
            Some(dir) if self.output.is_relative() => dir.join(&self.output),
            _ => self.output.clone(),
        };
        read_records(&output_path).await
    }
}

/// Pulls a JSON record feed published by a remote scraper service.
#[derive(Debug, Clone)]
pub struct HttpFeedScraper {
    url: String,
    fetcher: FeedFetcher,
}

impl HttpFeedScraper {
    pub fn new(url: String, fetcher: FeedFetcher) -> Self {
        Self { url, fetcher }
    }
}

#[async_trait]
impl TenderScraper for HttpFeedScraper {
    fn name(&self) -> &str {
        "http_feed"
    }

    async fn scrape(&self, ctx: &ScrapeContext) -> Result<Vec<RawCandidate>, ScrapeError> {
        let feed = self.fetcher.fetch(ctx.run_id, &self.url).await?;
        let records = parse_raw_records(&feed.body)?;
        info!(run_id = %ctx.run_id, url = %feed.url, count = records.len(), "feed fetched");
        Ok(records)
    }
}
