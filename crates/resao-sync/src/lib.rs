//! Tender-result ingestion pipeline: normalize, match, reconcile, gate.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use resao_adapters::{scraper_from_config, ScraperConfig};
use resao_storage::{
    ArchiveStore, JsonFileTenderRepository, PgTenderRepository, StagingStore, TenderRepository,
};
use serde::Deserialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub mod catalog;
pub mod gate;
pub mod matching;
pub mod normalize;
pub mod reconcile;
pub mod report;

pub use catalog::{filter_options, list_tenders, FilterOptions, TenderFilter};
pub use gate::{
    Availability, GateError, GateSettings, GateSnapshot, GateState, PreviewRecord, ScrapeGate,
};
pub use matching::{
    classify, fingerprint, identity_key, Classified, MatchVerdict, StoredRecordLookup, TenderIndex,
};
pub use normalize::{Normalizer, NormalizerConfig, RejectionReason};
pub use reconcile::{EditError, FieldEdits, ImportError, ImportReport, Reconciler};
pub use report::ImportReportWriter;

pub const CRATE_NAME: &str = "resao-sync";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: Option<String>,
    pub data_dir: PathBuf,
    pub scrape_timeout_secs: u64,
    pub preview_size: usize,
    pub scheduler_enabled: bool,
    pub scrape_cron: String,
    pub scraper_config: PathBuf,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            data_dir: std::env::var("RESAO_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            scrape_timeout_secs: std::env::var("RESAO_SCRAPE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            preview_size: std::env::var("RESAO_PREVIEW_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            scheduler_enabled: std::env::var("RESAO_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            scrape_cron: std::env::var("RESAO_SCRAPE_CRON")
                .unwrap_or_else(|_| "0 0 7 * * *".to_string()),
            scraper_config: std::env::var("RESAO_SCRAPER_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./scraper.yaml")),
        }
    }

    /// Defaults rooted at `data_dir`, file-backed, scheduler off.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>, scraper_config: impl Into<PathBuf>) -> Self {
        Self {
            database_url: None,
            data_dir: data_dir.into(),
            scrape_timeout_secs: 300,
            preview_size: 5,
            scheduler_enabled: false,
            scrape_cron: "0 0 7 * * *".to_string(),
            scraper_config: scraper_config.into(),
        }
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.data_dir.join("archives")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join("reports")
    }

    pub fn tenders_file(&self) -> PathBuf {
        self.data_dir.join("tenders.json")
    }

    pub fn gate_settings(&self) -> GateSettings {
        GateSettings {
            scrape_timeout: Duration::from_secs(self.scrape_timeout_secs),
            preview_size: self.preview_size,
        }
    }
}

/// Contents of `scraper.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PipelineSettings {
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
}

impl PipelineSettings {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// PostgreSQL when `DATABASE_URL` is set, otherwise the JSON snapshot file.
pub async fn open_repository(config: &PipelineConfig) -> Result<Arc<dyn TenderRepository>> {
    match &config.database_url {
        Some(url) => {
            let repo = PgTenderRepository::connect(url)
                .await
                .context("connecting to DATABASE_URL")?;
            info!("using PostgreSQL tender repository");
            Ok(Arc::new(repo))
        }
        None => {
            let path = config.tenders_file();
            info!(path = %path.display(), "using JSON file tender repository");
            Ok(Arc::new(JsonFileTenderRepository::new(path)))
        }
    }
}

pub struct Pipeline {
    pub config: PipelineConfig,
    pub gate: Arc<ScrapeGate>,
    pub archives: ArchiveStore,
}

impl Pipeline {
    pub async fn build(config: PipelineConfig) -> Result<Self> {
        let settings = PipelineSettings::load(&config.scraper_config).await?;
        let repo = open_repository(&config).await?;
        Self::with_repository(config, settings, repo).await
    }

    pub async fn with_repository(
        config: PipelineConfig,
        settings: PipelineSettings,
        repo: Arc<dyn TenderRepository>,
    ) -> Result<Self> {
        let scraper = scraper_from_config(&settings.scraper)?;
        let reconciler = Arc::new(Reconciler::new(repo, Normalizer::new(settings.normalizer)));
        let gate = ScrapeGate::new(
            Arc::from(scraper),
            StagingStore::new(config.staging_dir()),
            reconciler,
            config.gate_settings(),
        )
        .with_reports(ImportReportWriter::new(config.reports_dir()));
        gate.restore().await.context("restoring gate from staging store")?;

        Ok(Self {
            archives: ArchiveStore::new(config.archive_dir()),
            gate: Arc::new(gate),
            config,
        })
    }
}

pub async fn build_pipeline_from_env() -> Result<Pipeline> {
    Pipeline::build(PipelineConfig::from_env()).await
}

/// Periodic scrape trigger; `None` when the scheduler is disabled.
pub async fn maybe_build_scheduler(
    config: &PipelineConfig,
    gate: Arc<ScrapeGate>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.scrape_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let gate = Arc::clone(&gate);
        Box::pin(async move {
            match gate.start_scrape().await {
                Ok(run_id) => info!(%run_id, "scheduled scrape started"),
                Err(GateError::AlreadyRunning(run_id)) => {
                    warn!(%run_id, "scheduled scrape skipped; a run is already active")
                }
                Err(GateError::StagingBusy) => {
                    warn!("scheduled scrape skipped; another process holds the staging directory")
                }
                Err(err) => warn!(error = %err, "scheduled scrape not started"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use resao_storage::MemoryTenderRepository;
    use tempfile::tempdir;

    #[test]
    fn settings_parse_from_yaml_with_default_normalizer() {
        let settings: PipelineSettings = serde_yaml::from_str(
            "scraper:\n  kind: fixture\n  path: fixtures/global-marches/sample.json\n",
        )
        .expect("yaml");
        assert!(matches!(settings.scraper, ScraperConfig::Fixture { .. }));
        assert_eq!(settings.normalizer, NormalizerConfig::default());

        let custom: PipelineSettings = serde_yaml::from_str(
            "scraper:\n  kind: http_feed\n  url: http://localhost:9000/results\n\
             normalizer:\n  currency_suffixes: [dh]\n",
        )
        .expect("yaml");
        assert_eq!(custom.normalizer.currency_suffixes, vec!["dh".to_string()]);
        assert_eq!(custom.normalizer.date_formats, NormalizerConfig::default().date_formats);
    }

    #[test]
    fn data_layout_hangs_off_data_dir() {
        let config = PipelineConfig::for_data_dir("/srv/resao", "scraper.yaml");
        assert_eq!(config.staging_dir(), PathBuf::from("/srv/resao/staging"));
        assert_eq!(config.archive_dir(), PathBuf::from("/srv/resao/archives"));
        assert_eq!(config.tenders_file(), PathBuf::from("/srv/resao/tenders.json"));
        assert_eq!(config.gate_settings().scrape_timeout, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn scheduler_is_off_unless_enabled() {
        let dir = tempdir().expect("tempdir");
        let config = PipelineConfig::for_data_dir(dir.path(), dir.path().join("scraper.yaml"));
        let settings = PipelineSettings {
            scraper: ScraperConfig::Fixture {
                path: dir.path().join("absent.json"),
            },
            normalizer: NormalizerConfig::default(),
        };
        let repo = Arc::new(MemoryTenderRepository::new());
        let pipeline = Pipeline::with_repository(config.clone(), settings, repo)
            .await
            .expect("pipeline");
        assert!(maybe_build_scheduler(&config, pipeline.gate.clone())
            .await
            .expect("scheduler")
            .is_none());
    }
}
