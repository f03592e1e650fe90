//! Scrape trigger and status gate.
//!
//! All transitions happen under one async mutex; readers get the last published
//! [`GateSnapshot`] from a watch channel and never wait on a running scrape.
//! Scrapes, imports, and restart recovery also hold the staging directory's lease, so
//! a CLI gate and a server gate sharing one directory cannot step on each other.

use std::sync::Arc;
use std::time::Duration;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use resao_adapters::{ScrapeContext, TenderScraper};
use resao_core::{BatchStatus, CanonicalRecord, RawCandidate, StagingBatch};
use resao_storage::{FileLock, StagingStore};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::reconcile::{ImportError, ImportReport, Reconciler};
use crate::report::ImportReportWriter;

/// Extra time the watchdog grants past the scrape ceiling before forcing failure.
const WATCHDOG_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GateState {
    Idle,
    Running {
        run_id: Uuid,
        started_at: DateTime<Utc>,
    },
    Ready {
        run_id: Uuid,
        finished_at: DateTime<Utc>,
        count: usize,
    },
    Importing {
        run_id: Uuid,
    },
    Failed {
        run_id: Uuid,
        error: String,
        failed_at: DateTime<Utc>,
    },
}

impl GateState {
    pub fn name(&self) -> &'static str {
        match self {
            GateState::Idle => "idle",
            GateState::Running { .. } => "running",
            GateState::Ready { .. } => "ready",
            GateState::Importing { .. } => "importing",
            GateState::Failed { .. } => "failed",
        }
    }

    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            GateState::Idle => None,
            GateState::Running { run_id, .. }
            | GateState::Ready { run_id, .. }
            | GateState::Importing { run_id }
            | GateState::Failed { run_id, .. } => Some(*run_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GateSnapshot {
    pub state: GateState,
    pub batch: Option<Arc<StagingBatch>>,
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("a scrape is already running (run {0})")]
    AlreadyRunning(Uuid),
    #[error("an import is in progress (run {0})")]
    ImportInProgress(Uuid),
    #[error("no scraped batch is ready for import")]
    NotReady,
    #[error("another process is using the staging directory")]
    StagingBusy,
    #[error("scrape exceeded its {0:?} ceiling")]
    Timeout(Duration),
    #[error("scrape failed: {0}")]
    ScrapeFailed(String),
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error("staging store: {0:#}")]
    Staging(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateSettings {
    pub scrape_timeout: Duration,
    pub preview_size: usize,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            scrape_timeout: Duration::from_secs(300),
            preview_size: 5,
        }
    }
}

/// Canonical record formatted for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRecord {
    pub reference: String,
    pub maitre_ouvrage: String,
    pub objet: String,
    pub ville: String,
    pub budget: Option<String>,
    pub montant: Option<String>,
    pub adjudicataire: String,
    pub date_ouverture: Option<String>,
    pub date_adjudication: Option<String>,
    pub date_affichage: Option<String>,
    pub file_links: Vec<String>,
}

impl From<&CanonicalRecord> for PreviewRecord {
    fn from(record: &CanonicalRecord) -> Self {
        let date = |d: Option<NaiveDate>| d.map(|d| d.format("%d/%m/%Y").to_string());
        Self {
            reference: record.reference.clone(),
            maitre_ouvrage: record.maitre_ouvrage.clone(),
            objet: record.objet.clone(),
            ville: record.ville.clone(),
            budget: record.budget.as_ref().map(format_amount),
            montant: record.montant.as_ref().map(format_amount),
            adjudicataire: record.adjudicataire.clone(),
            date_ouverture: date(record.date_ouverture),
            date_adjudication: date(record.date_adjudication),
            date_affichage: date(record.date_affichage),
            file_links: record.file_links.clone(),
        }
    }
}

/// `1198450.5` → `1 198 450,50`
pub fn format_amount(value: &BigDecimal) -> String {
    let plain = value.with_scale(2).to_string();
    let (integer, decimals) = plain.split_once('.').unwrap_or((plain.as_str(), "00"));
    let digits: Vec<char> = integer.chars().collect();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.iter().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(' ');
        }
        grouped.push(*c);
    }
    format!("{grouped},{decimals}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<Vec<PreviewRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

struct GateInner {
    state: GateState,
    batch: Option<Arc<StagingBatch>>,
    worker: Option<AbortHandle>,
    lease: Option<FileLock>,
}

pub struct ScrapeGate {
    scraper: Arc<dyn TenderScraper>,
    staging: StagingStore,
    reconciler: Arc<Reconciler>,
    reports: Option<ImportReportWriter>,
    settings: GateSettings,
    inner: Mutex<GateInner>,
    published: watch::Sender<GateSnapshot>,
}

impl ScrapeGate {
    pub fn new(
        scraper: Arc<dyn TenderScraper>,
        staging: StagingStore,
        reconciler: Arc<Reconciler>,
        settings: GateSettings,
    ) -> Self {
        let (published, _) = watch::channel(GateSnapshot {
            state: GateState::Idle,
            batch: None,
        });
        Self {
            scraper,
            staging,
            reconciler,
            reports: None,
            settings,
            inner: Mutex::new(GateInner {
                state: GateState::Idle,
                batch: None,
                worker: None,
                lease: None,
            }),
            published,
        }
    }

    pub fn with_reports(mut self, writer: ImportReportWriter) -> Self {
        self.reports = Some(writer);
        self
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn settings(&self) -> GateSettings {
        self.settings
    }

    /// Rebuilds state from the staging store after a restart.
    pub async fn restore(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        match self.staging.try_lease().await? {
            Some(_lease) => {
                if let Some(run_id) = self.staging.expire_interrupted().await? {
                    warn!(%run_id, "expired batch left collecting by an interrupted run");
                }
            }
            None => warn!(
                dir = %self.staging.dir().display(),
                "staging directory in use by another process; leaving its batch alone"
            ),
        }
        if let Some(batch) = self.staging.current().await? {
            if batch.status == BatchStatus::Ready {
                info!(run_id = %batch.run_id, count = batch.records.len(), "restored ready batch");
                inner.state = ready_state(&batch);
                inner.batch = Some(Arc::new(batch));
                self.publish(&inner);
            }
        }
        Ok(())
    }

    /// Last published state; never waits on a running scrape.
    pub fn snapshot(&self) -> GateSnapshot {
        self.published.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GateSnapshot> {
        self.published.subscribe()
    }

    /// Current state, after forcing an overdue run to `failed` when the lock is free.
    pub async fn status(&self) -> GateSnapshot {
        if let Ok(mut inner) = self.inner.try_lock() {
            self.enforce_deadline(&mut inner).await;
        }
        self.snapshot()
    }

    /// Starts a scrape run in the background and returns its id.
    pub async fn start_scrape(self: &Arc<Self>) -> Result<Uuid, GateError> {
        let mut inner = self.inner.lock().await;
        self.enforce_deadline(&mut inner).await;
        match inner.state {
            GateState::Running { run_id, .. } => return Err(GateError::AlreadyRunning(run_id)),
            GateState::Importing { run_id } => return Err(GateError::ImportInProgress(run_id)),
            _ => {}
        }
        let lease = self.lease().await?;

        let run_id = Uuid::new_v4();
        let batch = self.staging.begin(run_id).await.map_err(GateError::Staging)?;
        let span = info_span!("scrape_run", %run_id, scraper = self.scraper.name());
        span.in_scope(|| info!("scrape started"));

        let scraper = Arc::clone(&self.scraper);
        let ctx = ScrapeContext {
            run_id,
            started_at: batch.started_at,
        };
        let worker =
            tokio::spawn(async move { scraper.scrape(&ctx).await }.instrument(span.clone()));
        inner.worker = Some(worker.abort_handle());
        inner.lease = Some(lease);

        let gate = Arc::clone(self);
        tokio::spawn(async move { gate.supervise(run_id, worker).await }.instrument(span));

        inner.state = GateState::Running {
            run_id,
            started_at: batch.started_at,
        };
        inner.batch = None;
        self.publish(&inner);
        Ok(run_id)
    }

    /// Waits until `run_id` is no longer running.
    pub async fn wait_settled(&self, run_id: Uuid) -> GateSnapshot {
        let mut rx = self.subscribe();
        let settled = rx
            .wait_for(|s| !is_running(&s.state, run_id))
            .await
            .map(|s| s.clone());
        settled.unwrap_or_else(|_| self.snapshot())
    }

    async fn supervise(
        &self,
        run_id: Uuid,
        worker: JoinHandle<Result<Vec<RawCandidate>, resao_adapters::ScrapeError>>,
    ) {
        let ceiling = self.settings.scrape_timeout;
        let abort = worker.abort_handle();
        let outcome = match tokio::time::timeout(ceiling, worker).await {
            Ok(Ok(Ok(records))) => Ok(records),
            Ok(Ok(Err(err))) => Err(GateError::ScrapeFailed(err.to_string())),
            Ok(Err(join)) if join.is_cancelled() => {
                Err(GateError::ScrapeFailed("scrape cancelled".into()))
            }
            Ok(Err(join)) => {
                Err(GateError::ScrapeFailed(format!("scraper panicked: {join}")))
            }
            Err(_) => {
                // Dropping the scrape future also kills a scraper child process.
                abort.abort();
                Err(GateError::Timeout(ceiling))
            }
        };
        self.finish_run(run_id, outcome).await;
    }

    async fn finish_run(&self, run_id: Uuid, outcome: Result<Vec<RawCandidate>, GateError>) {
        let mut inner = self.inner.lock().await;
        if !is_running(&inner.state, run_id) {
            debug!(%run_id, "run already settled; result dropped");
            return;
        }
        inner.worker = None;

        match outcome {
            Ok(records) => match self.staging.complete(run_id, records).await {
                Ok(batch) => {
                    info!(count = batch.records.len(), "scrape finished; batch ready");
                    inner.state = ready_state(&batch);
                    inner.batch = Some(Arc::new(batch));
                }
                Err(err) => {
                    let err = GateError::Staging(err);
                    error!(error = %err, "could not stage scrape output");
                    self.fail(&mut inner, run_id, err.to_string()).await;
                }
            },
            Err(err) => {
                error!(error = %err, "scrape failed");
                self.fail(&mut inner, run_id, err.to_string()).await;
            }
        }
        inner.lease = None;
        self.publish(&inner);
    }

    async fn fail(&self, inner: &mut GateInner, run_id: Uuid, message: String) {
        if let Err(err) = self.staging.discard(run_id).await {
            warn!(%run_id, error = %format!("{err:#}"), "could not discard partial batch");
        }
        inner.state = GateState::Failed {
            run_id,
            error: message,
            failed_at: Utc::now(),
        };
        inner.batch = None;
        inner.lease = None;
    }

    async fn lease(&self) -> Result<FileLock, GateError> {
        match self.staging.try_lease().await {
            Ok(Some(lease)) => Ok(lease),
            Ok(None) => Err(GateError::StagingBusy),
            Err(err) => Err(GateError::Staging(err)),
        }
    }

    async fn enforce_deadline(&self, inner: &mut GateInner) {
        let GateState::Running { run_id, started_at } = inner.state else {
            return;
        };
        let limit = self.settings.scrape_timeout + WATCHDOG_GRACE;
        let elapsed = (Utc::now() - started_at).to_std().unwrap_or_default();
        if elapsed <= limit {
            return;
        }

        warn!(%run_id, elapsed_secs = elapsed.as_secs(), "scrape overdue; forcing failure");
        if let Some(worker) = inner.worker.take() {
            worker.abort();
        }
        let message = GateError::Timeout(self.settings.scrape_timeout).to_string();
        self.fail(inner, run_id, message).await;
        self.publish(inner);
    }

    /// Freshness check: count, timestamp and a display preview of the ready batch.
    pub fn check_available(&self) -> Availability {
        let snapshot = self.snapshot();
        match (&snapshot.state, &snapshot.batch) {
            (GateState::Ready { run_id, finished_at, count }, Some(batch)) => {
                let normalizer = self.reconciler.normalizer();
                let preview = batch
                    .records
                    .iter()
                    .filter_map(|raw| normalizer.normalize(raw).ok())
                    .take(self.settings.preview_size)
                    .map(|record| PreviewRecord::from(&record))
                    .collect();
                Availability {
                    available: true,
                    run_id: Some(*run_id),
                    count: Some(*count),
                    last_modified: Some(*finished_at),
                    preview: Some(preview),
                    message: Some(format!("{count} scraped records ready for import")),
                }
            }
            (state, _) => Availability {
                available: false,
                run_id: state.run_id(),
                count: None,
                last_modified: None,
                preview: None,
                message: Some(match state {
                    GateState::Running { .. } => "a scrape is still running".to_string(),
                    GateState::Importing { .. } => "an import is in progress".to_string(),
                    GateState::Failed { error, .. } => format!("last scrape failed: {error}"),
                    _ => "no new data available".to_string(),
                }),
            },
        }
    }

    /// Imports the ready batch; on storage failure the batch stays ready for a retry.
    ///
    /// The batch is re-read from staging first. If another process imported or replaced
    /// it, the gate adopts what is staged now and the import is refused.
    pub async fn confirm_import(&self) -> Result<ImportReport, GateError> {
        let (batch, lease) = {
            let mut inner = self.inner.lock().await;
            let run_id = match (&inner.state, &inner.batch) {
                (GateState::Ready { run_id, .. }, Some(_)) => *run_id,
                (GateState::Importing { run_id }, _) => {
                    return Err(GateError::ImportInProgress(*run_id))
                }
                _ => return Err(GateError::NotReady),
            };
            let lease = self.lease().await?;
            let staged = self.staging.current().await.map_err(GateError::Staging)?;
            let batch = match staged {
                Some(batch) if batch.run_id == run_id && batch.status == BatchStatus::Ready => {
                    Arc::new(batch)
                }
                other => {
                    info!(%run_id, "staged batch changed underneath the gate");
                    self.adopt_staged(&mut inner, other);
                    return Err(GateError::NotReady);
                }
            };
            inner.state = GateState::Importing { run_id };
            inner.batch = Some(Arc::clone(&batch));
            self.publish(&inner);
            (batch, lease)
        };

        let result = self.reconciler.import_batch(&batch).await;

        let mut inner = self.inner.lock().await;
        let report = match result {
            Ok(report) => report,
            Err(err) => {
                inner.state = ready_state(&batch);
                self.publish(&inner);
                return Err(err.into());
            }
        };

        if let Err(err) = self.staging.mark_imported(batch.run_id).await {
            warn!(
                run_id = %batch.run_id,
                error = %format!("{err:#}"),
                "could not archive imported batch"
            );
        }
        drop(lease);
        inner.state = GateState::Idle;
        inner.batch = None;
        self.publish(&inner);
        drop(inner);

        self.write_report(&report).await;
        Ok(report)
    }

    fn adopt_staged(&self, inner: &mut GateInner, staged: Option<StagingBatch>) {
        match staged {
            Some(batch) if batch.status == BatchStatus::Ready => {
                inner.state = ready_state(&batch);
                inner.batch = Some(Arc::new(batch));
            }
            _ => {
                inner.state = GateState::Idle;
                inner.batch = None;
            }
        }
        self.publish(inner);
    }

    /// Clears a failed run; returns whether there was one to clear.
    pub async fn acknowledge_failure(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if !matches!(inner.state, GateState::Failed { .. }) {
            return false;
        }
        inner.state = GateState::Idle;
        self.publish(&inner);
        true
    }

    async fn write_report(&self, report: &ImportReport) {
        let Some(writer) = &self.reports else {
            return;
        };
        let tenders = match self.reconciler.repository().load_all().await {
            Ok(tenders) => tenders,
            Err(err) => {
                warn!(run_id = %report.run_id, error = %err, "could not load tenders for report");
                return;
            }
        };
        match writer.write(report, &tenders).await {
            Ok(dir) => info!(
                run_id = %report.run_id,
                dir = %dir.display(),
                "import report written"
            ),
            Err(err) => warn!(
                run_id = %report.run_id,
                error = %format!("{err:#}"),
                "import report failed"
            ),
        }
    }

    fn publish(&self, inner: &GateInner) {
        self.published.send_replace(GateSnapshot {
            state: inner.state.clone(),
            batch: inner.batch.clone(),
        });
    }
}

fn is_running(state: &GateState, run_id: Uuid) -> bool {
    matches!(state, GateState::Running { run_id: current, .. } if *current == run_id)
}

fn ready_state(batch: &StagingBatch) -> GateState {
    GateState::Ready {
        run_id: batch.run_id,
        finished_at: batch.finished_at.unwrap_or(batch.started_at),
        count: batch.records.len(),
    }
}
