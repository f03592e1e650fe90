//! Axum JSON surface for the scrape/import workflow and the tender catalog.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use resao_core::{StoredRecord, TenderField};
use resao_storage::{ArchiveError, ArchiveStore};
use resao_sync::{
    filter_options, list_tenders, EditError, FieldEdits, GateError, GateState, ImportError,
    Pipeline, ScrapeGate, TenderFilter,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "resao-web";

#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<ScrapeGate>,
    pub archives: ArchiveStore,
}

impl AppState {
    pub fn new(gate: Arc<ScrapeGate>, archives: ArchiveStore) -> Self {
        Self { gate, archives }
    }

    pub fn from_pipeline(pipeline: &Pipeline) -> Self {
        Self::new(Arc::clone(&pipeline.gate), pipeline.archives.clone())
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/scrape/start", post(start_scrape_handler))
        .route("/scrape/status", get(status_handler))
        .route("/scrape/available", get(available_handler))
        .route("/scrape/import", post(import_handler))
        .route("/scrape/acknowledge", post(acknowledge_handler))
        .route("/tenders", get(tenders_handler))
        .route("/tenders/filter-options", get(filter_options_handler))
        .route("/tenders/{id}", patch(edit_tender_handler))
        .route("/tenders/{id}/protection/{field}", delete(release_protection_handler))
        .route("/dao/list", get(dao_list_handler))
        .route("/dao/download", get(dao_download_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("RESAO_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let pipeline = resao_sync::build_pipeline_from_env().await?;
    let gate = Arc::clone(&pipeline.gate);
    let scheduler = resao_sync::maybe_build_scheduler(&pipeline.config, gate).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await?;
        info!(cron = %pipeline.config.scrape_cron, "scrape scheduler started");
    }
    serve(AppState::from_pipeline(&pipeline), port).await
}

/// JSON error body `{success: false, message}` with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "success": false, "message": self.message })),
        )
            .into_response()
    }
}

impl From<GateError> for ApiError {
    fn from(err: GateError) -> Self {
        let status = match &err {
            GateError::AlreadyRunning(_)
            | GateError::ImportInProgress(_)
            | GateError::NotReady
            | GateError::StagingBusy => StatusCode::CONFLICT,
            GateError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GateError::ScrapeFailed(_) => StatusCode::BAD_GATEWAY,
            GateError::Import(_) | GateError::Staging(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match &err {
            GateError::AlreadyRunning(_) => {
                "a scrape is already running, try again later".to_string()
            }
            GateError::ImportInProgress(_) | GateError::StagingBusy => {
                "another scrape or import is in progress, try again later".to_string()
            }
            GateError::Import(ImportError::Storage(_)) => {
                "import failed; nothing was written and the batch can be retried".to_string()
            }
            GateError::Staging(_) => "staging store unavailable".to_string(),
            other => other.to_string(),
        };
        if status.is_server_error() {
            error!(error = %err, "request failed");
        }
        Self::new(status, message)
    }
}

impl From<EditError> for ApiError {
    fn from(err: EditError) -> Self {
        match err {
            EditError::NotFound(id) => {
                Self::new(StatusCode::NOT_FOUND, format!("tender {id} not found"))
            }
            EditError::InvalidValue { .. } | EditError::InsufficientIdentity => {
                Self::new(StatusCode::BAD_REQUEST, err.to_string())
            }
            EditError::Storage(inner) => {
                error!(error = %inner, "tender edit failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable")
            }
        }
    }
}

impl From<ArchiveError> for ApiError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::InvalidPath(_) => Self::new(StatusCode::BAD_REQUEST, err.to_string()),
            ArchiveError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, err.to_string()),
            ArchiveError::Io(inner) => {
                error!(error = %inner, "archive read failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "archive store unavailable")
            }
        }
    }
}

fn storage_error(err: impl std::fmt::Display) -> ApiError {
    error!(error = %err, "tender store read failed");
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable")
}

#[derive(Debug, Default, Deserialize)]
struct StartQuery {
    #[serde(default)]
    wait: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    success: bool,
    message: String,
    run_id: Uuid,
    status: &'static str,
    has_new_data: bool,
    record_count: Option<usize>,
}

async fn start_scrape_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StartQuery>,
) -> Result<Json<StartResponse>, ApiError> {
    let run_id = state.gate.start_scrape().await?;
    if !query.wait {
        return Ok(Json(StartResponse {
            success: true,
            message: "scrape started".to_string(),
            run_id,
            status: "running",
            has_new_data: false,
            record_count: None,
        }));
    }

    let settled = state.gate.wait_settled(run_id).await;
    match settled.state {
        GateState::Ready { count, .. } => Ok(Json(StartResponse {
            success: true,
            message: if count > 0 {
                format!("{count} records scraped and ready for import")
            } else {
                "scrape finished without new records".to_string()
            },
            run_id,
            status: "ready",
            has_new_data: count > 0,
            record_count: Some(count),
        })),
        GateState::Failed { error, .. } => {
            warn!(%run_id, %error, "scrape failed");
            Err(ApiError::new(StatusCode::BAD_GATEWAY, error))
        }
        other => Ok(Json(StartResponse {
            success: true,
            message: format!("run settled as {}", other.name()),
            run_id,
            status: other.name(),
            has_new_data: false,
            record_count: None,
        })),
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    state: GateState,
    status: &'static str,
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let snapshot = state.gate.status().await;
    Json(StatusResponse {
        status: snapshot.state.name(),
        state: snapshot.state,
    })
}

async fn available_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.gate.check_available()).into_response()
}

#[derive(Debug, Default, Serialize)]
struct ImportStatsBody {
    imported: usize,
    updated: usize,
    unchanged: usize,
    skipped: usize,
    conflicts: usize,
    total: usize,
    errors: usize,
}

async fn import_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.gate.confirm_import().await {
        Ok(report) => {
            let stats = &report.stats;
            let message = format!(
                "import finished: {} created, {} updated, {} unchanged, {} errors",
                stats.created,
                stats.updated,
                stats.unchanged,
                stats.error_count()
            );
            Json(json!({
                "success": true,
                "message": message,
                "runId": report.run_id,
                "stats": ImportStatsBody {
                    imported: stats.created,
                    updated: stats.updated,
                    unchanged: stats.unchanged,
                    skipped: stats.skipped_invalid,
                    conflicts: stats.conflict,
                    total: stats.total(),
                    errors: stats.error_count(),
                },
                "errors": stats.errors,
            }))
            .into_response()
        }
        Err(err) => {
            let api = ApiError::from(err);
            (
                api.status,
                Json(json!({
                    "success": false,
                    "message": api.message,
                    "stats": ImportStatsBody::default(),
                    "errors": Vec::<String>::new(),
                })),
            )
                .into_response()
        }
    }
}

async fn acknowledge_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let cleared = state.gate.acknowledge_failure().await;
    Json(json!({
        "success": true,
        "message": if cleared { "failure acknowledged" } else { "nothing to acknowledge" },
    }))
}

/// Stored tender in the shape the dashboard renders.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenderView {
    pub id: Uuid,
    pub reference: String,
    pub maitre_ouvrage: String,
    pub objet: String,
    pub ville: String,
    pub budget: Option<String>,
    pub montant: Option<String>,
    pub adjudicataire: String,
    pub date_ouverture: Option<chrono::NaiveDate>,
    pub date_adjudication: Option<chrono::NaiveDate>,
    pub date_affichage: Option<chrono::NaiveDate>,
    pub file_links: Vec<String>,
    pub operator_modified_fields: Vec<TenderField>,
    pub created_at: DateTime<Utc>,
    pub last_imported_at: DateTime<Utc>,
}

impl From<StoredRecord> for TenderView {
    fn from(stored: StoredRecord) -> Self {
        let r = stored.record;
        Self {
            id: stored.id,
            reference: r.reference,
            maitre_ouvrage: r.maitre_ouvrage,
            objet: r.objet,
            ville: r.ville,
            budget: r.budget.map(|v| v.with_scale(2).to_string()),
            montant: r.montant.map(|v| v.with_scale(2).to_string()),
            adjudicataire: r.adjudicataire,
            date_ouverture: r.date_ouverture,
            date_adjudication: r.date_adjudication,
            date_affichage: r.date_affichage,
            file_links: r.file_links,
            operator_modified_fields: stored.operator_modified_fields.into_iter().collect(),
            created_at: stored.created_at,
            last_imported_at: stored.last_imported_at,
        }
    }
}

async fn tenders_handler(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<TenderFilter>,
) -> Result<Json<Vec<TenderView>>, ApiError> {
    let reconciler = state.gate.reconciler();
    let records = reconciler.repository().load_all().await.map_err(storage_error)?;
    let listed = list_tenders(records, &filter, reconciler.normalizer());
    Ok(Json(listed.into_iter().map(TenderView::from).collect()))
}

async fn filter_options_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let records = state
        .gate
        .reconciler()
        .repository()
        .load_all()
        .await
        .map_err(storage_error)?;
    Ok(Json(filter_options(&records)).into_response())
}

async fn edit_tender_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
    Json(edits): Json<FieldEdits>,
) -> Result<Json<TenderView>, ApiError> {
    let stored = state.gate.reconciler().edit_tender(id, &edits).await?;
    Ok(Json(stored.into()))
}

async fn release_protection_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((id, field)): AxumPath<(Uuid, String)>,
) -> Result<Json<TenderView>, ApiError> {
    let field: TenderField = field
        .parse()
        .map_err(|err: resao_core::UnknownField| {
            ApiError::new(StatusCode::BAD_REQUEST, err.to_string())
        })?;
    let stored = state.gate.reconciler().release_protection(id, field).await?;
    Ok(Json(stored.into()))
}

#[derive(Debug, Deserialize)]
struct DaoQuery {
    path: String,
    file: Option<String>,
}

async fn dao_list_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DaoQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let files = state.archives.list(&query.path).await?;
    Ok(Json(json!({ "success": true, "path": query.path, "files": files })))
}

async fn dao_download_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DaoQuery>,
) -> Result<Response, ApiError> {
    let Some(file) = query.file.as_deref().filter(|f| !f.trim().is_empty()) else {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "missing `file` parameter"));
    };
    let bytes = state.archives.read(&query.path, file).await?;
    let name = file.rsplit('/').next().unwrap_or(file).replace('"', "");
    Ok((
        [
            (header::CONTENT_TYPE, content_type_for(&name).to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{name}\"")),
        ],
        bytes,
    )
        .into_response())
}

fn content_type_for(name: &str) -> &'static str {
    let ext = name.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use resao_adapters::{ScrapeContext, ScrapeError, TenderScraper};
    use resao_core::RawCandidate;
    use resao_storage::{MemoryTenderRepository, StagingStore};
    use resao_sync::{GateSettings, Normalizer, Reconciler};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    struct ListScraper {
        records: Vec<RawCandidate>,
        delay: Duration,
    }

    #[async_trait]
    impl TenderScraper for ListScraper {
        fn name(&self) -> &str {
            "list"
        }

        async fn scrape(&self, _ctx: &ScrapeContext) -> Result<Vec<RawCandidate>, ScrapeError> {
            tokio::time::sleep(self.delay).await;
            Ok(self.records.clone())
        }
    }

    fn raw(reference: &str, ville: &str, montant: &str) -> RawCandidate {
        RawCandidate {
            reference: Some(reference.into()),
            maitre_ouvrage: Some("Commune de Fès".into()),
            objet: Some("Travaux de voirie".into()),
            ville: Some(ville.into()),
            montant: Some(montant.into()),
            date_adjudication: Some("15/04/2024".into()),
            ..Default::default()
        }
    }

    fn test_app(delay: Duration) -> (Router, TempDir) {
        let dir = tempdir().expect("tempdir");
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(MemoryTenderRepository::new()),
            Normalizer::default(),
        ));
        let scraper = Arc::new(ListScraper {
            records: vec![
                raw("AO-1", "Fès", "1 000,00 DH"),
                raw("AO-2", "Meknès", "2500"),
            ],
            delay,
        });
        let gate = Arc::new(ScrapeGate::new(
            scraper,
            StagingStore::new(dir.path().join("staging")),
            reconciler,
            GateSettings::default(),
        ));
        let archives = ArchiveStore::new(dir.path().join("archives"));
        (app(AppState::new(gate, archives)), dir)
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn scrape_check_import_round_trip() {
        let (app, _dir) = test_app(Duration::ZERO);

        let (status, body) = send(&app, "POST", "/scrape/start?wait=true", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hasNewData"], true);
        assert_eq!(body["recordCount"], 2);

        let (_, available) = send(&app, "GET", "/scrape/available", None).await;
        assert_eq!(available["available"], true);
        assert_eq!(available["count"], 2);
        assert_eq!(available["preview"][0]["montant"], "1 000,00");

        let (status, imported) = send(&app, "POST", "/scrape/import", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(imported["success"], true);
        assert_eq!(imported["stats"]["imported"], 2);
        assert_eq!(imported["stats"]["total"], 2);
        assert_eq!(imported["stats"]["errors"], 0);

        let (_, tenders) = send(&app, "GET", "/tenders?ville=MEKN%C3%88S", None).await;
        assert_eq!(tenders.as_array().map(Vec::len), Some(1));
        assert_eq!(tenders[0]["montant"], "2500.00");

        let (_, options) = send(&app, "GET", "/tenders/filter-options", None).await;
        assert_eq!(options["villes"].as_array().map(Vec::len), Some(2));
        assert_eq!(options["dateRanges"]["adjudication"]["min"], "2024-04-15");

        let (_, status) = send(&app, "GET", "/scrape/status", None).await;
        assert_eq!(status["status"], "idle");
    }

    #[tokio::test]
    async fn second_start_while_running_is_conflict() {
        let (app, _dir) = test_app(Duration::from_secs(30));

        let (first, body) = send(&app, "POST", "/scrape/start", None).await;
        assert_eq!(first, StatusCode::OK);
        assert_eq!(body["status"], "running");

        let (second, body) = send(&app, "POST", "/scrape/start", None).await;
        assert_eq!(second, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);

        let (_, available) = send(&app, "GET", "/scrape/available", None).await;
        assert_eq!(available["available"], false);
    }

    #[tokio::test]
    async fn import_without_ready_batch_is_conflict_with_empty_stats() {
        let (app, _dir) = test_app(Duration::ZERO);
        let (status, body) = send(&app, "POST", "/scrape/import", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);
        assert_eq!(body["stats"]["imported"], 0);
    }

    #[tokio::test]
    async fn operator_edit_and_protection_release() {
        let (app, _dir) = test_app(Duration::ZERO);
        send(&app, "POST", "/scrape/start?wait=true", None).await;
        send(&app, "POST", "/scrape/import", None).await;
        let (_, tenders) = send(&app, "GET", "/tenders?reference=ao-1", None).await;
        let id = tenders[0]["id"].as_str().expect("id").to_string();

        let (status, edited) = send(
            &app,
            "PATCH",
            &format!("/tenders/{id}"),
            Some(json!({ "montant": "900,50", "adjudicataire": "Sotravo" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(edited["montant"], "900.50");
        assert_eq!(edited["operatorModifiedFields"], json!(["montant", "adjudicataire"]));

        let uri = format!("/tenders/{id}");
        let (status, _) = send(&app, "PATCH", &uri, Some(json!({ "montant": "cher" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let uri = format!("/tenders/{id}/protection/montant");
        let (status, released) = send(&app, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(released["operatorModifiedFields"], json!(["adjudicataire"]));

        let uri = format!("/tenders/{id}/protection/prix");
        let (status, _) = send(&app, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let uri = format!("/tenders/{}", Uuid::new_v4());
        let (status, _) = send(&app, "PATCH", &uri, Some(json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn dao_listing_download_and_escape() {
        let (app, dir) = test_app(Duration::ZERO);
        let archive = dir.path().join("archives/global-marches/resultat_offre_1");
        std::fs::create_dir_all(archive.join("annexes")).unwrap();
        std::fs::write(archive.join("pv.pdf"), b"%PDF-1.4").unwrap();
        std::fs::write(archive.join("annexes/cps.docx"), b"docx").unwrap();

        let uri = "/dao/list?path=/storage/global-marches/resultat_offre_1";
        let (status, listed) = send(&app, "GET", uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["files"], json!(["annexes/cps.docx", "pv.pdf"]));

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/dao/download?path=global-marches/resultat_offre_1&file=pv.pdf")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE].to_str().unwrap(), "application/pdf");
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"%PDF-1.4");

        let (status, _) = send(&app, "GET", "/dao/list?path=../../etc", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&app, "GET", "/dao/list?path=global-marches/absent", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn scrape_is_refused_while_another_process_holds_staging() {
        let (app, dir) = test_app(Duration::ZERO);
        let other = StagingStore::new(dir.path().join("staging"));
        let lease = other.try_lease().await.unwrap().expect("lease");

        let (status, body) = send(&app, "POST", "/scrape/start", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);

        drop(lease);
        let (status, _) = send(&app, "POST", "/scrape/start", None).await;
        assert_eq!(status, StatusCode::OK);
    }
}
