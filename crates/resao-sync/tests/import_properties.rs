use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use resao_adapters::{ScrapeContext, ScrapeError, TenderScraper};
use resao_core::{BatchStatus, Classification, RawCandidate, StagingBatch, TenderField};
use resao_storage::{
    JsonFileTenderRepository, MemoryTenderRepository, StagingStore, TenderRepository,
};
use resao_sync::{
    FieldEdits, GateError, GateSettings, GateState, Normalizer, Reconciler, ScrapeGate,
};
use serde_json::json;
use tempfile::tempdir;
use uuid::Uuid;

fn candidate(reference: &str, objet: &str, montant: &str) -> RawCandidate {
    RawCandidate {
        reference: Some(reference.to_string()),
        maitre_ouvrage: Some("Commune de Fès".to_string()),
        objet: Some(objet.to_string()),
        ville: Some("Fès".to_string()),
        montant: Some(montant.to_string()),
        adjudicataire: Some("Sotravo SARL".to_string()),
        date_ouverture: Some("12/03/2024".to_string()),
        date_adjudication: Some("02/04/2024".to_string()),
        ..Default::default()
    }
}

fn ready_batch(records: Vec<RawCandidate>) -> StagingBatch {
    StagingBatch {
        run_id: Uuid::new_v4(),
        started_at: Utc::now(),
        finished_at: Some(Utc::now()),
        status: BatchStatus::Ready,
        records,
    }
}

fn setup() -> (Arc<MemoryTenderRepository>, Reconciler) {
    let repo = Arc::new(MemoryTenderRepository::new());
    let reconciler = Reconciler::new(repo.clone(), Normalizer::default());
    (repo, reconciler)
}

#[tokio::test]
async fn reimporting_the_same_batch_is_a_no_op() {
    let (repo, reconciler) = setup();
    let batch = ready_batch(vec![
        candidate("AO-2024-001", "Voirie", "1 250 000,00 DH"),
        candidate("AO-2024-002", "Éclairage public", "480.000,00"),
        candidate("", "Assainissement liquide", "312 000"),
    ]);

    let first = reconciler.import_batch(&batch).await.expect("first import");
    assert_eq!(first.stats.created, 3);
    let after_first = repo.snapshot().await;

    let second = reconciler.import_batch(&batch).await.expect("second import");
    assert_eq!(second.stats.created, 0);
    assert_eq!(second.stats.updated, 0);
    assert_eq!(second.stats.unchanged, 3);
    assert_eq!(repo.snapshot().await, after_first);
}

#[tokio::test]
async fn operator_edits_win_over_rescraped_values() {
    let (repo, reconciler) = setup();
    let seeded = reconciler
        .import_batch(&ready_batch(vec![candidate("AO-2024-010", "Voirie", "100000")]))
        .await
        .expect("seed");
    let id = seeded.outcomes[0].stored_id.expect("stored id");

    let mut edits = FieldEdits::new();
    edits.insert(TenderField::Montant, json!("95 000,00"));
    let edited = reconciler.edit_tender(id, &edits).await.expect("edit");
    assert!(edited.operator_modified_fields.contains(&TenderField::Montant));

    let report = reconciler
        .import_batch(&ready_batch(vec![candidate("AO-2024-010", "Voirie", "120000")]))
        .await
        .expect("reimport");

    assert_eq!(report.outcomes[0].classification, Classification::Unchanged);
    let stored = repo.get(id).await.unwrap().expect("stored");
    assert_eq!(stored.record.montant, Some("95000.00".parse().unwrap()));
}

#[tokio::test]
async fn records_without_identity_are_skipped_not_stored() {
    let (repo, reconciler) = setup();
    let unusable = RawCandidate {
        reference: Some("  ".to_string()),
        objet: Some("-".to_string()),
        maitre_ouvrage: None,
        ville: Some("Taza".to_string()),
        montant: Some("5000".to_string()),
        ..Default::default()
    };

    let report = reconciler
        .import_batch(&ready_batch(vec![unusable, candidate("AO-2024-020", "Voirie", "10")]))
        .await
        .expect("import");

    assert_eq!(report.stats.skipped_invalid, 1);
    assert_eq!(report.stats.created, 1);
    assert_eq!(report.stats.total(), 2);
    assert_eq!(report.outcomes[0].classification, Classification::SkippedInvalid);
    assert_eq!(report.outcomes[0].stored_id, None);
    assert_eq!(repo.snapshot().await.len(), 1);
    assert!(report.stats.errors[0].contains("insufficient identity"));
}

#[tokio::test]
async fn storage_failure_mid_batch_writes_nothing() {
    let (repo, reconciler) = setup();
    reconciler
        .import_batch(&ready_batch(vec![candidate("AO-2024-000", "Existant", "1")]))
        .await
        .expect("seed");
    let before = repo.snapshot().await;

    let records = (1..=10)
        .map(|n| candidate(&format!("AO-2024-1{n:02}"), "Lot", "1000"))
        .collect();
    repo.fail_on_write(5);
    let err = reconciler.import_batch(&ready_batch(records)).await.unwrap_err();
    assert!(err.to_string().contains("no record was written"));
    assert_eq!(repo.snapshot().await, before);

    repo.fail_on_write(0);
}

#[tokio::test]
async fn mixed_batch_counts_created_updated_unchanged() {
    let (repo, reconciler) = setup();
    let seeded = reconciler
        .import_batch(&ready_batch(vec![
            candidate("AO-2024-050", "Voirie", "200000"),
            candidate("AO-2024-051", "Éclairage", "300000"),
        ]))
        .await
        .expect("seed");
    let id_051 = seeded.outcomes[1].stored_id.expect("id");

    let report = reconciler
        .import_batch(&ready_batch(vec![
            candidate("AO-2024-099", "Assainissement", "150000"),
            candidate("AO-2024-050", "Voirie", "200000"),
            candidate("AO-2024-051", "Éclairage", "345 500,00"),
        ]))
        .await
        .expect("import");

    assert_eq!(report.stats.created, 1);
    assert_eq!(report.stats.updated, 1);
    assert_eq!(report.stats.unchanged, 1);
    assert_eq!(report.stats.error_count(), 0);
    let updated = repo.get(id_051).await.unwrap().expect("051");
    assert_eq!(updated.record.montant, Some("345500.00".parse().unwrap()));
}

#[tokio::test]
async fn composite_collision_is_reported_as_conflict() {
    let (repo, reconciler) = setup();
    // Two stored tenders without reference that share maître d'ouvrage, objet and date.
    let first = reconciler
        .import_batch(&ready_batch(vec![candidate("REF-A", "Voirie", "1")]))
        .await
        .expect("a");
    let second = reconciler
        .import_batch(&ready_batch(vec![candidate("REF-B", "Voirie", "2")]))
        .await
        .expect("b");
    for id in [first.outcomes[0].stored_id, second.outcomes[0].stored_id] {
        let mut edits = FieldEdits::new();
        edits.insert(TenderField::Reference, json!(""));
        reconciler.edit_tender(id.expect("id"), &edits).await.expect("clear reference");
    }
    let before = repo.snapshot().await;

    let report = reconciler
        .import_batch(&ready_batch(vec![candidate("", "VOIRIE", "3")]))
        .await
        .expect("import");

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.classification, Classification::Conflict);
    assert_eq!(outcome.conflicting_ids.len(), 2);
    assert_eq!(report.stats.conflict, 1);
    assert_eq!(report.stats.error_count(), 1);
    assert_eq!(repo.snapshot().await, before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_and_cli_importing_one_batch_create_each_tender_once() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("tenders.json");
    let server = Reconciler::new(
        Arc::new(JsonFileTenderRepository::new(&path)),
        Normalizer::default(),
    );
    let cli = Reconciler::new(
        Arc::new(JsonFileTenderRepository::new(&path)),
        Normalizer::default(),
    );
    let batch = ready_batch(vec![
        candidate("AO-2024-400", "Voirie", "1000"),
        candidate("AO-2024-401", "Éclairage", "2000"),
    ]);

    let (a, b) = tokio::join!(server.import_batch(&batch), cli.import_batch(&batch));
    let (a, b) = (a.expect("server import"), b.expect("cli import"));

    assert_eq!(a.stats.created + b.stats.created, 2);
    assert_eq!(a.stats.unchanged + b.stats.unchanged, 2);
    let stored = JsonFileTenderRepository::new(&path).load_all().await.unwrap();
    assert_eq!(stored.len(), 2);
}

/// Blocks until released, counting how many scrapes were started.
struct GatedScraper {
    started: AtomicUsize,
    release: tokio::sync::Notify,
}

#[async_trait]
impl TenderScraper for GatedScraper {
    fn name(&self) -> &str {
        "gated"
    }

    async fn scrape(&self, _ctx: &ScrapeContext) -> Result<Vec<RawCandidate>, ScrapeError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        Ok(vec![candidate("AO-2024-300", "Voirie", "1")])
    }
}

#[tokio::test]
async fn only_one_scrape_runs_at_a_time() {
    let dir = tempdir().expect("tempdir");
    let scraper = Arc::new(GatedScraper {
        started: AtomicUsize::new(0),
        release: tokio::sync::Notify::new(),
    });
    let reconciler = Arc::new(Reconciler::new(
        Arc::new(MemoryTenderRepository::new()),
        Normalizer::default(),
    ));
    let gate = Arc::new(ScrapeGate::new(
        scraper.clone(),
        StagingStore::new(dir.path().join("staging")),
        reconciler,
        GateSettings {
            scrape_timeout: Duration::from_secs(30),
            preview_size: 5,
        },
    ));

    let run_id = gate.start_scrape().await.expect("first start");
    let attempts = start_concurrently(&gate, 8).await;
    for attempt in attempts {
        assert!(matches!(attempt, Err(GateError::AlreadyRunning(id)) if id == run_id));
    }

    scraper.release.notify_one();
    let settled = gate.wait_settled(run_id).await;
    assert!(matches!(settled.state, GateState::Ready { run_id: id, count: 1, .. } if id == run_id));
    assert_eq!(scraper.started.load(Ordering::SeqCst), 1);

    let staged = StagingStore::new(dir.path().join("staging"))
        .current()
        .await
        .unwrap()
        .expect("one batch");
    assert_eq!(staged.run_id, run_id);
}

async fn start_concurrently(gate: &Arc<ScrapeGate>, n: usize) -> Vec<Result<Uuid, GateError>> {
    let handles: Vec<_> = (0..n)
        .map(|_| {
            let gate = Arc::clone(gate);
            tokio::spawn(async move { gate.start_scrape().await })
        })
        .collect();
    let mut results = Vec::with_capacity(n);
    for handle in handles {
        results.push(handle.await.expect("join"));
    }
    results
}
