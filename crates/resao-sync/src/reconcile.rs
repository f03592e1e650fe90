//! Applies staged batches and operator edits to the system of record.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use resao_core::{
    Classification, FieldValue, IdentityKey, ImportOutcome, ImportStats, StagingBatch, StoredRecord,
    TenderField,
};
use resao_storage::{StoreError, TenderRepository, TenderWrite};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::matching::{classify, fingerprint, MatchVerdict, TenderIndex};
use crate::normalize::{clean_text, Normalizer};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("storage transaction failed, no record was written: {0}")]
    Storage(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum EditError {
    #[error("tender {0} not found")]
    NotFound(Uuid),
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: TenderField, message: String },
    #[error("edit would leave the tender without reference, objet or maître d'ouvrage")]
    InsufficientIdentity,
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Field → new value, as sent by an operator.
pub type FieldEdits = BTreeMap<TenderField, JsonValue>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: ImportStats,
    pub outcomes: Vec<ImportOutcome>,
}

/// Every write path reads and commits inside one repository session, so an import or
/// edit never plans against a snapshot another writer has already changed.
pub struct Reconciler {
    repo: Arc<dyn TenderRepository>,
    normalizer: Normalizer,
}

impl Reconciler {
    pub fn new(repo: Arc<dyn TenderRepository>, normalizer: Normalizer) -> Self {
        Self { repo, normalizer }
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn repository(&self) -> &Arc<dyn TenderRepository> {
        &self.repo
    }

    /// Classifies every staged record and commits the resulting writes in one transaction.
    ///
    /// On error nothing from the batch is visible in storage.
    pub async fn import_batch(&self, batch: &StagingBatch) -> Result<ImportReport, ImportError> {
        let span = info_span!(
            "import_batch",
            run_id = %batch.run_id,
            records = batch.records.len()
        );
        async {
            let mut session = self.repo.begin().await?;
            let started_at = Utc::now();

            let stored = session.load_all().await?;
            let mut index = TenderIndex::from_records(stored);
            let (outcomes, writes) = self.plan(batch, &mut index, started_at);

            let write_count = writes.len();
            if !writes.is_empty() {
                if let Err(err) = session.commit(writes).await {
                    error!(error = %err, "import transaction failed; batch left unapplied");
                    return Err(err.into());
                }
            }

            let mut stats = ImportStats::default();
            for outcome in &outcomes {
                stats.record(outcome);
            }
            info!(
                created = stats.created,
                updated = stats.updated,
                unchanged = stats.unchanged,
                skipped_invalid = stats.skipped_invalid,
                conflict = stats.conflict,
                writes = write_count,
                "import committed"
            );

            Ok(ImportReport {
                run_id: batch.run_id,
                started_at,
                finished_at: Utc::now(),
                stats,
                outcomes,
            })
        }
        .instrument(span)
        .await
    }

    fn plan(
        &self,
        batch: &StagingBatch,
        index: &mut TenderIndex,
        now: DateTime<Utc>,
    ) -> (Vec<ImportOutcome>, Vec<TenderWrite>) {
        let mut outcomes = Vec::with_capacity(batch.records.len());
        let mut writes: Vec<TenderWrite> = Vec::new();
        let mut pending: HashMap<Uuid, usize> = HashMap::new();

        for (position, raw) in batch.records.iter().enumerate() {
            let candidate = match self.normalizer.normalize(raw) {
                Ok(record) => record,
                Err(reason) => {
                    warn!(index = position, %reason, "record rejected");
                    outcomes.push(outcome(
                        position,
                        None,
                        Classification::SkippedInvalid,
                        None,
                        Some(reason.to_string()),
                    ));
                    continue;
                }
            };

            let classified = classify(&candidate, &*index);
            let key = Some(classified.identity_key.clone());
            match classified.verdict {
                MatchVerdict::New => {
                    let record = StoredRecord {
                        id: Uuid::new_v4(),
                        record: candidate,
                        created_at: now,
                        last_imported_at: now,
                        last_fingerprint: classified.fingerprint,
                        operator_modified_fields: Default::default(),
                    };
                    debug!(
                        index = position,
                        key = %classified.identity_key,
                        id = %record.id,
                        "created"
                    );
                    let id = Some(record.id);
                    outcomes.push(outcome(position, key, Classification::Created, id, None));
                    stage_write(&mut writes, &mut pending, TenderWrite::Insert(record.clone()));
                    index.upsert(record);
                }
                MatchVerdict::Unchanged(stored) => {
                    debug!(
                        index = position,
                        key = %classified.identity_key,
                        id = %stored.id,
                        "unchanged"
                    );
                    let id = Some(stored.id);
                    outcomes.push(outcome(position, key, Classification::Unchanged, id, None));
                }
                MatchVerdict::Changed(stored) => {
                    let differing =
                        stored.record.differing_fields(&candidate, &TenderField::MUTABLE);
                    let (protected, writable): (Vec<_>, Vec<_>) =
                        differing.into_iter().partition(|f| stored.is_protected(*f));

                    if writable.is_empty() {
                        let message = kept_message(&protected);
                        debug!(
                            index = position,
                            key = %classified.identity_key,
                            id = %stored.id,
                            "only protected fields differ"
                        );
                        let id = Some(stored.id);
                        let unchanged = Classification::Unchanged;
                        outcomes.push(outcome(position, key, unchanged, id, message));
                        continue;
                    }

                    let mut updated = stored.clone();
                    for field in &writable {
                        updated.record.copy_field(*field, &candidate);
                    }
                    updated.last_fingerprint = classified.fingerprint;
                    updated.last_imported_at = now;

                    let message = kept_message(&protected);
                    debug!(
                        index = position,
                        key = %classified.identity_key,
                        id = %stored.id,
                        fields = %field_list(&writable),
                        "updated"
                    );
                    let id = Some(stored.id);
                    outcomes.push(outcome(position, key, Classification::Updated, id, message));
                    stage_write(&mut writes, &mut pending, TenderWrite::Update(updated.clone()));
                    index.upsert(updated);
                }
                MatchVerdict::Conflict { colliding, reason } => {
                    warn!(
                        index = position,
                        key = %classified.identity_key,
                        %reason,
                        "identity conflict"
                    );
                    outcomes.push(ImportOutcome {
                        index: position,
                        identity_key: key,
                        classification: Classification::Conflict,
                        stored_id: None,
                        conflicting_ids: colliding,
                        message: Some(reason),
                    });
                }
            }
        }

        (outcomes, writes)
    }

    /// Applies operator edits and marks the touched fields as protected from re-import.
    pub async fn edit_tender(
        &self,
        id: Uuid,
        edits: &FieldEdits,
    ) -> Result<StoredRecord, EditError> {
        let mut session = self.repo.begin().await?;
        let mut stored = session.get(id).await?.ok_or(EditError::NotFound(id))?;

        for (field, raw) in edits {
            let value = parse_edit(&self.normalizer, *field, raw)?;
            stored.record.set_value(*field, value);
            stored.operator_modified_fields.insert(*field);
        }
        if stored.record.lacks_identity() {
            return Err(EditError::InsufficientIdentity);
        }

        session
            .commit(vec![TenderWrite::Update(stored.clone())])
            .await?;
        let fields: Vec<_> = edits.keys().copied().collect();
        info!(%id, fields = %field_list(&fields), "operator edit saved");
        Ok(stored)
    }

    /// Lets the next import refresh `field` again.
    ///
    /// The stored fingerprint is rebased on the current values: a re-scrape carrying the
    /// value the operator had overridden must then read as a change, not as unchanged.
    pub async fn release_protection(
        &self,
        id: Uuid,
        field: TenderField,
    ) -> Result<StoredRecord, EditError> {
        let mut session = self.repo.begin().await?;
        let mut stored = session.get(id).await?.ok_or(EditError::NotFound(id))?;
        if stored.operator_modified_fields.remove(&field) {
            stored.last_fingerprint = fingerprint(&stored.record);
            session
                .commit(vec![TenderWrite::Update(stored.clone())])
                .await?;
            info!(%id, %field, "field protection released");
        }
        Ok(stored)
    }
}

fn outcome(
    index: usize,
    identity_key: Option<IdentityKey>,
    classification: Classification,
    stored_id: Option<Uuid>,
    message: Option<String>,
) -> ImportOutcome {
    ImportOutcome {
        index,
        identity_key,
        classification,
        stored_id,
        conflicting_ids: Vec::new(),
        message,
    }
}

fn kept_message(protected: &[TenderField]) -> Option<String> {
    (!protected.is_empty())
        .then(|| format!("kept operator values for {}", field_list(protected)))
}

/// Folds a second write to the same tender into the first one.
fn stage_write(
    writes: &mut Vec<TenderWrite>,
    pending: &mut HashMap<Uuid, usize>,
    write: TenderWrite,
) {
    let id = write.record().id;
    match pending.get(&id) {
        Some(&slot) => {
            let record = write.record().clone();
            writes[slot] = match &writes[slot] {
                TenderWrite::Insert(_) => TenderWrite::Insert(record),
                TenderWrite::Update(_) => TenderWrite::Update(record),
            };
        }
        None => {
            pending.insert(id, writes.len());
            writes.push(write);
        }
    }
}

fn field_list(fields: &[TenderField]) -> String {
    fields
        .iter()
        .map(|f| f.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn parse_edit(
    normalizer: &Normalizer,
    field: TenderField,
    raw: &JsonValue,
) -> Result<FieldValue, EditError> {
    let invalid = |message: &str| EditError::InvalidValue {
        field,
        message: message.to_string(),
    };
    let text = match raw {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Array(_) if field == TenderField::FileLinks => None,
        _ => return Err(invalid("expected a string, a number or null")),
    };
    let blank = text.as_deref().map(|t| t.trim().is_empty()).unwrap_or(true);

    let value = match field {
        TenderField::Budget | TenderField::Montant => {
            let amount = normalizer.amount(text.as_deref());
            if amount.is_none() && !blank {
                return Err(invalid("not a positive amount"));
            }
            FieldValue::Amount(amount)
        }
        TenderField::DateOuverture
        | TenderField::DateAdjudication
        | TenderField::DateAffichage => {
            let date: Option<NaiveDate> = normalizer.date(text.as_deref());
            if date.is_none() && !blank {
                return Err(invalid("not a recognised date"));
            }
            FieldValue::Date(date)
        }
        TenderField::FileLinks => {
            let links = match raw {
                JsonValue::Null => Vec::new(),
                JsonValue::Array(items) => {
                    let mut links = Vec::new();
                    for item in items {
                        let JsonValue::String(link) = item else {
                            return Err(invalid("links must be strings"));
                        };
                        let link = link.trim();
                        if !link.is_empty() && !links.iter().any(|l: &String| l == link) {
                            links.push(link.to_string());
                        }
                    }
                    links
                }
                _ => return Err(invalid("expected an array of links")),
            };
            FieldValue::Links(links)
        }
        TenderField::Reference
        | TenderField::MaitreOuvrage
        | TenderField::Objet
        | TenderField::Ville
        | TenderField::Adjudicataire => FieldValue::Text(clean_text(text.as_deref())),
    };
    Ok(value)
}
