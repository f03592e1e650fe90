//! Identity keys, content fingerprints and candidate → stored-record matching.

use std::collections::HashMap;

use resao_core::{fold_text, CanonicalRecord, IdentityKey, StoredRecord, TenderField};
use resao_storage::sha256_hex;
use uuid::Uuid;

/// Case-folded reference, or `None` when the record has no reference.
pub fn reference_key(record: &CanonicalRecord) -> Option<String> {
    let folded = fold_text(&record.reference);
    (!folded.is_empty()).then_some(folded)
}

/// `maître d'ouvrage | objet | date d'ouverture`, folded.
pub fn composite_key(record: &CanonicalRecord) -> String {
    let date = record
        .date_ouverture
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default();
    format!(
        "{}|{}|{}",
        fold_text(&record.maitre_ouvrage),
        fold_text(&record.objet),
        date
    )
}

pub fn identity_key(record: &CanonicalRecord) -> IdentityKey {
    match reference_key(record) {
        Some(key) => IdentityKey::Reference(key),
        None => IdentityKey::Composite(composite_key(record)),
    }
}

/// SHA-256 over the comparison form of every non-identity field.
pub fn fingerprint(record: &CanonicalRecord) -> String {
    let mut canonical = String::new();
    for field in TenderField::MUTABLE {
        canonical.push_str(field.as_str());
        canonical.push('=');
        canonical.push_str(&record.value(field).comparison_text());
        canonical.push('\n');
    }
    sha256_hex(canonical.as_bytes())
}

/// Read access to stored tenders by identity key.
pub trait StoredRecordLookup {
    fn by_reference(&self, reference_key: &str) -> Vec<&StoredRecord>;
    fn by_composite(&self, composite_key: &str) -> Vec<&StoredRecord>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchVerdict {
    New,
    Unchanged(StoredRecord),
    Changed(StoredRecord),
    Conflict { colliding: Vec<Uuid>, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub identity_key: IdentityKey,
    pub fingerprint: String,
    pub verdict: MatchVerdict,
}

pub fn classify(candidate: &CanonicalRecord, store: &impl StoredRecordLookup) -> Classified {
    let identity_key = identity_key(candidate);
    let fingerprint = fingerprint(candidate);
    let composite = composite_key(candidate);

    let matched = match &identity_key {
        IdentityKey::Reference(reference) => {
            let hits = store.by_reference(reference);
            match hits.as_slice() {
                [] => Ok(None),
                [only] => Ok(Some(*only)),
                _ => {
                    // Duplicate references in storage: let the composite key pick, never guess.
                    let narrowed: Vec<&StoredRecord> = store
                        .by_composite(&composite)
                        .into_iter()
                        .filter(|c| hits.iter().any(|h| h.id == c.id))
                        .collect();
                    match narrowed.as_slice() {
                        [only] => Ok(Some(*only)),
                        _ => Err((
                            ids(&hits),
                            format!(
                                "reference `{reference}` is shared by {} stored tenders",
                                hits.len()
                            ),
                        )),
                    }
                }
            }
        }
        IdentityKey::Composite(key) => {
            let hits = store.by_composite(key);
            match hits.as_slice() {
                [] => Ok(None),
                [only] => Ok(Some(*only)),
                _ => Err((
                    ids(&hits),
                    format!("composite key is shared by {} stored tenders", hits.len()),
                )),
            }
        }
    };

    let verdict = match matched {
        Ok(None) => MatchVerdict::New,
        Ok(Some(stored)) if stored.last_fingerprint == fingerprint => {
            MatchVerdict::Unchanged(stored.clone())
        }
        Ok(Some(stored)) => MatchVerdict::Changed(stored.clone()),
        Err((colliding, reason)) => MatchVerdict::Conflict { colliding, reason },
    };

    Classified {
        identity_key,
        fingerprint,
        verdict,
    }
}

fn ids(records: &[&StoredRecord]) -> Vec<Uuid> {
    let mut ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
    ids.sort();
    ids
}

/// In-memory snapshot of the system of record, indexed by both identity keys.
///
/// The reconciler mutates it as it plans writes so later records in the same
/// batch see earlier ones.
#[derive(Debug, Clone, Default)]
pub struct TenderIndex {
    records: HashMap<Uuid, StoredRecord>,
    by_reference: HashMap<String, Vec<Uuid>>,
    by_composite: HashMap<String, Vec<Uuid>>,
}

impl TenderIndex {
    pub fn from_records(records: impl IntoIterator<Item = StoredRecord>) -> Self {
        let mut index = Self::default();
        for record in records {
            index.upsert(record);
        }
        index
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<&StoredRecord> {
        self.records.get(&id)
    }

    /// Inserts or replaces a record, keeping both key maps in sync.
    pub fn upsert(&mut self, record: StoredRecord) {
        if let Some(previous) = self.records.remove(&record.id) {
            self.unindex(&previous);
        }
        if let Some(key) = reference_key(&record.record) {
            self.by_reference.entry(key).or_default().push(record.id);
        }
        self.by_composite
            .entry(composite_key(&record.record))
            .or_default()
            .push(record.id);
        self.records.insert(record.id, record);
    }

    fn unindex(&mut self, record: &StoredRecord) {
        if let Some(key) = reference_key(&record.record) {
            remove_id(&mut self.by_reference, &key, record.id);
        }
        remove_id(&mut self.by_composite, &composite_key(&record.record), record.id);
    }

    fn resolve(&self, ids: Option<&Vec<Uuid>>) -> Vec<&StoredRecord> {
        ids.map(|ids| ids.iter().filter_map(|id| self.records.get(id)).collect())
            .unwrap_or_default()
    }
}

fn remove_id(map: &mut HashMap<String, Vec<Uuid>>, key: &str, id: Uuid) {
    if let Some(ids) = map.get_mut(key) {
        ids.retain(|existing| *existing != id);
        if ids.is_empty() {
            map.remove(key);
        }
    }
}

impl StoredRecordLookup for TenderIndex {
    fn by_reference(&self, reference_key: &str) -> Vec<&StoredRecord> {
        self.resolve(self.by_reference.get(reference_key))
    }

    fn by_composite(&self, composite_key: &str) -> Vec<&StoredRecord> {
        self.resolve(self.by_composite.get(composite_key))
    }
}
