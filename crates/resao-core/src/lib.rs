//! Core domain model for tender-result ingestion.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "resao-core";

/// Loosely-typed record as produced by a scraper run.
///
/// Keys are accepted either in canonical snake_case or as the labels printed by
/// the results site (`Référence`, `Maître d'ouvrage`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCandidate {
    #[serde(default, alias = "Référence", alias = "Reference", deserialize_with = "lenient_text")]
    pub reference: Option<String>,
    #[serde(
        default,
        alias = "Maître d'ouvrage",
        alias = "Maître d'Ouvrage",
        alias = "Maitre d'ouvrage",
        deserialize_with = "lenient_text"
    )]
    pub maitre_ouvrage: Option<String>,
    #[serde(default, alias = "Objet", deserialize_with = "lenient_text")]
    pub objet: Option<String>,
    #[serde(default, alias = "Ville", deserialize_with = "lenient_text")]
    pub ville: Option<String>,
    #[serde(default, alias = "Budget", alias = "Estimation", deserialize_with = "lenient_text")]
    pub budget: Option<String>,
    #[serde(default, alias = "Montant", deserialize_with = "lenient_text")]
    pub montant: Option<String>,
    #[serde(default, alias = "Adjudicataire", deserialize_with = "lenient_text")]
    pub adjudicataire: Option<String>,
    #[serde(
        default,
        alias = "Date d'ouverture",
        alias = "Date ouverture",
        deserialize_with = "lenient_text"
    )]
    pub date_ouverture: Option<String>,
    #[serde(
        default,
        alias = "Date d'adjudication",
        alias = "date_adjudications",
        deserialize_with = "lenient_text"
    )]
    pub date_adjudication: Option<String>,
    #[serde(default, alias = "Date d'affichage", deserialize_with = "lenient_text")]
    pub date_affichage: Option<String>,
    #[serde(default, alias = "Lien_DAO", deserialize_with = "lenient_text")]
    pub lien_dao: Option<String>,
    #[serde(default, alias = "Lien_PV", deserialize_with = "lenient_text")]
    pub lien_pv: Option<String>,
    #[serde(
        default,
        alias = "EXTRACTED_FILES",
        alias = "chemin_fichiers",
        deserialize_with = "lenient_text_list"
    )]
    pub extracted_files: Vec<String>,
}

/// Accepts strings, numbers, booleans or null where a text field is expected.
fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.and_then(json_to_text))
}

fn lenient_text_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::Array(items)) => items.into_iter().filter_map(json_to_text).collect(),
        Some(other) => json_to_text(other).into_iter().collect(),
        None => Vec::new(),
    })
}

fn json_to_text(value: JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Named field of a tender record; the unit of operator protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenderField {
    Reference,
    MaitreOuvrage,
    Objet,
    Ville,
    Budget,
    Montant,
    Adjudicataire,
    DateOuverture,
    DateAdjudication,
    DateAffichage,
    FileLinks,
}

impl TenderField {
    pub const ALL: [TenderField; 11] = [
        TenderField::Reference,
        TenderField::MaitreOuvrage,
        TenderField::Objet,
        TenderField::Ville,
        TenderField::Budget,
        TenderField::Montant,
        TenderField::Adjudicataire,
        TenderField::DateOuverture,
        TenderField::DateAdjudication,
        TenderField::DateAffichage,
        TenderField::FileLinks,
    ];

    /// Fields covered by the content fingerprint: everything but the reference.
    pub const MUTABLE: [TenderField; 10] = [
        TenderField::MaitreOuvrage,
        TenderField::Objet,
        TenderField::Ville,
        TenderField::Budget,
        TenderField::Montant,
        TenderField::Adjudicataire,
        TenderField::DateOuverture,
        TenderField::DateAdjudication,
        TenderField::DateAffichage,
        TenderField::FileLinks,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TenderField::Reference => "reference",
            TenderField::MaitreOuvrage => "maitre_ouvrage",
            TenderField::Objet => "objet",
            TenderField::Ville => "ville",
            TenderField::Budget => "budget",
            TenderField::Montant => "montant",
            TenderField::Adjudicataire => "adjudicataire",
            TenderField::DateOuverture => "date_ouverture",
            TenderField::DateAdjudication => "date_adjudication",
            TenderField::DateAffichage => "date_affichage",
            TenderField::FileLinks => "file_links",
        }
    }
}

impl fmt::Display for TenderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown tender field `{0}`")]
pub struct UnknownField(pub String);

impl FromStr for TenderField {
    type Err = UnknownField;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TenderField::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| UnknownField(s.to_string()))
    }
}

/// Typed value of a single field, used for diffing and fingerprinting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Amount(Option<BigDecimal>),
    Date(Option<NaiveDate>),
    Links(Vec<String>),
}

impl FieldValue {
    /// Comparison form: case-folded text, 2-decimal amounts, ISO dates.
    pub fn comparison_text(&self) -> String {
        match self {
            FieldValue::Text(s) => fold_text(s),
            FieldValue::Amount(Some(v)) => v.with_scale(2).to_string(),
            FieldValue::Amount(None) | FieldValue::Date(None) => String::new(),
            FieldValue::Date(Some(d)) => d.format("%Y-%m-%d").to_string(),
            FieldValue::Links(links) => links.join("\u{1f}"),
        }
    }

    pub fn same_content(&self, other: &FieldValue) -> bool {
        self.comparison_text() == other.comparison_text()
    }
}

/// Lowercases and collapses runs of whitespace to a single space.
pub fn fold_text(input: &str) -> String {
    input
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized, typed tender result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub reference: String,
    pub maitre_ouvrage: String,
    pub objet: String,
    pub ville: String,
    pub budget: Option<BigDecimal>,
    pub montant: Option<BigDecimal>,
    pub adjudicataire: String,
    pub date_ouverture: Option<NaiveDate>,
    pub date_adjudication: Option<NaiveDate>,
    pub date_affichage: Option<NaiveDate>,
    #[serde(default)]
    pub file_links: Vec<String>,
}

impl CanonicalRecord {
    pub fn value(&self, field: TenderField) -> FieldValue {
        match field {
            TenderField::Reference => FieldValue::Text(self.reference.clone()),
            TenderField::MaitreOuvrage => FieldValue::Text(self.maitre_ouvrage.clone()),
            TenderField::Objet => FieldValue::Text(self.objet.clone()),
            TenderField::Ville => FieldValue::Text(self.ville.clone()),
            TenderField::Budget => FieldValue::Amount(self.budget.clone()),
            TenderField::Montant => FieldValue::Amount(self.montant.clone()),
            TenderField::Adjudicataire => FieldValue::Text(self.adjudicataire.clone()),
            TenderField::DateOuverture => FieldValue::Date(self.date_ouverture),
            TenderField::DateAdjudication => FieldValue::Date(self.date_adjudication),
            TenderField::DateAffichage => FieldValue::Date(self.date_affichage),
            TenderField::FileLinks => FieldValue::Links(self.file_links.clone()),
        }
    }

    /// Assigns `value` to `field`; returns false when the value kind does not fit the field.
    pub fn set_value(&mut self, field: TenderField, value: FieldValue) -> bool {
        match (field, value) {
            (TenderField::Reference, FieldValue::Text(v)) => self.reference = v,
            (TenderField::MaitreOuvrage, FieldValue::Text(v)) => self.maitre_ouvrage = v,
            (TenderField::Objet, FieldValue::Text(v)) => self.objet = v,
            (TenderField::Ville, FieldValue::Text(v)) => self.ville = v,
            (TenderField::Budget, FieldValue::Amount(v)) => self.budget = v,
            (TenderField::Montant, FieldValue::Amount(v)) => self.montant = v,
            (TenderField::Adjudicataire, FieldValue::Text(v)) => self.adjudicataire = v,
            (TenderField::DateOuverture, FieldValue::Date(v)) => self.date_ouverture = v,
            (TenderField::DateAdjudication, FieldValue::Date(v)) => self.date_adjudication = v,
            (TenderField::DateAffichage, FieldValue::Date(v)) => self.date_affichage = v,
            (TenderField::FileLinks, FieldValue::Links(v)) => self.file_links = v,
            _ => return false,
        }
        true
    }

    /// Copies `field` from `source` into `self`.
    pub fn copy_field(&mut self, field: TenderField, source: &CanonicalRecord) {
        self.set_value(field, source.value(field));
    }

    /// True when reference, objet and maître d'ouvrage are all blank.
    pub fn lacks_identity(&self) -> bool {
        self.reference.trim().is_empty()
            && self.objet.trim().is_empty()
            && self.maitre_ouvrage.trim().is_empty()
    }

    /// Fields whose comparison form differs between `self` and `other`.
    pub fn differing_fields(
        &self,
        other: &CanonicalRecord,
        fields: &[TenderField],
    ) -> Vec<TenderField> {
        fields
            .iter()
            .copied()
            .filter(|f| !self.value(*f).same_content(&other.value(*f)))
            .collect()
    }
}

/// Key used to find "the same tender" across scrape runs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum IdentityKey {
    Reference(String),
    Composite(String),
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKey::Reference(k) => write!(f, "ref:{k}"),
            IdentityKey::Composite(k) => write!(f, "composite:{k}"),
        }
    }
}

/// Persisted counterpart of [`CanonicalRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: Uuid,
    #[serde(flatten)]
    pub record: CanonicalRecord,
    pub created_at: DateTime<Utc>,
    pub last_imported_at: DateTime<Utc>,
    pub last_fingerprint: String,
    #[serde(default)]
    pub operator_modified_fields: BTreeSet<TenderField>,
}

impl StoredRecord {
    pub fn is_protected(&self, field: TenderField) -> bool {
        self.operator_modified_fields.contains(&field)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Collecting,
    Ready,
    Imported,
    Expired,
}

/// Output of one scrape run, held until an operator confirms import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingBatch {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: BatchStatus,
    #[serde(default)]
    pub records: Vec<RawCandidate>,
}

impl StagingBatch {
    pub fn collecting(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: None,
            status: BatchStatus::Collecting,
            records: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Created,
    Updated,
    Unchanged,
    SkippedInvalid,
    Conflict,
}

/// Per-record result of an import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportOutcome {
    /// Position of the record in the staged batch.
    pub index: usize,
    pub identity_key: Option<IdentityKey>,
    pub classification: Classification,
    pub stored_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicting_ids: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Aggregate counts of an import plus the messages of failed entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportStats {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped_invalid: usize,
    pub conflict: usize,
    pub errors: Vec<String>,
}

impl ImportStats {
    pub fn record(&mut self, outcome: &ImportOutcome) {
        match outcome.classification {
            Classification::Created => self.created += 1,
            Classification::Updated => self.updated += 1,
            Classification::Unchanged => self.unchanged += 1,
            Classification::SkippedInvalid => self.skipped_invalid += 1,
            Classification::Conflict => self.conflict += 1,
        }
        if matches!(
            outcome.classification,
            Classification::SkippedInvalid | Classification::Conflict
        ) {
            let key = outcome
                .identity_key
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("record #{}", outcome.index));
            let message = outcome.message.as_deref().unwrap_or("no detail");
            self.errors.push(format!("{key}: {message}"));
        }
    }

    pub fn total(&self) -> usize {
        self.created + self.updated + self.unchanged + self.skipped_invalid + self.conflict
    }

    pub fn error_count(&self) -> usize {
        self.skipped_invalid + self.conflict
    }
}
