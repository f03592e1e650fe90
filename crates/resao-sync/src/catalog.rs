//! Read side of the system of record: filtered listings and filter-control values.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use resao_core::{fold_text, StoredRecord};
use serde::{Deserialize, Serialize};

use crate::normalize::Normalizer;

/// Listing filters; every unset field matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TenderFilter {
    pub reference: Option<String>,
    pub objet: Option<String>,
    pub maitre_ouvrage: Option<String>,
    pub ville: Option<String>,
    pub adjudicataire: Option<String>,
    pub montant_min: Option<String>,
    pub montant_max: Option<String>,
    pub budget_min: Option<String>,
    pub budget_max: Option<String>,
    pub ouverture_from: Option<NaiveDate>,
    pub ouverture_to: Option<NaiveDate>,
    pub adjudication_from: Option<NaiveDate>,
    pub adjudication_to: Option<NaiveDate>,
}

struct CompiledFilter {
    reference: Option<String>,
    objet: Option<String>,
    maitre_ouvrage: Option<String>,
    ville: Option<String>,
    adjudicataire: Option<String>,
    montant: (Option<BigDecimal>, Option<BigDecimal>),
    budget: (Option<BigDecimal>, Option<BigDecimal>),
    ouverture: (Option<NaiveDate>, Option<NaiveDate>),
    adjudication: (Option<NaiveDate>, Option<NaiveDate>),
}

fn folded(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(fold_text)
        .filter(|v| !v.is_empty())
}

impl TenderFilter {
    fn compile(&self, normalizer: &Normalizer) -> CompiledFilter {
        CompiledFilter {
            reference: folded(&self.reference),
            objet: folded(&self.objet),
            maitre_ouvrage: folded(&self.maitre_ouvrage),
            ville: folded(&self.ville),
            adjudicataire: folded(&self.adjudicataire),
            montant: (
                normalizer.amount(self.montant_min.as_deref()),
                normalizer.amount(self.montant_max.as_deref()),
            ),
            budget: (
                normalizer.amount(self.budget_min.as_deref()),
                normalizer.amount(self.budget_max.as_deref()),
            ),
            ouverture: (self.ouverture_from, self.ouverture_to),
            adjudication: (self.adjudication_from, self.adjudication_to),
        }
    }
}

fn contains(haystack: &str, needle: &Option<String>) -> bool {
    needle
        .as_deref()
        .map(|n| fold_text(haystack).contains(n))
        .unwrap_or(true)
}

fn equals(value: &str, wanted: &Option<String>) -> bool {
    wanted.as_deref().map(|w| fold_text(value) == w).unwrap_or(true)
}

fn within<T: PartialOrd>(value: Option<&T>, (min, max): &(Option<T>, Option<T>)) -> bool {
    if min.is_none() && max.is_none() {
        return true;
    }
    let Some(value) = value else {
        return false;
    };
    min.as_ref().map(|m| value >= m).unwrap_or(true)
        && max.as_ref().map(|m| value <= m).unwrap_or(true)
}

impl CompiledFilter {
    fn matches(&self, stored: &StoredRecord) -> bool {
        let r = &stored.record;
        contains(&r.reference, &self.reference)
            && contains(&r.objet, &self.objet)
            && equals(&r.maitre_ouvrage, &self.maitre_ouvrage)
            && equals(&r.ville, &self.ville)
            && equals(&r.adjudicataire, &self.adjudicataire)
            && within(r.montant.as_ref(), &self.montant)
            && within(r.budget.as_ref(), &self.budget)
            && within(r.date_ouverture.as_ref(), &self.ouverture)
            && within(r.date_adjudication.as_ref(), &self.adjudication)
    }
}

/// Filtered tenders, newest award first; undated awards go last.
pub fn list_tenders(
    records: Vec<StoredRecord>,
    filter: &TenderFilter,
    normalizer: &Normalizer,
) -> Vec<StoredRecord> {
    let compiled = filter.compile(normalizer);
    let mut listed: Vec<StoredRecord> =
        records.into_iter().filter(|r| compiled.matches(r)).collect();
    listed.sort_by(|a, b| {
        match (a.record.date_adjudication, b.record.date_adjudication) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
        .then_with(|| b.created_at.cmp(&a.created_at))
    });
    listed
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Range<T> {
    pub min: T,
    pub max: T,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DateRanges {
    pub ouverture: Option<Range<NaiveDate>>,
    pub adjudication: Option<Range<NaiveDate>>,
    pub affichage: Option<Range<NaiveDate>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AmountRanges {
    pub budget: Option<Range<BigDecimal>>,
    pub montant: Option<Range<BigDecimal>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterOptions {
    pub maitres_ouvrage: Vec<String>,
    pub villes: Vec<String>,
    pub adjudicataires: Vec<String>,
    pub date_ranges: DateRanges,
    pub amount_ranges: AmountRanges,
}

fn distinct<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    // Keyed by folded form; the first spelling seen is the one shown.
    let mut seen: BTreeMap<String, String> = BTreeMap::new();
    for value in values {
        let key = fold_text(value);
        if !key.is_empty() {
            seen.entry(key).or_insert_with(|| value.trim().to_string());
        }
    }
    seen.into_values().collect()
}

fn range<'a, T: Ord + Clone + 'a>(values: impl Iterator<Item = Option<&'a T>>) -> Option<Range<T>> {
    let mut present = values.flatten();
    let first = present.next()?;
    let (min, max) = present.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v)));
    Some(Range {
        min: min.clone(),
        max: max.clone(),
    })
}

pub fn filter_options(records: &[StoredRecord]) -> FilterOptions {
    FilterOptions {
        maitres_ouvrage: distinct(records.iter().map(|r| r.record.maitre_ouvrage.as_str())),
        villes: distinct(records.iter().map(|r| r.record.ville.as_str())),
        adjudicataires: distinct(records.iter().map(|r| r.record.adjudicataire.as_str())),
        date_ranges: DateRanges {
            ouverture: range(records.iter().map(|r| r.record.date_ouverture.as_ref())),
            adjudication: range(records.iter().map(|r| r.record.date_adjudication.as_ref())),
            affichage: range(records.iter().map(|r| r.record.date_affichage.as_ref())),
        },
        amount_ranges: AmountRanges {
            budget: range(records.iter().map(|r| r.record.budget.as_ref())),
            montant: range(records.iter().map(|r| r.record.montant.as_ref())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use resao_core::CanonicalRecord;
    use uuid::Uuid;

    fn stored(
        reference: &str,
        maitre: &str,
        ville: &str,
        montant: Option<&str>,
        adjudication: Option<(i32, u32, u32)>,
    ) -> StoredRecord {
        let now = Utc::now();
        StoredRecord {
            id: Uuid::new_v4(),
            record: CanonicalRecord {
                reference: reference.into(),
                maitre_ouvrage: maitre.into(),
                objet: format!("Travaux {reference}"),
                ville: ville.into(),
                montant: montant.map(|m| m.parse().unwrap()),
                date_adjudication: adjudication
                    .and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
                ..Default::default()
            },
            created_at: now,
            last_imported_at: now,
            last_fingerprint: String::new(),
            operator_modified_fields: Default::default(),
        }
    }

    fn sample() -> Vec<StoredRecord> {
        vec![
            stored("AO-1", "Commune de Fès", "Fès", Some("1000.00"), Some((2024, 1, 10))),
            stored("AO-2", "commune de fès", "Meknès", Some("5000.00"), Some((2024, 3, 1))),
            stored("AO-3", "Région Oriental", "Oujda", None, None),
        ]
    }

    #[test]
    fn no_filter_lists_everything_newest_award_first() {
        let listed = list_tenders(sample(), &TenderFilter::default(), &Normalizer::default());
        let refs: Vec<_> = listed.iter().map(|r| r.record.reference.as_str()).collect();
        assert_eq!(refs, vec!["AO-2", "AO-1", "AO-3"]);
    }

    #[test]
    fn filters_combine_text_and_ranges() {
        let filter = TenderFilter {
            maitre_ouvrage: Some("COMMUNE DE FÈS".into()),
            montant_min: Some("2 000,00 DH".into()),
            ..Default::default()
        };
        let listed = list_tenders(sample(), &filter, &Normalizer::default());
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].record.reference, "AO-2");

        let dated = TenderFilter {
            adjudication_to: NaiveDate::from_ymd_opt(2024, 2, 1),
            ..Default::default()
        };
        let listed = list_tenders(sample(), &dated, &Normalizer::default());
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].record.reference, "AO-1");
    }

    #[test]
    fn ties_on_award_date_fall_back_to_creation_time() {
        let mut older = stored("AO-1", "A", "X", None, None);
        older.created_at = Utc::now() - Duration::days(2);
        let newer = stored("AO-2", "A", "X", None, None);
        let listed = list_tenders(
            vec![older, newer],
            &TenderFilter::default(),
            &Normalizer::default(),
        );
        assert_eq!(listed[0].record.reference, "AO-2");
    }

    #[test]
    fn options_are_distinct_and_ranged() {
        let options = filter_options(&sample());
        assert_eq!(options.maitres_ouvrage, vec!["Commune de Fès", "Région Oriental"]);
        assert_eq!(options.villes.len(), 3);
        let montant = options.amount_ranges.montant.clone().expect("montant range");
        assert_eq!(montant.min, "1000.00".parse::<BigDecimal>().unwrap());
        assert_eq!(montant.max, "5000.00".parse::<BigDecimal>().unwrap());
        assert!(options.date_ranges.ouverture.is_none());

        let json = serde_json::to_value(&options).unwrap();
        assert!(json.get("maitresOuvrage").is_some());
        assert!(json.get("dateRanges").is_some());
    }
}
