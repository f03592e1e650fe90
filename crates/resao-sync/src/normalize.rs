//! Raw scraper output → canonical tender records. Pure functions only.

use bigdecimal::BigDecimal;
use chrono::{NaiveDate, NaiveDateTime};
use resao_core::{CanonicalRecord, RawCandidate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const PLACEHOLDERS: [&str; 8] = ["-", "--", "/", "n/a", "na", "néant", "neant", "nc"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    #[error("insufficient identity: reference, objet and maître d'ouvrage are all empty")]
    InsufficientIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizerConfig {
    #[serde(default = "default_date_formats")]
    pub date_formats: Vec<String>,
    #[serde(default = "default_currency_suffixes")]
    pub currency_suffixes: Vec<String>,
}

fn default_date_formats() -> Vec<String> {
    ["%d/%m/%Y", "%Y-%m-%d", "%d-%m-%Y", "%d.%m.%Y", "%d/%m/%Y %H:%M"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_currency_suffixes() -> Vec<String> {
    ["dhs", "dh", "mad", "ttc", "ht", "eur", "€"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            date_formats: default_date_formats(),
            currency_suffixes: default_currency_suffixes(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    config: NormalizerConfig,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    pub fn normalize(&self, raw: &RawCandidate) -> Result<CanonicalRecord, RejectionReason> {
        let record = CanonicalRecord {
            reference: clean_text(raw.reference.as_deref()),
            maitre_ouvrage: clean_text(raw.maitre_ouvrage.as_deref()),
            objet: clean_text(raw.objet.as_deref()),
            ville: clean_text(raw.ville.as_deref()),
            budget: self.amount(raw.budget.as_deref()),
            montant: self.amount(raw.montant.as_deref()),
            adjudicataire: clean_text(raw.adjudicataire.as_deref()),
            date_ouverture: self.date(raw.date_ouverture.as_deref()),
            date_adjudication: self.date(raw.date_adjudication.as_deref()),
            date_affichage: self.date(raw.date_affichage.as_deref()),
            file_links: file_links(raw),
        };

        if record.lacks_identity() {
            return Err(RejectionReason::InsufficientIdentity);
        }
        Ok(record)
    }

    pub fn amount(&self, input: Option<&str>) -> Option<BigDecimal> {
        parse_amount(input?, &self.config.currency_suffixes)
    }

    pub fn date(&self, input: Option<&str>) -> Option<NaiveDate> {
        parse_date(input?, &self.config.date_formats)
    }
}

/// Trims, collapses internal whitespace and blanks out placeholder values.
pub fn clean_text(input: Option<&str>) -> String {
    let Some(input) = input else {
        return String::new();
    };
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    if is_placeholder(&collapsed) {
        String::new()
    } else {
        collapsed
    }
}

fn is_placeholder(value: &str) -> bool {
    let lowered = value.to_lowercase();
    PLACEHOLDERS.contains(&lowered.as_str())
}

/// Parses a monetary string such as `1 250 000,00 DH` or `480.000,00 MAD`.
///
/// Unparseable or negative amounts yield `None`.
pub fn parse_amount(input: &str, currency_suffixes: &[String]) -> Option<BigDecimal> {
    let mut text = input.trim().to_lowercase();
    if text.is_empty() || is_placeholder(&text) {
        return None;
    }

    let mut stripped = true;
    while stripped {
        stripped = false;
        for suffix in currency_suffixes {
            let suffix = suffix.to_lowercase();
            if !suffix.is_empty() && text.ends_with(&suffix) {
                text.truncate(text.len() - suffix.len());
                text = text.trim_end().trim_end_matches('.').trim_end().to_string();
                stripped = true;
            }
        }
    }

    let compact: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}' && *c != '\u{202f}' && *c != '\'')
        .collect();
    if compact.is_empty() {
        return None;
    }

    let commas = compact.matches(',').count();
    let dots = compact.matches('.').count();
    let decimal_sep = match (commas, dots) {
        (0, 0) => None,
        (_, 0) if commas == 1 => Some(','),
        (_, 0) => None,
        (0, _) if dots == 1 => Some('.'),
        (0, _) => None,
        _ => {
            // Both present: whichever comes last separates the decimals.
            let last_comma = compact.rfind(',')?;
            let last_dot = compact.rfind('.')?;
            Some(if last_comma > last_dot { ',' } else { '.' })
        }
    };

    let mut normalized = String::with_capacity(compact.len());
    for c in compact.chars() {
        match c {
            '0'..='9' => normalized.push(c),
            ',' | '.' if Some(c) == decimal_sep => normalized.push('.'),
            ',' | '.' => {}
            _ => return None,
        }
    }
    if normalized.is_empty() || normalized.starts_with('.') || normalized.ends_with('.') {
        return None;
    }

    normalized.parse::<BigDecimal>().ok().map(|v| v.with_scale(2))
}

/// Parses a date with the configured formats; a trailing time component is ignored.
pub fn parse_date(input: &str, formats: &[String]) -> Option<NaiveDate> {
    let text = input.trim();
    if text.is_empty() || is_placeholder(text) {
        return None;
    }

    let date_part = text
        .split(|c: char| c.is_whitespace() || c == 'T')
        .next()
        .unwrap_or(text);

    for candidate in [text, date_part] {
        for format in formats {
            if let Ok(date) = NaiveDate::parse_from_str(candidate, format) {
                return Some(date);
            }
            if let Ok(datetime) = NaiveDateTime::parse_from_str(candidate, format) {
                return Some(datetime.date());
            }
        }
    }
    None
}

/// DAO link, PV link, then extracted files; blanks and repeats dropped.
fn file_links(raw: &RawCandidate) -> Vec<String> {
    let mut links: Vec<String> = Vec::new();
    let candidates = raw
        .lien_dao
        .iter()
        .chain(raw.lien_pv.iter())
        .chain(raw.extracted_files.iter());
    for link in candidates {
        let link = link.trim();
        if link.is_empty() || is_placeholder(link) || links.iter().any(|l| l == link) {
            continue;
        }
        links.push(link.to_string());
    }
    links
}
