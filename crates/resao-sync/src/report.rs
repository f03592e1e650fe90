//! Per-import reports: JSON outcome log plus a Parquet snapshot of the tender table.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use resao_core::StoredRecord;
use resao_storage::{sha256_hex, write_atomically};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::reconcile::ImportReport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub files: Vec<ReportManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ImportReportWriter {
    reports_dir: PathBuf,
}

impl ImportReportWriter {
    pub fn new(reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            reports_dir: reports_dir.into(),
        }
    }

    /// Writes `<reports>/<run_id>/{import_report.json, tenders.parquet, manifest.json}`.
    pub async fn write(&self, report: &ImportReport, tenders: &[StoredRecord]) -> Result<PathBuf> {
        let dir = self.reports_dir.join(report.run_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let report_path = dir.join("import_report.json");
        let bytes = serde_json::to_vec_pretty(report).context("serializing import report")?;
        write_atomically(&report_path, &bytes).await?;

        let parquet_path = dir.join("tenders.parquet");
        write_tenders_parquet(&parquet_path, tenders)?;

        let manifest = ReportManifest {
            schema_version: 1,
            files: vec![
                manifest_entry("import_report", &dir, &report_path)?,
                manifest_entry("tenders", &dir, &parquet_path)?,
            ],
        };
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
        write_atomically(&dir.join("manifest.json"), &bytes).await?;
        Ok(dir)
    }
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn text_column<'a>(
    tenders: &'a [StoredRecord],
    f: impl Fn(&'a StoredRecord) -> Option<String>,
) -> StringArray {
    StringArray::from(tenders.iter().map(f).collect::<Vec<_>>())
}

fn write_tenders_parquet(path: &Path, tenders: &[StoredRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("reference", DataType::Utf8, false),
        ArrowField::new("maitre_ouvrage", DataType::Utf8, false),
        ArrowField::new("objet", DataType::Utf8, false),
        ArrowField::new("ville", DataType::Utf8, false),
        ArrowField::new("budget", DataType::Utf8, true),
        ArrowField::new("montant", DataType::Utf8, true),
        ArrowField::new("adjudicataire", DataType::Utf8, false),
        ArrowField::new("date_ouverture", DataType::Utf8, true),
        ArrowField::new("date_adjudication", DataType::Utf8, true),
        ArrowField::new("date_affichage", DataType::Utf8, true),
        ArrowField::new("file_link_count", DataType::UInt32, false),
        ArrowField::new("operator_modified_fields", DataType::Utf8, false),
        ArrowField::new("last_fingerprint", DataType::Utf8, false),
        ArrowField::new("last_imported_at", DataType::Utf8, false),
    ]));

    let date = |d: Option<chrono::NaiveDate>| d.map(|d| d.format("%Y-%m-%d").to_string());
    let columns: Vec<Arc<dyn arrow_array::Array>> = vec![
        Arc::new(text_column(tenders, |t| Some(t.id.to_string()))),
        Arc::new(text_column(tenders, |t| Some(t.record.reference.clone()))),
        Arc::new(text_column(tenders, |t| Some(t.record.maitre_ouvrage.clone()))),
        Arc::new(text_column(tenders, |t| Some(t.record.objet.clone()))),
        Arc::new(text_column(tenders, |t| Some(t.record.ville.clone()))),
        Arc::new(text_column(tenders, |t| t.record.budget.as_ref().map(|v| v.to_string()))),
        Arc::new(text_column(tenders, |t| t.record.montant.as_ref().map(|v| v.to_string()))),
        Arc::new(text_column(tenders, |t| Some(t.record.adjudicataire.clone()))),
        Arc::new(text_column(tenders, |t| date(t.record.date_ouverture))),
        Arc::new(text_column(tenders, |t| date(t.record.date_adjudication))),
        Arc::new(text_column(tenders, |t| date(t.record.date_affichage))),
        Arc::new(UInt32Array::from(
            tenders
                .iter()
                .map(|t| t.record.file_links.len() as u32)
                .collect::<Vec<_>>(),
        )),
        Arc::new(text_column(tenders, |t| {
            Some(
                t.operator_modified_fields
                    .iter()
                    .map(|f| f.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
            )
        })),
        Arc::new(text_column(tenders, |t| Some(t.last_fingerprint.clone()))),
        Arc::new(text_column(tenders, |t| Some(t.last_imported_at.to_rfc3339()))),
    ];

    let batch = RecordBatch::try_new(schema, columns).context("building tenders record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, dir: &Path, path: &Path) -> Result<ReportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path.strip_prefix(dir).unwrap_or(path).display().to_string();
    Ok(ReportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}
