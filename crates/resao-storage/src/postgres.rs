//! PostgreSQL-backed tender repository.

use std::collections::BTreeSet;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use resao_core::{CanonicalRecord, StoredRecord, TenderField};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::warn;
use uuid::Uuid;

use crate::repository::{StoreError, TenderRepository, TenderSession, TenderWrite};

/// Advisory lock key held by every writer session, from its first read to commit.
const WRITER_LOCK_KEY: i64 = 0x7265_7361_6f00;

const SELECT_COLUMNS: &str = r#"
    SELECT id, reference, maitre_ouvrage, objet, ville, budget, montant, adjudicataire,
           date_ouverture, date_adjudication, date_affichage, file_links,
           created_at, last_imported_at, last_fingerprint, operator_modified_fields
      FROM tenders
"#;

#[derive(Debug, Clone)]
pub struct PgTenderRepository {
    pool: PgPool,
}

impl PgTenderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_record(row: &PgRow) -> Result<StoredRecord, StoreError> {
    let protected: Vec<String> = row.try_get("operator_modified_fields")?;
    let mut operator_modified_fields = BTreeSet::new();
    for name in protected {
        match name.parse::<TenderField>() {
            Ok(field) => {
                operator_modified_fields.insert(field);
            }
            Err(err) => warn!(%err, "ignoring unknown protected field"),
        }
    }

    Ok(StoredRecord {
        id: row.try_get::<Uuid, _>("id")?,
        record: CanonicalRecord {
            reference: row.try_get("reference")?,
            maitre_ouvrage: row.try_get("maitre_ouvrage")?,
            objet: row.try_get("objet")?,
            ville: row.try_get("ville")?,
            budget: row.try_get::<Option<BigDecimal>, _>("budget")?,
            montant: row.try_get::<Option<BigDecimal>, _>("montant")?,
            adjudicataire: row.try_get("adjudicataire")?,
            date_ouverture: row.try_get::<Option<NaiveDate>, _>("date_ouverture")?,
            date_adjudication: row.try_get::<Option<NaiveDate>, _>("date_adjudication")?,
            date_affichage: row.try_get::<Option<NaiveDate>, _>("date_affichage")?,
            file_links: row.try_get::<Vec<String>, _>("file_links")?,
        },
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        last_imported_at: row.try_get::<DateTime<Utc>, _>("last_imported_at")?,
        last_fingerprint: row.try_get("last_fingerprint")?,
        operator_modified_fields,
    })
}

fn protected_names(record: &StoredRecord) -> Vec<String> {
    record
        .operator_modified_fields
        .iter()
        .map(|f| f.as_str().to_string())
        .collect()
}

#[async_trait]
impl TenderRepository for PgTenderRepository {
    async fn load_all(&self) -> Result<Vec<StoredRecord>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY created_at, id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn get(&self, id: Uuid) -> Result<Option<StoredRecord>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn begin<'a>(&'a self) -> Result<Box<dyn TenderSession + 'a>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(WRITER_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgSession { tx }))
    }
}

/// A transaction holding the writer lock; rolled back if dropped uncommitted.
struct PgSession {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl TenderSession for PgSession {
    async fn load_all(&mut self) -> Result<Vec<StoredRecord>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY created_at, id");
        let rows = sqlx::query(&sql).fetch_all(&mut *self.tx).await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn get(&mut self, id: Uuid) -> Result<Option<StoredRecord>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *self.tx).await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn commit(self: Box<Self>, writes: Vec<TenderWrite>) -> Result<(), StoreError> {
        let PgSession { mut tx } = *self;
        apply_writes(&mut tx, writes).await?;
        tx.commit().await?;
        Ok(())
    }
}

async fn apply_writes(conn: &mut PgConnection, writes: Vec<TenderWrite>) -> Result<(), StoreError> {
    for write in writes {
        match write {
            TenderWrite::Insert(stored) => {
                let r = &stored.record;
                let result = sqlx::query(
                    r#"
                    INSERT INTO tenders (
                        id, reference, maitre_ouvrage, objet, ville, budget, montant,
                        adjudicataire, date_ouverture, date_adjudication, date_affichage,
                        file_links, created_at, last_imported_at, last_fingerprint,
                        operator_modified_fields
                    ) VALUES (
                        $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16
                    )
                    ON CONFLICT (id) DO NOTHING
                    "#,
                )
                .bind(stored.id)
                .bind(&r.reference)
                .bind(&r.maitre_ouvrage)
                .bind(&r.objet)
                .bind(&r.ville)
                .bind(&r.budget)
                .bind(&r.montant)
                .bind(&r.adjudicataire)
                .bind(r.date_ouverture)
                .bind(r.date_adjudication)
                .bind(r.date_affichage)
                .bind(&r.file_links)
                .bind(stored.created_at)
                .bind(stored.last_imported_at)
                .bind(&stored.last_fingerprint)
                .bind(protected_names(&stored))
                .execute(&mut *conn)
                .await?;
                if result.rows_affected() != 1 {
                    return Err(StoreError::Duplicate(stored.id));
                }
            }
            TenderWrite::Update(stored) => {
                let r = &stored.record;
                let result = sqlx::query(
                    r#"
                    UPDATE tenders
                       SET reference = $2,
                           maitre_ouvrage = $3,
                           objet = $4,
                           ville = $5,
                           budget = $6,
                           montant = $7,
                           adjudicataire = $8,
                           date_ouverture = $9,
                           date_adjudication = $10,
                           date_affichage = $11,
                           file_links = $12,
                           last_imported_at = $13,
                           last_fingerprint = $14,
                           operator_modified_fields = $15
                     WHERE id = $1
                    "#,
                )
                .bind(stored.id)
                .bind(&r.reference)
                .bind(&r.maitre_ouvrage)
                .bind(&r.objet)
                .bind(&r.ville)
                .bind(&r.budget)
                .bind(&r.montant)
                .bind(&r.adjudicataire)
                .bind(r.date_ouverture)
                .bind(r.date_adjudication)
                .bind(r.date_affichage)
                .bind(&r.file_links)
                .bind(stored.last_imported_at)
                .bind(&stored.last_fingerprint)
                .bind(protected_names(&stored))
                .execute(&mut *conn)
                .await?;
                if result.rows_affected() != 1 {
                    return Err(StoreError::NotFound(stored.id));
                }
            }
        }
    }
    Ok(())
}
