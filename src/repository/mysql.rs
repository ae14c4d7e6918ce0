/// MySQL repository backend (sqlx)
///
/// Every operation runs inside one short transaction; the upsert takes a
/// row lock on the existing record and relies on the `folder_name` unique
/// constraint to serialize concurrent first inserts, retrying once on a
/// duplicate-key conflict.
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::types::Json;
use sqlx::{MySql, QueryBuilder, Row};
use uuid::Uuid;

use super::{
    CertificateChanges, CertificateRepository, CertificateUpsert, DaysRemainingRefresh,
    NewManualAdd, ParseResultUpdate, SearchFilter,
};
use crate::certificate::days_remaining;
use crate::error::{CertError, Result};
use crate::types::{CertSource, CertStatus, CertStore, Certificate, Page};

const COLUMNS: &str = "id, store, domain, folder_name, source, status, email, certificate, \
                       private_key, sans, issuer, not_before, not_after, is_valid, \
                       days_remaining, last_error_message, last_error_time, created_at, updated_at";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tls_certificates (
    id CHAR(36) NOT NULL PRIMARY KEY,
    store VARCHAR(16) NOT NULL,
    domain VARCHAR(255) NOT NULL,
    folder_name VARCHAR(255) NULL,
    source VARCHAR(16) NOT NULL,
    status VARCHAR(16) NOT NULL,
    email VARCHAR(255) NULL,
    certificate TEXT NULL,
    private_key TEXT NULL,
    sans JSON NULL,
    issuer VARCHAR(255) NULL,
    not_before DATETIME NULL,
    not_after DATETIME NULL,
    is_valid TINYINT(1) NULL,
    days_remaining BIGINT NULL,
    last_error_message TEXT NULL,
    last_error_time DATETIME NULL,
    created_at DATETIME NOT NULL,
    updated_at DATETIME NOT NULL,
    UNIQUE KEY uq_folder_name (folder_name),
    KEY idx_store_domain (store, domain),
    KEY idx_domain (domain),
    KEY idx_source (source),
    KEY idx_folder_name (folder_name)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
"#;

/// MySQL-backed certificate repository
pub struct MySqlCertificateRepository {
    pool: MySqlPool,
}

impl MySqlCertificateRepository {
    /// Connect a pre-pinged pool and bootstrap the schema.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .test_before_acquire(true)
            .connect(url)
            .await
            .map_err(storage_err)?;
        let repo = Self { pool };
        repo.ensure_schema().await?;
        Ok(repo)
    }

    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn fetch_by_id(&self, id: Uuid) -> Result<Option<Certificate>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM tls_certificates WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.as_ref().map(row_to_certificate).transpose()
    }

    /// Locked read + full-row write of the upsert's update arm.
    async fn update_locked(
        tx: &mut sqlx::Transaction<'_, MySql>,
        mut existing: Certificate,
        upsert: CertificateUpsert,
    ) -> Result<Certificate> {
        existing.store = upsert.store;
        existing.domain = upsert.domain;
        if let Some(v) = upsert.folder_name {
            existing.folder_name = Some(v);
        }
        if let Some(v) = upsert.status {
            existing.status = v;
        }
        if let Some(v) = upsert.email {
            existing.email = Some(v);
        }
        if let Some(v) = upsert.certificate {
            existing.certificate = Some(v);
        }
        if let Some(v) = upsert.private_key {
            existing.private_key = Some(v);
        }
        if let Some(v) = upsert.sans {
            existing.sans = Some(v);
        }
        if let Some(v) = upsert.issuer {
            existing.issuer = Some(v);
        }
        if let Some(v) = upsert.not_before {
            existing.not_before = Some(v);
        }
        if let Some(v) = upsert.not_after {
            existing.not_after = Some(v);
        }
        if let Some(v) = upsert.is_valid {
            existing.is_valid = Some(v);
        }
        if let Some(v) = upsert.days_remaining {
            existing.days_remaining = Some(v);
        }
        existing.updated_at = Utc::now();
        // source intentionally untouched
        write_row(tx, &existing).await?;
        Ok(existing)
    }
}

fn storage_err(e: sqlx::Error) -> CertError {
    CertError::storage(format!("MySQL error: {e}"))
}

fn is_duplicate_key(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn naive(dt: DateTime<Utc>) -> NaiveDateTime {
    dt.naive_utc()
}

fn opt_naive(dt: Option<DateTime<Utc>>) -> Option<NaiveDateTime> {
    dt.map(naive)
}

fn row_to_certificate(row: &MySqlRow) -> Result<Certificate> {
    let id: String = row.try_get("id").map_err(storage_err)?;
    let store: String = row.try_get("store").map_err(storage_err)?;
    let source: String = row.try_get("source").map_err(storage_err)?;
    let status: String = row.try_get("status").map_err(storage_err)?;
    let sans: Option<Json<Vec<String>>> = row.try_get("sans").map_err(storage_err)?;
    let not_before: Option<NaiveDateTime> = row.try_get("not_before").map_err(storage_err)?;
    let not_after: Option<NaiveDateTime> = row.try_get("not_after").map_err(storage_err)?;
    let last_error_time: Option<NaiveDateTime> =
        row.try_get("last_error_time").map_err(storage_err)?;
    let created_at: NaiveDateTime = row.try_get("created_at").map_err(storage_err)?;
    let updated_at: NaiveDateTime = row.try_get("updated_at").map_err(storage_err)?;

    Ok(Certificate {
        id: Uuid::parse_str(&id).map_err(|e| CertError::storage(format!("Bad row id: {e}")))?,
        store: store.parse::<CertStore>()?,
        domain: row.try_get("domain").map_err(storage_err)?,
        folder_name: row.try_get("folder_name").map_err(storage_err)?,
        source: source.parse::<CertSource>()?,
        status: status.parse::<CertStatus>()?,
        email: row.try_get("email").map_err(storage_err)?,
        certificate: row.try_get("certificate").map_err(storage_err)?,
        private_key: row.try_get("private_key").map_err(storage_err)?,
        sans: sans.map(|j| j.0),
        issuer: row.try_get("issuer").map_err(storage_err)?,
        not_before: not_before.map(|d| d.and_utc()),
        not_after: not_after.map(|d| d.and_utc()),
        is_valid: row.try_get("is_valid").map_err(storage_err)?,
        days_remaining: row.try_get("days_remaining").map_err(storage_err)?,
        last_error_message: row.try_get("last_error_message").map_err(storage_err)?,
        last_error_time: last_error_time.map(|d| d.and_utc()),
        created_at: created_at.and_utc(),
        updated_at: updated_at.and_utc(),
    })
}

/// Persist the full row state. Used by every write path so the column
/// list lives in one place.
async fn write_row(tx: &mut sqlx::Transaction<'_, MySql>, row: &Certificate) -> Result<()> {
    sqlx::query(
        "UPDATE tls_certificates SET store = ?, domain = ?, folder_name = ?, status = ?, \
         email = ?, certificate = ?, private_key = ?, sans = ?, issuer = ?, not_before = ?, \
         not_after = ?, is_valid = ?, days_remaining = ?, last_error_message = ?, \
         last_error_time = ?, updated_at = ? WHERE id = ?",
    )
    .bind(row.store.as_str())
    .bind(&row.domain)
    .bind(&row.folder_name)
    .bind(row.status.as_str())
    .bind(&row.email)
    .bind(&row.certificate)
    .bind(&row.private_key)
    .bind(row.sans.clone().map(Json))
    .bind(&row.issuer)
    .bind(opt_naive(row.not_before))
    .bind(opt_naive(row.not_after))
    .bind(row.is_valid)
    .bind(row.days_remaining)
    .bind(&row.last_error_message)
    .bind(opt_naive(row.last_error_time))
    .bind(naive(row.updated_at))
    .bind(row.id.to_string())
    .execute(&mut **tx)
    .await
    .map_err(storage_err)?;
    Ok(())
}

async fn insert_row(tx: &mut sqlx::Transaction<'_, MySql>, row: &Certificate) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO tls_certificates (id, store, domain, folder_name, source, status, email, \
         certificate, private_key, sans, issuer, not_before, not_after, is_valid, \
         days_remaining, last_error_message, last_error_time, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(row.id.to_string())
    .bind(row.store.as_str())
    .bind(&row.domain)
    .bind(&row.folder_name)
    .bind(row.source.as_str())
    .bind(row.status.as_str())
    .bind(&row.email)
    .bind(&row.certificate)
    .bind(&row.private_key)
    .bind(row.sans.clone().map(Json))
    .bind(&row.issuer)
    .bind(opt_naive(row.not_before))
    .bind(opt_naive(row.not_after))
    .bind(row.is_valid)
    .bind(row.days_remaining)
    .bind(&row.last_error_message)
    .bind(opt_naive(row.last_error_time))
    .bind(naive(row.created_at))
    .bind(naive(row.updated_at))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn lock_existing(
    tx: &mut sqlx::Transaction<'_, MySql>,
    upsert: &CertificateUpsert,
) -> Result<Option<Certificate>> {
    let row = match &upsert.folder_name {
        Some(folder) => sqlx::query(&format!(
            "SELECT {COLUMNS} FROM tls_certificates WHERE folder_name = ? FOR UPDATE"
        ))
        .bind(folder)
        .fetch_optional(&mut **tx)
        .await
        .map_err(storage_err)?,
        None => sqlx::query(&format!(
            "SELECT {COLUMNS} FROM tls_certificates WHERE domain = ? AND source = ? FOR UPDATE"
        ))
        .bind(&upsert.domain)
        .bind(upsert.source.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(storage_err)?,
    };
    row.as_ref().map(row_to_certificate).transpose()
}

fn fresh_row(upsert: CertificateUpsert) -> Certificate {
    let now = Utc::now();
    Certificate {
        id: Uuid::new_v4(),
        store: upsert.store,
        domain: upsert.domain,
        folder_name: upsert.folder_name,
        source: upsert.source,
        status: upsert.status.unwrap_or(CertStatus::Process),
        email: upsert.email,
        certificate: upsert.certificate,
        private_key: upsert.private_key,
        sans: upsert.sans,
        issuer: upsert.issuer,
        not_before: upsert.not_before,
        not_after: upsert.not_after,
        is_valid: upsert.is_valid,
        days_remaining: upsert.days_remaining,
        last_error_message: None,
        last_error_time: None,
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl CertificateRepository for MySqlCertificateRepository {
    async fn list(&self, store: CertStore, offset: u32, limit: u32) -> Result<Page<Certificate>> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tls_certificates WHERE store = ?")
            .bind(store.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;

        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM tls_certificates WHERE store = ? \
             ORDER BY created_at DESC LIMIT ? OFFSET ?"
        ))
        .bind(store.as_str())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let items = rows
            .iter()
            .map(row_to_certificate)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page {
            items,
            total: total as u64,
        })
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Certificate>> {
        self.fetch_by_id(id).await
    }

    async fn get_by_domain(
        &self,
        store: CertStore,
        domain: &str,
        source: CertSource,
    ) -> Result<Option<Certificate>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM tls_certificates WHERE store = ? AND domain = ? AND source = ?"
        ))
        .bind(store.as_str())
        .bind(domain)
        .bind(source.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.as_ref().map(row_to_certificate).transpose()
    }

    async fn get_by_folder_name(&self, folder_name: &str) -> Result<Option<Certificate>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM tls_certificates WHERE folder_name = ?"
        ))
        .bind(folder_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.as_ref().map(row_to_certificate).transpose()
    }

    async fn create_or_update(&self, upsert: CertificateUpsert) -> Result<Certificate> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        if let Some(existing) = lock_existing(&mut tx, &upsert).await? {
            let row = Self::update_locked(&mut tx, existing, upsert).await?;
            tx.commit().await.map_err(storage_err)?;
            return Ok(row);
        }

        let row = fresh_row(upsert.clone());
        match insert_row(&mut tx, &row).await {
            Ok(()) => {
                tx.commit().await.map_err(storage_err)?;
                Ok(row)
            }
            Err(e) if is_duplicate_key(&e) => {
                // A concurrent first insert won the unique constraint;
                // retry once as an update against the winner's row.
                tx.rollback().await.map_err(storage_err)?;
                let mut tx = self.pool.begin().await.map_err(storage_err)?;
                let existing = lock_existing(&mut tx, &upsert).await?.ok_or_else(|| {
                    CertError::conflict("concurrent upsert raced and the winning row vanished")
                })?;
                let row = Self::update_locked(&mut tx, existing, upsert).await?;
                tx.commit().await.map_err(storage_err)?;
                Ok(row)
            }
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn create_manual_add(&self, new: NewManualAdd) -> Result<Certificate> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let duplicate: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tls_certificates WHERE store = ? AND domain = ? AND source = ?",
        )
        .bind(new.store.as_str())
        .bind(&new.domain)
        .bind(CertSource::ManualAdd.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(storage_err)?;
        if duplicate > 0 {
            return Err(CertError::conflict(format!(
                "certificate for domain '{}' already exists in store '{}'",
                new.domain, new.store
            )));
        }

        let row = fresh_row(CertificateUpsert {
            folder_name: new.folder_name,
            status: Some(CertStatus::Process),
            email: new.email,
            certificate: Some(new.certificate),
            private_key: Some(new.private_key),
            sans: new.sans,
            issuer: new.issuer,
            ..CertificateUpsert::new(new.store, new.domain, CertSource::ManualAdd)
        });

        match insert_row(&mut tx, &row).await {
            Ok(()) => {
                tx.commit().await.map_err(storage_err)?;
                Ok(row)
            }
            Err(e) if is_duplicate_key(&e) => Err(CertError::conflict(format!(
                "folder_name '{}' already exists",
                row.folder_name.as_deref().unwrap_or_default()
            ))),
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn update_by_id(&self, id: Uuid, changes: CertificateChanges) -> Result<Certificate> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        if let Some(folder) = &changes.folder_name {
            let taken: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM tls_certificates WHERE folder_name = ? AND id <> ?",
            )
            .bind(folder)
            .bind(id.to_string())
            .fetch_one(&mut *tx)
            .await
            .map_err(storage_err)?;
            if taken > 0 {
                return Err(CertError::conflict(format!(
                    "folder_name '{folder}' already exists"
                )));
            }
        }

        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM tls_certificates WHERE id = ? FOR UPDATE"
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err)?;
        let mut row = row
            .as_ref()
            .map(row_to_certificate)
            .transpose()?
            .ok_or_else(|| CertError::not_found(format!("certificate {id} not found")))?;

        if let Some(v) = changes.store {
            row.store = v;
        }
        if let Some(v) = changes.domain {
            row.domain = v;
        }
        if let Some(v) = changes.folder_name {
            row.folder_name = Some(v);
        }
        if let Some(v) = changes.status {
            row.status = v;
        }
        if let Some(v) = changes.email {
            row.email = Some(v);
        }
        if let Some(v) = changes.certificate {
            row.certificate = Some(v);
        }
        if let Some(v) = changes.private_key {
            row.private_key = Some(v);
        }
        if let Some(v) = changes.sans {
            row.sans = Some(v);
        }
        if let Some(v) = changes.issuer {
            row.issuer = Some(v);
        }
        if let Some(v) = changes.not_before {
            row.not_before = Some(v);
        }
        if let Some(v) = changes.not_after {
            row.not_after = Some(v);
        }
        if let Some(v) = changes.is_valid {
            row.is_valid = Some(v);
        }
        if let Some(v) = changes.days_remaining {
            row.days_remaining = Some(v);
        }
        if let Some(v) = changes.last_error_message {
            row.last_error_message = Some(v);
        }
        if let Some(v) = changes.last_error_time {
            row.last_error_time = Some(v);
        }
        row.updated_at = Utc::now();

        write_row(&mut tx, &row).await?;
        tx.commit().await.map_err(storage_err)?;
        Ok(row)
    }

    async fn update_parse_result(
        &self,
        id: Uuid,
        update: ParseResultUpdate,
        status: CertStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tls_certificates SET sans = ?, issuer = ?, not_before = ?, not_after = ?, \
             is_valid = ?, days_remaining = ?, status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(update.sans.map(Json))
        .bind(update.issuer)
        .bind(opt_naive(update.not_before))
        .bind(opt_naive(update.not_after))
        .bind(update.is_valid)
        .bind(update.days_remaining)
        .bind(status.as_str())
        .bind(naive(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_all_days_remaining(&self) -> Result<DaysRemainingRefresh> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM tls_certificates WHERE not_after IS NOT NULL \
             ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut certificates = rows
            .iter()
            .map(row_to_certificate)
            .collect::<Result<Vec<_>>>()?;

        let now = Utc::now();
        let total = certificates.len() as u64;
        let mut updated = 0u64;

        for cert in certificates.iter_mut() {
            let Some(not_after) = cert.not_after else {
                continue;
            };
            let days = days_remaining(not_after, now);
            let valid = days >= 0;
            if cert.days_remaining == Some(days) && cert.is_valid == Some(valid) {
                continue;
            }
            sqlx::query(
                "UPDATE tls_certificates SET days_remaining = ?, is_valid = ?, updated_at = ? \
                 WHERE id = ?",
            )
            .bind(days)
            .bind(valid)
            .bind(naive(now))
            .bind(cert.id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
            cert.days_remaining = Some(days);
            cert.is_valid = Some(valid);
            cert.updated_at = now;
            updated += 1;
        }

        Ok(DaysRemainingRefresh {
            updated,
            total,
            rows: certificates,
        })
    }

    async fn delete_by_id(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tls_certificates WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn search(&self, filter: SearchFilter) -> Result<Page<Certificate>> {
        let pattern = format!("%{}%", filter.keyword.to_lowercase());

        let mut count_qb: QueryBuilder<MySql> = QueryBuilder::new(
            "SELECT COUNT(*) FROM tls_certificates WHERE (LOWER(domain) LIKE ",
        );
        count_qb.push_bind(pattern.clone());
        count_qb.push(" OR LOWER(folder_name) LIKE ");
        count_qb.push_bind(pattern.clone());
        count_qb.push(")");
        if let Some(store) = filter.store {
            count_qb.push(" AND store = ");
            count_qb.push_bind(store.as_str());
        }
        if let Some(source) = filter.source {
            count_qb.push(" AND source = ");
            count_qb.push_bind(source.as_str());
        }
        let total: i64 = count_qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;

        let mut qb: QueryBuilder<MySql> = QueryBuilder::new(format!(
            "SELECT {COLUMNS} FROM tls_certificates WHERE (LOWER(domain) LIKE "
        ));
        qb.push_bind(pattern.clone());
        qb.push(" OR LOWER(folder_name) LIKE ");
        qb.push_bind(pattern);
        qb.push(")");
        if let Some(store) = filter.store {
            qb.push(" AND store = ");
            qb.push_bind(store.as_str());
        }
        if let Some(source) = filter.source {
            qb.push(" AND source = ");
            qb.push_bind(source.as_str());
        }
        qb.push(" ORDER BY created_at DESC LIMIT ");
        qb.push_bind(filter.limit);
        qb.push(" OFFSET ");
        qb.push_bind(filter.offset);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(storage_err)?;
        let items = rows
            .iter()
            .map(row_to_certificate)
            .collect::<Result<Vec<_>>>()?;

        Ok(Page {
            items,
            total: total as u64,
        })
    }

    async fn begin_processing(&self, id: Uuid) -> Result<Certificate> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM tls_certificates WHERE id = ? FOR UPDATE"
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err)?;
        let before = row
            .as_ref()
            .map(row_to_certificate)
            .transpose()?
            .ok_or_else(|| CertError::not_found(format!("certificate {id} not found")))?;

        if before.status == CertStatus::Process {
            return Err(CertError::conflict(format!(
                "certificate for domain '{}' is already being processed",
                before.domain
            )));
        }

        sqlx::query("UPDATE tls_certificates SET status = ?, updated_at = ? WHERE id = ?")
            .bind(CertStatus::Process.as_str())
            .bind(naive(Utc::now()))
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;
        Ok(before)
    }
}
