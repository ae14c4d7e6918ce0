/// In-memory repository backend, used by tests and embedded setups.
/// Enforces the same uniqueness and gate semantics as the MySQL backend.
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::{
    CertificateChanges, CertificateRepository, CertificateUpsert, DaysRemainingRefresh,
    NewManualAdd, ParseResultUpdate, SearchFilter,
};
use crate::certificate::days_remaining;
use crate::error::{CertError, Result};
use crate::types::{CertSource, CertStatus, CertStore, Certificate, Page};

/// Mutex-guarded map of rows; every operation is one critical section,
/// which gives the same serialization the SQL transactions provide.
#[derive(Default)]
pub struct MemoryCertificateRepository {
    rows: Mutex<HashMap<Uuid, Certificate>>,
}

impl MemoryCertificateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn folder_taken(rows: &HashMap<Uuid, Certificate>, folder_name: &str, except: Option<Uuid>) -> bool {
        rows.values().any(|c| {
            c.folder_name.as_deref() == Some(folder_name) && Some(c.id) != except
        })
    }

    fn sorted_newest_first(mut items: Vec<Certificate>) -> Vec<Certificate> {
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items
    }
}

fn apply_changes(row: &mut Certificate, changes: CertificateChanges) {
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
}

#[async_trait]
impl CertificateRepository for MemoryCertificateRepository {
    async fn list(&self, store: CertStore, offset: u32, limit: u32) -> Result<Page<Certificate>> {
        let rows = self.rows.lock().unwrap();
        let matched: Vec<Certificate> = rows
            .values()
            .filter(|c| c.store == store)
            .cloned()
            .collect();
        let total = matched.len() as u64;
        let items = Self::sorted_newest_first(matched)
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Ok(Page { items, total })
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Certificate>> {
        Ok(self.rows.lock().unwrap().get(&id).cloned())
    }

    async fn get_by_domain(
        &self,
        store: CertStore,
        domain: &str,
        source: CertSource,
    ) -> Result<Option<Certificate>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .find(|c| c.store == store && c.domain == domain && c.source == source)
            .cloned())
    }

    async fn get_by_folder_name(&self, folder_name: &str) -> Result<Option<Certificate>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .find(|c| c.folder_name.as_deref() == Some(folder_name))
            .cloned())
    }

    async fn create_or_update(&self, upsert: CertificateUpsert) -> Result<Certificate> {
        let mut rows = self.rows.lock().unwrap();

        let existing_id = match &upsert.folder_name {
            Some(folder) => rows
                .values()
                .find(|c| c.folder_name.as_deref() == Some(folder.as_str()))
                .map(|c| c.id),
            None => rows
                .values()
                .find(|c| c.domain == upsert.domain && c.source == upsert.source)
                .map(|c| c.id),
        };

        if let Some(id) = existing_id {
            let row = rows.get_mut(&id).expect("row disappeared under lock");
            // Existing rows keep their source; everything else provided wins.
            row.store = upsert.store;
            row.domain = upsert.domain;
            if let Some(v) = upsert.folder_name {
                row.folder_name = Some(v);
            }
            if let Some(v) = upsert.status {
                row.status = v;
            }
            if let Some(v) = upsert.email {
                row.email = Some(v);
            }
            if let Some(v) = upsert.certificate {
                row.certificate = Some(v);
            }
            if let Some(v) = upsert.private_key {
                row.private_key = Some(v);
            }
            if let Some(v) = upsert.sans {
                row.sans = Some(v);
            }
            if let Some(v) = upsert.issuer {
                row.issuer = Some(v);
            }
            if let Some(v) = upsert.not_before {
                row.not_before = Some(v);
            }
            if let Some(v) = upsert.not_after {
                row.not_after = Some(v);
            }
            if let Some(v) = upsert.is_valid {
                row.is_valid = Some(v);
            }
            if let Some(v) = upsert.days_remaining {
                row.days_remaining = Some(v);
            }
            row.updated_at = Utc::now();
            return Ok(row.clone());
        }

        let now = Utc::now();
        let row = Certificate {
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
        };
        rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn create_manual_add(&self, new: NewManualAdd) -> Result<Certificate> {
        let mut rows = self.rows.lock().unwrap();

        if rows.values().any(|c| {
            c.store == new.store && c.domain == new.domain && c.source == CertSource::ManualAdd
        }) {
            return Err(CertError::conflict(format!(
                "certificate for domain '{}' already exists in store '{}'",
                new.domain, new.store
            )));
        }
        if let Some(folder) = &new.folder_name {
            if Self::folder_taken(&rows, folder, None) {
                return Err(CertError::conflict(format!(
                    "folder_name '{folder}' already exists"
                )));
            }
        }

        let now = Utc::now();
        let row = Certificate {
            id: Uuid::new_v4(),
            store: new.store,
            domain: new.domain,
            folder_name: new.folder_name,
            source: CertSource::ManualAdd,
            status: CertStatus::Process,
            email: new.email,
            certificate: Some(new.certificate),
            private_key: Some(new.private_key),
            sans: new.sans,
            issuer: new.issuer,
            not_before: None,
            not_after: None,
            is_valid: None,
            days_remaining: None,
            last_error_message: None,
            last_error_time: None,
            created_at: now,
            updated_at: now,
        };
        rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_by_id(&self, id: Uuid, changes: CertificateChanges) -> Result<Certificate> {
        let mut rows = self.rows.lock().unwrap();

        if let Some(folder) = &changes.folder_name {
            if Self::folder_taken(&rows, folder, Some(id)) {
                return Err(CertError::conflict(format!(
                    "folder_name '{folder}' already exists"
                )));
            }
        }

        let row = rows
            .get_mut(&id)
            .ok_or_else(|| CertError::not_found(format!("certificate {id} not found")))?;
        apply_changes(row, changes);
        Ok(row.clone())
    }

    async fn update_parse_result(
        &self,
        id: Uuid,
        update: ParseResultUpdate,
        status: CertStatus,
    ) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows.get_mut(&id) else {
            return Ok(false);
        };
        row.sans = update.sans;
        row.issuer = update.issuer;
        row.not_before = update.not_before;
        row.not_after = update.not_after;
        row.is_valid = update.is_valid;
        row.days_remaining = update.days_remaining;
        row.status = status;
        row.updated_at = Utc::now();
        Ok(true)
    }

    async fn update_all_days_remaining(&self) -> Result<DaysRemainingRefresh> {
        let mut rows = self.rows.lock().unwrap();
        let now = Utc::now();
        let mut updated = 0u64;
        let mut refreshed = Vec::new();

        for row in rows.values_mut() {
            let Some(not_after) = row.not_after else {
                continue;
            };
            let days = days_remaining(not_after, now);
            let valid = days >= 0;
            if row.days_remaining != Some(days) || row.is_valid != Some(valid) {
                row.days_remaining = Some(days);
                row.is_valid = Some(valid);
                row.updated_at = now;
                updated += 1;
            }
            refreshed.push(row.clone());
        }

        let total = refreshed.len() as u64;
        Ok(DaysRemainingRefresh {
            updated,
            total,
            rows: Self::sorted_newest_first(refreshed),
        })
    }

    async fn delete_by_id(&self, id: Uuid) -> Result<bool> {
        Ok(self.rows.lock().unwrap().remove(&id).is_some())
    }

    async fn search(&self, filter: SearchFilter) -> Result<Page<Certificate>> {
        let keyword = filter.keyword.to_lowercase();
        let rows = self.rows.lock().unwrap();
        let matched: Vec<Certificate> = rows
            .values()
            .filter(|c| {
                let text_hit = c.domain.to_lowercase().contains(&keyword)
                    || c.folder_name
                        .as_deref()
                        .is_some_and(|f| f.to_lowercase().contains(&keyword));
                let store_hit = filter.store.is_none_or(|s| c.store == s);
                let source_hit = filter.source.is_none_or(|s| c.source == s);
                text_hit && store_hit && source_hit
            })
            .cloned()
            .collect();
        let total = matched.len() as u64;
        let items = Self::sorted_newest_first(matched)
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect();
        Ok(Page { items, total })
    }

    async fn begin_processing(&self, id: Uuid) -> Result<Certificate> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| CertError::not_found(format!("certificate {id} not found")))?;
        if row.status == CertStatus::Process {
            return Err(CertError::conflict(format!(
                "certificate for domain '{}' is already being processed",
                row.domain
            )));
        }
        let before = row.clone();
        row.status = CertStatus::Process;
        row.updated_at = Utc::now();
        Ok(before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert(domain: &str, folder: Option<&str>, source: CertSource) -> CertificateUpsert {
        CertificateUpsert {
            folder_name: folder.map(String::from),
            status: Some(CertStatus::Success),
            ..CertificateUpsert::new(CertStore::Websites, domain, source)
        }
    }

    #[tokio::test]
    async fn upsert_keeps_source_on_update() {
        let repo = MemoryCertificateRepository::new();
        let created = repo
            .create_or_update(upsert("a.test", Some("a_test"), CertSource::ManualApply))
            .await
            .unwrap();
        assert_eq!(created.source, CertSource::ManualApply);

        // A pool import against the same folder must not flip the source.
        let updated = repo
            .create_or_update(upsert("a.test", Some("a_test"), CertSource::Auto))
            .await
            .unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.source, CertSource::ManualApply);
    }

    #[tokio::test]
    async fn manual_add_conflicts_on_duplicate() {
        let repo = MemoryCertificateRepository::new();
        let new = NewManualAdd {
            store: CertStore::Database,
            domain: "dup.test".to_string(),
            certificate: "PEM".to_string(),
            private_key: "KEY".to_string(),
            folder_name: None,
            email: None,
            sans: None,
            issuer: None,
        };
        let row = repo.create_manual_add(new.clone()).await.unwrap();
        assert_eq!(row.status, CertStatus::Process);
        assert!(matches!(
            repo.create_manual_add(new).await,
            Err(CertError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn begin_processing_gates_second_caller() {
        let repo = MemoryCertificateRepository::new();
        let row = repo
            .create_or_update(upsert("gate.test", Some("gate"), CertSource::Auto))
            .await
            .unwrap();

        let before = repo.begin_processing(row.id).await.unwrap();
        assert_eq!(before.status, CertStatus::Success);
        assert!(matches!(
            repo.begin_processing(row.id).await,
            Err(CertError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn days_remaining_refresh_updates_validity() {
        let repo = MemoryCertificateRepository::new();
        let row = repo
            .create_or_update(CertificateUpsert {
                not_after: Some(Utc::now() + chrono::Duration::days(5)),
                days_remaining: Some(90),
                is_valid: Some(true),
                ..upsert("days.test", Some("days"), CertSource::Auto)
            })
            .await
            .unwrap();

        let refresh = repo.update_all_days_remaining().await.unwrap();
        assert_eq!(refresh.total, 1);
        assert_eq!(refresh.updated, 1);
        let refreshed = refresh.rows.iter().find(|c| c.id == row.id).unwrap();
        assert_eq!(refreshed.days_remaining, Some(4));
        assert_eq!(refreshed.is_valid, Some(true));
    }

    #[tokio::test]
    async fn parse_result_writes_empty_sans() {
        let repo = MemoryCertificateRepository::new();
        let row = repo
            .create_or_update(upsert("sans.test", Some("sans"), CertSource::Auto))
            .await
            .unwrap();

        let ok = repo
            .update_parse_result(
                row.id,
                ParseResultUpdate {
                    sans: Some(Vec::new()),
                    ..ParseResultUpdate::default()
                },
                CertStatus::Success,
            )
            .await
            .unwrap();
        assert!(ok);
        let row = repo.get_by_id(row.id).await.unwrap().unwrap();
        assert_eq!(row.sans, Some(Vec::new()));
    }

    #[tokio::test]
    async fn search_matches_domain_and_folder() {
        let repo = MemoryCertificateRepository::new();
        repo.create_or_update(upsert("foo.test", Some("foo_folder"), CertSource::Auto))
            .await
            .unwrap();
        repo.create_or_update(upsert("bar.test", Some("contains_foo"), CertSource::Auto))
            .await
            .unwrap();

        let page = repo
            .search(SearchFilter {
                keyword: "FOO".to_string(),
                store: None,
                source: None,
                offset: 0,
                limit: 20,
            })
            .await
            .unwrap();
        assert_eq!(page.total, 2);

        let narrowed = repo
            .search(SearchFilter {
                keyword: "foo.test".to_string(),
                store: Some(CertStore::Websites),
                source: Some(CertSource::Auto),
                offset: 0,
                limit: 20,
            })
            .await
            .unwrap();
        assert_eq!(narrowed.total, 1);
    }
}
