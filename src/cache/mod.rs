//! Read-through cache for list and detail projections.
//!
//! Writes happen only on the read path; invalidation happens only through
//! the `cache.invalidate` event consumer so every API node converges.

pub mod redis;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{CertStore, CertificateDetail, CertificateListPage};

/// Key of the list projection for one page of one store.
pub fn list_key(store: CertStore, offset: u32, limit: u32) -> String {
    format!("certs:list:{store}:off={offset}:lim={limit}")
}

/// Key of the detail projection for one domain in one store.
pub fn detail_key(store: CertStore, domain: &str) -> String {
    format!("certs:detail:{store}:{domain}")
}

/// Glob matching every key that touches a store, both projections.
pub fn store_pattern(store: CertStore) -> String {
    format!("certs:*:{store}*")
}

/// Best-effort projection cache. Callers treat every error as a miss.
#[async_trait]
pub trait CertCache: Send + Sync {
    async fn get_list(
        &self,
        store: CertStore,
        offset: u32,
        limit: u32,
    ) -> Result<Option<CertificateListPage>>;

    async fn put_list(
        &self,
        store: CertStore,
        offset: u32,
        limit: u32,
        page: &CertificateListPage,
    ) -> Result<()>;

    async fn get_detail(&self, store: CertStore, domain: &str)
    -> Result<Option<CertificateDetail>>;

    async fn put_detail(
        &self,
        store: CertStore,
        domain: &str,
        detail: &CertificateDetail,
    ) -> Result<()>;

    /// Drop every key touching the store. Returns the number of keys removed.
    async fn clear_store(&self, store: CertStore) -> Result<usize>;
}

/// Cache that stores nothing; used when Redis is not wired up and in tests.
#[derive(Debug, Default, Clone)]
pub struct NullCache;

#[async_trait]
impl CertCache for NullCache {
    async fn get_list(
        &self,
        _store: CertStore,
        _offset: u32,
        _limit: u32,
    ) -> Result<Option<CertificateListPage>> {
        Ok(None)
    }

    async fn put_list(
        &self,
        _store: CertStore,
        _offset: u32,
        _limit: u32,
        _page: &CertificateListPage,
    ) -> Result<()> {
        Ok(())
    }

    async fn get_detail(
        &self,
        _store: CertStore,
        _domain: &str,
    ) -> Result<Option<CertificateDetail>> {
        Ok(None)
    }

    async fn put_detail(
        &self,
        _store: CertStore,
        _domain: &str,
        _detail: &CertificateDetail,
    ) -> Result<()> {
        Ok(())
    }

    async fn clear_store(&self, _store: CertStore) -> Result<usize> {
        Ok(0)
    }
}

pub use redis::RedisCertCache;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_stable() {
        assert_eq!(
            list_key(CertStore::Websites, 0, 20),
            "certs:list:websites:off=0:lim=20"
        );
        assert_eq!(
            detail_key(CertStore::Apis, "example.com"),
            "certs:detail:apis:example.com"
        );
    }

    #[test]
    fn store_pattern_matches_both_projections() {
        let pattern = store_pattern(CertStore::Websites);
        assert_eq!(pattern, "certs:*:websites*");
        // Sanity: the two projection keys sit inside the glob shape.
        assert!(list_key(CertStore::Websites, 0, 20).contains(":websites"));
        assert!(detail_key(CertStore::Websites, "a.test").contains(":websites"));
    }
}
