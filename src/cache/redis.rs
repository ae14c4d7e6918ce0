/// Redis-backed projection cache
use async_trait::async_trait;
use redis::AsyncCommands;

use super::{CertCache, detail_key, list_key, store_pattern};
use crate::error::{CertError, Result};
use crate::types::{CertStore, CertificateDetail, CertificateListPage};

/// Redis cache with per-projection TTLs.
pub struct RedisCertCache {
    client: redis::Client,
    list_ttl_secs: u64,
    detail_ttl_secs: u64,
}

impl RedisCertCache {
    pub fn new(redis_url: &str, list_ttl_secs: u64, detail_ttl_secs: u64) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| CertError::cache(format!("Redis connect error: {e}")))?;
        Ok(Self {
            client,
            list_ttl_secs,
            detail_ttl_secs,
        })
    }

    async fn conn(&self) -> Result<redis::aio::ConnectionManager> {
        self.client
            .get_connection_manager()
            .await
            .map_err(|e| CertError::cache(format!("Redis conn error: {e}")))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| CertError::cache(format!("Redis get error: {e}")))?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put_json<T: serde::Serialize>(&self, key: &str, value: &T, ttl: u64) -> Result<()> {
        let mut conn = self.conn().await?;
        let json = serde_json::to_string(value)?;
        let _: () = conn
            .set_ex(key, json, ttl)
            .await
            .map_err(|e| CertError::cache(format!("Redis setex error: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl CertCache for RedisCertCache {
    async fn get_list(
        &self,
        store: CertStore,
        offset: u32,
        limit: u32,
    ) -> Result<Option<CertificateListPage>> {
        self.get_json(&list_key(store, offset, limit)).await
    }

    async fn put_list(
        &self,
        store: CertStore,
        offset: u32,
        limit: u32,
        page: &CertificateListPage,
    ) -> Result<()> {
        self.put_json(&list_key(store, offset, limit), page, self.list_ttl_secs)
            .await
    }

    async fn get_detail(
        &self,
        store: CertStore,
        domain: &str,
    ) -> Result<Option<CertificateDetail>> {
        self.get_json(&detail_key(store, domain)).await
    }

    async fn put_detail(
        &self,
        store: CertStore,
        domain: &str,
        detail: &CertificateDetail,
    ) -> Result<()> {
        self.put_json(&detail_key(store, domain), detail, self.detail_ttl_secs)
            .await
    }

    async fn clear_store(&self, store: CertStore) -> Result<usize> {
        let mut conn = self.conn().await?;
        let keys: Vec<String> = conn
            .keys(store_pattern(store))
            .await
            .map_err(|e| CertError::cache(format!("Redis keys error: {e}")))?;
        if keys.is_empty() {
            return Ok(0);
        }
        let count = keys.len();
        let _: () = conn
            .del(keys)
            .await
            .map_err(|e| CertError::cache(format!("Redis del error: {e}")))?;
        Ok(count)
    }
}
