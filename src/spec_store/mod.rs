//! Spec Store Adapter: durable storage for API Specs with a read-through
//! in-process cache, decoupled from its backing store by the `SpecStore`
//! trait (mirroring the teacher's `Db`/`MockDb` split).
mod error;
pub mod mock;
pub mod models;
mod schema;
pub mod sqlite;

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

pub use error::SpecStoreError;
pub use models::ApiSpec;
pub use mock::MockSpecStore;
pub use sqlite::SqliteSpecStore;

pub type Result<T> = std::result::Result<T, SpecStoreError>;

/// Backing-store surface the rest of the system depends on. Object-safe
/// so `ServerState` can hold a `Arc<dyn SpecStore>` regardless of which
/// concrete store backs it in a given deployment or test.
#[async_trait]
pub trait SpecStore: Send + Sync {
    async fn get(&self, api_name: &str) -> Result<ApiSpec>;
    async fn upsert(&self, spec: ApiSpec) -> Result<()>;
    async fn list_by_publisher(&self, publisher: &str) -> Result<Vec<ApiSpec>>;
    async fn list_all(&self) -> Result<Vec<ApiSpec>>;
}

/// Read-through cache wrapping any `SpecStore`. `get` checks the cache
/// first and only consults the inner store on a miss; `upsert` writes
/// through and refreshes the cached entry so a subsequent `get` never
/// observes stale data.
pub struct CachedSpecStore<S> {
    inner: S,
    cache: RwLock<HashMap<String, ApiSpec>>,
}

impl<S: SpecStore> CachedSpecStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<S: SpecStore> SpecStore for CachedSpecStore<S> {
    async fn get(&self, api_name: &str) -> Result<ApiSpec> {
        if let Some(spec) = self.cache.read().unwrap().get(api_name) {
            return Ok(spec.clone());
        }
        let spec = self.inner.get(api_name).await?;
        self.cache
            .write()
            .unwrap()
            .insert(api_name.to_owned(), spec.clone());
        Ok(spec)
    }

    async fn upsert(&self, spec: ApiSpec) -> Result<()> {
        self.inner.upsert(spec.clone()).await?;
        self.cache
            .write()
            .unwrap()
            .insert(spec.api_name.clone(), spec);
        Ok(())
    }

    async fn list_by_publisher(&self, publisher: &str) -> Result<Vec<ApiSpec>> {
        self.inner.list_by_publisher(publisher).await
    }

    async fn list_all(&self) -> Result<Vec<ApiSpec>> {
        self.inner.list_all().await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[actix_rt::test]
    async fn test_cache_populated_on_get() {
        let mock = MockSpecStore::default();
        mock.upsert(ApiSpec::new("echo", "echo", "gw_echo".to_owned()))
            .await
            .unwrap();
        let cached = CachedSpecStore::new(mock);

        let spec = cached.get("echo").await.unwrap();
        assert_eq!(spec.api_name, "echo");
        // second read must come from the cache, not the (now-untouched) inner store
        assert_eq!(cached.get("echo").await.unwrap().api_name, "echo");
    }

    #[actix_rt::test]
    async fn test_upsert_refreshes_cache() {
        let mock = MockSpecStore::default();
        let cached = CachedSpecStore::new(mock);
        cached
            .upsert(ApiSpec::new("echo", "echo", "gw_echo".to_owned()))
            .await
            .unwrap();
        let mut updated = cached.get("echo").await.unwrap();
        updated.cmd = "echo2".to_owned();
        cached.upsert(updated).await.unwrap();
        assert_eq!(cached.get("echo").await.unwrap().cmd, "echo2");
    }

    #[actix_rt::test]
    async fn test_get_missing_is_not_found() {
        let cached = CachedSpecStore::new(MockSpecStore::default());
        let err = cached.get("nope").await.unwrap_err();
        assert!(matches!(err, SpecStoreError::NotFound(_)));
    }
}
