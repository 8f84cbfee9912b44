//! In-memory spec store double, mirroring the teacher's `MockDb`.
use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{ApiSpec, Result, SpecStore, SpecStoreError};

#[derive(Default)]
pub struct MockSpecStore {
    specs: RwLock<HashMap<String, ApiSpec>>,
}

#[async_trait]
impl SpecStore for MockSpecStore {
    async fn get(&self, api_name: &str) -> Result<ApiSpec> {
        self.specs
            .read()
            .unwrap()
            .get(api_name)
            .cloned()
            .ok_or_else(|| SpecStoreError::NotFound(api_name.to_owned()))
    }

    async fn upsert(&self, spec: ApiSpec) -> Result<()> {
        self.specs
            .write()
            .unwrap()
            .insert(spec.api_name.clone(), spec);
        Ok(())
    }

    async fn list_by_publisher(&self, publisher: &str) -> Result<Vec<ApiSpec>> {
        Ok(self
            .specs
            .read()
            .unwrap()
            .values()
            .filter(|s| s.publisher.as_deref() == Some(publisher))
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<ApiSpec>> {
        Ok(self.specs.read().unwrap().values().cloned().collect())
    }
}
