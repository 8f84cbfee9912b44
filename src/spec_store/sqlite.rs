//! `diesel` + `r2d2`-backed spec store, mirroring the pooling shape of
//! the teacher's `db/mysql/pool.rs` adapted to an embedded SQLite file.
use actix_web::web::block;
use async_trait::async_trait;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use super::models::ApiSpecRow;
use super::schema::api_specs::dsl::*;
use super::{ApiSpec, Result, SpecStore, SpecStoreError};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/spec_store");

#[derive(Clone)]
pub struct SqliteSpecStore {
    pool: Pool<ConnectionManager<SqliteConnection>>,
}

impl SqliteSpecStore {
    pub fn new(database_url: &str, max_size: u32) -> Result<Self> {
        let manager = ConnectionManager::<SqliteConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(max_size)
            .build(manager)
            .map_err(|e| SpecStoreError::Backend(e.to_string()))?;
        pool.get()
            .map_err(|e| SpecStoreError::Backend(e.to_string()))?
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| SpecStoreError::Backend(e.to_string()))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl SpecStore for SqliteSpecStore {
    async fn get(&self, api_name_arg: &str) -> Result<ApiSpec> {
        let pool = self.pool.clone();
        let name = api_name_arg.to_owned();
        block(move || {
            let mut conn = pool.get()?;
            api_specs
                .filter(api_name.eq(&name))
                .first::<ApiSpecRow>(&mut conn)
                .optional()?
                .map(ApiSpec::from)
                .ok_or(SpecStoreError::NotFound(name))
        })
        .await
        .map_err(|e| SpecStoreError::Backend(e.to_string()))?
    }

    async fn upsert(&self, spec: ApiSpec) -> Result<()> {
        let pool = self.pool.clone();
        let row = ApiSpecRow::from(spec);
        block(move || {
            let mut conn = pool.get()?;
            diesel::replace_into(api_specs)
                .values(&row)
                .execute(&mut conn)?;
            Ok::<(), SpecStoreError>(())
        })
        .await
        .map_err(|e| SpecStoreError::Backend(e.to_string()))?
    }

    async fn list_by_publisher(&self, publisher_arg: &str) -> Result<Vec<ApiSpec>> {
        let pool = self.pool.clone();
        let who = publisher_arg.to_owned();
        block(move || {
            let mut conn = pool.get()?;
            let rows = api_specs
                .filter(publisher.eq(&who))
                .load::<ApiSpecRow>(&mut conn)?;
            Ok::<Vec<ApiSpec>, SpecStoreError>(rows.into_iter().map(ApiSpec::from).collect())
        })
        .await
        .map_err(|e| SpecStoreError::Backend(e.to_string()))?
    }

    async fn list_all(&self) -> Result<Vec<ApiSpec>> {
        let pool = self.pool.clone();
        block(move || {
            let mut conn = pool.get()?;
            let rows = api_specs.load::<ApiSpecRow>(&mut conn)?;
            Ok::<Vec<ApiSpec>, SpecStoreError>(rows.into_iter().map(ApiSpec::from).collect())
        })
        .await
        .map_err(|e| SpecStoreError::Backend(e.to_string()))?
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_store() -> SqliteSpecStore {
        SqliteSpecStore::new(":memory:", 1).expect("migrations should apply cleanly")
    }

    #[actix_rt::test]
    async fn test_upsert_then_get() {
        let store = test_store();
        let spec = ApiSpec::new("echo", "echo.sh", "gw_echo".to_owned());
        store.upsert(spec.clone()).await.unwrap();
        let got = store.get("echo").await.unwrap();
        assert_eq!(got.cmd, "echo.sh");
    }

    #[actix_rt::test]
    async fn test_missing_is_not_found() {
        let store = test_store();
        let err = store.get("missing").await.unwrap_err();
        assert!(matches!(err, SpecStoreError::NotFound(_)));
    }

    #[actix_rt::test]
    async fn test_upsert_is_idempotent_replace() {
        let store = test_store();
        let mut spec = ApiSpec::new("echo", "echo.sh", "gw_echo".to_owned());
        store.upsert(spec.clone()).await.unwrap();
        spec.cmd = "echo2.sh".to_owned();
        store.upsert(spec).await.unwrap();
        assert_eq!(store.get("echo").await.unwrap().cmd, "echo2.sh");
    }

    /// `:memory:` above exercises the happy path, but a file-backed
    /// database is what actually runs in production -- this confirms
    /// migrations apply and the pool survives a real file path, not just
    /// sqlite's special in-memory handle.
    #[actix_rt::test]
    async fn test_file_backed_database_applies_migrations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("apigateway.db");
        let store = SqliteSpecStore::new(path.to_str().unwrap(), 1).unwrap();
        store
            .upsert(ApiSpec::new("echo", "echo.sh", "gw_echo".to_owned()))
            .await
            .unwrap();
        assert_eq!(store.get("echo").await.unwrap().cmd, "echo.sh");
    }
}
