use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpecStoreError {
    #[error("no api spec registered for {0:?}")]
    NotFound(String),

    #[error("spec store backend error: {0}")]
    Backend(String),
}

impl From<diesel::result::Error> for SpecStoreError {
    fn from(e: diesel::result::Error) -> Self {
        SpecStoreError::Backend(e.to_string())
    }
}

impl From<diesel::r2d2::PoolError> for SpecStoreError {
    fn from(e: diesel::r2d2::PoolError) -> Self {
        SpecStoreError::Backend(e.to_string())
    }
}

impl From<diesel_migrations::MigrationError> for SpecStoreError {
    fn from(e: diesel_migrations::MigrationError) -> Self {
        SpecStoreError::Backend(e.to_string())
    }
}
