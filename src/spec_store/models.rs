//! The API Spec record and its diesel row representation.
use chrono::Utc;
use diesel::{AsChangeset, Insertable, Queryable};
use serde::{Deserialize, Serialize};

use super::schema::api_specs;

/// A durable record describing one logical API: where its worker
/// containers listen, how requests are routed to them, and who may
/// publish updates to it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiSpec {
    pub api_name: String,
    pub cmd: String,
    pub image_name: String,
    pub endpoint_in: i32,
    pub endpoint_out: i32,
    pub timeout_secs: i32,
    pub methods: Vec<String>,
    pub publisher: Option<String>,
    pub create_time: i64,
}

impl ApiSpec {
    pub const DEFAULT_TIMEOUT_SECS: i32 = 30;

    pub fn new(api_name: impl Into<String>, cmd: impl Into<String>, image_name: String) -> Self {
        Self {
            api_name: api_name.into(),
            cmd: cmd.into(),
            image_name,
            endpoint_in: 0,
            endpoint_out: 0,
            timeout_secs: Self::DEFAULT_TIMEOUT_SECS,
            methods: vec!["GET".to_owned(), "POST".to_owned()],
            publisher: None,
            create_time: Utc::now().timestamp(),
        }
    }
}

#[derive(Queryable, Insertable, AsChangeset)]
#[diesel(table_name = api_specs)]
pub(super) struct ApiSpecRow {
    pub api_name: String,
    pub cmd: String,
    pub image_name: String,
    pub endpoint_in: i32,
    pub endpoint_out: i32,
    pub timeout_secs: i32,
    pub methods: String,
    pub publisher: Option<String>,
    pub create_time: i64,
}

impl From<ApiSpec> for ApiSpecRow {
    fn from(spec: ApiSpec) -> Self {
        Self {
            api_name: spec.api_name,
            cmd: spec.cmd,
            image_name: spec.image_name,
            endpoint_in: spec.endpoint_in,
            endpoint_out: spec.endpoint_out,
            timeout_secs: spec.timeout_secs,
            methods: spec.methods.join(","),
            publisher: spec.publisher,
            create_time: spec.create_time,
        }
    }
}

impl From<ApiSpecRow> for ApiSpec {
    fn from(row: ApiSpecRow) -> Self {
        Self {
            api_name: row.api_name,
            cmd: row.cmd,
            image_name: row.image_name,
            endpoint_in: row.endpoint_in,
            endpoint_out: row.endpoint_out,
            timeout_secs: row.timeout_secs,
            methods: row.methods.split(',').map(str::to_owned).collect(),
            publisher: row.publisher,
            create_time: row.create_time,
        }
    }
}
