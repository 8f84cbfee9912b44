//! Error types and macros.
use std::convert::From;
use std::error::Error;
use std::fmt;

use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use backtrace::Backtrace;
use serde::{
    ser::{SerializeMap, Serializer},
    Serialize,
};
use thiserror::Error;

use crate::connector::ConnectorError;
use crate::jobbus::JobBusError;
use crate::registry::DriverError;
use crate::spec_store::SpecStoreError;

/// Common `Result` type.
pub type ApiResult<T> = Result<T, ApiError>;

/// Top-level error type returned to HTTP callers and logged internally.
#[derive(Debug)]
pub struct ApiError {
    kind: ApiErrorKind,
    pub(crate) backtrace: Box<Backtrace>,
    status: StatusCode,
}

/// Top-level error kind. Each variant corresponds to one of the error
/// kinds enumerated in the design ("Not-found", "Validation", "Timeout",
/// "Transport", "Signature", "Driver fault").
#[derive(Error, Debug)]
pub enum ApiErrorKind {
    #[error("{}", _0)]
    SpecStore(SpecStoreError),

    #[error("{}", _0)]
    Connector(ConnectorError),

    #[error("{}", _0)]
    Driver(DriverError),

    #[error("{}", _0)]
    JobBus(JobBusError),

    #[error("request timed out")]
    Timeout,

    #[error("validation error: {}", _0)]
    Validation(String),

    #[error("malformed request uri")]
    MalformedUri,

    #[error("{}", _0)]
    Internal(String),
}

impl ApiErrorKind {
    pub fn metric_label(&self) -> Option<String> {
        match self {
            ApiErrorKind::Timeout => Some("request.timeout".to_owned()),
            ApiErrorKind::SpecStore(_) => Some("spec_store.error".to_owned()),
            ApiErrorKind::Driver(_) => Some("driver.error".to_owned()),
            _ => None,
        }
    }
}

impl ApiError {
    pub fn kind(&self) -> &ApiErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn is_sentry_event(&self) -> bool {
        self.status.is_server_error() && self.kind.metric_label().is_none()
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            &self.kind,
            ApiErrorKind::SpecStore(SpecStoreError::NotFound(_))
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(&self.kind, ApiErrorKind::Timeout)
    }
}

impl Error for ApiError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.kind.source()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, formatter)
    }
}

impl From<ApiErrorKind> for ApiError {
    fn from(kind: ApiErrorKind) -> Self {
        let status = match &kind {
            ApiErrorKind::SpecStore(SpecStoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiErrorKind::SpecStore(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorKind::Connector(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorKind::Driver(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorKind::JobBus(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorKind::Timeout => StatusCode::REQUEST_TIMEOUT,
            ApiErrorKind::Validation(_) => StatusCode::BAD_REQUEST,
            ApiErrorKind::MalformedUri => StatusCode::NOT_FOUND,
            ApiErrorKind::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        Self {
            kind,
            backtrace: Box::new(Backtrace::new()),
            status,
        }
    }
}

macro_rules! from_error {
    ($from:ty, $to_kind:expr) => {
        impl From<$from> for ApiError {
            fn from(inner: $from) -> ApiError {
                $to_kind(inner).into()
            }
        }
    };
}

from_error!(SpecStoreError, ApiErrorKind::SpecStore);
from_error!(ConnectorError, ApiErrorKind::Connector);
from_error!(DriverError, ApiErrorKind::Driver);
from_error!(JobBusError, ApiErrorKind::JobBus);

impl From<std::io::Error> for ApiError {
    fn from(inner: std::io::Error) -> Self {
        ApiErrorKind::Internal(inner.to_string()).into()
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        self.status
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status).json(self)
    }
}

impl Serialize for ApiError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("status", &self.status.as_u16())?;
        map.serialize_entry("reason", &self.kind.to_string())?;
        map.end()
    }
}
