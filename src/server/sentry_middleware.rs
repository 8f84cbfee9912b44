//! Reports server errors (`ApiError::is_sentry_event() == true`) to Sentry
//! with a backtrace, mirroring `syncserver-common/src/middleware/sentry.rs`
//! trimmed down to this crate's single error type -- there is no
//! `ReportableError`-over-many-error-types indirection here because the
//! whole app funnels through one `ApiError`.
use std::cell::RefCell;
use std::rc::Rc;

use actix_web::dev::{Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::Error;
use futures::future::{self, LocalBoxFuture, Ready};
use sentry::protocol::{Event, Exception, Level};

use crate::error::ApiError;

#[derive(Default)]
pub struct SentryWrapper;

impl<S, B> Transform<S, ServiceRequest> for SentryWrapper
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = SentryWrapperMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        future::ok(SentryWrapperMiddleware {
            service: Rc::new(RefCell::new(service)),
        })
    }
}

pub struct SentryWrapperMiddleware<S> {
    service: Rc<RefCell<S>>,
}

impl<S, B> Service<ServiceRequest> for SentryWrapperMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    actix_web::dev::forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let fut = self.service.call(req);
        Box::pin(async move {
            let response = fut.await?;
            if let Some(error) = response.response().error() {
                if let Some(api_error) = error.as_error::<ApiError>() {
                    if api_error.is_sentry_event() {
                        let event_id = sentry::Hub::current().capture_event(event_from_api_error(api_error));
                        trace!("Reported {} to Sentry as {}", api_error, event_id);
                    }
                }
            }
            Ok(response)
        })
    }
}

/// Build a Sentry event for one `ApiError`, attaching a parsed stacktrace
/// from its captured `backtrace::Backtrace` the way the teacher's
/// `exception_from_reportable_error` does.
fn event_from_api_error(err: &ApiError) -> Event<'static> {
    let debug = format!("{:?}", err.kind());
    Event {
        exception: vec![Exception {
            ty: sentry::parse_type_from_debug(&debug).to_owned(),
            value: Some(err.to_string()),
            stacktrace: sentry_backtrace::backtrace_to_stacktrace(err.backtrace()),
            ..Default::default()
        }]
        .into(),
        level: Level::Error,
        ..Default::default()
    }
}
