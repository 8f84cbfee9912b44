//! Request-scoped metrics handle, backed by a process-wide `StatsdClient`.
use std::collections::HashMap;
use std::net::UdpSocket;
use std::time::Instant;

use actix_web::{dev::Payload, web::Data, FromRequest, HttpRequest};
use cadence::{
    BufferedUdpMetricSink, Counted, Gauged, Metric, NopMetricSink, QueuingMetricSink, StatsdClient,
    Timed,
};
use futures::future::{self, Ready};
use slog::{Key, Record, KV};

use crate::error::ApiError;
use crate::server::ServerState;

#[derive(Debug, Clone)]
pub struct MetricTimer {
    pub label: String,
    pub start: Instant,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Default, Clone)]
pub struct Metrics {
    pub client: Option<StatsdClient>,
    pub tags: HashMap<String, String>,
    pub timer: Option<MetricTimer>,
}

impl Drop for Metrics {
    fn drop(&mut self) {
        if let (Some(client), Some(timer)) = (self.client.as_ref(), self.timer.as_ref()) {
            let lapse = (Instant::now() - timer.start).as_millis() as u64;
            let mut tagged = client.time_with_tags(&timer.label, lapse);
            for (key, val) in &timer.tags {
                tagged = tagged.with_tag(key, val);
            }
            if let Err(e) = tagged.try_send() {
                warn!("Metric {} error: {:?}", &timer.label, e);
            }
        }
    }
}

impl FromRequest for Metrics {
    type Error = ();
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let client = req
            .app_data::<Data<ServerState>>()
            .map(|state| state.metrics.clone());

        if client.is_none() {
            warn!("metric error: no app state");
        }

        future::ok(Metrics {
            client,
            tags: HashMap::default(),
            timer: None,
        })
    }
}

impl From<&StatsdClient> for Metrics {
    fn from(client: &StatsdClient) -> Self {
        Metrics {
            client: Some(client.clone()),
            tags: HashMap::default(),
            timer: None,
        }
    }
}

impl Metrics {
    pub fn noop() -> Self {
        Self {
            client: Some(StatsdClient::builder("", NopMetricSink).build()),
            tags: HashMap::default(),
            timer: None,
        }
    }

    pub fn start_timer(&mut self, label: &str, tags: Option<HashMap<String, String>>) {
        let mut mtags = self.tags.clone();
        if let Some(t) = tags {
            mtags.extend(t);
        }
        self.timer = Some(MetricTimer {
            label: label.to_owned(),
            start: Instant::now(),
            tags: mtags,
        });
    }

    pub fn incr(&self, label: &str) {
        self.count(label, 1)
    }

    pub fn incr_with_tag(&self, label: &str, key: &str, value: &str) {
        let mut tags = HashMap::default();
        tags.insert(key.to_owned(), value.to_owned());
        self.count_with_tags(label, 1, tags);
    }

    pub fn count(&self, label: &str, count: i64) {
        self.count_with_tags(label, count, HashMap::default());
    }

    pub fn count_with_tags(&self, label: &str, count: i64, tags: HashMap<String, String>) {
        if let Some(client) = self.client.as_ref() {
            let mut tagged = client.count_with_tags(label, count);
            let mut mtags = self.tags.clone();
            mtags.extend(tags);
            for (key, val) in &mtags {
                tagged = tagged.with_tag(key, val);
            }
            match tagged.try_send() {
                Err(e) => warn!("Metric {} error: {:?}", label, e; MetricTags(mtags)),
                Ok(_) => trace!("counted {}", label),
            }
        }
    }

    pub fn gauge(&self, label: &str, value: u64) {
        if let Some(client) = self.client.as_ref() {
            if let Err(e) = client.gauge(label, value) {
                warn!("Metric {} error: {:?}", label, e);
            }
        }
    }
}

pub fn metrics_from_opts(
    label: &str,
    host: Option<&str>,
    port: u16,
) -> Result<StatsdClient, ApiError> {
    let builder = if let Some(statsd_host) = host {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;

        let host = (statsd_host, port);
        let udp_sink = BufferedUdpMetricSink::from(host, socket)?;
        let sink = QueuingMetricSink::from(udp_sink);
        StatsdClient::builder(label, sink)
    } else {
        StatsdClient::builder(label, NopMetricSink)
    };
    Ok(builder
        .with_error_handler(|err| warn!("Metric send error: {:?}", err))
        .build())
}

/// Newtype solely to let us implement `slog::KV` for a tag map.
struct MetricTags(HashMap<String, String>);

impl KV for MetricTags {
    fn serialize(&self, _rec: &Record<'_>, serializer: &mut dyn slog::Serializer) -> slog::Result {
        for (key, val) in &self.0 {
            serializer.emit_str(Key::from(key.clone()), val)?;
        }
        Ok(())
    }
}
