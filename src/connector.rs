//! Connector Pool: the `send_recv` primitive the HTTP front-end uses to
//! talk to a worker pool through its queue, grounded on the original's
//! `APIConnector`.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout as tokio_timeout;

use crate::queue::{Frame, Queue, QueueError, QueueRegistry};
use crate::spec_store::SpecStore;

/// Reserved command that instructs a worker to exit voluntarily.
pub const CMD_TERMINATE: &str = ":terminate";

/// At most this many healthy, idle connectors are cached per API; a
/// released connector beyond this count, or one that ever errored, is
/// discarded rather than pooled.
pub const MAX_CONNS: usize = 2;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("{}", _0)]
    Queue(#[from] QueueError),

    #[error("request to {0:?} timed out")]
    Timeout(String),

    #[error("worker reply channel for {0:?} closed without a response")]
    Closed(String),
}

/// Wire request sent to a worker: `{"cmd": ..., "args"?: [...], "vargs"?: {...}}`.
/// Empty `args`/`vargs` are omitted entirely rather than serialized as
/// empty collections, matching the original's `make_req`; `Deserialize`
/// mirrors that with `#[serde(default)]` so an absent key decodes back
/// to the same empty collection rather than an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub vargs: HashMap<String, Vec<String>>,
}

impl WorkerRequest {
    pub fn new(
        cmd: impl Into<String>,
        args: Vec<String>,
        vargs: HashMap<String, Vec<String>>,
    ) -> Self {
        Self {
            cmd: cmd.into(),
            args,
            vargs,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // `arbitrary_precision` numbers never appear here, so this can't fail.
        serde_json::to_vec(self).expect("WorkerRequest always serializes")
    }

    /// Inverse of `to_bytes`: parse a wire request body. Not used by the
    /// dispatch path (the worker-side protocol is out of scope per
    /// spec.md's Non-goals), but keeps the round-trip law testable and
    /// gives test doubles a way to decode what `send_recv` put on the wire.
    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// One leased client handle bound to a queue's ingress. `has_errors` is
/// sticky: once true the connector is never returned to the pool, as
/// the original's `_release` checks before appending back to the
/// per-API cache.
struct Connector {
    has_errors: bool,
}

impl Connector {
    fn new() -> Self {
        Self { has_errors: false }
    }
}

/// Per-API cache of idle, healthy connectors, capped at `MAX_CONNS`.
#[derive(Default)]
struct ApiPool {
    idle: Vec<Connector>,
}

/// The process-global Connector Pool: one idle cache per `api_name`,
/// backed by the shared `QueueRegistry` for dispatch.
pub struct ConnectorPool {
    pools: Mutex<HashMap<String, ApiPool>>,
    queues: Arc<QueueRegistry>,
}

impl ConnectorPool {
    pub fn new(queues: Arc<QueueRegistry>) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            queues,
        }
    }

    async fn lease(&self, api_name: &str) -> Connector {
        let mut pools = self.pools.lock().await;
        let pool = pools.entry(api_name.to_owned()).or_default();
        pool.idle.pop().unwrap_or_else(Connector::new)
    }

    async fn release(&self, api_name: &str, connector: Connector) {
        if connector.has_errors {
            return;
        }
        let mut pools = self.pools.lock().await;
        let pool = pools.entry(api_name.to_owned()).or_default();
        if pool.idle.len() < MAX_CONNS {
            pool.idle.push(connector);
        }
    }

    /// Number of idle, healthy connectors currently cached for `api_name`.
    /// Exposed for tests that assert the pool-size invariant.
    #[cfg(test)]
    async fn idle_count(&self, api_name: &str) -> usize {
        self.pools
            .lock()
            .await
            .get(api_name)
            .map(|p| p.idle.len())
            .unwrap_or(0)
    }

    async fn queue_for(
        &self,
        api_name: &str,
        spec_store: &dyn SpecStore,
    ) -> Result<Arc<Queue>, ConnectorError> {
        Ok(self.queues.get_or_create(api_name, spec_store).await?)
    }

    /// `send_recv(api_name, cmd, args, vargs, timeout?) -> reply bytes`.
    ///
    /// Leases a connector (creating one if the pool has none idle),
    /// dispatches the request through the queue, and awaits exactly one
    /// of a reply or a timeout. The connector is always released or
    /// discarded before this returns, and `num_outstanding` is
    /// incremented at dispatch and decremented on whichever completion
    /// fires, mirroring `APIConnector.send_recv` / `_send_recv`.
    pub async fn send_recv(
        &self,
        api_name: &str,
        cmd: &str,
        args: Vec<String>,
        vargs: HashMap<String, Vec<String>>,
        spec_store: &dyn SpecStore,
        override_timeout: Option<Duration>,
    ) -> Result<Vec<u8>, ConnectorError> {
        let queue = self.queue_for(api_name, spec_store).await?;
        let mut connector = self.lease(api_name).await;

        let effective_timeout =
            override_timeout.unwrap_or_else(|| Duration::from_secs(queue.timeout_secs.max(0) as u64));

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = WorkerRequest::new(cmd, args, vargs);
        let frame = Frame {
            payload: request.to_bytes(),
            reply_to: reply_tx,
        };

        queue.incr_outstanding(1).await;
        if queue.ingress().send(frame).await.is_err() {
            connector.has_errors = true;
            queue.incr_outstanding(-1).await;
            self.release(api_name, connector).await;
            return Err(ConnectorError::Timeout(api_name.to_owned()));
        }

        let result = tokio_timeout(effective_timeout, reply_rx).await;
        queue.incr_outstanding(-1).await;

        match result {
            Ok(Ok(bytes)) => {
                self.release(api_name, connector).await;
                Ok(bytes)
            }
            Ok(Err(_canceled)) => {
                connector.has_errors = true;
                self.release(api_name, connector).await;
                Err(ConnectorError::Closed(api_name.to_owned()))
            }
            Err(_elapsed) => {
                connector.has_errors = true;
                self.release(api_name, connector).await;
                Err(ConnectorError::Timeout(api_name.to_owned()))
            }
        }
    }

    /// Fire-and-forget `:terminate`, still accounted in `num_outstanding`
    /// even though nobody awaits a reply, as the spec requires.
    pub async fn send_terminate(
        &self,
        api_name: &str,
        spec_store: &dyn SpecStore,
    ) -> Result<(), ConnectorError> {
        let queue = self.queue_for(api_name, spec_store).await?;
        let (reply_tx, _reply_rx) = oneshot::channel();
        let request = WorkerRequest::new(CMD_TERMINATE, Vec::new(), HashMap::new());
        let frame = Frame {
            payload: request.to_bytes(),
            reply_to: reply_tx,
        };
        queue.incr_outstanding(1).await;
        let sent = queue.ingress().send(frame).await.is_ok();
        queue.incr_outstanding(-1).await;
        if !sent {
            return Err(ConnectorError::Timeout(api_name.to_owned()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::spec_store::{ApiSpec, MockSpecStore};

    async fn seeded_store(api_name: &str, timeout_secs: i32) -> MockSpecStore {
        let store = MockSpecStore::default();
        let mut spec = ApiSpec::new(api_name, "echo.sh", "gw_echo".to_owned());
        spec.timeout_secs = timeout_secs;
        store.upsert(spec).await.unwrap();
        store
    }

    #[test]
    fn test_worker_request_round_trips_with_args_and_vargs() {
        let mut vargs = HashMap::new();
        vargs.insert("x".to_owned(), vec!["1".to_owned(), "2".to_owned()]);
        let req = WorkerRequest::new("hello", vec!["a".to_owned()], vargs);

        let decoded = WorkerRequest::from_bytes(&req.to_bytes()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_empty_args_and_vargs_normalize_to_absent_on_the_wire() {
        let req = WorkerRequest::new("ping", Vec::new(), HashMap::new());
        let bytes = req.to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(body, serde_json::json!({"cmd": "ping"}));

        let decoded = WorkerRequest::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, req);
        assert!(decoded.args.is_empty());
        assert!(decoded.vargs.is_empty());
    }

    #[test]
    fn test_terminate_command_round_trips() {
        let req = WorkerRequest::new(CMD_TERMINATE, Vec::new(), HashMap::new());
        let decoded = WorkerRequest::from_bytes(&req.to_bytes()).unwrap();
        assert_eq!(decoded.cmd, CMD_TERMINATE);
    }

    #[tokio::test]
    async fn test_timeout_with_no_worker() {
        let store = seeded_store("slow", 1).await;
        let queues = Arc::new(QueueRegistry::new());
        let pool = ConnectorPool::new(Arc::clone(&queues));

        let err = pool
            .send_recv(
                "slow",
                "ping",
                Vec::new(),
                HashMap::new(),
                &store,
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Timeout(_)));

        let queue = queues.get("slow").await.unwrap();
        assert_eq!(queue.num_outstanding(), 0);
    }

    #[tokio::test]
    async fn test_happy_path_worker_echo() {
        let store = seeded_store("echo", 5).await;
        let queues = Arc::new(QueueRegistry::new());
        let pool = ConnectorPool::new(Arc::clone(&queues));

        let queue = queues.get_or_create("echo", &store).await.unwrap();
        let mut egress = queue.take_egress().await.unwrap();
        tokio::spawn(async move {
            if let Some(frame) = egress.recv().await {
                let _ = frame.reply_to.send(frame.payload);
            }
        });

        let mut vargs = HashMap::new();
        vargs.insert("x".to_owned(), vec!["1".to_owned(), "2".to_owned()]);
        let reply = pool
            .send_recv("echo", "hello", Vec::new(), vargs, &store, None)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(body["cmd"], "hello");
        assert_eq!(body["vargs"]["x"][0], "1");
    }

    #[tokio::test]
    async fn test_errored_connector_never_reused() {
        let store = seeded_store("slow", 1).await;
        let queues = Arc::new(QueueRegistry::new());
        let pool = ConnectorPool::new(Arc::clone(&queues));

        let _ = pool
            .send_recv(
                "slow",
                "ping",
                Vec::new(),
                HashMap::new(),
                &store,
                Some(Duration::from_millis(10)),
            )
            .await;
        assert_eq!(pool.idle_count("slow").await, 0);
    }

    #[tokio::test]
    async fn test_idle_pool_caps_at_max_conns() {
        let store = seeded_store("echo", 5).await;
        let queues = Arc::new(QueueRegistry::new());
        let pool = ConnectorPool::new(Arc::clone(&queues));
        let queue = queues.get_or_create("echo", &store).await.unwrap();
        let mut egress = queue.take_egress().await.unwrap();
        tokio::spawn(async move {
            while let Some(frame) = egress.recv().await {
                let _ = frame.reply_to.send(frame.payload);
            }
        });

        for _ in 0..(MAX_CONNS + 3) {
            pool.send_recv("echo", "ping", Vec::new(), HashMap::new(), &store, None)
                .await
                .unwrap();
        }
        assert!(pool.idle_count("echo").await <= MAX_CONNS);
    }
}
