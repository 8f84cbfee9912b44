//! Per-API broker queue: an ingress/egress channel pair plus the
//! outstanding-request statistics the Autoscaler reads every cycle.
//!
//! The original bound a `zmq::QUEUE` device between an `XREP` ingress
//! socket and an `XREQ` egress socket so replies found their way back to
//! the client that sent the matching request. `tokio::sync::mpsc` has no
//! notion of a reply envelope, so the `Broker` here keys frames on a
//! correlation id instead and the forwarding task demultiplexes by that
//! id rather than by socket identity.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::spec_store::{ApiSpec, SpecStore, SpecStoreError};

/// Bound applied to both directions of a queue, mirroring the
/// original's `zmq.SNDHWM`/`zmq.RCVHWM` of 20. Backpressure is
/// intentional: a full channel makes `send` wait, which is how slow or
/// absent workers eventually surface as caller-visible timeouts.
pub const BUFFER_SZ: usize = 20;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("{}", _0)]
    SpecStore(#[from] SpecStoreError),

    #[error("queue for {0:?} has no worker connected to receive the request")]
    NoWorker(String),
}

/// One frame in flight on a queue: the serialized request body plus a
/// one-shot channel the forwarding task uses to deliver the worker's
/// reply back to whoever is waiting in `send_recv`.
pub struct Frame {
    pub payload: Vec<u8>,
    pub reply_to: oneshot::Sender<Vec<u8>>,
}

/// A single worker's connection to a queue's egress side: it pulls
/// frames to process and pushes replies back.
pub struct WorkerHandle {
    pub api_name: String,
    pub inbox: mpsc::Receiver<Frame>,
}

/// The per-API broker: an ingress mpsc::Sender fed by the Connector
/// Pool and an egress side workers dequeue from, joined by a forwarding
/// task. The broker does not interpret `Frame::payload`; it only routes
/// it and counts it. The reply itself never travels back through the
/// broker -- `Frame::reply_to` is the envelope, and whoever dequeues the
/// frame on the egress side answers the caller directly through it.
pub struct Queue {
    api_name: String,
    ingress_tx: mpsc::Sender<Frame>,
    egress_rx: Mutex<Option<mpsc::Receiver<Frame>>>,
    pub timeout_secs: i32,
    num_outstanding: AtomicU64,
    mean_outstanding: Mutex<f64>,
}

impl Queue {
    /// Resolve `api_name`'s spec and bind a fresh ingress/egress pair.
    /// Fails if no spec is registered, matching the original's
    /// `APIQueue.__init__` which looks the spec up before binding any
    /// sockets.
    pub async fn new(api_name: &str, spec_store: &dyn SpecStore) -> Result<Self, QueueError> {
        let spec = spec_store.get(api_name).await?;
        Ok(Self::from_spec(&spec))
    }

    fn from_spec(spec: &ApiSpec) -> Self {
        let (ingress_tx, mut ingress_rx) = mpsc::channel::<Frame>(BUFFER_SZ);
        let (egress_tx, egress_rx) = mpsc::channel(BUFFER_SZ);

        // The forwarding task: moves frames ingress -> egress, preserving
        // the reply envelope untouched. This is the only place true
        // concurrency lives in a queue; everything else is request/reply
        // bookkeeping on the caller's own task.
        tokio::spawn(async move {
            while let Some(frame) = ingress_rx.recv().await {
                if egress_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        Self {
            api_name: spec.api_name.clone(),
            ingress_tx,
            egress_rx: Mutex::new(Some(egress_rx)),
            timeout_secs: spec.timeout_secs,
            num_outstanding: AtomicU64::new(0),
            mean_outstanding: Mutex::new(0.0),
        }
    }

    pub fn api_name(&self) -> &str {
        &self.api_name
    }

    /// Ingress side the Connector Pool dispatches requests on.
    pub fn ingress(&self) -> mpsc::Sender<Frame> {
        self.ingress_tx.clone()
    }

    /// Take the egress receiver once, handing it to whichever worker
    /// connects first; subsequent callers get `None` until it's
    /// returned (there is no "return" path modeled here -- a worker
    /// disconnecting simply drops its `WorkerHandle`, at which point a
    /// fresh queue would need to be created for a new worker to attach;
    /// the registry only reconnects workers through new containers, not
    /// through a previously-bound queue).
    pub async fn take_egress(&self) -> Option<mpsc::Receiver<Frame>> {
        self.egress_rx.lock().await.take()
    }

    pub fn num_outstanding(&self) -> u64 {
        self.num_outstanding.load(Ordering::SeqCst)
    }

    pub async fn mean_outstanding(&self) -> f64 {
        *self.mean_outstanding.lock().await
    }

    /// `incr_outstanding(delta)`: `num_outstanding += delta`, then
    /// `mean ← (mean + num_outstanding) / 2`, exactly as the original's
    /// `APIQueue.incr_outstanding`. `delta` may be negative.
    pub async fn incr_outstanding(&self, delta: i64) {
        let updated = if delta >= 0 {
            self.num_outstanding.fetch_add(delta as u64, Ordering::SeqCst) + delta as u64
        } else {
            self.num_outstanding
                .fetch_sub((-delta) as u64, Ordering::SeqCst)
                - (-delta) as u64
        };
        let mut mean = self.mean_outstanding.lock().await;
        *mean = (*mean + updated as f64) / 2.0;
    }
}

/// Process-global table of live queues, one per `api_name` that has
/// seen at least one request or maintenance cycle since startup.
#[derive(Default)]
pub struct QueueRegistry {
    queues: Mutex<HashMap<String, Arc<Queue>>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `get_queue(api_name, alloc=true)`: return the existing queue, or
    /// allocate one from the spec store if none exists yet.
    pub async fn get_or_create(
        &self,
        api_name: &str,
        spec_store: &dyn SpecStore,
    ) -> Result<Arc<Queue>, QueueError> {
        if let Some(queue) = self.queues.lock().await.get(api_name) {
            return Ok(Arc::clone(queue));
        }
        let queue = Arc::new(Queue::new(api_name, spec_store).await?);
        self.queues
            .lock()
            .await
            .insert(api_name.to_owned(), Arc::clone(&queue));
        Ok(queue)
    }

    /// `get_queue(api_name, alloc=false)`: look up without allocating.
    pub async fn get(&self, api_name: &str) -> Option<Arc<Queue>> {
        self.queues.lock().await.get(api_name).cloned()
    }

    /// Drop a queue whose spec no longer exists, so the next maintenance
    /// cycle sees it as gone and drains it to zero.
    pub async fn release(&self, api_name: &str) {
        self.queues.lock().await.remove(api_name);
    }

    pub async fn api_names(&self) -> Vec<String> {
        self.queues.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::spec_store::MockSpecStore;

    async fn seeded_store(api_name: &str) -> MockSpecStore {
        let store = MockSpecStore::default();
        store
            .upsert(ApiSpec::new(api_name, "echo.sh", "gw_echo".to_owned()))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_incr_outstanding_updates_mean() {
        let store = seeded_store("echo").await;
        let queue = Queue::new("echo", &store).await.unwrap();
        assert_eq!(queue.mean_outstanding().await, 0.0);

        queue.incr_outstanding(1).await;
        assert_eq!(queue.num_outstanding(), 1);
        assert_eq!(queue.mean_outstanding().await, 0.5);

        queue.incr_outstanding(-1).await;
        assert_eq!(queue.num_outstanding(), 0);
        assert_eq!(queue.mean_outstanding().await, 0.25);
    }

    #[tokio::test]
    async fn test_idle_decay_toward_zero() {
        let store = seeded_store("echo").await;
        let queue = Queue::new("echo", &store).await.unwrap();
        queue.incr_outstanding(4).await;
        for _ in 0..20 {
            queue.incr_outstanding(0).await;
        }
        assert!(queue.mean_outstanding().await < 0.01);
    }

    #[tokio::test]
    async fn test_registry_allocates_once() {
        let store = seeded_store("echo").await;
        let registry = QueueRegistry::new();
        let a = registry.get_or_create("echo", &store).await.unwrap();
        let b = registry.get_or_create("echo", &store).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_get_without_alloc_is_none() {
        let registry = QueueRegistry::new();
        assert!(registry.get("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_release_drops_queue() {
        let store = seeded_store("echo").await;
        let registry = QueueRegistry::new();
        registry.get_or_create("echo", &store).await.unwrap();
        registry.release("echo").await;
        assert!(registry.get("echo").await.is_none());
    }
}
