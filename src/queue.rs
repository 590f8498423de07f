//! Request queue core: admission, dispatch, execution, and shutdown.
//!
//! One dispatcher task draws from the scheduler, reserves backend capacity,
//! and spawns an execution task per request. Responses travel back to the
//! submitting caller over a per-request oneshot channel; telemetry records
//! are handed to a background worker and never block the caller.

use crate::config::QueueConfig;
use crate::controller::RequestController;
use crate::limiter::{UserRateLimitStore, UserRateLimiter};
use crate::resources::ResourceChecker;
use crate::scheduler::{ScheduledRequest, Scheduler};
use crate::telemetry::{TelemetryRecord, TelemetryStore, now_ms};
use crate::types::{ModelPreferences, QueueError, Reservation};
use dashmap::DashMap;
use metrics::{counter, gauge, histogram};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long the dispatcher sleeps when no head can be served. Quarantine
/// expiry and window aging are observed on the next tick at the latest.
const DISPATCH_TICK: Duration = Duration::from_millis(50);

const TELEMETRY_BUFFER: usize = 1024;
const TELEMETRY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Snapshot of live request counts per stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDepths {
    pub new: usize,
    pub waiting: usize,
    pub in_flight: usize,
}

struct QueueInner {
    scheduler: Scheduler,
    resources: ResourceChecker,
    rate_limiter: UserRateLimiter,
    controllers: HashMap<String, Arc<dyn RequestController>>,
    telemetry_store: Arc<dyn TelemetryStore>,
    rate_limit_store: Arc<dyn UserRateLimitStore>,
    /// Response channel per live request, keyed by `req_id`.
    replies: DashMap<u64, oneshot::Sender<Result<serde_json::Value, QueueError>>>,
    telemetry_tx: Mutex<Option<mpsc::Sender<TelemetryRecord>>>,
    /// Wakes the dispatcher: new submission, finished request, freed slot.
    work_available: Notify,
    /// Wakes shutdown when live work completes.
    idle: Notify,
    next_req_id: AtomicU64,
    accepting: AtomicBool,
    running: AtomicBool,
    ttl: Duration,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    telemetry_worker: Mutex<Option<JoinHandle<()>>>,
}

/// The request queue: admits submissions under per-user limits, schedules
/// them FIFO under back-pressure, balances across backend deployments, and
/// sinks one telemetry record per request.
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

impl Clone for RequestQueue {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl RequestQueue {
    pub fn new(
        config: QueueConfig,
        controllers: HashMap<String, Arc<dyn RequestController>>,
        telemetry_store: Arc<dyn TelemetryStore>,
        rate_limit_store: Arc<dyn UserRateLimitStore>,
    ) -> Self {
        config.validate();

        let rate_limiter = UserRateLimiter::new(
            Arc::clone(&rate_limit_store),
            config.user_limits.max_requests_in_window,
            config.user_limits.window_seconds,
        );

        Self {
            inner: Arc::new(QueueInner {
                scheduler: Scheduler::new(config.scheduler_limits.max_queue_size),
                resources: ResourceChecker::new(&config.llm_deployments),
                rate_limiter,
                controllers,
                telemetry_store,
                rate_limit_store,
                replies: DashMap::new(),
                telemetry_tx: Mutex::new(None),
                work_available: Notify::new(),
                idle: Notify::new(),
                next_req_id: AtomicU64::new(1),
                accepting: AtomicBool::new(false),
                running: AtomicBool::new(false),
                ttl: Duration::from_secs_f64(config.scheduler_limits.ttl_seconds.max(0.0)),
                dispatcher: Mutex::new(None),
                telemetry_worker: Mutex::new(None),
            }),
        }
    }

    /// Connect both store adapters and spawn the dispatcher and telemetry
    /// worker. Store failures here are fatal.
    pub async fn initiate(&self) -> Result<(), QueueError> {
        self.inner.telemetry_store.connect().await?;
        self.inner.rate_limit_store.connect().await?;

        let (tx, mut rx) = mpsc::channel::<TelemetryRecord>(TELEMETRY_BUFFER);
        *self.inner.telemetry_tx.lock().unwrap() = Some(tx);

        let store = Arc::clone(&self.inner.telemetry_store);
        let worker = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(e) = store.insert(&record).await {
                    counter!("llmq_telemetry_failures_total").increment(1);
                    warn!(error = %e, "Telemetry insert failed");
                }
            }
        });
        *self.inner.telemetry_worker.lock().unwrap() = Some(worker);

        self.inner.running.store(true, Ordering::SeqCst);
        self.inner.accepting.store(true, Ordering::SeqCst);
        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&self.inner)));
        *self.inner.dispatcher.lock().unwrap() = Some(dispatcher);

        info!("Request queue started");
        Ok(())
    }

    /// Submit one request and wait for its response or a classified failure.
    ///
    /// The wait is bounded by the configured TTL; on expiry the request is
    /// cancelled if still queued, and an execution already under way is left
    /// to finish for accounting.
    pub async fn submit(
        &self,
        req_type: &str,
        user_id: &str,
        payload: serde_json::Value,
        preferences: ModelPreferences,
    ) -> Result<serde_json::Value, QueueError> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }
        if user_id.is_empty() {
            return Err(QueueError::UserIdMissing);
        }
        if !self.inner.controllers.contains_key(req_type) {
            counter!("llmq_rejected_total", "reason" => "unknown_type").increment(1);
            return Err(QueueError::UnknownRequestType(req_type.to_string()));
        }
        if let Err(e) = self.inner.resources.can_admit(&preferences) {
            counter!("llmq_rejected_total", "reason" => "resource").increment(1);
            return Err(e);
        }

        let admission = self.inner.rate_limiter.check(user_id).await?;
        if !admission.admitted {
            counter!("llmq_rejected_total", "reason" => "rate_limited").increment(1);
            debug!(user_id = %user_id, "User over rate limit");
            return Err(QueueError::RateLimited {
                retry_after: admission
                    .retry_after_seconds
                    .unwrap_or_else(|| self.inner.rate_limiter.window_seconds()),
            });
        }

        let req_id = self.inner.next_req_id.fetch_add(1, Ordering::SeqCst);
        let mut telemetry = TelemetryRecord::new(req_id, user_id, req_type, &payload);
        telemetry.request_queued_at = now_ms();
        let request = ScheduledRequest {
            req_id,
            req_type: req_type.to_string(),
            payload,
            preferences,
            telemetry,
            deadline: Instant::now() + self.inner.ttl,
        };

        let (tx, rx) = oneshot::channel();
        self.inner.replies.insert(req_id, tx);

        if self.inner.scheduler.offer_new(request).is_err() {
            self.inner.replies.remove(&req_id);
            counter!("llmq_rejected_total", "reason" => "queue_full").increment(1);
            return Err(QueueError::QueueFull);
        }

        counter!("llmq_requests_total").increment(1);
        self.inner.update_depth_metrics();
        self.inner.work_available.notify_one();

        match tokio::time::timeout(self.inner.ttl, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(QueueError::Internal("response channel closed".into())),
            Err(_) => {
                self.inner.replies.remove(&req_id);
                if let Some(request) = self.inner.scheduler.cancel(req_id) {
                    let mut record = request.telemetry;
                    record.mark_timeout();
                    self.inner.sink(record);
                    self.inner.update_depth_metrics();
                    self.inner.work_available.notify_one();
                }
                warn!(req_id, "Request timed out waiting for a response");
                Err(QueueError::Timeout)
            }
        }
    }

    /// Live request counts per stage.
    pub fn depths(&self) -> QueueDepths {
        let (new, waiting, in_flight) = self.inner.scheduler.depths();
        QueueDepths {
            new,
            waiting,
            in_flight,
        }
    }

    /// Stop accepting submissions, let live work finish within `grace`,
    /// fail whatever never ran, drain telemetry, and close the stores.
    /// Never blocks indefinitely on a misbehaving store adapter.
    pub async fn graceful_shutdown(&self, grace: Duration) {
        info!("Shutting down request queue");
        self.inner.accepting.store(false, Ordering::SeqCst);

        let deadline = Instant::now() + grace;
        while !self.inner.scheduler.is_idle() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::select! {
                _ = self.inner.idle.notified() => {}
                _ = tokio::time::sleep(remaining.min(DISPATCH_TICK)) => {}
            }
        }

        for request in self.inner.scheduler.drain_queued() {
            warn!(req_id = request.req_id, "Request abandoned at shutdown");
            self.inner.fail_queued(request);
        }

        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.work_available.notify_waiters();
        let dispatcher = self.inner.dispatcher.lock().unwrap().take();
        if let Some(handle) = dispatcher
            && tokio::time::timeout(WORKER_STOP_TIMEOUT, handle).await.is_err()
        {
            warn!("Dispatcher did not stop in time");
        }

        // Closing the channel ends the worker once the backlog is written.
        let tx = self.inner.telemetry_tx.lock().unwrap().take();
        drop(tx);
        let worker = self.inner.telemetry_worker.lock().unwrap().take();
        if let Some(handle) = worker
            && tokio::time::timeout(TELEMETRY_DRAIN_TIMEOUT, handle).await.is_err()
        {
            warn!("Telemetry drain timed out; some records were lost");
        }

        if let Err(e) = self.inner.telemetry_store.disconnect().await {
            warn!(error = %e, "Telemetry store disconnect failed");
        }
        if let Err(e) = self.inner.rate_limit_store.disconnect().await {
            warn!(error = %e, "Rate limit store disconnect failed");
        }
        info!("Request queue stopped");
    }
}

impl QueueInner {
    /// One dispatch attempt. Waiting requests are preferred, in FIFO order;
    /// a parked request whose specific model is still busy does not block
    /// later waiting entries. The new-queue head is only popped when the
    /// checker says it could be served, so back-pressure keeps it counted.
    fn try_dispatch_one(this: &Arc<Self>) -> bool {
        let (new_head, waiting) = this.scheduler.peek_heads();

        for (req_id, prefs) in waiting {
            if !this.resources.can_serve(&prefs) {
                continue;
            }
            let Some(request) = this.scheduler.take_waiting(req_id) else {
                // Cancelled or expired since the peek.
                continue;
            };
            match this.resources.try_reserve(&request.preferences) {
                Some(reservations) => {
                    Self::spawn_execution(this, request, reservations);
                    this.update_depth_metrics();
                    return true;
                }
                None => {
                    // Capacity vanished between check and reserve; the
                    // request keeps its place at the head of the line.
                    this.scheduler.restore_waiting(request);
                }
            }
        }

        if let Some(prefs) = new_head
            && this.resources.can_serve(&prefs)
            && let Some(request) = this.scheduler.pop_new()
        {
            match this.resources.try_reserve(&request.preferences) {
                Some(reservations) => {
                    Self::spawn_execution(this, request, reservations);
                    this.update_depth_metrics();
                    return true;
                }
                None => {
                    this.scheduler.offer_waiting(request);
                    this.update_depth_metrics();
                    // The head moved queues, which is progress too.
                    return true;
                }
            }
        }

        false
    }

    /// Run the controller for one dispatched request. Every reservation ends
    /// in exactly one `record_usage` or `register_error`.
    fn spawn_execution(
        this: &Arc<Self>,
        mut request: ScheduledRequest,
        reservations: Vec<Reservation>,
    ) {
        request.telemetry.request_dequeued_at = now_ms();
        counter!("llmq_dispatch_total").increment(1);

        let Some(controller) = this.controllers.get(&request.req_type).cloned() else {
            // Admission verified the controller; keep the accounting honest
            // anyway.
            error!(req_type = %request.req_type, "Controller missing after admission");
            this.resources.record_usage(&reservations, &request.telemetry);
            this.scheduler.finish(request.req_id);
            this.deliver(
                request.req_id,
                Err(QueueError::Internal("controller not registered".into())),
            );
            return;
        };

        let inner = Arc::clone(this);
        tokio::spawn(async move {
            let req_id = request.req_id;
            let result = controller
                .process(&request.payload, &reservations, &mut request.telemetry)
                .await;

            match result {
                Ok(response) => {
                    request.telemetry.response_queued_at = now_ms();
                    let delivered = inner.deliver(req_id, Ok(response));
                    request.telemetry.response_dequeued_at = now_ms();
                    if !delivered {
                        // The caller gave up while we were executing.
                        request.telemetry.mark_timeout();
                    }
                    inner.resources.record_usage(&reservations, &request.telemetry);
                }
                Err(e) => {
                    warn!(req_id, error = %e, "Controller reported a backend fault");
                    counter!("llmq_deployment_errors_total").increment(1);
                    inner.resources.register_error(&reservations);
                    request.telemetry.set_error(&e.to_string());
                    inner.deliver(req_id, Err(QueueError::Llm(e.to_string())));
                }
            }

            inner.scheduler.finish(req_id);
            inner.sink(request.telemetry);
            inner.update_depth_metrics();
            inner.work_available.notify_one();
            inner.idle.notify_waiters();
        });
    }

    /// Hand a result to the waiting caller. False when the caller is gone.
    fn deliver(&self, req_id: u64, result: Result<serde_json::Value, QueueError>) -> bool {
        match self.replies.remove(&req_id) {
            Some((_, tx)) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Fail a request that never reached execution (TTL expiry, shutdown).
    fn fail_queued(&self, request: ScheduledRequest) {
        let mut record = request.telemetry;
        record.mark_timeout();
        self.deliver(request.req_id, Err(QueueError::Timeout));
        self.sink(record);
    }

    /// Fire-and-forget telemetry hand-off.
    fn sink(&self, record: TelemetryRecord) {
        if record.request_received_at >= 0 && record.response_dequeued_at >= 0 {
            let elapsed = (record.response_dequeued_at - record.request_received_at).max(0);
            histogram!("llmq_request_duration_seconds").record(elapsed as f64 / 1000.0);
        }

        let tx = self.telemetry_tx.lock().unwrap().clone();
        match tx {
            Some(tx) => {
                if tx.try_send(record).is_err() {
                    counter!("llmq_telemetry_failures_total").increment(1);
                    warn!("Telemetry channel closed or full; dropping record");
                }
            }
            None => debug!("Telemetry pipeline not running; dropping record"),
        }
    }

    fn update_depth_metrics(&self) {
        let (new, waiting, in_flight) = self.scheduler.depths();
        gauge!("llmq_queue_depth", "stage" => "new").set(new as f64);
        gauge!("llmq_queue_depth", "stage" => "waiting").set(waiting as f64);
        gauge!("llmq_queue_depth", "stage" => "in_flight").set(in_flight as f64);
    }
}

/// The single long-running dispatch task.
async fn dispatch_loop(inner: Arc<QueueInner>) {
    info!("Dispatch loop started");
    while inner.running.load(Ordering::SeqCst) {
        for request in inner.scheduler.take_expired(Instant::now()) {
            warn!(req_id = request.req_id, "Request expired before dispatch");
            inner.fail_queued(request);
            inner.idle.notify_waiters();
        }

        if inner.scheduler.has_work() && QueueInner::try_dispatch_one(&inner) {
            continue;
        }

        tokio::select! {
            _ = inner.work_available.notified() => {}
            _ = tokio::time::sleep(DISPATCH_TICK) => {}
        }
    }
    info!("Dispatch loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{ControllerError, RequestController};
    use crate::limiter::MemoryRateLimitStore;
    use crate::telemetry::CsvTelemetryStore;
    use async_trait::async_trait;

    struct EchoController;

    #[async_trait]
    impl RequestController for EchoController {
        async fn process(
            &self,
            payload: &serde_json::Value,
            reserved: &[Reservation],
            telemetry: &mut TelemetryRecord,
        ) -> Result<serde_json::Value, ControllerError> {
            telemetry.deployment_name = reserved[0].deployment_id.clone();
            telemetry.prompt_tokens = 10;
            telemetry.completion_tokens = 5;
            Ok(payload.clone())
        }
    }

    fn test_config() -> QueueConfig {
        serde_json::from_value(serde_json::json!({
            "llm_deployments": [{
                "id": "llm-a",
                "output_kind": "chat",
                "reqs_per_min": 60,
                "tokens_per_min": 60_000,
                "error_backoff_seconds": 1.0,
            }],
            "user_limits": { "max_requests_in_window": 100, "window_seconds": 10.0 },
            "scheduler_limits": { "ttl_seconds": 5.0, "max_queue_size": 10 },
        }))
        .unwrap()
    }

    fn test_queue(dir: &tempfile::TempDir) -> RequestQueue {
        let mut controllers: HashMap<String, Arc<dyn RequestController>> = HashMap::new();
        controllers.insert("chat".to_string(), Arc::new(EchoController));
        RequestQueue::new(
            test_config(),
            controllers,
            Arc::new(CsvTelemetryStore::new(dir.path().join("telemetry.csv"))),
            Arc::new(MemoryRateLimitStore::new()),
        )
    }

    #[tokio::test]
    async fn submit_echoes_through_the_controller() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir);
        queue.initiate().await.unwrap();

        let response = queue
            .submit(
                "chat",
                "u1",
                serde_json::json!({"q": "hi"}),
                ModelPreferences::default(),
            )
            .await
            .unwrap();
        assert_eq!(response, serde_json::json!({"q": "hi"}));

        queue.graceful_shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn admission_failures_are_classified() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir);
        queue.initiate().await.unwrap();

        let err = queue
            .submit("chat", "", serde_json::json!(null), ModelPreferences::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::UserIdMissing));

        let err = queue
            .submit("nope", "u1", serde_json::json!(null), ModelPreferences::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::UnknownRequestType(_)));

        let err = queue
            .submit(
                "chat",
                "u1",
                serde_json::json!(null),
                ModelPreferences {
                    require_llm: false,
                    require_embedding: false,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::ResourceUnavailable(_)));

        let err = queue
            .submit(
                "chat",
                "u1",
                serde_json::json!(null),
                ModelPreferences {
                    specific_llm_id: Some("ghost".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::ResourceUnavailable(_)));

        queue.graceful_shutdown(Duration::from_secs(1)).await;
    }

    fn make_request(queue: &RequestQueue, req_id: u64) -> ScheduledRequest {
        ScheduledRequest {
            req_id,
            req_type: "chat".into(),
            payload: serde_json::json!(null),
            preferences: ModelPreferences::default(),
            telemetry: TelemetryRecord::new(req_id, "u1", "chat", &serde_json::json!(null)),
            deadline: Instant::now() + queue.inner.ttl,
        }
    }

    #[tokio::test]
    async fn waiting_queue_is_preferred_over_new() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir);

        // Park one request in waiting, then add a newer one to new.
        queue.inner.scheduler.offer_new(make_request(&queue, 5)).unwrap();
        let parked = queue.inner.scheduler.pop_new().unwrap();
        queue.inner.scheduler.offer_waiting(parked);
        queue.inner.scheduler.offer_new(make_request(&queue, 6)).unwrap();

        // First dispatch turn drains waiting, not new.
        assert!(QueueInner::try_dispatch_one(&queue.inner));
        let (new_head, waiting) = queue.inner.scheduler.peek_heads();
        assert!(waiting.is_empty());
        assert!(new_head.is_some());

        assert!(QueueInner::try_dispatch_one(&queue.inner));
        let (new_head, _) = queue.inner.scheduler.peek_heads();
        assert!(new_head.is_none());
    }

    #[tokio::test]
    async fn unserveable_new_head_stays_in_new() {
        let dir = tempfile::tempdir().unwrap();
        let mut controllers: HashMap<String, Arc<dyn RequestController>> = HashMap::new();
        controllers.insert("chat".to_string(), Arc::new(EchoController));
        let config: QueueConfig = serde_json::from_value(serde_json::json!({
            "llm_deployments": [{
                "id": "llm-a",
                "output_kind": "chat",
                "reqs_per_min": 1,
                "tokens_per_min": 60_000,
            }],
        }))
        .unwrap();
        let queue = RequestQueue::new(
            config,
            controllers,
            Arc::new(CsvTelemetryStore::new(dir.path().join("telemetry.csv"))),
            Arc::new(MemoryRateLimitStore::new()),
        );

        queue.inner.scheduler.offer_new(make_request(&queue, 1)).unwrap();
        assert!(QueueInner::try_dispatch_one(&queue.inner));

        // The budget is spent; the next head is left in new, not parked.
        queue.inner.scheduler.offer_new(make_request(&queue, 2)).unwrap();
        assert!(!QueueInner::try_dispatch_one(&queue.inner));
        let (new_head, waiting) = queue.inner.scheduler.peek_heads();
        assert!(new_head.is_some());
        assert!(waiting.is_empty());
    }

    #[tokio::test]
    async fn submissions_rejected_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir);
        queue.initiate().await.unwrap();
        queue.graceful_shutdown(Duration::from_millis(100)).await;

        let err = queue
            .submit("chat", "u1", serde_json::json!(null), ModelPreferences::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::ShuttingDown));
    }

    #[tokio::test]
    async fn depths_return_to_zero_after_completion() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir);
        queue.initiate().await.unwrap();

        queue
            .submit("chat", "u1", serde_json::json!(null), ModelPreferences::default())
            .await
            .unwrap();

        // The execution task releases its slot just after delivering the
        // response; give it a moment.
        let mut depths = queue.depths();
        for _ in 0..100 {
            if depths.in_flight == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            depths = queue.depths();
        }
        assert_eq!(depths.new, 0);
        assert_eq!(depths.waiting, 0);
        assert_eq!(depths.in_flight, 0);

        queue.graceful_shutdown(Duration::from_secs(1)).await;
    }
}
