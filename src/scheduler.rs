use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU8, AtomicUsize, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{sleep, sleep_until, Instant},
};
use tracing::{debug, info, warn};

use crate::error::ApiError;

pub const DEFAULT_RATE_LIMITS: &[(u32, u64)] = &[(20, 1), (100, 120)];

const DISPATCH_SPACING: Duration = Duration::from_millis(50);
const SOFT_WINDOW: Duration = Duration::from_secs(120);
const SOFT_PAUSE: Duration = Duration::from_secs(30);
const MAX_RATE_ATTEMPTS: u32 = 3;

const STATE_RUNNING: u8 = 0;
const STATE_SOFT_PAUSED: u8 = 1;
const STATE_HARD_PAUSED: u8 = 2;

/// Parses an `"N1:S1,N2:S2"` rate-limit header into `(capacity, window_secs)`
/// pairs. Empty or unparsable input yields the safe default set.
pub fn parse_rate_limits(header: &str) -> Vec<(u32, u64)> {
    let mut limits = Vec::new();
    for part in header.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some((count, window)) = part.split_once(':') else {
            continue;
        };
        let (Ok(count), Ok(window)) = (count.trim().parse::<u32>(), window.trim().parse::<u64>())
        else {
            continue;
        };
        if count == 0 || window == 0 {
            continue;
        }
        limits.push((count, window));
    }
    if limits.is_empty() {
        return DEFAULT_RATE_LIMITS.to_vec();
    }
    limits
}

/// Sliding-window admission primitive. Multiple buckets combine in AND: a
/// dispatch departs only once every bucket admits.
#[derive(Debug)]
pub struct RateBucket {
    capacity: u32,
    window: Duration,
    stamps: VecDeque<Instant>,
}

impl RateBucket {
    pub fn new(capacity: u32, window_secs: u64) -> Self {
        Self {
            capacity,
            window: Duration::from_secs(window_secs),
            stamps: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.stamps.front() {
            if *oldest + self.window <= now {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn admits(&mut self, now: Instant) -> bool {
        self.prune(now);
        (self.stamps.len() as u32) < self.capacity
    }

    /// Time until the oldest entry ages out; zero when the bucket admits.
    pub fn wait_time(&mut self, now: Instant) -> Duration {
        self.prune(now);
        if (self.stamps.len() as u32) < self.capacity {
            return Duration::ZERO;
        }
        match self.stamps.front() {
            Some(oldest) => (*oldest + self.window).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.stamps.push_back(now);
    }
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub url: String,
}

impl ApiRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
    pub rate_limit: Option<String>,
    pub retry_after_secs: Option<u64>,
}

/// Seam between the dispatcher and the wire so the 429/403 paths are
/// scriptable in tests. The key is read at dispatch time, never at enqueue.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn execute(&self, request: &ApiRequest, api_key: &str) -> Result<ApiResponse, ApiError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ApiTransport for HttpTransport {
    async fn execute(&self, request: &ApiRequest, api_key: &str) -> Result<ApiResponse, ApiError> {
        let response = self
            .client
            .get(&request.url)
            .header("X-Riot-Token", api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        let status = response.status().as_u16();
        let rate_limit = response
            .headers()
            .get("X-App-Rate-Limit")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        let body = if (200..300).contains(&status) {
            response.json::<Value>().await.unwrap_or(Value::Null)
        } else {
            Value::String(response.text().await.unwrap_or_default())
        };
        Ok(ApiResponse {
            status,
            body,
            rate_limit,
            retry_after_secs,
        })
    }
}

/// Out-of-band observations for the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerSignal {
    RateLimited { retry_after_secs: u64 },
    KeyExpired,
}

struct QueuedCall {
    request: ApiRequest,
    reply: oneshot::Sender<Result<Value, ApiError>>,
}

struct SchedulerShared {
    state: AtomicU8,
    pending: AtomicUsize,
    window_count: AtomicUsize,
    soft_ceiling: usize,
    api_key: RwLock<String>,
}

/// Serial FIFO queue fronting the cloud API. Tasks depart in enqueue order,
/// one at a time, only when every rate bucket admits.
#[derive(Clone)]
pub struct CloudScheduler {
    queue_tx: mpsc::UnboundedSender<QueuedCall>,
    shared: Arc<SchedulerShared>,
}

impl CloudScheduler {
    pub fn spawn(
        transport: Arc<dyn ApiTransport>,
        api_key: String,
        soft_ceiling: usize,
        signals: mpsc::UnboundedSender<SchedulerSignal>,
    ) -> (Self, JoinHandle<()>) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SchedulerShared {
            state: AtomicU8::new(STATE_RUNNING),
            pending: AtomicUsize::new(0),
            window_count: AtomicUsize::new(0),
            soft_ceiling: soft_ceiling.max(1),
            api_key: RwLock::new(api_key),
        });
        let dispatcher = Dispatcher {
            shared: shared.clone(),
            transport,
            signals,
            buckets: DEFAULT_RATE_LIMITS
                .iter()
                .map(|(count, window)| RateBucket::new(*count, *window))
                .collect(),
            pending_limits: None,
            window: VecDeque::new(),
            last_dispatch: None,
            queue_rx,
        };
        let handle = tokio::spawn(dispatcher.run());
        (Self { queue_tx, shared }, handle)
    }

    /// Queues a call and returns its completion channel. Rejected on the
    /// spot with a credential-expired error while hard-paused.
    pub fn submit(&self, request: ApiRequest) -> oneshot::Receiver<Result<Value, ApiError>> {
        let (reply, receiver) = oneshot::channel();
        if self.shared.state.load(Ordering::Acquire) == STATE_HARD_PAUSED {
            let _ = reply.send(Err(ApiError::CredentialExpired));
            return receiver;
        }
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        if self.queue_tx.send(QueuedCall { request, reply }).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
        }
        receiver
    }

    pub async fn enqueue(&self, request: ApiRequest) -> Result<Value, ApiError> {
        match self.submit(request).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Transport("scheduler stopped".to_owned())),
        }
    }

    /// Swaps the key and returns the scheduler to `Running`. The caller is
    /// expected to wait its propagation delay before re-issuing calls.
    pub fn reload_key(&self, api_key: String) {
        if let Ok(mut key) = self.shared.api_key.write() {
            *key = api_key;
        }
        self.shared.state.store(STATE_RUNNING, Ordering::Release);
        info!("scheduler key reloaded, resuming dispatch");
    }

    pub fn window_usage(&self) -> f32 {
        self.shared.window_count.load(Ordering::Acquire) as f32
            / self.shared.soft_ceiling as f32
    }

    pub fn is_paused(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) != STATE_RUNNING
    }

    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }
}

struct Dispatcher {
    shared: Arc<SchedulerShared>,
    transport: Arc<dyn ApiTransport>,
    signals: mpsc::UnboundedSender<SchedulerSignal>,
    buckets: Vec<RateBucket>,
    pending_limits: Option<String>,
    window: VecDeque<Instant>,
    last_dispatch: Option<Instant>,
    queue_rx: mpsc::UnboundedReceiver<QueuedCall>,
}

impl Dispatcher {
    async fn run(mut self) {
        while let Some(call) = self.queue_rx.recv().await {
            if self.shared.state.load(Ordering::Acquire) == STATE_HARD_PAUSED {
                let _ = call.reply.send(Err(ApiError::CredentialExpired));
                self.shared.pending.fetch_sub(1, Ordering::AcqRel);
                continue;
            }

            // Server-provided limits replace the bucket set between dispatches.
            if let Some(header) = self.pending_limits.take() {
                self.apply_rate_update(&header);
            }

            if let Some(last) = self.last_dispatch {
                let due = last + DISPATCH_SPACING;
                if Instant::now() < due {
                    sleep_until(due).await;
                }
            }

            self.soft_throttle_gate().await;

            loop {
                let now = Instant::now();
                let wait = self
                    .buckets
                    .iter_mut()
                    .map(|bucket| bucket.wait_time(now))
                    .max()
                    .unwrap_or(Duration::ZERO);
                if wait.is_zero() {
                    break;
                }
                debug!(wait_ms = wait.as_millis() as u64, "buckets full, waiting");
                sleep(wait).await;
            }

            let now = Instant::now();
            for bucket in &mut self.buckets {
                bucket.record(now);
            }
            self.window.push_back(now);
            self.prune_window(now);
            self.last_dispatch = Some(now);

            let result = self.execute_with_retry(&call.request).await;
            let credential_expired = matches!(&result, Err(ApiError::CredentialExpired));
            let _ = call.reply.send(result);
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);

            if credential_expired {
                self.hard_pause_and_drain();
            }
        }
    }

    /// Safety margin under Running: voluntary pause at 80% of the sliding
    /// 120 s window. Not a substitute for bucket admission.
    async fn soft_throttle_gate(&mut self) {
        loop {
            self.prune_window(Instant::now());
            let threshold = self.shared.soft_ceiling * 80 / 100;
            if self.window.len() < threshold.max(1) {
                return;
            }
            let until = Instant::now() + SOFT_PAUSE;
            warn!(
                dispatched = self.window.len(),
                ceiling = self.shared.soft_ceiling,
                "soft throttle engaged, pausing dispatch"
            );
            self.shared
                .state
                .store(STATE_SOFT_PAUSED, Ordering::Release);
            sleep_until(until).await;
            let _ = self.shared.state.compare_exchange(
                STATE_SOFT_PAUSED,
                STATE_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    fn prune_window(&mut self, now: Instant) {
        while let Some(oldest) = self.window.front() {
            if *oldest + SOFT_WINDOW <= now {
                self.window.pop_front();
            } else {
                break;
            }
        }
        self.shared
            .window_count
            .store(self.window.len(), Ordering::Release);
    }

    fn apply_rate_update(&mut self, header: &str) {
        let limits = parse_rate_limits(header);
        let mut buckets: Vec<RateBucket> = limits
            .iter()
            .map(|(count, window)| RateBucket::new(*count, *window))
            .collect();
        // Seed replacements from the dispatch history so a fresh bucket set
        // cannot admit a burst the server already counted.
        for stamp in &self.window {
            for bucket in &mut buckets {
                bucket.record(*stamp);
            }
        }
        debug!(?limits, "applied server rate-limit update");
        self.buckets = buckets;
    }

    async fn execute_with_retry(&mut self, request: &ApiRequest) -> Result<Value, ApiError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let api_key = self
                .shared
                .api_key
                .read()
                .map(|key| key.clone())
                .unwrap_or_default();
            let response = self.transport.execute(request, &api_key).await?;
            if let Some(header) = response.rate_limit.clone() {
                self.pending_limits = Some(header);
            }
            match response.status {
                status if (200..300).contains(&status) => return Ok(response.body),
                429 => {
                    let retry_after_secs = response.retry_after_secs.unwrap_or(1);
                    if attempts >= MAX_RATE_ATTEMPTS {
                        let _ = self.signals.send(SchedulerSignal::RateLimited {
                            retry_after_secs,
                        });
                        return Err(ApiError::RateLimited {
                            attempts,
                            retry_after_secs,
                        });
                    }
                    warn!(attempts, retry_after_secs, url = %request.url, "rate limited, backing off");
                    sleep(Duration::from_secs(retry_after_secs)).await;
                }
                403 => return Err(ApiError::CredentialExpired),
                status => {
                    return Err(ApiError::Status {
                        status,
                        body: response.body.to_string(),
                    })
                }
            }
        }
    }

    fn hard_pause_and_drain(&mut self) {
        self.shared
            .state
            .store(STATE_HARD_PAUSED, Ordering::Release);
        let mut drained = 0usize;
        while let Ok(call) = self.queue_rx.try_recv() {
            let _ = call.reply.send(Err(ApiError::CredentialExpired));
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            drained += 1;
        }
        warn!(drained, "credentials expired, scheduler hard-paused");
        let _ = self.signals.send(SchedulerSignal::KeyExpired);
    }
}
