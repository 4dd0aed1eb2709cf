//! Download queue and worker
//!
//! One worker task drains a FIFO of download jobs. Jobs are deduplicated by
//! subscription id while queued, running or waiting for a retry. Every
//! finished request and every failed attempt is reported to the coordinator
//! as a `DownloadFinished` event; the worker never touches the registry.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use lk_core::SubscriptionId;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::{DownloaderConfig, HttpConfig};
use crate::connectivity::Connectivity;
use crate::event::EngineEvent;
use crate::fetch::Fetcher;
use crate::request::DownloadRequest;

/// Exponential backoff with jitter between attempts of one job.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per job, the first one included
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&HttpConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(http: &HttpConfig) -> Self {
        Self {
            max_attempts: http.max_attempts,
            initial_delay_ms: http.retry_delay_ms,
            max_delay_ms: http.max_retry_delay_ms,
            jitter_factor: 0.25,
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms.saturating_mul(2u64.pow(attempt.min(10)));
        let capped = base.min(self.max_delay_ms);

        let jitter = (rand::random::<f64>() - 0.5) * 2.0 * self.jitter_factor;
        let with_jitter = (capped as f64 * (1.0 + jitter)) as u64;

        Duration::from_millis(with_jitter)
    }
}

#[derive(Debug)]
struct DownloadJob {
    request: DownloadRequest,
    attempts: u32,
    not_before: Option<Instant>,
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: VecDeque<DownloadJob>,
    retries: Vec<DownloadJob>,
    enqueued: HashSet<SubscriptionId>,
    /// Set while the connectivity policy refuses downloads
    paused_until: Option<Instant>,
}

impl QueueState {
    fn next_job(&mut self, now: Instant) -> Option<DownloadJob> {
        if let Some(job) = self.jobs.pop_front() {
            return Some(job);
        }
        let ready = self
            .retries
            .iter()
            .position(|job| job.not_before.map_or(true, |at| at <= now))?;
        Some(self.retries.remove(ready))
    }

    fn next_retry_at(&self) -> Option<Instant> {
        self.retries.iter().filter_map(|job| job.not_before).min()
    }
}

pub struct Downloader {
    state: Mutex<QueueState>,
    notify: Notify,
    cancel: CancellationToken,
    fetcher: Arc<dyn Fetcher>,
    connectivity: Arc<dyn Connectivity>,
    events: mpsc::UnboundedSender<EngineEvent>,
    retry: RetryPolicy,
    poll_timeout: Duration,
    pause: Duration,
}

impl Downloader {
    pub fn new(
        config: &DownloaderConfig,
        retry: RetryPolicy,
        fetcher: Arc<dyn Fetcher>,
        connectivity: Arc<dyn Connectivity>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            fetcher,
            connectivity,
            events,
            retry,
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            pause: Duration::from_millis(config.pause_ms),
        })
    }

    /// Spawn the worker task.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await })
    }

    /// Queue a download unless one for the same subscription is pending.
    /// Returns whether the job was queued.
    pub fn enqueue(&self, request: DownloadRequest) -> bool {
        {
            let mut state = self.state.lock();
            if !state.enqueued.insert(request.id.clone()) {
                debug!("Download of '{}' already pending", request.id);
                return false;
            }
            debug!("Queued download of '{}'", request.id);
            state.jobs.push_back(DownloadJob {
                request,
                attempts: 0,
                not_before: None,
            });
        }
        self.notify.notify_one();
        true
    }

    /// Re-enable a paused worker right away.
    pub fn connectivity_changed(&self) {
        {
            let mut state = self.state.lock();
            if state.paused_until.take().is_some() {
                debug!("Re-checking download permission");
            }
        }
        self.notify.notify_one();
    }

    pub fn is_pending(&self, id: &SubscriptionId) -> bool {
        self.state.lock().enqueued.contains(id)
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().enqueued.len()
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused_until.is_some()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn run(self: Arc<Self>) {
        info!("Downloader started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let now = Instant::now();
            let paused_until = self.state.lock().paused_until;
            if let Some(until) = paused_until {
                if now >= until {
                    self.state.lock().paused_until = None;
                    debug!("Pause over, re-checking download permission");
                    continue;
                }
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = self.notify.notified() => {}
                    _ = sleep_until(until) => {}
                }
                continue;
            }

            let (job, wake_at) = {
                let mut state = self.state.lock();
                let job = state.next_job(now);
                let wake_at = state
                    .next_retry_at()
                    .map_or(now + self.poll_timeout, |at| at.min(now + self.poll_timeout));
                (job, wake_at)
            };

            let job = match job {
                Some(job) => job,
                None => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = self.notify.notified() => {}
                        _ = sleep_until(wake_at) => {}
                    }
                    continue;
                }
            };

            if !self.connectivity.can_fetch_now(job.request.allow_metered) {
                debug!("Updates disabled, re-queuing and pausing downloader");
                let mut state = self.state.lock();
                state.jobs.push_front(job);
                state.paused_until = Some(Instant::now() + self.pause);
                continue;
            }

            self.execute(job).await;
        }
        info!("Downloader stopped");
    }

    async fn execute(&self, mut job: DownloadJob) {
        let id = job.request.id.clone();
        debug!("Downloading '{}' using {}", id, job.request.url);

        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = self.fetcher.fetch(&job.request.url, &job.request.headers) => result,
        };

        match result {
            Ok(response) => {
                debug!("Downloading '{}' finished with status {}", id, response.status);
                self.state.lock().enqueued.remove(&id);
                self.post(EngineEvent::DownloadFinished {
                    id,
                    status: i32::from(response.status),
                    body: response.body,
                    headers: response.headers,
                });
            }
            Err(e) => {
                job.attempts += 1;
                warn!(
                    "Downloading '{}' failed (attempt {}/{}): {}",
                    id, job.attempts, self.retry.max_attempts, e
                );

                let retry = job.attempts < self.retry.max_attempts && e.is_retryable();
                {
                    let mut state = self.state.lock();
                    if retry {
                        let delay = self.retry.delay_for_attempt(job.attempts - 1);
                        job.not_before = Some(Instant::now() + delay);
                        state.retries.push(job);
                    } else {
                        state.enqueued.remove(&id);
                    }
                }
                if !retry {
                    info!("Giving up on '{}'", id);
                }

                self.post(EngineEvent::DownloadFinished {
                    id,
                    status: -1,
                    body: None,
                    headers: HashMap::new(),
                });
            }
        }
    }

    fn post(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            debug!("Coordinator gone, dropping download result");
        }
    }
}

impl Drop for Downloader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, NetworkErrorKind, Result};
    use crate::fetch::FetchResponse;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use url::Url;

    struct FailingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for FailingFetcher {
        async fn fetch(&self, _url: &Url, _headers: &[(String, String)]) -> Result<FetchResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::network(NetworkErrorKind::Connect, "connection refused"))
        }
    }

    struct OkFetcher;

    #[async_trait]
    impl Fetcher for OkFetcher {
        async fn fetch(&self, _url: &Url, _headers: &[(String, String)]) -> Result<FetchResponse> {
            let mut headers = HashMap::new();
            headers.insert("etag".to_string(), "\"v1\"".to_string());
            Ok(FetchResponse {
                status: 200,
                headers,
                body: Some("||ads.example^\n".to_string()),
            })
        }
    }

    struct Switch(AtomicBool);

    impl Connectivity for Switch {
        fn can_fetch_now(&self, _allow_metered: bool) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn request(url: &str) -> DownloadRequest {
        let url = Url::parse(url).unwrap();
        DownloadRequest {
            id: SubscriptionId::remote(&url),
            url,
            headers: Vec::new(),
            allow_metered: false,
            download_only: false,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 1,
            max_delay_ms: 4,
            jitter_factor: 0.0,
        }
    }

    fn config() -> DownloaderConfig {
        DownloaderConfig {
            poll_timeout_ms: 50,
            pause_ms: 60_000,
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    #[test]
    fn test_retry_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_factor: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_millis(1_000));
    }

    #[test]
    fn test_retry_jitter_bounds() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 1_000,
            jitter_factor: 0.25,
        };
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(0).as_millis();
            assert!((750..=1250).contains(&delay));
        }
    }

    #[tokio::test]
    async fn test_enqueue_deduplicates() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let downloader = Downloader::new(
            &config(),
            fast_retry(),
            Arc::new(OkFetcher),
            Arc::new(Switch(AtomicBool::new(true))),
            tx,
        );
        assert!(downloader.enqueue(request("https://x/list.txt")));
        assert!(!downloader.enqueue(request("https://x/list.txt")));
        assert!(downloader.enqueue(request("https://x/other.txt")));
        assert_eq!(downloader.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_success_reports_response() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let downloader = Downloader::new(
            &config(),
            fast_retry(),
            Arc::new(OkFetcher),
            Arc::new(Switch(AtomicBool::new(true))),
            tx,
        );
        let handle = downloader.start();
        downloader.enqueue(request("https://x/list.txt"));

        match next_event(&mut rx).await {
            EngineEvent::DownloadFinished {
                id,
                status,
                body,
                headers,
            } => {
                assert_eq!(id.as_str(), "url:https://x/list.txt");
                assert_eq!(status, 200);
                assert_eq!(body.as_deref(), Some("||ads.example^\n"));
                assert_eq!(headers.get("etag").map(String::as_str), Some("\"v1\""));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!downloader.is_pending(&SubscriptionId::from("url:https://x/list.txt")));

        downloader.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_five_failures_then_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let fetcher = Arc::new(FailingFetcher {
            calls: AtomicUsize::new(0),
        });
        let downloader = Downloader::new(
            &config(),
            fast_retry(),
            fetcher.clone(),
            Arc::new(Switch(AtomicBool::new(true))),
            tx,
        );
        let handle = downloader.start();
        downloader.enqueue(request("https://x/list.txt"));

        for _ in 0..5 {
            match next_event(&mut rx).await {
                EngineEvent::DownloadFinished { status, body, .. } => {
                    assert_eq!(status, -1);
                    assert!(body.is_none());
                }
                other => panic!("unexpected event {:?}", other),
            }
        }

        // No sixth attempt.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 5);
        assert_eq!(downloader.pending_count(), 0);

        downloader.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_job_waits_for_connectivity() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let switch = Arc::new(Switch(AtomicBool::new(false)));
        let downloader = Downloader::new(
            &config(),
            fast_retry(),
            Arc::new(OkFetcher),
            switch.clone(),
            tx,
        );
        let handle = downloader.start();
        downloader.enqueue(request("https://x/list.txt"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(downloader.is_paused());
        assert_eq!(downloader.pending_count(), 1);
        assert!(rx.try_recv().is_err());

        switch.0.store(true, Ordering::SeqCst);
        downloader.connectivity_changed();

        match next_event(&mut rx).await {
            EngineEvent::DownloadFinished { status, .. } => assert_eq!(status, 200),
            other => panic!("unexpected event {:?}", other),
        }

        downloader.shutdown();
        handle.await.unwrap();
    }
}
