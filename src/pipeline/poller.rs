//! Queue poll loop shared by decomposers and executors.
//!
//! Each poller is a small state machine:
//!
//! ```text
//! Polling ──pop──▶ Processing ──ok──▶ Polling
//!    │                 │
//!    └──fault──▶ Backoff(d) ◀──fault──┘
//!                     │
//!                     └──sleep d──▶ Polling
//! ```
//!
//! A pop timeout goes straight back to `Polling`. Backoff doubles per
//! consecutive fault up to a cap and resets after a clean iteration.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BackoffConfig;
use crate::error::PipelineError;
use crate::store::{QueueName, SharedStore};

/// A stage that consumes one queue.
#[async_trait]
pub trait QueueWorker: Send + Sync + 'static {
    /// Stage name, for logging.
    fn name(&self) -> &'static str;

    fn queue(&self) -> QueueName;

    /// Handle one popped element. `Err` sends the poller into backoff.
    async fn handle(&self, payload: &str) -> Result<(), PipelineError>;
}

/// Where a poller is in its loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerState {
    Polling,
    Processing(String),
    Backoff(Duration),
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    consecutive: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            consecutive: 0,
        }
    }

    /// Delay for the next fault, then advance.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.consecutive);
        let base = self.config.initial.saturating_mul(factor).min(self.config.max);
        self.consecutive = self.consecutive.saturating_add(1);

        if self.config.jitter > 0.0 {
            let jitter = rand::thread_rng().gen_range(0.0..=self.config.jitter);
            base + base.mul_f64(jitter)
        } else {
            base
        }
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive_faults(&self) -> u32 {
        self.consecutive
    }
}

/// Drives one `QueueWorker` against the store.
pub struct Poller<W: QueueWorker> {
    worker: Arc<W>,
    store: Arc<dyn SharedStore>,
    poll_timeout: Duration,
    backoff: Backoff,
    shutdown: Arc<AtomicBool>,
}

impl<W: QueueWorker> Poller<W> {
    pub fn new(
        worker: Arc<W>,
        store: Arc<dyn SharedStore>,
        poll_timeout: Duration,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            worker,
            store,
            poll_timeout,
            backoff: Backoff::new(backoff),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops the loop at its next `Polling` or `Backoff` boundary.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Advance the state machine by one transition.
    pub async fn step(&mut self, state: PollerState) -> PollerState {
        let queue = self.worker.queue();
        match state {
            PollerState::Polling => match self.store.pop(queue, self.poll_timeout).await {
                Ok(Some(payload)) => PollerState::Processing(payload),
                Ok(None) => PollerState::Polling,
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(worker = self.worker.name(), %queue, error = %e, ?delay, "Queue pop failed, backing off");
                    PollerState::Backoff(delay)
                }
            },
            PollerState::Processing(payload) => match self.worker.handle(&payload).await {
                Ok(()) => {
                    self.backoff.reset();
                    PollerState::Polling
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    if e.is_transient() {
                        warn!(worker = self.worker.name(), error = %e, ?delay, "Store fault while processing, backing off");
                    } else {
                        error!(worker = self.worker.name(), error = %e, ?delay, "Element abandoned");
                    }
                    PollerState::Backoff(delay)
                }
            },
            PollerState::Backoff(delay) => {
                tokio::time::sleep(delay).await;
                PollerState::Polling
            }
        }
    }

    /// Loop until the shutdown flag is set. A popped element is always
    /// processed before the flag is checked again.
    pub async fn run(mut self) {
        let mut state = PollerState::Polling;
        loop {
            if !matches!(state, PollerState::Processing(_)) && self.shutdown.load(Ordering::Relaxed)
            {
                info!(worker = self.worker.name(), "Poller shutting down");
                return;
            }
            debug!(worker = self.worker.name(), ?state, "Poller step");
            state = self.step(state).await;
        }
    }
}

/// Spawn a background poller.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop polling.
pub fn spawn_poller<W: QueueWorker>(
    worker: Arc<W>,
    store: Arc<dyn SharedStore>,
    poll_timeout: Duration,
    backoff: BackoffConfig,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let poller = Poller::new(worker, store, poll_timeout, backoff);
    let shutdown = poller.shutdown_flag();
    info!(
        worker = poller.worker.name(),
        queue = %poller.worker.queue(),
        "Poller started"
    );
    let handle = tokio::spawn(poller.run());
    (handle, shutdown)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::StoreError;
    use crate::store::InMemoryStore;
    use crate::task::{TaskField, TaskRecord, TaskStatus, Transition};

    fn no_jitter(initial_ms: u64, max_ms: u64) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(initial_ms),
            max: Duration::from_millis(max_ms),
            jitter: 0.0,
        }
    }

    /// Records payloads; fails on any payload starting with "bad".
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl QueueWorker for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn queue(&self) -> QueueName {
            QueueName::Execute
        }

        async fn handle(&self, payload: &str) -> Result<(), PipelineError> {
            self.seen.lock().unwrap().push(payload.to_string());
            if payload.starts_with("bad") {
                return Err(PipelineError::MalformedJob(payload.to_string()));
            }
            Ok(())
        }
    }

    fn recorder() -> Arc<Recorder> {
        Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Store whose every operation fails.
    struct DownStore;

    #[async_trait]
    impl SharedStore for DownStore {
        async fn push(&self, _queue: QueueName, _payload: &str) -> Result<(), StoreError> {
            Err(StoreError::Connection("refused".into()))
        }

        async fn pop(
            &self,
            _queue: QueueName,
            _timeout: Duration,
        ) -> Result<Option<String>, StoreError> {
            Err(StoreError::Connection("refused".into()))
        }

        async fn set_fields(
            &self,
            _task_id: &str,
            _fields: &[(TaskField, String)],
        ) -> Result<(), StoreError> {
            Err(StoreError::Connection("refused".into()))
        }

        async fn get_field(
            &self,
            _task_id: &str,
            _field: TaskField,
        ) -> Result<Option<String>, StoreError> {
            Err(StoreError::Connection("refused".into()))
        }

        async fn get_task(&self, _task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
            Err(StoreError::Connection("refused".into()))
        }

        async fn transition(
            &self,
            _task_id: &str,
            _to: TaskStatus,
            _fields: &[(TaskField, String)],
        ) -> Result<Transition, StoreError> {
            Err(StoreError::Connection("refused".into()))
        }
    }

    #[test]
    fn backoff_doubles_caps_and_resets() {
        let mut backoff = Backoff::new(no_jitter(100, 500));
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);

        backoff.reset();
        assert_eq!(backoff.consecutive_faults(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn backoff_jitter_stays_within_bound() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial: Duration::from_millis(1000),
            max: Duration::from_millis(1000),
            jitter: 0.1,
        });
        for _ in 0..50 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1100));
        }
    }

    #[tokio::test]
    async fn pop_timeout_returns_to_polling() {
        let store = Arc::new(InMemoryStore::new());
        let mut poller = Poller::new(recorder(), store, Duration::from_millis(10), no_jitter(100, 1000));
        assert_eq!(poller.step(PollerState::Polling).await, PollerState::Polling);
    }

    #[tokio::test]
    async fn processes_then_returns_to_polling() {
        let store = Arc::new(InMemoryStore::new());
        store.push(QueueName::Execute, "job-1").await.unwrap();
        let worker = recorder();
        let mut poller = Poller::new(worker.clone(), store, Duration::from_millis(10), no_jitter(100, 1000));

        let state = poller.step(PollerState::Polling).await;
        assert_eq!(state, PollerState::Processing("job-1".into()));
        let state = poller.step(state).await;
        assert_eq!(state, PollerState::Polling);
        assert_eq!(worker.seen.lock().unwrap().as_slice(), ["job-1".to_string()]);
    }

    #[tokio::test]
    async fn handler_fault_backs_off_and_success_resets() {
        let store = Arc::new(InMemoryStore::new());
        let mut poller = Poller::new(recorder(), store, Duration::from_millis(10), no_jitter(100, 1000));

        let state = poller.step(PollerState::Processing("bad-1".into())).await;
        assert_eq!(state, PollerState::Backoff(Duration::from_millis(100)));
        let state = poller.step(PollerState::Processing("bad-2".into())).await;
        assert_eq!(state, PollerState::Backoff(Duration::from_millis(200)));

        let state = poller.step(PollerState::Processing("good".into())).await;
        assert_eq!(state, PollerState::Polling);
        let state = poller.step(PollerState::Processing("bad-3".into())).await;
        assert_eq!(state, PollerState::Backoff(Duration::from_millis(100)));
    }

    #[tokio::test(start_paused = true)]
    async fn store_fault_backs_off_then_polls_again() {
        let mut poller = Poller::new(
            recorder(),
            Arc::new(DownStore),
            Duration::from_millis(10),
            no_jitter(100, 1000),
        );
        let state = poller.step(PollerState::Polling).await;
        assert_eq!(state, PollerState::Backoff(Duration::from_millis(100)));
        let state = poller.step(state).await;
        assert_eq!(state, PollerState::Polling);
    }

    #[tokio::test]
    async fn spawned_poller_drains_queue_and_stops() {
        let store = Arc::new(InMemoryStore::new());
        for i in 0..3 {
            store.push(QueueName::Execute, &format!("job-{i}")).await.unwrap();
        }
        let worker = recorder();
        let (handle, shutdown) = spawn_poller(
            worker.clone(),
            store.clone(),
            Duration::from_millis(20),
            no_jitter(10, 100),
        );

        for _ in 0..100 {
            if worker.seen.lock().unwrap().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.store(true, Ordering::Relaxed);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("poller did not stop")
            .unwrap();

        assert_eq!(
            worker.seen.lock().unwrap().as_slice(),
            ["job-0".to_string(), "job-1".to_string(), "job-2".to_string()]
        );
    }
}
