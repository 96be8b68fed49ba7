//! # Task broker
//!
//! The dispatcher hands every change record to a [`TaskBroker`] as a [`Job`]
//! and only waits for *acceptance*. Execution, retries and dead-lettering
//! belong to the broker.
//!
//! - [`HttpBroker`] posts jobs to an external ingest endpoint.
//! - [`LocalBroker`] runs the [`HandlerRegistry`] on an in-process worker
//!   pool fed by a bounded intake channel. Nothing it holds survives the
//!   process, so a job counts as accepted only once a worker has finished
//!   with it (applied, skipped or dead-lettered).

use crate::config::{BrokerConfig, BrokerKind};
use crate::error::{Result, SyncError};
use crate::event::ChangeRecord;
use crate::handlers::{HandlerOutcome, HandlerRegistry};
use crate::registry::JobKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A unit of work for a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    #[serde(rename = "task")]
    pub name: JobKind,
    /// The serialized [`ChangeRecord`]
    pub payload: serde_json::Value,
}

impl Job {
    pub fn new(name: JobKind, record: &ChangeRecord) -> Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            name,
            payload: serde_json::to_value(record)?,
        })
    }

    /// The record this job was built from.
    pub fn record(&self) -> Result<ChangeRecord> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            SyncError::serialization(format!("job {} payload is not a change record: {}", self.id, e))
        })
    }
}

/// Job submission endpoint.
#[async_trait]
pub trait TaskBroker: Send + Sync {
    /// Returns once the broker has taken ownership of the job.
    async fn submit(&self, job: Job) -> Result<()>;

    /// Stop accepting jobs and release resources; waits for in-flight work
    /// where the broker runs it.
    async fn shutdown(&self) -> Result<()>;
}

/// Shared task broker
pub type SharedTaskBroker = Arc<dyn TaskBroker>;

/// Build the configured broker. The local broker spawns its workers, so
/// this must run inside the runtime.
pub fn from_config(config: &BrokerConfig, handlers: HandlerRegistry) -> Result<SharedTaskBroker> {
    match config.kind {
        BrokerKind::Http => Ok(Arc::new(HttpBroker::new(config)?)),
        BrokerKind::Local => Ok(Arc::new(LocalBroker::start(
            handlers,
            config.workers,
            config.intake_capacity,
            RetryPolicy::from(config),
        ))),
    }
}

/// External ingest endpoint; any 2xx response means accepted.
pub struct HttpBroker {
    client: reqwest::Client,
    url: String,
}

impl HttpBroker {
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| SyncError::config("broker.url is required for the http broker"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| SyncError::config(format!("Failed to build broker client: {}", e)))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl TaskBroker for HttpBroker {
    async fn submit(&self, job: Job) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&job)
            .send()
            .await
            .map_err(|e| SyncError::broker(format!("Submitting job {} failed: {}", job.id, e)))?;

        let status = response.status();
        if status.is_success() {
            debug!("Broker accepted job {} ({})", job.id, job.name);
            Ok(())
        } else {
            Err(SyncError::broker(format!(
                "Broker rejected job {} ({}): {} {}",
                job.id,
                job.name,
                status,
                response.text().await.unwrap_or_default()
            )))
        }
    }

    async fn shutdown(&self) -> Result<()> {
        debug!("HTTP broker client released");
        Ok(())
    }
}

/// Exponential backoff for retriable handler failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&BrokerConfig::default())
    }
}

impl From<&BrokerConfig> for RetryPolicy {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// Local broker counters
#[derive(Debug, Default)]
pub struct BrokerStats {
    accepted: AtomicU64,
    applied: AtomicU64,
    skipped: AtomicU64,
    retries: AtomicU64,
    dead_lettered: AtomicU64,
}

impl BrokerStats {
    pub fn snapshot(&self) -> BrokerStatsSnapshot {
        BrokerStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStatsSnapshot {
    pub accepted: u64,
    pub applied: u64,
    pub skipped: u64,
    pub retries: u64,
    pub dead_lettered: u64,
}

/// A job plus the channel its submitter waits on.
struct Delivery {
    job: Job,
    done: oneshot::Sender<()>,
}

/// In-process broker running the handlers on a pool of tokio tasks.
pub struct LocalBroker {
    intake: parking_lot::Mutex<Option<mpsc::Sender<Delivery>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<BrokerStats>,
}

impl LocalBroker {
    /// Spawn `workers` tasks on the current runtime.
    pub fn start(
        handlers: HandlerRegistry,
        workers: usize,
        intake_capacity: usize,
        retry: RetryPolicy,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Delivery>(intake_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let stats = Arc::new(BrokerStats::default());

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let rx = rx.clone();
                let handlers = handlers.clone();
                let stats = stats.clone();
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(Delivery { job, done }) = next else { break };
                        run_job(worker_id, &handlers, retry, &stats, job).await;
                        // submitter may have given up; the job ran either way
                        let _ = done.send(());
                    }
                    debug!("Broker worker {} stopped", worker_id);
                })
            })
            .collect();

        info!("Local broker started with {} workers", workers.max(1));
        Self {
            intake: parking_lot::Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            stats,
        }
    }

    pub fn stats(&self) -> BrokerStatsSnapshot {
        self.stats.snapshot()
    }
}

async fn run_job(
    worker_id: usize,
    handlers: &HandlerRegistry,
    retry: RetryPolicy,
    stats: &BrokerStats,
    job: Job,
) {
    let mut attempt = 1;
    loop {
        match handlers.handle(&job).await {
            Ok(HandlerOutcome::Applied) => {
                stats.applied.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Ok(HandlerOutcome::Skipped(reason)) => {
                debug!("Job {} ({}) skipped: {}", job.id, job.name, reason);
                stats.skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) if e.is_retriable() && attempt < retry.max_attempts => {
                let delay = retry.backoff(attempt);
                warn!(
                    "Worker {}: job {} ({}) attempt {}/{} failed: {}; retrying in {:?}",
                    worker_id, job.id, job.name, attempt, retry.max_attempts, e, delay
                );
                stats.retries.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                error!(
                    job_id = %job.id,
                    task = %job.name,
                    category = ?e.category(),
                    error_code = e.error_code(),
                    "Job dead-lettered after {} attempts: {}",
                    attempt,
                    e
                );
                stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }
}

#[async_trait]
impl TaskBroker for LocalBroker {
    async fn submit(&self, job: Job) -> Result<()> {
        let sender = self
            .intake
            .lock()
            .clone()
            .ok_or_else(|| SyncError::broker("broker is shut down"))?;
        let job_id = job.id;
        let (done, finished) = oneshot::channel();
        sender
            .send(Delivery { job, done })
            .await
            .map_err(|_| SyncError::broker("broker is shut down"))?;
        finished.await.map_err(|_| {
            SyncError::broker(format!("job {} was dropped before it finished", job_id))
        })?;
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        drop(self.intake.lock().take());
        let handles: Vec<_> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Broker worker panicked: {}", e);
            }
        }
        let stats = self.stats.snapshot();
        info!(
            "Local broker drained: {} applied, {} skipped, {} dead-lettered",
            stats.applied, stats.skipped, stats.dead_lettered
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::event::{BinlogPosition, Row};
    use crate::index::{MemoryIndex, SearchIndex};
    use crate::notification_store::MemoryNotificationStore;

    fn question_insert(id: i64) -> Job {
        let record = ChangeRecord::insert(
            "question",
            Row::new().with("id", id).with("title", "Two Sum"),
            BinlogPosition::new("binlog.000001", 4),
        );
        Job::new(JobKind::SyncQuestion, &record).unwrap()
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_job_wire_format() {
        let job = question_insert(42);
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["task"], "sync-question");
        assert_eq!(value["payload"]["table"], "question");
        assert_eq!(value["payload"]["after"]["id"], 42);
        assert!(value["id"].is_string());
        assert_eq!(job.record().unwrap().table, "question");
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_secs(1));
        assert_eq!(policy.backoff(40), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_local_broker_runs_jobs_and_drains() {
        let index = Arc::new(MemoryIndex::new());
        let handlers = HandlerRegistry::new(
            index.clone(),
            Arc::new(MemoryDirectory::new()),
            Arc::new(MemoryNotificationStore::new()),
        );
        let broker = LocalBroker::start(handlers, 2, 4, fast_retry(3));
        for id in 1..=5 {
            broker.submit(question_insert(id)).await.unwrap();
        }
        broker.shutdown().await.unwrap();

        assert_eq!(index.len(), 5);
        let stats = broker.stats();
        assert_eq!(stats.accepted, 5);
        assert_eq!(stats.applied, 5);
        assert!(broker.submit(question_insert(6)).await.is_err());
    }

    #[tokio::test]
    async fn test_local_broker_submit_returns_after_handler_ran() {
        let index = Arc::new(MemoryIndex::new());
        let handlers = HandlerRegistry::new(
            index.clone(),
            Arc::new(MemoryDirectory::new()),
            Arc::new(MemoryNotificationStore::new()),
        );
        let broker = LocalBroker::start(handlers, 1, 4, fast_retry(3));
        broker.submit(question_insert(7)).await.unwrap();

        // no shutdown yet: the job is already done
        assert!(index.get_document(7).await.unwrap().is_some());
        assert_eq!(broker.stats().applied, 1);
        broker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_local_broker_retries_then_dead_letters() {
        let index = Arc::new(MemoryIndex::new());
        index.set_unavailable(true);
        let handlers = HandlerRegistry::new(
            index.clone(),
            Arc::new(MemoryDirectory::new()),
            Arc::new(MemoryNotificationStore::new()),
        );
        let broker = LocalBroker::start(handlers, 1, 4, fast_retry(3));
        broker.submit(question_insert(1)).await.unwrap();
        broker.shutdown().await.unwrap();

        let stats = broker.stats();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.applied, 0);
        index.set_unavailable(false);
        assert!(index.get_document(1).await.unwrap().is_none());
    }

    /// Collects the fields of every event emitted while installed.
    #[derive(Clone, Default)]
    struct CapturedEvents(Arc<parking_lot::Mutex<Vec<String>>>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for CapturedEvents {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            let mut line = String::new();
            event.record(&mut |field: &tracing::field::Field, value: &dyn std::fmt::Debug| {
                line.push_str(&format!("{}={:?} ", field.name(), value));
            });
            self.0.lock().push(line);
        }
    }

    #[tokio::test]
    async fn test_dead_letter_log_carries_category() {
        use tracing_subscriber::layer::SubscriberExt;

        let captured = CapturedEvents::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(captured.clone()));

        let index = Arc::new(MemoryIndex::new());
        index.set_unavailable(true);
        let handlers = HandlerRegistry::new(
            index,
            Arc::new(MemoryDirectory::new()),
            Arc::new(MemoryNotificationStore::new()),
        );
        let broker = LocalBroker::start(handlers, 1, 4, fast_retry(1));
        broker.submit(question_insert(1)).await.unwrap();
        broker.shutdown().await.unwrap();

        let lines = captured.0.lock();
        let dead_letter = lines
            .iter()
            .find(|l| l.contains("error_code="))
            .expect("dead-letter event logged");
        assert!(dead_letter.contains("category=Index"), "{}", dead_letter);
    }

    #[tokio::test]
    async fn test_http_broker_requires_url() {
        let config = BrokerConfig {
            kind: BrokerKind::Http,
            ..BrokerConfig::default()
        };
        assert!(matches!(HttpBroker::new(&config), Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn test_http_broker_unreachable_is_submission_failure() {
        let config = BrokerConfig {
            kind: BrokerKind::Http,
            url: Some("http://127.0.0.1:1/tasks".into()),
            timeout_secs: 1,
            ..BrokerConfig::default()
        };
        let broker = HttpBroker::new(&config).unwrap();
        let err = broker.submit(question_insert(1)).await.unwrap_err();
        assert!(matches!(err, SyncError::Broker(_)));
    }
}
