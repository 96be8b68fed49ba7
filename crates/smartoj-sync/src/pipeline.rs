//! # Pipeline lifecycle
//!
//! Wires a [`ChangeSource`] to the [`Dispatcher`] through the handoff queue
//! and owns the ordered shutdown.
//!
//! ```text
//! NotStarted ──start()──▶ Running ──stop() / reader exit / dispatch failure──▶ Draining ──▶ Stopped
//! ```
//!
//! Draining runs these steps in order:
//! 1. the reader is asked to stop (flag + socket shutdown)
//! 2. the dispatcher flushes the batches already queued
//! 3. the reader thread is joined, bounded by the join timeout
//! 4. the broker is shut down
//! 5. pooled MySQL connections are disconnected

use crate::broker::SharedTaskBroker;
use crate::checkpoint::SharedPositionStore;
use crate::dispatcher::{Dispatcher, DispatcherStatsSnapshot};
use crate::error::{Result, SyncError};
use crate::events::ProgressNotifier;
use crate::queue::{self, BatchReceiver, DEFAULT_CAPACITY};
use crate::reader::{ChangeSource, ReaderExit, ReaderHandle};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    NotStarted,
    Running,
    Draining,
    Stopped,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::NotStarted => "not_started",
            PipelineState::Running => "running",
            PipelineState::Draining => "draining",
            PipelineState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a pipeline run ended.
#[derive(Debug)]
pub struct PipelineExit {
    pub reader: ReaderExit,
    pub dispatcher: Result<()>,
    pub stats: DispatcherStatsSnapshot,
}

impl PipelineExit {
    /// Stopped on request with nothing failing.
    pub fn is_clean(&self) -> bool {
        self.reader.is_clean() && self.dispatcher.is_ok()
    }
}

/// Requests a stop from anywhere (signal handlers, other tasks).
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Clone)]
struct StateCell {
    tx: Arc<watch::Sender<PipelineState>>,
    notifier: ProgressNotifier,
}

impl StateCell {
    fn transition(&self, to: PipelineState) {
        let from = self.tx.send_replace(to);
        if from != to {
            info!("Pipeline {} -> {}", from, to);
            self.notifier.state_changed(from.as_str(), to.as_str());
        }
    }

    fn get(&self) -> PipelineState {
        *self.tx.borrow()
    }
}

pub struct Pipeline {
    source: Option<Box<dyn ChangeSource>>,
    store: SharedPositionStore,
    broker: SharedTaskBroker,
    notifier: ProgressNotifier,
    queue_capacity: usize,
    join_timeout: Duration,
    pools: Vec<mysql_async::Pool>,
    state: StateCell,
    stop: StopHandle,
    supervisor: Option<JoinHandle<PipelineExit>>,
}

impl Pipeline {
    pub fn new(
        source: Box<dyn ChangeSource>,
        store: SharedPositionStore,
        broker: SharedTaskBroker,
        notifier: ProgressNotifier,
    ) -> Self {
        let (state_tx, _) = watch::channel(PipelineState::NotStarted);
        let (stop_tx, _) = watch::channel(false);
        Self {
            source: Some(source),
            store,
            broker,
            state: StateCell {
                tx: Arc::new(state_tx),
                notifier: notifier.clone(),
            },
            notifier,
            queue_capacity: DEFAULT_CAPACITY,
            join_timeout: Duration::from_secs(5),
            pools: Vec::new(),
            stop: StopHandle {
                tx: Arc::new(stop_tx),
            },
            supervisor: None,
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Bound on waiting for the reader thread while draining.
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Pool to disconnect as the last teardown step.
    pub fn with_pool(mut self, pool: mysql_async::Pool) -> Self {
        self.pools.push(pool);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state.get()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state.tx.subscribe()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Load the checkpoint, start the reader and the dispatcher.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != PipelineState::NotStarted {
            return Err(SyncError::invalid_state(format!(
                "cannot start a pipeline that is {}",
                self.state()
            )));
        }
        let source = self
            .source
            .take()
            .ok_or_else(|| SyncError::invalid_state("pipeline source already consumed"))?;

        let stored = self.store.load().await?;
        let start = source.start_position(stored).await?;

        let (sender, receiver) = queue::handoff(self.queue_capacity);
        let reader = source.spawn(start.clone(), sender, self.notifier.clone())?;
        self.state.transition(PipelineState::Running);
        info!(
            "Pipeline started at {} (queue capacity {})",
            start, self.queue_capacity
        );

        let dispatcher = Dispatcher::new(
            self.broker.clone(),
            self.store.clone(),
            self.notifier.clone(),
        );
        let supervisor = Supervisor {
            state: self.state.clone(),
            broker: self.broker.clone(),
            pools: std::mem::take(&mut self.pools),
            join_timeout: self.join_timeout,
            stop: self.stop.tx.subscribe(),
        };
        self.supervisor = Some(tokio::spawn(supervisor.run(reader, dispatcher, receiver)));
        Ok(())
    }

    /// Ask the pipeline to drain and stop; returns immediately.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Wait until the pipeline reaches `Stopped`.
    pub async fn wait(&mut self) -> Result<PipelineExit> {
        let supervisor = self
            .supervisor
            .take()
            .ok_or_else(|| SyncError::invalid_state("pipeline was not started"))?;
        supervisor
            .await
            .map_err(|e| SyncError::other(format!("pipeline supervisor failed: {}", e)))
    }
}

struct Supervisor {
    state: StateCell,
    broker: SharedTaskBroker,
    pools: Vec<mysql_async::Pool>,
    join_timeout: Duration,
    stop: watch::Receiver<bool>,
}

impl Supervisor {
    async fn run(
        mut self,
        reader: ReaderHandle,
        dispatcher: Dispatcher,
        queue: BatchReceiver,
    ) -> PipelineExit {
        let stats = dispatcher.stats();
        let (close_tx, close_rx) = watch::channel(false);
        let mut dispatch = tokio::spawn(async move { dispatcher.run(queue, close_rx).await });

        let finished = tokio::select! {
            result = &mut dispatch => Some(result),
            _ = stop_requested(&mut self.stop) => None,
        };
        match &finished {
            None => info!("Stop requested"),
            Some(Ok(Ok(()))) => info!("Handoff queue closed by the reader"),
            Some(Ok(Err(e))) => error!("Dispatcher failed: {}", e),
            Some(Err(e)) => error!("Dispatcher task failed: {}", e),
        }

        self.state.transition(PipelineState::Draining);
        reader.stop();

        let reader_exit = match reader.join(self.join_timeout).await {
            Ok(exit) => exit,
            Err(e) => {
                warn!("{}; leaving the thread detached", e);
                ReaderExit::Failed(e.to_string())
            }
        };

        // A detached reader still holds its sender; close the queue so the
        // dispatcher finishes with what is buffered.
        close_tx.send_replace(true);
        let joined = match finished {
            Some(result) => result,
            None => dispatch.await,
        };
        let dispatcher_result = joined
            .unwrap_or_else(|e| Err(SyncError::other(format!("dispatcher task failed: {}", e))));

        if let Err(e) = self.broker.shutdown().await {
            warn!("Broker shutdown failed: {}", e);
        }
        for pool in self.pools.drain(..) {
            if let Err(e) = pool.disconnect().await {
                warn!("Disconnecting MySQL pool failed: {}", e);
            }
        }

        self.state.transition(PipelineState::Stopped);
        PipelineExit {
            reader: reader_exit,
            dispatcher: dispatcher_result,
            stats: stats.snapshot(),
        }
    }
}

/// Resolves once a stop is requested or every stop handle is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|requested| *requested).await;
}
