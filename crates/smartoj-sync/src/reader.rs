//! Stream reader
//!
//! Tails the binlog on a dedicated OS thread. The replication socket blocks
//! indefinitely between events, so it never runs on the scheduler; the
//! thread hands each normalized [`Batch`] to the queue with a blocking send.
//!
//! ```text
//! ┌──────────── reader thread ────────────┐      ┌──── scheduler ────┐
//! │ MySqlBinlogClient → BinlogDecoder      │      │                   │
//! │   → normalize_rows → Batch ──send_blocking──▶ │ BatchReceiver     │
//! │   (column names: block_on(spawn(..))) ─┼─────▶│ ColumnCatalog     │
//! └────────────────────────────────────────┘      └───────────────────┘
//! ```
//!
//! There is no reconnect: any connection loss, decode failure or closed
//! queue ends the thread, and recovery is a restart from the checkpoint.

use crate::config::SourceConfig;
use crate::error::{Result, SyncError};
use crate::event::{Action, Batch, BinlogPosition};
use crate::events::ProgressNotifier;
use crate::mysql::{
    BinlogDecoder, BinlogEvent, MySqlBinlogClient, RowsEvent, ShutdownHandle, TableMapEvent,
};
use crate::normalizer::{normalize_rows, SchemaCache, SharedColumnCatalog};
use crate::queue::BatchSender;
use crate::credential::Credential;
use async_trait::async_trait;
use bytes::Bytes;
use mysql_async::prelude::Queryable;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

/// How the reader thread ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderExit {
    /// Asked to stop
    Stopped,
    /// Server closed the stream
    StreamEnded,
    /// Dispatcher side of the queue is gone
    QueueClosed,
    /// Connection, protocol or decode failure
    Failed(String),
}

impl ReaderExit {
    pub fn is_clean(&self) -> bool {
        matches!(self, ReaderExit::Stopped)
    }
}

impl std::fmt::Display for ReaderExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReaderExit::Stopped => write!(f, "stopped"),
            ReaderExit::StreamEnded => write!(f, "stream ended by server"),
            ReaderExit::QueueClosed => write!(f, "handoff queue closed"),
            ReaderExit::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Thread-side view of the stop controls.
#[derive(Clone)]
pub struct ReaderControl {
    stop: Arc<AtomicBool>,
    shutdown: Arc<Mutex<Option<ShutdownHandle>>>,
}

impl ReaderControl {
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Let [`ReaderHandle::stop`] abort a blocked read on this socket.
    pub fn register_socket(&self, handle: ShutdownHandle) {
        let mut slot = self.shutdown.lock();
        // stop() may have raced ahead of registration
        if self.is_stopped() {
            handle.shutdown();
        }
        *slot = Some(handle);
    }
}

/// Owner-side handle of a running reader thread.
pub struct ReaderHandle {
    control: ReaderControl,
    thread: Option<JoinHandle<()>>,
    exit: Option<oneshot::Receiver<ReaderExit>>,
}

impl ReaderHandle {
    /// Run `body` on a new named OS thread.
    pub fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce(ReaderControl) -> ReaderExit + Send + 'static,
    {
        let control = ReaderControl {
            stop: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Mutex::new(None)),
        };
        let (exit_tx, exit_rx) = oneshot::channel();

        let thread_control = control.clone();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let exit = body(thread_control);
                match &exit {
                    ReaderExit::Failed(reason) => error!("Reader exited: {}", reason),
                    other => info!("Reader exited: {}", other),
                }
                let _ = exit_tx.send(exit);
            })
            .map_err(|e| SyncError::other(format!("Failed to spawn reader thread: {}", e)))?;

        Ok(Self {
            control,
            thread: Some(thread),
            exit: Some(exit_rx),
        })
    }

    /// Ask the thread to stop and unblock any pending socket read.
    pub fn stop(&self) {
        self.control.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.control.shutdown.lock().as_ref() {
            handle.shutdown();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the thread's outcome for at most `timeout`. On timeout the
    /// thread is left detached.
    pub async fn join(mut self, timeout: Duration) -> Result<ReaderExit> {
        let Some(exit_rx) = self.exit.take() else {
            return Err(SyncError::invalid_state("reader already joined"));
        };

        let exit = match tokio::time::timeout(timeout, exit_rx).await {
            Ok(Ok(exit)) => exit,
            Ok(Err(_)) => ReaderExit::Failed("reader thread panicked".to_string()),
            Err(_) => {
                return Err(SyncError::timeout(format!(
                    "reader thread did not exit within {:?}",
                    timeout
                )))
            }
        };

        if let Some(thread) = self.thread.take() {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }
        Ok(exit)
    }
}

/// Something that produces batches on its own thread.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Position to stream from, given the stored checkpoint.
    async fn start_position(&self, stored: Option<BinlogPosition>) -> Result<BinlogPosition>;

    /// Start producing into `sender`. Called from within the runtime.
    fn spawn(
        self: Box<Self>,
        start: BinlogPosition,
        sender: BatchSender,
        notifier: ProgressNotifier,
    ) -> Result<ReaderHandle>;
}

/// Connection and filter settings for the binlog reader.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Credential,
    pub schema: String,
    pub tables: HashSet<String>,
    pub server_id: u32,
    pub heartbeat: Duration,
}

impl From<&SourceConfig> for ReaderConfig {
    fn from(source: &SourceConfig) -> Self {
        Self {
            host: source.host.clone(),
            port: source.port,
            user: source.user.clone(),
            password: source.password.clone(),
            schema: source.database.clone(),
            tables: source.tables.iter().cloned().collect(),
            server_id: source.server_id,
            heartbeat: source.heartbeat_interval(),
        }
    }
}

/// MySQL binlog reader.
pub struct StreamReader {
    config: ReaderConfig,
    catalog: SharedColumnCatalog,
    pool: mysql_async::Pool,
}

impl StreamReader {
    pub fn new(config: ReaderConfig, catalog: SharedColumnCatalog, pool: mysql_async::Pool) -> Self {
        Self {
            config,
            catalog,
            pool,
        }
    }
}

#[async_trait]
impl ChangeSource for StreamReader {
    async fn start_position(&self, stored: Option<BinlogPosition>) -> Result<BinlogPosition> {
        match stored {
            Some(pos) => {
                info!("Resuming from checkpoint {}", pos);
                Ok(pos)
            }
            None => {
                let pos = current_binlog_position(&self.pool).await?;
                info!("No checkpoint, starting at current position {}", pos);
                Ok(pos)
            }
        }
    }

    fn spawn(
        self: Box<Self>,
        start: BinlogPosition,
        sender: BatchSender,
        notifier: ProgressNotifier,
    ) -> Result<ReaderHandle> {
        let runtime = Handle::try_current()
            .map_err(|e| SyncError::invalid_state(format!("reader needs a runtime: {}", e)))?;
        let worker = ReaderWorker {
            config: self.config,
            catalog: self.catalog,
            runtime,
            sender,
            notifier,
            cache: SchemaCache::new(),
            current_file: start.file.clone(),
        };
        ReaderHandle::spawn("binlog-reader", move |control| worker.run(start, control))
    }
}

/// Serves a fixed list of batches, resuming after the stored position the
/// way the binlog reader would. Used for offline replays and tests.
pub struct ReplaySource {
    batches: Vec<Batch>,
    hold_open: bool,
}

impl ReplaySource {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self {
            batches,
            hold_open: false,
        }
    }

    /// Keep the reader alive after the last batch until it is stopped,
    /// like a caught-up binlog stream.
    pub fn hold_open(mut self, hold_open: bool) -> Self {
        self.hold_open = hold_open;
        self
    }
}

#[async_trait]
impl ChangeSource for ReplaySource {
    async fn start_position(&self, stored: Option<BinlogPosition>) -> Result<BinlogPosition> {
        Ok(stored.unwrap_or_else(|| {
            let file = self
                .batches
                .first()
                .map_or("binlog.000001", |b| b.position.file.as_str());
            BinlogPosition::new(file, 4)
        }))
    }

    fn spawn(
        self: Box<Self>,
        start: BinlogPosition,
        sender: BatchSender,
        notifier: ProgressNotifier,
    ) -> Result<ReaderHandle> {
        let ReplaySource { batches, hold_open } = *self;
        ReaderHandle::spawn("replay-reader", move |control| {
            notifier.reader_started(&start);
            let exit = replay(batches, &start, hold_open, &sender, &control);
            notifier.reader_stopped(&exit.to_string(), exit.is_clean());
            exit
        })
    }
}

fn replay(
    batches: Vec<Batch>,
    start: &BinlogPosition,
    hold_open: bool,
    sender: &BatchSender,
    control: &ReaderControl,
) -> ReaderExit {
    for batch in batches.into_iter().filter(|b| b.position > *start) {
        if control.is_stopped() {
            return ReaderExit::Stopped;
        }
        if sender.send_blocking(batch).is_err() {
            return ReaderExit::QueueClosed;
        }
    }
    if !hold_open {
        return ReaderExit::StreamEnded;
    }
    while !control.is_stopped() {
        if sender.is_closed() {
            return ReaderExit::QueueClosed;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    ReaderExit::Stopped
}

struct ReaderWorker {
    config: ReaderConfig,
    catalog: SharedColumnCatalog,
    runtime: Handle,
    sender: BatchSender,
    notifier: ProgressNotifier,
    cache: SchemaCache,
    current_file: String,
}

impl ReaderWorker {
    fn run(mut self, start: BinlogPosition, control: ReaderControl) -> ReaderExit {
        let exit = match self.stream(start, &control) {
            Ok(exit) => exit,
            Err(_) if control.is_stopped() => ReaderExit::Stopped,
            Err(e) => ReaderExit::Failed(e.to_string()),
        };
        self.notifier
            .reader_stopped(&exit.to_string(), exit.is_clean());
        exit
    }

    fn stream(&mut self, start: BinlogPosition, control: &ReaderControl) -> Result<ReaderExit> {
        let start_offset = u32::try_from(start.offset).map_err(|_| {
            SyncError::replication(format!("binlog offset {} out of range", start.offset))
        })?;
        let password = self
            .config
            .password
            .is_set()
            .then(|| self.config.password.expose_secret());

        let mut client = MySqlBinlogClient::connect(
            &self.config.host,
            self.config.port,
            &self.config.user,
            password,
        )
        .map_err(replication)?;
        control.register_socket(client.shutdown_handle().map_err(replication)?);
        if control.is_stopped() {
            return Ok(ReaderExit::Stopped);
        }

        client.negotiate_checksum().map_err(replication)?;
        client
            .set_heartbeat_period(self.config.heartbeat)
            .map_err(replication)?;
        // Two missed heartbeats means the connection died silently
        client
            .set_read_timeout(Some(self.config.heartbeat * 2))
            .map_err(replication)?;
        client
            .register_slave(self.config.server_id)
            .map_err(replication)?;

        let mut stream = client
            .binlog_dump(self.config.server_id, &start.file, start_offset)
            .map_err(replication)?;
        self.notifier.reader_started(&start);

        let mut decoder = BinlogDecoder::new();
        self.current_file = start.file.clone();

        loop {
            if control.is_stopped() {
                return Ok(ReaderExit::Stopped);
            }

            let data = match stream.next_event() {
                Ok(Some(data)) => data,
                Ok(None) => return Ok(ReaderExit::StreamEnded),
                Err(_) if control.is_stopped() => return Ok(ReaderExit::Stopped),
                Err(e) => return Err(replication(e)),
            };

            let Some(batch) = self.on_event(&mut decoder, &data)? else {
                continue;
            };

            debug!(
                "Handing off {} record(s) at {}",
                batch.len(),
                batch.position
            );
            if self.sender.send_blocking(batch).is_err() {
                return Ok(ReaderExit::QueueClosed);
            }
        }
    }

    /// Decode one raw event. Only rows events of watched tables yield a
    /// batch; everything else updates reader state or is ignored.
    fn on_event(&mut self, decoder: &mut BinlogDecoder, data: &Bytes) -> Result<Option<Batch>> {
        let (event, header) = decoder.decode(data).map_err(replication)?;

        let (action, rows) = match event {
            BinlogEvent::Rotate(rotate) => {
                info!(
                    "Rotating to binlog file {} at {}",
                    rotate.next_binlog, rotate.position
                );
                self.current_file = rotate.next_binlog;
                return Ok(None);
            }
            BinlogEvent::FormatDescription(fde) => {
                info!(
                    "Binlog format: version={}, server={}",
                    fde.binlog_version, fde.server_version
                );
                return Ok(None);
            }
            BinlogEvent::Query(query) => {
                if query.is_schema_change() {
                    debug!("DDL, dropping cached column names: {}", query.query);
                    self.cache.clear();
                }
                return Ok(None);
            }
            BinlogEvent::TableMap(table_map) => {
                trace!(
                    "Table map: {}.{} (table_id={})",
                    table_map.schema_name,
                    table_map.table_name,
                    table_map.table_id
                );
                return Ok(None);
            }
            BinlogEvent::Xid(xid) => {
                trace!("Commit xid={}", xid.xid);
                return Ok(None);
            }
            BinlogEvent::Heartbeat => {
                trace!("Heartbeat");
                return Ok(None);
            }
            BinlogEvent::Unknown(_) => return Ok(None),
            BinlogEvent::WriteRows(rows) => (Action::Insert, rows),
            BinlogEvent::UpdateRows(rows) => (Action::Update, rows),
            BinlogEvent::DeleteRows(rows) => (Action::Delete, rows),
        };

        let position = BinlogPosition::new(
            self.current_file.clone(),
            u64::from(header.next_position),
        );
        self.batch(action, &rows, decoder, position)
    }

    /// Normalize one rows event, or `None` if its table is filtered out.
    fn batch(
        &mut self,
        action: Action,
        rows: &RowsEvent,
        decoder: &BinlogDecoder,
        position: BinlogPosition,
    ) -> Result<Option<Batch>> {
        let Some(table_map) = decoder.get_table(rows.table_id) else {
            warn!(
                "No table map found for table_id={}, skipping rows event at {}",
                rows.table_id, position
            );
            self.notifier.record_skipped(
                &format!("table_id {}", rows.table_id),
                &position,
                "rows event without a table map",
            );
            return Ok(None);
        };

        if table_map.schema_name != self.config.schema
            || !self.config.tables.contains(&table_map.table_name)
        {
            return Ok(None);
        }

        let columns = self.column_names(table_map)?;
        let records = normalize_rows(action, rows, table_map, &columns, &position)?;
        if records.is_empty() {
            return Ok(None);
        }
        Ok(Some(Batch::new(records, position)))
    }

    fn column_names(&mut self, table_map: &TableMapEvent) -> Result<Vec<String>> {
        if let Some(names) = &table_map.column_names {
            return Ok(names.clone());
        }

        let schema = &table_map.schema_name;
        let table = &table_map.table_name;
        if let Some(names) = self.cache.get(schema, table, table_map.column_count) {
            return Ok(names.to_vec());
        }

        let catalog = self.catalog.clone();
        let (s, t) = (schema.clone(), table.clone());
        let names = self
            .runtime
            .block_on(self.runtime.spawn(async move { catalog.columns(&s, &t).await }))
            .map_err(|e| SyncError::other(format!("column lookup task failed: {}", e)))??;

        if names.len() != table_map.column_count {
            warn!(
                "{}.{}: catalog lists {} columns, binlog has {}",
                schema,
                table,
                names.len(),
                table_map.column_count
            );
            return Err(SyncError::replication(format!(
                "column count mismatch for {}.{}",
                schema, table
            )));
        }

        self.cache.insert(schema, table, names.clone());
        Ok(names)
    }
}

fn replication(e: anyhow::Error) -> SyncError {
    SyncError::replication(format!("{:#}", e))
}

/// Current write position of the server, via `SHOW BINARY LOG STATUS`
/// (MySQL 8.2+) with a fallback to `SHOW MASTER STATUS`.
pub async fn current_binlog_position(pool: &mysql_async::Pool) -> Result<BinlogPosition> {
    let mut conn = pool.get_conn().await?;

    let rows: Vec<mysql_async::Row> = match conn.query("SHOW BINARY LOG STATUS").await {
        Ok(rows) => rows,
        Err(_) => conn.query("SHOW MASTER STATUS").await?,
    };

    let Some(row) = rows.into_iter().next() else {
        return Err(SyncError::replication(
            "SHOW MASTER STATUS returned no rows; binary logging may be disabled",
        ));
    };

    let file: String = row.get(0).unwrap_or_default();
    let offset: u64 = row.get(1).unwrap_or(4);
    if file.is_empty() {
        return Err(SyncError::replication(
            "SHOW MASTER STATUS returned an empty file name",
        ));
    }
    Ok(BinlogPosition::new(file, offset))
}
