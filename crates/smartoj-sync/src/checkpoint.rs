//! # Binlog checkpointing
//!
//! Persists the position after the last fully dispatched batch so a restart
//! resumes there.
//!
//! The stored form is `{"log_file": "...", "log_pos": N}` under the key
//! `binlog_position`.
//!
//! ```ignore
//! let store = FilePositionStore::new("/var/lib/smartoj-sync", CHECKPOINT_KEY).await?;
//! if let Some(pos) = store.load().await? {
//!     // resume from pos
//! }
//! store.save(&batch.position).await?;
//! ```

use crate::error::{Result, SyncError};
use crate::event::BinlogPosition;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Fixed key the position is stored under.
pub const CHECKPOINT_KEY: &str = "binlog_position";

/// Persisted checkpoint document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub log_file: String,
    pub log_pos: u64,
}

impl From<&BinlogPosition> for Checkpoint {
    fn from(pos: &BinlogPosition) -> Self {
        Self {
            log_file: pos.file.clone(),
            log_pos: pos.offset,
        }
    }
}

impl From<Checkpoint> for BinlogPosition {
    fn from(cp: Checkpoint) -> Self {
        BinlogPosition::new(cp.log_file, cp.log_pos)
    }
}

/// Keys become file names, so only `[A-Za-z0-9_-]` is accepted.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(SyncError::checkpoint(format!(
            "Invalid checkpoint key '{}'",
            key
        )));
    }
    Ok(())
}

/// Storage for the resume position.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Last saved position, if any.
    async fn load(&self) -> Result<Option<BinlogPosition>>;

    /// Durably replace the saved position.
    async fn save(&self, position: &BinlogPosition) -> Result<()>;

    /// Forget the saved position.
    async fn clear(&self) -> Result<()>;
}

/// Shared position store.
pub type SharedPositionStore = Arc<dyn PositionStore>;

/// JSON file per key, written atomically (temp file, fsync, rename).
pub struct FilePositionStore {
    dir: PathBuf,
    key: String,
}

impl FilePositionStore {
    /// Create the store, creating `dir` if needed.
    pub async fn new(dir: impl AsRef<Path>, key: &str) -> Result<Self> {
        validate_key(key)?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await.map_err(|e| {
            SyncError::checkpoint(format!(
                "Failed to create checkpoint directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        Ok(Self {
            dir,
            key: key.to_string(),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.key))
    }
}

#[async_trait]
impl PositionStore for FilePositionStore {
    async fn load(&self) -> Result<Option<BinlogPosition>> {
        let path = self.path();
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SyncError::checkpoint(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let checkpoint: Checkpoint = serde_json::from_str(&contents).map_err(|e| {
            SyncError::checkpoint(format!("Corrupt checkpoint {}: {}", path.display(), e))
        })?;

        debug!(
            "Loaded checkpoint {}:{}",
            checkpoint.log_file, checkpoint.log_pos
        );
        Ok(Some(checkpoint.into()))
    }

    async fn save(&self, position: &BinlogPosition) -> Result<()> {
        let path = self.path();
        let temp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec(&Checkpoint::from(position))?;

        let write = async {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .await?;
            file.write_all(&json).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, &path).await
        };
        write.await.map_err(|e| {
            SyncError::checkpoint(format!("Failed to write {}: {}", path.display(), e))
        })?;

        debug!("Saved checkpoint {}", position);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let path = self.path();
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Removed checkpoint {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::checkpoint(format!(
                "Failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    position: Mutex<Option<BinlogPosition>>,
    saves: AtomicU64,
    fail_saves: AtomicBool,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a position.
    pub fn with_position(position: BinlogPosition) -> Self {
        Self {
            position: Mutex::new(Some(position)),
            ..Self::default()
        }
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    pub fn current(&self) -> Option<BinlogPosition> {
        self.position.lock().clone()
    }

    /// Make every subsequent save fail.
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn load(&self) -> Result<Option<BinlogPosition>> {
        Ok(self.position.lock().clone())
    }

    async fn save(&self, position: &BinlogPosition) -> Result<()> {
        if self.fail_saves.load(Ordering::Relaxed) {
            return Err(SyncError::checkpoint("injected save failure"));
        }
        *self.position.lock() = Some(position.clone());
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.position.lock() = None;
        Ok(())
    }
}
