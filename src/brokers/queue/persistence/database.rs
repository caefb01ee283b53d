//! Database: durable id -> message map backed by an append-only log.
//!
//! - One `tokio::sync::Mutex` serializes every operation that touches the
//!   log or the index, so a torn write can only ever be the last record.
//! - Deletes append a tombstone and remember the id until the next shrink.
//! - Shrink rewrites the live records into `<file>.shrink` outside the lock,
//!   then appends whatever was written meanwhile and renames over the log.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use hashlink::LinkedHashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::record::{scan_frames, LogRecord};
use super::types::{DatabaseOptions, ErrorHint, ShrinkInfo, StoreErrorKind};
use crate::brokers::queue::message::Message;
use crate::error::StoreError;
use crate::utils::backup_stamp;

const REMOVE_FILE_ATTEMPTS: u32 = 5;
const REMOVE_FILE_RETRY_MS: u64 = 50;

struct DbInner {
    writer: Option<BufWriter<File>>,
    index: LinkedHashMap<String, Message>,
    /// Ids with a tombstone in the log that the next shrink will drop.
    deleted: Vec<String>,
    flush_needed: bool,
    /// Bumped by `clear`, lets an in-progress shrink notice the log was truncated.
    generation: u64,
}

pub struct Database {
    name: String,
    path: PathBuf,
    options: DatabaseOptions,
    inner: Mutex<DbInner>,
    shrink_lock: Mutex<()>,
    error_hint: Option<ErrorHint>,
    tasks: parking_lot::Mutex<Option<CancellationToken>>,
}

impl Database {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, options: DatabaseOptions) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            options,
            inner: Mutex::new(DbInner {
                writer: None,
                index: LinkedHashMap::new(),
                deleted: Vec::new(),
                flush_needed: false,
                generation: 0,
            }),
            shrink_lock: Mutex::new(()),
            error_hint: None,
            tasks: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_error_hint(mut self, hint: ErrorHint) -> Self {
        self.error_hint = Some(hint);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &DatabaseOptions {
        &self.options
    }

    fn shrink_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".shrink");
        PathBuf::from(name)
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{}.bak", backup_stamp()));
        PathBuf::from(name)
    }

    fn hint(&self, kind: StoreErrorKind, err: &StoreError) {
        error!("Database '{}': {} failed: {}", self.name, kind, err);
        if let Some(hint) = &self.error_hint {
            hint(kind, err);
        }
    }

    // ==========================================
    // LIFECYCLE
    // ==========================================

    /// Replays the log into the index, truncates a torn tail and opens the
    /// file for appending. A replay that saw tombstones is followed by a shrink.
    pub async fn open(self: &Arc<Self>) -> Result<(), StoreError> {
        let pending_deletes = {
            let mut inner = self.inner.lock().await;
            if inner.writer.is_some() {
                return Ok(());
            }

            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }

            inner.index.clear();
            inner.deleted.clear();

            if self.path.exists() {
                let data = fs::read(&self.path)?;
                let scan = scan_frames(&data);

                for content in &scan.frames {
                    match LogRecord::decode(content) {
                        Ok(LogRecord::Insert { id, payload }) => {
                            match serde_json::from_slice::<Message>(&payload) {
                                Ok(message) => {
                                    if inner.index.insert(id.clone(), message).is_some() {
                                        warn!("Database '{}': live id '{}' inserted twice, keeping the latest", self.name, id);
                                    }
                                }
                                Err(e) => warn!("Database '{}': skipping undecodable message '{}': {}", self.name, id, e),
                            }
                        }
                        Ok(LogRecord::Delete { id }) => {
                            inner.index.remove(&id);
                            inner.deleted.push(id);
                        }
                        Err(e) => warn!("Database '{}': skipping record: {}", self.name, e),
                    }
                }

                if scan.torn {
                    warn!(
                        "Database '{}': torn tail detected, truncating {} -> {} bytes",
                        self.name,
                        data.len(),
                        scan.valid_len
                    );
                    let file = OpenOptions::new().write(true).open(&self.path)?;
                    file.set_len(scan.valid_len)?;
                    file.sync_all()?;
                }
            }

            let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            inner.writer = Some(BufWriter::new(file));
            inner.flush_needed = false;

            info!(
                "Database '{}': opened with {} live messages ({} tombstones)",
                self.name,
                inner.index.len(),
                inner.deleted.len()
            );
            !inner.deleted.is_empty()
        };

        if pending_deletes {
            let info = self.shrink().await;
            if !info.successful {
                let err = StoreError::Corrupt(info.error.unwrap_or_default());
                self.hint(StoreErrorKind::ShrinkAfterLoad, &err);
            }
        }

        self.start_tasks();
        Ok(())
    }

    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.writer.is_some()
    }

    /// Stops background tasks, runs a final shrink, flushes and releases the file.
    pub async fn close(&self) -> Result<(), StoreError> {
        self.stop_tasks();

        if !self.is_open().await {
            return Ok(());
        }

        let info = self.shrink().await;
        if !info.successful {
            debug!("Database '{}': final shrink skipped: {:?}", self.name, info.error);
        }

        let mut inner = self.inner.lock().await;
        if let Some(mut writer) = inner.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        inner.index.clear();
        inner.deleted.clear();
        inner.flush_needed = false;
        info!("Database '{}': closed", self.name);
        Ok(())
    }

    /// Closes the store and deletes its file, retrying briefly on transient failures.
    /// Shrink backups (`<file>.<stamp>.bak`) are left on disk for the operator.
    pub async fn remove_database(&self) -> Result<(), StoreError> {
        if let Err(e) = self.close().await {
            warn!("Database '{}': close before removal failed: {}", self.name, e);
        }

        match fs::remove_file(self.shrink_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Database '{}': cannot remove leftover shrink file: {}", self.name, e),
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match fs::remove_file(&self.path) {
                Ok(()) => {
                    info!("Database '{}': removed {:?}", self.name, self.path);
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) if attempt < REMOVE_FILE_ATTEMPTS => {
                    debug!("Database '{}': remove attempt {} failed: {}", self.name, attempt, e);
                    tokio::time::sleep(Duration::from_millis(REMOVE_FILE_RETRY_MS)).await;
                }
                Err(e) => {
                    let err = StoreError::Io(e);
                    self.hint(StoreErrorKind::DeleteFile, &err);
                    return Err(err);
                }
            }
        }
    }

    // ==========================================
    // MUTATIONS
    // ==========================================

    /// Appends an Insert record. A live id is rejected with `Duplicate` and nothing is written.
    pub async fn insert(&self, message: &Message) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.writer.is_none() {
            return Err(StoreError::Closed);
        }
        if inner.index.contains_key(&message.id) {
            return Err(StoreError::Duplicate(message.id.clone()));
        }
        if message.id.len() > u16::MAX as usize {
            return Err(StoreError::Corrupt(format!("message id of {} bytes is too long", message.id.len())));
        }

        let payload = serde_json::to_vec(message)?;
        let record = LogRecord::Insert { id: message.id.clone(), payload }.encode();

        if let Err(e) = self.append(&mut inner, &record) {
            self.hint(StoreErrorKind::Insert, &e);
            return Err(e);
        }

        inner.index.insert(message.id.clone(), message.clone());
        Ok(())
    }

    /// Appends a Delete record. Returns `false` when the id is not live.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.writer.is_none() {
            return Err(StoreError::Closed);
        }
        if !inner.index.contains_key(id) {
            return Ok(false);
        }

        let record = LogRecord::Delete { id: id.to_string() }.encode();
        if let Err(e) = self.append(&mut inner, &record) {
            self.hint(StoreErrorKind::Delete, &e);
            return Err(e);
        }

        inner.index.remove(id);
        inner.deleted.push(id.to_string());
        Ok(true)
    }

    /// Truncates the log and empties the index.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.writer.is_none() {
            return Err(StoreError::Closed);
        }

        // Buffered bytes are about to be discarded with the file content.
        inner.writer = None;
        let file = OpenOptions::new().write(true).truncate(true).open(&self.path)?;
        file.sync_all()?;
        drop(file);

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        inner.writer = Some(BufWriter::new(file));
        inner.index.clear();
        inner.deleted.clear();
        inner.flush_needed = false;
        inner.generation += 1;
        info!("Database '{}': cleared", self.name);
        Ok(())
    }

    fn append(&self, inner: &mut DbInner, record: &[u8]) -> Result<(), StoreError> {
        let writer = inner.writer.as_mut().ok_or(StoreError::Closed)?;
        writer.write_all(record)?;
        if self.options.instant_flush {
            writer.flush()?;
            writer.get_ref().sync_data()?;
            inner.flush_needed = false;
        } else {
            inner.flush_needed = true;
        }
        Ok(())
    }

    /// Drains buffered records to disk.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.flush_needed {
            return Ok(());
        }
        if let Some(writer) = inner.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        inner.flush_needed = false;
        Ok(())
    }

    // ==========================================
    // READS
    // ==========================================

    /// Live messages in insertion order.
    pub async fn list(&self) -> Vec<Message> {
        self.inner.lock().await.index.values().cloned().collect()
    }

    pub async fn get(&self, id: &str) -> Option<Message> {
        self.inner.lock().await.index.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.lock().await.index.contains_key(id)
    }

    pub async fn message_count(&self) -> usize {
        self.inner.lock().await.index.len()
    }

    pub async fn pending_deletes(&self) -> usize {
        self.inner.lock().await.deleted.len()
    }

    pub fn file_size(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    // ==========================================
    // SHRINK
    // ==========================================

    pub async fn shrink(&self) -> ShrinkInfo {
        let _shrinking = self.shrink_lock.lock().await;
        let mut info = ShrinkInfo::default();

        // 1. Prepare: snapshot the tombstones and the log length under the lock
        let started = Instant::now();
        let (deleted, snapshot_len, generation) = {
            let mut inner = self.inner.lock().await;
            let Some(writer) = inner.writer.as_mut() else {
                return ShrinkInfo::failed(StoreError::Closed.to_string());
            };
            if let Err(e) = writer.flush() {
                let err = StoreError::Io(e);
                self.hint(StoreErrorKind::Shrink, &err);
                return ShrinkInfo::failed(err.to_string());
            }
            let size = self.file_size();
            if inner.deleted.is_empty() {
                info.successful = true;
                info.old_size = size;
                info.new_size = size;
                info.prepare_duration = started.elapsed();
                return info;
            }
            (std::mem::take(&mut inner.deleted), size, inner.generation)
        };
        info.old_size = snapshot_len;
        info.prepare_duration = started.elapsed();

        // 2. Truncate: rebuild the live set from the snapshot without holding the lock
        let started = Instant::now();
        let tmp_path = self.shrink_path();
        if let Err(e) = self.write_compacted(&tmp_path, snapshot_len) {
            self.hint(StoreErrorKind::Shrink, &e);
            let _ = fs::remove_file(&tmp_path);
            self.restore_deleted(deleted, generation).await;
            info.error = Some(e.to_string());
            return info;
        }
        info.truncate_duration = started.elapsed();

        // 3. Sync: append the tail written meanwhile and swap files
        let started = Instant::now();
        let mut inner = self.inner.lock().await;
        if inner.generation != generation || inner.writer.is_none() {
            let _ = fs::remove_file(&tmp_path);
            info.error = Some("store was cleared or closed during shrink".into());
            return info;
        }

        if let Err(e) = self.sync_shrink_files(&mut inner, &tmp_path, snapshot_len) {
            self.hint(StoreErrorKind::SyncShrinkFiles, &e);
            let _ = fs::remove_file(&tmp_path);
            if inner.writer.is_none() {
                match OpenOptions::new().create(true).append(true).open(&self.path) {
                    Ok(file) => inner.writer = Some(BufWriter::new(file)),
                    Err(e) => error!("Database '{}': cannot reopen log after failed shrink: {}", self.name, e),
                }
            }
            let mut restored = deleted;
            restored.append(&mut inner.deleted);
            inner.deleted = restored;
            info.error = Some(e.to_string());
            return info;
        }

        info.sync_duration = started.elapsed();
        info.new_size = self.file_size();
        info.successful = true;
        debug!(
            "Database '{}': shrink {} -> {} bytes in {:?}",
            self.name,
            info.old_size,
            info.new_size,
            info.total_duration()
        );
        info
    }

    fn write_compacted(&self, tmp_path: &Path, snapshot_len: u64) -> Result<(), StoreError> {
        let data = fs::read(&self.path)?;
        let end = (snapshot_len as usize).min(data.len());
        let scan = scan_frames(&data[..end]);

        let mut live: LinkedHashMap<String, Vec<u8>> = LinkedHashMap::new();
        for content in scan.frames {
            match LogRecord::decode(content)? {
                LogRecord::Insert { id, payload } => {
                    live.insert(id, payload);
                }
                LogRecord::Delete { id } => {
                    live.remove(&id);
                }
            }
        }

        let mut out = BufWriter::new(File::create(tmp_path)?);
        for (id, payload) in live {
            out.write_all(&LogRecord::Insert { id, payload }.encode())?;
        }
        out.flush()?;
        out.get_ref().sync_all()?;
        Ok(())
    }

    fn sync_shrink_files(&self, inner: &mut DbInner, tmp_path: &Path, snapshot_len: u64) -> Result<(), StoreError> {
        if let Some(writer) = inner.writer.as_mut() {
            writer.flush()?;
        }

        let current = fs::read(&self.path)?;
        if (current.len() as u64) < snapshot_len {
            return Err(StoreError::Corrupt("log shrank underneath compaction".into()));
        }
        let tail = &current[snapshot_len as usize..];
        if !tail.is_empty() {
            let mut tmp = OpenOptions::new().append(true).open(tmp_path)?;
            tmp.write_all(tail)?;
            tmp.sync_all()?;
        }

        if self.options.create_backup_on_shrink {
            let backup = self.backup_path();
            if let Err(e) = fs::copy(&self.path, &backup) {
                self.hint(StoreErrorKind::Backup, &StoreError::Io(e));
            }
        }

        inner.writer = None;
        fs::rename(tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        inner.writer = Some(BufWriter::new(file));
        inner.flush_needed = false;
        Ok(())
    }

    async fn restore_deleted(&self, deleted: Vec<String>, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return;
        }
        let mut restored = deleted;
        restored.append(&mut inner.deleted);
        inner.deleted = restored;
    }

    // ==========================================
    // BACKGROUND TASKS
    // ==========================================

    fn start_tasks(self: &Arc<Self>) {
        let token = CancellationToken::new();
        if let Some(previous) = self.tasks.lock().replace(token.clone()) {
            previous.cancel();
        }

        if self.options.auto_flush && !self.options.instant_flush && self.options.flush_interval_ms > 0 {
            let weak = Arc::downgrade(self);
            let token = token.clone();
            let period = Duration::from_millis(self.options.flush_interval_ms);
            tokio::spawn(async move {
                run_periodic(weak, token, period, |db| async move {
                    if let Err(e) = db.flush().await {
                        warn!("Database '{}': periodic flush failed: {}", db.name, e);
                    }
                })
                .await;
            });
        }

        if self.options.auto_shrink && self.options.shrink_interval_ms > 0 {
            let weak = Arc::downgrade(self);
            let period = Duration::from_millis(self.options.shrink_interval_ms);
            tokio::spawn(async move {
                run_periodic(weak, token, period, |db| async move {
                    let info = db.shrink().await;
                    if !info.successful {
                        debug!("Database '{}': periodic shrink failed: {:?}", db.name, info.error);
                    }
                })
                .await;
            });
        }
    }

    fn stop_tasks(&self) {
        if let Some(token) = self.tasks.lock().take() {
            token.cancel();
        }
    }
}

async fn run_periodic<F, Fut>(weak: Weak<Database>, token: CancellationToken, period: Duration, mut job: F)
where
    F: FnMut(Arc<Database>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let Some(db) = weak.upgrade() else { break };
                job(db).await;
            }
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Some(token) = self.tasks.get_mut().take() {
            token.cancel();
        }
    }
}
