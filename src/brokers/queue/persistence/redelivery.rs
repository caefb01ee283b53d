//! Redelivery tracker: id -> attempt count, kept in its own append-only file
//! so delivery counters survive a restart.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::record::{scan_frames, DeliveryRecord};
use crate::error::StoreError;

/// Rewrite the file once dead records outnumber live ones by this factor.
const COMPACT_RATIO: usize = 4;
const COMPACT_MIN_RECORDS: usize = 1024;

#[derive(Default)]
struct TrackerInner {
    writer: Option<BufWriter<File>>,
    counts: HashMap<String, u32>,
    records: usize,
}

pub struct RedeliveryTracker {
    name: String,
    path: PathBuf,
    inner: Mutex<TrackerInner>,
}

impl RedeliveryTracker {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            inner: Mutex::new(TrackerInner::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.writer.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        inner.counts.clear();
        inner.records = 0;

        if self.path.exists() {
            let data = fs::read(&self.path)?;
            let scan = scan_frames(&data);
            for content in &scan.frames {
                match DeliveryRecord::decode(content) {
                    Ok(DeliveryRecord::Set { id, count }) => {
                        inner.counts.insert(id, count);
                    }
                    Ok(DeliveryRecord::Remove { id }) => {
                        inner.counts.remove(&id);
                    }
                    Err(e) => warn!("Tracker '{}': skipping record: {}", self.name, e),
                }
            }
            inner.records = scan.frames.len();
            if scan.torn {
                warn!("Tracker '{}': torn tail, truncating to {} bytes", self.name, scan.valid_len);
                let file = OpenOptions::new().write(true).open(&self.path)?;
                file.set_len(scan.valid_len)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        inner.writer = Some(BufWriter::new(file));
        info!("Tracker '{}': loaded {} delivery counters", self.name, inner.counts.len());
        Ok(())
    }

    pub async fn get(&self, id: &str) -> u32 {
        self.inner.lock().await.counts.get(id).copied().unwrap_or(0)
    }

    pub async fn all(&self) -> HashMap<String, u32> {
        self.inner.lock().await.counts.clone()
    }

    pub async fn set(&self, id: &str, count: u32) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        self.write(&mut inner, DeliveryRecord::Set { id: id.to_string(), count })?;
        inner.counts.insert(id.to_string(), count);
        self.maybe_compact(&mut inner)
    }

    /// Increments and persists the counter, returning the new value.
    pub async fn increment(&self, id: &str) -> Result<u32, StoreError> {
        let mut inner = self.inner.lock().await;
        let count = inner.counts.get(id).copied().unwrap_or(0).saturating_add(1);
        self.write(&mut inner, DeliveryRecord::Set { id: id.to_string(), count })?;
        inner.counts.insert(id.to_string(), count);
        self.maybe_compact(&mut inner)?;
        Ok(count)
    }

    pub async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.counts.remove(id).is_none() {
            return Ok(());
        }
        self.write(&mut inner, DeliveryRecord::Remove { id: id.to_string() })?;
        self.maybe_compact(&mut inner)
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.writer.is_none() {
            return Err(StoreError::Closed);
        }
        inner.writer = None;
        let file = OpenOptions::new().create(true).write(true).truncate(true).open(&self.path)?;
        drop(file);
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        inner.writer = Some(BufWriter::new(file));
        inner.counts.clear();
        inner.records = 0;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(mut writer) = inner.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        inner.counts.clear();
        inner.records = 0;
        Ok(())
    }

    pub async fn remove_file(&self) -> Result<(), StoreError> {
        self.close().await?;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, inner: &mut TrackerInner, record: DeliveryRecord) -> Result<(), StoreError> {
        let writer = inner.writer.as_mut().ok_or(StoreError::Closed)?;
        writer.write_all(&record.encode())?;
        writer.flush()?;
        inner.records += 1;
        Ok(())
    }

    fn maybe_compact(&self, inner: &mut TrackerInner) -> Result<(), StoreError> {
        if inner.records <= COMPACT_MIN_RECORDS || inner.records <= inner.counts.len() * COMPACT_RATIO {
            return Ok(());
        }

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".compact");
        let tmp_path = PathBuf::from(tmp_name);

        let mut out = BufWriter::new(File::create(&tmp_path)?);
        for (id, count) in &inner.counts {
            out.write_all(&DeliveryRecord::Set { id: id.clone(), count: *count }.encode())?;
        }
        out.flush()?;
        out.get_ref().sync_all()?;
        drop(out);

        inner.writer = None;
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        inner.writer = Some(BufWriter::new(file));

        debug!("Tracker '{}': compacted {} records -> {}", self.name, inner.records, inner.counts.len());
        inner.records = inner.counts.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_counts_survive_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("q.delivery");

        let tracker = RedeliveryTracker::new("q", &path);
        tracker.load().await.unwrap();
        assert_eq!(tracker.increment("m1").await.unwrap(), 1);
        assert_eq!(tracker.increment("m1").await.unwrap(), 2);
        tracker.set("m2", 7).await.unwrap();
        tracker.remove("m2").await.unwrap();
        tracker.close().await.unwrap();

        let reloaded = RedeliveryTracker::new("q", &path);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.get("m1").await, 2);
        assert_eq!(reloaded.get("m2").await, 0);
    }

    #[tokio::test]
    async fn test_compaction_keeps_live_counts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("q.delivery");

        let tracker = RedeliveryTracker::new("q", &path);
        tracker.load().await.unwrap();
        for _ in 0..(COMPACT_MIN_RECORDS + 10) {
            tracker.increment("hot").await.unwrap();
        }
        let size = fs::metadata(&path).unwrap().len();
        // One id rewritten over a thousand times compacts down to a handful of records
        assert!(size < 200, "file not compacted: {} bytes", size);
        tracker.close().await.unwrap();

        let reloaded = RedeliveryTracker::new("q", &path);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.get("hot").await, (COMPACT_MIN_RECORDS + 10) as u32);
    }
}
