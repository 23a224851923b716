//! Append-only on-disk store
//!
//! Every applied write is appended to a single log file as a framed record:
//! - size (u64, big endian)
//! - checksum (u32, CRC32 of the data)
//! - data (bincode-encoded record, JSON payload)
//!
//! The full key space is indexed in memory and rebuilt by replaying the log
//! on open. A torn or corrupted tail is truncated away. Each batch is written
//! with a single buffered write and at most one fsync (group commit). A batch
//! whose write, flush or fsync fails is cut back off the file before the error
//! is returned, so a retry appends on a clean boundary and a failed batch
//! never reappears on replay.

use super::{BatchResults, StoreAdapter, StoreError, StoreResult, Timed};
use crate::core::{Value, WriteOp};
use crate::registry::CompiledFilter;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const LOG_FILE: &str = "strata.log";
const COMPACT_FILE: &str = "strata.log.compact";
const FRAME_HEADER: usize = 12;
const WRITE_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogRecord {
    seq: u64,
    timestamp_ms: i64,
    op: LogOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum LogOp {
    Upsert { key: String, payload: Vec<u8> },
    Delete { key: String },
}

/// Result of replaying a log file
struct Replay {
    index: HashMap<String, Value>,
    next_seq: u64,
    valid_len: u64,
    records: u64,
}

/// Append handle plus the length of the file up to the last committed batch
struct LogWriter {
    out: BufWriter<File>,
    committed: u64,
    /// A failed append may have left bytes past `committed`
    dirty: bool,
    /// Next append writes only this many bytes, then fails
    #[cfg(test)]
    torn_write: Option<usize>,
}

impl LogWriter {
    async fn open(path: &Path) -> StoreResult<Self> {
        let file = OpenOptions::new().append(true).open(path).await?;
        let committed = file.metadata().await?.len();
        Ok(Self {
            out: BufWriter::with_capacity(WRITE_BUFFER, file),
            committed,
            dirty: false,
            #[cfg(test)]
            torn_write: None,
        })
    }

    async fn append(&mut self, data: &[u8], fsync: bool) -> StoreResult<()> {
        #[cfg(test)]
        if let Some(cut) = self.torn_write.take() {
            self.out.write_all(&data[..cut.min(data.len())]).await?;
            self.out.flush().await?;
            return Err(StoreError::Io("short write".to_string()));
        }
        self.out.write_all(data).await?;
        self.out.flush().await?;
        if fsync {
            self.out.get_ref().sync_all().await?;
        }
        self.committed += data.len() as u64;
        Ok(())
    }

    /// Cut the file back to the committed length and reopen the handle.
    /// Bytes still sitting in the old buffer are discarded with it.
    async fn rollback(&mut self, path: &Path) -> StoreResult<()> {
        let file = OpenOptions::new().write(true).open(path).await?;
        let len = file.metadata().await?.len();
        if len > self.committed {
            warn!(
                "Discarding {} bytes of a failed append to {:?}",
                len - self.committed,
                path
            );
            file.set_len(self.committed).await?;
            file.sync_all().await?;
        }
        drop(file);

        *self = Self::open(path).await?;
        Ok(())
    }
}

pub struct LogStore {
    path: PathBuf,
    writer: Mutex<LogWriter>,
    index: RwLock<HashMap<String, Value>>,
    next_seq: AtomicU64,
    fsync: bool,
}

impl LogStore {
    /// Open (or create) the log in `dir` and rebuild the index
    pub async fn open(dir: impl AsRef<Path>, fsync: bool) -> StoreResult<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(LOG_FILE);

        let replay = if tokio::fs::try_exists(&path).await? {
            Self::replay(&path).await?
        } else {
            Replay {
                index: HashMap::new(),
                next_seq: 0,
                valid_len: 0,
                records: 0,
            }
        };

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;
        let current_len = file.metadata().await?.len();
        if current_len > replay.valid_len {
            warn!(
                "Truncating {} trailing bytes of damaged log {:?}",
                current_len - replay.valid_len,
                path
            );
            file.set_len(replay.valid_len).await?;
        }
        drop(file);

        let writer = LogWriter::open(&path).await?;

        info!(
            "Log store opened at {:?}: {} records replayed, {} live keys",
            path,
            replay.records,
            replay.index.len()
        );

        Ok(Self {
            path,
            writer: Mutex::new(writer),
            index: RwLock::new(replay.index),
            next_seq: AtomicU64::new(replay.next_seq),
            fsync,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite the log so it holds one record per live key.
    /// Returns the number of records written.
    pub async fn compact(&self) -> StoreResult<usize> {
        let mut writer = self.writer.lock().await;
        if writer.dirty {
            writer.rollback(&self.path).await?;
        }

        let snapshot: Vec<(String, Value)> = self
            .index
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut buffer = Vec::new();
        for (key, value) in &snapshot {
            let record = self.record(WriteOp::Upsert {
                key: key.clone(),
                value: value.clone(),
            })?;
            Self::frame(&record, &mut buffer)?;
        }

        let tmp = self.path.with_file_name(COMPACT_FILE);
        let mut file = File::create(&tmp).await?;
        file.write_all(&buffer).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await?;

        *writer = LogWriter::open(&self.path).await?;

        info!("Log store compacted to {} records", snapshot.len());
        Ok(snapshot.len())
    }

    async fn replay(path: &Path) -> StoreResult<Replay> {
        let data = tokio::fs::read(path).await?;
        let mut index = HashMap::new();
        let mut next_seq = 0u64;
        let mut offset = 0usize;
        let mut records = 0u64;

        while offset + FRAME_HEADER <= data.len() {
            let mut size_bytes = [0u8; 8];
            size_bytes.copy_from_slice(&data[offset..offset + 8]);
            let mut crc_bytes = [0u8; 4];
            crc_bytes.copy_from_slice(&data[offset + 8..offset + FRAME_HEADER]);
            let size = u64::from_be_bytes(size_bytes) as usize;
            let checksum = u32::from_be_bytes(crc_bytes);

            let start = offset + FRAME_HEADER;
            let Some(end) = start.checked_add(size).filter(|end| *end <= data.len()) else {
                warn!("Incomplete log record at offset {}, stopping replay", offset);
                break;
            };
            let body = &data[start..end];
            if crc32fast::hash(body) != checksum {
                warn!("Log checksum mismatch at offset {}, stopping replay", offset);
                break;
            }

            let record: LogRecord =
                match bincode::serde::decode_from_slice(body, bincode::config::standard()) {
                    Ok((record, _)) => record,
                    Err(e) => {
                        warn!("Log record at offset {} failed to decode: {}", offset, e);
                        break;
                    }
                };

            match record.op {
                LogOp::Upsert { key, payload } => {
                    let value: Value = serde_json::from_slice(&payload)
                        .map_err(|e| StoreError::Corrupted(e.to_string()))?;
                    index.insert(key, value);
                }
                LogOp::Delete { key } => {
                    index.remove(&key);
                }
            }
            next_seq = next_seq.max(record.seq + 1);
            records += 1;
            offset = end;
        }

        debug!("Replayed {} log records from {:?}", records, path);
        Ok(Replay {
            index,
            next_seq,
            valid_len: offset as u64,
            records,
        })
    }

    fn record(&self, op: WriteOp) -> StoreResult<LogRecord> {
        let op = match op {
            WriteOp::Upsert { key, value } => LogOp::Upsert {
                key,
                payload: serde_json::to_vec(&value)
                    .map_err(|e| StoreError::Rejected(e.to_string()))?,
            },
            WriteOp::Delete { key } => LogOp::Delete { key },
        };
        Ok(LogRecord {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            op,
        })
    }

    fn frame(record: &LogRecord, buffer: &mut Vec<u8>) -> StoreResult<()> {
        let data = bincode::serde::encode_to_vec(record, bincode::config::standard())
            .map_err(|e| StoreError::Rejected(e.to_string()))?;
        let checksum = crc32fast::hash(&data);
        buffer.extend_from_slice(&(data.len() as u64).to_be_bytes());
        buffer.extend_from_slice(&checksum.to_be_bytes());
        buffer.extend_from_slice(&data);
        Ok(())
    }
}

#[async_trait]
impl StoreAdapter for LogStore {
    async fn read_one(&self, key: &str) -> StoreResult<Timed<Option<Value>>> {
        let started = Instant::now();
        let value = self.index.read().get(key).cloned();
        Ok(Timed::since(started, value))
    }

    async fn read_many(&self, keys: &[String]) -> StoreResult<Timed<HashMap<String, Value>>> {
        let started = Instant::now();
        let index = self.index.read();
        let found = keys
            .iter()
            .filter_map(|key| index.get(key).map(|value| (key.clone(), value.clone())))
            .collect();
        Ok(Timed::since(started, found))
    }

    async fn write_batch(&self, ops: &[WriteOp]) -> StoreResult<Timed<BatchResults>> {
        let started = Instant::now();
        let mut writer = self.writer.lock().await;

        let mut buffer = Vec::new();
        let mut results: BatchResults = Vec::with_capacity(ops.len());
        for op in ops {
            let framed = self
                .record(op.clone())
                .and_then(|record| Self::frame(&record, &mut buffer));
            results.push(framed);
        }

        if writer.dirty {
            writer.rollback(&self.path).await?;
        }
        if let Err(e) = writer.append(&buffer, self.fsync).await {
            warn!("Log append of {} ops failed: {}", ops.len(), e);
            writer.dirty = true;
            if let Err(rollback) = writer.rollback(&self.path).await {
                warn!("Log rollback failed, retrying before the next append: {}", rollback);
            }
            return Err(e);
        }
        drop(writer);

        {
            let mut index = self.index.write();
            for (op, result) in ops.iter().zip(&results) {
                if result.is_err() {
                    continue;
                }
                match op {
                    WriteOp::Upsert { key, value } => {
                        index.insert(key.clone(), value.clone());
                    }
                    WriteOp::Delete { key } => {
                        index.remove(key);
                    }
                }
            }
        }

        debug!("Log store committed {} ops ({} bytes)", ops.len(), buffer.len());
        Ok(Timed::since(started, results))
    }

    async fn query(&self, filter: &CompiledFilter) -> StoreResult<Timed<Vec<(String, Value)>>> {
        let started = Instant::now();
        let index = self.index.read();
        let mut rows: Vec<(String, Value)> = index
            .iter()
            .filter(|(key, value)| filter.matches_key(key) && filter.matches(value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        drop(index);
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some(limit) = filter.limit() {
            rows.truncate(limit);
        }
        Ok(Timed::since(started, rows))
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn upsert(key: &str, value: Value) -> WriteOp {
        WriteOp::Upsert {
            key: key.to_string(),
            value,
        }
    }

    #[tokio::test]
    async fn test_write_and_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = LogStore::open(dir.path(), true).await.unwrap();
            store
                .write_batch(&[
                    upsert("user:1", json!({"name": "ana"})),
                    upsert("user:2", json!({"name": "bo"})),
                    WriteOp::Delete {
                        key: "user:2".into(),
                    },
                ])
                .await
                .unwrap();
            store
                .write_batch(&[upsert("user:1", json!({"name": "ana2"}))])
                .await
                .unwrap();
        }

        let store = LogStore::open(dir.path(), true).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.read_one("user:1").await.unwrap().value,
            Some(json!({"name": "ana2"}))
        );
        assert_eq!(store.read_one("user:2").await.unwrap().value, None);
    }

    #[tokio::test]
    async fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = {
            let store = LogStore::open(dir.path(), false).await.unwrap();
            store
                .write_batch(&[upsert("k", json!(1))])
                .await
                .unwrap();
            store.path().to_path_buf()
        };

        // half-written frame
        let mut data = std::fs::read(&path).unwrap();
        let valid = data.len();
        data.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 99, 1, 2]);
        std::fs::write(&path, &data).unwrap();

        let store = LogStore::open(dir.path(), false).await.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), valid as u64);
        assert_eq!(store.read_one("k").await.unwrap().value, Some(json!(1)));

        store
            .write_batch(&[upsert("k", json!(2))])
            .await
            .unwrap();
        drop(store);
        let store = LogStore::open(dir.path(), false).await.unwrap();
        assert_eq!(store.read_one("k").await.unwrap().value, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_compact_keeps_live_keys() {
        let dir = tempdir().unwrap();
        let store = LogStore::open(dir.path(), false).await.unwrap();
        for i in 0..10 {
            store
                .write_batch(&[upsert("counter", json!(i))])
                .await
                .unwrap();
        }
        store
            .write_batch(&[upsert("other", json!("x"))])
            .await
            .unwrap();
        let before = std::fs::metadata(store.path()).unwrap().len();

        assert_eq!(store.compact().await.unwrap(), 2);
        let after = std::fs::metadata(store.path()).unwrap().len();
        assert!(after < before);

        store
            .write_batch(&[upsert("late", json!(true))])
            .await
            .unwrap();
        drop(store);

        let store = LogStore::open(dir.path(), false).await.unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(
            store.read_one("counter").await.unwrap().value,
            Some(json!(9))
        );
    }

    #[tokio::test]
    async fn test_failed_append_leaves_no_bytes_behind() {
        let dir = tempdir().unwrap();
        let store = LogStore::open(dir.path(), true).await.unwrap();
        store
            .write_batch(&[upsert("a", json!(1))])
            .await
            .unwrap();
        let committed = std::fs::metadata(store.path()).unwrap().len();

        // the append dies halfway through a frame
        store.writer.lock().await.torn_write = Some(7);
        let failed = store
            .write_batch(&[upsert("b", json!("lost")), upsert("a", json!(2))])
            .await;
        assert!(matches!(failed, Err(StoreError::Io(_))));
        assert_eq!(std::fs::metadata(store.path()).unwrap().len(), committed);
        assert_eq!(store.read_one("b").await.unwrap().value, None);

        // the retry lands right after the last committed batch
        store
            .write_batch(&[upsert("c", json!(3))])
            .await
            .unwrap();
        store
            .write_batch(&[upsert("d", json!(4))])
            .await
            .unwrap();
        drop(store);

        let store = LogStore::open(dir.path(), true).await.unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.read_one("a").await.unwrap().value, Some(json!(1)));
        assert_eq!(store.read_one("b").await.unwrap().value, None);
        assert_eq!(store.read_one("c").await.unwrap().value, Some(json!(3)));
        assert_eq!(store.read_one("d").await.unwrap().value, Some(json!(4)));
    }

    #[tokio::test]
    async fn test_dirty_writer_rolls_back_before_next_append() {
        let dir = tempdir().unwrap();
        let store = LogStore::open(dir.path(), false).await.unwrap();
        store
            .write_batch(&[upsert("a", json!(1))])
            .await
            .unwrap();

        // a failed append whose rollback did not get through
        {
            let mut writer = store.writer.lock().await;
            writer.out.write_all(&[0, 0, 0, 0, 0, 0, 0, 40, 1, 2, 3]).await.unwrap();
            writer.out.flush().await.unwrap();
            writer.dirty = true;
        }

        store
            .write_batch(&[upsert("b", json!(2))])
            .await
            .unwrap();
        drop(store);

        let store = LogStore::open(dir.path(), false).await.unwrap();
        assert_eq!(store.read_one("a").await.unwrap().value, Some(json!(1)));
        assert_eq!(store.read_one("b").await.unwrap().value, Some(json!(2)));
    }
}
