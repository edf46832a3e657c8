//! RocksDB-backed message log.
//!
//! Column families:
//! - `messages`: one record per message, key = id (8 bytes big-endian) so
//!   iteration order is id order; value = bincode `{content, user}`
//! - `meta`:     `next_id` (8 bytes big-endian), advanced in the same
//!   write batch as the message it follows
//!
//! Opening the store creates both column families if they are missing, so
//! schema initialization is idempotent.

use rocksdb::{
    ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, Direction, ErrorKind,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use super::MessageLog;
use crate::error::LogError;
use crate::protocol::Message;

const CF_MESSAGES: &str = "messages";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_MESSAGES, CF_META];

const NEXT_ID_KEY: &[u8] = b"next_id";

/// First id handed out by an empty log.
const FIRST_ID: u64 = 1;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// fsync every append (default: false)
    pub sync_writes: bool,
    /// Extra attempts for writes that fail with a transient error
    pub write_retries: u32,
    /// Backoff unit between retries; attempt `n` waits `n * retry_backoff`
    pub retry_backoff: Duration,
    /// Max open files for RocksDB
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("relay_data"),
            sync_writes: false,
            write_retries: 3,
            retry_backoff: Duration::from_millis(20),
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (temp directory, no backoff).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_writes: false,
            write_retries: 0,
            retry_backoff: Duration::ZERO,
            max_open_files: 64,
        }
    }
}

/// On-disk record. The author column keeps the `user` name of the schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    content: String,
    user: String,
}

impl StoredRecord {
    fn encode(&self, id: u64) -> Result<Vec<u8>, LogError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).map_err(|e| {
            LogError::Corrupt {
                id,
                reason: e.to_string(),
            }
        })
    }

    fn decode(id: u64, bytes: &[u8]) -> Result<Self, LogError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| LogError::Corrupt {
                id,
                reason: e.to_string(),
            })?;
        Ok(record)
    }
}

/// Message log stored in RocksDB.
///
/// One instance is opened at startup and shared for the life of the process.
pub struct RocksMessageLog {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next id to assign. Held across the write so ids commit in order.
    next_id: Mutex<u64>,
}

impl RocksMessageLog {
    /// Open the log, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, LogError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let next_id = Self::recover_next_id(&db)?;

        Ok(Self {
            db,
            config,
            next_id: Mutex::new(next_id),
        })
    }

    fn cf_options(name: &str) -> Options {
        let mut opts = Options::default();
        match name {
            CF_MESSAGES => {
                // Short text, scanned forward from an offset
                opts.set_compression_type(DBCompressionType::Lz4);
            }
            CF_META => {
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(8);
            }
            _ => {}
        }
        opts
    }

    /// Recover the id sequence: the stored `next_id`, else one past the
    /// highest message key, else [`FIRST_ID`].
    fn recover_next_id(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, LogError> {
        let meta = db
            .cf_handle(CF_META)
            .ok_or_else(|| missing_cf(CF_META))?;
        let stored = db.get_cf(meta, NEXT_ID_KEY)?.and_then(|v| decode_id(&v));

        let messages = db
            .cf_handle(CF_MESSAGES)
            .ok_or_else(|| missing_cf(CF_MESSAGES))?;
        let highest = match db.iterator_cf(messages, IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item?;
                decode_id(&key).map(|id| id + 1)
            }
            None => None,
        };

        Ok(stored
            .into_iter()
            .chain(highest)
            .max()
            .unwrap_or(FIRST_ID)
            .max(FIRST_ID))
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, LogError> {
        self.db.cf_handle(name).ok_or_else(|| missing_cf(name))
    }

    /// Write one message and the advanced sequence atomically, retrying
    /// transient failures.
    fn write_record(&self, id: u64, value: &[u8]) -> Result<(), LogError> {
        let cf_messages = self.cf(CF_MESSAGES)?;
        let cf_meta = self.cf(CF_META)?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);

        retry_transient(
            self.config.write_retries,
            self.config.retry_backoff,
            is_transient,
            || {
                let mut batch = WriteBatch::default();
                batch.put_cf(cf_messages, id.to_be_bytes(), value);
                batch.put_cf(cf_meta, NEXT_ID_KEY, (id + 1).to_be_bytes());
                self.db.write_opt(batch, &write_opts)
            },
        )
        .map_err(LogError::from)
    }
}

/// Run `op`, retrying up to `retries` more times while it fails with an
/// error `is_transient` accepts. Attempt `n` sleeps `n * backoff` first.
fn retry_transient<T, E: std::fmt::Display>(
    retries: u32,
    backoff: Duration,
    is_transient: impl Fn(&E) -> bool,
    mut op: impl FnMut() -> Result<T, E>,
) -> Result<T, E> {
    let mut attempt = 0u32;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < retries && is_transient(&e) => {
                attempt += 1;
                log::warn!("Transient store failure (attempt {attempt} of {retries}): {e}");
                std::thread::sleep(backoff * attempt);
            }
            Err(e) => return Err(e),
        }
    }
}

impl MessageLog for RocksMessageLog {
    fn append(&self, content: &str, author: &str) -> Result<Message, LogError> {
        let mut next_id = self
            .next_id
            .lock()
            .map_err(|_| LogError::Persistence("id sequence lock poisoned".into()))?;
        let id = *next_id;

        let record = StoredRecord {
            content: content.to_string(),
            user: author.to_string(),
        };
        self.write_record(id, &record.encode(id)?)?;
        *next_id = id + 1;

        Ok(Message {
            id,
            content: record.content,
            author: record.user,
        })
    }

    fn read_after(&self, offset: u64) -> Result<Vec<Message>, LogError> {
        let Some(start) = offset.checked_add(1) else {
            return Ok(Vec::new());
        };
        let cf = self.cf(CF_MESSAGES)?;
        let start_key = start.to_be_bytes();

        let mut messages = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            let Some(id) = decode_id(&key) else {
                log::warn!("Skipping message key of unexpected length {}", key.len());
                continue;
            };
            let record = StoredRecord::decode(id, &value)?;
            messages.push(Message {
                id,
                content: record.content,
                author: record.user,
            });
        }

        Ok(messages)
    }

    fn last_id(&self) -> Result<u64, LogError> {
        let next_id = self
            .next_id
            .lock()
            .map_err(|_| LogError::Persistence("id sequence lock poisoned".into()))?;
        Ok(*next_id - 1)
    }
}

fn decode_id(bytes: &[u8]) -> Option<u64> {
    let buf: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(buf))
}

fn is_transient(e: &rocksdb::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::Busy | ErrorKind::TryAgain | ErrorKind::TimedOut | ErrorKind::Incomplete
    )
}

fn missing_cf(name: &str) -> LogError {
    LogError::Persistence(format!("Column family '{name}' not found"))
}
