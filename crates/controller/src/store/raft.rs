//! Raft-log metadata store
//!
//! Every mutation is stamped with a term and index, appended to a durable
//! log and only then applied to the state machine. This process is the sole
//! voter of its group, so an append that reached disk is committed.
//!
//! Nothing is replicated: the log survives a restart of this process but not
//! the loss of its disk, and controllers on other hosts cannot share it. Use
//! etcd, ZooKeeper, Consul or SQL when the metadata must outlive one machine.
//!
//! Log format, one entry per line: `<crc32 hex> <json entry>`. A line whose
//! checksum does not match marks a torn tail and ends replay.
//!
//! The log is compacted into `snapshot.json` every `snapshot_threshold`
//! entries and once on open.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::events::LockEventHub;
use super::state::{Applied, Command, KvState};
use super::{now_ms, ttl_ms, LockEvent, LockWatch, MetadataStore, StoreError, StoreResult};
use crate::config::RaftStoreConfig;

const LOG_FILE: &str = "raft.log";
const SNAPSHOT_FILE: &str = "snapshot.json";

#[derive(Debug, Serialize, Deserialize)]
struct LogEntry {
    term: u64,
    index: u64,
    command: Command,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    term: u64,
    index: u64,
    state: KvState,
}

fn io_err(context: &str, e: std::io::Error) -> StoreError {
    StoreError::Unavailable(format!("raft log {}: {}", context, e))
}

fn encode_line(entry: &LogEntry) -> StoreResult<String> {
    let json = serde_json::to_string(entry).map_err(|e| StoreError::Codec(e.to_string()))?;
    Ok(format!("{:08x} {}\n", crc32fast::hash(json.as_bytes()), json))
}

fn decode_line(line: &str) -> Option<LogEntry> {
    let (crc, json) = line.split_once(' ')?;
    let crc = u32::from_str_radix(crc, 16).ok()?;
    if crc32fast::hash(json.as_bytes()) != crc {
        return None;
    }
    serde_json::from_str(json).ok()
}

/// Durable side of the store: the open log file and its position
struct RaftLog {
    dir: PathBuf,
    file: File,
    term: u64,
    last_index: u64,
    since_snapshot: u64,
    snapshot_threshold: u64,
}

impl RaftLog {
    async fn append(&mut self, command: Command) -> StoreResult<LogEntry> {
        let entry = LogEntry {
            term: self.term,
            index: self.last_index + 1,
            command,
        };
        let line = encode_line(&entry)?;
        self.file
            .write_all(line.as_bytes())
            .await
            .map_err(|e| io_err("append", e))?;
        self.file
            .sync_data()
            .await
            .map_err(|e| io_err("sync", e))?;
        self.last_index = entry.index;
        self.since_snapshot += 1;
        Ok(entry)
    }

    /// Write `state` as the new snapshot and truncate the log
    async fn compact(&mut self, state: KvState) -> StoreResult<()> {
        write_snapshot(
            &self.dir,
            &Snapshot {
                term: self.term,
                index: self.last_index,
                state,
            },
        )
        .await?;
        self.file
            .set_len(0)
            .await
            .map_err(|e| io_err("truncate", e))?;
        self.since_snapshot = 0;
        debug!("Compacted raft log at index {}", self.last_index);
        Ok(())
    }
}

async fn write_snapshot(dir: &Path, snapshot: &Snapshot) -> StoreResult<()> {
    let content = serde_json::to_vec(snapshot).map_err(|e| StoreError::Codec(e.to_string()))?;
    let path = dir.join(SNAPSHOT_FILE);
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, &content)
        .await
        .map_err(|e| io_err("write snapshot", e))?;
    fs::rename(&temp_path, &path)
        .await
        .map_err(|e| io_err("rename snapshot", e))?;
    Ok(())
}

async fn load_snapshot(dir: &Path) -> StoreResult<Snapshot> {
    let path = dir.join(SNAPSHOT_FILE);
    match fs::read(&path).await {
        Ok(content) => serde_json::from_slice(&content)
            .map_err(|e| StoreError::Codec(format!("snapshot {:?}: {}", path, e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Snapshot::default()),
        Err(e) => Err(io_err("read snapshot", e)),
    }
}

struct Inner {
    state: RwLock<KvState>,
    log: Mutex<RaftLog>,
    events: LockEventHub,
}

impl Inner {
    /// Append then apply
    async fn propose(&self, command: Command) -> StoreResult<Applied> {
        let mut log = self.log.lock().await;
        let entry = log.append(command).await?;
        let result = self.state.write().apply(entry.command);

        if log.since_snapshot >= log.snapshot_threshold {
            let state = self.state.read().clone();
            if let Err(e) = log.compact(state).await {
                warn!("Raft log compaction failed: {}", e);
            }
        }
        drop(log);

        let applied = result?;
        self.events.publish(applied.event.clone());
        Ok(applied)
    }

    fn lock_event(&self, name: &str) -> LockEvent {
        match self.state.read().lock_holder(name, now_ms()) {
            Some(record) => LockEvent::held(record.holder.clone()),
            None => LockEvent::released(),
        }
    }
}

fn schedule_expiry(inner: Weak<Inner>, name: String, epoch: u64, after: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(after + Duration::from_millis(5)).await;
        let Some(inner) = inner.upgrade() else { return };
        let cmd = Command::Expire {
            name: name.clone(),
            epoch,
            now_ms: now_ms(),
        };
        if let Err(e) = inner.propose(cmd).await {
            warn!("Failed to expire lock {}: {}", name, e);
        }
    });
}

/// Raft-log store
#[derive(Clone)]
pub struct RaftStore {
    inner: Arc<Inner>,
}

impl RaftStore {
    /// Open (or create) the log under `config.data_dir`
    pub async fn open(config: &RaftStoreConfig) -> StoreResult<Self> {
        let dir = config.data_dir.clone();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_err("create dir", e))?;

        let snapshot = load_snapshot(&dir).await?;
        let mut state = snapshot.state;
        let mut term = snapshot.term;
        let mut last_index = snapshot.index;

        let log_path = dir.join(LOG_FILE);
        let content = match fs::read_to_string(&log_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(io_err("read", e)),
        };
        let mut replayed = 0u64;
        for line in content.lines().filter(|l| !l.is_empty()) {
            let Some(entry) = decode_line(line) else {
                warn!("Raft log has a torn tail after index {}, discarding it", last_index);
                break;
            };
            if entry.index <= last_index {
                continue;
            }
            term = term.max(entry.term);
            last_index = entry.index;
            // failed commands fail identically on replay
            let _ = state.apply(entry.command);
            replayed += 1;
        }
        term += 1;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .map_err(|e| io_err("open", e))?;
        let mut log = RaftLog {
            dir,
            file,
            term,
            last_index,
            since_snapshot: 0,
            snapshot_threshold: config.snapshot_threshold.max(1),
        };
        log.compact(state.clone()).await?;

        info!(
            "Opened raft log at {:?}: term {}, index {}, {} entries replayed",
            log.dir, term, last_index, replayed
        );
        warn!("Raft log store has a single voter; metadata is not replicated");

        let pending: Vec<(String, u64, i64)> = state
            .lock_records()
            .map(|(name, r)| (name.clone(), r.epoch, r.expires_at_ms))
            .collect();
        let inner = Arc::new(Inner {
            state: RwLock::new(state),
            log: Mutex::new(log),
            events: LockEventHub::new(),
        });
        let now = now_ms();
        for (name, epoch, expires_at_ms) in pending {
            let after = Duration::from_millis(u64::try_from(expires_at_ms - now).unwrap_or(0));
            schedule_expiry(Arc::downgrade(&inner), name, epoch, after);
        }
        Ok(Self { inner })
    }

    /// Current term and last log index
    pub async fn position(&self) -> (u64, u64) {
        let log = self.inner.log.lock().await;
        (log.term, log.last_index)
    }

    async fn lock_command(&self, command: Command, name: &str, ttl: Duration) -> StoreResult<()> {
        let applied = self.inner.propose(command).await?;
        if let Some(epoch) = applied.epoch {
            schedule_expiry(Arc::downgrade(&self.inner), name.to_string(), epoch, ttl);
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for RaftStore {
    fn backend(&self) -> &'static str {
        "raft"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.inner.state.read().get(key))
    }

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.inner
            .propose(Command::Put {
                key: key.to_string(),
                value: value.to_vec(),
            })
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner
            .propose(Command::Delete {
                key: key.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        Ok(self.inner.state.read().list(prefix))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> StoreResult<()> {
        self.inner
            .propose(Command::Cas {
                key: key.to_string(),
                expected: expected.map(<[u8]>::to_vec),
                value: value.to_vec(),
            })
            .await?;
        Ok(())
    }

    async fn acquire_lock(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<()> {
        let command = Command::Acquire {
            name: name.to_string(),
            holder: holder.to_string(),
            ttl_ms: ttl_ms(ttl),
            now_ms: now_ms(),
        };
        self.lock_command(command, name, ttl).await
    }

    async fn renew_lock(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<()> {
        let command = Command::Renew {
            name: name.to_string(),
            holder: holder.to_string(),
            ttl_ms: ttl_ms(ttl),
            now_ms: now_ms(),
        };
        self.lock_command(command, name, ttl).await
    }

    async fn release_lock(&self, name: &str, holder: &str) -> StoreResult<()> {
        self.inner
            .propose(Command::Release {
                name: name.to_string(),
                holder: holder.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn watch_lock(&self, name: &str) -> StoreResult<LockWatch> {
        let inner = Arc::downgrade(&self.inner);
        let lock = name.to_string();
        Ok(self.inner.events.watch(name, move || {
            inner.upgrade().map(|inner| inner.lock_event(&lock))
        }))
    }
}
