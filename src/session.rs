use crate::error::{Error, Result, ResultIoExt};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// Durable record of an in-progress upload, one per destination path.
///
/// `chunk_size` is the length of a non-terminal chunk; it stays 0 until the
/// first non-terminal chunk (or the only chunk of a single-chunk upload)
/// fixes it. `chunk_checksums` mirrors `received_map` so replay-conflict
/// detection survives a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub path: String,
    pub total_chunks: usize,
    pub chunk_size: usize,
    pub received_map: Vec<bool>,
    pub chunk_checksums: Vec<Option<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed: bool,
}

impl UploadSession {
    fn new(path: String, total_chunks: usize, chunk_size: usize) -> Self {
        let now = Utc::now();
        Self {
            path,
            total_chunks,
            chunk_size,
            received_map: vec![false; total_chunks],
            chunk_checksums: vec![None; total_chunks],
            created_at: now,
            updated_at: now,
            completed: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.received_map.iter().all(|received| *received)
    }

    pub fn missing_chunks(&self) -> Vec<usize> {
        self.received_map
            .iter()
            .enumerate()
            .filter(|(_, received)| !**received)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Deterministic, collision-free mapping from a destination path to a
/// metadata filename stem.
fn encode_path(path: &str) -> String {
    path.bytes().map(|b| format!("{b:02x}")).collect()
}

/// Durable, concurrency-safe per-path session bookkeeping.
///
/// Every session lives in memory behind an `RwLock` and as one JSON record
/// on disk under the metadata directory. Mutations are persisted with
/// write-to-temp-then-rename before they become visible in memory, so a
/// crash never loses an acknowledged chunk. Accepted chunk payloads are
/// spilled to a sibling `<record>.chunks/` directory so the bytes
/// themselves also survive a restart.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, UploadSession>>>,
    meta_dir: PathBuf,
}

impl SessionStore {
    /// Open the store, creating the metadata directory if needed and
    /// rebuilding the in-memory index from the records on disk.
    ///
    /// Unreadable records are quarantined with a `.corrupt` suffix rather
    /// than silently dropped. A received bit whose spill file is missing
    /// is cleared so status answers stay truthful.
    pub async fn open(meta_dir: impl Into<PathBuf>) -> Result<Self> {
        let meta_dir = meta_dir.into();
        fs::create_dir_all(&meta_dir).await.map_io_err(&meta_dir)?;

        let store = Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            meta_dir,
        };
        store.recover().await?;
        Ok(store)
    }

    async fn recover(&self) -> Result<()> {
        let mut recovered = HashMap::new();
        let mut entries = fs::read_dir(&self.meta_dir)
            .await
            .map_io_err(&self.meta_dir)?;

        while let Some(entry) = entries.next_entry().await.map_io_err(&self.meta_dir)? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();

            // Leftover temp files from an interrupted rename are stale by
            // definition: the record they were replacing is still intact.
            if name.ends_with(".tmp") {
                let _ = fs::remove_file(&path).await;
                continue;
            }

            if !name.ends_with(".json") {
                continue;
            }

            let session = match self.load_record(&path).await {
                Ok(session) => session,
                Err(e) => {
                    let quarantine = path.with_extension("json.corrupt");
                    tracing::warn!(
                        record = %path.display(),
                        error = %e,
                        "Quarantining unreadable session record"
                    );
                    fs::rename(&path, &quarantine).await.map_io_err(&path)?;
                    continue;
                }
            };

            let session = self.reconcile_spills(session).await?;
            tracing::info!(
                path = %session.path,
                received = session.received_map.iter().filter(|b| **b).count(),
                total = session.total_chunks,
                "Recovered upload session"
            );
            recovered.insert(session.path.clone(), session);
        }

        *self.sessions.write().await = recovered;
        Ok(())
    }

    async fn load_record(&self, record: &std::path::Path) -> Result<UploadSession> {
        let content = fs::read_to_string(record).await.map_io_err(record)?;
        let session: UploadSession =
            serde_json::from_str(&content).map_err(|e| Error::Internal {
                msg: format!("malformed session record: {e}"),
            })?;

        if session.received_map.len() != session.total_chunks
            || session.chunk_checksums.len() != session.total_chunks
            || session.total_chunks == 0
        {
            return Err(Error::Internal {
                msg: "session record is internally inconsistent".to_string(),
            });
        }

        Ok(session)
    }

    /// Clear any received bit whose spilled payload has gone missing.
    async fn reconcile_spills(&self, mut session: UploadSession) -> Result<UploadSession> {
        let mut changed = false;

        for chunk_id in 0..session.total_chunks {
            if !session.received_map[chunk_id] {
                continue;
            }
            let spill = self.chunk_file(&session.path, chunk_id);
            if !fs::try_exists(&spill).await.map_io_err(&spill)? {
                tracing::warn!(
                    path = %session.path,
                    chunk_id,
                    "Spilled chunk missing; marking it not received"
                );
                session.received_map[chunk_id] = false;
                session.chunk_checksums[chunk_id] = None;
                changed = true;
            }
        }

        if changed {
            session.completed = session.is_complete();
            self.persist(&session).await?;
        }

        Ok(session)
    }

    fn record_file(&self, path: &str) -> PathBuf {
        self.meta_dir.join(format!("{}.json", encode_path(path)))
    }

    fn chunks_dir(&self, path: &str) -> PathBuf {
        self.meta_dir.join(format!("{}.chunks", encode_path(path)))
    }

    fn chunk_file(&self, path: &str, chunk_id: usize) -> PathBuf {
        self.chunks_dir(path).join(format!("chunk_{chunk_id:05}"))
    }

    /// Persist a session record: temp file, fsync, rename.
    async fn persist(&self, session: &UploadSession) -> Result<()> {
        let record = self.record_file(&session.path);
        let tmp = record.with_extension("json.tmp");

        let json = serde_json::to_string_pretty(session).map_err(std::io::Error::other)?;
        let mut file = fs::File::create(&tmp).await.map_io_err(&tmp)?;
        file.write_all(json.as_bytes()).await.map_io_err(&tmp)?;
        file.sync_all().await.map_io_err(&tmp)?;
        drop(file);

        fs::rename(&tmp, &record).await.map_io_err(&record)?;
        Ok(())
    }

    /// Return the session for `path`, creating it when absent. An existing
    /// session whose `total_chunks` disagrees with `total` is a conflict.
    pub async fn get_or_create(
        &self,
        path: &str,
        total: usize,
        first_chunk_size: Option<usize>,
    ) -> Result<UploadSession> {
        if total == 0 {
            return Err(Error::BadTotal { total });
        }

        let mut sessions = self.sessions.write().await;

        if let Some(existing) = sessions.get(path) {
            if existing.total_chunks != total {
                return Err(Error::SessionConflict {
                    path: path.to_string(),
                    existing: existing.total_chunks,
                    requested: total,
                });
            }
            return Ok(existing.clone());
        }

        let session = UploadSession::new(path.to_string(), total, first_chunk_size.unwrap_or(0));

        let chunks_dir = self.chunks_dir(path);
        fs::create_dir_all(&chunks_dir)
            .await
            .map_io_err(&chunks_dir)?;
        self.persist(&session).await?;

        sessions.insert(path.to_string(), session.clone());
        Ok(session)
    }

    /// Record chunk `chunk_id` as durably accepted: spill its payload,
    /// set the received bit, remember its checksum and refresh
    /// `updated_at`. Idempotent: replaying an identical chunk is a no-op;
    /// replaying with a different checksum is a conflict and leaves the
    /// session untouched.
    pub async fn mark_received(
        &self,
        path: &str,
        chunk_id: usize,
        checksum: &str,
        payload: &[u8],
    ) -> Result<UploadSession> {
        let mut sessions = self.sessions.write().await;

        let current = sessions.get(path).ok_or_else(|| Error::NotFound {
            path: path.to_string(),
        })?;

        if chunk_id >= current.total_chunks {
            return Err(Error::OutOfRange {
                chunk_id,
                total: current.total_chunks,
            });
        }

        if current.received_map[chunk_id] {
            match current.chunk_checksums[chunk_id].as_deref() {
                Some(accepted) if accepted == checksum => return Ok(current.clone()),
                _ => {
                    return Err(Error::ChunkConflict {
                        path: path.to_string(),
                        chunk_id,
                    });
                }
            }
        }

        let mut session = current.clone();

        // The non-terminal chunk length defines the session's chunk size
        let is_terminal = chunk_id == session.total_chunks - 1;
        if session.chunk_size == 0 && (!is_terminal || session.total_chunks == 1) {
            session.chunk_size = payload.len();
        }

        let spill = self.chunk_file(path, chunk_id);
        let mut file = fs::File::create(&spill).await.map_io_err(&spill)?;
        file.write_all(payload).await.map_io_err(&spill)?;
        file.sync_all().await.map_io_err(&spill)?;
        drop(file);

        session.received_map[chunk_id] = true;
        session.chunk_checksums[chunk_id] = Some(checksum.to_string());
        session.updated_at = Utc::now();
        session.completed = session.is_complete();

        // The record must hit disk before the caller observes the bit set
        self.persist(&session).await?;
        sessions.insert(path.to_string(), session.clone());

        Ok(session)
    }

    /// Snapshot of the session for `path`, if one exists.
    pub async fn get(&self, path: &str) -> Option<UploadSession> {
        self.sessions.read().await.get(path).cloned()
    }

    /// Indices still missing from the session's bitmap, ascending.
    pub async fn missing_chunks(&self, path: &str) -> Result<Vec<usize>> {
        self.sessions
            .read()
            .await
            .get(path)
            .map(|s| s.missing_chunks())
            .ok_or_else(|| Error::NotFound {
                path: path.to_string(),
            })
    }

    /// Read back a spilled chunk payload.
    pub async fn read_chunk(&self, path: &str, chunk_id: usize) -> Result<Vec<u8>> {
        let spill = self.chunk_file(path, chunk_id);
        fs::read(&spill).await.map_io_err(&spill)
    }

    /// Remove the session record, its spilled chunks and the in-memory
    /// entry. Removing an unknown path is a no-op.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let record = self.record_file(path);
        if fs::try_exists(&record).await.map_io_err(&record)? {
            fs::remove_file(&record).await.map_io_err(&record)?;
        }

        let chunks_dir = self.chunks_dir(path);
        if fs::try_exists(&chunks_dir).await.map_io_err(&chunks_dir)? {
            fs::remove_dir_all(&chunks_dir)
                .await
                .map_io_err(&chunks_dir)?;
        }

        self.sessions.write().await.remove(path);
        Ok(())
    }

    /// Delete sessions whose last activity is older than `ttl`.
    /// Returns the reaped paths.
    pub async fn cleanup_idle(&self, ttl: chrono::Duration) -> Result<Vec<String>> {
        let cutoff = Utc::now() - ttl;

        let idle: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.updated_at < cutoff)
                .map(|s| s.path.clone())
                .collect()
        };

        for path in &idle {
            if let Err(e) = self.delete(path).await {
                tracing::warn!(path, error = %e, "Failed to reap idle session");
            }
        }

        Ok(idle)
    }
}

/// How often the reaper wakes up to look for idle sessions.
const REAPER_INTERVAL_SECS: u64 = 300;

/// Spawn a background task that reaps sessions idle longer than `ttl_secs`.
/// Only started when a TTL is configured; by default sessions are retained
/// until their upload completes.
pub fn spawn_reaper(store: SessionStore, ttl_secs: u64) {
    tokio::spawn(async move {
        let interval = std::time::Duration::from_secs(REAPER_INTERVAL_SECS.min(ttl_secs.max(1)));
        let ttl = chrono::Duration::seconds(ttl_secs as i64);

        loop {
            tokio::time::sleep(interval).await;

            match store.cleanup_idle(ttl).await {
                Ok(reaped) if !reaped.is_empty() => {
                    tracing::info!(count = reaped.len(), "Reaped idle upload sessions");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to reap idle sessions");
                }
                _ => {}
            }
        }
    });
}
