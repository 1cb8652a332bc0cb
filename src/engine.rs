use crate::chunker::{self, Chunk, sha256_hex};
use crate::error::{Error, Result};
use crate::session::{SessionStore, UploadSession};
use crate::storage::BlobStore;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Number of per-path lock stripes. Arrivals for the same path serialise on
/// one stripe; distinct paths almost always proceed in parallel.
const LOCK_STRIPES: usize = 64;

/// A chunk as it arrives off the wire, already decoded to raw bytes.
#[derive(Debug, Clone)]
pub struct IncomingChunk {
    pub path: String,
    pub chunk_id: usize,
    pub payload: Vec<u8>,
    pub checksum: String,
    pub total: usize,
}

/// Outcome of a single accepted chunk arrival.
#[derive(Debug, Clone, Copy)]
pub struct ChunkReceipt {
    pub chunk_id: usize,
    pub total: usize,
    /// True when this arrival completed the upload and the blob was committed.
    pub committed: bool,
}

/// Volatile per-path array of received chunk payloads awaiting completion.
///
/// Purely an assembly fast path: every accepted payload is also spilled to
/// disk by the session store, so dropping an entry loses nothing.
#[derive(Default)]
struct AssemblyBuffer {
    slots: Mutex<HashMap<String, Vec<Option<Chunk>>>>,
}

impl AssemblyBuffer {
    async fn insert(&self, path: &str, total: usize, chunk: Chunk) {
        let mut slots = self.slots.lock().await;
        let entry = slots
            .entry(path.to_string())
            .or_insert_with(|| {
                let mut v = Vec::new();
                v.resize_with(total, || None);
                v
            });
        if entry.len() == total {
            let id = chunk.id;
            entry[id] = Some(chunk);
        }
    }

    async fn take(&self, path: &str) -> Option<Vec<Option<Chunk>>> {
        self.slots.lock().await.remove(path)
    }

    async fn remove(&self, path: &str) {
        self.slots.lock().await.remove(path);
    }
}

/// Striped per-path mutexes serialising chunk arrivals for one destination.
struct PathLocks {
    stripes: Vec<Mutex<()>>,
}

impl PathLocks {
    fn new(count: usize) -> Self {
        Self {
            stripes: (0..count).map(|_| Mutex::new(())).collect(),
        }
    }

    fn for_path(&self, path: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }
}

/// Orchestrates chunk arrivals: validates, parks the payload, updates the
/// durable session and, once the received map fills, reassembles the blob
/// and commits it to storage.
pub struct UploadEngine {
    sessions: SessionStore,
    storage: Arc<dyn BlobStore>,
    buffer: AssemblyBuffer,
    locks: PathLocks,
}

impl UploadEngine {
    pub fn new(sessions: SessionStore, storage: Arc<dyn BlobStore>) -> Self {
        Self {
            sessions,
            storage,
            buffer: AssemblyBuffer::default(),
            locks: PathLocks::new(LOCK_STRIPES),
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Process one chunk arrival atomically with respect to its path.
    pub async fn handle_chunk(&self, incoming: IncomingChunk) -> Result<ChunkReceipt> {
        crate::storage::validate_key(&incoming.path)?;

        if incoming.total == 0 {
            return Err(Error::BadTotal {
                total: incoming.total,
            });
        }
        if incoming.chunk_id >= incoming.total {
            return Err(Error::OutOfRange {
                chunk_id: incoming.chunk_id,
                total: incoming.total,
            });
        }

        let declared = incoming.checksum.to_ascii_lowercase();
        let computed = sha256_hex(&incoming.payload);
        if computed != declared {
            return Err(Error::BadChecksum {
                chunk_id: incoming.chunk_id,
                declared,
                computed,
            });
        }

        let _guard = self.locks.for_path(&incoming.path).lock().await;

        let is_terminal = incoming.chunk_id == incoming.total - 1;
        let first_chunk_size =
            (!is_terminal || incoming.total == 1).then_some(incoming.payload.len());
        let session = self
            .sessions
            .get_or_create(&incoming.path, incoming.total, first_chunk_size)
            .await?;

        self.check_chunk_length(&session, &incoming, is_terminal)?;

        // Replay with a different payload must not disturb the parked slot,
        // so the conflict is detected before the buffer is touched.
        if session.received_map[incoming.chunk_id] {
            let accepted = session.chunk_checksums[incoming.chunk_id].as_deref();
            if accepted != Some(declared.as_str()) {
                return Err(Error::ChunkConflict {
                    path: incoming.path.clone(),
                    chunk_id: incoming.chunk_id,
                });
            }
        }

        self.buffer
            .insert(
                &incoming.path,
                incoming.total,
                Chunk {
                    id: incoming.chunk_id,
                    payload: incoming.payload.clone(),
                    checksum: declared.clone(),
                },
            )
            .await;

        let session = self
            .sessions
            .mark_received(&incoming.path, incoming.chunk_id, &declared, &incoming.payload)
            .await?;

        tracing::debug!(
            path = %incoming.path,
            chunk_id = incoming.chunk_id,
            total = incoming.total,
            "Chunk accepted"
        );

        let committed = if session.completed {
            self.commit(&session).await?;
            true
        } else {
            false
        };

        Ok(ChunkReceipt {
            chunk_id: incoming.chunk_id,
            total: incoming.total,
            committed,
        })
    }

    /// All non-terminal chunks of a session carry the same length; the
    /// terminal chunk may only be shorter.
    fn check_chunk_length(
        &self,
        session: &UploadSession,
        incoming: &IncomingChunk,
        is_terminal: bool,
    ) -> Result<()> {
        if session.chunk_size == 0 {
            return Ok(());
        }

        if !is_terminal && incoming.payload.len() != session.chunk_size {
            return Err(Error::BadRequest {
                msg: format!(
                    "chunk {} size mismatch: expected {}, got {}",
                    incoming.chunk_id,
                    session.chunk_size,
                    incoming.payload.len()
                ),
            });
        }

        if is_terminal && incoming.payload.len() > session.chunk_size {
            return Err(Error::BadRequest {
                msg: format!(
                    "final chunk {} larger than chunk size {}",
                    incoming.chunk_id, session.chunk_size
                ),
            });
        }

        Ok(())
    }

    /// Reassemble the completed upload and commit it. The blob store write
    /// must succeed before any state is dropped; on failure the session
    /// remains and the client may retry the final chunk.
    async fn commit(&self, session: &UploadSession) -> Result<()> {
        let total = session.total_chunks;

        let mut slots = self.buffer.take(&session.path).await.unwrap_or_default();
        slots.resize_with(total, || None);

        // Any slot not in memory (arrivals before a restart) is refilled
        // from its spill file.
        let mut chunks = Vec::with_capacity(total);
        for (i, slot) in slots.iter_mut().enumerate() {
            let chunk = match slot.take() {
                Some(chunk) => chunk,
                None => {
                    let payload = self.sessions.read_chunk(&session.path, i).await?;
                    let checksum = session.chunk_checksums[i].clone().ok_or_else(|| {
                        Error::Internal {
                            msg: format!(
                                "session {} marked chunk {} received without a checksum",
                                session.path, i
                            ),
                        }
                    })?;
                    Chunk {
                        id: i,
                        payload,
                        checksum,
                    }
                }
            };
            chunks.push(chunk);
        }

        let blob = chunker::reassemble(&chunks, total)?;
        drop(chunks);

        self.storage.put(&session.path, &blob).await?;

        self.buffer.remove(&session.path).await;
        self.sessions.delete(&session.path).await?;

        tracing::info!(
            path = %session.path,
            bytes = blob.len(),
            chunks = total,
            "File committed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    struct Harness {
        _data: TempDir,
        _meta: TempDir,
        engine: UploadEngine,
        storage: Arc<dyn BlobStore>,
    }

    async fn harness() -> Harness {
        harness_with(|storage| storage).await
    }

    async fn harness_with<F>(wrap: F) -> Harness
    where
        F: FnOnce(Arc<dyn BlobStore>) -> Arc<dyn BlobStore>,
    {
        let data = TempDir::new().unwrap();
        let meta = TempDir::new().unwrap();
        let storage = wrap(Arc::new(LocalStore::new(data.path())));
        let sessions = SessionStore::open(meta.path()).await.unwrap();
        Harness {
            engine: UploadEngine::new(sessions, Arc::clone(&storage)),
            storage,
            _data: data,
            _meta: meta,
        }
    }

    fn chunk_of(path: &str, data: &[u8], chunk_size: usize, id: usize) -> IncomingChunk {
        let chunks = chunker::Chunker::new(chunk_size).split(data);
        let total = chunks.len();
        let chunk = &chunks[id];
        IncomingChunk {
            path: path.to_string(),
            chunk_id: chunk.id,
            payload: chunk.payload.clone(),
            checksum: chunk.checksum.clone(),
            total,
        }
    }

    #[tokio::test]
    async fn test_in_order_upload_commits() {
        let h = harness().await;
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();

        for id in 0..3 {
            let receipt = h
                .engine
                .handle_chunk(chunk_of("/tmp/a.bin", &data, 1000, id))
                .await
                .unwrap();
            assert_eq!(receipt.committed, id == 2);
        }

        assert_eq!(h.storage.get("/tmp/a.bin").await.unwrap(), data);
        // Session reaped after commit
        assert!(h.engine.sessions().get("/tmp/a.bin").await.is_none());
    }

    #[tokio::test]
    async fn test_any_permutation_commits_identical_blob() {
        let h = harness().await;
        let data: Vec<u8> = (0..400u32).map(|i| (i * 7 % 256) as u8).collect();

        for (n, order) in [[2, 0, 1, 3], [3, 2, 1, 0], [1, 3, 0, 2]].iter().enumerate() {
            let path = format!("/perm/{n}.bin");
            for &id in order {
                h.engine
                    .handle_chunk(chunk_of(&path, &data, 100, id))
                    .await
                    .unwrap();
            }
            assert_eq!(h.storage.get(&path).await.unwrap(), data);
        }
    }

    #[tokio::test]
    async fn test_duplicate_chunks_are_idempotent() {
        let h = harness().await;
        let data = vec![9u8; 250];

        let first = chunk_of("/dup.bin", &data, 100, 0);
        h.engine.handle_chunk(first.clone()).await.unwrap();
        h.engine.handle_chunk(first.clone()).await.unwrap();
        h.engine.handle_chunk(first).await.unwrap();

        let session = h.engine.sessions().get("/dup.bin").await.unwrap();
        assert_eq!(session.missing_chunks(), vec![1, 2]);

        h.engine
            .handle_chunk(chunk_of("/dup.bin", &data, 100, 1))
            .await
            .unwrap();
        h.engine
            .handle_chunk(chunk_of("/dup.bin", &data, 100, 2))
            .await
            .unwrap();
        assert_eq!(h.storage.get("/dup.bin").await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_rejected_before_any_state() {
        let h = harness().await;

        let mut chunk = chunk_of("/bad.bin", &[1u8; 300], 100, 0);
        chunk.checksum = "0".repeat(64);

        let err = h.engine.handle_chunk(chunk).await.unwrap_err();
        assert!(matches!(err, Error::BadChecksum { .. }));
        assert!(h.engine.sessions().get("/bad.bin").await.is_none());
    }

    #[tokio::test]
    async fn test_replay_conflict_preserves_first_payload() {
        let h = harness().await;

        let abc = IncomingChunk {
            path: "/c.bin".into(),
            chunk_id: 0,
            payload: b"abc".to_vec(),
            checksum: sha256_hex(b"abc"),
            total: 2,
        };
        h.engine.handle_chunk(abc).await.unwrap();

        let abd = IncomingChunk {
            path: "/c.bin".into(),
            chunk_id: 0,
            payload: b"abd".to_vec(),
            checksum: sha256_hex(b"abd"),
            total: 2,
        };
        let err = h.engine.handle_chunk(abd).await.unwrap_err();
        assert!(matches!(err, Error::ChunkConflict { chunk_id: 0, .. }));

        assert_eq!(
            h.engine.sessions().read_chunk("/c.bin", 0).await.unwrap(),
            b"abc"
        );
    }

    #[tokio::test]
    async fn test_total_mismatch_is_conflict() {
        let h = harness().await;
        let data = vec![5u8; 400];

        h.engine
            .handle_chunk(chunk_of("/t.bin", &data, 100, 0))
            .await
            .unwrap();

        let mut wrong_total = chunk_of("/t.bin", &data, 100, 1);
        wrong_total.total = 5;
        let err = h.engine.handle_chunk(wrong_total).await.unwrap_err();
        assert!(matches!(err, Error::SessionConflict { existing: 4, requested: 5, .. }));

        // Original session intact
        let session = h.engine.sessions().get("/t.bin").await.unwrap();
        assert_eq!(session.total_chunks, 4);
        assert_eq!(session.missing_chunks(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_nonterminal_size_mismatch_rejected() {
        let h = harness().await;
        let data = vec![3u8; 250];

        h.engine
            .handle_chunk(chunk_of("/sz.bin", &data, 100, 0))
            .await
            .unwrap();

        let odd = IncomingChunk {
            path: "/sz.bin".into(),
            chunk_id: 1,
            payload: vec![3u8; 60],
            checksum: sha256_hex(&vec![3u8; 60]),
            total: 3,
        };
        let err = h.engine.handle_chunk(odd).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
    }

    #[tokio::test]
    async fn test_out_of_range_and_zero_total() {
        let h = harness().await;

        let mut chunk = chunk_of("/r.bin", &[1u8; 10], 10, 0);
        chunk.chunk_id = 1;
        chunk.checksum = sha256_hex(&chunk.payload);
        let err = h.engine.handle_chunk(chunk).await.unwrap_err();
        assert!(matches!(err, Error::OutOfRange { chunk_id: 1, total: 1 }));

        let mut chunk = chunk_of("/r.bin", &[1u8; 10], 10, 0);
        chunk.total = 0;
        let err = h.engine.handle_chunk(chunk).await.unwrap_err();
        assert!(matches!(err, Error::BadTotal { total: 0 }));
    }

    #[tokio::test]
    async fn test_reupload_after_commit_overwrites() {
        let h = harness().await;
        let first = vec![1u8; 150];
        let second = vec![2u8; 220];

        for id in 0..2 {
            h.engine
                .handle_chunk(chunk_of("/o.bin", &first, 100, id))
                .await
                .unwrap();
        }
        assert_eq!(h.storage.get("/o.bin").await.unwrap(), first);

        for id in 0..3 {
            h.engine
                .handle_chunk(chunk_of("/o.bin", &second, 100, id))
                .await
                .unwrap();
        }
        assert_eq!(h.storage.get("/o.bin").await.unwrap(), second);
    }

    /// Blob store whose first put fails, to exercise the retry contract.
    struct FlakyStore {
        inner: Arc<dyn BlobStore>,
        failed_once: AtomicBool,
    }

    #[async_trait]
    impl BlobStore for FlakyStore {
        async fn put(&self, key: &str, data: &[u8]) -> crate::error::Result<()> {
            if !self.failed_once.swap(true, Ordering::SeqCst) {
                return Err(Error::Io {
                    error: std::io::Error::other("injected put failure"),
                    path: key.to_string(),
                });
            }
            self.inner.put(key, data).await
        }

        async fn get(&self, key: &str) -> crate::error::Result<Vec<u8>> {
            self.inner.get(key).await
        }

        async fn exists(&self, key: &str) -> crate::error::Result<bool> {
            self.inner.exists(key).await
        }

        async fn list(&self, prefix: &str) -> crate::error::Result<Vec<String>> {
            self.inner.list(prefix).await
        }
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_session_for_retry() {
        let h = harness_with(|inner| {
            Arc::new(FlakyStore {
                inner,
                failed_once: AtomicBool::new(false),
            }) as Arc<dyn BlobStore>
        })
        .await;
        let data = vec![7u8; 250];

        h.engine
            .handle_chunk(chunk_of("/f.bin", &data, 100, 0))
            .await
            .unwrap();
        h.engine
            .handle_chunk(chunk_of("/f.bin", &data, 100, 1))
            .await
            .unwrap();

        // Final chunk triggers the commit, which fails on the injected error
        let err = h
            .engine
            .handle_chunk(chunk_of("/f.bin", &data, 100, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert!(h.engine.sessions().get("/f.bin").await.is_some());

        // Retrying the final chunk completes the upload
        let receipt = h
            .engine
            .handle_chunk(chunk_of("/f.bin", &data, 100, 2))
            .await
            .unwrap();
        assert!(receipt.committed);
        assert_eq!(h.storage.get("/f.bin").await.unwrap(), data);
        assert!(h.engine.sessions().get("/f.bin").await.is_none());
    }

    #[tokio::test]
    async fn test_completion_after_restart_uses_spilled_chunks() {
        let data = TempDir::new().unwrap();
        let meta = TempDir::new().unwrap();
        let blob: Vec<u8> = (0..300u32).map(|i| (i % 256) as u8).collect();

        {
            let storage: Arc<dyn BlobStore> = Arc::new(LocalStore::new(data.path()));
            let sessions = SessionStore::open(meta.path()).await.unwrap();
            let engine = UploadEngine::new(sessions, storage);
            engine
                .handle_chunk(chunk_of("/s.bin", &blob, 100, 0))
                .await
                .unwrap();
            engine
                .handle_chunk(chunk_of("/s.bin", &blob, 100, 2))
                .await
                .unwrap();
        }

        // Fresh engine over the same directories: the buffer is empty, the
        // session and spilled payloads are not
        let storage: Arc<dyn BlobStore> = Arc::new(LocalStore::new(data.path()));
        let sessions = SessionStore::open(meta.path()).await.unwrap();
        let engine = UploadEngine::new(sessions, Arc::clone(&storage));

        assert_eq!(
            engine.sessions().missing_chunks("/s.bin").await.unwrap(),
            vec![1]
        );

        let receipt = engine
            .handle_chunk(chunk_of("/s.bin", &blob, 100, 1))
            .await
            .unwrap();
        assert!(receipt.committed);
        assert_eq!(storage.get("/s.bin").await.unwrap(), blob);
    }
}
