use crate::error::{Error, Result};
use sha2::{Digest, Sha256};

/// Default chunk size: 1 MiB
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Lowercase hex SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// A single chunk of a file: its index in the sequence, the raw payload
/// and the lowercase-hex SHA-256 of that payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: usize,
    pub payload: Vec<u8>,
    pub checksum: String,
}

/// Splits byte streams into fixed-size chunks and reassembles them.
///
/// All chunks except the last carry exactly `size` bytes; the last carries
/// the remainder. Splitting the empty input yields no chunks.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    size: usize,
}

impl Chunker {
    pub fn new(size: usize) -> Self {
        let size = if size == 0 { DEFAULT_CHUNK_SIZE } else { size };
        Self { size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Split `data` into numbered chunks with per-chunk digests.
    pub fn split(&self, data: &[u8]) -> Vec<Chunk> {
        data.chunks(self.size)
            .enumerate()
            .map(|(id, payload)| Chunk {
                id,
                payload: payload.to_vec(),
                checksum: sha256_hex(payload),
            })
            .collect()
    }
}

/// Reassemble a chunk sequence presumed to cover `[0, total)` in order.
///
/// Verification happens in two passes: first every id must match its
/// position and the sequence length must equal `total`, then every
/// payload must hash to its declared checksum. Only then are the
/// payloads concatenated.
pub fn reassemble(chunks: &[Chunk], total: usize) -> Result<Vec<u8>> {
    if chunks.len() != total {
        return Err(Error::ChunkOrdering {
            index: chunks.len().min(total),
        });
    }

    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.id != i {
            return Err(Error::ChunkOrdering { index: i });
        }
    }

    for (i, chunk) in chunks.iter().enumerate() {
        let computed = sha256_hex(&chunk.payload);
        if computed != chunk.checksum {
            return Err(Error::BadChecksum {
                chunk_id: i,
                declared: chunk.checksum.clone(),
                computed,
            });
        }
    }

    let len = chunks.iter().map(|c| c.payload.len()).sum();
    let mut out = Vec::with_capacity(len);
    for chunk in chunks {
        out.extend_from_slice(&chunk.payload);
    }
    Ok(out)
}
