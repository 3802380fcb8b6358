//! Persistent identity index.
//!
//! An append-mostly vector store mapping slot ids to owner identities, with
//! cosine nearest-neighbor search. Every stored vector is L2-normalized, so
//! inner product equals cosine similarity.
//!
//! Removal is a soft delete: only the slot→owner mapping entry is dropped,
//! the vector row stays behind as an orphan. Orphans still surface in search
//! results; callers must treat a hit with no owner as "no match". The store
//! is never compacted in place — a long-lived deployment reclaims space by
//! clearing and re-enrolling.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::types::Embedding;

/// Snapshot file magic, bumped on layout changes.
const SNAPSHOT_MAGIC: &[u8; 8] = b"PSGEIDX1";

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index persistence failed: {0}")]
    StorageFault(#[source] std::io::Error),
    #[error("invalid embedding dimension: expected {expected}, got {got}")]
    InvalidEmbeddingDimension { expected: usize, got: usize },
    #[error("degenerate embedding (zero or non-finite norm)")]
    DegenerateEmbedding,
    #[error("corrupt index snapshot: {0}")]
    CorruptSnapshot(String),
}

/// Vector store + slot ownership mapping + slot counter.
#[derive(Debug)]
pub struct IdentityIndex {
    dim: usize,
    /// Row-major vector storage, `dim` floats per row.
    vectors: Vec<f32>,
    /// Slot id of each row, parallel to `vectors`.
    row_slots: Vec<u64>,
    /// Live slot → owner identity. Rows without an entry are orphans.
    owners: BTreeMap<u64, i64>,
    next_slot: u64,
    path: Option<PathBuf>,
}

impl IdentityIndex {
    /// Create an empty in-memory index (no persistence).
    pub fn in_memory(dim: usize) -> Self {
        Self {
            dim,
            vectors: Vec::new(),
            row_slots: Vec::new(),
            owners: BTreeMap::new(),
            next_slot: 0,
            path: None,
        }
    }

    /// Open a file-backed index, loading the snapshot if one exists.
    pub fn open(dim: usize, path: &Path) -> Result<Self, IndexError> {
        if path.exists() {
            let bytes = std::fs::read(path).map_err(IndexError::StorageFault)?;
            let mut index = Self::decode(dim, &bytes)?;
            index.path = Some(path.to_path_buf());
            tracing::info!(
                path = %path.display(),
                rows = index.vectors.len() / dim.max(1),
                enrolled = index.owners.len(),
                next_slot = index.next_slot,
                "identity index loaded"
            );
            Ok(index)
        } else {
            let mut index = Self::in_memory(dim);
            index.path = Some(path.to_path_buf());
            tracing::info!(path = %path.display(), "new identity index");
            Ok(index)
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Total vector rows, orphans included.
    pub fn len(&self) -> usize {
        self.row_slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_slots.is_empty()
    }

    /// Live enrollments — the mapping size, never the slot counter.
    pub fn enrolled(&self) -> usize {
        self.owners.len()
    }

    pub fn next_slot(&self) -> u64 {
        self.next_slot
    }

    /// Owner identity for a slot, if the slot is still live.
    pub fn owner_of(&self, slot: u64) -> Option<i64> {
        self.owners.get(&slot).copied()
    }

    /// Normalize and append an embedding, record its owner, persist.
    ///
    /// Returns the assigned slot id. On a persistence fault the in-memory
    /// append is rolled back so memory and disk stay consistent; the caller
    /// must treat the enrollment as not committed.
    pub fn add(&mut self, embedding: &Embedding, identity: i64) -> Result<u64, IndexError> {
        self.check_dim(embedding)?;
        let unit = embedding.normalized().ok_or(IndexError::DegenerateEmbedding)?;

        let slot = self.next_slot;
        self.vectors.extend_from_slice(&unit.values);
        self.row_slots.push(slot);
        self.owners.insert(slot, identity);
        self.next_slot += 1;

        if let Err(e) = self.persist() {
            self.vectors.truncate(self.vectors.len() - self.dim);
            self.row_slots.pop();
            self.owners.remove(&slot);
            self.next_slot = slot;
            return Err(e);
        }

        tracing::debug!(slot, identity, "embedding enrolled");
        Ok(slot)
    }

    /// Top-k nearest rows by cosine similarity, descending.
    ///
    /// An empty store yields an empty list (guaranteed non-match, not an
    /// error). A degenerate query also yields an empty list — the engine
    /// fails closed rather than matching on garbage.
    pub fn search(&self, embedding: &Embedding, k: usize) -> Result<Vec<(u64, f32)>, IndexError> {
        self.check_dim(embedding)?;

        if self.row_slots.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let Some(unit) = embedding.normalized() else {
            tracing::warn!("degenerate query embedding, treating as non-match");
            return Ok(Vec::new());
        };

        let mut hits: Vec<(u64, f32)> = self
            .row_slots
            .iter()
            .enumerate()
            .map(|(row, &slot)| {
                let offset = row * self.dim;
                let dot: f32 = self.vectors[offset..offset + self.dim]
                    .iter()
                    .zip(unit.values.iter())
                    .map(|(a, b)| a * b)
                    .sum();
                (slot, dot)
            })
            .collect();

        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    /// Tombstone a slot: the owner mapping entry goes away, the vector row
    /// stays. Returns whether the slot was live.
    pub fn remove(&mut self, slot: u64) -> Result<bool, IndexError> {
        let Some(identity) = self.owners.remove(&slot) else {
            return Ok(false);
        };

        if let Err(e) = self.persist() {
            self.owners.insert(slot, identity);
            return Err(e);
        }

        tracing::debug!(slot, identity, "slot tombstoned");
        Ok(true)
    }

    /// Drop every vector and mapping entry and reset the slot counter.
    pub fn clear(&mut self) -> Result<(), IndexError> {
        self.vectors.clear();
        self.row_slots.clear();
        self.owners.clear();
        self.next_slot = 0;
        self.persist()?;
        tracing::info!("identity index cleared");
        Ok(())
    }

    /// Write the snapshot atomically: serialize to a sibling temp file, then
    /// rename over the target. A crash mid-write leaves the previous
    /// snapshot intact.
    pub fn persist(&self) -> Result<(), IndexError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let bytes = self.encode();
        let tmp = path.with_extension("tmp");

        std::fs::write(&tmp, &bytes).map_err(IndexError::StorageFault)?;
        std::fs::rename(&tmp, path).map_err(IndexError::StorageFault)?;
        Ok(())
    }

    fn check_dim(&self, embedding: &Embedding) -> Result<(), IndexError> {
        if embedding.dim() != self.dim {
            return Err(IndexError::InvalidEmbeddingDimension {
                expected: self.dim,
                got: embedding.dim(),
            });
        }
        Ok(())
    }

    // ── Snapshot codec ───────────────────────────────────────────────────────

    fn encode(&self) -> Vec<u8> {
        let rows = self.row_slots.len();
        let mut out = Vec::with_capacity(
            SNAPSHOT_MAGIC.len() + 4 + 16 + rows * (8 + self.dim * 4) + self.owners.len() * 16,
        );

        out.extend_from_slice(SNAPSHOT_MAGIC);
        out.extend_from_slice(&(self.dim as u32).to_le_bytes());
        out.extend_from_slice(&(rows as u64).to_le_bytes());
        out.extend_from_slice(&(self.owners.len() as u64).to_le_bytes());

        for (row, &slot) in self.row_slots.iter().enumerate() {
            out.extend_from_slice(&slot.to_le_bytes());
            let offset = row * self.dim;
            for v in &self.vectors[offset..offset + self.dim] {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }

        for (&slot, &identity) in &self.owners {
            out.extend_from_slice(&slot.to_le_bytes());
            out.extend_from_slice(&identity.to_le_bytes());
        }

        out
    }

    fn decode(dim: usize, bytes: &[u8]) -> Result<Self, IndexError> {
        let mut r = Reader { bytes, pos: 0 };

        let magic = r.take(SNAPSHOT_MAGIC.len())?;
        if magic != SNAPSHOT_MAGIC {
            return Err(IndexError::CorruptSnapshot("bad magic".into()));
        }

        let stored_dim = r.u32()? as usize;
        if stored_dim != dim {
            return Err(IndexError::CorruptSnapshot(format!(
                "snapshot dimension {stored_dim} does not match configured {dim}"
            )));
        }

        let rows = r.u64()? as usize;
        let mapping_len = r.u64()? as usize;

        let mut vectors = Vec::with_capacity(rows * dim);
        let mut row_slots = Vec::with_capacity(rows);
        for _ in 0..rows {
            row_slots.push(r.u64()?);
            for _ in 0..dim {
                let v = r.f32()?;
                if !v.is_finite() {
                    return Err(IndexError::CorruptSnapshot(
                        "non-finite vector component".into(),
                    ));
                }
                vectors.push(v);
            }
        }

        let mut owners = BTreeMap::new();
        for _ in 0..mapping_len {
            let slot = r.u64()?;
            let identity = r.i64()?;
            owners.insert(slot, identity);
        }

        if r.pos != bytes.len() {
            return Err(IndexError::CorruptSnapshot("trailing bytes".into()));
        }

        // The counter is recovered from the surviving mapping, not the row
        // count. A tail of tombstoned rows therefore rewinds it; live
        // enrollment counts must come from `enrolled()`.
        let next_slot = owners.keys().next_back().map(|&s| s + 1).unwrap_or(0);

        Ok(Self {
            dim,
            vectors,
            row_slots,
            owners,
            next_slot,
            path: None,
        })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], IndexError> {
        if self.pos + n > self.bytes.len() {
            return Err(IndexError::CorruptSnapshot("truncated snapshot".into()));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, IndexError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes(b.try_into().unwrap_or([0; 4])))
    }

    fn u64(&mut self) -> Result<u64, IndexError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap_or([0; 8])))
    }

    fn i64(&mut self) -> Result<i64, IndexError> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes(b.try_into().unwrap_or([0; 8])))
    }

    fn f32(&mut self) -> Result<f32, IndexError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes(b.try_into().unwrap_or([0; 4])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIM: usize = 8;

    fn emb(seed: f32) -> Embedding {
        Embedding::new((0..DIM).map(|i| seed + i as f32).collect())
    }

    fn basis(axis: usize) -> Embedding {
        let mut v = vec![0.0; DIM];
        v[axis] = 1.0;
        Embedding::new(v)
    }

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "passage-index-test-{tag}-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ))
    }

    #[test]
    fn add_then_search_is_normalization_invariant() {
        let mut index = IdentityIndex::in_memory(DIM);
        let e = emb(1.0);
        let slot = index.add(&e, 42).unwrap();
        assert_eq!(slot, 0);

        // Query with a wildly scaled copy of the same vector.
        let scaled = Embedding::new(e.values.iter().map(|v| v * 1234.5).collect());
        let hits = index.search(&scaled, 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 0);
        assert!((hits[0].1 - 1.0).abs() < 1e-5, "sim = {}", hits[0].1);
    }

    #[test]
    fn search_empty_store_is_empty_list() {
        let index = IdentityIndex::in_memory(DIM);
        assert!(index.search(&emb(1.0), 5).unwrap().is_empty());
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let mut index = IdentityIndex::in_memory(DIM);
        let wrong = Embedding::new(vec![1.0; DIM + 3]);
        assert!(matches!(
            index.add(&wrong, 1).unwrap_err(),
            IndexError::InvalidEmbeddingDimension { expected: 8, got: 11 }
        ));
        assert!(matches!(
            index.search(&wrong, 5).unwrap_err(),
            IndexError::InvalidEmbeddingDimension { .. }
        ));
    }

    #[test]
    fn degenerate_add_errors_degenerate_search_fails_closed() {
        let mut index = IdentityIndex::in_memory(DIM);
        let zero = Embedding::new(vec![0.0; DIM]);
        assert!(matches!(
            index.add(&zero, 1).unwrap_err(),
            IndexError::DegenerateEmbedding
        ));

        index.add(&emb(1.0), 1).unwrap();
        assert!(index.search(&zero, 5).unwrap().is_empty());
    }

    #[test]
    fn search_orders_by_similarity_and_truncates() {
        let mut index = IdentityIndex::in_memory(DIM);
        for axis in 0..4 {
            index.add(&basis(axis), axis as i64).unwrap();
        }

        // Query closest to axis 2, with a small axis-1 component.
        let mut q = vec![0.0; DIM];
        q[2] = 1.0;
        q[1] = 0.3;
        let hits = index.search(&Embedding::new(q), 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, 2);
        assert_eq!(hits[1].0, 1);
        assert!(hits[0].1 > hits[1].1);
    }

    #[test]
    fn remove_orphans_vector_but_drops_owner() {
        let mut index = IdentityIndex::in_memory(DIM);
        let slot = index.add(&emb(1.0), 7).unwrap();

        assert!(index.remove(slot).unwrap());
        assert!(!index.remove(slot).unwrap());

        assert_eq!(index.owner_of(slot), None);
        assert_eq!(index.enrolled(), 0);
        // The orphaned row still answers searches.
        let hits = index.search(&emb(1.0), 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, slot);
        // Slot ids are never reused while the process lives.
        let next = index.add(&emb(2.0), 8).unwrap();
        assert_eq!(next, slot + 1);
    }

    #[test]
    fn clear_resets_counter_to_zero() {
        let mut index = IdentityIndex::in_memory(DIM);
        index.add(&emb(1.0), 1).unwrap();
        index.add(&emb(2.0), 2).unwrap();

        index.clear().unwrap();
        assert_eq!(index.len(), 0);
        assert_eq!(index.enrolled(), 0);
        assert_eq!(index.next_slot(), 0);
        assert_eq!(index.add(&emb(3.0), 3).unwrap(), 0);
    }

    #[test]
    fn snapshot_roundtrip() {
        let path = temp_path("roundtrip");
        {
            let mut index = IdentityIndex::open(DIM, &path).unwrap();
            index.add(&emb(1.0), 10).unwrap();
            index.add(&emb(5.0), 20).unwrap();
            index.add(&emb(9.0), 30).unwrap();
            index.remove(1).unwrap();
        }

        let index = IdentityIndex::open(DIM, &path).unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index.enrolled(), 2);
        assert_eq!(index.owner_of(0), Some(10));
        assert_eq!(index.owner_of(1), None);
        assert_eq!(index.owner_of(2), Some(30));
        assert_eq!(index.next_slot(), 3);

        let hits = index.search(&emb(1.0), 1).unwrap();
        assert_eq!(hits[0].0, 0);
        assert!((hits[0].1 - 1.0).abs() < 1e-5);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn counter_recovery_uses_surviving_mapping() {
        let path = temp_path("counter");
        {
            let mut index = IdentityIndex::open(DIM, &path).unwrap();
            index.add(&emb(1.0), 10).unwrap();
            index.add(&emb(2.0), 20).unwrap();
            index.add(&emb(3.0), 30).unwrap();
            // Tombstone the newest slot before the snapshot is reloaded.
            index.remove(2).unwrap();
        }

        let index = IdentityIndex::open(DIM, &path).unwrap();
        // Counter rewinds to max surviving key + 1; rows are untouched.
        assert_eq!(index.next_slot(), 2);
        assert_eq!(index.len(), 3);
        assert_eq!(index.enrolled(), 2);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_snapshot_starts_fresh() {
        let path = temp_path("fresh");
        let index = IdentityIndex::open(DIM, &path).unwrap();
        assert!(index.is_empty());
        assert_eq!(index.next_slot(), 0);
    }

    #[test]
    fn corrupt_snapshot_is_rejected() {
        let path = temp_path("corrupt");
        std::fs::write(&path, b"definitely not an index").unwrap();
        assert!(matches!(
            IdentityIndex::open(DIM, &path).unwrap_err(),
            IndexError::CorruptSnapshot(_)
        ));
        let _ = std::fs::remove_file(&path);
    }
}
