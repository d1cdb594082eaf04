//! Incremental, cache-assisted Merkle commitment engine.
//!
//! Leaves are append-only and indices are stable — `sort_leaves` is never
//! exposed as an option here (see DESIGN.md for why). Canonical pair
//! hashing makes every proof order-oblivious: `hash_pair(a, b) ==
//! hash_pair(b, a)`, which is what lets `get_proof` and `verify` stay
//! correct across rebuilds regardless of how children were constructed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rayon::prelude::*;
use sha2::{Digest as _, Sha256};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

pub type Digest = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofStep {
    pub sibling: Digest,
    pub position: Position,
}

pub type Proof = Vec<ProofStep>;

#[derive(Debug)]
pub enum MerkleError {
    EmptyLeaves,
    IndexOutOfRange(usize),
}

impl std::fmt::Display for MerkleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MerkleError::EmptyLeaves => write!(f, "cannot build a tree with zero leaves"),
            MerkleError::IndexOutOfRange(i) => write!(f, "leaf index {i} out of range"),
        }
    }
}

impl std::error::Error for MerkleError {}

/// Hash algorithm used by a tree instance. Fixed per instance, but `verify`
/// is a pure function that takes the algorithm explicitly so proofs can be
/// checked without constructing an engine.
pub trait MerkleHasher: Send + Sync {
    fn hash_leaf(&self, data: &[u8]) -> Digest;
    fn hash_pair(&self, a: &Digest, b: &Digest) -> Digest;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Hasher;

impl MerkleHasher for Sha256Hasher {
    fn hash_leaf(&self, data: &[u8]) -> Digest {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    /// Canonical pair hashing: order children so the parent digest does
    /// not depend on construction order.
    fn hash_pair(&self, a: &Digest, b: &Digest) -> Digest {
        let (x, y) = if a <= b { (a, b) } else { (b, a) };
        let mut hasher = Sha256::new();
        hasher.update(x);
        hasher.update(y);
        hasher.finalize().into()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MerkleOptions {
    /// When a level has an odd count, duplicate the last node upward.
    pub duplicate_odd: bool,
    pub batch_size: usize,
    pub batch_debounce_ms: u64,
    /// Bounded FIFO cap for the proof cache (keyed by leaf index).
    pub proof_cache_size: usize,
}

impl Default for MerkleOptions {
    fn default() -> Self {
        Self {
            duplicate_odd: true,
            batch_size: 256,
            batch_debounce_ms: 100,
            proof_cache_size: 4096,
        }
    }
}

struct TreeData {
    leaves: Vec<Digest>,
    layers: Vec<Vec<Digest>>,
    node_cache: HashMap<(Digest, Digest), Digest>,
    proof_cache: HashMap<usize, Proof>,
    proof_cache_order: VecDeque<usize>,
    rebuild_required: bool,
}

struct PendingUpdate {
    index: usize,
    leaf: Digest,
    enqueued_at: Instant,
}

/// Owns its layers and caches exclusively; consumers only ever see
/// snapshots by value (a root digest, a `Proof` vector).
pub struct MerkleEngine {
    data: RwLock<TreeData>,
    pending: AsyncMutex<Vec<PendingUpdate>>,
    options: MerkleOptions,
    hasher: Arc<dyn MerkleHasher>,
}

impl MerkleEngine {
    pub fn new(leaves: Vec<Digest>, options: MerkleOptions) -> Result<Self, MerkleError> {
        Self::with_hasher(leaves, options, Arc::new(Sha256Hasher))
    }

    pub fn with_hasher(
        leaves: Vec<Digest>,
        options: MerkleOptions,
        hasher: Arc<dyn MerkleHasher>,
    ) -> Result<Self, MerkleError> {
        if leaves.is_empty() {
            return Err(MerkleError::EmptyLeaves);
        }
        let mut data = TreeData {
            leaves,
            layers: Vec::new(),
            node_cache: HashMap::new(),
            proof_cache: HashMap::new(),
            proof_cache_order: VecDeque::new(),
            rebuild_required: true,
        };
        Self::rebuild(&mut data, &options, &*hasher);
        Ok(Self {
            data: RwLock::new(data),
            pending: AsyncMutex::new(Vec::new()),
            options,
            hasher,
        })
    }

    fn rebuild(data: &mut TreeData, options: &MerkleOptions, hasher: &dyn MerkleHasher) {
        let mut layers = vec![data.leaves.clone()];
        while layers.last().unwrap().len() > 1 {
            let prev = layers.last().unwrap();
            let mut next = Vec::with_capacity(prev.len().div_ceil(2));
            let mut i = 0;
            while i < prev.len() {
                let a = prev[i];
                let b = if i + 1 < prev.len() {
                    prev[i + 1]
                } else if options.duplicate_odd {
                    prev[i]
                } else {
                    next.push(a);
                    i += 1;
                    continue;
                };
                let parent = *data
                    .node_cache
                    .entry(canonical_key(&a, &b))
                    .or_insert_with(|| hasher.hash_pair(&a, &b));
                next.push(parent);
                i += 2;
            }
            layers.push(next);
        }
        data.layers = layers;
        data.rebuild_required = false;
        data.proof_cache.clear();
        data.proof_cache_order.clear();
    }

    /// Root digest, rebuilding lazily if an update left the tree dirty.
    pub fn root(&self) -> Digest {
        {
            let data = self.data.read();
            if !data.rebuild_required {
                return *data.layers.last().unwrap().last().unwrap();
            }
        }
        let mut data = self.data.write();
        if data.rebuild_required {
            Self::rebuild(&mut data, &self.options, &*self.hasher);
        }
        *data.layers.last().unwrap().last().unwrap()
    }

    pub fn leaf_count(&self) -> usize {
        self.data.read().leaves.len()
    }

    pub fn get_proof(&self, index: usize) -> Result<Proof, MerkleError> {
        {
            let data = self.data.read();
            if index >= data.leaves.len() {
                return Err(MerkleError::IndexOutOfRange(index));
            }
            if !data.rebuild_required {
                if let Some(cached) = data.proof_cache.get(&index) {
                    return Ok(cached.clone());
                }
            }
        }

        let mut data = self.data.write();
        if index >= data.leaves.len() {
            return Err(MerkleError::IndexOutOfRange(index));
        }
        if data.rebuild_required {
            Self::rebuild(&mut data, &self.options, &*self.hasher);
        }
        if let Some(cached) = data.proof_cache.get(&index) {
            return Ok(cached.clone());
        }

        let mut proof = Vec::new();
        let mut idx = index;
        for layer in &data.layers[..data.layers.len() - 1] {
            let sibling_idx = idx ^ 1;
            let sibling = if sibling_idx < layer.len() {
                layer[sibling_idx]
            } else {
                layer[idx]
            };
            let position = if idx % 2 == 0 {
                Position::Right
            } else {
                Position::Left
            };
            proof.push(ProofStep {
                sibling,
                position,
            });
            idx /= 2;
        }

        insert_proof_cache(&mut data, index, proof.clone(), self.options.proof_cache_size);
        Ok(proof)
    }

    /// Pure function: verifiable without an engine instance.
    pub fn verify(leaf: Digest, proof: &Proof, root: Digest, hasher: &dyn MerkleHasher) -> bool {
        let mut acc = leaf;
        for step in proof {
            acc = match step.position {
                Position::Left => hasher.hash_pair(&step.sibling, &acc),
                Position::Right => hasher.hash_pair(&acc, &step.sibling),
            };
        }
        acc == root
    }

    /// Verifies many `(leaf, proof, root)` triples, optionally across a
    /// worker pool. Deterministic: results come back in input order
    /// regardless of how rayon schedules the work.
    pub fn verify_batch(
        items: &[(Digest, Proof, Digest)],
        hasher: &(dyn MerkleHasher + Sync),
    ) -> Vec<bool> {
        items
            .par_iter()
            .map(|(leaf, proof, root)| Self::verify(*leaf, proof, *root, hasher))
            .collect()
    }

    /// Updates one leaf and recomputes its sibling path in place —
    /// O(log N) rather than a full rebuild. Conservatively invalidates the
    /// whole (bounded) proof cache: an update can change ancestor nodes
    /// shared by other leaves' cached proofs, and the cache is cheap to
    /// repopulate on next read.
    pub fn update_leaf(&self, index: usize, new_leaf: Digest) -> Result<(), MerkleError> {
        let mut data = self.data.write();
        if index >= data.leaves.len() {
            return Err(MerkleError::IndexOutOfRange(index));
        }
        if data.rebuild_required {
            Self::rebuild(&mut data, &self.options, &*self.hasher);
        }
        data.leaves[index] = new_leaf;
        data.layers[0][index] = new_leaf;

        let mut idx = index;
        let mut current = new_leaf;
        let hasher = &*self.hasher;
        for level in 0..data.layers.len() - 1 {
            let layer_len = data.layers[level].len();
            let sibling_idx = idx ^ 1;
            let sibling = if sibling_idx < layer_len {
                data.layers[level][sibling_idx]
            } else {
                current
            };
            let parent = if idx % 2 == 0 {
                *data
                    .node_cache
                    .entry(canonical_key(&current, &sibling))
                    .or_insert_with(|| hasher.hash_pair(&current, &sibling))
            } else {
                *data
                    .node_cache
                    .entry(canonical_key(&sibling, &current))
                    .or_insert_with(|| hasher.hash_pair(&sibling, &current))
            };
            idx /= 2;
            data.layers[level + 1][idx] = parent;
            current = parent;
        }

        data.proof_cache.clear();
        data.proof_cache_order.clear();
        Ok(())
    }

    /// Enqueues a leaf update for the next batched flush. Flushes
    /// immediately once `batch_size` pending updates accumulate;
    /// otherwise the background debounce task (`spawn_batch_debounce`)
    /// flushes after `batch_debounce_ms`.
    pub async fn update_leaf_batched(&self, index: usize, new_leaf: Digest) {
        let should_flush = {
            let mut pending = self.pending.lock().await;
            pending.push(PendingUpdate {
                index,
                leaf: new_leaf,
                enqueued_at: Instant::now(),
            });
            pending.len() >= self.options.batch_size
        };
        if should_flush {
            self.flush_pending().await;
        }
    }

    /// Applies every pending batched update, sorted by index, then
    /// rebuilds. A full rebuild is acceptable per spec for implementations
    /// that don't detect subtree dominance.
    pub async fn flush_pending(&self) {
        let mut updates = {
            let mut pending = self.pending.lock().await;
            std::mem::take(&mut *pending)
        };
        if updates.is_empty() {
            return;
        }
        updates.sort_by_key(|u| u.index);

        let mut data = self.data.write();
        for update in &updates {
            if update.index < data.leaves.len() {
                data.leaves[update.index] = update.leaf;
            }
        }
        Self::rebuild(&mut data, &self.options, &*self.hasher);
        debug!(flushed = updates.len(), "merkle batch flush complete");
    }

    /// Spawns the background debounce loop. Should be called once at
    /// startup, mirroring the teacher's periodic-tick-task pattern.
    pub fn spawn_batch_debounce(self: Arc<Self>) {
        let debounce = Duration::from_millis(self.options.batch_debounce_ms);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(25));
            loop {
                interval.tick().await;
                let due = {
                    let pending = self.pending.lock().await;
                    pending
                        .first()
                        .map(|p| p.enqueued_at.elapsed() >= debounce)
                        .unwrap_or(false)
                };
                if due {
                    self.flush_pending().await;
                }
            }
        });
    }

    /// Appends new leaves (e.g. the modified `(key, value)` pairs of a
    /// freshly committed batch) and marks the tree dirty.
    pub fn append_leaves(&self, new_leaves: Vec<Digest>) {
        let mut data = self.data.write();
        data.leaves.extend(new_leaves);
        data.rebuild_required = true;
    }
}

fn canonical_key(a: &Digest, b: &Digest) -> (Digest, Digest) {
    if a <= b {
        (*a, *b)
    } else {
        (*b, *a)
    }
}

fn insert_proof_cache(data: &mut TreeData, index: usize, proof: Proof, cap: usize) {
    if data.proof_cache.len() >= cap {
        if let Some(oldest) = data.proof_cache_order.pop_front() {
            data.proof_cache.remove(&oldest);
        }
    }
    data.proof_cache.insert(index, proof);
    data.proof_cache_order.push_back(index);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(n: u8) -> Digest {
        let mut d = [0u8; 32];
        d[0] = n;
        d
    }

    #[test]
    fn canonical_pairing_is_order_oblivious() {
        let hasher = Sha256Hasher;
        let a = leaf(1);
        let b = leaf(2);
        let c = leaf(3);
        assert_eq!(hasher.hash_pair(&a, &b), hasher.hash_pair(&b, &a));
        assert_ne!(hasher.hash_pair(&a, &b), hasher.hash_pair(&a, &c));
    }

    #[test]
    fn proof_round_trips_after_build() {
        let leaves: Vec<Digest> = (0..7).map(leaf).collect();
        let engine = MerkleEngine::new(leaves.clone(), MerkleOptions::default()).unwrap();
        let root = engine.root();
        for (i, l) in leaves.iter().enumerate() {
            let proof = engine.get_proof(i).unwrap();
            assert!(MerkleEngine::verify(*l, &proof, root, &Sha256Hasher));
        }
    }

    #[test]
    fn proof_round_trips_after_update() {
        let leaves: Vec<Digest> = (0..8).map(leaf).collect();
        let engine = MerkleEngine::new(leaves, MerkleOptions::default()).unwrap();
        engine.update_leaf(3, leaf(200)).unwrap();
        let root = engine.root();
        let proof = engine.get_proof(3).unwrap();
        assert!(MerkleEngine::verify(leaf(200), &proof, root, &Sha256Hasher));
        // an untouched leaf's proof must still verify against the new root
        let proof0 = engine.get_proof(0).unwrap();
        assert!(MerkleEngine::verify(leaf(0), &proof0, root, &Sha256Hasher));
    }

    #[test]
    fn out_of_range_index_is_a_domain_error() {
        let engine = MerkleEngine::new(vec![leaf(1)], MerkleOptions::default()).unwrap();
        assert!(matches!(
            engine.get_proof(5),
            Err(MerkleError::IndexOutOfRange(5))
        ));
    }

    #[test]
    fn verify_mismatch_is_false_not_an_error() {
        let leaves: Vec<Digest> = (0..4).map(leaf).collect();
        let engine = MerkleEngine::new(leaves.clone(), MerkleOptions::default()).unwrap();
        let root = engine.root();
        let proof = engine.get_proof(0).unwrap();
        assert!(!MerkleEngine::verify(leaf(99), &proof, root, &Sha256Hasher));
    }

    #[test]
    fn empty_leaves_is_rejected() {
        assert!(matches!(
            MerkleEngine::new(vec![], MerkleOptions::default()),
            Err(MerkleError::EmptyLeaves)
        ));
    }

    #[test]
    fn verify_batch_preserves_input_order() {
        let leaves: Vec<Digest> = (0..5).map(leaf).collect();
        let engine = MerkleEngine::new(leaves.clone(), MerkleOptions::default()).unwrap();
        let root = engine.root();
        let mut items = Vec::new();
        for (i, l) in leaves.iter().enumerate() {
            let proof = engine.get_proof(i).unwrap();
            items.push((*l, proof, root));
        }
        // corrupt one entry in the middle so we can check position, not just count
        items[2].0 = leaf(250);
        let results = MerkleEngine::verify_batch(&items, &Sha256Hasher);
        assert_eq!(results, vec![true, true, false, true, true]);
    }

    #[tokio::test]
    async fn batched_update_flushes_at_batch_size() {
        let leaves: Vec<Digest> = (0..4).map(leaf).collect();
        let engine = Arc::new(MerkleEngine::new(
            leaves,
            MerkleOptions {
                batch_size: 2,
                ..MerkleOptions::default()
            },
        ).unwrap());
        engine.update_leaf_batched(0, leaf(10)).await;
        engine.update_leaf_batched(1, leaf(11)).await;
        // second update reaches batch_size and flushes synchronously
        let root = engine.root();
        let proof = engine.get_proof(0).unwrap();
        assert!(MerkleEngine::verify(leaf(10), &proof, root, &Sha256Hasher));
    }

    proptest::proptest! {
        #[test]
        fn proof_always_verifies_for_any_leaf_set(n in 1usize..20) {
            let leaves: Vec<Digest> = (0..n as u8).map(leaf).collect();
            let engine = MerkleEngine::new(leaves.clone(), MerkleOptions::default()).unwrap();
            let root = engine.root();
            for (i, l) in leaves.iter().enumerate() {
                let proof = engine.get_proof(i).unwrap();
                prop_assert!(MerkleEngine::verify(*l, &proof, root, &Sha256Hasher));
            }
        }
    }
}
