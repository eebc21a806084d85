//! Serialized state store.
//!
//! Models and parameter sets are encoded once per refinement level into
//! opaque, integrity-checked byte blobs that can be copied to any worker:
//!
//! - bincode encoding of the value
//! - zstd compression
//! - blake3 digest, verified before every decode
//!
//! Blobs live in a [`LevelArena`], an append-only container indexed by
//! level. Levels are pushed strictly in order and released explicitly.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{WrapperError, WrapperResult};

/// Layout version stamped into every blob.
pub const STATE_FORMAT_VERSION: u16 = 1;

/// Identity of a serialized blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateKey {
    /// Run the blob belongs to.
    pub run_id: u64,
    /// Refinement level, 0 is the coarsest.
    pub level: usize,
}

impl StateKey {
    /// Create a key.
    #[must_use]
    pub const fn new(run_id: u64, level: usize) -> Self {
        Self { run_id, level }
    }
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run {} level {}", self.run_id, self.level)
    }
}

/// Immutable, compressed, hashed snapshot of one model or parameter set.
///
/// `Clone` yields an independent copy of the bytes; workers never share a
/// mutable reference to a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedState {
    key: StateKey,
    version: u16,
    data: Vec<u8>,
    hash: [u8; 32],
}

impl SerializedState {
    /// Identity of the blob.
    #[must_use]
    pub const fn key(&self) -> StateKey {
        self.key
    }

    /// Refinement level of the blob.
    #[must_use]
    pub const fn level(&self) -> usize {
        self.key.level
    }

    /// Compressed size in bytes.
    #[must_use]
    pub fn compressed_size(&self) -> usize {
        self.data.len()
    }

    /// Whether the stored digest matches the payload.
    #[must_use]
    pub fn verify(&self) -> bool {
        blake3::hash(&self.data).as_bytes() == &self.hash
    }
}

/// Typed encode/decode boundary for [`SerializedState`].
#[derive(Debug, Clone, Copy)]
pub struct StateCodec {
    compression_level: i32,
}

impl Default for StateCodec {
    fn default() -> Self {
        Self::new(3)
    }
}

impl StateCodec {
    /// Create a codec with a zstd compression level (1-22).
    #[must_use]
    pub fn new(compression_level: i32) -> Self {
        Self {
            compression_level: compression_level.clamp(1, 22),
        }
    }

    /// Encode a value into a blob.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or compression fails.
    pub fn encode<T: Serialize>(&self, key: StateKey, value: &T) -> WrapperResult<SerializedState> {
        let serialized =
            bincode::serialize(value).map_err(|e| WrapperError::serialization(e.to_string()))?;
        let data = zstd::encode_all(&serialized[..], self.compression_level)?;
        let hash = *blake3::hash(&data).as_bytes();

        Ok(SerializedState {
            key,
            version: STATE_FORMAT_VERSION,
            data,
            hash,
        })
    }

    /// Decode a blob back into a value.
    ///
    /// # Errors
    ///
    /// Returns `StateIntegrity` if the digest check fails, and a
    /// serialization error for a foreign format version or a payload that
    /// does not decode as `T`.
    pub fn decode<T: DeserializeOwned>(&self, state: &SerializedState) -> WrapperResult<T> {
        if !state.verify() {
            return Err(WrapperError::StateIntegrity {
                run_id: state.key.run_id,
                level: state.key.level,
            });
        }
        if state.version != STATE_FORMAT_VERSION {
            return Err(WrapperError::serialization(format!(
                "state {} has format version {}, expected {STATE_FORMAT_VERSION}",
                state.key, state.version
            )));
        }

        let decompressed = zstd::decode_all(&state.data[..])?;
        bincode::deserialize(&decompressed).map_err(|e| WrapperError::serialization(e.to_string()))
    }
}

/// Append-only container of blobs indexed by level.
#[derive(Debug, Clone, Default)]
pub struct LevelArena {
    run_id: u64,
    entries: Vec<SerializedState>,
}

impl LevelArena {
    /// Create an empty arena for a run.
    #[must_use]
    pub const fn new(run_id: u64) -> Self {
        Self {
            run_id,
            entries: Vec::new(),
        }
    }

    /// Append the next level.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the blob belongs to another run or
    /// is not the next level in sequence.
    pub fn push(&mut self, state: SerializedState) -> WrapperResult<usize> {
        let expected = self.entries.len();
        if state.key.run_id != self.run_id {
            return Err(WrapperError::serialization(format!(
                "state {} pushed into arena of run {}",
                state.key, self.run_id
            )));
        }
        if state.key.level != expected {
            return Err(WrapperError::serialization(format!(
                "state {} pushed out of order, next level is {expected}",
                state.key
            )));
        }
        self.entries.push(state);
        Ok(expected)
    }

    /// Blob of `level`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the level has not been stored.
    pub fn get(&self, level: usize) -> WrapperResult<&SerializedState> {
        self.entries.get(level).ok_or_else(|| {
            WrapperError::serialization(format!(
                "level {level} of run {} has not been serialized ({} levels stored)",
                self.run_id,
                self.entries.len()
            ))
        })
    }

    /// Number of stored levels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no level is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total compressed bytes held.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.entries.iter().map(SerializedState::compressed_size).sum()
    }

    /// Run identifier.
    #[must_use]
    pub const fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Release every stored blob.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Mesh {
        nodes: Vec<f64>,
        name: String,
    }

    fn mesh(n: usize) -> Mesh {
        Mesh {
            nodes: (0..=n).map(|i| i as f64 / n as f64).collect(),
            name: format!("mesh-{n}"),
        }
    }

    #[test]
    fn test_round_trip() {
        let codec = StateCodec::default();
        let original = mesh(16);
        let state = codec.encode(StateKey::new(1, 0), &original).unwrap();
        assert!(state.verify());
        assert_eq!(state.level(), 0);

        let restored: Mesh = codec.decode(&state).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn test_clone_is_independent_copy() {
        let codec = StateCodec::default();
        let state = codec.encode(StateKey::new(0, 0), &mesh(4)).unwrap();
        let mut copy = state.clone();
        copy.data.push(0);
        assert!(state.verify());
        assert!(!copy.verify());
    }

    #[test]
    fn test_tampered_blob_rejected() {
        let codec = StateCodec::default();
        let mut state = codec.encode(StateKey::new(3, 2), &mesh(8)).unwrap();
        if let Some(byte) = state.data.first_mut() {
            *byte ^= 0xFF;
        }
        let err = codec.decode::<Mesh>(&state).expect_err("tampered");
        assert!(matches!(
            err,
            WrapperError::StateIntegrity {
                run_id: 3,
                level: 2
            }
        ));
    }

    #[test]
    fn test_foreign_version_rejected() {
        let codec = StateCodec::default();
        let mut state = codec.encode(StateKey::new(0, 0), &mesh(2)).unwrap();
        state.version = STATE_FORMAT_VERSION + 1;
        let err = codec.decode::<Mesh>(&state).expect_err("version");
        assert!(err.to_string().contains("format version"));
    }

    #[test]
    fn test_decode_wrong_type_fails() {
        let codec = StateCodec::default();
        let state = codec.encode(StateKey::new(0, 0), &7u8).unwrap();
        assert!(codec.decode::<Mesh>(&state).is_err());
    }

    #[test]
    fn test_compression_shrinks_repetitive_data() {
        let codec = StateCodec::new(19);
        let value = vec![1.0f64; 10_000];
        let state = codec.encode(StateKey::new(0, 0), &value).unwrap();
        assert!(state.compressed_size() < 80_000 / 10);
    }

    #[test]
    fn test_arena_push_in_order() {
        let codec = StateCodec::default();
        let mut arena = LevelArena::new(5);
        for level in 0..3 {
            let state = codec.encode(StateKey::new(5, level), &mesh(level + 1)).unwrap();
            assert_eq!(arena.push(state).unwrap(), level);
        }
        assert_eq!(arena.len(), 3);
        assert_eq!(arena.get(2).unwrap().level(), 2);
        assert!(arena.total_bytes() > 0);

        let level1: Mesh = codec.decode(arena.get(1).unwrap()).unwrap();
        assert_eq!(level1, mesh(2));
    }

    #[test]
    fn test_arena_rejects_gap() {
        let codec = StateCodec::default();
        let mut arena = LevelArena::new(0);
        let state = codec.encode(StateKey::new(0, 1), &mesh(1)).unwrap();
        let err = arena.push(state).expect_err("gap");
        assert!(err.to_string().contains("out of order"));
    }

    #[test]
    fn test_arena_rejects_foreign_run() {
        let codec = StateCodec::default();
        let mut arena = LevelArena::new(0);
        let state = codec.encode(StateKey::new(9, 0), &mesh(1)).unwrap();
        assert!(arena.push(state).is_err());
    }

    #[test]
    fn test_arena_missing_level_and_clear() {
        let codec = StateCodec::default();
        let mut arena = LevelArena::new(0);
        arena
            .push(codec.encode(StateKey::new(0, 0), &mesh(1)).unwrap())
            .unwrap();
        assert!(arena.get(4).is_err());
        arena
            .push(codec.encode(StateKey::new(0, 1), &mesh(2)).unwrap())
            .unwrap();
        assert_eq!(arena.len(), 2);

        arena.clear();
        assert!(arena.is_empty());
        assert!(arena.get(0).is_err());
    }

    proptest! {
        /// Round trip holds for arbitrary node vectors.
        #[test]
        fn prop_round_trip(nodes in prop::collection::vec(-1e6f64..1e6, 0..200), level in 0usize..8) {
            let codec = StateCodec::default();
            let value = Mesh { nodes, name: "p".to_string() };
            let state = codec.encode(StateKey::new(0, level), &value).unwrap();
            let restored: Mesh = codec.decode(&state).unwrap();
            prop_assert_eq!(restored, value);
        }
    }
}
