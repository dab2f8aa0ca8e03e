//! Versioned key/value substrate shared by every worker
//!
//! Each value carries a version number. Writers present the version they read
//! (compare-and-swap); a stale version is rejected so concurrent read-modify-
//! write cycles never lose an update.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SharedDataError {
    /// The version presented to `set` is stale, or a create found the key present
    #[error("compare-and-swap mismatch")]
    CasMismatch,

    #[error("key not found")]
    NotFound,

    #[error("shared data unavailable: {0}")]
    Unavailable(String),

    #[error("malformed shared value: {0}")]
    Malformed(String),
}

/// The compare-and-swap store contract.
pub trait SharedData: Send + Sync {
    /// Read a value and its current version.
    fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u32)>, SharedDataError>;

    /// Write a value. `cas = None` creates the key and fails with
    /// [`SharedDataError::CasMismatch`] if it already exists; `Some(version)`
    /// succeeds only if the stored version still equals `version`.
    fn set(&self, key: &str, value: &[u8], cas: Option<u32>) -> Result<(), SharedDataError>;
}

/// In-process implementation backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemorySharedData {
    entries: DashMap<String, (Vec<u8>, u32)>,
}

impl InMemorySharedData {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SharedData for InMemorySharedData {
    fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u32)>, SharedDataError> {
        Ok(self
            .entries
            .get(key)
            .map(|entry| (entry.0.clone(), entry.1)))
    }

    fn set(&self, key: &str, value: &[u8], cas: Option<u32>) -> Result<(), SharedDataError> {
        match cas {
            None => match self.entries.entry(key.to_string()) {
                Entry::Occupied(_) => Err(SharedDataError::CasMismatch),
                Entry::Vacant(slot) => {
                    slot.insert((value.to_vec(), 1));
                    Ok(())
                }
            },
            Some(version) => {
                let mut entry = self
                    .entries
                    .get_mut(key)
                    .ok_or(SharedDataError::NotFound)?;
                if entry.1 != version {
                    return Err(SharedDataError::CasMismatch);
                }
                entry.0 = value.to_vec();
                entry.1 = entry.1.wrapping_add(1);
                Ok(())
            }
        }
    }
}

pub(crate) fn encode_u64(value: u64) -> [u8; 8] {
    value.to_le_bytes()
}

pub(crate) fn decode_u64(bytes: &[u8]) -> Result<u64, SharedDataError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| SharedDataError::Malformed(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_le_bytes(raw))
}
