//! Inbound file buffer and the per-run batch handed to the pipeline.
//!
//! Uploads accumulate in an [`InboundBuffer`] shared by request handlers. A run
//! never reads the buffer directly: [`InboundBuffer::take_batch`] moves the
//! current contents into an owned [`Batch`] and clears the buffer under the same
//! lock, so uploads for the next run can start while this one is processed.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::BatchError;

pub const DEFAULT_INDEX_FILE_NAME: &str = "indice.xlsx";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl InboundFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.bytes);
        format!("sha256:{:x}", hasher.finalize())
    }
}

/// Everything one run needs: the index and the data files, in name order.
#[derive(Debug, Clone)]
pub struct Batch {
    pub index: InboundFile,
    pub data: Vec<InboundFile>,
}

impl Batch {
    pub fn new(index: InboundFile, mut data: Vec<InboundFile>) -> Self {
        data.sort_by_key(|f| f.name.to_lowercase());
        Self { index, data }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRole {
    Index,
    Data,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferStatus {
    pub has_index: bool,
    pub data_files: Vec<String>,
}

#[derive(Debug, Default)]
struct BufferState {
    index: Option<InboundFile>,
    /// lowercase name -> file; a re-upload replaces the earlier copy
    data: BTreeMap<String, InboundFile>,
}

#[derive(Debug)]
pub struct InboundBuffer {
    index_file_name: String,
    state: Mutex<BufferState>,
}

impl Default for InboundBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_INDEX_FILE_NAME)
    }
}

impl InboundBuffer {
    pub fn new(index_file_name: impl Into<String>) -> Self {
        Self {
            index_file_name: index_file_name.into().trim().to_lowercase(),
            state: Mutex::new(BufferState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        // A panic elsewhere leaves the buffer contents intact; keep serving.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_index_name(&self, name: &str) -> bool {
        name.trim().to_lowercase() == self.index_file_name
    }

    /// Store an uploaded file, returning whether it was taken as the index.
    pub fn add(&self, file: InboundFile) -> FileRole {
        let role = if self.is_index_name(&file.name) {
            FileRole::Index
        } else {
            FileRole::Data
        };
        tracing::info!(
            file = %file.name,
            bytes = file.bytes.len(),
            hash = %file.content_hash(),
            role = ?role,
            "file buffered"
        );
        let mut state = self.lock();
        match role {
            FileRole::Index => state.index = Some(file),
            FileRole::Data => {
                state.data.insert(file.name.trim().to_lowercase(), file);
            }
        }
        role
    }

    /// Snapshot and clear the buffer in one critical section. On error the
    /// buffer is left untouched.
    pub fn take_batch(&self) -> Result<Batch, BatchError> {
        let mut state = self.lock();
        if state.index.is_none() {
            return Err(BatchError::MissingIndex(self.index_file_name.clone()));
        }
        if state.data.is_empty() {
            return Err(BatchError::NoDataFiles);
        }
        let taken = std::mem::take(&mut *state);
        drop(state);

        let index = taken
            .index
            .ok_or_else(|| BatchError::MissingIndex(self.index_file_name.clone()))?;
        Ok(Batch::new(index, taken.data.into_values().collect()))
    }

    pub fn reset(&self) {
        *self.lock() = BufferState::default();
    }

    pub fn status(&self) -> BufferStatus {
        let state = self.lock();
        BufferStatus {
            has_index: state.index.is_some(),
            data_files: state.data.values().map(|f| f.name.clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> InboundFile {
        InboundFile::new(name, name.as_bytes().to_vec())
    }

    #[test]
    fn test_index_detected_case_insensitively() {
        let buffer = InboundBuffer::default();
        assert_eq!(buffer.add(file("Indice.XLSX")), FileRole::Index);
        assert_eq!(buffer.add(file("Pacientes.xlsx")), FileRole::Data);
        assert!(buffer.status().has_index);
    }

    #[test]
    fn test_take_batch_clears_buffer() {
        let buffer = InboundBuffer::default();
        buffer.add(file("indice.xlsx"));
        buffer.add(file("Pacientes.xlsx"));
        buffer.add(file("Citas.xlsx"));

        let batch = buffer.take_batch().unwrap();
        assert_eq!(batch.data.len(), 2);
        assert_eq!(batch.data[0].name, "Citas.xlsx");

        let status = buffer.status();
        assert!(!status.has_index);
        assert!(status.data_files.is_empty());
    }

    #[test]
    fn test_take_batch_without_index_keeps_files() {
        let buffer = InboundBuffer::default();
        buffer.add(file("Pacientes.xlsx"));
        assert!(matches!(buffer.take_batch(), Err(BatchError::MissingIndex(_))));
        assert_eq!(buffer.status().data_files, vec!["Pacientes.xlsx"]);
    }

    #[test]
    fn test_take_batch_without_data() {
        let buffer = InboundBuffer::default();
        buffer.add(file("indice.xlsx"));
        assert!(matches!(buffer.take_batch(), Err(BatchError::NoDataFiles)));
        assert!(buffer.status().has_index);
    }

    #[test]
    fn test_reupload_replaces_same_name() {
        let buffer = InboundBuffer::default();
        buffer.add(InboundFile::new("Pacientes.xlsx", vec![1]));
        buffer.add(InboundFile::new("pacientes.xlsx", vec![2]));
        buffer.add(file("indice.xlsx"));
        let batch = buffer.take_batch().unwrap();
        assert_eq!(batch.data.len(), 1);
        assert_eq!(batch.data[0].bytes, vec![2]);
    }

    #[test]
    fn test_content_hash_is_stable() {
        let a = InboundFile::new("a", b"hola".to_vec());
        let b = InboundFile::new("b", b"hola".to_vec());
        assert_eq!(a.content_hash(), b.content_hash());
        assert!(a.content_hash().starts_with("sha256:"));
    }
}
