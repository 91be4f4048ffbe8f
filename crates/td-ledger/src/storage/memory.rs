use parking_lot::RwLock;

use td_types::LedgerResult;

use super::{JournalBackend, JournalOp, JournalStorage, StorageKind};

/// Journal held in process memory. The cursor is an op index.
#[derive(Debug, Default)]
pub struct MemoryLog {
    ops: RwLock<Vec<JournalOp>>,
}

impl MemoryLog {
    pub fn len(&self) -> usize {
        self.ops.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.read().is_empty()
    }
}

impl JournalBackend for MemoryLog {
    fn kind(&self) -> StorageKind {
        StorageKind::InMemory
    }

    fn append(&self, op: &JournalOp) -> LedgerResult<()> {
        self.ops.write().push(op.clone());
        Ok(())
    }

    fn read_from(&self, cursor: u64) -> LedgerResult<(Vec<JournalOp>, u64)> {
        let ops = self.ops.read();
        let start = (cursor as usize).min(ops.len());
        Ok((ops[start..].to_vec(), ops.len() as u64))
    }
}

impl JournalStorage<MemoryLog> {
    pub fn new() -> Self {
        Self::with_backend(MemoryLog::default())
    }
}

impl Default for JournalStorage<MemoryLog> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryStorage, Storage};
    use td_types::StudyDirection;

    #[test]
    fn every_write_lands_in_the_log() {
        let storage = InMemoryStorage::new();
        assert!(storage.backend().is_empty());

        let study_id = storage.create_study("s", StudyDirection::Minimize).unwrap();
        storage.create_trial(study_id).unwrap();
        assert_eq!(storage.backend().len(), 2);
    }

    #[test]
    fn read_from_resumes_at_cursor() {
        let log = MemoryLog::default();
        let op = JournalOp::SetStudyUserAttr {
            study_id: td_types::StudyId(0),
            key: "k".to_string(),
            value: serde_json::json!(1),
        };
        log.append(&op).unwrap();
        log.append(&op).unwrap();

        let (ops, cursor) = log.read_from(1).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(cursor, 2);
        let (ops, cursor) = log.read_from(cursor).unwrap();
        assert!(ops.is_empty());
        assert_eq!(cursor, 2);
    }
}
