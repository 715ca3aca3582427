//! Durable registry of in-flight sealing calls.
//!
//! Every asynchronous call is recorded before its work starts and deleted
//! only after its result reaches the manager, so a crashed worker can report
//! what it lost. Records live in a redb table keyed by the call id; values
//! are JSON so operators can inspect them in place.

use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::error::{QuarryError, QuarryResult};
use crate::types::CallId;

use super::returns::{ReturnType, TaskOutput};

pub const WORKER_CALLS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("worker_calls");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: CallId,
    pub return_type: ReturnType,
    pub done: bool,
    /// Serialized result, present once the work function completed
    /// successfully.
    pub result: Option<TaskOutput>,
}

pub struct CallTracker {
    database: Arc<Database>,
}

impl CallTracker {
    pub fn new(database: Arc<Database>) -> QuarryResult<Self> {
        let write_txn = database
            .begin_write()
            .map_err(|e| QuarryError::storage("begin write transaction", e))?;
        write_txn
            .open_table(WORKER_CALLS_TABLE)
            .map_err(|e| QuarryError::storage("open worker calls table", e))?;
        write_txn
            .commit()
            .map_err(|e| QuarryError::storage("commit table creation", e))?;
        Ok(Self { database })
    }

    fn write(&self, record: &CallRecord) -> QuarryResult<()> {
        let value = serde_json::to_vec(record)
            .map_err(|e| QuarryError::serialization("serialize call record", e))?;
        let key = record.id.key();

        let write_txn = self
            .database
            .begin_write()
            .map_err(|e| QuarryError::storage("begin write transaction", e))?;
        {
            let mut table = write_txn
                .open_table(WORKER_CALLS_TABLE)
                .map_err(|e| QuarryError::storage("open worker calls table", e))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(|e| QuarryError::storage("write call record", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| QuarryError::storage("commit call record", e))?;
        Ok(())
    }

    fn read(&self, id: CallId) -> QuarryResult<Option<CallRecord>> {
        let read_txn = self
            .database
            .begin_read()
            .map_err(|e| QuarryError::storage("begin read transaction", e))?;
        let table = read_txn
            .open_table(WORKER_CALLS_TABLE)
            .map_err(|e| QuarryError::storage("open worker calls table", e))?;

        match table
            .get(id.key().as_str())
            .map_err(|e| QuarryError::storage("read call record", e))?
        {
            Some(data) => Ok(Some(serde_json::from_slice(data.value()).map_err(|e| {
                QuarryError::serialization("deserialize call record", e)
            })?)),
            None => Ok(None),
        }
    }

    /// Record a call before its work function runs.
    pub fn on_start(&self, id: CallId, return_type: ReturnType) -> QuarryResult<()> {
        self.write(&CallRecord {
            id,
            return_type,
            done: false,
            result: None,
        })
    }

    /// Record completion. `result` carries the output for successful work;
    /// failed work completes with no stored result.
    pub fn on_done(&self, id: CallId, result: Option<TaskOutput>) -> QuarryResult<()> {
        let mut record = self.read(id)?.ok_or_else(|| QuarryError::NotFound {
            resource: format!("call record {}", id),
        })?;
        record.done = true;
        record.result = result;
        self.write(&record)
    }

    /// Delete a record once its result reached the manager.
    pub fn on_returned(&self, id: CallId) -> QuarryResult<()> {
        let key = id.key();
        let write_txn = self
            .database
            .begin_write()
            .map_err(|e| QuarryError::storage("begin write transaction", e))?;
        {
            let mut table = write_txn
                .open_table(WORKER_CALLS_TABLE)
                .map_err(|e| QuarryError::storage("open worker calls table", e))?;
            table
                .remove(key.as_str())
                .map_err(|e| QuarryError::storage("delete call record", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| QuarryError::storage("commit call record deletion", e))?;
        Ok(())
    }

    /// All calls that never completed their return, in key order. Consumed
    /// at worker start for redelivery.
    pub fn unfinished(&self) -> QuarryResult<Vec<CallRecord>> {
        let read_txn = self
            .database
            .begin_read()
            .map_err(|e| QuarryError::storage("begin read transaction", e))?;
        let table = read_txn
            .open_table(WORKER_CALLS_TABLE)
            .map_err(|e| QuarryError::storage("open worker calls table", e))?;

        let mut records = Vec::new();
        for entry in table
            .iter()
            .map_err(|e| QuarryError::storage("iterate call records", e))?
        {
            let (_, value) = entry.map_err(|e| QuarryError::storage("read call record", e))?;
            records.push(
                serde_json::from_slice(value.value())
                    .map_err(|e| QuarryError::serialization("deserialize call record", e))?,
            );
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PaddedPieceSize, PieceInfo, SectorId};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn tracker() -> (CallTracker, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Database::create(dir.path().join("worker.redb")).unwrap();
        (CallTracker::new(Arc::new(db)).unwrap(), dir)
    }

    fn call_id(number: u64) -> CallId {
        CallId {
            sector: SectorId {
                miner: 1000,
                number,
            },
            id: Uuid::new_v4(),
        }
    }

    #[test]
    fn lifecycle_start_done_returned() {
        let (ct, _dir) = tracker();
        let id = call_id(1);

        ct.on_start(id, ReturnType::AddPiece).unwrap();
        assert_eq!(ct.unfinished().unwrap().len(), 1);
        assert!(!ct.unfinished().unwrap()[0].done);

        let output = TaskOutput::Piece(PieceInfo {
            size: PaddedPieceSize(2048),
            piece_cid: "baga".into(),
        });
        ct.on_done(id, Some(output.clone())).unwrap();

        let records = ct.unfinished().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].done);
        assert_eq!(records[0].result, Some(output));

        ct.on_returned(id).unwrap();
        assert!(ct.unfinished().unwrap().is_empty());
    }

    #[test]
    fn records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("worker.redb");
        let id = call_id(2);

        {
            let ct = CallTracker::new(Arc::new(Database::create(&path).unwrap())).unwrap();
            ct.on_start(id, ReturnType::SealPreCommit1).unwrap();
        }

        let ct = CallTracker::new(Arc::new(Database::create(&path).unwrap())).unwrap();
        let records = ct.unfinished().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        assert_eq!(records[0].return_type, ReturnType::SealPreCommit1);
        assert!(!records[0].done);
    }

    #[test]
    fn failed_work_records_done_without_result() {
        let (ct, _dir) = tracker();
        let id = call_id(3);

        ct.on_start(id, ReturnType::SealCommit2).unwrap();
        ct.on_done(id, None).unwrap();

        let records = ct.unfinished().unwrap();
        assert!(records[0].done);
        assert!(records[0].result.is_none());
    }
}
