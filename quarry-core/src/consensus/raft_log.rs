//! redb persistence for the raft log and engine metadata.
//!
//! The engine keeps its log entries, hard state, configuration state and the
//! latest operational snapshot in four redb tables under the locked
//! repository database. Entries use a compact fixed-layout codec; the
//! snapshot record carries the bincode-serialized operational state.

use std::sync::Arc;

use raft::prelude::{ConfState, Entry, EntryType, HardState, Snapshot};
use raft::{GetEntriesContext, Storage};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::error::{QuarryError, QuarryResult};

pub const RAFT_LOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("raft_log");
pub const RAFT_HARD_STATE_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("raft_hard_state");
pub const RAFT_CONF_STATE_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("raft_conf_state");
pub const RAFT_SNAPSHOT_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("raft_snapshot");

const HARD_STATE_KEY: &str = "hard_state";
const CONF_STATE_KEY: &str = "conf_state";
const SNAPSHOT_KEY: &str = "snapshot";

/// Durable snapshot record: raft metadata plus the serialized operational
/// state produced by the state machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub index: u64,
    pub term: u64,
    pub voters: Vec<u64>,
    pub learners: Vec<u64>,
    pub data: Vec<u8>,
}

#[derive(Clone)]
pub struct RaftLogStore {
    database: Arc<Database>,
}

fn store_err<E>(e: E) -> raft::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    raft::Error::Store(raft::StorageError::Other(Box::new(e)))
}

// Entry codec: [index:8][term:8][type:1][data_len:4][data][ctx_len:4][ctx][sync:1]

fn encode_entry(entry: &Entry) -> Vec<u8> {
    let type_byte: u8 = match entry.entry_type() {
        EntryType::EntryNormal => 0,
        EntryType::EntryConfChange => 1,
        EntryType::EntryConfChangeV2 => 2,
    };

    let mut buf =
        Vec::with_capacity(8 + 8 + 1 + 4 + entry.data.len() + 4 + entry.context.len() + 1);
    buf.extend_from_slice(&entry.index.to_le_bytes());
    buf.extend_from_slice(&entry.term.to_le_bytes());
    buf.push(type_byte);
    buf.extend_from_slice(&(entry.data.len() as u32).to_le_bytes());
    buf.extend_from_slice(&entry.data);
    buf.extend_from_slice(&(entry.context.len() as u32).to_le_bytes());
    buf.extend_from_slice(&entry.context);
    buf.push(entry.sync_log as u8);
    buf
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> QuarryResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(QuarryError::Serialization {
                operation: "decode raft entry".to_string(),
                source: format!(
                    "truncated record: need {} bytes at offset {}, have {}",
                    n,
                    self.pos,
                    self.buf.len()
                )
                .into(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u64(&mut self) -> QuarryResult<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().map_err(|_| {
            QuarryError::Internal {
                message: "u64 slice length mismatch".to_string(),
            }
        })?))
    }

    fn u32(&mut self) -> QuarryResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().map_err(|_| {
            QuarryError::Internal {
                message: "u32 slice length mismatch".to_string(),
            }
        })?))
    }

    fn u8(&mut self) -> QuarryResult<u8> {
        Ok(self.take(1)?[0])
    }
}

fn decode_entry(data: &[u8]) -> QuarryResult<Entry> {
    let mut c = Cursor { buf: data, pos: 0 };

    let mut entry = Entry::default();
    entry.index = c.u64()?;
    entry.term = c.u64()?;
    entry.set_entry_type(match c.u8()? {
        0 => EntryType::EntryNormal,
        1 => EntryType::EntryConfChange,
        2 => EntryType::EntryConfChangeV2,
        other => {
            return Err(QuarryError::Serialization {
                operation: "decode raft entry".to_string(),
                source: format!("unknown entry type {}", other).into(),
            })
        }
    });
    let data_len = c.u32()? as usize;
    entry.data = c.take(data_len)?.to_vec();
    let ctx_len = c.u32()? as usize;
    entry.context = c.take(ctx_len)?.to_vec();
    entry.sync_log = c.u8()? != 0;
    Ok(entry)
}

#[derive(Debug, Serialize, Deserialize)]
struct HardStateRecord {
    term: u64,
    vote: u64,
    commit: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfStateRecord {
    voters: Vec<u64>,
    learners: Vec<u64>,
}

impl RaftLogStore {
    pub fn new(database: Arc<Database>) -> QuarryResult<Self> {
        // Make sure all tables exist so later read transactions never race
        // table creation.
        let write_txn = database
            .begin_write()
            .map_err(|e| QuarryError::storage("begin write transaction", e))?;
        {
            write_txn
                .open_table(RAFT_LOG_TABLE)
                .map_err(|e| QuarryError::storage("open raft log table", e))?;
            write_txn
                .open_table(RAFT_HARD_STATE_TABLE)
                .map_err(|e| QuarryError::storage("open hard state table", e))?;
            write_txn
                .open_table(RAFT_CONF_STATE_TABLE)
                .map_err(|e| QuarryError::storage("open conf state table", e))?;
            write_txn
                .open_table(RAFT_SNAPSHOT_TABLE)
                .map_err(|e| QuarryError::storage("open snapshot table", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| QuarryError::storage("commit table creation", e))?;

        Ok(Self { database })
    }

    /// Whether any raft state has ever been persisted. Used to decide if
    /// bootstrap is a no-op.
    pub fn has_persisted_state(&self) -> QuarryResult<bool> {
        let read_txn = self
            .database
            .begin_read()
            .map_err(|e| QuarryError::storage("begin read transaction", e))?;

        let hs_table = read_txn
            .open_table(RAFT_HARD_STATE_TABLE)
            .map_err(|e| QuarryError::storage("open hard state table", e))?;
        if hs_table
            .get(HARD_STATE_KEY)
            .map_err(|e| QuarryError::storage("read hard state", e))?
            .is_some()
        {
            return Ok(true);
        }

        let log_table = read_txn
            .open_table(RAFT_LOG_TABLE)
            .map_err(|e| QuarryError::storage("open raft log table", e))?;
        let has_entry = {
            let mut iter = log_table
                .iter()
                .map_err(|e| QuarryError::storage("iterate raft log", e))?;
            iter.next().is_some()
        };
        Ok(has_entry)
    }

    pub fn append(&self, entries: &[Entry]) -> QuarryResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let write_txn = self
            .database
            .begin_write()
            .map_err(|e| QuarryError::storage("begin write transaction", e))?;
        {
            let mut table = write_txn
                .open_table(RAFT_LOG_TABLE)
                .map_err(|e| QuarryError::storage("open raft log table", e))?;
            for entry in entries {
                let data = encode_entry(entry);
                table
                    .insert(&entry.index, data.as_slice())
                    .map_err(|e| QuarryError::storage("append raft entry", e))?;
            }
        }
        write_txn
            .commit()
            .map_err(|e| QuarryError::storage("commit raft entries", e))?;
        Ok(())
    }

    pub fn save_hard_state(&self, hs: &HardState) -> QuarryResult<()> {
        let record = HardStateRecord {
            term: hs.term,
            vote: hs.vote,
            commit: hs.commit,
        };
        let data = bincode::serialize(&record)
            .map_err(|e| QuarryError::serialization("serialize hard state", e))?;

        let write_txn = self
            .database
            .begin_write()
            .map_err(|e| QuarryError::storage("begin write transaction", e))?;
        {
            let mut table = write_txn
                .open_table(RAFT_HARD_STATE_TABLE)
                .map_err(|e| QuarryError::storage("open hard state table", e))?;
            table
                .insert(HARD_STATE_KEY, data.as_slice())
                .map_err(|e| QuarryError::storage("write hard state", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| QuarryError::storage("commit hard state", e))?;
        Ok(())
    }

    pub fn save_conf_state(&self, cs: &ConfState) -> QuarryResult<()> {
        let record = ConfStateRecord {
            voters: cs.voters.clone(),
            learners: cs.learners.clone(),
        };
        let data = bincode::serialize(&record)
            .map_err(|e| QuarryError::serialization("serialize conf state", e))?;

        let write_txn = self
            .database
            .begin_write()
            .map_err(|e| QuarryError::storage("begin write transaction", e))?;
        {
            let mut table = write_txn
                .open_table(RAFT_CONF_STATE_TABLE)
                .map_err(|e| QuarryError::storage("open conf state table", e))?;
            table
                .insert(CONF_STATE_KEY, data.as_slice())
                .map_err(|e| QuarryError::storage("write conf state", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| QuarryError::storage("commit conf state", e))?;
        Ok(())
    }

    pub fn load_conf_state(&self) -> QuarryResult<ConfState> {
        let read_txn = self
            .database
            .begin_read()
            .map_err(|e| QuarryError::storage("begin read transaction", e))?;
        let table = read_txn
            .open_table(RAFT_CONF_STATE_TABLE)
            .map_err(|e| QuarryError::storage("open conf state table", e))?;

        let record = match table
            .get(CONF_STATE_KEY)
            .map_err(|e| QuarryError::storage("read conf state", e))?
        {
            Some(data) => bincode::deserialize::<ConfStateRecord>(data.value())
                .map_err(|e| QuarryError::serialization("deserialize conf state", e))?,
            None => ConfStateRecord::default(),
        };

        let mut cs = ConfState::default();
        cs.voters = record.voters;
        cs.learners = record.learners;
        Ok(cs)
    }

    /// Persist the latest operational snapshot and drop log entries it
    /// covers.
    pub fn save_snapshot(&self, record: &SnapshotRecord) -> QuarryResult<()> {
        let data = bincode::serialize(record)
            .map_err(|e| QuarryError::serialization("serialize snapshot record", e))?;

        let write_txn = self
            .database
            .begin_write()
            .map_err(|e| QuarryError::storage("begin write transaction", e))?;
        {
            let mut table = write_txn
                .open_table(RAFT_SNAPSHOT_TABLE)
                .map_err(|e| QuarryError::storage("open snapshot table", e))?;
            table
                .insert(SNAPSHOT_KEY, data.as_slice())
                .map_err(|e| QuarryError::storage("write snapshot", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| QuarryError::storage("commit snapshot", e))?;
        Ok(())
    }

    pub fn load_snapshot_record(&self) -> QuarryResult<Option<SnapshotRecord>> {
        let read_txn = self
            .database
            .begin_read()
            .map_err(|e| QuarryError::storage("begin read transaction", e))?;
        let table = read_txn
            .open_table(RAFT_SNAPSHOT_TABLE)
            .map_err(|e| QuarryError::storage("open snapshot table", e))?;

        match table
            .get(SNAPSHOT_KEY)
            .map_err(|e| QuarryError::storage("read snapshot", e))?
        {
            Some(data) => Ok(Some(
                bincode::deserialize(data.value())
                    .map_err(|e| QuarryError::serialization("deserialize snapshot record", e))?,
            )),
            None => Ok(None),
        }
    }

    /// Install a snapshot received from the leader: persist its record and
    /// conf state, and truncate the log prefix it covers.
    pub fn apply_snapshot(&self, snapshot: &Snapshot) -> QuarryResult<()> {
        let meta = snapshot.get_metadata();
        let record = SnapshotRecord {
            index: meta.index,
            term: meta.term,
            voters: meta.get_conf_state().voters.clone(),
            learners: meta.get_conf_state().learners.clone(),
            data: snapshot.data.clone(),
        };
        self.save_snapshot(&record)?;

        let mut cs = ConfState::default();
        cs.voters = record.voters.clone();
        cs.learners = record.learners.clone();
        self.save_conf_state(&cs)?;
        self.compact(record.index)
    }
}

impl RaftLogStore {
    /// Drop log entries at or below `up_to`. Callers must have a snapshot
    /// covering the dropped prefix.
    pub fn compact(&self, up_to: u64) -> QuarryResult<()> {
        let write_txn = self
            .database
            .begin_write()
            .map_err(|e| QuarryError::storage("begin write transaction", e))?;
        {
            let mut table = write_txn
                .open_table(RAFT_LOG_TABLE)
                .map_err(|e| QuarryError::storage("open raft log table", e))?;
            table
                .retain(|index, _| index > up_to)
                .map_err(|e| QuarryError::storage("compact raft log", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| QuarryError::storage("commit log compaction", e))?;
        Ok(())
    }
}

impl Storage for RaftLogStore {
    fn initial_state(&self) -> raft::Result<raft::RaftState> {
        let read_txn = self.database.begin_read().map_err(store_err)?;

        let hard_state = {
            let table = read_txn
                .open_table(RAFT_HARD_STATE_TABLE)
                .map_err(store_err)?;
            match table.get(HARD_STATE_KEY).map_err(store_err)? {
                Some(data) => {
                    let record: HardStateRecord =
                        bincode::deserialize(data.value()).map_err(store_err)?;
                    let mut hs = HardState::default();
                    hs.term = record.term;
                    hs.vote = record.vote;
                    hs.commit = record.commit;
                    hs
                }
                None => HardState::default(),
            }
        };

        let conf_state = self.load_conf_state().map_err(store_err)?;

        Ok(raft::RaftState::new(hard_state, conf_state))
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let max_size = max_size.into();
        let read_txn = self.database.begin_read().map_err(store_err)?;
        let table = read_txn.open_table(RAFT_LOG_TABLE).map_err(store_err)?;

        let mut entries = Vec::with_capacity((high - low).min(64) as usize);
        let mut size = 0u64;

        for idx in low..high {
            match table.get(&idx).map_err(store_err)? {
                Some(data) => {
                    let raw = data.value();
                    if let Some(max) = max_size {
                        if !entries.is_empty() && size + raw.len() as u64 > max {
                            break;
                        }
                    }
                    size += raw.len() as u64;
                    entries.push(decode_entry(raw).map_err(store_err)?);
                }
                None => return Err(raft::Error::Store(raft::StorageError::Unavailable)),
            }
        }

        Ok(entries)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        if idx == 0 {
            return Ok(0);
        }

        let read_txn = self.database.begin_read().map_err(store_err)?;
        let table = read_txn.open_table(RAFT_LOG_TABLE).map_err(store_err)?;

        if let Some(data) = table.get(&idx).map_err(store_err)? {
            return Ok(decode_entry(data.value()).map_err(store_err)?.term);
        }

        if let Some(record) = self.load_snapshot_record().map_err(store_err)? {
            if record.index == idx {
                return Ok(record.term);
            }
            if idx < record.index {
                return Err(raft::Error::Store(raft::StorageError::Compacted));
            }
        }

        Err(raft::Error::Store(raft::StorageError::Unavailable))
    }

    fn first_index(&self) -> raft::Result<u64> {
        let read_txn = self.database.begin_read().map_err(store_err)?;
        let table = read_txn.open_table(RAFT_LOG_TABLE).map_err(store_err)?;

        let mut iter = table.iter().map_err(store_err)?;
        if let Some(entry) = iter.next() {
            let (key, _) = entry.map_err(store_err)?;
            return Ok(key.value());
        }

        match self.load_snapshot_record().map_err(store_err)? {
            Some(record) => Ok(record.index + 1),
            None => Ok(1),
        }
    }

    fn last_index(&self) -> raft::Result<u64> {
        let read_txn = self.database.begin_read().map_err(store_err)?;
        let table = read_txn.open_table(RAFT_LOG_TABLE).map_err(store_err)?;

        let iter = table.iter().map_err(store_err)?;
        if let Some(entry) = iter.rev().next() {
            let (key, _) = entry.map_err(store_err)?;
            return Ok(key.value());
        }

        match self.load_snapshot_record().map_err(store_err)? {
            Some(record) => Ok(record.index),
            None => Ok(0),
        }
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let record = self
            .load_snapshot_record()
            .map_err(store_err)?
            .unwrap_or_default();

        if record.index < request_index {
            return Err(raft::Error::Store(
                raft::StorageError::SnapshotTemporarilyUnavailable,
            ));
        }

        let mut snapshot = Snapshot::default();
        let metadata = snapshot.mut_metadata();
        metadata.index = record.index;
        metadata.term = record.term;
        metadata.mut_conf_state().voters = record.voters;
        metadata.mut_conf_state().learners = record.learners;
        snapshot.data = record.data;
        Ok(snapshot)
    }
}
