//! SQLite backing store for the scavenge state.
//!
//! One file, one writer. Every mutation happens inside an explicit
//! `BEGIN IMMEDIATE` transaction owned by the pipeline stage; the
//! checkpoint row is written by the same transaction that commits the
//! stage's progress.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use thiserror::Error;

use crate::core::{
    ChunkTimeRange, DiscardPoint, MetastreamData, OriginalStreamData, ScavengeCheckpoint,
    StreamHash, StreamMetadata, StreamStatus,
};
use crate::error::Transience;

const STATE_SCHEMA_VERSION: u32 = 1;
const BUSY_TIMEOUT_MS: u64 = 5_000;
const CACHE_SIZE_KB: i64 = -8_000;
const STATE_FILE_NAME: &str = "scavenge.sqlite";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state schema version mismatch: expected {expected}, got {got}")]
    SchemaVersionMismatch { expected: u32, got: u32 },
    #[error("checkpoint encode failed: {0}")]
    CheckpointEncode(#[source] serde_json::Error),
    #[error("checkpoint decode failed: {0}")]
    CheckpointDecode(#[source] serde_json::Error),
    #[error("state row invalid: {reason}")]
    RowInvalid { reason: String },
    #[error("transaction already open")]
    TransactionOpen,
    #[error("no open transaction")]
    NoTransaction,
}

impl StateError {
    pub fn transience(&self) -> Transience {
        match self {
            StateError::Sqlite(_) | StateError::Io { .. } => Transience::Unknown,
            StateError::SchemaVersionMismatch { .. }
            | StateError::CheckpointEncode(_)
            | StateError::CheckpointDecode(_)
            | StateError::RowInvalid { .. }
            | StateError::TransactionOpen
            | StateError::NoTransaction => Transience::Permanent,
        }
    }
}

pub(crate) struct StateStore {
    conn: Connection,
    in_txn: bool,
}

impl StateStore {
    pub fn open(store_dir: &Path) -> Result<Self, StateError> {
        std::fs::create_dir_all(store_dir).map_err(|source| StateError::Io {
            path: store_dir.to_path_buf(),
            source,
        })?;
        let db_path = store_dir.join(STATE_FILE_NAME);
        let conn = open_connection(&db_path)?;
        Self::initialize(conn)
    }

    /// In-memory store for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory()?;
        apply_pragmas(&conn)?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Self, StateError> {
        let is_new = !table_exists(&conn, "meta")?;
        if is_new {
            initialize_schema(&conn)?;
            set_meta(
                &conn,
                "state_schema_version",
                STATE_SCHEMA_VERSION.to_string(),
            )?;
        } else {
            validate_schema_version(&conn)?;
        }
        Ok(Self {
            conn,
            in_txn: false,
        })
    }

    pub fn begin(&mut self) -> Result<(), StateError> {
        if self.in_txn {
            return Err(StateError::TransactionOpen);
        }
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        self.in_txn = true;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), StateError> {
        if !self.in_txn {
            return Err(StateError::NoTransaction);
        }
        self.conn.execute_batch("COMMIT")?;
        self.in_txn = false;
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<(), StateError> {
        if !self.in_txn {
            return Ok(());
        }
        self.conn.execute_batch("ROLLBACK")?;
        self.in_txn = false;
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.in_txn
    }

    // --- checkpoint ---

    pub fn checkpoint(&self) -> Result<Option<ScavengeCheckpoint>, StateError> {
        let payload: Option<String> = self
            .conn
            .query_row("SELECT payload FROM checkpoint WHERE id = 0", [], |row| {
                row.get(0)
            })
            .optional()?;
        match payload {
            Some(payload) => serde_json::from_str(&payload)
                .map(Some)
                .map_err(StateError::CheckpointDecode),
            None => Ok(None),
        }
    }

    pub fn set_checkpoint(&mut self, checkpoint: &ScavengeCheckpoint) -> Result<(), StateError> {
        let payload =
            serde_json::to_string(checkpoint).map_err(StateError::CheckpointEncode)?;
        self.conn.execute(
            "INSERT INTO checkpoint (id, payload) VALUES (0, ?1) \
             ON CONFLICT(id) DO UPDATE SET payload = excluded.payload",
            params![payload],
        )?;
        Ok(())
    }

    // --- collisions and hashes ---

    pub fn collisions(&self) -> Result<Vec<String>, StateError> {
        let mut stmt = self
            .conn
            .prepare("SELECT stream_id FROM collisions ORDER BY stream_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn add_collision(&mut self, stream_id: &str) -> Result<(), StateError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO collisions (stream_id) VALUES (?1)",
            params![stream_id],
        )?;
        Ok(())
    }

    pub fn hash_owner(&self, hash: StreamHash) -> Result<Option<String>, StateError> {
        let owner = self
            .conn
            .query_row(
                "SELECT stream_id FROM hashes WHERE hash = ?1",
                params![hash.get() as i64],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(owner)
    }

    pub fn record_hash(&mut self, hash: StreamHash, stream_id: &str) -> Result<(), StateError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO hashes (hash, stream_id) VALUES (?1, ?2)",
            params![hash.get() as i64, stream_id],
        )?;
        Ok(())
    }

    // --- metastream data ---

    pub fn metastream_by_hash(
        &self,
        hash: StreamHash,
    ) -> Result<Option<MetastreamData>, StateError> {
        let row = self
            .conn
            .query_row(
                "SELECT original_stream_hash, discard_point, is_tombstoned, last_metadata_position \
                 FROM metastream_data_hash WHERE hash = ?1",
                params![hash.get() as i64],
                metastream_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn metastream_by_id(&self, stream_id: &str) -> Result<Option<MetastreamData>, StateError> {
        let row = self
            .conn
            .query_row(
                "SELECT original_stream_hash, discard_point, is_tombstoned, last_metadata_position \
                 FROM metastream_data_id WHERE stream_id = ?1",
                params![stream_id],
                metastream_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn upsert_metastream_by_hash(
        &mut self,
        hash: StreamHash,
        data: &MetastreamData,
    ) -> Result<(), StateError> {
        self.conn.execute(
            "INSERT INTO metastream_data_hash \
             (hash, original_stream_hash, discard_point, is_tombstoned, last_metadata_position) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(hash) DO UPDATE SET \
               original_stream_hash = excluded.original_stream_hash, \
               discard_point = excluded.discard_point, \
               is_tombstoned = excluded.is_tombstoned, \
               last_metadata_position = excluded.last_metadata_position",
            params![
                hash.get() as i64,
                data.original_stream_hash.get() as i64,
                data.discard_point.first_to_keep(),
                data.is_tombstoned as i64,
                data.last_metadata_position.map(|value| value as i64),
            ],
        )?;
        Ok(())
    }

    pub fn upsert_metastream_by_id(
        &mut self,
        stream_id: &str,
        hash: StreamHash,
        data: &MetastreamData,
    ) -> Result<(), StateError> {
        self.conn.execute(
            "INSERT INTO metastream_data_id \
             (stream_id, hash, original_stream_hash, discard_point, is_tombstoned, last_metadata_position) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(stream_id) DO UPDATE SET \
               hash = excluded.hash, \
               original_stream_hash = excluded.original_stream_hash, \
               discard_point = excluded.discard_point, \
               is_tombstoned = excluded.is_tombstoned, \
               last_metadata_position = excluded.last_metadata_position",
            params![
                stream_id,
                hash.get() as i64,
                data.original_stream_hash.get() as i64,
                data.discard_point.first_to_keep(),
                data.is_tombstoned as i64,
                data.last_metadata_position.map(|value| value as i64),
            ],
        )?;
        Ok(())
    }

    pub fn take_metastream_by_hash(
        &mut self,
        hash: StreamHash,
    ) -> Result<Option<MetastreamData>, StateError> {
        let row = self.metastream_by_hash(hash)?;
        if row.is_some() {
            self.conn.execute(
                "DELETE FROM metastream_data_hash WHERE hash = ?1",
                params![hash.get() as i64],
            )?;
        }
        Ok(row)
    }

    // --- original stream data ---

    pub fn original_by_hash(
        &self,
        hash: StreamHash,
    ) -> Result<Option<OriginalStreamData>, StateError> {
        let row = self
            .conn
            .query_row(
                "SELECT max_count, max_age_ms, truncate_before, is_tombstoned, status, \
                        discard_point, maybe_discard_point \
                 FROM original_stream_data_hash WHERE hash = ?1",
                params![hash.get() as i64],
                original_from_row,
            )
            .optional()?
            .transpose()?;
        Ok(row)
    }

    pub fn original_by_id(
        &self,
        stream_id: &str,
    ) -> Result<Option<OriginalStreamData>, StateError> {
        let row = self
            .conn
            .query_row(
                "SELECT max_count, max_age_ms, truncate_before, is_tombstoned, status, \
                        discard_point, maybe_discard_point \
                 FROM original_stream_data_id WHERE stream_id = ?1",
                params![stream_id],
                original_from_row,
            )
            .optional()?
            .transpose()?;
        Ok(row)
    }

    pub fn upsert_original_by_hash(
        &mut self,
        hash: StreamHash,
        data: &OriginalStreamData,
    ) -> Result<(), StateError> {
        self.conn.execute(
            "INSERT INTO original_stream_data_hash \
             (hash, max_count, max_age_ms, truncate_before, is_tombstoned, status, \
              discard_point, maybe_discard_point) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(hash) DO UPDATE SET \
               max_count = excluded.max_count, \
               max_age_ms = excluded.max_age_ms, \
               truncate_before = excluded.truncate_before, \
               is_tombstoned = excluded.is_tombstoned, \
               status = excluded.status, \
               discard_point = excluded.discard_point, \
               maybe_discard_point = excluded.maybe_discard_point",
            params![
                hash.get() as i64,
                data.metadata.max_count.map(|value| value as i64),
                data.metadata.max_age_ms.map(|value| value as i64),
                data.metadata.truncate_before,
                data.is_tombstoned as i64,
                data.status.as_i64(),
                data.discard_point.first_to_keep(),
                data.maybe_discard_point.first_to_keep(),
            ],
        )?;
        Ok(())
    }

    pub fn upsert_original_by_id(
        &mut self,
        stream_id: &str,
        hash: StreamHash,
        data: &OriginalStreamData,
    ) -> Result<(), StateError> {
        self.conn.execute(
            "INSERT INTO original_stream_data_id \
             (stream_id, hash, max_count, max_age_ms, truncate_before, is_tombstoned, status, \
              discard_point, maybe_discard_point) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(stream_id) DO UPDATE SET \
               hash = excluded.hash, \
               max_count = excluded.max_count, \
               max_age_ms = excluded.max_age_ms, \
               truncate_before = excluded.truncate_before, \
               is_tombstoned = excluded.is_tombstoned, \
               status = excluded.status, \
               discard_point = excluded.discard_point, \
               maybe_discard_point = excluded.maybe_discard_point",
            params![
                stream_id,
                hash.get() as i64,
                data.metadata.max_count.map(|value| value as i64),
                data.metadata.max_age_ms.map(|value| value as i64),
                data.metadata.truncate_before,
                data.is_tombstoned as i64,
                data.status.as_i64(),
                data.discard_point.first_to_keep(),
                data.maybe_discard_point.first_to_keep(),
            ],
        )?;
        Ok(())
    }

    pub fn take_original_by_hash(
        &mut self,
        hash: StreamHash,
    ) -> Result<Option<OriginalStreamData>, StateError> {
        let row = self.original_by_hash(hash)?;
        if row.is_some() {
            self.conn.execute(
                "DELETE FROM original_stream_data_hash WHERE hash = ?1",
                params![hash.get() as i64],
            )?;
        }
        Ok(row)
    }

    /// Active originals on the non-colliding side, hash ascending,
    /// strictly after `cursor`.
    pub fn active_originals_by_hash_after(
        &self,
        cursor: Option<StreamHash>,
        limit: usize,
    ) -> Result<Vec<(StreamHash, OriginalStreamData)>, StateError> {
        let after = cursor.map(|hash| hash.get() as i64).unwrap_or(i64::MIN);
        let mut stmt = self.conn.prepare(
            "SELECT hash, max_count, max_age_ms, truncate_before, is_tombstoned, status, \
                    discard_point, maybe_discard_point \
             FROM original_stream_data_hash \
             WHERE status = 0 AND hash > ?1 ORDER BY hash LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after, limit as i64], |row| {
            let hash: i64 = row.get(0)?;
            Ok((hash, original_columns(row, 1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (hash, columns) = row?;
            out.push((StreamHash::new(hash as u64), original_from_columns(columns)?));
        }
        Ok(out)
    }

    /// Active originals on the colliding side, stream id ascending,
    /// strictly after `cursor`.
    pub fn active_originals_by_id_after(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, StreamHash, OriginalStreamData)>, StateError> {
        let after = cursor.unwrap_or("");
        let mut stmt = self.conn.prepare(
            "SELECT stream_id, hash, max_count, max_age_ms, truncate_before, is_tombstoned, \
                    status, discard_point, maybe_discard_point \
             FROM original_stream_data_id \
             WHERE status = 0 AND stream_id > ?1 ORDER BY stream_id LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after, limit as i64], |row| {
            let stream_id: String = row.get(0)?;
            let hash: i64 = row.get(1)?;
            Ok((stream_id, hash, original_columns(row, 2)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (stream_id, hash, columns) = row?;
            out.push((
                stream_id,
                StreamHash::new(hash as u64),
                original_from_columns(columns)?,
            ));
        }
        Ok(out)
    }

    // --- chunk time ranges and weights ---

    pub fn chunk_time_range(&self, chunk: u32) -> Result<Option<ChunkTimeRange>, StateError> {
        let row = self
            .conn
            .query_row(
                "SELECT min_ms, max_ms FROM chunk_time_stamp_ranges WHERE chunk = ?1",
                params![chunk as i64],
                |row| {
                    Ok(ChunkTimeRange {
                        min_ms: row.get::<_, i64>(0)? as u64,
                        max_ms: row.get::<_, i64>(1)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn widen_chunk_time_range(
        &mut self,
        chunk: u32,
        timestamp_ms: u64,
    ) -> Result<(), StateError> {
        self.conn.execute(
            "INSERT INTO chunk_time_stamp_ranges (chunk, min_ms, max_ms) VALUES (?1, ?2, ?2) \
             ON CONFLICT(chunk) DO UPDATE SET \
               min_ms = MIN(min_ms, excluded.min_ms), \
               max_ms = MAX(max_ms, excluded.max_ms)",
            params![chunk as i64, timestamp_ms as i64],
        )?;
        Ok(())
    }

    pub fn add_chunk_weight(&mut self, chunk: u32, weight: f64) -> Result<(), StateError> {
        self.conn.execute(
            "INSERT INTO chunk_weights (chunk, weight) VALUES (?1, ?2) \
             ON CONFLICT(chunk) DO UPDATE SET weight = weight + excluded.weight",
            params![chunk as i64, weight],
        )?;
        Ok(())
    }

    pub fn sum_chunk_weights(&self, start: u32, end: u32) -> Result<f64, StateError> {
        let sum: f64 = self.conn.query_row(
            "SELECT COALESCE(SUM(weight), 0) FROM chunk_weights WHERE chunk BETWEEN ?1 AND ?2",
            params![start as i64, end as i64],
            |row| row.get(0),
        )?;
        Ok(sum)
    }

    pub fn reset_chunk_weights(&mut self, start: u32, end: u32) -> Result<(), StateError> {
        self.conn.execute(
            "DELETE FROM chunk_weights WHERE chunk BETWEEN ?1 AND ?2",
            params![start as i64, end as i64],
        )?;
        Ok(())
    }

    // --- cleaner ---

    /// Delete executed per-stream rows. Returns (originals,
    /// metastreams) deleted.
    pub fn prune(&mut self, include_archived: bool) -> Result<(u64, u64), StateError> {
        let status_filter = if include_archived {
            "status IN (1, 2)"
        } else {
            "status = 1"
        };
        let originals = self.conn.execute(
            &format!("DELETE FROM original_stream_data_hash WHERE {status_filter}"),
            [],
        )? + self.conn.execute(
            &format!("DELETE FROM original_stream_data_id WHERE {status_filter}"),
            [],
        )?;

        // Metastream rows survive only while their original is still
        // active on either side.
        let metastreams = self.conn.execute(
            "DELETE FROM metastream_data_hash WHERE \
               original_stream_hash NOT IN \
                 (SELECT hash FROM original_stream_data_hash WHERE status = 0) \
               AND original_stream_hash NOT IN \
                 (SELECT hash FROM original_stream_data_id WHERE status = 0)",
            [],
        )? + self.conn.execute(
            "DELETE FROM metastream_data_id WHERE \
               original_stream_hash NOT IN \
                 (SELECT hash FROM original_stream_data_hash WHERE status = 0) \
               AND original_stream_hash NOT IN \
                 (SELECT hash FROM original_stream_data_id WHERE status = 0)",
            [],
        )?;

        Ok((originals as u64, metastreams as u64))
    }
}

type OriginalColumns = (
    Option<i64>,
    Option<i64>,
    Option<i64>,
    i64,
    i64,
    i64,
    i64,
);

fn original_columns(
    row: &rusqlite::Row<'_>,
    offset: usize,
) -> rusqlite::Result<OriginalColumns> {
    Ok((
        row.get(offset)?,
        row.get(offset + 1)?,
        row.get(offset + 2)?,
        row.get(offset + 3)?,
        row.get(offset + 4)?,
        row.get(offset + 5)?,
        row.get(offset + 6)?,
    ))
}

fn original_from_columns(columns: OriginalColumns) -> Result<OriginalStreamData, StateError> {
    let (max_count, max_age_ms, truncate_before, is_tombstoned, status, discard, maybe) = columns;
    let status = StreamStatus::from_i64(status).ok_or_else(|| StateError::RowInvalid {
        reason: format!("unknown stream status {status}"),
    })?;
    Ok(OriginalStreamData {
        metadata: StreamMetadata {
            max_count: max_count.map(|value| value as u64),
            max_age_ms: max_age_ms.map(|value| value as u64),
            truncate_before,
        },
        is_tombstoned: is_tombstoned != 0,
        status,
        discard_point: DiscardPoint::discard_before(discard),
        maybe_discard_point: DiscardPoint::discard_before(maybe),
    })
}

fn original_from_row(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<Result<OriginalStreamData, StateError>> {
    Ok(original_from_columns(original_columns(row, 0)?))
}

fn metastream_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetastreamData> {
    let original_stream_hash: i64 = row.get(0)?;
    let discard_point: i64 = row.get(1)?;
    let is_tombstoned: i64 = row.get(2)?;
    let last_metadata_position: Option<i64> = row.get(3)?;
    Ok(MetastreamData {
        original_stream_hash: StreamHash::new(original_stream_hash as u64),
        discard_point: DiscardPoint::discard_before(discard_point),
        is_tombstoned: is_tombstoned != 0,
        last_metadata_position: last_metadata_position.map(|value| value as u64),
    })
}

fn open_connection(path: &Path) -> Result<Connection, StateError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let conn = Connection::open_with_flags(path, flags)?;
    apply_pragmas(&conn)?;
    Ok(conn)
}

fn apply_pragmas(conn: &Connection) -> Result<(), StateError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", CACHE_SIZE_KB)?;
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
    Ok(())
}

fn initialize_schema(conn: &Connection) -> Result<(), StateError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (
           key TEXT PRIMARY KEY,
           value TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS collisions (
           stream_id TEXT PRIMARY KEY
         );
         CREATE TABLE IF NOT EXISTS hashes (
           hash INTEGER PRIMARY KEY,
           stream_id TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS metastream_data_hash (
           hash INTEGER PRIMARY KEY,
           original_stream_hash INTEGER NOT NULL,
           discard_point INTEGER NOT NULL,
           is_tombstoned INTEGER NOT NULL,
           last_metadata_position INTEGER
         );
         CREATE TABLE IF NOT EXISTS metastream_data_id (
           stream_id TEXT PRIMARY KEY,
           hash INTEGER NOT NULL,
           original_stream_hash INTEGER NOT NULL,
           discard_point INTEGER NOT NULL,
           is_tombstoned INTEGER NOT NULL,
           last_metadata_position INTEGER
         );
         CREATE TABLE IF NOT EXISTS original_stream_data_hash (
           hash INTEGER PRIMARY KEY,
           max_count INTEGER,
           max_age_ms INTEGER,
           truncate_before INTEGER,
           is_tombstoned INTEGER NOT NULL,
           status INTEGER NOT NULL,
           discard_point INTEGER NOT NULL,
           maybe_discard_point INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS original_stream_data_id (
           stream_id TEXT PRIMARY KEY,
           hash INTEGER NOT NULL,
           max_count INTEGER,
           max_age_ms INTEGER,
           truncate_before INTEGER,
           is_tombstoned INTEGER NOT NULL,
           status INTEGER NOT NULL,
           discard_point INTEGER NOT NULL,
           maybe_discard_point INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS chunk_time_stamp_ranges (
           chunk INTEGER PRIMARY KEY,
           min_ms INTEGER NOT NULL,
           max_ms INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS chunk_weights (
           chunk INTEGER PRIMARY KEY,
           weight REAL NOT NULL
         );
         CREATE TABLE IF NOT EXISTS checkpoint (
           id INTEGER PRIMARY KEY CHECK (id = 0),
           payload TEXT NOT NULL
         );",
    )?;
    Ok(())
}

fn validate_schema_version(conn: &Connection) -> Result<(), StateError> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'state_schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    let got = stored
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(0);
    if got != STATE_SCHEMA_VERSION {
        return Err(StateError::SchemaVersionMismatch {
            expected: STATE_SCHEMA_VERSION,
            got,
        });
    }
    Ok(())
}

fn set_meta(conn: &Connection, key: &'static str, value: String) -> Result<(), StateError> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool, StateError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
