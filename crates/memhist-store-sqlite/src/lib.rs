//! SQLite-backed writer for memory-access history databases.
//!
//! [`HistoryWriter`] drives one [`SliceBuilder`] per stored operation (read
//! and write). Accesses stream in through [`HistoryWriter::push`]; whenever a
//! builder limit refuses one, the current slice pair is materialized into the
//! database as one transaction and ingestion continues on fresh builders.
//! The store is laid out for range queries by transition, physical address
//! and operation, while the `accesses` table preserves the exact push order.

use std::collections::HashMap;
use std::mem;
use std::path::Path;

use memhist_core::{AccessError, AccessHandle, MemoryAccess, Operation, Slice, SliceBuilder};
use rusqlite::{params, Connection, Transaction};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Version of the on-disk format (schema and metadata layout).
pub const FORMAT_VERSION: &str = "1.0.0";
/// Version of this writer, appended to the `tool_info` metadata.
pub const WRITER_VERSION: &str = "1.1.0";
/// Name recorded in the `tool_info` metadata suffix.
pub const WRITER_NAME: &str = "rvnmemhistwriter";

const RESOURCE_TYPE: &str = "mem-hist";

// Capping values found empirically: the overlap limit keeps per-chunk query
// latency reasonable, the access-count limit caps peak RAM while building
// (10M accesses is roughly 3 GiB).
const CHUNK_SIZE_OVERLAP_LIMIT: u64 = 100_000;
const CHUNK_SIZE_TOUCH_LIMIT: u64 = 1_000;
const ACCESS_COUNT_LIMIT: u64 = 10_000_000;

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("execute accesses are not recorded in the history database")]
    UnsupportedOperation,
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to format the generation timestamp: {0}")]
    Timestamp(#[from] time::error::Format),
}

/// Per-access side data the slices do not carry: the virtual address and the
/// operation code, kept in push order so the `accesses` table can be written
/// in exactly that order. Handles point into the builders' arenas and die
/// with the slices, so the list is consumed and cleared within one flush.
struct AccessInfo {
    handle: AccessHandle,
    virtual_address: Option<u64>,
    operation: u8,
}

/// Plain-data chunk descriptor used for the flush-time chunk listing. Copied
/// out of the slices so the listing buffer can be reused across flushes.
struct ChunkEntry {
    operation: u8,
    phy_first: u64,
    phy_last: u64,
    head: AccessHandle,
}

/// Streaming writer for a memory-access history database.
///
/// Accesses must arrive with non-decreasing transition ids. Reads and writes
/// are aggregated independently but flushed as a pair: each flush appends one
/// `slices` row, its `chunks` rows, and the verbatim `accesses` rows inside a
/// single transaction.
///
/// Dropping the writer flushes whatever is still buffered and closes the
/// database; [`HistoryWriter::take`] does the same but hands the connection
/// back to the caller.
pub struct HistoryWriter {
    // `None` only after `take` surrendered the connection.
    conn: Option<Connection>,
    read_builder: SliceBuilder,
    write_builder: SliceBuilder,
    current_accesses: Vec<AccessInfo>,
    chunk_scratch: Vec<ChunkEntry>,
}

impl HistoryWriter {
    /// Create a new history database at `path` and stamp its metadata.
    ///
    /// # Errors
    /// Returns an error when the database cannot be created or initialized.
    pub fn open(
        path: &Path,
        tool_name: &str,
        tool_version: &str,
        tool_info: &str,
    ) -> Result<Self, WriterError> {
        let conn = Connection::open(path)?;
        let writer = Self::from_connection(conn, tool_name, tool_version, tool_info)?;
        tracing::info!(path = %path.display(), "created memory-access history database");
        Ok(writer)
    }

    /// Same as [`HistoryWriter::open`] but the store is ephemeral.
    ///
    /// # Errors
    /// Returns an error when the database cannot be initialized.
    pub fn open_in_memory(
        tool_name: &str,
        tool_version: &str,
        tool_info: &str,
    ) -> Result<Self, WriterError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, tool_name, tool_version, tool_info)
    }

    fn from_connection(
        conn: Connection,
        tool_name: &str,
        tool_version: &str,
        tool_info: &str,
    ) -> Result<Self, WriterError> {
        configure_for_ingest(&conn)?;
        stamp_metadata(&conn, tool_name, tool_version, tool_info)?;
        create_schema(&conn)?;
        Ok(Self {
            conn: Some(conn),
            read_builder: default_builder(),
            write_builder: default_builder(),
            current_accesses: Vec::new(),
            chunk_scratch: Vec::new(),
        })
    }

    /// Ingest one access.
    ///
    /// # Errors
    /// Returns [`WriterError::UnsupportedOperation`] for execute accesses,
    /// the underlying [`AccessError`] for malformed ones (zero size, address
    /// wraparound, backward transition), and sqlite errors when the push
    /// triggered a flush that failed. After a failed flush the writer state
    /// is unspecified; the caller should drop it.
    pub fn push(&mut self, access: &MemoryAccess) -> Result<(), WriterError> {
        if access.operation == Operation::Execute {
            return Err(WriterError::UnsupportedOperation);
        }

        let (icount, address, size) = (access.transition_id, access.physical_address, access.size);
        let inserted = self.builder_mut(access.operation).insert(icount, address, size)?;
        let handle = match inserted {
            Some(handle) => handle,
            None => {
                // A limit refused the access: materialize the current pair
                // and retry on the fresh builders.
                self.flush()?;
                self.builder_mut(access.operation)
                    .insert(icount, address, size)?
                    .expect("a fresh builder must accept any well-formed access")
            }
        };

        self.current_accesses.push(AccessInfo {
            handle,
            virtual_address: access.virtual_address,
            operation: access.operation.code(),
        });
        Ok(())
    }

    /// Remove all persisted accesses with `transition >= transition_count`.
    ///
    /// Meant to cap a recording after the fact, typically to drop a final
    /// transition that did not complete. The open slice pair is flushed
    /// unconditionally first. `chunks` and `slices` rows are not rewritten,
    /// so their bounding boxes may stay loose afterwards; readers resolve a
    /// chunk to its accesses and simply find fewer of them. Pushing after
    /// this call is undefined.
    ///
    /// # Errors
    /// Returns an error when the flush or the delete fails.
    pub fn discard_after(&mut self, transition_count: u64) -> Result<(), WriterError> {
        self.flush()?;
        let Some(conn) = self.conn.as_ref() else {
            return Ok(());
        };
        conn.execute(
            "delete from accesses where chunk_id >= (
                 select min(rowid) from chunks where slice_id = (
                     select min(rowid) from slices where transition_last >= ?1
                 )
             ) and transition >= ?1",
            params![transition_count as i64],
        )?;
        Ok(())
    }

    /// Flush and surrender the database connection.
    ///
    /// # Errors
    /// Returns an error when the final flush fails.
    pub fn take(mut self) -> Result<Connection, WriterError> {
        self.flush()?;
        Ok(self.conn.take().expect("connection is present until take"))
    }

    fn builder_mut(&mut self, operation: Operation) -> &mut SliceBuilder {
        match operation {
            Operation::Read => &mut self.read_builder,
            Operation::Write => &mut self.write_builder,
            Operation::Execute => unreachable!("execute accesses are rejected before builder selection"),
        }
    }

    /// Materialize the current slice pair into one database transaction and
    /// replace both builders. No-op while nothing is buffered.
    fn flush(&mut self) -> Result<(), WriterError> {
        if self.current_accesses.is_empty() {
            return Ok(());
        }
        let Some(conn) = self.conn.as_mut() else {
            return Ok(());
        };

        // At least one slice is non-empty because the access list is not.
        let read_slice = mem::replace(&mut self.read_builder, default_builder()).build();
        let write_slice = mem::replace(&mut self.write_builder, default_builder()).build();

        let tx = conn.transaction()?;
        let slice_id = insert_slice_row(&tx, &read_slice, &write_slice)?;

        self.chunk_scratch.clear();
        collect_chunks(&read_slice, Operation::Read.code(), &mut self.chunk_scratch);
        collect_chunks(&write_slice, Operation::Write.code(), &mut self.chunk_scratch);
        // Descending address order eases the backing store's index
        // maintenance; nothing depends on it for correctness.
        self.chunk_scratch.sort_by(|a, b| b.phy_first.cmp(&a.phy_first));

        let access_to_chunk =
            insert_chunk_rows(&tx, slice_id, &self.chunk_scratch, &read_slice, &write_slice)?;
        insert_access_rows(&tx, &self.current_accesses, &access_to_chunk, &read_slice, &write_slice)?;
        tx.commit()?;

        tracing::debug!(
            slice_id,
            chunks = self.chunk_scratch.len(),
            accesses = self.current_accesses.len(),
            "flushed slice pair"
        );

        // The slices die when this function returns, invalidating every
        // handle the list holds.
        self.current_accesses.clear();
        Ok(())
    }
}

impl Drop for HistoryWriter {
    fn drop(&mut self) {
        if self.conn.is_none() {
            return;
        }
        if let Err(err) = self.flush() {
            tracing::error!(%err, "failed to flush remaining accesses while closing the history database");
        }
    }
}

fn default_builder() -> SliceBuilder {
    SliceBuilder::new()
        .chunk_size_overlap_limit(CHUNK_SIZE_OVERLAP_LIMIT)
        .chunk_size_touch_limit(CHUNK_SIZE_TOUCH_LIMIT)
        .access_count_limit(ACCESS_COUNT_LIMIT)
}

// Durability is deliberately traded for ingest throughput; the database is
// rebuilt from the recording if a crash loses it.
fn configure_for_ingest(conn: &Connection) -> Result<(), WriterError> {
    conn.execute_batch(
        "pragma synchronous = off;
         pragma journal_mode = memory;
         pragma temp_store = memory;",
    )?;
    Ok(())
}

fn create_schema(conn: &Connection) -> Result<(), WriterError> {
    conn.execute_batch(
        "create table slices(transition_first int8 not null, transition_last int8 not null);
         create table chunks(slice_id int8 not null, phy_first int8 not null, phy_last int8 not null,
                             operation int not null);
         create table accesses(chunk_id int8 not null, transition int8 not null, linear int8,
                               phy_first int8 not null, size int not null, operation int not null);
         create index idx_slices_1 on slices(transition_last);
         create index idx_chunks_1 on chunks(operation, slice_id, phy_last);
         create index idx_accesses_1 on accesses(chunk_id, transition);
         create index idx_accesses_2 on accesses(transition);",
    )?;
    Ok(())
}

fn stamp_metadata(
    conn: &Connection,
    tool_name: &str,
    tool_version: &str,
    tool_info: &str,
) -> Result<(), WriterError> {
    conn.execute_batch("create table metadata(key text not null primary key, value text not null);")?;

    let generated_at = OffsetDateTime::now_utc().format(&Rfc3339)?;
    let tool_info = format!("{tool_info} - using {WRITER_NAME} {WRITER_VERSION}");
    let mut stmt = conn.prepare("insert into metadata values (?1, ?2)")?;
    for (key, value) in [
        ("type", RESOURCE_TYPE),
        ("format_version", FORMAT_VERSION),
        ("tool_name", tool_name),
        ("tool_version", tool_version),
        ("tool_info", tool_info.as_str()),
        ("generated_at", generated_at.as_str()),
    ] {
        stmt.execute(params![key, value])?;
    }
    Ok(())
}

/// Compute the slice-pair bounding box and append the `slices` row.
///
/// An empty slice's bounds are meaningless, so exactly-one-empty inherits the
/// other's bounds verbatim. Flushing an all-empty pair is an engine bug.
fn insert_slice_row(
    tx: &Transaction<'_>,
    read_slice: &Slice,
    write_slice: &Slice,
) -> Result<i64, WriterError> {
    assert!(
        !read_slice.is_empty() || !write_slice.is_empty(),
        "an all-empty slice pair must never be flushed"
    );

    let (transition_first, transition_last) = if read_slice.is_empty() {
        (write_slice.transition_first(), write_slice.transition_last())
    } else if write_slice.is_empty() {
        (read_slice.transition_first(), read_slice.transition_last())
    } else {
        (
            read_slice.transition_first().min(write_slice.transition_first()),
            read_slice.transition_last().max(write_slice.transition_last()),
        )
    };

    let mut stmt = tx.prepare_cached("insert into slices values (?1, ?2)")?;
    stmt.execute(params![transition_first as i64, transition_last as i64])?;
    Ok(tx.last_insert_rowid())
}

fn collect_chunks(slice: &Slice, operation: u8, out: &mut Vec<ChunkEntry>) {
    for chunk in slice.chunks() {
        out.push(ChunkEntry {
            operation,
            phy_first: chunk.address_first(),
            phy_last: chunk.address_last(),
            head: chunk.first_access(),
        });
    }
}

/// Append one `chunks` row per listed chunk and map every access it holds to
/// the freshly assigned chunk rowid.
fn insert_chunk_rows(
    tx: &Transaction<'_>,
    slice_id: i64,
    chunk_entries: &[ChunkEntry],
    read_slice: &Slice,
    write_slice: &Slice,
) -> Result<HashMap<(u8, AccessHandle), i64>, WriterError> {
    let mut access_to_chunk = HashMap::new();
    let mut stmt = tx.prepare_cached("insert into chunks values (?1, ?2, ?3, ?4)")?;
    for entry in chunk_entries {
        stmt.execute(params![
            slice_id,
            entry.phy_first as i64,
            entry.phy_last as i64,
            i64::from(entry.operation),
        ])?;
        let chunk_id = tx.last_insert_rowid();

        let slice = slice_for(entry.operation, read_slice, write_slice);
        let mut cursor = Some(entry.head);
        while let Some(handle) = cursor {
            access_to_chunk.insert((entry.operation, handle), chunk_id);
            cursor = slice.access(handle).next();
        }
    }
    Ok(access_to_chunk)
}

/// Append the `accesses` rows in exactly the order they were pushed.
fn insert_access_rows(
    tx: &Transaction<'_>,
    accesses: &[AccessInfo],
    access_to_chunk: &HashMap<(u8, AccessHandle), i64>,
    read_slice: &Slice,
    write_slice: &Slice,
) -> Result<(), WriterError> {
    let mut stmt = tx.prepare_cached("insert into accesses values (?1, ?2, ?3, ?4, ?5, ?6)")?;
    for info in accesses {
        let chunk_id = access_to_chunk
            .get(&(info.operation, info.handle))
            .copied()
            .expect("the chunk-id map must cover every flushed access");
        let access = slice_for(info.operation, read_slice, write_slice).access(info.handle);
        stmt.execute(params![
            chunk_id,
            access.transition as i64,
            info.virtual_address.map(|address| address as i64),
            access.address as i64,
            i64::from(access.size),
            i64::from(info.operation),
        ])?;
    }
    Ok(())
}

fn slice_for<'a>(operation: u8, read_slice: &'a Slice, write_slice: &'a Slice) -> &'a Slice {
    if operation == Operation::Read.code() {
        read_slice
    } else {
        write_slice
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOOL_NAME: &str = "memhist-tests";
    const TOOL_VERSION: &str = "1.0.0";
    const TOOL_INFO: &str = "memhist test fixture";

    fn test_writer() -> Result<HistoryWriter, WriterError> {
        HistoryWriter::open_in_memory(TOOL_NAME, TOOL_VERSION, TOOL_INFO)
    }

    fn access(
        transition_id: u64,
        physical_address: u64,
        operation: Operation,
    ) -> MemoryAccess {
        MemoryAccess {
            transition_id,
            physical_address,
            size: 10,
            virtual_address: Some(6666),
            operation,
        }
    }

    fn nominal_accesses() -> [MemoryAccess; 8] {
        [
            access(0, 10, Operation::Write),
            access(1, 100, Operation::Write),
            access(2, 1000, Operation::Write),
            access(3, 1005, Operation::Write),
            access(4, 10, Operation::Read),
            access(5, 100, Operation::Read),
            access(6, 1000, Operation::Read),
            access(7, 1005, Operation::Read),
        ]
    }

    fn query_i64s(conn: &Connection, sql: &str) -> Result<Vec<i64>, rusqlite::Error> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        rows.collect()
    }

    fn query_i64(conn: &Connection, sql: &str) -> Result<i64, rusqlite::Error> {
        conn.query_row(sql, [], |row| row.get(0))
    }

    fn slice_count(conn: &Connection) -> Result<i64, rusqlite::Error> {
        query_i64(conn, "select count(*) from slices")
    }

    fn chunk_count(conn: &Connection) -> Result<i64, rusqlite::Error> {
        query_i64(conn, "select count(*) from chunks")
    }

    fn access_count(conn: &Connection) -> Result<i64, rusqlite::Error> {
        query_i64(conn, "select count(*) from accesses")
    }

    fn is_access_present(
        conn: &Connection,
        access: &MemoryAccess,
    ) -> Result<bool, rusqlite::Error> {
        let count: i64 = conn.query_row(
            "select count(*) from accesses where transition = ?1 and phy_first = ?2
             and linear is ?3 and size = ?4 and operation = ?5",
            params![
                access.transition_id as i64,
                access.physical_address as i64,
                access.virtual_address.map(|address| address as i64),
                i64::from(access.size),
                i64::from(access.operation.code()),
            ],
            |row| row.get(0),
        )?;
        assert!(count < 2, "pushed tuples are unique in these fixtures");
        Ok(count == 1)
    }

    fn is_non_empty_and_sorted(values: &[i64]) -> bool {
        !values.is_empty() && values.windows(2).all(|pair| pair[0] <= pair[1])
    }

    #[test]
    fn nominal_ingest_aggregates_into_one_slice() -> Result<(), WriterError> {
        let mut writer = test_writer()?;
        for access in &nominal_accesses() {
            writer.push(access)?;
        }

        let conn = writer.take()?;
        assert_eq!(slice_count(&conn)?, 1);
        assert_eq!(chunk_count(&conn)?, 6);
        assert_eq!(access_count(&conn)?, 8);
        assert_eq!(query_i64(&conn, "select min(transition_first) from slices")?, 0);
        assert_eq!(query_i64(&conn, "select max(transition_last) from slices")?, 7);

        for access in &nominal_accesses() {
            assert!(is_access_present(&conn, access)?);
        }
        Ok(())
    }

    #[test]
    fn missing_virtual_address_is_stored_as_null() -> Result<(), WriterError> {
        let mut writer = test_writer()?;
        writer.push(&access(0, 10, Operation::Write))?;
        writer.push(&MemoryAccess {
            transition_id: 1,
            physical_address: 100,
            size: 10,
            virtual_address: None,
            operation: Operation::Write,
        })?;

        let conn = writer.take()?;
        assert_eq!(
            query_i64(&conn, "select count(*) from accesses where transition = 0 and linear = 6666")?,
            1
        );
        assert_eq!(
            query_i64(&conn, "select count(*) from accesses where transition = 1 and linear is null")?,
            1
        );
        Ok(())
    }

    #[test]
    fn discard_after_removes_the_last_transition() -> Result<(), WriterError> {
        let mut writer = test_writer()?;
        for access in &nominal_accesses() {
            writer.push(access)?;
        }
        writer.push(&access(7, 200, Operation::Write))?;
        writer.push(&access(7, 200, Operation::Read))?;
        writer.discard_after(7)?;

        let conn = writer.take()?;
        // Everything at transition 7 is gone, including the nominal read.
        assert_eq!(access_count(&conn)?, 7);
        // Chunks and slices are left as written.
        assert_eq!(slice_count(&conn)?, 1);
        assert_eq!(query_i64(&conn, "select max(transition_last) from slices")?, 7);
        Ok(())
    }

    #[test]
    fn chunk_and_access_ordering_follows_the_indexes() -> Result<(), WriterError> {
        let mut writer = test_writer()?;
        let accesses = [
            access(0, 10, Operation::Write),
            access(1, 1000, Operation::Write),
            access(2, 1, Operation::Read),
            access(2, 100, Operation::Read),
            access(4, 10, Operation::Read),
            access(4, 1005, Operation::Read),
            access(6, 100, Operation::Write),
            access(7, 1005, Operation::Read),
            access(12, 100, Operation::Read),
        ];
        for access in &accesses {
            writer.push(access)?;
        }

        let conn = writer.take()?;
        assert_eq!(slice_count(&conn)?, 1);

        // Rowid order coincides with address order per operation, a
        // consequence of the descending-address chunk insertion.
        for operation in [Operation::Read, Operation::Write] {
            let phy_firsts = query_i64s(
                &conn,
                &format!(
                    "select phy_first from chunks where operation = {} and slice_id = 1
                     order by rowid",
                    operation.code()
                ),
            )?;
            assert!(is_non_empty_and_sorted(&phy_firsts));
        }

        // Within a chunk, accesses come back ordered by transition.
        let max_chunk_id = query_i64(&conn, "select max(rowid) from chunks")?;
        for chunk_id in 1..=max_chunk_id {
            let transitions = query_i64s(
                &conn,
                &format!(
                    "select transition from accesses where chunk_id = {chunk_id} order by rowid"
                ),
            )?;
            assert!(is_non_empty_and_sorted(&transitions));
        }
        Ok(())
    }

    #[test]
    fn accesses_rows_preserve_push_order() -> Result<(), WriterError> {
        let mut writer = test_writer()?;
        let pushed = [
            access(0, 500, Operation::Write),
            access(0, 20, Operation::Read),
            access(1, 510, Operation::Write),
            access(2, 5, Operation::Read),
            access(2, 505, Operation::Read),
        ];
        for access in &pushed {
            writer.push(access)?;
        }

        let conn = writer.take()?;
        let stored: Vec<i64> = query_i64s(&conn, "select phy_first from accesses order by rowid")?;
        let expected: Vec<i64> =
            pushed.iter().map(|access| access.physical_address as i64).collect();
        assert_eq!(stored, expected);
        Ok(())
    }

    #[test]
    fn execute_accesses_are_rejected() -> Result<(), WriterError> {
        let mut writer = test_writer()?;
        let err = writer.push(&access(0, 10, Operation::Execute)).expect_err("execute refused");
        assert!(matches!(err, WriterError::UnsupportedOperation));

        // The rejection leaves the writer usable and the store untouched.
        writer.push(&access(0, 10, Operation::Write))?;
        let conn = writer.take()?;
        assert_eq!(access_count(&conn)?, 1);
        assert_eq!(
            query_i64(
                &conn,
                &format!(
                    "select count(*) from accesses where operation = {}",
                    Operation::Execute.code()
                )
            )?,
            0
        );
        Ok(())
    }

    #[test]
    fn malformed_accesses_propagate_as_errors() -> Result<(), WriterError> {
        let mut writer = test_writer()?;
        let mut zero = access(0, 10, Operation::Write);
        zero.size = 0;
        assert!(matches!(
            writer.push(&zero).expect_err("zero size refused"),
            WriterError::Access(AccessError::InvalidSize)
        ));

        writer.push(&access(5, 10, Operation::Write))?;
        assert!(matches!(
            writer.push(&access(4, 20, Operation::Write)).expect_err("backward refused"),
            WriterError::Access(AccessError::BackwardTransition { .. })
        ));
        Ok(())
    }

    #[test]
    fn limit_refusal_splits_the_stream_into_slice_pairs() -> Result<(), WriterError> {
        let mut writer = test_writer()?;
        // Narrow builders so the third transition overflows the span limit.
        writer.read_builder = SliceBuilder::new().transition_limit(2);
        writer.write_builder = SliceBuilder::new().transition_limit(2);

        writer.push(&access(0, 10, Operation::Write))?;
        writer.push(&access(1, 100, Operation::Write))?;
        writer.push(&access(1, 100, Operation::Read))?;
        // Span would become 3: refused, flushed, retried on fresh builders.
        writer.push(&access(2, 1000, Operation::Write))?;
        writer.push(&access(3, 1010, Operation::Write))?;

        let conn = writer.take()?;
        assert_eq!(slice_count(&conn)?, 2);
        assert_eq!(access_count(&conn)?, 5);

        let firsts = query_i64s(&conn, "select transition_first from slices order by rowid")?;
        let lasts = query_i64s(&conn, "select transition_last from slices order by rowid")?;
        assert_eq!(firsts, [0, 2]);
        assert_eq!(lasts, [1, 3]);
        // Push order survives the flush boundary.
        let transitions = query_i64s(&conn, "select transition from accesses order by rowid")?;
        assert_eq!(transitions, [0, 1, 1, 2, 3]);
        Ok(())
    }

    #[test]
    fn metadata_is_stamped_at_open() -> Result<(), WriterError> {
        let writer = test_writer()?;
        let conn = writer.take()?;

        let value = |key: &str| -> Result<String, rusqlite::Error> {
            conn.query_row("select value from metadata where key = ?1", params![key], |row| {
                row.get(0)
            })
        };
        assert_eq!(value("type")?, "mem-hist");
        assert_eq!(value("format_version")?, FORMAT_VERSION);
        assert_eq!(value("tool_name")?, TOOL_NAME);
        assert_eq!(value("tool_version")?, TOOL_VERSION);
        assert_eq!(value("tool_info")?, "memhist test fixture - using rvnmemhistwriter 1.1.0");
        Ok(())
    }

    #[test]
    fn boundary_addresses_reach_the_store() -> Result<(), WriterError> {
        let mut writer = test_writer()?;
        let mut top = access(0, u64::MAX, Operation::Write);
        top.size = 1;
        writer.push(&top)?;

        let conn = writer.take()?;
        assert_eq!(access_count(&conn)?, 1);
        // u64 addresses are stored as two's-complement int8.
        assert_eq!(query_i64(&conn, "select phy_first from accesses")?, -1);
        assert_eq!(query_i64(&conn, "select phy_first from chunks")?, -1);
        assert_eq!(query_i64(&conn, "select phy_last from chunks")?, -1);
        Ok(())
    }
}
