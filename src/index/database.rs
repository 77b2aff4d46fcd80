//! Single-database inverted index on SQLite.
//!
//! One `Database` is one SQLite file holding four tables:
//!
//! - `meta(key TEXT PRIMARY KEY, value BLOB)`: opaque metadata.
//! - `documents(id INTEGER PRIMARY KEY, data BLOB)`: the serialized
//!   record each document reconstructs to.
//! - `terms(term BLOB, doc_id INTEGER)`: the inverted term index;
//!   terms carry their field prefix.
//! - `slots(doc_id INTEGER, slot INTEGER, value BLOB)`: numeric
//!   value slots, stored as 8-byte big-endian so BLOB comparison
//!   orders like the integer value.
//!
//! The connection uses WAL with `synchronous = NORMAL` and a busy
//! timeout, mirroring a read-heavy workload with a single writer per
//! file. Higher-level concerns (schema checking, shard union) live in
//! the `SymbolIndex` façade.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::index::query::Query;
use crate::index::schema::sortable_bytes;
use crate::index::IndexError;

pub struct Database {
    path: PathBuf,
    conn: Connection,
    writable: bool,
    in_transaction: bool,
}

impl Database {
    /// Open (or create) a writable database at `path`.
    pub fn open_writable(path: &Path) -> Result<Database, IndexError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(IndexError::Io)?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let conn = Connection::open_with_flags(path, flags)?;
        Self::configure(&conn)?;
        Self::initialize_tables(&conn)?;

        Ok(Database {
            path: path.to_path_buf(),
            conn,
            writable: true,
            in_transaction: false,
        })
    }

    /// Open an existing database read-only.
    pub fn open_readonly(path: &Path) -> Result<Database, IndexError> {
        if !path.is_file() {
            return Err(IndexError::DoesNotExist(path.to_path_buf()));
        }

        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;

        Ok(Database {
            path: path.to_path_buf(),
            conn,
            writable: false,
            in_transaction: false,
        })
    }

    fn configure(conn: &Connection) -> Result<(), IndexError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;
        Ok(())
    }

    fn initialize_tables(conn: &Connection) -> Result<(), IndexError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key   TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS documents (
                id   INTEGER PRIMARY KEY,
                data BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS terms (
                term   BLOB NOT NULL,
                doc_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_terms_term ON terms(term, doc_id);
            CREATE INDEX IF NOT EXISTS idx_terms_doc ON terms(doc_id);

            CREATE TABLE IF NOT EXISTS slots (
                doc_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                slot   INTEGER NOT NULL,
                value  BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_slots_slot_value ON slots(slot, value);
            CREATE INDEX IF NOT EXISTS idx_slots_doc ON slots(doc_id);
        "#,
        )?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn require_writable(&self) -> Result<(), IndexError> {
        if self.writable {
            Ok(())
        } else {
            Err(IndexError::ReadOnly(self.path.clone()))
        }
    }

    /// Begin a transaction. Nested begins fail with
    /// `TransactionInProgress`.
    pub fn begin(&mut self) -> Result<(), IndexError> {
        self.require_writable()?;
        if self.in_transaction {
            return Err(IndexError::TransactionInProgress);
        }
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        self.in_transaction = true;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), IndexError> {
        if !self.in_transaction {
            return Ok(());
        }
        self.conn.execute_batch("COMMIT")?;
        self.in_transaction = false;
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<(), IndexError> {
        if !self.in_transaction {
            return Ok(());
        }
        self.conn.execute_batch("ROLLBACK")?;
        self.in_transaction = false;
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Add one document with its terms, slots, and opaque data blob.
    pub fn add_document(
        &mut self,
        terms: &[Vec<u8>],
        slots: &[(u16, u64)],
        data: &[u8],
    ) -> Result<i64, IndexError> {
        self.require_writable()?;

        self.conn
            .execute("INSERT INTO documents (data) VALUES (?1)", params![data])?;
        let doc_id = self.conn.last_insert_rowid();

        {
            let mut stmt = self
                .conn
                .prepare_cached("INSERT INTO terms (term, doc_id) VALUES (?1, ?2)")?;
            let mut unique: Vec<&Vec<u8>> = terms.iter().collect();
            unique.sort();
            unique.dedup();
            for term in unique {
                stmt.execute(params![term, doc_id])?;
            }
        }

        {
            let mut stmt = self
                .conn
                .prepare_cached("INSERT INTO slots (doc_id, slot, value) VALUES (?1, ?2, ?3)")?;
            for (slot, value) in slots {
                stmt.execute(params![doc_id, slot, sortable_bytes(*value).to_vec()])?;
            }
        }

        Ok(doc_id)
    }

    /// Delete every document carrying the given term. Returns the
    /// number of documents removed.
    pub fn delete_by_term(&mut self, term: &[u8]) -> Result<usize, IndexError> {
        self.require_writable()?;
        let deleted = self.conn.execute(
            "DELETE FROM documents
             WHERE id IN (SELECT doc_id FROM terms WHERE term = ?1)",
            params![term],
        )?;
        Ok(deleted)
    }

    pub fn doc_count(&self) -> Result<u64, IndexError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>, IndexError> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_metadata(&mut self, key: &str, value: &[u8]) -> Result<(), IndexError> {
        self.require_writable()?;
        self.conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// All distinct terms starting with `prefix`, in term order.
    pub fn terms_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, IndexError> {
        let mut terms = Vec::new();

        match prefix_upper_bound(prefix) {
            Some(upper) => {
                let mut stmt = self.conn.prepare_cached(
                    "SELECT DISTINCT term FROM terms
                     WHERE term >= ?1 AND term < ?2 ORDER BY term",
                )?;
                let rows = stmt.query_map(params![prefix, upper], |row| row.get(0))?;
                for row in rows {
                    terms.push(row?);
                }
            }
            None => {
                let mut stmt = self.conn.prepare_cached(
                    "SELECT DISTINCT term FROM terms WHERE term >= ?1 ORDER BY term",
                )?;
                let rows = stmt.query_map(params![prefix], |row| row.get(0))?;
                for row in rows {
                    terms.push(row?);
                }
            }
        }

        Ok(terms)
    }

    /// Upper bound of a value slot across all documents.
    pub fn max_slot_value(&self, slot: u16) -> Result<Option<u64>, IndexError> {
        let value: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT MAX(value) FROM slots WHERE slot = ?1",
                params![slot],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        Ok(value.and_then(|bytes| {
            let array: [u8; 8] = bytes.try_into().ok()?;
            Some(u64::from_be_bytes(array))
        }))
    }

    /// Evaluate a query to the sorted set of matching document ids.
    pub fn eval(&self, query: &Query) -> Result<Vec<i64>, IndexError> {
        match query {
            Query::Empty => Ok(Vec::new()),
            Query::MatchAll => self.collect_ids("SELECT id FROM documents ORDER BY id", &[]),
            Query::Term(term) => self.collect_ids(
                "SELECT DISTINCT doc_id FROM terms WHERE term = ?1 ORDER BY doc_id",
                &[term],
            ),
            Query::Wildcard(stem) => match prefix_upper_bound(stem) {
                Some(upper) => self.collect_ids(
                    "SELECT DISTINCT doc_id FROM terms
                     WHERE term >= ?1 AND term < ?2 ORDER BY doc_id",
                    &[stem, &upper],
                ),
                None => self.collect_ids(
                    "SELECT DISTINCT doc_id FROM terms WHERE term >= ?1 ORDER BY doc_id",
                    &[stem],
                ),
            },
            Query::ValueRange { slot, low, high } => self.collect_slot_ids(
                "SELECT DISTINCT doc_id FROM slots
                 WHERE slot = ?1 AND value >= ?2 AND value <= ?3 ORDER BY doc_id",
                *slot,
                &[&sortable_bytes(*low)[..], &sortable_bytes(*high)[..]],
            ),
            Query::ValueGe { slot, low } => self.collect_slot_ids(
                "SELECT DISTINCT doc_id FROM slots
                 WHERE slot = ?1 AND value >= ?2 ORDER BY doc_id",
                *slot,
                &[&sortable_bytes(*low)[..]],
            ),
            Query::ValueLe { slot, high } => self.collect_slot_ids(
                "SELECT DISTINCT doc_id FROM slots
                 WHERE slot = ?1 AND value <= ?2 ORDER BY doc_id",
                *slot,
                &[&sortable_bytes(*high)[..]],
            ),
            Query::And(subqueries) => {
                let mut result: Option<Vec<i64>> = None;
                for sub in subqueries {
                    let ids = self.eval(sub)?;
                    result = Some(match result {
                        None => ids,
                        Some(acc) => intersect_sorted(&acc, &ids),
                    });
                    if result.as_ref().map(Vec::is_empty).unwrap_or(false) {
                        break;
                    }
                }
                Ok(result.unwrap_or_default())
            }
            Query::Or(subqueries) => {
                let mut result = Vec::new();
                for sub in subqueries {
                    result = union_sorted(&result, &self.eval(sub)?);
                }
                Ok(result)
            }
            Query::AndNot(left, right) => {
                let keep = self.eval(left)?;
                if keep.is_empty() {
                    return Ok(keep);
                }
                let drop = self.eval(right)?;
                Ok(difference_sorted(&keep, &drop))
            }
        }
    }

    /// Fetch the data blobs for the given document ids, in id order.
    pub fn documents_data(&self, ids: &[i64]) -> Result<Vec<Vec<u8>>, IndexError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT data FROM documents WHERE id = ?1")?;

        let mut blobs = Vec::with_capacity(ids.len());
        for id in ids {
            let data: Option<Vec<u8>> = stmt
                .query_row(params![id], |row| row.get(0))
                .optional()?;
            match data {
                Some(data) => blobs.push(data),
                // A term row pointing at a missing document means the
                // database changed underneath the scan.
                None => return Err(IndexError::Modified),
            }
        }

        Ok(blobs)
    }

    fn collect_ids(&self, sql: &str, args: &[&Vec<u8>]) -> Result<Vec<i64>, IndexError> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let mut rows = match args {
            [] => stmt.query([])?,
            [a] => stmt.query(params![a])?,
            [a, b] => stmt.query(params![a, b])?,
            _ => unreachable!("term queries take at most two arguments"),
        };

        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            ids.push(row.get(0)?);
        }
        Ok(ids)
    }

    fn collect_slot_ids(
        &self,
        sql: &str,
        slot: u16,
        bounds: &[&[u8]],
    ) -> Result<Vec<i64>, IndexError> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let mut rows = match bounds {
            [a] => stmt.query(params![slot, a])?,
            [a, b] => stmt.query(params![slot, a, b])?,
            _ => unreachable!("slot queries take one or two bounds"),
        };

        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            ids.push(row.get(0)?);
        }
        Ok(ids)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if self.in_transaction {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

/// Smallest byte string strictly greater than every string with the
/// given prefix, or `None` when the prefix is all `0xff`.
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.last() {
        if *last < 0xff {
            *upper.last_mut().expect("non-empty") += 1;
            return Some(upper);
        }
        upper.pop();
    }
    None
}

fn intersect_sorted(a: &[i64], b: &[i64]) -> Vec<i64> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

fn union_sorted(a: &[i64], b: &[i64]) -> Vec<i64> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

fn difference_sorted(a: &[i64], b: &[i64]) -> Vec<i64> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() {
        if j >= b.len() || a[i] < b[j] {
            out.push(a[i]);
            i += 1;
        } else if a[i] > b[j] {
            j += 1;
        } else {
            i += 1;
            j += 1;
        }
    }
    out
}
