//! The persistent symbol index.
//!
//! An index lives in a directory holding one primary database (`db`)
//! plus any number of writable shards (`db.000`, `db.001`, ...).
//! Readers union every member into one view; each writer owns exactly
//! one member, so parallel indexing never contends on a database.
//!
//! The primary carries the process-global metadata: the serialized
//! schema (checked on every open) and the indexed binary directory.

pub mod database;
pub mod pipeline;
pub mod query;
pub mod schema;

pub use pipeline::{index_binary_directory, IndexingOptions, IndexingStats};
pub use query::Query;
pub use schema::Schema;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::binary::Symbol;
use crate::search::parser::{ParseError, QueryParser};
use database::Database;

/// Metadata key holding the serialized schema.
pub const METADATA_SCHEMA: &str = "__schema__";
/// Metadata key holding the indexed binary directory.
pub const METADATA_BINARY_DIR: &str = "binary_dir";

/// Name of the primary database inside an index directory.
const PRIMARY_NAME: &str = "db";

/// Structural errors from the index store.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index does not exist: {0}")]
    DoesNotExist(PathBuf),
    #[error("index is open for reading only: {0}")]
    ReadOnly(PathBuf),
    #[error("already inside a transaction")]
    TransactionInProgress,
    #[error("index was modified during the scan, reopen it and retry")]
    Modified,
    #[error("schema on disk is different than the one in code")]
    SchemaMismatch,
    #[error("no free shard slot under {0}")]
    NoShardSlot(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Database(rusqlite::Error),
}

impl From<rusqlite::Error> for IndexError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        if let rusqlite::Error::SqliteFailure(e, _) = &err {
            if matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) {
                return IndexError::Modified;
            }
        }
        IndexError::Database(err)
    }
}

/// A symbol index handle: either a read view over every member, or a
/// writable handle to exactly one member.
pub struct SymbolIndex {
    path: PathBuf,
    schema: Schema,
    members: Vec<Database>,
    writable: bool,
}

impl SymbolIndex {
    /// Open the index at `path` for reading, unioning the primary and
    /// every shard.
    pub fn open(path: &Path) -> Result<SymbolIndex, IndexError> {
        SymbolIndex::open_with_schema(path, Schema::symbols())
    }

    pub fn open_with_schema(path: &Path, schema: Schema) -> Result<SymbolIndex, IndexError> {
        let primary_path = path.join(PRIMARY_NAME);
        if !primary_path.is_file() {
            return Err(IndexError::DoesNotExist(path.to_path_buf()));
        }

        let mut members = vec![Database::open_readonly(&primary_path)?];
        for shard in shard_paths(path)? {
            members.push(Database::open_readonly(&shard)?);
        }

        for member in &members {
            check_schema(member, &schema)?;
        }

        Ok(SymbolIndex {
            path: path.to_path_buf(),
            schema,
            members,
            writable: false,
        })
    }

    /// Open the primary writable, creating the index directory if
    /// needed. Existing shards open writable too, so that deletions
    /// reach documents written by earlier runs.
    pub fn open_writable(path: &Path) -> Result<SymbolIndex, IndexError> {
        SymbolIndex::open_writable_with_schema(path, Schema::symbols())
    }

    pub fn open_writable_with_schema(
        path: &Path,
        schema: Schema,
    ) -> Result<SymbolIndex, IndexError> {
        std::fs::create_dir_all(path)?;
        let mut db = Database::open_writable(&path.join(PRIMARY_NAME))?;
        check_schema(&db, &schema)?;
        persist_schema(&mut db, &schema)?;

        let mut members = vec![db];
        for shard in shard_paths(path)? {
            let shard_db = Database::open_writable(&shard)?;
            check_schema(&shard_db, &schema)?;
            members.push(shard_db);
        }

        Ok(SymbolIndex {
            path: path.to_path_buf(),
            schema,
            members,
            writable: true,
        })
    }

    /// Claim the first free shard slot (`db.000`, `db.001`, ...) and
    /// open it writable.
    pub fn open_shard(path: &Path) -> Result<SymbolIndex, IndexError> {
        SymbolIndex::open_shard_with_schema(path, Schema::symbols())
    }

    pub fn open_shard_with_schema(path: &Path, schema: Schema) -> Result<SymbolIndex, IndexError> {
        std::fs::create_dir_all(path)?;

        for slot in 0..1000 {
            let shard_path = path.join(format!("{PRIMARY_NAME}.{slot:03}"));
            if shard_path.exists() {
                continue;
            }

            let mut db = Database::open_writable(&shard_path)?;
            check_schema(&db, &schema)?;
            persist_schema(&mut db, &schema)?;

            return Ok(SymbolIndex {
                path: path.to_path_buf(),
                schema,
                members: vec![db],
                writable: true,
            });
        }

        Err(IndexError::NoShardSlot(path.to_path_buf()))
    }

    /// Default index location for a binary directory:
    /// `$XDG_CACHE_HOME/bdx/index/<path with separators as "!">`.
    pub fn default_path(directory: &Path) -> PathBuf {
        let cache_root = std::env::var_os("XDG_CACHE_HOME")
            .map(PathBuf::from)
            .or_else(dirs::cache_dir)
            .unwrap_or_else(|| PathBuf::from(".cache"));

        let encoded: Vec<String> = directory
            .components()
            .filter_map(|c| match c {
                std::path::Component::Normal(part) => {
                    Some(part.to_string_lossy().into_owned())
                }
                _ => None,
            })
            .collect();

        cache_root.join("bdx").join("index").join(encoded.join("!"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    fn primary(&self) -> &Database {
        &self.members[0]
    }

    fn writable_member(&mut self) -> Result<&mut Database, IndexError> {
        if !self.writable {
            return Err(IndexError::ReadOnly(self.path.clone()));
        }
        Ok(&mut self.members[0])
    }

    /// Run `f` inside a transaction spanning every writable member.
    /// Errors roll back; success commits.
    pub fn transaction<T, F>(&mut self, f: F) -> Result<T, IndexError>
    where
        F: FnOnce(&mut SymbolIndex) -> Result<T, IndexError>,
    {
        if !self.writable {
            return Err(IndexError::ReadOnly(self.path.clone()));
        }
        if self.members.iter().any(Database::in_transaction) {
            return Err(IndexError::TransactionInProgress);
        }

        for member in &mut self.members {
            member.begin()?;
        }

        match f(self) {
            Ok(value) => {
                for member in &mut self.members {
                    member.commit()?;
                }
                Ok(value)
            }
            Err(err) => {
                for member in &mut self.members {
                    member.rollback()?;
                }
                Err(err)
            }
        }
    }

    /// Index one symbol as a new document. The full record is stored
    /// alongside the terms so a search result reconstructs it.
    pub fn add_symbol(&mut self, symbol: &Symbol) -> Result<(), IndexError> {
        let document = self.schema.index_symbol(symbol);
        let data = serde_json::to_vec(symbol)?;
        self.writable_member()?
            .add_document(&document.terms, &document.slots, &data)?;
        Ok(())
    }

    /// Remove every document whose path term matches `file`, across
    /// every writable member.
    pub fn delete_file(&mut self, file: &Path) -> Result<usize, IndexError> {
        if !self.writable {
            return Err(IndexError::ReadOnly(self.path.clone()));
        }

        let term = self.path_term(file);
        let mut removed = 0;
        for member in &mut self.members {
            removed += member.delete_by_term(&term)?;
        }
        Ok(removed)
    }

    fn path_term(&self, file: &Path) -> Vec<u8> {
        let prefix = self
            .schema
            .field("path")
            .map(|f| f.prefix.as_str())
            .unwrap_or("XP");
        let mut term = prefix.as_bytes().to_vec();
        term.extend_from_slice(file.to_string_lossy().as_bytes());
        term
    }

    /// All indexed object files, lexicographically. Only absolute
    /// path terms are reported; basename terms are skipped.
    pub fn all_files(&self) -> Result<Vec<PathBuf>, IndexError> {
        let prefix = self
            .schema
            .field("path")
            .map(|f| f.prefix.as_str())
            .unwrap_or("XP");

        let mut files = Vec::new();
        for member in &self.members {
            for term in member.terms_with_prefix(prefix.as_bytes())? {
                let value = String::from_utf8_lossy(&term[prefix.len()..]).into_owned();
                if value.starts_with('/') {
                    files.push(PathBuf::from(value));
                }
            }
        }

        files.sort();
        files.dedup();
        Ok(files)
    }

    /// Execute `query`, skipping the first `first` matches and
    /// yielding at most `limit`.
    pub fn search(
        &self,
        query: &Query,
        first: usize,
        limit: Option<usize>,
    ) -> Result<Vec<Symbol>, IndexError> {
        let mut skipped = 0;
        let mut symbols = Vec::new();

        'members: for member in &self.members {
            for doc_id in member.eval(query)? {
                if skipped < first {
                    skipped += 1;
                    continue;
                }
                if let Some(limit) = limit {
                    if symbols.len() >= limit {
                        break 'members;
                    }
                }

                let data = member.documents_data(&[doc_id])?;
                let symbol: Symbol = serde_json::from_slice(&data[0])?;
                symbols.push(symbol);
            }
        }

        Ok(symbols)
    }

    /// Parse a user query string with this index's schema, using the
    /// default search fields and implicit wildcarding.
    pub fn parse_query(&self, text: &str) -> Result<Query, ParseError> {
        QueryParser::new(&self.schema)
            .default_fields(&["name"])
            .auto_wildcard(true)
            .parse(text)
    }

    /// Parse and run a query in one step.
    pub fn search_str(&self, text: &str) -> Result<Vec<Symbol>, anyhow::Error> {
        let query = self.parse_query(text)?;
        Ok(self.search(&query, 0, None)?)
    }

    /// Total number of documents across all members.
    pub fn doc_count(&self) -> Result<u64, IndexError> {
        let mut total = 0;
        for member in &self.members {
            total += member.doc_count()?;
        }
        Ok(total)
    }

    /// Modification time of the index: the maximum mtime slot across
    /// every document, or the epoch when empty.
    pub fn mtime(&self) -> Result<u64, IndexError> {
        let mut max = 0;
        for member in &self.members {
            if let Some(value) = member.max_slot_value(schema::SLOT_MTIME)? {
                max = max.max(value);
            }
        }
        Ok(max)
    }

    /// The binary directory this index was built from, when set.
    pub fn binary_dir(&self) -> Result<Option<PathBuf>, IndexError> {
        let value = self.primary().get_metadata(METADATA_BINARY_DIR)?;
        Ok(value.map(|bytes| PathBuf::from(String::from_utf8_lossy(&bytes).into_owned())))
    }

    pub fn set_binary_dir(&mut self, directory: &Path) -> Result<(), IndexError> {
        let value = directory.to_string_lossy().into_owned();
        self.writable_member()?
            .set_metadata(METADATA_BINARY_DIR, value.as_bytes())
    }
}

fn check_schema(db: &Database, schema: &Schema) -> Result<(), IndexError> {
    if let Some(stored) = db.get_metadata(METADATA_SCHEMA)? {
        let stored: Schema = serde_json::from_slice(&stored)?;
        if &stored != schema {
            return Err(IndexError::SchemaMismatch);
        }
    }
    Ok(())
}

fn persist_schema(db: &mut Database, schema: &Schema) -> Result<(), IndexError> {
    let serialized = serde_json::to_vec(schema)?;
    db.set_metadata(METADATA_SCHEMA, &serialized)
}

/// Existing shard databases under `path`, ordered by slot suffix.
fn shard_paths(path: &Path) -> Result<Vec<PathBuf>, IndexError> {
    let mut shards = Vec::new();

    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if let Some(suffix) = name.strip_prefix("db.") {
            if suffix.len() == 3 && suffix.bytes().all(|b| b.is_ascii_digit()) {
                shards.push(entry.path());
            }
        }
    }

    shards.sort();
    Ok(shards)
}
