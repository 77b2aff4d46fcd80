//! The incremental indexing pipeline.
//!
//! One run computes the change set against the previous index state,
//! deletes stale documents through the writable primary, then fans the
//! changed files out to a pool of workers. Every worker owns a fresh
//! shard and writes inside a single transaction, so an interrupted run
//! commits whole files or nothing.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use crossbeam_channel::Receiver;
use log::{debug, info, warn};

use crate::binary::compdb::{CompdbCache, COMPDB_FILENAME};
use crate::binary::{
    file_mtime, read_symtable, BinaryDirectory, CompilationDatabase, ExtractOptions, Symbol,
};
use crate::index::{IndexError, SymbolIndex};
use crate::sigint;

/// Options for one indexing run.
#[derive(Debug, Clone)]
pub struct IndexingOptions {
    /// Skip symbols smaller than this many bytes.
    pub min_symbol_size: u64,
    /// Resolve and index outgoing relocations.
    pub index_relocations: bool,
    /// Discover object files and source attribution through
    /// `compile_commands.json`; its absence becomes a fatal error.
    pub use_compilation_database: bool,
    /// Recover source attribution with `dwarfdump` when the
    /// compilation database does not know a file.
    pub use_dwarfdump: bool,
    /// Number of parallel workers.
    pub num_processes: usize,
}

impl Default for IndexingOptions {
    fn default() -> Self {
        IndexingOptions {
            min_symbol_size: 1,
            index_relocations: true,
            use_compilation_database: false,
            use_dwarfdump: false,
            num_processes: num_cpus::get(),
        }
    }
}

impl IndexingOptions {
    /// Option keys accepted by [`IndexingOptions::set`].
    pub const KEYS: [&'static str; 5] = [
        "min_symbol_size",
        "index_relocations",
        "use_compilation_database",
        "use_dwarfdump",
        "num_processes",
    ];

    /// Apply one `key=value` override.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "min_symbol_size" => {
                self.min_symbol_size = value
                    .parse()
                    .with_context(|| format!("invalid min_symbol_size: {value}"))?;
            }
            "index_relocations" => self.index_relocations = parse_bool(key, value)?,
            "use_compilation_database" => {
                self.use_compilation_database = parse_bool(key, value)?;
            }
            "use_dwarfdump" => self.use_dwarfdump = parse_bool(key, value)?,
            "num_processes" => {
                self.num_processes = value
                    .parse()
                    .with_context(|| format!("invalid num_processes: {value}"))?;
            }
            _ => bail!(
                "unknown indexing option {key:?}, must be one of [{}]",
                IndexingOptions::KEYS.join(", ")
            ),
        }
        Ok(())
    }

    fn extract_options(&self) -> ExtractOptions {
        ExtractOptions {
            min_symbol_size: self.min_symbol_size,
            index_relocations: self.index_relocations,
            use_dwarfdump: self.use_dwarfdump,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("invalid boolean for {key}: {value}"),
    }
}

/// Counters reported by one indexing run.
#[derive(Debug, Default, Clone, Copy)]
pub struct IndexingStats {
    pub num_files_changed: usize,
    pub num_files_deleted: usize,
    pub num_files_indexed: usize,
    pub num_symbols_indexed: usize,
}

/// Index `directory` into the index at `index_path`.
pub fn index_binary_directory(
    directory: &Path,
    index_path: &Path,
    options: &IndexingOptions,
) -> Result<IndexingStats> {
    let directory = directory
        .canonicalize()
        .with_context(|| format!("binary directory not accessible: {}", directory.display()))?;

    let mut stats = IndexingStats::default();

    let mut index = SymbolIndex::open_writable(index_path)?;
    if index.binary_dir()?.is_none() {
        index.set_binary_dir(&directory)?;
    }

    let compdb_path = if options.use_compilation_database {
        match CompilationDatabase::find_in(&directory) {
            Some(path) => Some(path),
            None => bail!(
                "compilation database not found: {}",
                directory.join(COMPDB_FILENAME).display()
            ),
        }
    } else {
        None
    };

    let mut compdb_cache = CompdbCache::new();
    let compdb = match &compdb_path {
        Some(path) => Some(compdb_cache.get(path)?),
        None => None,
    };

    let last_mtime = index.mtime()?;
    let previous_files = index.all_files()?;

    let mut bdir = BinaryDirectory::new(&directory).with_state(last_mtime, previous_files);
    if let Some(db) = &compdb {
        bdir = bdir.with_compilation_database(db);
    }

    let changed_files = bdir.changed_files()?;
    let deleted_files = bdir.deleted_files()?;
    stats.num_files_changed = changed_files.len();
    stats.num_files_deleted = deleted_files.len();

    debug!(
        "{} changed and {} deleted files under {}",
        changed_files.len(),
        deleted_files.len(),
        directory.display()
    );

    // Drop stale documents before the workers reinsert, keeping one
    // document set per file.
    index.transaction(|idx| {
        for file in changed_files.iter().chain(&deleted_files) {
            idx.delete_file(file)?;
        }
        Ok(())
    })?;
    drop(index);

    if changed_files.is_empty() {
        return Ok(stats);
    }

    sigint::install();

    let num_workers = options.num_processes.max(1).min(changed_files.len());

    // Shards are claimed on the main thread so slot assignment cannot
    // race, then each one moves into its worker.
    let mut shards = Vec::with_capacity(num_workers);
    for _ in 0..num_workers {
        shards.push(SymbolIndex::open_shard(index_path)?);
    }

    let (sender, receiver) = crossbeam_channel::unbounded::<PathBuf>();
    let extract = options.extract_options();

    let worker_results: Vec<Result<(usize, usize), IndexError>> =
        std::thread::scope(|scope| {
            let handles: Vec<_> = shards
                .into_iter()
                .map(|shard| {
                    let receiver = receiver.clone();
                    let extract = extract.clone();
                    let compdb_path = compdb_path.clone();
                    scope.spawn(move || worker(shard, receiver, extract, compdb_path))
                })
                .collect();
            drop(receiver);

            for file in &changed_files {
                if sigint::interrupted() {
                    warn!("Interrupted, letting workers commit and exit");
                    break;
                }
                if sender.send(file.clone()).is_err() {
                    break;
                }
            }
            drop(sender);

            handles
                .into_iter()
                .map(|handle| handle.join().expect("indexing worker panicked"))
                .collect()
        });

    for result in worker_results {
        let (files, symbols) = result?;
        stats.num_files_indexed += files;
        stats.num_symbols_indexed += symbols;
    }

    info!(
        "indexed {} files ({} symbols) into {}",
        stats.num_files_indexed,
        stats.num_symbols_indexed,
        index_path.display()
    );

    Ok(stats)
}

/// One worker: drain the queue into the owned shard inside a single
/// transaction. Per-file failures are logged and skipped.
fn worker(
    mut shard: SymbolIndex,
    receiver: Receiver<PathBuf>,
    extract: ExtractOptions,
    compdb_path: Option<PathBuf>,
) -> Result<(usize, usize), IndexError> {
    let mut files_indexed = 0;
    let mut symbols_indexed = 0;
    let mut compdb_cache = CompdbCache::new();

    shard.transaction(|idx| {
        while let Ok(file) = receiver.recv() {
            if sigint::interrupted() {
                break;
            }

            let compdb = compdb_path
                .as_ref()
                .and_then(|path| compdb_cache.get(path).ok());

            let documents = match collect_file_documents(&file, &extract, compdb.as_deref()) {
                Ok(documents) => documents,
                Err(err) => {
                    warn!("{}: {:#}", file.display(), err);
                    continue;
                }
            };

            for symbol in &documents {
                idx.add_symbol(symbol)?;
            }

            files_indexed += 1;
            symbols_indexed += documents.len();
        }
        Ok(())
    })?;

    Ok((files_indexed, symbols_indexed))
}

/// Extract the symbols of one file, substituting a placeholder when
/// there is nothing to index so the file still counts as indexed.
fn collect_file_documents(
    file: &Path,
    extract: &ExtractOptions,
    compdb: Option<&CompilationDatabase>,
) -> Result<Vec<Symbol>> {
    let symbols = read_symtable(file, extract, compdb)?;
    if symbols.is_empty() {
        let mtime = file_mtime(file)?;
        return Ok(vec![Symbol::placeholder(file.to_path_buf(), mtime)]);
    }
    Ok(symbols)
}
