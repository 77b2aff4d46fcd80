//! Object files and the directories that contain them.
//!
//! This module defines the `Symbol` record extracted from ELF object
//! files, the `SymbolType` classification, and the `BinaryDirectory`
//! scanner that enumerates candidate object files and computes the
//! change set relative to a previous indexing run.

pub mod compdb;
pub mod elf;

pub use compdb::{CompdbCache, CompilationDatabase};
pub use elf::{read_symtable, ExtractOptions};

use std::collections::HashSet;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::Result;
use globset::{Glob, GlobMatcher};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};

/// Magic bytes at the start of every ELF file.
const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// The type of a symbol, as stored in the ELF symbol table entry.
///
/// Unknown `STT_*` codes fall back to `Notype` so that exotic object
/// files still index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SymbolType {
    Notype,
    Object,
    Func,
    Section,
    File,
    Common,
    Tls,
    Num,
    Relc,
    Srelc,
    Loos,
    LoosPlusOne,
    Hios,
    Loproc,
    LoprocPlusOne,
    Hiproc,
}

impl SymbolType {
    /// All known symbol types, in ELF code order.
    pub const ALL: [SymbolType; 16] = [
        SymbolType::Notype,
        SymbolType::Object,
        SymbolType::Func,
        SymbolType::Section,
        SymbolType::File,
        SymbolType::Common,
        SymbolType::Tls,
        SymbolType::Num,
        SymbolType::Relc,
        SymbolType::Srelc,
        SymbolType::Loos,
        SymbolType::LoosPlusOne,
        SymbolType::Hios,
        SymbolType::Loproc,
        SymbolType::LoprocPlusOne,
        SymbolType::Hiproc,
    ];

    /// Map a raw `st_info` type code to a `SymbolType`.
    pub fn from_elf_code(code: u8) -> SymbolType {
        match code {
            0 => SymbolType::Notype,
            1 => SymbolType::Object,
            2 => SymbolType::Func,
            3 => SymbolType::Section,
            4 => SymbolType::File,
            5 => SymbolType::Common,
            6 => SymbolType::Tls,
            7 => SymbolType::Num,
            8 => SymbolType::Relc,
            9 => SymbolType::Srelc,
            10 => SymbolType::Loos,
            11 => SymbolType::LoosPlusOne,
            12 => SymbolType::Hios,
            13 => SymbolType::Loproc,
            14 => SymbolType::LoprocPlusOne,
            15 => SymbolType::Hiproc,
            _ => SymbolType::Notype,
        }
    }

    /// Canonical upper-case name, e.g. `"FUNC"`.
    pub fn name(&self) -> &'static str {
        match self {
            SymbolType::Notype => "NOTYPE",
            SymbolType::Object => "OBJECT",
            SymbolType::Func => "FUNC",
            SymbolType::Section => "SECTION",
            SymbolType::File => "FILE",
            SymbolType::Common => "COMMON",
            SymbolType::Tls => "TLS",
            SymbolType::Num => "NUM",
            SymbolType::Relc => "RELC",
            SymbolType::Srelc => "SRELC",
            SymbolType::Loos => "LOOS",
            SymbolType::LoosPlusOne => "LOOS_PLUS_ONE",
            SymbolType::Hios => "HIOS",
            SymbolType::Loproc => "LOPROC",
            SymbolType::LoprocPlusOne => "LOPROC_PLUS_ONE",
            SymbolType::Hiproc => "HIPROC",
        }
    }

    /// Case-insensitive lookup by canonical name.
    pub fn from_name(name: &str) -> Option<SymbolType> {
        SymbolType::ALL
            .iter()
            .copied()
            .find(|t| t.name().eq_ignore_ascii_case(name))
    }
}

impl Default for SymbolType {
    fn default() -> Self {
        SymbolType::Notype
    }
}

/// A symbol extracted from an object file's symbol table.
///
/// Identity (equality and hashing) is defined by
/// `(path, name, address, section)`; the remaining fields are payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    /// Absolute path of the containing object file.
    pub path: PathBuf,
    /// Originating source file, when attribution succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    /// Raw, possibly mangled identifier.
    pub name: String,
    /// Name of the containing section, or `""` when unresolved.
    pub section: String,
    /// Offset within the section.
    pub address: u64,
    /// Size in bytes.
    pub size: u64,
    #[serde(rename = "type", default)]
    pub sym_type: SymbolType,
    /// Names of symbols this symbol references, sorted and deduplicated.
    #[serde(default)]
    pub relocations: Vec<String>,
    /// Modification time of the object file at extraction, in
    /// nanoseconds since the Unix epoch.
    #[serde(default)]
    pub mtime: u64,
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
            && self.name == other.name
            && self.address == other.address
            && self.section == other.section
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
        self.name.hash(state);
        self.address.hash(state);
        self.section.hash(state);
    }
}

impl Symbol {
    /// Placeholder document for an object file with no indexable
    /// symbols, so that the file still counts as indexed.
    pub fn placeholder(path: PathBuf, mtime: u64) -> Symbol {
        Symbol {
            path,
            source: None,
            name: String::new(),
            section: String::new(),
            address: 0,
            size: 0,
            sym_type: SymbolType::Notype,
            relocations: Vec::new(),
            mtime,
        }
    }
}

/// Modification time of a file in nanoseconds since the Unix epoch.
pub fn file_mtime(path: &Path) -> Result<u64> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0))
}

/// True if the file starts with the ELF magic bytes.
pub fn is_elf_file(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    match File::open(path).and_then(|mut f| f.read_exact(&mut magic)) {
        Ok(()) => magic == ELF_MAGIC,
        Err(_) => false,
    }
}

/// A directory tree containing zero or more object files.
///
/// Knows how to enumerate candidate files (recursive `*.o` glob, or the
/// outputs of a compilation database) and to diff the current state
/// against a previous indexing run.
pub struct BinaryDirectory {
    path: PathBuf,
    last_mtime: u64,
    previous_file_list: HashSet<PathBuf>,
    compdb_outputs: Option<Vec<PathBuf>>,
    matcher: GlobMatcher,
}

impl BinaryDirectory {
    pub fn new(path: impl Into<PathBuf>) -> BinaryDirectory {
        BinaryDirectory {
            path: path.into(),
            last_mtime: 0,
            previous_file_list: HashSet::new(),
            compdb_outputs: None,
            matcher: Glob::new("*.o")
                .expect("static glob pattern")
                .compile_matcher(),
        }
    }

    /// Carry forward the state of a previous run: the index mtime and
    /// the list of files it knew about.
    pub fn with_state(
        mut self,
        last_mtime: u64,
        previous_file_list: impl IntoIterator<Item = PathBuf>,
    ) -> BinaryDirectory {
        self.last_mtime = last_mtime;
        self.previous_file_list = previous_file_list.into_iter().collect();
        self
    }

    /// Restrict discovery to the object files named by a compilation
    /// database instead of globbing the tree.
    pub fn with_compilation_database(mut self, compdb: &CompilationDatabase) -> BinaryDirectory {
        self.compdb_outputs = Some(compdb.all_outputs());
        self
    }

    /// Files that are new or were modified since the last run.
    pub fn changed_files(&self) -> Result<Vec<PathBuf>> {
        let mut changed = Vec::new();

        for path in self.find_files() {
            let is_new = !self.previous_file_list.contains(&path);
            let mtime = file_mtime(&path).unwrap_or(0);

            if is_new || mtime > self.last_mtime {
                changed.push(path);
            }
        }

        changed.sort();
        Ok(changed)
    }

    /// Files known to the previous run that no longer exist.
    pub fn deleted_files(&self) -> Result<Vec<PathBuf>> {
        let current: HashSet<PathBuf> = self.find_files().into_iter().collect();

        let mut deleted: Vec<PathBuf> = self
            .previous_file_list
            .iter()
            .filter(|p| !current.contains(*p))
            .cloned()
            .collect();

        deleted.sort();
        Ok(deleted)
    }

    fn find_files(&self) -> Vec<PathBuf> {
        if let Some(outputs) = &self.compdb_outputs {
            return outputs
                .iter()
                .filter(|p| p.is_file() && is_elf_file(p))
                .cloned()
                .collect();
        }

        let mut files = Vec::new();
        let walker = WalkBuilder::new(&self.path)
            .standard_filters(false)
            .build();

        for entry in walker.flatten() {
            let path = entry.path();
            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }
            if !self.matcher.is_match(path) {
                continue;
            }
            if !is_elf_file(path) {
                continue;
            }
            files.push(path.to_path_buf());
        }

        files
    }
}
