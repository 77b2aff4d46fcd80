//! Compilation database (`compile_commands.json`) reading.
//!
//! Each entry maps a source file to the object file its compilation
//! produced. The object path is taken from an explicit `output` field
//! when present, otherwise extracted from `-o` in the `command` string
//! or the `arguments` list, and finally derived from the source stem.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Conventional file name of a compilation database.
pub const COMPDB_FILENAME: &str = "compile_commands.json";

#[derive(Debug, Deserialize)]
struct CompdbEntry {
    file: String,
    #[serde(default)]
    directory: Option<String>,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    arguments: Option<Vec<String>>,
}

/// Parsed compilation database with forward (source → object) and
/// reverse (object → source) maps.
#[derive(Debug, Default)]
pub struct CompilationDatabase {
    by_source: HashMap<PathBuf, PathBuf>,
    by_output: HashMap<PathBuf, PathBuf>,
}

impl CompilationDatabase {
    /// Load and parse the database at `path`.
    pub fn load(path: &Path) -> Result<CompilationDatabase> {
        let data = std::fs::read(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let entries: Vec<CompdbEntry> = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let mut db = CompilationDatabase::default();

        for entry in entries {
            let dir = match &entry.directory {
                Some(d) => normalize_path(&base.join(d)),
                None => base.to_path_buf(),
            };

            let source = normalize_path(&dir.join(&entry.file));
            let output = match entry.output_path() {
                Some(out) => normalize_path(&dir.join(out)),
                None => default_output(&dir, &source),
            };

            db.by_source.insert(source.clone(), output.clone());
            db.by_output.insert(output, source);
        }

        Ok(db)
    }

    /// Conventional database location for a binary directory.
    pub fn find_in(directory: &Path) -> Option<PathBuf> {
        let candidate = directory.join(COMPDB_FILENAME);
        candidate.is_file().then_some(candidate)
    }

    /// Source file that produced the given object file.
    pub fn source_for_object(&self, object: &Path) -> Option<&Path> {
        self.by_output.get(object).map(PathBuf::as_path)
    }

    /// Object file produced from the given source file.
    pub fn object_for_source(&self, source: &Path) -> Option<&Path> {
        self.by_source.get(source).map(PathBuf::as_path)
    }

    /// All object files named by the database.
    pub fn all_outputs(&self) -> Vec<PathBuf> {
        let mut outputs: Vec<PathBuf> = self.by_output.keys().cloned().collect();
        outputs.sort();
        outputs
    }
}

impl CompdbEntry {
    /// Output path preference: `output`, then `-o` in `command`, then
    /// `-o` in `arguments`.
    fn output_path(&self) -> Option<String> {
        if let Some(output) = &self.output {
            return Some(output.clone());
        }
        if let Some(command) = &self.command {
            if let Some(out) = output_from_args(&split_command(command)) {
                return Some(out);
            }
        }
        if let Some(arguments) = &self.arguments {
            if let Some(out) = output_from_args(arguments) {
                return Some(out);
            }
        }
        None
    }
}

fn output_from_args(args: &[String]) -> Option<String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "-o" {
            return iter.next().cloned();
        }
        if let Some(rest) = arg.strip_prefix("-o") {
            if !rest.is_empty() {
                return Some(rest.to_string());
            }
        }
    }
    None
}

/// Split a shell command line on whitespace, honoring single and
/// double quotes.
fn split_command(command: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in command.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None => match ch {
                '\'' | '"' => quote = Some(ch),
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        args.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }
    if !current.is_empty() {
        args.push(current);
    }

    args
}

fn default_output(dir: &Path, source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    dir.join(format!("{stem}.o"))
}

/// Normalize a path lexically: collapse `.` and empty components and
/// resolve `..` against the accumulated prefix, without touching the
/// filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(comp.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Memoizes loaded compilation databases by `(path, mtime)` so that
/// repeated per-file lookups within one pipeline run stay cheap.
#[derive(Default)]
pub struct CompdbCache {
    entries: HashMap<PathBuf, (u64, Arc<CompilationDatabase>)>,
}

impl CompdbCache {
    pub fn new() -> CompdbCache {
        CompdbCache::default()
    }

    pub fn get(&mut self, path: &Path) -> Result<Arc<CompilationDatabase>> {
        let mtime = super::file_mtime(path).unwrap_or(0);

        if let Some((cached_mtime, db)) = self.entries.get(path) {
            if *cached_mtime == mtime {
                return Ok(Arc::clone(db));
            }
        }

        let db = Arc::new(CompilationDatabase::load(path)?);
        self.entries
            .insert(path.to_path_buf(), (mtime, Arc::clone(&db)));
        Ok(db)
    }
}
