//! ELF symbol table extraction.
//!
//! Reads one object file and produces `Symbol` records, optionally
//! resolving each relocation section back to the symbol containing the
//! relocation site so that outgoing references can be indexed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use goblin::elf::section_header::SHT_SYMTAB;
use goblin::elf::Elf;
use log::debug;

use super::{file_mtime, CompilationDatabase, Symbol, SymbolType};

/// Options controlling symbol extraction from a single object file.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Symbols smaller than this many bytes are skipped.
    pub min_symbol_size: u64,
    /// Resolve relocation sections into per-symbol reference lists.
    pub index_relocations: bool,
    /// Fall back to `dwarfdump` for source attribution when the
    /// compilation database does not know the file.
    pub use_dwarfdump: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        ExtractOptions {
            min_symbol_size: 1,
            index_relocations: true,
            use_dwarfdump: false,
        }
    }
}

/// Read the symbol table of the object file at `path`.
///
/// Returns one `Symbol` per symtab entry whose size passes the
/// configured minimum. Malformed files surface as errors; the caller
/// decides whether that is fatal.
pub fn read_symtable(
    path: &Path,
    options: &ExtractOptions,
    compdb: Option<&CompilationDatabase>,
) -> Result<Vec<Symbol>> {
    let data = std::fs::read(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let elf = Elf::parse(&data)
        .with_context(|| format!("failed to parse {} as ELF", path.display()))?;

    let mtime = file_mtime(path)?;
    let source = resolve_source(path, options, compdb);

    let mut symbols = Vec::new();
    // Section index -> (address, size, position in `symbols`), used to
    // attribute relocation sites back to their containing symbol.
    let mut by_section: HashMap<usize, Vec<(u64, u64, usize)>> = HashMap::new();

    for sym in elf.syms.iter() {
        if sym.st_size < options.min_symbol_size {
            continue;
        }

        let name = elf.strtab.get_at(sym.st_name).unwrap_or("").to_string();
        let section = elf
            .section_headers
            .get(sym.st_shndx)
            .and_then(|shdr| elf.shdr_strtab.get_at(shdr.sh_name))
            .unwrap_or("")
            .to_string();

        by_section
            .entry(sym.st_shndx)
            .or_default()
            .push((sym.st_value, sym.st_size, symbols.len()));

        symbols.push(Symbol {
            path: path.to_path_buf(),
            source: source.clone(),
            name,
            section,
            address: sym.st_value,
            size: sym.st_size,
            sym_type: SymbolType::from_elf_code(sym.st_type()),
            relocations: Vec::new(),
            mtime,
        });
    }

    if options.index_relocations {
        resolve_relocations(&elf, &mut symbols, &mut by_section);
    }

    Ok(symbols)
}

/// Attribute every relocation to the symbol whose `[address,
/// address+size)` range contains the relocation offset, and record the
/// referenced symbol's name on it.
fn resolve_relocations(
    elf: &Elf<'_>,
    symbols: &mut [Symbol],
    by_section: &mut HashMap<usize, Vec<(u64, u64, usize)>>,
) {
    for group in by_section.values_mut() {
        group.sort_unstable();
    }

    let symtab_index = elf
        .section_headers
        .iter()
        .position(|shdr| shdr.sh_type == SHT_SYMTAB);

    for (reloc_shdr_index, relocs) in &elf.shdr_relocs {
        let Some(shdr) = elf.section_headers.get(*reloc_shdr_index) else {
            continue;
        };
        // Only relocation sections linked against the symbol table we
        // extracted from are meaningful here.
        if symtab_index != Some(shdr.sh_link as usize) {
            continue;
        }

        let target_section = shdr.sh_info as usize;
        let Some(group) = by_section.get(&target_section) else {
            continue;
        };

        for reloc in relocs.iter() {
            let Some(referenced) = elf.syms.get(reloc.r_sym) else {
                continue;
            };
            let Some(name) = elf.strtab.get_at(referenced.st_name) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }

            let Some(site) = containing_symbol(group, reloc.r_offset) else {
                continue;
            };

            symbols[site].relocations.push(name.to_string());
        }
    }

    for symbol in symbols.iter_mut() {
        symbol.relocations.sort();
        symbol.relocations.dedup();
    }
}

/// Binary-search `group` (sorted by address) for the symbol containing
/// `offset`.
fn containing_symbol(group: &[(u64, u64, usize)], offset: u64) -> Option<usize> {
    let idx = group.partition_point(|(addr, _, _)| *addr <= offset);
    let (addr, size, position) = group.get(idx.checked_sub(1)?)?;
    (offset >= *addr && offset < addr + size).then_some(*position)
}

fn resolve_source(
    path: &Path,
    options: &ExtractOptions,
    compdb: Option<&CompilationDatabase>,
) -> Option<PathBuf> {
    if let Some(db) = compdb {
        if let Some(source) = db.source_for_object(path) {
            return Some(source.to_path_buf());
        }
    }

    if options.use_dwarfdump {
        return dwarf_source(path);
    }

    None
}

/// Recover the compilation unit's source path from `dwarfdump -r`
/// output. Absence of the program or of debug info is not an error.
fn dwarf_source(path: &Path) -> Option<PathBuf> {
    let output = Command::new("dwarfdump")
        .arg("-r")
        .arg(path)
        .output()
        .ok()?;

    if !output.status.success() {
        debug!("dwarfdump failed for {}", path.display());
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let (name, comp_dir) = parse_dwarf_attrs(&stdout)?;

    let name = PathBuf::from(name);
    let joined = if name.is_absolute() {
        name
    } else {
        PathBuf::from(comp_dir).join(name)
    };

    joined.is_file().then_some(joined)
}

/// Pull the first `DW_AT_name` and `DW_AT_comp_dir` values out of
/// dwarfdump output. Handles both `attr "value"` and `attr ("value")`
/// layouts.
fn parse_dwarf_attrs(text: &str) -> Option<(String, String)> {
    let mut name = None;
    let mut comp_dir = None;

    for line in text.lines() {
        if name.is_none() {
            if let Some(value) = attr_value(line, "DW_AT_name") {
                name = Some(value);
            }
        }
        if comp_dir.is_none() {
            if let Some(value) = attr_value(line, "DW_AT_comp_dir") {
                comp_dir = Some(value);
            }
        }
        if name.is_some() && comp_dir.is_some() {
            break;
        }
    }

    Some((name?, comp_dir?))
}

fn attr_value(line: &str, attr: &str) -> Option<String> {
    let rest = line.trim_start().strip_prefix(attr)?;
    if !rest.starts_with(|c: char| c.is_whitespace() || c == '(') {
        return None;
    }
    let value = rest
        .trim()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .trim()
        .trim_matches('"');
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containing_symbol_matches_half_open_ranges() {
        let group = vec![(0, 16, 0), (16, 8, 1), (32, 4, 2)];
        assert_eq!(containing_symbol(&group, 0), Some(0));
        assert_eq!(containing_symbol(&group, 15), Some(0));
        assert_eq!(containing_symbol(&group, 16), Some(1));
        assert_eq!(containing_symbol(&group, 24), None);
        assert_eq!(containing_symbol(&group, 33), Some(2));
        assert_eq!(containing_symbol(&group, 100), None);
    }

    #[test]
    fn parses_classic_dwarfdump_layout() {
        let text = r#"
.debug_info

COMPILE_UNIT<header overall offset = 0x00000000>:
< 0><0x0000000b>  DW_TAG_compile_unit
                    DW_AT_producer              "GNU C17"
                    DW_AT_name                  "toplev.c"
                    DW_AT_comp_dir              "/home/user/build"
"#;
        let (name, dir) = parse_dwarf_attrs(text).expect("attrs");
        assert_eq!(name, "toplev.c");
        assert_eq!(dir, "/home/user/build");
    }

    #[test]
    fn parses_llvm_dwarfdump_layout() {
        let text = r#"
0x0000000b: DW_TAG_compile_unit
              DW_AT_name ("subdir/foo.c")
              DW_AT_comp_dir ("/tmp/tree")
"#;
        let (name, dir) = parse_dwarf_attrs(text).expect("attrs");
        assert_eq!(name, "subdir/foo.c");
        assert_eq!(dir, "/tmp/tree");
    }

    #[test]
    fn missing_attributes_yield_none() {
        assert!(parse_dwarf_attrs("DW_AT_name \"only-name.c\"").is_none());
    }
}
