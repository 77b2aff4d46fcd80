//! Shared test support: a minimal ELF64 relocatable-object writer and
//! the standard fixture tree used across the integration suites.
//!
//! The writer emits just enough of the format for the reader side:
//! section headers, a symbol table with global symbols, string tables,
//! and RELA sections whose entries point at symbol-table indices.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const STT_NOTYPE: u8 = 0;
pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_RELA: u32 = 4;
const SHT_NOBITS: u32 = 8;

/// R_X86_64_64, arbitrary but valid for our reader which ignores the
/// relocation type.
const RELOC_TYPE: u64 = 1;

#[derive(Clone)]
struct SectionSpec {
    name: String,
    nobits: bool,
    size: u64,
}

#[derive(Clone)]
struct SymbolSpec {
    name: String,
    section: String,
    address: u64,
    size: u64,
    sym_type: u8,
}

#[derive(Clone)]
struct RelocSpec {
    section: String,
    offset: u64,
    target: String,
}

/// Builds one ELF64 little-endian relocatable object in memory.
#[derive(Default)]
pub struct ObjectBuilder {
    sections: Vec<SectionSpec>,
    symbols: Vec<SymbolSpec>,
    relocs: Vec<RelocSpec>,
}

impl ObjectBuilder {
    pub fn new() -> ObjectBuilder {
        ObjectBuilder::default()
    }

    /// Add a PROGBITS section filled with zeros.
    pub fn section(&mut self, name: &str, size: u64) -> &mut Self {
        self.sections.push(SectionSpec {
            name: name.to_string(),
            nobits: false,
            size,
        });
        self
    }

    /// Add a NOBITS (bss-style) section.
    pub fn bss(&mut self, name: &str, size: u64) -> &mut Self {
        self.sections.push(SectionSpec {
            name: name.to_string(),
            nobits: true,
            size,
        });
        self
    }

    /// Add a global symbol defined in `section`.
    pub fn symbol(
        &mut self,
        name: &str,
        section: &str,
        address: u64,
        size: u64,
        sym_type: u8,
    ) -> &mut Self {
        self.symbols.push(SymbolSpec {
            name: name.to_string(),
            section: section.to_string(),
            address,
            size,
            sym_type,
        });
        self
    }

    /// Add a relocation at `offset` inside `section` referencing
    /// `target`. Targets that are not defined here become undefined
    /// symbol-table entries.
    pub fn reloc(&mut self, section: &str, offset: u64, target: &str) -> &mut Self {
        self.relocs.push(RelocSpec {
            section: section.to_string(),
            offset,
            target: target.to_string(),
        });
        self
    }

    pub fn write_to(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create fixture directories");
        }
        fs::write(path, self.build()).expect("write object file");
    }

    fn section_index(&self, name: &str) -> u16 {
        let position = self
            .sections
            .iter()
            .position(|s| s.name == name)
            .unwrap_or_else(|| panic!("unknown section {name}"));
        (position + 1) as u16
    }

    pub fn build(&self) -> Vec<u8> {
        // Section table layout: NULL, user sections, one RELA section
        // per user section carrying relocations, .symtab, .strtab,
        // .shstrtab.
        let reloc_sections: Vec<&SectionSpec> = self
            .sections
            .iter()
            .filter(|s| self.relocs.iter().any(|r| r.section == s.name))
            .collect();

        let user_count = self.sections.len();
        let symtab_index = 1 + user_count + reloc_sections.len();
        let strtab_index = symtab_index + 1;
        let shstrtab_index = strtab_index + 1;
        let section_count = shstrtab_index + 1;

        // Symbol string table and entries. Index 0 is the null symbol.
        let mut strtab = StringTable::new();
        let mut entries: Vec<[u8; 24]> = vec![[0; 24]];
        let mut symbol_indices: HashMap<&str, u64> = HashMap::new();

        for spec in &self.symbols {
            symbol_indices.insert(&spec.name, entries.len() as u64);
            entries.push(symbol_entry(
                strtab.intern(&spec.name),
                0x10 | spec.sym_type,
                self.section_index(&spec.section),
                spec.address,
                spec.size,
            ));
        }
        for reloc in &self.relocs {
            if !symbol_indices.contains_key(reloc.target.as_str()) {
                symbol_indices.insert(&reloc.target, entries.len() as u64);
                entries.push(symbol_entry(
                    strtab.intern(&reloc.target),
                    0x10 | STT_NOTYPE,
                    0,
                    0,
                    0,
                ));
            }
        }

        let symtab_bytes: Vec<u8> = entries.iter().flatten().copied().collect();

        // Section name string table.
        let mut shstrtab = StringTable::new();
        let mut headers: Vec<SectionHeader> = vec![SectionHeader::default()];

        for spec in &self.sections {
            headers.push(SectionHeader {
                name: shstrtab.intern(&spec.name),
                sh_type: if spec.nobits { SHT_NOBITS } else { SHT_PROGBITS },
                size: spec.size,
                addralign: 1,
                ..SectionHeader::default()
            });
        }
        for spec in &reloc_sections {
            headers.push(SectionHeader {
                name: shstrtab.intern(&format!(".rela{}", spec.name)),
                sh_type: SHT_RELA,
                link: symtab_index as u32,
                info: self.section_index(&spec.name) as u32,
                entsize: 24,
                addralign: 8,
                ..SectionHeader::default()
            });
        }
        headers.push(SectionHeader {
            name: shstrtab.intern(".symtab"),
            sh_type: SHT_SYMTAB,
            link: strtab_index as u32,
            info: 1,
            entsize: 24,
            addralign: 8,
            ..SectionHeader::default()
        });
        headers.push(SectionHeader {
            name: shstrtab.intern(".strtab"),
            sh_type: SHT_STRTAB,
            addralign: 1,
            ..SectionHeader::default()
        });
        headers.push(SectionHeader {
            name: shstrtab.intern(".shstrtab"),
            sh_type: SHT_STRTAB,
            addralign: 1,
            ..SectionHeader::default()
        });
        assert_eq!(headers.len(), section_count);

        // Per-section contents, in header order.
        let mut contents: Vec<Option<Vec<u8>>> = vec![None];
        for spec in &self.sections {
            contents.push(if spec.nobits {
                None
            } else {
                Some(vec![0u8; spec.size as usize])
            });
        }
        for spec in &reloc_sections {
            let mut data = Vec::new();
            for reloc in self.relocs.iter().filter(|r| r.section == spec.name) {
                let sym = symbol_indices[reloc.target.as_str()];
                data.extend_from_slice(&reloc.offset.to_le_bytes());
                data.extend_from_slice(&((sym << 32) | RELOC_TYPE).to_le_bytes());
                data.extend_from_slice(&0i64.to_le_bytes());
            }
            contents.push(Some(data));
        }
        contents.push(Some(symtab_bytes));
        contents.push(Some(strtab.bytes.clone()));
        contents.push(Some(shstrtab.bytes.clone()));

        // Lay contents out after the 64-byte ELF header, 8-aligned.
        let mut out = vec![0u8; 64];
        for (header, content) in headers.iter_mut().zip(&contents).skip(1) {
            while out.len() % 8 != 0 {
                out.push(0);
            }
            header.offset = out.len() as u64;
            if let Some(data) = content {
                header.size = data.len() as u64;
                out.extend_from_slice(data);
            }
        }

        while out.len() % 8 != 0 {
            out.push(0);
        }
        let e_shoff = out.len() as u64;
        for header in &headers {
            out.extend_from_slice(&header.encode());
        }

        write_elf_header(&mut out, e_shoff, section_count as u16, shstrtab_index as u16);
        out
    }
}

struct StringTable {
    bytes: Vec<u8>,
    offsets: HashMap<String, u32>,
}

impl StringTable {
    fn new() -> StringTable {
        StringTable {
            bytes: vec![0],
            offsets: HashMap::new(),
        }
    }

    fn intern(&mut self, name: &str) -> u32 {
        if let Some(offset) = self.offsets.get(name) {
            return *offset;
        }
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        self.offsets.insert(name.to_string(), offset);
        offset
    }
}

#[derive(Default, Clone)]
struct SectionHeader {
    name: u32,
    sh_type: u32,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    addralign: u64,
    entsize: u64,
}

impl SectionHeader {
    fn encode(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[0..4].copy_from_slice(&self.name.to_le_bytes());
        out[4..8].copy_from_slice(&self.sh_type.to_le_bytes());
        // sh_flags and sh_addr stay zero.
        out[24..32].copy_from_slice(&self.offset.to_le_bytes());
        out[32..40].copy_from_slice(&self.size.to_le_bytes());
        out[40..44].copy_from_slice(&self.link.to_le_bytes());
        out[44..48].copy_from_slice(&self.info.to_le_bytes());
        out[48..56].copy_from_slice(&self.addralign.to_le_bytes());
        out[56..64].copy_from_slice(&self.entsize.to_le_bytes());
        out
    }
}

fn symbol_entry(name: u32, info: u8, shndx: u16, value: u64, size: u64) -> [u8; 24] {
    let mut out = [0u8; 24];
    out[0..4].copy_from_slice(&name.to_le_bytes());
    out[4] = info;
    // st_other stays zero.
    out[6..8].copy_from_slice(&shndx.to_le_bytes());
    out[8..16].copy_from_slice(&value.to_le_bytes());
    out[16..24].copy_from_slice(&size.to_le_bytes());
    out
}

fn write_elf_header(out: &mut [u8], e_shoff: u64, e_shnum: u16, e_shstrndx: u16) {
    out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    out[4] = 2; // ELFCLASS64
    out[5] = 1; // little-endian
    out[6] = 1; // EV_CURRENT
    out[16..18].copy_from_slice(&1u16.to_le_bytes()); // ET_REL
    out[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
    out[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
    out[40..48].copy_from_slice(&e_shoff.to_le_bytes());
    out[52..54].copy_from_slice(&64u16.to_le_bytes()); // e_ehsize
    out[58..60].copy_from_slice(&64u16.to_le_bytes()); // e_shentsize
    out[60..62].copy_from_slice(&e_shnum.to_le_bytes());
    out[62..64].copy_from_slice(&e_shstrndx.to_le_bytes());
}

/// Write the standard three-file fixture tree:
///
/// - `toplev.c.o`: `top_level_symbol` (.rodata, 64 bytes),
///   `other_top_level_symbol` (.data.rel.ro.local, references
///   `top_level_symbol`), and `main` (references `uses_c_function`).
/// - `subdir/foo.c.o`: C objects and functions, among them
///   `c_function` (references `foo`), `CamelCaseSymbol`, `uses_foo`,
///   and five `a_name<N>` objects.
/// - `subdir/bar.cpp.o`: C++ symbols, among them a mangled
///   `cxx_function` (references `bar` and `foo`) and
///   `uses_c_function` (references `c_function`).
pub fn write_fixture(root: &Path) {
    let mut toplev = ObjectBuilder::new();
    toplev
        .section(".text", 64)
        .section(".rodata", 64)
        .section(".data.rel.ro.local", 16);
    toplev
        .symbol("top_level_symbol", ".rodata", 0, 64, STT_OBJECT)
        .symbol("other_top_level_symbol", ".data.rel.ro.local", 0, 8, STT_OBJECT)
        .symbol("main", ".text", 0, 32, STT_FUNC);
    toplev
        .reloc(".data.rel.ro.local", 0, "top_level_symbol")
        .reloc(".text", 8, "uses_c_function");
    toplev.write_to(&root.join("toplev.c.o"));

    let mut foo = ObjectBuilder::new();
    foo.section(".text", 64).bss(".bss", 48);
    foo.symbol("foo", ".bss", 0, 4, STT_OBJECT)
        .symbol("foo_", ".bss", 8, 8, STT_OBJECT)
        .symbol("foo__", ".bss", 16, 4, STT_OBJECT)
        .symbol("a_name0", ".bss", 24, 4, STT_OBJECT)
        .symbol("a_name1", ".bss", 28, 4, STT_OBJECT)
        .symbol("a_name2", ".bss", 32, 4, STT_OBJECT)
        .symbol("a_name3", ".bss", 36, 4, STT_OBJECT)
        .symbol("a_name4", ".bss", 40, 4, STT_OBJECT)
        .symbol("c_function", ".text", 0, 16, STT_FUNC)
        .symbol("CamelCaseSymbol", ".text", 16, 16, STT_FUNC)
        .symbol("uses_foo", ".text", 32, 13, STT_FUNC);
    foo.reloc(".text", 4, "foo").reloc(".text", 36, "foo");
    foo.write_to(&root.join("subdir/foo.c.o"));

    let mut bar = ObjectBuilder::new();
    bar.section(".text", 64).bss(".bss", 8);
    bar.symbol("bar", ".bss", 0, 4, STT_OBJECT)
        .symbol("_Z12cxx_functionSt6vectorIiSaIiEE", ".text", 0, 32, STT_FUNC)
        .symbol("uses_c_function", ".text", 32, 16, STT_FUNC)
        .symbol("_Z18CppCamelCaseSymbolPKc", ".text", 48, 16, STT_FUNC);
    bar.reloc(".text", 4, "bar")
        .reloc(".text", 8, "foo")
        .reloc(".text", 36, "c_function");
    bar.write_to(&root.join("subdir/bar.cpp.o"));
}

/// Total symbol count in the fixture written by [`write_fixture`].
pub const FIXTURE_SYMBOL_COUNT: usize = 18;
