//! Schema and per-field codecs.
//!
//! A `Schema` is an ordered set of fields, each with a short binary
//! prefix namespacing its terms and a codec deciding how values are
//! turned into terms or value slots at indexing time and into index
//! predicates at query time. The schema is persisted to the index on
//! first write and must match structurally on every reopen.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::binary::{Symbol, SymbolType};
use crate::index::query::Query;

/// Maximum size of an indexed term in bytes, prefix included. Longer
/// terms are silently skipped.
pub const MAX_TERM_SIZE: usize = 244;

/// Value slot holding the symbol address.
pub const SLOT_ADDRESS: u16 = 0;
/// Value slot holding the symbol size.
pub const SLOT_SIZE: u16 = 1;
/// Value slot holding the object file mtime.
pub const SLOT_MTIME: u16 = 2;

/// A value passed to a field codec at indexing time.
pub enum FieldValue<'a> {
    Str(&'a str),
    Int(u64),
    Seq(&'a [String]),
}

/// Terms and value slots accumulated for one document.
#[derive(Debug, Default, Clone)]
pub struct Document {
    pub terms: Vec<Vec<u8>>,
    pub slots: Vec<(u16, u64)>,
}

/// A query value that a field codec could not interpret.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid value for '{field}' field: {value}")]
pub struct FieldValueError {
    pub field: String,
    pub value: String,
}

/// Kind-specific codec of a schema field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// A single term under the field prefix.
    Token { lowercase: bool },
    /// Path values: indexes the full path and its basename; queries
    /// also match the absolute resolved form of relative paths.
    Path,
    /// Symbol names: the raw value plus its tokenizer expansion.
    SymbolName,
    /// An integer stored in a dedicated value slot.
    Integer { slot: u16 },
    /// Symbol-type enum names; unknown names are a query error.
    SymbolType,
    /// A term per element of a sequence value.
    Relocations,
}

/// One field of the schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub prefix: String,
    pub kind: FieldKind,
}

impl Field {
    fn new(name: &str, prefix: &str, kind: FieldKind) -> Field {
        Field {
            name: name.to_string(),
            prefix: prefix.to_string(),
            kind,
        }
    }

    /// Index `value` into `document` according to this field's codec.
    pub fn index(&self, document: &mut Document, value: FieldValue<'_>) {
        match (&self.kind, value) {
            (FieldKind::Token { lowercase }, FieldValue::Str(s)) => {
                let text = if *lowercase { s.to_lowercase() } else { s.to_string() };
                self.add_term(document, text.as_bytes());
            }
            (FieldKind::Path, FieldValue::Str(s)) => {
                self.add_term(document, s.as_bytes());
                if let Some(basename) = Path::new(s).file_name() {
                    self.add_term(document, basename.to_string_lossy().as_bytes());
                }
            }
            (FieldKind::SymbolName, FieldValue::Str(s)) => {
                self.add_term(document, s.to_lowercase().as_bytes());
                for token in tokenize_name(s) {
                    self.add_term(document, token.to_lowercase().as_bytes());
                }
            }
            (FieldKind::Integer { slot }, FieldValue::Int(v)) => {
                document.slots.push((*slot, v));
            }
            (FieldKind::SymbolType, FieldValue::Str(s)) => {
                self.add_term(document, s.to_lowercase().as_bytes());
            }
            (FieldKind::Relocations, FieldValue::Seq(values)) => {
                for value in values {
                    self.add_term(document, value.to_lowercase().as_bytes());
                }
            }
            // Mismatched value shapes index nothing.
            _ => {}
        }
    }

    /// Compile a user-level query value into an index predicate.
    pub fn make_query(&self, value: &str, wildcard: bool) -> Result<Query, FieldValueError> {
        match &self.kind {
            FieldKind::Token { lowercase } => {
                let text = if *lowercase { value.to_lowercase() } else { value.to_string() };
                Ok(self.term_or_wildcard(&text, wildcard))
            }
            FieldKind::Path => {
                let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
                Ok(self.path_query(value, &cwd, wildcard))
            }
            FieldKind::SymbolName => {
                Ok(self.term_or_wildcard(&value.to_lowercase(), wildcard))
            }
            FieldKind::Integer { slot } => self.integer_query(*slot, value, wildcard),
            FieldKind::SymbolType => self.type_query(value, wildcard),
            FieldKind::Relocations => Ok(self.term_or_wildcard(&value.to_lowercase(), wildcard)),
        }
    }

    fn term_or_wildcard(&self, value: &str, wildcard: bool) -> Query {
        if wildcard {
            Query::wildcard(&self.prefix, value)
        } else {
            Query::term(&self.prefix, value)
        }
    }

    /// Path queries match the value as given and, for relative values,
    /// its absolute form under `cwd`, so both spellings find the
    /// indexed absolute path.
    fn path_query(&self, value: &str, cwd: &Path, wildcard: bool) -> Query {
        let given = crate::binary::compdb::normalize_path(Path::new(value));

        let mut candidates = vec![given.clone()];
        if given.is_relative() {
            candidates.push(crate::binary::compdb::normalize_path(&cwd.join(&given)));
        }
        candidates.dedup();

        Query::or(
            candidates
                .into_iter()
                .map(|p| self.term_or_wildcard(&p.to_string_lossy(), wildcard)),
        )
    }

    fn integer_query(
        &self,
        slot: u16,
        value: &str,
        wildcard: bool,
    ) -> Result<Query, FieldValueError> {
        if wildcard {
            return Err(self.value_error(value));
        }

        if let Some((low, high)) = value.split_once("..") {
            return match (low.trim(), high.trim()) {
                ("", "") => Err(self.value_error(value)),
                ("", high) => Ok(Query::ValueLe {
                    slot,
                    high: self.parse_int(high, value)?,
                }),
                (low, "") => Ok(Query::ValueGe {
                    slot,
                    low: self.parse_int(low, value)?,
                }),
                (low, high) => Ok(Query::ValueRange {
                    slot,
                    low: self.parse_int(low, value)?,
                    high: self.parse_int(high, value)?,
                }),
            };
        }

        let v = self.parse_int(value.trim(), value)?;
        Ok(Query::ValueRange {
            slot,
            low: v,
            high: v,
        })
    }

    fn type_query(&self, value: &str, wildcard: bool) -> Result<Query, FieldValueError> {
        if wildcard {
            let stem = value.to_lowercase();
            return Ok(Query::or(
                SymbolType::ALL
                    .iter()
                    .filter(|t| t.name().to_lowercase().starts_with(&stem))
                    .map(|t| Query::term(&self.prefix, t.name().to_lowercase())),
            ));
        }

        match SymbolType::from_name(value) {
            Some(ty) => Ok(Query::term(&self.prefix, ty.name().to_lowercase())),
            None => Err(self.value_error(value)),
        }
    }

    fn parse_int(&self, text: &str, original: &str) -> Result<u64, FieldValueError> {
        let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X"))
        {
            u64::from_str_radix(hex, 16)
        } else {
            text.parse::<u64>()
        };
        parsed.map_err(|_| self.value_error(original))
    }

    fn value_error(&self, value: &str) -> FieldValueError {
        FieldValueError {
            field: self.name.clone(),
            value: value.to_string(),
        }
    }

    fn add_term(&self, document: &mut Document, value: &[u8]) {
        let mut term = self.prefix.as_bytes().to_vec();
        term.extend_from_slice(value);
        if term.len() > MAX_TERM_SIZE {
            return;
        }
        document.terms.push(term);
    }
}

/// An ordered set of field definitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Schema {
        Schema { fields }
    }

    /// The schema used for symbol indexes. Prefixes and slot numbers
    /// are stable across versions.
    pub fn symbols() -> Schema {
        Schema::new(vec![
            Field::new("path", "XP", FieldKind::Path),
            Field::new("source", "XS", FieldKind::Path),
            Field::new("name", "XN", FieldKind::SymbolName),
            Field::new("fullname", "XF", FieldKind::Token { lowercase: true }),
            Field::new("section", "XSN", FieldKind::Token { lowercase: true }),
            Field::new("address", "", FieldKind::Integer { slot: SLOT_ADDRESS }),
            Field::new("size", "", FieldKind::Integer { slot: SLOT_SIZE }),
            Field::new("type", "XT", FieldKind::SymbolType),
            Field::new("relocations", "XR", FieldKind::Relocations),
            Field::new("mtime", "", FieldKind::Integer { slot: SLOT_MTIME }),
        ])
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Build the terms and value slots for one symbol.
    pub fn index_symbol(&self, symbol: &Symbol) -> Document {
        let mut document = Document::default();

        for field in &self.fields {
            match field.name.as_str() {
                "path" => field.index(
                    &mut document,
                    FieldValue::Str(&symbol.path.to_string_lossy()),
                ),
                "source" => {
                    if let Some(source) = &symbol.source {
                        field.index(&mut document, FieldValue::Str(&source.to_string_lossy()));
                    }
                }
                "name" => field.index(&mut document, FieldValue::Str(&symbol.name)),
                "fullname" => field.index(&mut document, FieldValue::Str(&symbol.name)),
                "section" => field.index(&mut document, FieldValue::Str(&symbol.section)),
                "address" => field.index(&mut document, FieldValue::Int(symbol.address)),
                "size" => field.index(&mut document, FieldValue::Int(symbol.size)),
                "type" => field.index(&mut document, FieldValue::Str(symbol.sym_type.name())),
                "relocations" => {
                    field.index(&mut document, FieldValue::Seq(&symbol.relocations))
                }
                "mtime" => field.index(&mut document, FieldValue::Int(symbol.mtime)),
                _ => {}
            }
        }

        document
    }
}

/// Encode an integer so that byte-wise comparison orders like the
/// numeric value.
pub fn sortable_bytes(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

/// Multi-token expansion of a symbol name.
///
/// Tokens are case-preserving here; the symbol-name codec lowercases
/// them before insertion. The expansion is the union of:
/// - maximal alphabetic runs of length >= 2,
/// - maximal numeric runs,
/// - alphanumeric suffix runs (letters immediately followed by digits),
/// - per alphabetic run: camel-case words, upper-case acronyms, and
///   the lowercase residues of length >= 2 left after removing
///   upper-case runs.
pub fn tokenize_name(value: &str) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();
    let chars: Vec<char> = value.chars().collect();

    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_ascii_alphabetic() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_alphabetic() {
                i += 1;
            }
            let run: String = chars[start..i].iter().collect();
            if run.len() >= 2 {
                tokens.insert(run.clone());
            }
            expand_alphabetic_run(&run, &mut tokens);

            // Letters immediately followed by digits form a combined
            // suffix token, e.g. "bar37" or "cxx11".
            if i < chars.len() && chars[i].is_ascii_digit() {
                let digit_start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let digits: String = chars[digit_start..i].iter().collect();
                tokens.insert(digits.clone());
                tokens.insert(format!("{run}{digits}"));
            }
        } else if chars[i].is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            tokens.insert(chars[start..i].iter().collect());
        } else {
            i += 1;
        }
    }

    tokens
}

fn expand_alphabetic_run(run: &str, tokens: &mut BTreeSet<String>) {
    let chars: Vec<char> = run.chars().collect();

    // Camel-case words: an upper-case letter followed by lower-case.
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_ascii_uppercase()
            && i + 1 < chars.len()
            && chars[i + 1].is_ascii_lowercase()
        {
            let start = i;
            i += 1;
            while i < chars.len() && chars[i].is_ascii_lowercase() {
                i += 1;
            }
            tokens.insert(chars[start..i].iter().collect());
        } else {
            i += 1;
        }
    }

    // Acronyms: maximal upper-case runs of length >= 2.
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_ascii_uppercase() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_uppercase() {
                i += 1;
            }
            if i - start >= 2 {
                tokens.insert(chars[start..i].iter().collect());
            }
        } else {
            i += 1;
        }
    }

    // Lowercase residues: what remains after removing upper-case runs.
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_ascii_lowercase() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_lowercase() {
                i += 1;
            }
            if i - start >= 2 {
                tokens.insert(chars[start..i].iter().collect());
            }
        } else {
            i += 1;
        }
    }
}
