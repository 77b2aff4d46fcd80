//! Search-result output formats.
//!
//! The default rendering is the format string `"{basename}: {name}"`;
//! any symbol field can be interpolated the same way. `json` emits one
//! object per line and `sexp` a property list per line.

use anyhow::{bail, Result};
use serde_json::{json, Value};

use crate::binary::Symbol;
use crate::demangle::Demangler;

/// How to render each symbol.
pub enum OutputFormat {
    /// A format string with `{key}` interpolation.
    Template(String),
    Json,
    Sexp,
}

impl OutputFormat {
    /// Interpret the `-f` option; `None` means the default template.
    pub fn from_flag(flag: Option<&str>) -> OutputFormat {
        match flag {
            None => OutputFormat::Template("{basename}: {name}".to_string()),
            Some("json") => OutputFormat::Json,
            Some("sexp") => OutputFormat::Sexp,
            Some(custom) => OutputFormat::Template(custom.to_string()),
        }
    }

    /// Render one symbol to a line.
    pub fn render(
        &self,
        symbol: &Symbol,
        demangler: Option<&mut Demangler>,
    ) -> Result<String> {
        let fields = symbol_fields(symbol, demangler);
        match self {
            OutputFormat::Template(template) => render_template(template, &fields),
            OutputFormat::Json => {
                let mut object = serde_json::Map::new();
                for (key, value) in fields {
                    if key != "basename" {
                        object.insert(key.to_string(), value);
                    }
                }
                Ok(serde_json::to_string(&Value::Object(object))?)
            }
            OutputFormat::Sexp => Ok(render_sexp(&fields)),
        }
    }
}

fn symbol_fields(
    symbol: &Symbol,
    demangler: Option<&mut Demangler>,
) -> Vec<(&'static str, Value)> {
    let demangled = match demangler {
        Some(demangler) => demangler.demangle(&symbol.name),
        None => symbol.name.clone(),
    };

    vec![
        (
            "basename",
            json!(symbol
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()),
        ),
        ("path", json!(symbol.path.to_string_lossy())),
        (
            "source",
            match &symbol.source {
                Some(source) => json!(source.to_string_lossy()),
                None => Value::Null,
            },
        ),
        ("name", json!(symbol.name)),
        ("demangled", json!(demangled)),
        ("section", json!(symbol.section)),
        ("address", json!(symbol.address)),
        ("size", json!(symbol.size)),
        ("type", json!(symbol.sym_type.name())),
        ("relocations", json!(symbol.relocations)),
        ("mtime", json!(symbol.mtime)),
    ]
}

/// Substitute `{key}` occurrences. Unknown keys report the available
/// ones.
fn render_template(template: &str, fields: &[(&'static str, Value)]) -> Result<String> {
    let mut out = String::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '{' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'{') {
            chars.next();
            out.push('{');
            continue;
        }

        let mut key = String::new();
        loop {
            match chars.next() {
                Some('}') => break,
                Some(c) => key.push(c),
                None => bail!("unterminated '{{' in format: '{template}'"),
            }
        }

        match fields.iter().find(|(name, _)| *name == key) {
            Some((_, value)) => out.push_str(&value_to_text(value)),
            None => {
                let available: Vec<&str> = fields.iter().map(|(name, _)| *name).collect();
                bail!(
                    "invalid format key '{key}', available keys: [{}]",
                    available.join(", ")
                );
            }
        }
    }

    Ok(out)
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn render_sexp(fields: &[(&'static str, Value)]) -> String {
    let mut parts = Vec::new();
    for (key, value) in fields {
        if *key == "basename" {
            continue;
        }
        parts.push(format!(":{key} {}", value_to_sexp(value)));
    }
    format!("({})", parts.join(" "))
}

fn value_to_sexp(value: &Value) -> String {
    match value {
        Value::Null => "nil".to_string(),
        Value::String(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(value_to_sexp).collect();
            format!("({})", inner.join(" "))
        }
        other => format!("\"{other}\""),
    }
}
