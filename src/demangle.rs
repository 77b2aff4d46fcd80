//! Identifier demangling via the external `c++filt` program.
//!
//! The demangler is an owned, injectable object rather than a hidden
//! global, so callers (and tests) decide its lifetime. Results are
//! memoized; a missing `c++filt` degrades to returning names
//! unchanged.

use std::collections::HashMap;
use std::process::Command;

use log::debug;

pub struct Demangler {
    program: String,
    available: bool,
    cache: HashMap<String, String>,
}

impl Demangler {
    pub fn new() -> Demangler {
        Demangler::with_program("c++filt")
    }

    pub fn with_program(program: &str) -> Demangler {
        let available = Command::new(program)
            .arg("--version")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false);

        if !available {
            debug!("{program} is not available, names will not be demangled");
        }

        Demangler {
            program: program.to_string(),
            available,
            cache: HashMap::new(),
        }
    }

    /// Demangle one identifier, returning it unchanged when the
    /// demangler is unavailable or produced nothing.
    pub fn demangle(&mut self, name: &str) -> String {
        if !self.available || name.is_empty() {
            return name.to_string();
        }

        if let Some(hit) = self.cache.get(name) {
            return hit.clone();
        }

        let demangled = Command::new(&self.program)
            .arg(name)
            .output()
            .ok()
            .filter(|out| out.status.success())
            .and_then(|out| {
                let stdout = String::from_utf8_lossy(&out.stdout);
                stdout.lines().next().map(|line| line.trim().to_string())
            })
            .filter(|line| !line.is_empty())
            .unwrap_or_else(|| name.to_string());

        self.cache.insert(name.to_string(), demangled.clone());
        demangled
    }
}

impl Default for Demangler {
    fn default() -> Self {
        Demangler::new()
    }
}
