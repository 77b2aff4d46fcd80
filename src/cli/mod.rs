//! Command-line interface.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use serde_json::json;

use crate::demangle::Demangler;
use crate::graph::{self, GraphObserver};
use crate::index::{IndexingOptions, SymbolIndex};
use crate::sigint;

mod args;
mod config;
mod format;

pub use args::{Cli, Commands, FilesArgs, GraphArgs, IndexArgs, SearchArgs};
pub use format::OutputFormat;

/// Entry point for the CLI binary.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Index(args) => cmd_index(args),
        Commands::Search(args) => cmd_search(args),
        Commands::Files(args) => cmd_files(args),
        Commands::Graph(args) => cmd_graph(args),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(level),
    )
    .format_timestamp(None)
    .try_init();
}

/// Resolve the binary directory and index path from the common
/// options, recovering whichever one was omitted.
fn resolve_paths(
    directory: Option<&Path>,
    index_path: Option<&Path>,
    index_must_exist: bool,
) -> Result<(PathBuf, PathBuf)> {
    let mut guessed = false;

    let (directory, index_path) = match (directory, index_path) {
        (Some(dir), index) => {
            let dir = dir
                .canonicalize()
                .with_context(|| format!("binary directory not accessible: {}", dir.display()))?;
            let index = index
                .map(Path::to_path_buf)
                .unwrap_or_else(|| SymbolIndex::default_path(&dir));
            (dir, index)
        }
        (None, Some(index)) => {
            let dir = recorded_binary_dir(index)?.with_context(|| {
                format!(
                    "index {} does not record a binary directory, pass --directory",
                    index.display()
                )
            })?;
            guessed = true;
            (dir, index.to_path_buf())
        }
        (None, None) => {
            let cwd = std::env::current_dir()?;
            let found = cwd.ancestors().find_map(|ancestor| {
                let candidate = SymbolIndex::default_path(ancestor);
                index_exists(&candidate).then(|| (ancestor.to_path_buf(), candidate))
            });

            let (dir, index) = found.context(
                "could not find an index for the current directory, pass --directory",
            )?;
            let dir = recorded_binary_dir(&index)?.unwrap_or(dir);
            guessed = true;
            (dir, index)
        }
    };

    if index_must_exist && !index_exists(&index_path) {
        bail!("directory is not indexed: {}", directory.display());
    }

    if index_exists(&index_path) {
        if let Some(recorded) = recorded_binary_dir(&index_path)? {
            if recorded != directory {
                bail!(
                    "index {} is for a different directory: {}",
                    index_path.display(),
                    recorded.display()
                );
            }
        }
    }

    if guessed {
        info!("using {} as binary directory", directory.display());
    }

    Ok((directory, index_path))
}

fn index_exists(index_path: &Path) -> bool {
    index_path.join("db").is_file()
}

fn recorded_binary_dir(index_path: &Path) -> Result<Option<PathBuf>> {
    if !index_exists(index_path) {
        return Ok(None);
    }
    let index = SymbolIndex::open(index_path)
        .with_context(|| format!("invalid index: {}", index_path.display()))?;
    Ok(index.binary_dir()?)
}

fn cmd_index(args: IndexArgs) -> Result<()> {
    let (directory, index_path) = resolve_paths(
        args.common.directory.as_deref(),
        args.common.index_path.as_deref(),
        false,
    )?;

    let mut options = IndexingOptions::default();
    if let Some(file_config) = config::load(&directory)? {
        config::apply(&mut options, &file_config);
    }
    if args.use_compilation_database {
        options.use_compilation_database = true;
    }
    for raw in &args.options {
        let (key, value) = raw
            .split_once('=')
            .with_context(|| format!("option is not KEY=VALUE: {raw}"))?;
        options.set(key, value)?;
    }

    let stats = crate::index::index_binary_directory(&directory, &index_path, &options)?;

    if sigint::interrupted() {
        warn!("indexing was interrupted, the index is partially updated");
    }

    println!(
        "Files indexed: {} (out of {} changed files)",
        stats.num_files_indexed, stats.num_files_changed
    );
    println!("Files removed from index: {}", stats.num_files_deleted);
    println!("Symbols indexed: {}", stats.num_symbols_indexed);

    Ok(())
}

fn cmd_search(args: SearchArgs) -> Result<()> {
    let (_directory, index_path) = resolve_paths(
        args.common.directory.as_deref(),
        args.common.index_path.as_deref(),
        true,
    )?;

    let query_text = args.query.join(" ");
    let index = SymbolIndex::open(&index_path)?;

    let query = match index.parse_query(&query_text) {
        Ok(query) => query,
        Err(err) => bail!("Invalid query: {err}"),
    };

    let symbols = index.search(&query, 0, args.num)?;

    let output = OutputFormat::from_flag(args.format.as_deref());
    let mut demangler = args.demangle_names.then(Demangler::new);

    for symbol in &symbols {
        let line = output.render(symbol, demangler.as_mut())?;
        println!("{line}");
    }

    Ok(())
}

fn cmd_files(args: FilesArgs) -> Result<()> {
    let (_directory, index_path) = resolve_paths(
        args.common.directory.as_deref(),
        args.common.index_path.as_deref(),
        true,
    )?;

    let index = SymbolIndex::open(&index_path)?;
    for file in index.all_files()? {
        println!("{}", file.display());
    }

    Ok(())
}

/// Emits graph-search progress as JSON lines on stderr.
struct JsonProgress {
    enabled: bool,
    visited: usize,
}

impl GraphObserver for JsonProgress {
    fn on_progress(&mut self, done: usize, total: usize) {
        if self.enabled {
            eprintln!(
                "{}",
                json!({"event": "progress", "done": done, "total": total})
            );
        }
    }

    fn on_symbol_visited(&mut self) {
        self.visited += 1;
        if self.enabled && self.visited % 100 == 0 {
            eprintln!("{}", json!({"event": "visited", "count": self.visited}));
        }
    }

    fn on_route_found(&mut self) {
        if self.enabled {
            eprintln!("{}", json!({"event": "route_found"}));
        }
    }
}

fn cmd_graph(args: GraphArgs) -> Result<()> {
    let (_directory, index_path) = resolve_paths(
        args.common.directory.as_deref(),
        args.common.index_path.as_deref(),
        true,
    )?;

    let index = SymbolIndex::open(&index_path)?;
    let num_routes = (args.num_routes > 0).then_some(args.num_routes);

    let mut observer = JsonProgress {
        enabled: args.json_progress,
        visited: 0,
    };

    let graph = graph::generate_graph(
        &index,
        &args.start_query,
        &args.goal_query,
        args.algorithm.to_model(),
        num_routes,
        &mut observer,
    )?;

    let mut demangler = args.demangle_names.then(Demangler::new);
    print!("{}", graph::dot::render(&graph, demangler.as_mut()));

    Ok(())
}
