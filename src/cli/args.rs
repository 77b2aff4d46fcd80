use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::graph::GraphAlgorithm;

/// Top-level CLI entrypoint for `bdx`.
#[derive(Parser, Debug)]
#[command(
    name = "bdx",
    about = "Index and search the symbol tables of ELF object files",
    version
)]
pub struct Cli {
    /// Raise logging verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build or refresh the index for a binary directory.
    Index(IndexArgs),
    /// Search the index for symbols.
    Search(SearchArgs),
    /// List all indexed object files.
    Files(FilesArgs),
    /// Emit a DOT graph of reference paths between two queries.
    Graph(GraphArgs),
}

/// Options shared by every subcommand.
#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Path to the binary directory. When omitted, it is recovered
    /// from the index, searching upward from the current directory.
    #[arg(short = 'd', long = "directory")]
    pub directory: Option<PathBuf>,

    /// Path to the index. By default it lives under the user cache
    /// directory, keyed by the binary directory.
    #[arg(long = "index-path")]
    pub index_path: Option<PathBuf>,
}

/// Arguments specific to the `index` subcommand.
#[derive(Args, Debug)]
pub struct IndexArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Discover object files through compile_commands.json and use it
    /// for source attribution.
    #[arg(short = 'c', long = "use-compilation-database")]
    pub use_compilation_database: bool,

    /// Indexing option overrides, e.g. `-o min_symbol_size=0`.
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
    pub options: Vec<String>,
}

/// Arguments specific to the `search` subcommand.
#[derive(Args, Debug)]
pub struct SearchArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Query words; an empty query matches everything.
    pub query: Vec<String>,

    /// Limit the number of results.
    #[arg(short = 'n', long = "num", value_name = "LIMIT")]
    pub num: Option<usize>,

    /// Output format: "json", "sexp", or a format string over the
    /// symbol fields, e.g. "{basename}: {name} {size}".
    #[arg(short = 'f', long = "format")]
    pub format: Option<String>,

    /// Demangle C++ names in the output.
    #[arg(long = "demangle-names")]
    pub demangle_names: bool,
}

/// Arguments specific to the `files` subcommand.
#[derive(Args, Debug)]
pub struct FilesArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

/// Graph search algorithm selector.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum AlgorithmArg {
    Bfs,
    Dfs,
    Astar,
}

impl AlgorithmArg {
    pub fn to_model(self) -> GraphAlgorithm {
        match self {
            AlgorithmArg::Bfs => GraphAlgorithm::Bfs,
            AlgorithmArg::Dfs => GraphAlgorithm::Dfs,
            AlgorithmArg::Astar => GraphAlgorithm::AStar,
        }
    }
}

/// Arguments specific to the `graph` subcommand.
#[derive(Args, Debug)]
pub struct GraphArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Paths start from symbols matching this query.
    pub start_query: String,

    /// Paths end at symbols matching this query.
    pub goal_query: String,

    /// Stop after finding this many routes (0 = unlimited).
    #[arg(short = 'n', long = "num-routes", default_value_t = 1)]
    pub num_routes: usize,

    /// Search algorithm.
    #[arg(
        short = 'a',
        long = "algorithm",
        value_enum,
        default_value_t = AlgorithmArg::Astar,
        ignore_case = true
    )]
    pub algorithm: AlgorithmArg,

    /// Demangle C++ names in node labels.
    #[arg(long = "demangle-names")]
    pub demangle_names: bool,

    /// Report search progress as JSON lines on stderr.
    #[arg(long = "json-progress")]
    pub json_progress: bool,
}
