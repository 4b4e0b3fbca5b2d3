//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use icsd_core::{ContentType, SearchKind, Settings};

/// Batch retrieval of ICSD structure records and CIF files.
///
/// Runs a search, then fetches every hit in batches of at most 500 ids on a
/// pool of concurrent workers and merges the batches into one file. Ids whose
/// batch failed are listed in `<NAME>_failed_to_download_ids.txt`.
///
/// Credentials are read from ICSD_LOGIN_ID and ICSD_PASSWORD.
#[derive(Parser, Debug)]
#[command(name = "icsd-downloader")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/icsd-downloader/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Login id (overrides ICSD_LOGIN_ID)
    #[arg(long, global = true)]
    pub login_id: Option<String>,

    /// Maximum concurrent batches (1-100)
    #[arg(short = 'c', long, global = true, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: Option<u8>,

    /// Ids per request (1-500)
    #[arg(short = 'b', long, global = true, value_parser = clap::value_parser!(u16).range(1..=500))]
    pub batch_size: Option<u16>,

    /// Folder for merged output files
    #[arg(short = 'o', long, global = true)]
    pub output_dir: Option<PathBuf>,

    /// Database partition to search
    #[arg(long, global = true, value_enum, default_value_t = ContentTypeArg::Inorganic)]
    pub content_type: ContentTypeArg,

    #[command(subcommand)]
    pub command: Command,
}

/// What to do with the search hits.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the ids matching a query, one per line
    Search {
        /// Search query
        query: String,

        /// Use free-text search instead of expert search
        #[arg(long)]
        simple: bool,
    },

    /// Fetch tabular records for every hit into <NAME>.csv
    Records {
        /// Expert search query
        query: String,

        /// Extra column to include (repeatable)
        #[arg(short = 'f', long = "field")]
        fields: Vec<String>,

        /// Output file prefix
        #[arg(short = 'n', long, default_value = "icsd_data")]
        name: String,
    },

    /// Fetch CIF files for every hit into <NAME>_results.zip
    Structures {
        /// Expert search query
        query: String,

        /// Write one concatenated <NAME>_results.cif instead of a zip archive
        #[arg(long)]
        text: bool,

        /// Output file prefix
        #[arg(short = 'n', long, default_value = "icsd")]
        name: String,
    },
}

impl Command {
    /// The search query every command starts with.
    #[must_use]
    pub fn query(&self) -> &str {
        match self {
            Self::Search { query, .. }
            | Self::Records { query, .. }
            | Self::Structures { query, .. } => query,
        }
    }

    /// Which search endpoint the command uses.
    #[must_use]
    pub fn search_kind(&self) -> SearchKind {
        match self {
            Self::Search { simple: true, .. } => SearchKind::Simple,
            _ => SearchKind::Expert,
        }
    }
}

/// CLI names for the content type partitions.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentTypeArg {
    Inorganic,
    Metalorganic,
    Theoretical,
}

impl From<ContentTypeArg> for ContentType {
    fn from(value: ContentTypeArg) -> Self {
        match value {
            ContentTypeArg::Inorganic => Self::ExperimentalInorganic,
            ContentTypeArg::Metalorganic => Self::ExperimentalMetalorganic,
            ContentTypeArg::Theoretical => Self::TheoreticalStructures,
        }
    }
}

impl Args {
    /// Overrides file settings with the flags that were given.
    pub fn apply_to(&self, settings: &mut Settings) {
        if let Some(concurrency) = self.concurrency {
            settings.concurrency = usize::from(concurrency);
        }
        if let Some(batch_size) = self.batch_size {
            settings.batch_size = usize::from(batch_size);
        }
        if let Some(output_dir) = &self.output_dir {
            settings.output_dir.clone_from(output_dir);
        }
    }
}
