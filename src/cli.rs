use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "colldex",
    version,
    about = "MongoDB data-access knowledge extractor for C# repositories",
    after_help = r#"Examples:
  colldex scan --repo .
  colldex scan --repo . --sample-dir ./exports --sample-ceiling 200
  colldex sample --repo . --sample-dir ./exports --collection users --size 100
  colldex search --repo . --query UserId --entity relationship
  colldex relationships --repo . --type Order --min-confidence 0.7
  colldex overview --repo .
"#
)]
pub struct Args {
    /// Debug logging on stderr (overrides RUST_LOG).
    #[arg(long, short, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Analyze the repository once and write all facts to the store.
    Scan {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
        /// Include files ignored by .gitignore.
        #[arg(long)]
        no_ignore: bool,
        /// Repository id stamped on facts (default: directory name).
        #[arg(long)]
        repository: Option<String>,
        /// Commit stamped on facts (default: git HEAD).
        #[arg(long)]
        commit: Option<String>,
        /// Maximum files extracted concurrently.
        #[arg(long)]
        concurrency: Option<usize>,
        /// Directory of exported collections (`<name>.json` / `<name>.jsonl`) to sample.
        #[arg(long, value_name = "DIR")]
        sample_dir: Option<PathBuf>,
        /// Ceiling on documents sampled per collection.
        #[arg(long)]
        sample_ceiling: Option<usize>,
        /// Overall scan deadline in seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Sample one collection and store its observed schema.
    Sample {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long, value_name = "DIR")]
        sample_dir: PathBuf,
        #[arg(long)]
        collection: String,
        #[arg(long, default_value_t = 100, allow_hyphen_values = true)]
        size: i64,
        #[arg(long)]
        sample_ceiling: Option<usize>,
        /// Seed for reproducible samples.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Free-text search over knowledge base entries.
    Search {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        query: String,
        /// Restrict to one entity type (type, mapping, operation, relationship, schema, drift).
        #[arg(long)]
        entity: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print store counts and the last scan summary.
    Overview {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Relationships of a type, by simple or qualified name.
    Relationships {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long = "type", value_name = "NAME")]
        type_name: String,
        #[arg(long, default_value_t = 0.0)]
        min_confidence: f64,
    },
}
