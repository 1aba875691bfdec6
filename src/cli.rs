use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::model::Dataset;
use crate::store::WritePolicy;

#[derive(Parser, Debug)]
#[command(
    name = "movieload",
    version,
    about = "Load the movie dataset family into a normalized relational store"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Load(LoadArgs),
    Status(StatusArgs),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ReloadMode {
    Truncate,
    Upsert,
}

impl ReloadMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Truncate => "truncate",
            Self::Upsert => "upsert",
        }
    }

    pub fn write_policy(self) -> WritePolicy {
        match self {
            Self::Truncate => WritePolicy::Insert,
            Self::Upsert => WritePolicy::Upsert,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoadArgs {
    #[arg(long, env = "MOVIELOAD_CACHE_ROOT", default_value = ".cache/movieload")]
    pub cache_root: PathBuf,

    #[arg(long, env = "MOVIELOAD_DB_PATH")]
    pub db_path: Option<PathBuf>,

    #[arg(long, env = "MOVIELOAD_DATA_DIR", default_value = ".")]
    pub data_dir: PathBuf,

    #[arg(long, env = "MOVIELOAD_RELOAD_MODE", value_enum, default_value_t = ReloadMode::Truncate)]
    pub reload_mode: ReloadMode,

    #[arg(long, env = "MOVIELOAD_BATCH_SIZE", default_value_t = 1000)]
    pub batch_size: usize,

    #[arg(long, env = "MOVIELOAD_WORKERS", default_value_t = 4)]
    pub workers: usize,

    #[arg(long, env = "MOVIELOAD_BATCH_TIMEOUT_MS", default_value_t = 30_000)]
    pub batch_timeout_ms: u64,

    #[arg(long = "dataset", value_enum)]
    pub datasets: Vec<Dataset>,

    #[arg(long, env = "MOVIELOAD_MOVIES_PATH")]
    pub movies_path: Option<PathBuf>,

    #[arg(long, env = "MOVIELOAD_CREDITS_PATH")]
    pub credits_path: Option<PathBuf>,

    #[arg(long, env = "MOVIELOAD_KEYWORDS_PATH")]
    pub keywords_path: Option<PathBuf>,

    #[arg(long, env = "MOVIELOAD_RATINGS_PATH")]
    pub ratings_path: Option<PathBuf>,

    #[arg(long, env = "MOVIELOAD_LINKS_PATH")]
    pub links_path: Option<PathBuf>,

    #[arg(long)]
    pub report_path: Option<PathBuf>,
}

impl LoadArgs {
    pub fn source_override(&self, dataset: Dataset) -> Option<&PathBuf> {
        match dataset {
            Dataset::Movies => self.movies_path.as_ref(),
            Dataset::Credits => self.credits_path.as_ref(),
            Dataset::Keywords => self.keywords_path.as_ref(),
            Dataset::Ratings => self.ratings_path.as_ref(),
            Dataset::Links => self.links_path.as_ref(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, env = "MOVIELOAD_CACHE_ROOT", default_value = ".cache/movieload")]
    pub cache_root: PathBuf,

    #[arg(long, env = "MOVIELOAD_DB_PATH")]
    pub db_path: Option<PathBuf>,
}
