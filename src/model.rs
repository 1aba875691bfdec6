use std::collections::BTreeMap;
use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::schema::Relation;

const WARNING_SAMPLE_LIMIT: usize = 50;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Dataset {
    Movies,
    Credits,
    Keywords,
    Ratings,
    Links,
}

impl Dataset {
    pub const ALL: [Dataset; 5] = [
        Dataset::Movies,
        Dataset::Credits,
        Dataset::Keywords,
        Dataset::Ratings,
        Dataset::Links,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Movies => "movies",
            Self::Credits => "credits",
            Self::Keywords => "keywords",
            Self::Ratings => "ratings",
            Self::Links => "links",
        }
    }

    pub fn default_file_name(self) -> &'static str {
        match self {
            Self::Movies => "movies_metadata.csv",
            Self::Credits => "credits.csv",
            Self::Keywords => "keywords.csv",
            Self::Ratings => "ratings.csv",
            Self::Links => "links.csv",
        }
    }

    pub fn depends_on_movies(self) -> bool {
        !matches!(self, Self::Movies)
    }

    pub fn relations(self) -> &'static [Relation] {
        match self {
            Self::Movies => &[
                Relation::Movies,
                Relation::MovieGenres,
                Relation::MovieProductionCompanies,
                Relation::MovieCollections,
            ],
            Self::Credits => &[Relation::Credits],
            Self::Keywords => &[Relation::Keywords],
            Self::Ratings => &[Relation::Ratings],
            Self::Links => &[Relation::Links],
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum DatasetOutcome {
    Completed,
    Cancelled,
    SourceUnavailable { reason: String },
    Skipped { reason: String },
    Aborted { reason: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetStats {
    pub source_path: String,
    pub source_sha256: Option<String>,
    pub loaded: usize,
    pub rejected_decode: usize,
    pub rejected_load: usize,
    pub duplicate_skipped: usize,
    pub orphaned: usize,
    pub dropped_nested_elements: usize,
    pub batches_committed: usize,
    pub batches_replayed: usize,
    pub relations: BTreeMap<Relation, usize>,
    pub duration_ms: u64,
    pub outcome: DatasetOutcome,
    pub warnings: Vec<String>,
}

impl DatasetStats {
    pub fn new(source_path: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            source_sha256: None,
            loaded: 0,
            rejected_decode: 0,
            rejected_load: 0,
            duplicate_skipped: 0,
            orphaned: 0,
            dropped_nested_elements: 0,
            batches_committed: 0,
            batches_replayed: 0,
            relations: BTreeMap::new(),
            duration_ms: 0,
            outcome: DatasetOutcome::Completed,
            warnings: Vec::new(),
        }
    }

    pub fn skipped(source_path: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut stats = Self::new(source_path);
        stats.outcome = DatasetOutcome::Skipped {
            reason: reason.into(),
        };
        stats
    }

    /// Keeps the first warnings verbatim; the counters stay exact regardless.
    pub fn warn(&mut self, message: String) {
        if self.warnings.len() < WARNING_SAMPLE_LIMIT {
            self.warnings.push(message);
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.outcome, DatasetOutcome::Aborted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "state")]
pub enum RunStatus {
    Succeeded,
    Failed { reason: String },
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Succeeded => f.write_str("succeeded"),
            RunStatus::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub manifest_version: u32,
    pub run_id: String,
    pub db_schema_version: String,
    pub started_at: String,
    pub finished_at: String,
    pub reload_mode: String,
    pub batch_size: usize,
    pub workers: usize,
    pub db_path: String,
    pub status: RunStatus,
    pub datasets: BTreeMap<Dataset, DatasetStats>,
}
