use std::collections::BTreeMap;
use std::path::PathBuf;

use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use tracing::{error, info, warn};

use super::pipeline::{CancellationToken, PipelineSettings, run_dataset};
use crate::cli::{LoadArgs, ReloadMode};
use crate::error::{LoadError, StoreError};
use crate::model::{Dataset, DatasetOutcome, DatasetStats, RunStatus};
use crate::schema::{DB_SCHEMA_VERSION, Relation, TableDef};
use crate::source;
use crate::store::{Connect, Store};

#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub reload_mode: ReloadMode,
    pub batch_size: usize,
    pub workers: usize,
    pub sources: BTreeMap<Dataset, PathBuf>,
}

impl LoadConfig {
    pub fn from_args(args: &LoadArgs) -> Self {
        let selected: Vec<Dataset> = if args.datasets.is_empty() {
            Dataset::ALL.to_vec()
        } else {
            args.datasets.clone()
        };

        let sources = selected
            .into_iter()
            .map(|dataset| {
                let path = args
                    .source_override(dataset)
                    .cloned()
                    .unwrap_or_else(|| args.data_dir.join(dataset.default_file_name()));
                (dataset, path)
            })
            .collect();

        Self {
            reload_mode: args.reload_mode,
            batch_size: args.batch_size.max(1),
            workers: args.workers.max(1),
            sources,
        }
    }

    fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            policy: self.reload_mode.write_policy(),
            batch_size: self.batch_size,
        }
    }
}

#[derive(Debug)]
pub struct LoadOutcome {
    pub status: RunStatus,
    pub datasets: BTreeMap<Dataset, DatasetStats>,
}

impl LoadOutcome {
    fn failed(reason: String, datasets: BTreeMap<Dataset, DatasetStats>) -> Self {
        error!(reason = %reason, "load run failed");
        Self {
            status: RunStatus::Failed { reason },
            datasets,
        }
    }
}

/// Runs one full load: schema, optional truncation, Movies, then every
/// dependent dataset on the worker pool.
pub fn execute<C: Connect>(
    target: &C,
    config: &LoadConfig,
    cancel: &CancellationToken,
    run_id: &str,
) -> LoadOutcome {
    let mut datasets = BTreeMap::new();

    let mut store = match target.connect() {
        Ok(store) => store,
        Err(err) => return LoadOutcome::failed(format!("store unreachable: {err}"), datasets),
    };
    if let Err(err) = prepare_store(&mut store, config) {
        return LoadOutcome::failed(err.to_string(), datasets);
    }

    let settings = config.settings();
    if let Some(path) = config.sources.get(&Dataset::Movies) {
        let stats = run_dataset(target, Dataset::Movies, path, settings, cancel);
        datasets.insert(Dataset::Movies, stats);
    }

    let dependents: Vec<(Dataset, &PathBuf)> = config
        .sources
        .iter()
        .filter(|(dataset, _)| dataset.depends_on_movies())
        .map(|(dataset, path)| (*dataset, path))
        .collect();

    let mut blocked: Option<String> = None;
    if !dependents.is_empty() {
        blocked = match movies_gate(&store, &datasets, cancel) {
            Ok(gate) => gate,
            Err(err) => {
                return LoadOutcome::failed(format!("movies relation check failed: {err}"), datasets);
            }
        };
    }

    match &blocked {
        Some(reason) => {
            warn!(reason = %reason, "dependent datasets skipped");
            for (dataset, path) in &dependents {
                datasets.insert(
                    *dataset,
                    DatasetStats::skipped(path.display().to_string(), reason.clone()),
                );
            }
        }
        None if !dependents.is_empty() => {
            let pool = match ThreadPoolBuilder::new().num_threads(config.workers).build() {
                Ok(pool) => pool,
                Err(err) => {
                    return LoadOutcome::failed(format!("worker pool unavailable: {err}"), datasets);
                }
            };
            info!(
                workers = config.workers,
                datasets = dependents.len(),
                "loading dependent datasets"
            );
            let results: Vec<(Dataset, DatasetStats)> = pool.install(|| {
                dependents
                    .par_iter()
                    .map(|(dataset, path)| {
                        (*dataset, run_dataset(target, *dataset, path, settings, cancel))
                    })
                    .collect()
            });
            datasets.extend(results);
        }
        None => {}
    }

    let status = decide_status(&datasets, blocked.as_deref(), cancel);
    if let Err(err) = record_run(&mut store, run_id, &status) {
        warn!(error = %err, "failed to record run metadata");
    }
    if let RunStatus::Failed { reason } = &status {
        error!(reason = %reason, "load run failed");
    }

    LoadOutcome { status, datasets }
}

fn prepare_store<S: Store>(store: &mut S, config: &LoadConfig) -> Result<(), LoadError> {
    let tables: Vec<&TableDef> = Relation::ALL.iter().map(|relation| relation.def()).collect();
    store.create_schema(&tables)?;
    for relation in Relation::ALL {
        if !store.table_exists(relation.table_name())? {
            return Err(LoadError::StructuralFailure(format!(
                "table {} missing after schema creation",
                relation.table_name()
            )));
        }
    }
    store.set_metadata("db_schema_version", DB_SCHEMA_VERSION)?;

    if config.reload_mode == ReloadMode::Truncate {
        let relations = relations_to_clear(readable_sources(config));
        info!(
            relations = ?relations.iter().map(|relation| relation.table_name()).collect::<Vec<_>>(),
            "clearing relations before reload"
        );
        store.clear(&relations)?;
    }
    Ok(())
}

/// Datasets whose source opens. A dataset that cannot be read keeps its
/// stored relations instead of being wiped and left empty.
fn readable_sources(config: &LoadConfig) -> impl Iterator<Item = Dataset> + '_ {
    config
        .sources
        .iter()
        .filter_map(|(dataset, path)| match source::open(path) {
            Ok(_) => Some(*dataset),
            Err(err) => {
                warn!(dataset = %dataset, error = %err, "source unavailable, keeping stored relations");
                None
            }
        })
}

/// Relations a truncating run must empty, children before parents. Clearing
/// Movies drags every relation that references it along.
pub(crate) fn relations_to_clear(selected: impl Iterator<Item = Dataset>) -> Vec<Relation> {
    let selected: Vec<Dataset> = selected.collect();
    let everything = selected.contains(&Dataset::Movies);

    Relation::ALL
        .iter()
        .rev()
        .copied()
        .filter(|relation| {
            everything
                || selected
                    .iter()
                    .any(|dataset| dataset.relations().contains(relation))
        })
        .collect()
}

fn movies_gate<S: Store>(
    store: &S,
    datasets: &BTreeMap<Dataset, DatasetStats>,
    cancel: &CancellationToken,
) -> Result<Option<String>, StoreError> {
    if cancel.is_cancelled() {
        return Ok(Some("run cancelled before dependent datasets started".to_string()));
    }
    if datasets
        .get(&Dataset::Movies)
        .is_some_and(DatasetStats::is_aborted)
    {
        return Ok(Some("movies load aborted".to_string()));
    }

    let movies = store.count(Relation::Movies)?;
    if movies == 0 {
        return Ok(Some("movies relation is not populated".to_string()));
    }
    info!(movies, "movies relation populated, dependents may proceed");
    Ok(None)
}

fn decide_status(
    datasets: &BTreeMap<Dataset, DatasetStats>,
    blocked: Option<&str>,
    cancel: &CancellationToken,
) -> RunStatus {
    let aborted = datasets.iter().find_map(|(dataset, stats)| match &stats.outcome {
        DatasetOutcome::Aborted { reason } => Some(format!("{dataset}: {reason}")),
        _ => None,
    });
    if let Some(reason) = aborted {
        return RunStatus::Failed { reason };
    }
    if cancel.is_cancelled() {
        return RunStatus::Failed {
            reason: "run cancelled".to_string(),
        };
    }
    if let Some(reason) = blocked {
        return RunStatus::Failed {
            reason: reason.to_string(),
        };
    }
    RunStatus::Succeeded
}

fn record_run<S: Store>(store: &mut S, run_id: &str, status: &RunStatus) -> Result<(), StoreError> {
    store.set_metadata("last_run_id", run_id)?;
    store.set_metadata("last_run_status", &status.to_string())?;
    Ok(())
}
