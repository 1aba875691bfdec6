use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::decode::{DecodeOutcome, FieldDecoder};
use crate::error::LoadError;
use crate::loader::{BatchLoader, BatchReport};
use crate::model::{Dataset, DatasetOutcome, DatasetStats};
use crate::schema::{DuplicateFilter, map_staged};
use crate::source::{self, SourceEvent};
use crate::store::{Connect, RejectionKind, WritePolicy};
use crate::util::sha256_file;

/// Shared stop flag, checked by every dataset between batches.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PipelineSettings {
    pub policy: WritePolicy,
    pub batch_size: usize,
}

/// Runs one dataset end to end on its own store connection. Never fails:
/// fatal conditions end up in the returned outcome, and a structural failure
/// also cancels the datasets still running.
pub(crate) fn run_dataset<C: Connect>(
    target: &C,
    dataset: Dataset,
    path: &Path,
    settings: PipelineSettings,
    cancel: &CancellationToken,
) -> DatasetStats {
    let started = Instant::now();
    let mut stats = DatasetStats::new(path.display().to_string());

    info!(dataset = %dataset, path = %path.display(), "dataset load started");

    match load_dataset(target, dataset, path, settings, cancel, &mut stats) {
        Ok(()) => {}
        Err(err @ LoadError::SourceUnavailable { .. }) => {
            warn!(dataset = %dataset, error = %err, "dataset source unavailable");
            stats.outcome = DatasetOutcome::SourceUnavailable {
                reason: err.to_string(),
            };
        }
        Err(err @ LoadError::StructuralFailure(_)) => {
            error!(dataset = %dataset, error = %err, "dataset load aborted, cancelling the run");
            cancel.cancel();
            stats.outcome = DatasetOutcome::Aborted {
                reason: err.to_string(),
            };
        }
    }

    stats.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    if stats.orphaned > 0 {
        warn!(
            dataset = %dataset,
            orphaned = stats.orphaned,
            "rows referenced movies missing from the store"
        );
    }
    info!(
        dataset = %dataset,
        loaded = stats.loaded,
        rejected_decode = stats.rejected_decode,
        rejected_load = stats.rejected_load,
        duplicate_skipped = stats.duplicate_skipped,
        duration_ms = stats.duration_ms,
        "dataset load finished"
    );

    stats
}

fn load_dataset<C: Connect>(
    target: &C,
    dataset: Dataset,
    path: &Path,
    settings: PipelineSettings,
    cancel: &CancellationToken,
    stats: &mut DatasetStats,
) -> Result<(), LoadError> {
    let records = source::open(path)?;
    match sha256_file(path) {
        Ok(digest) => stats.source_sha256 = Some(digest),
        Err(err) => warn!(path = %path.display(), error = %err, "failed to fingerprint source"),
    }

    let decoder =
        FieldDecoder::new().map_err(|err| LoadError::StructuralFailure(err.to_string()))?;
    let mut store = target.connect()?;
    let mut loader = BatchLoader::new(&mut store, settings.policy, settings.batch_size);
    let mut duplicates = DuplicateFilter::default();

    debug!(dataset = %dataset, path = %records.path().display(), "streaming records");

    for event in records {
        if cancel.is_cancelled() {
            debug!(dataset = %dataset, pending = loader.pending_len(), "flushing queued records before stopping");
            if let Some(report) = loader.flush()? {
                absorb(stats, dataset, report);
            }
            info!(dataset = %dataset, "dataset load cancelled between batches");
            stats.outcome = DatasetOutcome::Cancelled;
            return Ok(());
        }

        let row = match event {
            SourceEvent::Row(row) => row,
            SourceEvent::Malformed { line, message } => {
                stats.rejected_decode += 1;
                stats.warn(format!("line {line}: malformed row: {message}"));
                continue;
            }
        };

        let staged = match decoder.decode(dataset, row) {
            DecodeOutcome::Decoded(staged) => staged,
            DecodeOutcome::Rejected { reason, raw } => {
                stats.rejected_decode += 1;
                debug!(
                    dataset = %dataset,
                    line = raw.line(),
                    reason = %reason,
                    raw = ?raw.to_map(),
                    "row rejected at decode"
                );
                stats.warn(format!("line {}: rejected: {reason}", raw.line()));
                continue;
            }
        };
        stats.dropped_nested_elements += staged.dropped_elements;

        let (rows, skipped) = duplicates.admit(&staged.parent, map_staged(&staged));
        stats.duplicate_skipped += skipped;

        for report in loader.push_group(rows)? {
            absorb(stats, dataset, report);
        }
    }

    if let Some(report) = loader.flush()? {
        absorb(stats, dataset, report);
    }

    Ok(())
}

fn absorb(stats: &mut DatasetStats, dataset: Dataset, report: BatchReport) {
    stats.batches_committed += 1;
    if report.replayed {
        stats.batches_replayed += 1;
    }

    stats.loaded += report.loaded_total();
    for (relation, count) in report.loaded {
        *stats.relations.entry(relation).or_default() += count;
    }

    for rejection in report.rejections {
        stats.rejected_load += 1;
        debug!(dataset = %dataset, row = %rejection.key, kind = ?rejection.kind, "row rejected at load");
        if rejection.kind == RejectionKind::ForeignKey {
            stats.orphaned += 1;
            stats.warn(format!("orphan {}: referenced movie is missing", rejection.key));
        } else {
            stats.warn(format!(
                "load rejected {}: {}",
                rejection.key, rejection.message
            ));
        }
    }
}
