use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::error::{LoadError, StoreError};
use crate::schema::{Relation, RowKey, TypedRow};
use crate::store::{RejectionKind, RowOutcome, Store, WritePolicy};

#[derive(Debug, Clone, PartialEq)]
pub struct LoadRejection {
    pub key: RowKey,
    pub kind: RejectionKind,
    pub message: String,
}

/// What one committed (or replayed) batch contributed. Callers fold these
/// into their own running totals.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BatchReport {
    pub loaded: BTreeMap<Relation, usize>,
    pub rejections: Vec<LoadRejection>,
    pub replayed: bool,
}

impl BatchReport {
    pub fn loaded_total(&self) -> usize {
        self.loaded.values().sum()
    }
}

pub struct BatchLoader<'a, S: Store> {
    store: &'a mut S,
    policy: WritePolicy,
    batch_size: usize,
    pending: Vec<TypedRow>,
}

impl<'a, S: Store> BatchLoader<'a, S> {
    pub fn new(store: &'a mut S, policy: WritePolicy, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            store,
            policy,
            batch_size,
            pending: Vec::with_capacity(batch_size),
        }
    }

    /// Queues the rows of one source record. The group never straddles a
    /// batch boundary: a group that would overflow the pending batch flushes
    /// it first, and a group larger than the batch size is written as one
    /// batch of its own.
    pub fn push_group(&mut self, rows: Vec<TypedRow>) -> Result<Vec<BatchReport>, LoadError> {
        let mut reports = Vec::new();
        if rows.is_empty() {
            return Ok(reports);
        }
        if !self.pending.is_empty() && self.pending.len() + rows.len() > self.batch_size {
            reports.extend(self.flush()?);
        }
        self.pending.extend(rows);
        if self.pending.len() >= self.batch_size {
            reports.extend(self.flush()?);
        }
        Ok(reports)
    }

    pub fn flush(&mut self) -> Result<Option<BatchReport>, LoadError> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        let rows = std::mem::take(&mut self.pending);
        self.write_batch(rows).map(Some)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn write_batch(&mut self, rows: Vec<TypedRow>) -> Result<BatchReport, LoadError> {
        match self.try_batch(&rows) {
            Ok(report) => {
                debug!(rows = rows.len(), "batch committed");
                Ok(report)
            }
            Err(err) => {
                self.store.rollback()?;
                if !err.is_transient() && !matches!(err, BatchFailure::Rejected) {
                    return Err(LoadError::StructuralFailure(err.to_string()));
                }
                warn!(rows = rows.len(), reason = %err, "batch rolled back, replaying rows one by one");
                self.replay(rows)
            }
        }
    }

    fn try_batch(&mut self, rows: &[TypedRow]) -> Result<BatchReport, BatchFailure> {
        self.store.begin_transaction()?;
        let outcomes = self.store.execute_batch(rows, self.policy)?;
        if outcomes
            .iter()
            .any(|outcome| matches!(outcome, RowOutcome::Rejected { .. }))
        {
            return Err(BatchFailure::Rejected);
        }
        self.store.commit()?;

        let mut report = BatchReport::default();
        for row in rows {
            *report.loaded.entry(row.relation).or_default() += 1;
        }
        Ok(report)
    }

    fn replay(&mut self, rows: Vec<TypedRow>) -> Result<BatchReport, LoadError> {
        let mut report = BatchReport {
            replayed: true,
            ..BatchReport::default()
        };

        for row in rows {
            let single = std::slice::from_ref(&row);
            let outcome = self
                .store
                .begin_transaction()
                .and_then(|_| self.store.execute_batch(single, self.policy))
                .and_then(|mut outcomes| {
                    let outcome = outcomes.pop().unwrap_or(RowOutcome::Written);
                    if outcome == RowOutcome::Written {
                        self.store.commit()?;
                    }
                    Ok(outcome)
                });

            match outcome {
                Ok(RowOutcome::Written) => {
                    *report.loaded.entry(row.relation).or_default() += 1;
                }
                Ok(RowOutcome::Rejected { kind, message }) => {
                    self.store.rollback()?;
                    report.rejections.push(LoadRejection {
                        key: row.key(),
                        kind,
                        message,
                    });
                }
                Err(err) if err.is_transient() => {
                    self.store.rollback()?;
                    report.rejections.push(LoadRejection {
                        key: row.key(),
                        kind: RejectionKind::Timeout,
                        message: err.to_string(),
                    });
                }
                Err(err) => {
                    self.store.rollback()?;
                    return Err(LoadError::StructuralFailure(err.to_string()));
                }
            }
        }

        Ok(report)
    }
}

#[derive(Debug, thiserror::Error)]
enum BatchFailure {
    #[error("one or more rows were rejected")]
    Rejected,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BatchFailure {
    fn is_transient(&self) -> bool {
        match self {
            BatchFailure::Rejected => false,
            BatchFailure::Store(err) => err.is_transient(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::schema::{FieldValue, TableDef};
    use crate::store::memory::MemoryTarget;
    use crate::store::{Connect, SqliteStore};

    fn open_store(dir: &tempfile::TempDir) -> SqliteStore {
        let mut store =
            SqliteStore::open(&dir.path().join("movies.sqlite"), Duration::from_secs(5))
                .expect("open store");
        let tables: Vec<&TableDef> = Relation::ALL.iter().map(|relation| relation.def()).collect();
        store.create_schema(&tables).expect("create schema");
        store
    }

    fn movie(id: i64) -> TypedRow {
        let def = Relation::Movies.def();
        let mut values = vec![FieldValue::Null; def.columns.len()];
        values[0] = FieldValue::Integer(id);
        values[def.column_index("adult").expect("adult")] = FieldValue::Integer(0);
        values[def.column_index("video").expect("video")] = FieldValue::Integer(0);
        TypedRow::new(Relation::Movies, values)
    }

    fn rating(user_id: i64, movie_id: i64) -> TypedRow {
        TypedRow::new(
            Relation::Ratings,
            vec![
                FieldValue::Integer(user_id),
                FieldValue::Integer(movie_id),
                FieldValue::Real(4.0),
                FieldValue::Integer(1_260_759_144),
            ],
        )
    }

    #[test]
    fn one_bad_row_in_a_hundred_only_costs_that_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = open_store(&dir);
        {
            let mut loader = BatchLoader::new(&mut store, WritePolicy::Insert, 10);
            loader.push_group(vec![movie(1)]).expect("push movie");
            let report = loader.flush().expect("flush").expect("report");
            assert_eq!(report.loaded_total(), 1);
        }

        let mut loader = BatchLoader::new(&mut store, WritePolicy::Insert, 100);
        let mut reports = Vec::new();
        for user_id in 1..=100 {
            let movie_id = if user_id == 57 { 999 } else { 1 };
            reports.extend(loader.push_group(vec![rating(user_id, movie_id)]).expect("push"));
        }
        assert_eq!(loader.pending_len(), 0);
        assert_eq!(reports.len(), 1);

        let report = &reports[0];
        assert!(report.replayed);
        assert_eq!(report.loaded.get(&Relation::Ratings), Some(&99));
        assert_eq!(report.rejections.len(), 1);
        assert_eq!(report.rejections[0].kind, RejectionKind::ForeignKey);
        assert_eq!(
            report.rejections[0].key.to_string(),
            "ratings(user_id=57, movie_id=999)"
        );
        assert_eq!(store.count(Relation::Ratings).expect("count"), 99);
    }

    #[test]
    fn clean_batches_commit_without_replay() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = open_store(&dir);
        let mut loader = BatchLoader::new(&mut store, WritePolicy::Upsert, 2);

        let first = loader.push_group(vec![movie(1)]).expect("push");
        assert!(first.is_empty());
        let second = loader.push_group(vec![movie(2)]).expect("push");
        assert_eq!(second.len(), 1);
        assert!(!second[0].replayed);
        assert_eq!(second[0].loaded_total(), 2);

        loader.push_group(vec![movie(3)]).expect("push");
        let tail = loader.flush().expect("flush").expect("tail batch");
        assert_eq!(tail.loaded_total(), 1);
        assert!(loader.flush().expect("flush").is_none());
        assert_eq!(store.count(Relation::Movies).expect("count"), 3);
    }

    #[test]
    fn record_groups_are_not_split_across_batches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = open_store(&dir);
        let mut loader = BatchLoader::new(&mut store, WritePolicy::Insert, 3);

        assert!(loader.push_group(vec![movie(1), rating(1, 1)]).expect("push").is_empty());

        let reports = loader
            .push_group(vec![movie(2), rating(1, 2)])
            .expect("push");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].loaded_total(), 2);
        assert_eq!(loader.pending_len(), 2);

        let oversized = loader
            .push_group(vec![movie(3), rating(1, 3), rating(2, 3), rating(3, 3)])
            .expect("push");
        assert_eq!(
            oversized.iter().map(BatchReport::loaded_total).collect::<Vec<_>>(),
            vec![2, 4]
        );
        assert_eq!(loader.pending_len(), 0);
    }

    #[test]
    fn timed_out_batch_is_replayed_row_by_row() {
        let target = MemoryTarget::default().timeout_batches_over(1);
        let mut store = target.connect().expect("connect");
        let mut loader = BatchLoader::new(&mut store, WritePolicy::Insert, 3);

        let reports = loader
            .push_group(vec![movie(1), movie(2), movie(3)])
            .expect("push");

        assert_eq!(reports.len(), 1);
        assert!(reports[0].replayed);
        assert!(reports[0].rejections.is_empty());
        assert_eq!(reports[0].loaded.get(&Relation::Movies), Some(&3));
        assert_eq!(target.committed(Relation::Movies), 3);
    }

    #[test]
    fn rows_that_still_time_out_alone_are_rejected() {
        let target = MemoryTarget::default().timeout_batches_over(0);
        let mut store = target.connect().expect("connect");
        let mut loader = BatchLoader::new(&mut store, WritePolicy::Insert, 2);

        let reports = loader.push_group(vec![movie(1), movie(2)]).expect("push");

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].loaded_total(), 0);
        assert_eq!(reports[0].rejections.len(), 2);
        assert!(
            reports[0]
                .rejections
                .iter()
                .all(|rejection| rejection.kind == RejectionKind::Timeout)
        );
        assert_eq!(target.committed(Relation::Movies), 0);
    }

    #[test]
    fn non_transient_store_errors_are_structural() {
        let target = MemoryTarget::default().fail_relation(Relation::Ratings);
        let mut store = target.connect().expect("connect");
        let mut loader = BatchLoader::new(&mut store, WritePolicy::Insert, 1);

        let err = loader
            .push_group(vec![rating(1, 1)])
            .expect_err("batch must fail");

        assert!(matches!(err, LoadError::StructuralFailure(_)));
        assert_eq!(target.committed(Relation::Ratings), 0);
    }
}
