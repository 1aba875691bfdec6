use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rusqlite::types::{ToSqlOutput, Value};
use rusqlite::{Connection, ErrorCode, OptionalExtension, ToSql, params_from_iter};
use tracing::debug;

use crate::error::StoreError;
use crate::schema::{FieldValue, Relation, TableDef, TypedRow};
use crate::util::now_utc_string;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// Plain insert; a key or constraint conflict rejects the row.
    Insert,
    /// Insert or update on primary-key conflict.
    Upsert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    ForeignKey,
    Constraint,
    Timeout,
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Written,
    Rejected { kind: RejectionKind, message: String },
}

/// What the batch loader needs from a relational store.
pub trait Store {
    fn begin_transaction(&mut self) -> Result<(), StoreError>;

    /// Executes every row inside the open transaction. Row-level failures come
    /// back as outcomes; an `Err` means the batch as a whole could not run.
    fn execute_batch(
        &mut self,
        rows: &[TypedRow],
        policy: WritePolicy,
    ) -> Result<Vec<RowOutcome>, StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;

    fn rollback(&mut self) -> Result<(), StoreError>;

    fn table_exists(&self, name: &str) -> Result<bool, StoreError>;

    fn create_schema(&mut self, tables: &[&TableDef]) -> Result<(), StoreError>;

    fn clear(&mut self, relations: &[Relation]) -> Result<(), StoreError>;

    fn count(&self, relation: Relation) -> Result<i64, StoreError>;

    fn set_metadata(&mut self, key: &str, value: &str) -> Result<(), StoreError>;

    fn metadata(&self, key: &str) -> Result<Option<String>, StoreError>;
}

/// Opens fresh store handles; every worker holds its own.
pub trait Connect: Sync {
    type Store: Store;

    fn connect(&self) -> Result<Self::Store, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteTarget {
    path: PathBuf,
    batch_timeout: Duration,
}

impl SqliteTarget {
    pub fn new(path: impl Into<PathBuf>, batch_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            batch_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Connect for SqliteTarget {
    type Store = SqliteStore;

    fn connect(&self) -> Result<SqliteStore, StoreError> {
        SqliteStore::open(&self.path, self.batch_timeout)
    }
}

pub struct SqliteStore {
    connection: Connection,
    batch_timeout: Duration,
    batch_started: Option<Instant>,
}

impl SqliteStore {
    pub fn open(path: &Path, batch_timeout: Duration) -> Result<Self, StoreError> {
        let connection = Connection::open(path)?;
        connection.pragma_update(None, "journal_mode", "WAL")?;
        connection.pragma_update(None, "synchronous", "NORMAL")?;
        connection.pragma_update(None, "foreign_keys", "ON")?;
        connection.busy_timeout(batch_timeout)?;

        debug!(path = %path.display(), "opened sqlite store");

        Ok(Self {
            connection,
            batch_timeout,
            batch_started: None,
        })
    }

    fn ensure_metadata_table(&self) -> Result<(), StoreError> {
        self.connection.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS metadata (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    fn deadline_passed(&self) -> bool {
        self.batch_started
            .map(|started| started.elapsed() > self.batch_timeout)
            .unwrap_or(false)
    }
}

impl Store for SqliteStore {
    fn begin_transaction(&mut self) -> Result<(), StoreError> {
        self.connection
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(classify_batch_error)?;
        self.batch_started = Some(Instant::now());
        Ok(())
    }

    fn execute_batch(
        &mut self,
        rows: &[TypedRow],
        policy: WritePolicy,
    ) -> Result<Vec<RowOutcome>, StoreError> {
        let mut outcomes = Vec::with_capacity(rows.len());
        for row in rows {
            if self.deadline_passed() {
                return Err(StoreError::Timeout(self.batch_timeout));
            }

            let sql = insert_sql(row.relation.def(), policy);
            let mut statement = self.connection.prepare_cached(&sql)?;
            match statement.execute(params_from_iter(row.values.iter())) {
                Ok(_) => outcomes.push(RowOutcome::Written),
                Err(err) => match row_rejection(&err) {
                    Some(kind) => outcomes.push(RowOutcome::Rejected {
                        kind,
                        message: err.to_string(),
                    }),
                    None => return Err(classify_batch_error(err)),
                },
            }
        }
        Ok(outcomes)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.batch_started = None;
        self.connection
            .execute_batch("COMMIT")
            .map_err(classify_batch_error)
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.batch_started = None;
        if self.connection.is_autocommit() {
            return Ok(());
        }
        self.connection.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn table_exists(&self, name: &str) -> Result<bool, StoreError> {
        let found = self
            .connection
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn create_schema(&mut self, tables: &[&TableDef]) -> Result<(), StoreError> {
        self.ensure_metadata_table()?;

        let tx = self.connection.transaction()?;
        for table in tables {
            tx.execute_batch(&create_table_sql(table))?;
            for fk in table.foreign_keys {
                tx.execute_batch(&format!(
                    "CREATE INDEX IF NOT EXISTS \"idx_{table}_{column}\" ON \"{table}\"(\"{column}\");",
                    table = table.name,
                    column = fk.column,
                ))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn clear(&mut self, relations: &[Relation]) -> Result<(), StoreError> {
        let tx = self.connection.transaction()?;
        for relation in relations {
            tx.execute(&format!("DELETE FROM \"{}\"", relation.table_name()), [])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn count(&self, relation: Relation) -> Result<i64, StoreError> {
        let count = self.connection.query_row(
            &format!("SELECT COUNT(*) FROM \"{}\"", relation.table_name()),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn set_metadata(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.ensure_metadata_table()?;
        self.connection.execute(
            "INSERT INTO metadata(key, value) VALUES(?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            [key, value],
        )?;
        self.connection.execute(
            "INSERT INTO metadata(key, value) VALUES('db_updated_at', ?1)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            [now_utc_string()],
        )?;
        Ok(())
    }

    fn metadata(&self, key: &str) -> Result<Option<String>, StoreError> {
        if !self.table_exists("metadata")? {
            return Ok(None);
        }
        let value = self
            .connection
            .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            FieldValue::Null => ToSqlOutput::Owned(Value::Null),
            FieldValue::Integer(value) => ToSqlOutput::Owned(Value::Integer(*value)),
            FieldValue::Real(value) => ToSqlOutput::Owned(Value::Real(*value)),
            FieldValue::Text(value) => ToSqlOutput::from(value.as_str()),
        })
    }
}

fn create_table_sql(table: &TableDef) -> String {
    let mut lines: Vec<String> = table
        .columns
        .iter()
        .map(|column| {
            let null = if column.nullable { "" } else { " NOT NULL" };
            format!("  \"{}\" {}{null}", column.name, column.ty.sql_type())
        })
        .collect();

    lines.push(format!("  PRIMARY KEY ({})", quoted_list(table.primary_key)));
    for fk in table.foreign_keys {
        lines.push(format!(
            "  FOREIGN KEY (\"{}\") REFERENCES \"{}\"(\"{}\")",
            fk.column,
            fk.references.table_name(),
            fk.references_column
        ));
    }
    for check in table.checks {
        lines.push(format!("  CHECK ({check})"));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" (\n{}\n);",
        table.name,
        lines.join(",\n")
    )
}

fn insert_sql(table: &TableDef, policy: WritePolicy) -> String {
    let names: Vec<&str> = table.columns.iter().map(|column| column.name).collect();
    let placeholders = (1..=names.len())
        .map(|index| format!("?{index}"))
        .collect::<Vec<String>>()
        .join(", ");
    let mut sql = format!(
        "INSERT INTO \"{}\" ({}) VALUES ({placeholders})",
        table.name,
        quoted_list(&names)
    );

    if policy == WritePolicy::Upsert {
        let updates: Vec<String> = names
            .iter()
            .filter(|name| !table.primary_key.contains(name))
            .map(|name| format!("\"{name}\"=excluded.\"{name}\""))
            .collect();
        sql.push_str(&format!(" ON CONFLICT({}) DO ", quoted_list(table.primary_key)));
        if updates.is_empty() {
            sql.push_str("NOTHING");
        } else {
            sql.push_str("UPDATE SET ");
            sql.push_str(&updates.join(", "));
        }
    }
    sql
}

fn quoted_list(names: &[&str]) -> String {
    names
        .iter()
        .map(|name| format!("\"{name}\""))
        .collect::<Vec<String>>()
        .join(", ")
}

fn row_rejection(err: &rusqlite::Error) -> Option<RejectionKind> {
    let rusqlite::Error::SqliteFailure(failure, _) = err else {
        return None;
    };
    match failure.code {
        ErrorCode::ConstraintViolation
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
        {
            Some(RejectionKind::ForeignKey)
        }
        ErrorCode::ConstraintViolation => Some(RejectionKind::Constraint),
        ErrorCode::TypeMismatch | ErrorCode::TooBig => Some(RejectionKind::Other),
        _ => None,
    }
}

fn classify_batch_error(err: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        if matches!(
            failure.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
        ) {
            return StoreError::Busy(err.to_string());
        }
    }
    StoreError::Sqlite(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &tempfile::TempDir) -> SqliteStore {
        let mut store = SqliteStore::open(&dir.path().join("movies.sqlite"), Duration::from_secs(5))
            .expect("open store");
        let tables: Vec<&TableDef> = Relation::ALL.iter().map(|relation| relation.def()).collect();
        store.create_schema(&tables).expect("create schema");
        store
    }

    fn link(movie_id: i64, tmdb_id: i64) -> TypedRow {
        TypedRow::new(
            Relation::Links,
            vec![
                FieldValue::Integer(movie_id),
                FieldValue::Text("tt0114709".to_string()),
                FieldValue::Integer(tmdb_id),
            ],
        )
    }

    fn movie(id: i64) -> TypedRow {
        let def = Relation::Movies.def();
        let mut values = vec![FieldValue::Null; def.columns.len()];
        values[0] = FieldValue::Integer(id);
        values[def.column_index("adult").expect("adult")] = FieldValue::Integer(0);
        values[def.column_index("video").expect("video")] = FieldValue::Integer(0);
        TypedRow::new(Relation::Movies, values)
    }

    #[test]
    fn create_schema_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = open_store(&dir);
        let tables: Vec<&TableDef> = Relation::ALL.iter().map(|relation| relation.def()).collect();
        store.create_schema(&tables).expect("second create");

        for relation in Relation::ALL {
            assert!(store.table_exists(relation.table_name()).expect("lookup"));
        }
        assert!(!store.table_exists("no_such_table").expect("lookup"));
    }

    #[test]
    fn foreign_key_violations_are_row_outcomes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = open_store(&dir);

        store.begin_transaction().expect("begin");
        let outcomes = store
            .execute_batch(&[movie(1), link(1, 862), link(2, 8844)], WritePolicy::Insert)
            .expect("execute");
        store.rollback().expect("rollback");

        assert_eq!(outcomes[0], RowOutcome::Written);
        assert_eq!(outcomes[1], RowOutcome::Written);
        assert!(matches!(
            outcomes[2],
            RowOutcome::Rejected {
                kind: RejectionKind::ForeignKey,
                ..
            }
        ));
        assert_eq!(store.count(Relation::Movies).expect("count"), 0);
    }

    #[test]
    fn upsert_overwrites_instead_of_conflicting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = open_store(&dir);

        for tmdb_id in [862, 863] {
            store.begin_transaction().expect("begin");
            let outcomes = store
                .execute_batch(&[movie(1), link(1, tmdb_id)], WritePolicy::Upsert)
                .expect("execute");
            assert!(outcomes.iter().all(|outcome| *outcome == RowOutcome::Written));
            store.commit().expect("commit");
        }

        assert_eq!(store.count(Relation::Links).expect("count"), 1);
        let tmdb: i64 = store
            .connection
            .query_row("SELECT tmdb_id FROM links WHERE movie_id = 1", [], |row| {
                row.get(0)
            })
            .expect("query");
        assert_eq!(tmdb, 863);
    }

    #[test]
    fn plain_insert_rejects_repeated_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = open_store(&dir);

        store.begin_transaction().expect("begin");
        let outcomes = store
            .execute_batch(&[movie(1), movie(1)], WritePolicy::Insert)
            .expect("execute");
        store.commit().expect("commit");

        assert!(matches!(
            outcomes[1],
            RowOutcome::Rejected {
                kind: RejectionKind::Constraint,
                ..
            }
        ));
    }

    #[test]
    fn clear_and_metadata_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = open_store(&dir);

        store.begin_transaction().expect("begin");
        store
            .execute_batch(&[movie(1), link(1, 862)], WritePolicy::Insert)
            .expect("execute");
        store.commit().expect("commit");

        store
            .clear(&[Relation::Links, Relation::Movies])
            .expect("clear");
        assert_eq!(store.count(Relation::Movies).expect("count"), 0);

        store.set_metadata("last_run_id", "run-1").expect("set");
        assert_eq!(
            store.metadata("last_run_id").expect("get").as_deref(),
            Some("run-1")
        );
        assert_eq!(store.metadata("missing").expect("get"), None);
    }

    #[test]
    fn generated_upsert_sql_updates_non_key_columns() {
        let sql = insert_sql(Relation::Keywords.def(), WritePolicy::Upsert);
        assert!(sql.starts_with("INSERT INTO \"keywords\""));
        assert!(sql.ends_with(
            "ON CONFLICT(\"movie_id\", \"keyword_id\") DO UPDATE SET \"name\"=excluded.\"name\""
        ));
    }
}
