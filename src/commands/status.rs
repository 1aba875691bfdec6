use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::schema::Relation;
use crate::store::{SqliteStore, Store};

pub fn run(args: StatusArgs) -> Result<()> {
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.cache_root.join("movies.sqlite"));

    info!(cache_root = %args.cache_root.display(), "status requested");

    if !db_path.exists() {
        warn!(path = %db_path.display(), "database file missing");
        return Ok(());
    }

    let store = SqliteStore::open(&db_path, Duration::from_secs(5))
        .with_context(|| format!("failed to open {}", db_path.display()))?;

    for relation in Relation::ALL {
        if !store.table_exists(relation.table_name())? {
            warn!(relation = %relation, "relation missing");
            continue;
        }
        let rows = store
            .count(relation)
            .with_context(|| format!("failed to count {relation}"))?;
        info!(relation = %relation, rows, "relation status");
    }

    info!(
        path = %db_path.display(),
        db_schema_version = %store.metadata("db_schema_version")?.unwrap_or_default(),
        last_run_id = %store.metadata("last_run_id")?.unwrap_or_default(),
        last_run_status = %store.metadata("last_run_status")?.unwrap_or_default(),
        db_updated_at = %store.metadata("db_updated_at")?.unwrap_or_default(),
        "database status"
    );

    Ok(())
}
