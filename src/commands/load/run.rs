use std::time::Duration;

use anyhow::{Result, bail};
use chrono::Utc;
use tracing::info;

use super::orchestrator::{LoadConfig, execute};
use super::pipeline::CancellationToken;
use crate::cli::LoadArgs;
use crate::model::{RunReport, RunStatus};
use crate::schema::DB_SCHEMA_VERSION;
use crate::store::SqliteTarget;
use crate::util::{ensure_directory, now_utc_string, utc_compact_string, write_json_pretty};

pub fn run(args: LoadArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("load-{}", utc_compact_string(started_ts));

    let cache_root = args.cache_root.clone();
    let manifest_dir = cache_root.join("manifests");
    ensure_directory(&manifest_dir)?;

    let report_path = args.report_path.clone().unwrap_or_else(|| {
        manifest_dir.join(format!("load_run_{}.json", utc_compact_string(started_ts)))
    });
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| cache_root.join("movies.sqlite"));
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_directory(parent)?;
        }
    }

    let config = LoadConfig::from_args(&args);
    info!(
        run_id = %run_id,
        db_path = %db_path.display(),
        reload_mode = config.reload_mode.as_str(),
        batch_size = config.batch_size,
        workers = config.workers,
        datasets = config.sources.len(),
        "starting load"
    );

    let target = SqliteTarget::new(&db_path, Duration::from_millis(args.batch_timeout_ms));
    let cancel = CancellationToken::new();
    let outcome = execute(&target, &config, &cancel, &run_id);

    let report = RunReport {
        manifest_version: 1,
        run_id: run_id.clone(),
        db_schema_version: DB_SCHEMA_VERSION.to_string(),
        started_at,
        finished_at: now_utc_string(),
        reload_mode: config.reload_mode.as_str().to_string(),
        batch_size: config.batch_size,
        workers: config.workers,
        db_path: target.path().display().to_string(),
        status: outcome.status,
        datasets: outcome.datasets,
    };
    write_json_pretty(&report_path, &report)?;

    for (dataset, stats) in &report.datasets {
        info!(
            dataset = %dataset,
            loaded = stats.loaded,
            rejected_decode = stats.rejected_decode,
            rejected_load = stats.rejected_load,
            duplicate_skipped = stats.duplicate_skipped,
            orphaned = stats.orphaned,
            duration_ms = stats.duration_ms,
            "dataset summary"
        );
    }
    info!(
        run_id = %run_id,
        status = %report.status,
        report = %report_path.display(),
        "load finished"
    );

    if let RunStatus::Failed { reason } = &report.status {
        bail!("load run {run_id} failed: {reason}");
    }
    Ok(())
}
