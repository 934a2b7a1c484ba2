//! Ingest Service - per-indicator ETL driver
//!
//! Responsibilities:
//! - Fetch one indicator's public open-data source (cache-by-filename)
//! - Load the commune/EPCI reference tables
//! - Clean, geo-join and aggregate the raw rows into one value per EPCI
//! - Upsert the values into the store, atomically per batch
//! - Track job runs for auditing
//!
//! Usage:
//!   # List registered indicators:
//!   cargo run --bin ingest -- --list
//!
//!   # Run one indicator job:
//!   cargo run --bin ingest -- --indicator i158
//!
//!   # Compute and print without touching the store:
//!   cargo run --bin ingest -- --indicator i158 --dry-run
//!
//!   # Refresh the commune/EPCI catalog tables:
//!   cargo run --bin ingest -- --sync-references

mod acquire;
mod error;
mod indicators;
mod reference;
mod sink;
mod table;
mod transform;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use indicators::IndicatorSpec;
use reference::References;
use transform::ComputedValue;

#[derive(Parser, Debug)]
#[command(name = "ingest", about = "Computes one resilience indicator per EPCI and upserts it")]
struct Args {
    /// Indicator id to run (e.g. i158)
    #[arg(long)]
    indicator: Option<String>,

    /// Compute and print the first rows; perform no writes
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// List registered indicators and exit
    #[arg(long, default_value = "false")]
    list: bool,

    /// Refresh the commune/EPCI catalog tables from the reference sources
    #[arg(long, default_value = "false")]
    sync_references: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Absent is fine for dry runs, which never touch the store.
    pub db_url: Option<String>,
    pub cache_dir: PathBuf,
    pub rate_limit_ms: u64,
    pub http_timeout_secs: u64,
}

impl Config {
    fn from_env() -> Self {
        Self {
            db_url: std::env::var("DB_URL").ok(),
            cache_dir: PathBuf::from(
                std::env::var("CACHE_DIR").unwrap_or_else(|_| "./data/cache".to_string()),
            ),
            rate_limit_ms: std::env::var("RATE_LIMIT_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .unwrap_or(1000),
            http_timeout_secs: std::env::var("HTTP_TIMEOUT_SECS")
                .unwrap_or_else(|_| "120".to_string())
                .parse()
                .unwrap_or(120),
        }
    }
}

/// Create a new job run record
async fn create_job_run(pool: &PgPool, indicator_id: Option<&str>) -> Result<Uuid> {
    let job_run_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO job_runs (job_run_id, component, indicator_id, status, detail)
        VALUES ($1, 'ingest', $2, 'running', '{}')
        "#,
    )
    .bind(job_run_id)
    .bind(indicator_id)
    .execute(pool)
    .await?;

    Ok(job_run_id)
}

/// Update job run status
async fn finish_job_run(
    pool: &PgPool,
    job_run_id: Uuid,
    status: &str,
    error: Option<&str>,
    rows_written: u64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE job_runs
        SET finished_at = now(), status = $2, error = $3, detail = detail || $4
        WHERE job_run_id = $1
        "#,
    )
    .bind(job_run_id)
    .bind(status)
    .bind(error)
    .bind(serde_json::json!({ "rows_written": rows_written }))
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch, clean, join and aggregate: everything up to (but excluding) the
/// store. This is the whole job in dry-run mode.
async fn compute_indicator(
    client: &reqwest::Client,
    config: &Config,
    spec: &IndicatorSpec,
) -> Result<Vec<ComputedValue>> {
    println!("\n[{}] {}", spec.id, spec.label);
    println!("  Source: {} ({})", spec.source.url, spec.source.filename);

    let refs = References::load(client, config).await?;

    let raw = acquire::fetch(client, config, &spec.source).await?;
    println!("  Raw table: {} rows x {} columns", raw.rows.len(), raw.headers.len());

    let cleaned = (spec.clean)(&raw)?;
    println!("  Cleaned rows: {}", cleaned.len());

    let values = transform::compute(spec, cleaned, &refs)?;
    println!("  Computed values: {} EPCIs", values.len());

    Ok(values)
}

fn print_sample(values: &[ComputedValue]) {
    let sample: Vec<_> = values.iter().take(10).collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&sample).unwrap_or_else(|_| "[]".to_string())
    );
    if values.len() > 10 {
        println!("... ({} of {} rows shown)", sample.len(), values.len());
    }
}

fn print_registry() {
    println!("\nRegistered indicators:");
    println!("{:-<60}", "");
    for spec in indicators::registry() {
        println!("  {} - {} [{}]", spec.id, spec.label, spec.unit);
    }
    println!("{:-<60}", "");
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    println!("=== Resilience Indicator Ingest ===");

    if args.list {
        print_registry();
        return Ok(());
    }

    let config = Config::from_env();

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_secs))
        .user_agent("resilience-ingest/0.1 (batch open-data pipeline)")
        .build()?;

    if args.sync_references {
        let refs = References::load(&client, &config).await?;
        let db_url = config.db_url.as_deref().context("DB_URL env var missing")?;
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
            .context("Failed to connect to database")?;

        let job_run_id = create_job_run(&pool, None).await?;
        let result = sink::sync_references(&pool, &refs).await;
        match &result {
            Ok(written) => finish_job_run(&pool, job_run_id, "ok", None, *written).await?,
            Err(e) => finish_job_run(&pool, job_run_id, "failed", Some(&e.to_string()), 0).await?,
        }
        let written = result?;
        println!("\n=== Reference Sync Complete ===");
        println!("Catalog rows written: {}", written);
        return Ok(());
    }

    let indicator_id = args.indicator.as_deref().context(
        "Must specify --indicator <id> (or --list to see the registered indicators)",
    )?;
    let spec = indicators::find(indicator_id).with_context(|| {
        format!("Unknown indicator '{}'; use --list to see the registry", indicator_id)
    })?;

    if args.dry_run {
        let values = compute_indicator(&client, &config, &spec).await?;
        print_sample(&values);
        println!("\nDry run - nothing written");
        return Ok(());
    }

    let db_url = config.db_url.as_deref().context("DB_URL env var missing")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .context("Failed to connect to database")?;

    sink::ensure_indicator(&pool, spec.id, spec.label).await?;
    let job_run_id = create_job_run(&pool, Some(spec.id)).await?;

    let result = async {
        let values = compute_indicator(&client, &config, &spec).await?;
        if values.is_empty() {
            eprintln!("  Warning: zero rows computed for {}", spec.id);
        }
        let written = sink::persist(&pool, &values).await?;
        Ok::<u64, anyhow::Error>(written)
    }
    .await;

    match &result {
        Ok(written) => finish_job_run(&pool, job_run_id, "ok", None, *written).await?,
        Err(e) => finish_job_run(&pool, job_run_id, "failed", Some(&e.to_string()), 0).await?,
    }

    let written = result?;
    println!("\n=== Ingest Complete ===");
    println!("Indicator: {}", spec.id);
    println!("Rows written: {}", written);

    Ok(())
}
