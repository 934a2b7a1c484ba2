//! Scores Service - composite need-score aggregation
//!
//! Pure batch job over one data year: joins indicator scores to the
//! indicator->need mapping, averages per (EPCI, need) and upserts one
//! composite row per group. Fully derived data: re-running with unchanged
//! inputs produces identical rows, never accumulation.
//!
//! Scores for indicators with no need mapping are silently excluded from
//! every need's aggregate (inner join, by design).
//!
//! Usage:
//!   cargo run --bin scores -- --data-year 2025
//!   cargo run --bin scores -- --data-year 2025 --dry-run

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "scores", about = "Recomputes composite need scores from indicator scores")]
struct Args {
    /// Data year to recompute
    #[arg(long, default_value = "0")]
    data_year: String,

    /// Print the aggregated rows; perform no writes
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct NeedScoreRow {
    epci_siren: String,
    need_id: String,
    need_label: String,
    data_year: String,
    need_score: Option<f64>,
    indicators_count: i64,
}

async fn aggregate_need_scores(pool: &PgPool, data_year: &str) -> Result<Vec<NeedScoreRow>> {
    let rows: Vec<NeedScoreRow> = sqlx::query_as(
        r#"
        SELECT s.epci_siren,
               l.need_id,
               COALESCE(n.label, l.need_id) AS need_label,
               s.data_year,
               AVG(s.score) AS need_score,
               COUNT(DISTINCT s.indicator_id) AS indicators_count
        FROM indicator_scores s
        JOIN indicator_need_links l ON l.indicator_id = s.indicator_id
        LEFT JOIN needs n ON n.need_id = l.need_id
        WHERE s.data_year = $1
        GROUP BY s.epci_siren, l.need_id, n.label, s.data_year
        ORDER BY s.epci_siren, l.need_id
        "#,
    )
    .bind(data_year)
    .fetch_all(pool)
    .await
    .context("Failed to aggregate indicator scores")?;

    Ok(rows)
}

/// Replace-by-key upsert, one transaction for the whole batch.
async fn persist_need_scores(pool: &PgPool, rows: &[NeedScoreRow]) -> Result<u64> {
    let mut tx = pool.begin().await?;

    for row in rows {
        sqlx::query(
            r#"
            INSERT INTO need_scores (epci_siren, need_id, data_year, need_label, need_score, indicators_count)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (epci_siren, need_id, data_year)
            DO UPDATE SET need_label = EXCLUDED.need_label,
                          need_score = EXCLUDED.need_score,
                          indicators_count = EXCLUDED.indicators_count
            "#,
        )
        .bind(&row.epci_siren)
        .bind(&row.need_id)
        .bind(&row.data_year)
        .bind(&row.need_label)
        .bind(row.need_score)
        .bind(row.indicators_count as i32)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(rows.len() as u64)
}

async fn create_job_run(pool: &PgPool, data_year: &str) -> Result<Uuid> {
    let job_run_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO job_runs (job_run_id, component, indicator_id, status, detail)
        VALUES ($1, 'scores', NULL, 'running', $2)
        "#,
    )
    .bind(job_run_id)
    .bind(serde_json::json!({ "data_year": data_year }))
    .execute(pool)
    .await?;
    Ok(job_run_id)
}

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

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;

    println!("=== Need Score Aggregation ===");
    println!("Data year: {}", args.data_year);

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    let rows = aggregate_need_scores(&pool, &args.data_year).await?;
    println!("Aggregated {} (EPCI, need) groups", rows.len());

    if args.dry_run {
        for row in rows.iter().take(10) {
            println!(
                "  {} | {} | score={:?} | indicators={}",
                row.epci_siren, row.need_id, row.need_score, row.indicators_count
            );
        }
        if rows.len() > 10 {
            println!("  ... and {} more", rows.len() - 10);
        }
        println!("\nDry run - nothing written");
        return Ok(());
    }

    if rows.is_empty() {
        eprintln!("Warning: no indicator scores found for year {}", args.data_year);
    }

    let job_run_id = create_job_run(&pool, &args.data_year).await?;
    let result = persist_need_scores(&pool, &rows).await;

    match &result {
        Ok(written) => finish_job_run(&pool, job_run_id, "ok", None, *written).await?,
        Err(e) => finish_job_run(&pool, job_run_id, "failed", Some(&e.to_string()), 0).await?,
    }

    let written = result?;
    println!("\n=== Aggregation Complete ===");
    println!("Need scores written: {}", written);

    Ok(())
}
