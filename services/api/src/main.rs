//! API Service - read-only reporting surface over the fact tables
//!
//! Endpoints:
//! - GET /health - Health check
//! - GET /territories?q= - Search the EPCI catalog by siren prefix or label
//! - GET /territories/{siren}/report?year= - Need scores + indicator values
//!
//! The pipeline owns the fact tables; this service only reads them.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
struct AppState {
    pool: PgPool,
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

#[derive(Serialize, sqlx::FromRow)]
struct TerritoryResponse {
    siren: String,
    label: String,
    department_code: Option<String>,
    population_total: Option<f64>,
}

#[derive(Serialize, sqlx::FromRow)]
struct NeedScoreResponse {
    need_id: String,
    need_label: String,
    need_score: Option<f64>,
    indicators_count: i32,
}

#[derive(Serialize, sqlx::FromRow)]
struct IndicatorValueResponse {
    indicator_id: String,
    value: Option<f64>,
    unit: Option<String>,
    source: Option<String>,
}

#[derive(Serialize)]
struct ReportResponse {
    territory: TerritoryResponse,
    data_year: String,
    need_scores: Vec<NeedScoreResponse>,
    indicator_values: Vec<IndicatorValueResponse>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn internal_error(e: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

fn not_found(what: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("{} not found", what),
        }),
    )
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Deserialize)]
struct SearchParams {
    q: Option<String>,
}

async fn search_territories(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<TerritoryResponse>>, ApiError> {
    let q = params.q.unwrap_or_default();
    let rows: Vec<TerritoryResponse> = sqlx::query_as(
        r#"
        SELECT siren, label, department_code, population_total
        FROM epcis
        WHERE siren LIKE $1 || '%' OR label ILIKE '%' || $1 || '%'
        ORDER BY label
        LIMIT 20
        "#,
    )
    .bind(&q)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    Ok(Json(rows))
}

#[derive(Deserialize)]
struct ReportParams {
    year: Option<String>,
}

async fn territory_report(
    State(state): State<AppState>,
    Path(siren): Path<String>,
    Query(params): Query<ReportParams>,
) -> Result<Json<ReportResponse>, ApiError> {
    let territory: TerritoryResponse = sqlx::query_as(
        "SELECT siren, label, department_code, population_total FROM epcis WHERE siren = $1",
    )
    .bind(&siren)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?
    .ok_or_else(|| not_found("territory"))?;

    // Default to the latest year that has need scores for this territory.
    let data_year = match params.year {
        Some(year) => year,
        None => {
            let latest: (Option<String>,) = sqlx::query_as(
                "SELECT MAX(data_year) FROM need_scores WHERE epci_siren = $1",
            )
            .bind(&siren)
            .fetch_one(&state.pool)
            .await
            .map_err(internal_error)?;
            latest.0.ok_or_else(|| not_found("need scores"))?
        }
    };

    let need_scores: Vec<NeedScoreResponse> = sqlx::query_as(
        r#"
        SELECT need_id, need_label, need_score, indicators_count
        FROM need_scores
        WHERE epci_siren = $1 AND data_year = $2
        ORDER BY need_id
        "#,
    )
    .bind(&siren)
    .bind(&data_year)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let indicator_values: Vec<IndicatorValueResponse> = sqlx::query_as(
        r#"
        SELECT indicator_id, value, unit, source
        FROM indicator_values
        WHERE epci_siren = $1 AND data_year = $2
        ORDER BY indicator_id
        "#,
    )
    .bind(&siren)
    .bind(&data_year)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    Ok(Json(ReportResponse {
        territory,
        data_year,
        need_scores,
        indicator_values,
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use anyhow::Context;

    dotenvy::dotenv().ok();
    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await?;

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/territories", get(search_territories))
        .route("/territories/:siren/report", get(territory_report))
        .layer(cors)
        .with_state(AppState { pool });

    println!("=== Resilience Reporting API ===");
    println!("Listening on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
