//! Value Upsert Sink - idempotent, transactional persistence of computed
//! indicator values. Re-running a job overwrites in place (last write wins
//! per (epci, indicator, year) key); null values are never written.

use sqlx::PgPool;

use crate::error::PipelineError;
use crate::reference::References;
use crate::transform::ComputedValue;

/// Rows eligible for persistence: the null/NaN ones are dropped here, not in
/// the transform, so dry runs still show the "computed but invalid" rows.
pub fn writable_rows(rows: &[ComputedValue]) -> Vec<&ComputedValue> {
    rows.iter()
        .filter(|r| r.value.map(|v| v.is_finite()).unwrap_or(false))
        .collect()
}

/// Upsert a batch of computed values in one transaction. Either the whole
/// batch commits or none of it does. Returns the number of rows written.
pub async fn persist(pool: &PgPool, rows: &[ComputedValue]) -> Result<u64, PipelineError> {
    let writable = writable_rows(rows);
    let mut tx = pool.begin().await?;

    for row in &writable {
        sqlx::query(
            r#"
            INSERT INTO indicator_values (epci_siren, indicator_id, data_year, value, unit, source, meta)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (epci_siren, indicator_id, data_year)
            DO UPDATE SET value = EXCLUDED.value,
                          unit = EXCLUDED.unit,
                          source = EXCLUDED.source,
                          meta = EXCLUDED.meta
            "#,
        )
        .bind(&row.epci_siren)
        .bind(&row.indicator_id)
        .bind(&row.data_year)
        .bind(row.value)
        .bind(&row.unit)
        .bind(&row.source)
        .bind(&row.meta)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(writable.len() as u64)
}

/// Refresh the commune and EPCI catalog tables from the parsed reference
/// data, in one transaction. The reporting API searches these tables; the
/// pipeline itself only ever reads the in-memory copy.
pub async fn sync_references(pool: &PgPool, refs: &References) -> Result<u64, PipelineError> {
    let mut tx = pool.begin().await?;

    for commune in &refs.communes {
        sqlx::query(
            r#"
            INSERT INTO communes (code_insee, code_postal, epci_code, name, population, superficie_km2)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (code_insee)
            DO UPDATE SET code_postal = EXCLUDED.code_postal,
                          epci_code = EXCLUDED.epci_code,
                          name = EXCLUDED.name,
                          population = EXCLUDED.population,
                          superficie_km2 = EXCLUDED.superficie_km2
            "#,
        )
        .bind(&commune.code_insee)
        .bind(&commune.code_postal)
        .bind(&commune.epci_code)
        .bind(&commune.name)
        .bind(commune.population)
        .bind(commune.superficie_km2)
        .execute(&mut *tx)
        .await?;
    }

    for epci in &refs.epcis {
        sqlx::query(
            r#"
            INSERT INTO epcis (siren, department_code, label, population_total, area_km2)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (siren)
            DO UPDATE SET department_code = EXCLUDED.department_code,
                          label = EXCLUDED.label,
                          population_total = EXCLUDED.population_total,
                          area_km2 = EXCLUDED.area_km2
            "#,
        )
        .bind(&epci.siren)
        .bind(&epci.department_code)
        .bind(&epci.label)
        .bind(epci.population_total)
        .bind(refs.area_km2_of_epci(&epci.siren))
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok((refs.communes.len() + refs.epcis.len()) as u64)
}

/// Make sure the indicator catalog knows this id; create a stub entry if not,
/// so fact rows never dangle.
pub async fn ensure_indicator(pool: &PgPool, id: &str, label: &str) -> Result<(), PipelineError> {
    let exists: Option<(String,)> =
        sqlx::query_as("SELECT indicator_id FROM indicators WHERE indicator_id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;

    if exists.is_none() {
        eprintln!("  Warning: indicator {} unknown in catalog, creating a stub entry", id);
        sqlx::query("INSERT INTO indicators (indicator_id, label) VALUES ($1, $2)")
            .bind(id)
            .bind(label)
            .execute(pool)
            .await?;
    }
    Ok(())
}
