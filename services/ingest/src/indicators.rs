//! Indicator registry: one configuration record per indicator, consumed by
//! the generic pipeline driver. Adding an indicator means adding an entry
//! here, not a new binary.

use crate::acquire::{SourceFormat, SourceSpec};
use crate::error::PipelineError;
use crate::table::{normalize_code, parse_number, RawTable};
use crate::transform::{CleanRow, Formula, GeoKey};

pub struct IndicatorSpec {
    pub id: &'static str,
    pub label: &'static str,
    pub source: SourceSpec,
    pub data_year: &'static str,
    pub unit: &'static str,
    /// Decimal places kept on the raw value; chosen per unit.
    pub precision: i32,
    pub source_label: &'static str,
    pub clean: fn(&RawTable) -> Result<Vec<CleanRow>, PipelineError>,
    pub formula: Formula,
}

pub fn registry() -> Vec<IndicatorSpec> {
    vec![
        IndicatorSpec {
            id: "i058",
            label: "Linéaire d'aménagements cyclables (km)",
            source: SourceSpec {
                url: "https://www.data.gouv.fr/api/1/datasets/r/9e3caf02-0828-4b8a-9d3b-7b8d4f5c2f3e",
                filename: "amenagements_cyclables.geojson",
                format: SourceFormat::GeoJson {
                    code_property: "code_com_d",
                },
            },
            data_year: "2025",
            unit: "km",
            precision: 2,
            source_label: "transport.data.gouv.fr",
            clean: clean_cycle_network,
            formula: Formula::Sum,
        },
        IndicatorSpec {
            id: "i066",
            label: "Densité de pharmacies pour 10 000 habitants",
            source: SourceSpec {
                url: "https://www.data.gouv.fr/api/1/datasets/r/3dadd8a2-c604-4a57-bb24-bd02c1ab6b66",
                filename: "finess_etablissements.csv",
                format: SourceFormat::Csv { delimiter: b';' },
            },
            data_year: "2025",
            unit: "nb pour 10 000 habitants",
            precision: 2,
            source_label: "data.gouv.fr (FINESS)",
            clean: clean_pharmacies,
            formula: Formula::PerPopulation { per: 10_000.0 },
        },
        IndicatorSpec {
            id: "i113",
            label: "Part de la surface agricole utile sur la superficie du territoire",
            source: SourceSpec {
                url: "https://www.data.gouv.fr/api/1/datasets/r/022cb00f-38f2-4fe7-8895-e3467d3d9255",
                filename: "sau_2025.csv",
                format: SourceFormat::Csv { delimiter: b',' },
            },
            data_year: "2025",
            unit: "%",
            precision: 1,
            source_label: "data.gouv.fr",
            clean: clean_agricultural_area,
            formula: Formula::ShareOfAreaPct,
        },
        IndicatorSpec {
            id: "i130",
            label: "Taux de couverture accueil jeune enfant",
            source: SourceSpec {
                url: "https://data.caf.fr/api/explore/v2.1/catalog/datasets/txcouv_pe_epci/records?refine=annee%3A%222023%22",
                filename: "txcouv_pe_epci_2023.json",
                format: SourceFormat::JsonApi {
                    page_size: 100,
                    results_key: "results",
                    max_pages: 40,
                },
            },
            data_year: "2023",
            unit: "nb pour 100 enfants de moins de 3 ans",
            precision: 1,
            source_label: "data.caf.fr",
            clean: clean_childcare_coverage,
            formula: Formula::Mean,
        },
        IndicatorSpec {
            id: "i150",
            label: "Trajets de covoiturage pour 10 000 habitants",
            source: SourceSpec {
                url: "https://www.data.gouv.fr/api/1/datasets/r/6a8c9d71-8e3f-4a2b-b6d4-2f5e9c0a7d41",
                filename: "trajets_covoiturage_2024.parquet",
                format: SourceFormat::Parquet,
            },
            data_year: "2024",
            unit: "nb pour 10 000 habitants",
            precision: 3,
            source_label: "transport.data.gouv.fr",
            clean: clean_carpool_trips,
            formula: Formula::PerPopulation { per: 10_000.0 },
        },
        IndicatorSpec {
            id: "i158",
            label: "Arrêtés de catastrophe naturelle par km²",
            source: SourceSpec {
                url: "https://www.data.gouv.fr/api/1/datasets/r/d6fb9e18-b66b-499c-8284-46a3595579cc",
                filename: "gaspar.zip",
                format: SourceFormat::CsvZip {
                    member: "catnat_gaspar.csv",
                    delimiter: b';',
                },
            },
            data_year: "2025",
            unit: "nb_cat_nat/km2",
            precision: 3,
            source_label: "data.gouv.fr (GASPAR)",
            clean: clean_natural_disasters,
            formula: Formula::PerAreaKm2,
        },
    ]
}

pub fn find(id: &str) -> Option<IndicatorSpec> {
    registry().into_iter().find(|spec| spec.id == id)
}

// ---------------------------------------------------------------------------
// Clean functions. Each resolves its columns through an explicit alias list
// once, then coerces and filters row by row.
// ---------------------------------------------------------------------------

/// FINESS establishment export: keep pharmacy rows, key them by the postal
/// code embedded in the address field ("01400 AMBERIEU ..." -> "01400").
fn clean_pharmacies(table: &RawTable) -> Result<Vec<CleanRow>, PipelineError> {
    let category = table.require_column(
        "i066",
        "category",
        &["libcategetab", "libelle_categorie", "categorie"],
    )?;
    let postal = table.require_column(
        "i066",
        "code_postal",
        &["code_postal", "codepostal", "adressecodepostal", "cp"],
    )?;

    let mut rows = Vec::new();
    for row in &table.rows {
        if !table.cell(row, category).starts_with("Phar") {
            continue;
        }
        let raw = table.cell(row, postal);
        let first_token = raw.split_whitespace().next().unwrap_or("");
        let Some(code) = normalize_code(first_token) else {
            continue;
        };
        rows.push(CleanRow {
            key: GeoKey::Postal(code),
            value: 1.0,
        });
    }
    Ok(rows)
}

/// Agricultural area survey: 2020 wave only, value in hectares converted to
/// km² so the share formula divides like for like.
fn clean_agricultural_area(table: &RawTable) -> Result<Vec<CleanRow>, PipelineError> {
    let date = table.require_column("i113", "date_mesure", &["date_mesure", "date", "annee"])?;
    let epci = table.require_column("i113", "geocode_epci", &["geocode_epci", "siren_epci", "epci"])?;
    let value = table.require_column("i113", "value", &["valeur", "value", "sau"])?;

    let mut rows = Vec::new();
    for row in &table.rows {
        if !table.cell(row, date).starts_with("2020") {
            continue;
        }
        let Some(hectares) = parse_number(table.cell(row, value)) else {
            continue;
        };
        rows.push(CleanRow {
            key: GeoKey::Epci(table.cell(row, epci).to_string()),
            value: hectares / 100.0,
        });
    }
    Ok(rows)
}

/// CAF coverage records are already EPCI-keyed; the value is the coverage
/// rate itself.
fn clean_childcare_coverage(table: &RawTable) -> Result<Vec<CleanRow>, PipelineError> {
    let epci = table.require_column("i130", "numepci", &["numepci", "epci", "siren"])?;
    let value = table.require_column("i130", "value", &["txcouv_epci", "txcouv", "taux_couverture"])?;

    let mut rows = Vec::new();
    for row in &table.rows {
        let Some(rate) = parse_number(table.cell(row, value)) else {
            continue;
        };
        rows.push(CleanRow {
            key: GeoKey::Epci(table.cell(row, epci).to_string()),
            value: rate,
        });
    }
    Ok(rows)
}

/// Carpool registry export: per-territory trip counts keyed by EPCI siren.
fn clean_carpool_trips(table: &RawTable) -> Result<Vec<CleanRow>, PipelineError> {
    let epci = table.require_column("i150", "territoryid", &["territoryid", "territory_id", "siren"])?;
    let value = table.require_column("i150", "journeys", &["journeys", "valeur", "nb_trajets"])?;

    let mut rows = Vec::new();
    for row in &table.rows {
        let Some(trips) = parse_number(table.cell(row, value)) else {
            continue;
        };
        rows.push(CleanRow {
            key: GeoKey::Epci(table.cell(row, epci).to_string()),
            value: trips,
        });
    }
    Ok(rows)
}

/// GASPAR natural-disaster orders: one order per row, counted per commune.
fn clean_natural_disasters(table: &RawTable) -> Result<Vec<CleanRow>, PipelineError> {
    let insee = table.require_column("i158", "cod_commune", &["cod_commune", "code_insee", "com"])?;

    let mut rows = Vec::new();
    for row in &table.rows {
        let Some(code) = normalize_code(table.cell(row, insee)) else {
            continue;
        };
        rows.push(CleanRow {
            key: GeoKey::Insee(code),
            value: 1.0,
        });
    }
    Ok(rows)
}

/// Cycle-network layer: the acquirer already measured each feature; sum the
/// per-feature lengths by commune.
fn clean_cycle_network(table: &RawTable) -> Result<Vec<CleanRow>, PipelineError> {
    let insee = table.require_column("i058", "code_com_d", &["code_com_d", "code_com", "insee"])?;
    let length = table.require_column("i058", "length_km", &["length_km"])?;

    let mut rows = Vec::new();
    for row in &table.rows {
        let Some(code) = normalize_code(table.cell(row, insee)) else {
            continue;
        };
        let Some(km) = parse_number(table.cell(row, length)) else {
            continue;
        };
        rows.push(CleanRow {
            key: GeoKey::Insee(code),
            value: km,
        });
    }
    Ok(rows)
}
