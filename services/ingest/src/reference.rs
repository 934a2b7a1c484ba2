//! Reference Resolver - canonical commune and EPCI lookup tables.
//!
//! Both tables are loaded once per run into a `References` value that gets
//! passed by reference into the transforms. Failure to load either table is
//! fatal for the run: indicators never compute against partial geography.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::acquire::{ensure_cached, load_csv};
use crate::error::PipelineError;
use crate::table::{normalize_code, parse_number, RawTable, NO_EPCI};
use crate::Config;

const COMMUNES_URL: &str =
    "https://www.data.gouv.fr/api/1/datasets/r/f5df602b-3800-44d7-b2df-fa40a0350325";
const COMMUNES_FILENAME: &str = "communes_france_2025.csv";

const EPCI_URL: &str =
    "https://www.data.gouv.fr/api/1/datasets/r/6e05c448-62cc-4470-aa0f-4f31adea0bc4";
const EPCI_FILENAME: &str = "data_epci.csv";

#[derive(Debug, Clone)]
pub struct Commune {
    pub code_insee: String,
    pub code_postal: Option<String>,
    pub epci_code: String,
    pub population: Option<f64>,
    pub superficie_km2: Option<f64>,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct EpciEntry {
    pub siren: String,
    pub department_code: Option<String>,
    pub label: String,
    pub population_total: Option<f64>,
}

#[derive(Debug)]
pub struct References {
    pub communes: Vec<Commune>,
    pub epcis: Vec<EpciEntry>,
    epci_by_insee: HashMap<String, String>,
    epci_by_postal: HashMap<String, String>,
    population_by_epci: HashMap<String, f64>,
    area_km2_by_epci: HashMap<String, f64>,
    known_sirens: HashSet<String>,
}

impl References {
    /// Fetch (if absent from cache), parse and index both reference tables.
    pub async fn load(
        client: &reqwest::Client,
        config: &Config,
    ) -> Result<References, PipelineError> {
        println!("Loading reference tables...");

        let communes_path = ensure_cached(client, config, COMMUNES_URL, COMMUNES_FILENAME)
            .await
            .map_err(|e| PipelineError::ReferenceUnavailable(e.to_string()))?;
        let communes_table = load_csv(&communes_path, b',')
            .map_err(|e| PipelineError::ReferenceUnavailable(e.to_string()))?;
        let communes = parse_communes(&communes_table)?;

        let epci_path = ensure_cached(client, config, EPCI_URL, EPCI_FILENAME)
            .await
            .map_err(|e| PipelineError::ReferenceUnavailable(e.to_string()))?;
        // The EPCI export ships in Latin-1; the query layer wants UTF-8.
        let utf8_path = reencode_to_utf8(&epci_path)
            .map_err(|e| PipelineError::ReferenceUnavailable(e.to_string()))?;
        let epci_table = load_csv(&utf8_path, b';')
            .map_err(|e| PipelineError::ReferenceUnavailable(e.to_string()))?;
        let epcis = parse_epcis(&epci_table)?;

        println!(
            "  References ready: {} communes, {} EPCIs",
            communes.len(),
            epcis.len()
        );
        Ok(References::from_parts(communes, epcis))
    }

    /// Build the lookup indexes from already-parsed rows.
    pub fn from_parts(communes: Vec<Commune>, epcis: Vec<EpciEntry>) -> References {
        let mut epci_by_insee = HashMap::new();
        let mut epci_by_postal = HashMap::new();
        let mut area_km2_by_epci: HashMap<String, f64> = HashMap::new();

        for commune in &communes {
            if commune.epci_code == NO_EPCI {
                continue;
            }
            epci_by_insee.insert(commune.code_insee.clone(), commune.epci_code.clone());
            if let Some(postal) = &commune.code_postal {
                // Several communes can share a postal code; first wins, which
                // is stable because the source file order is stable.
                epci_by_postal
                    .entry(postal.clone())
                    .or_insert_with(|| commune.epci_code.clone());
            }
            if let Some(area) = commune.superficie_km2 {
                *area_km2_by_epci.entry(commune.epci_code.clone()).or_insert(0.0) += area;
            }
        }

        let population_by_epci = epcis
            .iter()
            .filter_map(|e| e.population_total.map(|p| (e.siren.clone(), p)))
            .collect();
        let known_sirens = epcis.iter().map(|e| e.siren.clone()).collect();

        References {
            communes,
            epcis,
            epci_by_insee,
            epci_by_postal,
            population_by_epci,
            area_km2_by_epci,
            known_sirens,
        }
    }

    /// EPCI siren for an INSEE code; None for unknown codes and for
    /// communes not attached to any EPCI.
    pub fn epci_of_insee(&self, code_insee: &str) -> Option<&str> {
        self.epci_by_insee.get(code_insee).map(String::as_str)
    }

    pub fn epci_of_postal(&self, code_postal: &str) -> Option<&str> {
        self.epci_by_postal.get(code_postal).map(String::as_str)
    }

    /// Total population of an EPCI from the catalog, when known and > 0.
    pub fn population_of_epci(&self, siren: &str) -> Option<f64> {
        self.population_by_epci
            .get(siren)
            .copied()
            .filter(|p| *p > 0.0)
    }

    /// EPCI surface as the sum of its communes' areas, when known and > 0.
    pub fn area_km2_of_epci(&self, siren: &str) -> Option<f64> {
        self.area_km2_by_epci
            .get(siren)
            .copied()
            .filter(|a| *a > 0.0)
    }

    /// Is this siren a real EPCI key (catalog member, not the sentinel)?
    pub fn is_known_epci(&self, siren: &str) -> bool {
        siren != NO_EPCI && self.known_sirens.contains(siren)
    }
}

fn parse_communes(table: &RawTable) -> Result<Vec<Commune>, PipelineError> {
    let err = |reason: &str| PipelineError::ReferenceUnavailable(reason.to_string());

    let insee_col = table
        .find_column(&["code_insee", "insee", "com"])
        .ok_or_else(|| err("communes file: no code_insee column"))?;
    let postal_col = table
        .find_column(&["code_postal", "cp"])
        .ok_or_else(|| err("communes file: no code_postal column"))?;
    let epci_col = table
        .find_column(&["epci_code", "siren_epci", "epci"])
        .ok_or_else(|| err("communes file: no epci_code column"))?;
    let area_col = table.find_column(&["superficie_km2", "surface_km2"]);
    let population_col = table.find_column(&["population", "pmun", "population_municipale"]);
    let name_col = table.find_column(&["nom_standard", "nom_commune", "nom"]);

    let mut communes = Vec::with_capacity(table.rows.len());
    for row in &table.rows {
        let Some(code_insee) = normalize_code(table.cell(row, insee_col)) else {
            continue;
        };
        let epci_code = table.cell(row, epci_col).trim().to_string();
        if epci_code.is_empty() {
            continue;
        }
        communes.push(Commune {
            code_insee,
            code_postal: normalize_code(table.cell(row, postal_col)),
            epci_code,
            population: population_col.and_then(|c| parse_number(table.cell(row, c))),
            superficie_km2: area_col.and_then(|c| parse_number(table.cell(row, c))),
            name: name_col
                .map(|c| table.cell(row, c).to_string())
                .unwrap_or_default(),
        });
    }

    if communes.is_empty() {
        return Err(err("communes file parsed to zero rows"));
    }
    Ok(communes)
}

fn parse_epcis(table: &RawTable) -> Result<Vec<EpciEntry>, PipelineError> {
    let err = |reason: &str| PipelineError::ReferenceUnavailable(reason.to_string());

    let siren_col = table
        .find_column(&["siren", "n_siren", "siren_epci"])
        .ok_or_else(|| err("EPCI file: no siren column"))?;
    let label_col = table.find_column(&["raison_sociale", "nom_complet", "nom_du_groupement"]);
    let dept_col = table.find_column(&["dept", "departement", "dep"]);
    // Population figures carry embedded thousands spaces ("1 234 567").
    let population_col = table.find_column(&["total_pop_tot", "population_totale", "ptot"]);

    let mut seen = HashSet::new();
    let mut epcis = Vec::new();
    for row in &table.rows {
        let siren = table.cell(row, siren_col).trim().to_string();
        if siren.is_empty() || siren == NO_EPCI || !seen.insert(siren.clone()) {
            continue;
        }
        epcis.push(EpciEntry {
            siren,
            department_code: dept_col
                .map(|c| table.cell(row, c).trim().to_string())
                .filter(|d| !d.is_empty()),
            label: label_col
                .map(|c| table.cell(row, c).to_string())
                .unwrap_or_default(),
            population_total: population_col.and_then(|c| parse_number(table.cell(row, c))),
        });
    }

    if epcis.is_empty() {
        return Err(err("EPCI file parsed to zero rows"));
    }
    Ok(epcis)
}

/// Re-encode a Latin-1 file to UTF-8 next to the original, once.
/// Returns the path of the UTF-8 copy.
fn reencode_to_utf8(path: &Path) -> std::io::Result<std::path::PathBuf> {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
    let target = path.with_file_name(format!("{}_utf8.csv", stem));
    if target.exists() {
        return Ok(target);
    }
    let bytes = std::fs::read(path)?;
    let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(&bytes);
    std::fs::write(&target, decoded.as_bytes())?;
    Ok(target)
}
