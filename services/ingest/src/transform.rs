//! Generic indicator pipeline: Clean -> Geo-join -> Aggregate -> Shape.
//!
//! One driver, many parameterizations. Each indicator supplies a clean
//! function producing keyed rows and declares an aggregation formula; this
//! module owns everything after that.
//!
//! Output domain rules, which downstream readers rely on:
//! - denominator-driven formulas (per population, per/percent of area) emit
//!   one row per EPCI whose denominator is known, with a null value when no
//!   source rows matched ("computed but invalid");
//! - numerator-driven formulas (count, sum, mean) emit only the EPCIs present
//!   after the join ("no row" = "not computed"). A source row with value 0 is
//!   a real row and aggregates to an explicit 0.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::PipelineError;
use crate::indicators::IndicatorSpec;
use crate::reference::References;
use crate::table::round_to;

/// A cleaned source row: a geographic key plus one numeric contribution.
/// Count-style indicators contribute 1.0 per row.
#[derive(Debug, Clone)]
pub struct CleanRow {
    pub key: GeoKey,
    pub value: f64,
}

#[derive(Debug, Clone)]
pub enum GeoKey {
    Insee(String),
    Postal(String),
    Epci(String),
}

#[derive(Debug, Clone, Copy)]
pub enum Formula {
    /// Row count per EPCI.
    Count,
    /// Sum of contributions per EPCI.
    Sum,
    /// Arithmetic mean of contributions per EPCI.
    Mean,
    /// sum(value) / EPCI population * per (e.g. per 10 000 inhabitants).
    PerPopulation { per: f64 },
    /// sum(value) / EPCI surface in km².
    PerAreaKm2,
    /// sum(value in km²) / EPCI surface * 100.
    ShareOfAreaPct,
}

/// The canonical fact-row shape consumed by the upsert sink.
#[derive(Debug, Clone, Serialize)]
pub struct ComputedValue {
    pub epci_siren: String,
    pub indicator_id: String,
    pub data_year: String,
    pub value: Option<f64>,
    pub unit: String,
    pub source: String,
    pub meta: serde_json::Value,
}

#[derive(Debug, Default, Clone, Copy)]
struct Group {
    sum: f64,
    count: u64,
}

/// Run steps B-D for one indicator over its cleaned rows.
pub fn compute(
    spec: &IndicatorSpec,
    rows: Vec<CleanRow>,
    refs: &References,
) -> Result<Vec<ComputedValue>, PipelineError> {
    // Step B: key every row by EPCI siren. Unresolvable codes and sirens
    // missing from the catalog are dropped, the "no EPCI" sentinel is
    // filtered out of everything.
    let mut groups: BTreeMap<String, Group> = BTreeMap::new();
    let mut dropped = 0usize;

    for row in rows {
        if !row.value.is_finite() {
            dropped += 1;
            continue;
        }
        let siren = match &row.key {
            GeoKey::Insee(code) => refs.epci_of_insee(code).map(str::to_string),
            GeoKey::Postal(code) => refs.epci_of_postal(code).map(str::to_string),
            GeoKey::Epci(siren) => {
                let trimmed = siren.trim();
                refs.is_known_epci(trimmed).then(|| trimmed.to_string())
            }
        };
        let Some(siren) = siren else {
            dropped += 1;
            continue;
        };
        let group = groups.entry(siren).or_default();
        group.sum += row.value;
        group.count += 1;
    }

    if dropped > 0 {
        println!("  Dropped {} rows with no resolvable EPCI", dropped);
    }

    // Steps C + D: apply the formula and shape the fact rows.
    let values = match spec.formula {
        Formula::Count => groups
            .iter()
            .map(|(siren, g)| shape(spec, siren, Some(g.count as f64)))
            .collect(),
        Formula::Sum => groups
            .iter()
            .map(|(siren, g)| shape(spec, siren, Some(g.sum)))
            .collect(),
        Formula::Mean => groups
            .iter()
            .map(|(siren, g)| {
                let mean = (g.count > 0).then(|| g.sum / g.count as f64);
                shape(spec, siren, mean)
            })
            .collect(),
        Formula::PerPopulation { per } => denominator_domain(spec, refs, &groups, |siren| {
            refs.population_of_epci(siren)
        }, |sum, denom| sum / denom * per),
        Formula::PerAreaKm2 => denominator_domain(spec, refs, &groups, |siren| {
            refs.area_km2_of_epci(siren)
        }, |sum, denom| sum / denom),
        Formula::ShareOfAreaPct => denominator_domain(spec, refs, &groups, |siren| {
            refs.area_km2_of_epci(siren)
        }, |sum, denom| sum / denom * 100.0),
    };

    Ok(values)
}

/// Domain for denominator-driven formulas: every catalog EPCI whose
/// denominator is defined, null value when no source rows matched. EPCIs
/// without the denominator are absent, never zero.
fn denominator_domain(
    spec: &IndicatorSpec,
    refs: &References,
    groups: &BTreeMap<String, Group>,
    denominator: impl Fn(&str) -> Option<f64>,
    apply: impl Fn(f64, f64) -> f64,
) -> Vec<ComputedValue> {
    let mut sirens: Vec<&str> = refs.epcis.iter().map(|e| e.siren.as_str()).collect();
    sirens.sort_unstable();

    sirens
        .into_iter()
        .filter_map(|siren| {
            let denom = denominator(siren)?;
            let value = groups.get(siren).map(|g| apply(g.sum, denom));
            Some(shape(spec, siren, value))
        })
        .collect()
}

fn shape(spec: &IndicatorSpec, siren: &str, value: Option<f64>) -> ComputedValue {
    ComputedValue {
        epci_siren: siren.to_string(),
        indicator_id: spec.id.to_string(),
        data_year: spec.data_year.to_string(),
        value: value
            .filter(|v| v.is_finite())
            .map(|v| round_to(v, spec.precision)),
        unit: spec.unit.to_string(),
        source: spec.source_label.to_string(),
        meta: serde_json::json!({ "indicator": spec.label }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquire::{SourceFormat, SourceSpec};
    use crate::reference::{Commune, EpciEntry};
    use crate::table::NO_EPCI;

    fn commune(insee: &str, postal: &str, epci: &str, pop: f64, area: f64) -> Commune {
        Commune {
            code_insee: insee.to_string(),
            code_postal: Some(postal.to_string()),
            epci_code: epci.to_string(),
            population: Some(pop),
            superficie_km2: Some(area),
            name: String::new(),
        }
    }

    fn epci(siren: &str, population: Option<f64>) -> EpciEntry {
        EpciEntry {
            siren: siren.to_string(),
            department_code: None,
            label: format!("EPCI {}", siren),
            population_total: population,
        }
    }

    fn refs() -> References {
        References::from_parts(
            vec![
                commune("01001", "01400", "EPCI1", 100.0, 10.0),
                commune("01002", "01410", "EPCI1", 200.0, 30.0),
                commune("02001", "02000", "EPCI2", 300.0, 10.0),
                commune("03001", "03000", NO_EPCI, 400.0, 99.0),
            ],
            vec![epci("EPCI1", Some(10_000.0)), epci("EPCI2", None)],
        )
    }

    fn spec(formula: Formula, precision: i32) -> IndicatorSpec {
        IndicatorSpec {
            id: "t001",
            label: "test indicator",
            source: SourceSpec {
                url: "http://example.invalid/data.csv",
                filename: "test.csv",
                format: SourceFormat::Csv { delimiter: b',' },
            },
            data_year: "2025",
            unit: "u",
            precision,
            source_label: "test",
            clean: |_| Ok(vec![]),
            formula,
        }
    }

    fn insee(code: &str, value: f64) -> CleanRow {
        CleanRow {
            key: GeoKey::Insee(code.to_string()),
            value,
        }
    }

    #[test]
    fn test_mean_three_communes_one_epci() {
        let rows = vec![insee("01001", 10.0), insee("01001", 20.0), insee("01002", 30.0)];
        let out = compute(&spec(Formula::Mean, 1), rows, &refs()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].epci_siren, "EPCI1");
        assert_eq!(out[0].value, Some(20.0));
    }

    #[test]
    fn test_count_aggregates_per_epci() {
        let rows = vec![
            insee("01001", 5.0),
            insee("01001", 3.0),
            insee("02001", 0.0),
        ];
        let out = compute(&spec(Formula::Count, 0), rows, &refs()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].epci_siren, "EPCI1");
        assert_eq!(out[0].value, Some(2.0));
        assert_eq!(out[1].epci_siren, "EPCI2");
        assert_eq!(out[1].value, Some(1.0));
    }

    #[test]
    fn test_sum_keeps_explicit_zero_rows() {
        // A zero-valued source row is a real row: it yields an explicit 0,
        // not an absent EPCI.
        let rows = vec![insee("01001", 5.0), insee("01002", 3.0), insee("02001", 0.0)];
        let out = compute(&spec(Formula::Sum, 0), rows, &refs()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].value, Some(8.0));
        assert_eq!(out[1].value, Some(0.0));
    }

    #[test]
    fn test_sum_absent_epci_yields_no_row() {
        let rows = vec![insee("01001", 5.0)];
        let out = compute(&spec(Formula::Sum, 0), rows, &refs()).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out.iter().all(|v| v.epci_siren != "EPCI2"));
    }

    #[test]
    fn test_per_population_null_vs_absent() {
        // EPCI1 has a known population but no source rows: present with a
        // null value. EPCI2 has no population: absent entirely.
        let out = compute(&spec(Formula::PerPopulation { per: 10_000.0 }, 2), vec![], &refs())
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].epci_siren, "EPCI1");
        assert_eq!(out[0].value, None);
    }

    #[test]
    fn test_per_population_scales() {
        let rows = vec![insee("01001", 3.0), insee("01002", 2.0)];
        let out = compute(&spec(Formula::PerPopulation { per: 10_000.0 }, 2), rows, &refs())
            .unwrap();
        // 5 units over 10 000 inhabitants, per 10 000.
        assert_eq!(out[0].value, Some(5.0));
    }

    #[test]
    fn test_per_area_uses_commune_area_sums() {
        let rows = vec![insee("01001", 4.0), insee("01002", 4.0)];
        let out = compute(&spec(Formula::PerAreaKm2, 3), rows, &refs()).unwrap();
        // EPCI1 area = 10 + 30 km²; EPCI2 area = 10 km² (null numerator).
        let epci1 = out.iter().find(|v| v.epci_siren == "EPCI1").unwrap();
        assert_eq!(epci1.value, Some(0.2));
        let epci2 = out.iter().find(|v| v.epci_siren == "EPCI2").unwrap();
        assert_eq!(epci2.value, None);
    }

    #[test]
    fn test_share_of_area_pct() {
        let rows = vec![insee("01001", 8.0)];
        let out = compute(&spec(Formula::ShareOfAreaPct, 1), rows, &refs()).unwrap();
        let epci1 = out.iter().find(|v| v.epci_siren == "EPCI1").unwrap();
        assert_eq!(epci1.value, Some(20.0)); // 8 / 40 * 100
    }

    #[test]
    fn test_sentinel_never_appears_in_output() {
        let rows = vec![
            insee("03001", 7.0), // commune attached to the sentinel
            CleanRow {
                key: GeoKey::Epci(NO_EPCI.to_string()),
                value: 9.0,
            },
            insee("01001", 1.0),
        ];
        for formula in [
            Formula::Count,
            Formula::Sum,
            Formula::PerPopulation { per: 10_000.0 },
            Formula::PerAreaKm2,
        ] {
            let out = compute(&spec(formula, 2), rows.clone(), &refs()).unwrap();
            assert!(out.iter().all(|v| v.epci_siren != NO_EPCI));
        }
    }

    #[test]
    fn test_epci_keyed_rows_bypass_the_commune_join() {
        let rows = vec![CleanRow {
            key: GeoKey::Epci("EPCI1".to_string()),
            value: 42.0,
        }];
        let out = compute(&spec(Formula::Mean, 1), rows, &refs()).unwrap();
        assert_eq!(out[0].epci_siren, "EPCI1");
        assert_eq!(out[0].value, Some(42.0));
    }

    #[test]
    fn test_epci_keyed_rows_unknown_siren_is_dropped() {
        let rows = vec![CleanRow {
            key: GeoKey::Epci("999999999".to_string()),
            value: 42.0,
        }];
        let out = compute(&spec(Formula::Mean, 1), rows, &refs()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_rounding_follows_declared_precision() {
        let rows = vec![insee("01001", 1.0), insee("01001", 2.0)];
        let out = compute(&spec(Formula::Mean, 2), rows, &refs()).unwrap();
        assert_eq!(out[0].value, Some(1.5));
        let rows = vec![insee("01001", 1.0), insee("01001", 1.0), insee("01001", 2.0)];
        let out = compute(&spec(Formula::Mean, 2), rows, &refs()).unwrap();
        assert_eq!(out[0].value, Some(1.33));
    }

    #[test]
    fn test_nan_contributions_are_dropped() {
        let rows = vec![insee("01001", f64::NAN), insee("01001", 4.0)];
        let out = compute(&spec(Formula::Mean, 1), rows, &refs()).unwrap();
        assert_eq!(out[0].value, Some(4.0));
    }

    #[test]
    fn test_deterministic_output_order() {
        let rows = vec![insee("02001", 1.0), insee("01001", 1.0)];
        let a = compute(&spec(Formula::Count, 0), rows.clone(), &refs()).unwrap();
        let b = compute(&spec(Formula::Count, 0), rows, &refs()).unwrap();
        let keys_a: Vec<_> = a.iter().map(|v| v.epci_siren.clone()).collect();
        let keys_b: Vec<_> = b.iter().map(|v| v.epci_siren.clone()).collect();
        assert_eq!(keys_a, keys_b);
        assert_eq!(keys_a, vec!["EPCI1".to_string(), "EPCI2".to_string()]);
    }
}
