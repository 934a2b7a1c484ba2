//! In-memory tabular model shared by every source format.
//!
//! All cells are strings; type coercion happens at the Clean step, where the
//! indicator knows what a column is supposed to contain. Column lookup goes
//! through explicit alias lists (canonical name -> accepted source headers),
//! resolved once, failing with a named missing-column error instead of a
//! lookup panic deep in later logic.

use crate::error::PipelineError;

/// Sentinel EPCI code meaning "commune not attached to any EPCI".
/// Must never survive into an EPCI-keyed join or a persisted row.
pub const NO_EPCI: &str = "ZZZZZZZZZ";

#[derive(Debug, Clone)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { headers, rows }
    }

    /// Find a column by its ordered alias list (case-insensitive, trimmed).
    pub fn find_column(&self, aliases: &[&str]) -> Option<usize> {
        for alias in aliases {
            let wanted = alias.trim().to_lowercase();
            if let Some(idx) = self
                .headers
                .iter()
                .position(|h| h.trim().to_lowercase() == wanted)
            {
                return Some(idx);
            }
        }
        None
    }

    /// Like `find_column`, but failing fast with the canonical name and the
    /// aliases that were tried.
    pub fn require_column(
        &self,
        indicator: &str,
        canonical: &str,
        aliases: &[&str],
    ) -> Result<usize, PipelineError> {
        self.find_column(aliases).ok_or_else(|| {
            PipelineError::transform(
                indicator,
                format!(
                    "missing column '{}' (accepted headers: {})",
                    canonical,
                    aliases.join(", ")
                ),
            )
        })
    }

    pub fn cell<'a>(&'a self, row: &'a [String], idx: usize) -> &'a str {
        row.get(idx).map(String::as_str).unwrap_or("")
    }
}

/// Normalize a postal/INSEE code to a zero-padded 5-character string.
///
/// Sources deliver these as floats (`1400.0`), short integers (`750`) or
/// placeholder junk; returns `None` for anything that is not a usable code.
pub fn normalize_code(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    const INVALID: &[&str] = &["", "nan", "<NA>", "NaN", "Nan", "0", "0.0", "INSEE", "commune"];
    if INVALID.contains(&trimmed) {
        return None;
    }
    let stripped = trimmed.strip_suffix(".0").unwrap_or(trimmed);
    if stripped.is_empty() {
        return None;
    }
    // Corsican codes (2A/2B) and DOM codes are alphanumeric; keep them as-is
    // once they reach 5 characters.
    if stripped.len() >= 5 {
        return Some(stripped.to_string());
    }
    Some(format!("{:0>5}", stripped))
}

/// Parse a number that may carry a decimal comma and embedded spaces
/// (thousands separators in French exports: `"1 234,5"` -> 1234.5).
pub fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}')
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Round to a fixed number of decimals; units decide the precision.
pub fn round_to(value: f64, precision: i32) -> f64 {
    let factor = 10f64.powi(precision);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_code_float_artifact() {
        assert_eq!(normalize_code("1400.0"), Some("01400".to_string()));
    }

    #[test]
    fn test_normalize_code_short_numeric() {
        assert_eq!(normalize_code("750"), Some("00750".to_string()));
    }

    #[test]
    fn test_normalize_code_already_five_chars() {
        assert_eq!(normalize_code("75056"), Some("75056".to_string()));
        assert_eq!(normalize_code("2A004"), Some("2A004".to_string()));
    }

    #[test]
    fn test_normalize_code_invalid_values() {
        assert_eq!(normalize_code(""), None);
        assert_eq!(normalize_code("nan"), None);
        assert_eq!(normalize_code("<NA>"), None);
        assert_eq!(normalize_code("0"), None);
        assert_eq!(normalize_code("0.0"), None);
    }

    #[test]
    fn test_normalize_code_trims_whitespace() {
        assert_eq!(normalize_code("  1400.0  "), Some("01400".to_string()));
    }

    #[test]
    fn test_parse_number_decimal_comma() {
        assert_eq!(parse_number("12,5"), Some(12.5));
    }

    #[test]
    fn test_parse_number_thousands_spaces() {
        assert_eq!(parse_number("1 234,5"), Some(1234.5));
        assert_eq!(parse_number("12 345"), Some(12345.0));
    }

    #[test]
    fn test_parse_number_plain() {
        assert_eq!(parse_number("42"), Some(42.0));
        assert_eq!(parse_number("3.25"), Some(3.25));
    }

    #[test]
    fn test_parse_number_garbage() {
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_number("n/a"), None);
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(1.23456, 2), 1.23);
        assert_eq!(round_to(1.235, 3), 1.235);
        assert_eq!(round_to(20.0, 1), 20.0);
    }

    #[test]
    fn test_find_column_alias_order() {
        let table = RawTable::new(
            vec!["Code_Postal".into(), "valeur".into()],
            vec![],
        );
        assert_eq!(table.find_column(&["cp", "code_postal"]), Some(0));
        assert_eq!(table.find_column(&["valeur"]), Some(1));
        assert_eq!(table.find_column(&["absent"]), None);
    }

    #[test]
    fn test_require_column_names_the_missing_field() {
        let table = RawTable::new(vec!["a".into()], vec![]);
        let err = table
            .require_column("i999", "code_insee", &["insee", "com"])
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("i999"));
        assert!(msg.contains("code_insee"));
    }
}
