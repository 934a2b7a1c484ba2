//! Source Acquirer - fetches a named remote tabular resource into a RawTable.
//!
//! Cache-is-truth policy: if the cache file already exists under CACHE_DIR the
//! network is never touched. Operators delete stale cache files to force a
//! refresh. Downloads land in a `.part` file first and are renamed once
//! complete, so a crashed run never leaves a half-written cache entry behind.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::Field;
use tokio::time::sleep;

use crate::error::PipelineError;
use crate::table::RawTable;
use crate::Config;

#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub url: &'static str,
    pub filename: &'static str,
    pub format: SourceFormat,
}

#[derive(Debug, Clone)]
pub enum SourceFormat {
    /// Plain delimited text.
    Csv { delimiter: u8 },
    /// Zipped delimited text: extract one member, discard the archive.
    CsvZip {
        member: &'static str,
        delimiter: u8,
    },
    /// Columnar binary file, read row by row.
    Parquet,
    /// Vector layer; one output row per feature, with the feature's code
    /// property and its geodesic length in km under `length_km`.
    GeoJson { code_property: &'static str },
    /// Offset-paginated JSON API: loop until a page returns fewer records
    /// than the page size, concatenating pages in order. The concatenated
    /// record array is what gets cached.
    JsonApi {
        page_size: usize,
        results_key: &'static str,
        max_pages: usize,
    },
}

/// Fetch a source into memory, downloading at most once per cache filename.
pub async fn fetch(
    client: &reqwest::Client,
    config: &Config,
    source: &SourceSpec,
) -> Result<RawTable, PipelineError> {
    match &source.format {
        SourceFormat::Csv { delimiter } => {
            let path = ensure_cached(client, config, source.url, source.filename).await?;
            load_csv(&path, *delimiter)
        }
        SourceFormat::CsvZip { member, delimiter } => {
            let archive = ensure_cached(client, config, source.url, source.filename).await?;
            let extracted = extract_zip_member(&archive, &config.cache_dir, member)?;
            load_csv(&extracted, *delimiter)
        }
        SourceFormat::Parquet => {
            let path = ensure_cached(client, config, source.url, source.filename).await?;
            load_parquet(&path)
        }
        SourceFormat::GeoJson { code_property } => {
            let path = ensure_cached(client, config, source.url, source.filename).await?;
            load_geojson(&path, code_property)
        }
        SourceFormat::JsonApi {
            page_size,
            results_key,
            max_pages,
        } => {
            let path = config.cache_dir.join(source.filename);
            if !path.exists() {
                let records =
                    fetch_paginated(client, config, source.url, *page_size, results_key, *max_pages)
                        .await?;
                write_atomic(&path, serde_json::to_vec(&records).unwrap_or_default()).await?;
            }
            load_json_records(&path)
        }
    }
}

/// Make sure `cache_dir/filename` exists locally, downloading it if absent.
/// Returns the path; performs no freshness check on an existing file.
pub async fn ensure_cached(
    client: &reqwest::Client,
    config: &Config,
    url: &str,
    filename: &str,
) -> Result<PathBuf, PipelineError> {
    let path = config.cache_dir.join(filename);
    if path.exists() {
        println!("  Cache hit: {}", path.display());
        return Ok(path);
    }

    // Polite pause before hitting a public open-data mirror.
    sleep(Duration::from_millis(config.rate_limit_ms)).await;
    println!("  Fetching: {}", url);

    let resp = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| PipelineError::SourceFetch {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let bytes = resp.bytes().await.map_err(|e| PipelineError::SourceFetch {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    println!("  Downloaded: {} bytes -> {}", bytes.len(), path.display());
    write_atomic(&path, bytes.to_vec()).await?;
    Ok(path)
}

/// Write via a temp file + rename so readers never see a partial download.
async fn write_atomic(path: &Path, bytes: Vec<u8>) -> Result<(), PipelineError> {
    let dir = path.parent().unwrap_or(Path::new("."));
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| PipelineError::format(&path.to_string_lossy(), e.to_string()))?;
    let part = path.with_extension("part");
    tokio::fs::write(&part, bytes)
        .await
        .map_err(|e| PipelineError::format(&path.to_string_lossy(), e.to_string()))?;
    tokio::fs::rename(&part, path)
        .await
        .map_err(|e| PipelineError::format(&path.to_string_lossy(), e.to_string()))?;
    Ok(())
}

/// Load a delimited text file into a RawTable. The UTF-8 BOM some exports
/// carry on the first header is stripped.
pub fn load_csv(path: &Path, delimiter: u8) -> Result<RawTable, PipelineError> {
    let name = path.to_string_lossy().to_string();
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| PipelineError::format(&name, e.to_string()))?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| PipelineError::format(&name, e.to_string()))?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                eprintln!("  Warning: skipping malformed row: {}", e);
                continue;
            }
        };
        let mut row: Vec<String> = record.iter().map(|c| c.to_string()).collect();
        row.resize(headers.len(), String::new());
        rows.push(row);
    }

    Ok(RawTable::new(headers, rows))
}

/// Extract one member of a zip archive into the cache dir (exact name first,
/// then suffix match for archives with internal folders). Already-extracted
/// members are reused.
pub fn extract_zip_member(
    archive_path: &Path,
    cache_dir: &Path,
    member: &str,
) -> Result<PathBuf, PipelineError> {
    let target = cache_dir.join(member);
    if target.exists() {
        return Ok(target);
    }

    let name = archive_path.to_string_lossy().to_string();
    let file = std::fs::File::open(archive_path)
        .map_err(|e| PipelineError::format(&name, e.to_string()))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| PipelineError::format(&name, e.to_string()))?;

    let index = (0..archive.len())
        .find(|&i| {
            archive
                .by_index(i)
                .map(|f| f.name() == member || f.name().ends_with(&format!("/{}", member)))
                .unwrap_or(false)
        })
        .ok_or_else(|| {
            PipelineError::format(&name, format!("archive member '{}' not found", member))
        })?;

    let mut entry = archive
        .by_index(index)
        .map_err(|e| PipelineError::format(&name, e.to_string()))?;
    let mut bytes = Vec::new();
    entry
        .read_to_end(&mut bytes)
        .map_err(|e| PipelineError::format(&name, e.to_string()))?;

    // Same temp-then-rename discipline as downloads: a crashed extraction
    // must not leave a half-written member behind as cached truth.
    let part = target.with_extension("part");
    std::fs::write(&part, bytes)
        .map_err(|e| PipelineError::format(&name, e.to_string()))?;
    std::fs::rename(&part, &target)
        .map_err(|e| PipelineError::format(&name, e.to_string()))?;
    println!("  Extracted {} from {}", member, name);
    Ok(target)
}

fn load_parquet(path: &Path) -> Result<RawTable, PipelineError> {
    let name = path.to_string_lossy().to_string();
    let file = std::fs::File::open(path)
        .map_err(|e| PipelineError::format(&name, e.to_string()))?;
    let reader = SerializedFileReader::new(file)
        .map_err(|e| PipelineError::format(&name, e.to_string()))?;

    let headers: Vec<String> = reader
        .metadata()
        .file_metadata()
        .schema_descr()
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let mut rows = Vec::new();
    let iter = reader
        .get_row_iter(None)
        .map_err(|e| PipelineError::format(&name, e.to_string()))?;
    for row in iter {
        let row = row.map_err(|e| PipelineError::format(&name, e.to_string()))?;
        let mut cells = vec![String::new(); headers.len()];
        for (col_name, field) in row.get_column_iter() {
            if let Some(idx) = headers.iter().position(|h| h == col_name) {
                cells[idx] = field_to_string(field);
            }
        }
        rows.push(cells);
    }

    Ok(RawTable::new(headers, rows))
}

fn field_to_string(field: &Field) -> String {
    match field {
        Field::Null => String::new(),
        Field::Bool(v) => v.to_string(),
        Field::Byte(v) => v.to_string(),
        Field::Short(v) => v.to_string(),
        Field::Int(v) => v.to_string(),
        Field::Long(v) => v.to_string(),
        Field::UByte(v) => v.to_string(),
        Field::UShort(v) => v.to_string(),
        Field::UInt(v) => v.to_string(),
        Field::ULong(v) => v.to_string(),
        Field::Float(v) => v.to_string(),
        Field::Double(v) => v.to_string(),
        Field::Str(v) => v.clone(),
        other => other.to_string(),
    }
}

fn load_geojson(path: &Path, code_property: &str) -> Result<RawTable, PipelineError> {
    let name = path.to_string_lossy().to_string();
    let content = std::fs::read_to_string(path)
        .map_err(|e| PipelineError::format(&name, e.to_string()))?;
    let geojson: geojson::GeoJson = content
        .parse()
        .map_err(|e: geojson::Error| PipelineError::format(&name, e.to_string()))?;

    let collection = match geojson {
        geojson::GeoJson::FeatureCollection(fc) => fc,
        _ => {
            return Err(PipelineError::format(
                &name,
                "expected a FeatureCollection at top level",
            ))
        }
    };

    let headers = vec![code_property.to_string(), "length_km".to_string()];
    let mut rows = Vec::new();

    for feature in collection.features {
        let code = feature
            .properties
            .as_ref()
            .and_then(|p| p.get(code_property))
            .map(json_value_to_string)
            .unwrap_or_default();
        if code.is_empty() {
            continue;
        }
        let Some(geometry) = feature.geometry else {
            continue;
        };
        let length_km = match &geometry.value {
            geojson::Value::LineString(line) => linestring_length_km(line),
            geojson::Value::MultiLineString(lines) => {
                lines.iter().map(|l| linestring_length_km(l)).sum()
            }
            _ => continue,
        };
        rows.push(vec![code, length_km.to_string()]);
    }

    Ok(RawTable::new(headers, rows))
}

/// Geodesic length of a lon/lat linestring via the haversine formula, in km.
pub fn linestring_length_km(coords: &[Vec<f64>]) -> f64 {
    coords
        .windows(2)
        .filter(|pair| pair[0].len() >= 2 && pair[1].len() >= 2)
        .map(|pair| haversine_km(pair[0][0], pair[0][1], pair[1][0], pair[1][1]))
        .sum()
}

fn haversine_km(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0088;
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

async fn fetch_paginated(
    client: &reqwest::Client,
    config: &Config,
    url: &str,
    page_size: usize,
    results_key: &str,
    max_pages: usize,
) -> Result<Vec<serde_json::Map<String, serde_json::Value>>, PipelineError> {
    paginate(url, page_size, max_pages, |page| {
        let offset = page * page_size;
        let separator = if url.contains('?') { '&' } else { '?' };
        let page_url = format!("{}{}limit={}&offset={}", url, separator, page_size, offset);

        async move {
            sleep(Duration::from_millis(config.rate_limit_ms)).await;
            println!("  Fetching page {} (offset {})", page + 1, offset);

            let payload: serde_json::Value = client
                .get(&page_url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| PipelineError::SourceFetch {
                    url: page_url.clone(),
                    reason: e.to_string(),
                })?
                .json()
                .await
                .map_err(|e| PipelineError::SourceFetch {
                    url: page_url.clone(),
                    reason: e.to_string(),
                })?;

            let page_records = payload
                .get(results_key)
                .and_then(|v| v.as_array())
                .ok_or_else(|| {
                    PipelineError::format(
                        &page_url,
                        format!("no '{}' array in API response", results_key),
                    )
                })?;

            Ok(page_records
                .iter()
                .filter_map(|record| match record {
                    serde_json::Value::Object(map) => Some(map.clone()),
                    _ => None,
                })
                .collect())
        }
    })
    .await
}

/// Drive an offset-paginated fetch: pages concatenate in order and the loop
/// stops at the first page shorter than `page_size`. Exhausting `max_pages`
/// while pages are still full means the dataset kept going; that is an error,
/// not a result, so a truncated record set can never be cached as truth.
async fn paginate<F, Fut>(
    url: &str,
    page_size: usize,
    max_pages: usize,
    fetch_page: F,
) -> Result<Vec<serde_json::Map<String, serde_json::Value>>, PipelineError>
where
    F: Fn(usize) -> Fut,
    Fut: std::future::Future<
        Output = Result<Vec<serde_json::Map<String, serde_json::Value>>, PipelineError>,
    >,
{
    let mut records = Vec::new();

    for page in 0..max_pages {
        let page_records = fetch_page(page).await?;
        let count = page_records.len();
        records.extend(page_records);

        // A short page means we drained the dataset.
        if count < page_size {
            return Ok(records);
        }
    }

    Err(PipelineError::SourceFetch {
        url: url.to_string(),
        reason: format!(
            "still receiving full pages after {} pages; refusing a truncated dataset",
            max_pages
        ),
    })
}

fn load_json_records(path: &Path) -> Result<RawTable, PipelineError> {
    let name = path.to_string_lossy().to_string();
    let content = std::fs::read_to_string(path)
        .map_err(|e| PipelineError::format(&name, e.to_string()))?;
    let records: Vec<serde_json::Map<String, serde_json::Value>> =
        serde_json::from_str(&content)
            .map_err(|e| PipelineError::format(&name, e.to_string()))?;
    Ok(flatten_records(&records))
}

/// Flatten JSON records into string cells. Headers come from the first
/// record; serde_json maps iterate in a stable key order, so the layout is
/// deterministic across runs.
pub fn flatten_records(records: &[serde_json::Map<String, serde_json::Value>]) -> RawTable {
    let headers: Vec<String> = records
        .first()
        .map(|r| r.keys().cloned().collect())
        .unwrap_or_default();

    let rows = records
        .iter()
        .map(|record| {
            headers
                .iter()
                .map(|h| record.get(h).map(json_value_to_string).unwrap_or_default())
                .collect()
        })
        .collect();

    RawTable::new(headers, rows)
}

fn json_value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ingest-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn test_load_csv_with_bom_and_padding() {
        let path = temp_path("bom.csv");
        std::fs::write(&path, "\u{feff}code;valeur\n01400;12,5\n75056\n").unwrap();
        let table = load_csv(&path, b';').unwrap();
        assert_eq!(table.headers, vec!["code", "valeur"]);
        assert_eq!(table.rows.len(), 2);
        // Short row padded to header width.
        assert_eq!(table.rows[1], vec!["75056".to_string(), String::new()]);
    }

    #[test]
    fn test_flatten_records_deterministic_layout() {
        let records: Vec<serde_json::Map<String, serde_json::Value>> = vec![
            serde_json::from_str(r#"{"numepci": "200000172", "txcouv_epci": 58.3}"#).unwrap(),
            serde_json::from_str(r#"{"numepci": "200000438", "txcouv_epci": null}"#).unwrap(),
        ];
        let table = flatten_records(&records);
        assert_eq!(table.headers, vec!["numepci", "txcouv_epci"]);
        assert_eq!(table.rows[0], vec!["200000172", "58.3"]);
        assert_eq!(table.rows[1][1], "");
    }

    #[test]
    fn test_linestring_length_one_degree_longitude_at_equator() {
        let line = vec![vec![0.0, 0.0], vec![1.0, 0.0]];
        let km = linestring_length_km(&line);
        // One degree of longitude at the equator is ~111.2 km.
        assert!((km - 111.2).abs() < 0.5, "got {}", km);
    }

    #[test]
    fn test_linestring_length_empty_and_single_point() {
        assert_eq!(linestring_length_km(&[]), 0.0);
        assert_eq!(linestring_length_km(&[vec![2.35, 48.85]]), 0.0);
    }

    #[test]
    fn test_zip_member_extraction() {
        use std::io::Write;
        let archive_path = temp_path("fixture.zip");
        let file = std::fs::File::create(&archive_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("catnat.csv", options).unwrap();
        writer.write_all(b"cod_commune;lib_commune\n01400;Test\n").unwrap();
        writer.start_file("readme.txt", options).unwrap();
        writer.write_all(b"ignore me").unwrap();
        writer.finish().unwrap();

        let cache_dir = archive_path.parent().unwrap().to_path_buf();
        let extracted = extract_zip_member(&archive_path, &cache_dir, "catnat.csv").unwrap();
        let table = load_csv(&extracted, b';').unwrap();
        assert_eq!(table.headers, vec!["cod_commune", "lib_commune"]);
        assert_eq!(table.rows.len(), 1);
        // No temp file left behind once the rename landed.
        assert!(!extracted.with_extension("part").exists());
    }

    fn record(n: usize) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        map.insert("n".to_string(), serde_json::json!(n));
        map
    }

    #[tokio::test]
    async fn test_paginate_stops_on_short_page() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = AtomicUsize::new(0);
        let result = paginate("http://example.invalid/api", 2, 10, |page| {
            calls.fetch_add(1, Ordering::SeqCst);
            let len = if page < 2 { 2 } else { 1 };
            async move { Ok((0..len).map(record).collect()) }
        })
        .await
        .unwrap();
        assert_eq!(result.len(), 5);
        // Page 3 was short; page 4 must never be requested.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_paginate_full_final_page_at_cap_is_an_error() {
        let err = paginate("http://example.invalid/api", 2, 3, |_page| async {
            Ok((0..2).map(record).collect())
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("full pages"), "got: {}", err);
    }

    #[tokio::test]
    async fn test_ensure_cached_skips_network_when_file_exists() {
        let path = temp_path("preseeded.csv");
        std::fs::write(&path, "a;b\n1;2\n").unwrap();
        let config = crate::Config {
            db_url: None,
            cache_dir: path.parent().unwrap().to_path_buf(),
            rate_limit_ms: 0,
            http_timeout_secs: 1,
        };
        let client = reqwest::Client::new();
        // The host cannot resolve, so success proves the cache hit never
        // touched the network.
        let cached =
            ensure_cached(&client, &config, "http://invalid.invalid/x.csv", "preseeded.csv")
                .await
                .unwrap();
        assert_eq!(std::fs::read_to_string(cached).unwrap(), "a;b\n1;2\n");
    }

    #[test]
    fn test_zip_missing_member_is_a_format_error() {
        use std::io::Write;
        let archive_path = temp_path("missing.zip");
        let file = std::fs::File::create(&archive_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("other.csv", options).unwrap();
        writer.write_all(b"a\n1\n").unwrap();
        writer.finish().unwrap();

        let cache_dir = archive_path.parent().unwrap().to_path_buf();
        let err = extract_zip_member(&archive_path, &cache_dir, "nope.csv").unwrap_err();
        assert!(err.to_string().contains("nope.csv"));
    }
}
