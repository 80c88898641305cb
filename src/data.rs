//! Loading wide price and return tables from CSV.
//!
//! The expected layout is one date column followed by one column per asset:
//!
//! ```text
//! date,SPY,TLT,GLD
//! 2024-01-02,472.65,97.10,190.33
//! ```

use crate::error::{BacktestError, Result};
use crate::types::{ReturnKind, ReturnMatrix};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use csv::ReaderBuilder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tracing::{debug, info, warn};

/// Loader options.
#[derive(Debug, Clone, Default)]
pub struct DataConfig {
    /// Date format string (e.g. "%Y-%m-%d"). Common formats are tried when unset.
    pub date_format: Option<String>,
    /// CSV delimiter. Auto-detected when unset.
    pub delimiter: Option<u8>,
}

/// Detect the delimiter from the first lines of the file.
///
/// Picks the candidate that splits every sampled line into the same number of
/// fields (at least two), preferring more fields.
fn detect_delimiter(path: &Path) -> Result<u8> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let lines: Vec<String> = reader.lines().take(5).filter_map(|l| l.ok()).collect();

    if lines.is_empty() {
        return Ok(b',');
    }

    let delimiters = [b',', b'\t', b';', b'|'];
    let mut best_delimiter = b',';
    let mut best_score = 0;

    for &delim in &delimiters {
        let counts: Vec<usize> = lines
            .iter()
            .map(|line| line.as_bytes().iter().filter(|&&b| b == delim).count() + 1)
            .collect();

        let first_count = counts[0];
        if first_count >= 2 && counts.iter().all(|&c| c == first_count) && first_count > best_score {
            best_score = first_count;
            best_delimiter = delim;
        }
    }

    debug!(
        "Detected delimiter {:?} with {} fields",
        best_delimiter as char, best_score
    );
    Ok(best_delimiter)
}

fn midnight(d: NaiveDate) -> Result<DateTime<Utc>> {
    d.and_hms_opt(0, 0, 0)
        .map(|dt| Utc.from_utc_datetime(&dt))
        .ok_or_else(|| BacktestError::DataError(format!("Invalid date: {}", d)))
}

/// Parse a date string with multiple format attempts.
pub fn parse_datetime(s: &str, format: Option<&str>) -> Result<DateTime<Utc>> {
    let s = s.trim();

    if let Some(fmt) = format {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&dt));
        }
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return midnight(d);
        }
    }

    let datetime_formats = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%SZ",
        "%Y-%m-%dT%H:%M:%S%.fZ",
        "%Y/%m/%d %H:%M:%S",
    ];
    for fmt in &datetime_formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&dt));
        }
    }

    let date_formats = ["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%m/%d/%Y", "%d-%b-%Y"];
    for fmt in &date_formats {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return midnight(d);
        }
    }

    Err(BacktestError::DataError(format!(
        "Could not parse date: '{}'",
        s
    )))
}

/// Dates, asset names and values of a wide table, sorted by date.
struct WideFrame {
    dates: Vec<DateTime<Utc>>,
    assets: Vec<String>,
    rows: Vec<Vec<f64>>,
}

fn read_wide<R: Read>(reader: R, delimiter: u8, config: &DataConfig) -> Result<WideFrame> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .flexible(false)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = reader.headers()?.clone();
    if headers.len() < 2 {
        return Err(BacktestError::DataError(
            "Expected a date column followed by at least one asset column".to_string(),
        ));
    }
    let assets: Vec<String> = headers.iter().skip(1).map(|h| h.to_string()).collect();

    let mut records: Vec<(DateTime<Utc>, Vec<f64>)> = Vec::new();
    for (row_num, result) in reader.records().enumerate() {
        let record = result?;
        let date = parse_datetime(&record[0], config.date_format.as_deref())?;
        let values = record
            .iter()
            .skip(1)
            .zip(assets.iter())
            .map(|(cell, asset)| {
                cell.parse::<f64>().map_err(|_| {
                    BacktestError::DataError(format!(
                        "Row {}: invalid value '{}' for {}",
                        row_num + 1,
                        cell,
                        asset
                    ))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        records.push((date, values));
    }

    if records.is_empty() {
        return Err(BacktestError::NoData);
    }

    records.sort_by_key(|(d, _)| *d);
    let original_len = records.len();
    records.dedup_by_key(|(d, _)| *d);
    if records.len() < original_len {
        warn!("Removed {} duplicate dates", original_len - records.len());
    }

    let (dates, rows) = records.into_iter().unzip();
    Ok(WideFrame {
        dates,
        assets,
        rows,
    })
}

fn open_wide(path: &Path, config: &DataConfig) -> Result<WideFrame> {
    info!("Loading data from: {}", path.display());
    let delimiter = match config.delimiter {
        Some(d) => d,
        None => detect_delimiter(path)?,
    };
    let frame = read_wide(File::open(path)?, delimiter, config)?;
    info!(
        "Loaded {} rows x {} assets from {} to {}",
        frame.rows.len(),
        frame.assets.len(),
        frame
            .dates
            .first()
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        frame
            .dates
            .last()
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default()
    );
    Ok(frame)
}

/// Load a table of periodic returns.
pub fn load_returns_csv(path: impl AsRef<Path>, config: &DataConfig) -> Result<ReturnMatrix> {
    let frame = open_wide(path.as_ref(), config)?;
    ReturnMatrix::new(frame.dates, frame.assets, frame.rows)
}

/// Load a table of prices and convert it to returns.
pub fn load_prices_csv(
    path: impl AsRef<Path>,
    config: &DataConfig,
    kind: ReturnKind,
) -> Result<ReturnMatrix> {
    let frame = open_wide(path.as_ref(), config)?;
    ReturnMatrix::from_prices(frame.dates, frame.assets, frame.rows, kind)
}

/// Parse a returns table from any reader.
///
/// Uses `config.delimiter`, falling back to a comma; a reader cannot be
/// sampled for auto-detection.
pub fn read_returns<R: Read>(reader: R, config: &DataConfig) -> Result<ReturnMatrix> {
    let frame = read_wide(reader, config.delimiter.unwrap_or(b','), config)?;
    ReturnMatrix::new(frame.dates, frame.assets, frame.rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_datetime_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        assert_eq!(parse_datetime("2024-01-15", None).unwrap(), expected);
        assert_eq!(parse_datetime("2024/01/15", None).unwrap(), expected);
        assert_eq!(parse_datetime("15.01.2024", Some("%d.%m.%Y")).unwrap(), expected);
        assert!(parse_datetime("yesterday", None).is_err());
    }

    #[test]
    fn test_read_returns_sorts_by_date() {
        let data = "date,A,B\n2024-01-03,0.01,0.02\n2024-01-02,-0.01,0.00\n";
        let m = read_returns(data.as_bytes(), &DataConfig::default()).unwrap();
        assert_eq!(m.assets(), &["A".to_string(), "B".to_string()]);
        assert_eq!(m.rows()[0], vec![-0.01, 0.00]);
    }

    #[test]
    fn test_read_returns_honors_delimiter() {
        let data = "date;A;B\n2024-01-02;0.01;0.02\n";
        let config = DataConfig {
            delimiter: Some(b';'),
            ..Default::default()
        };
        let m = read_returns(data.as_bytes(), &config).unwrap();
        assert_eq!(m.rows()[0], vec![0.01, 0.02]);

        let fallback = read_returns(data.as_bytes(), &DataConfig::default());
        assert!(fallback.is_err());
    }

    #[test]
    fn test_ragged_rows_are_rejected() {
        let data = "date,A,B\n2024-01-02,0.01,0.02\n2024-01-03,0.01\n";
        let err = read_returns(data.as_bytes(), &DataConfig::default());
        assert!(matches!(err, Err(BacktestError::CsvError(_))));
    }

    #[test]
    fn test_missing_values_are_rejected() {
        let data = "date,A,B\n2024-01-02,0.01,\n";
        assert!(matches!(
            read_returns(data.as_bytes(), &DataConfig::default()),
            Err(BacktestError::DataError(_))
        ));
    }

    #[test]
    fn test_header_only_is_no_data() {
        assert!(matches!(
            read_returns("date,A\n".as_bytes(), &DataConfig::default()),
            Err(BacktestError::NoData)
        ));
    }

    #[test]
    fn test_load_prices_with_semicolons() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "date;X;Y").unwrap();
        writeln!(file, "2024-01-02;100;50").unwrap();
        writeln!(file, "2024-01-03;110;50").unwrap();
        writeln!(file, "2024-01-04;99;55").unwrap();
        file.flush().unwrap();

        let m = load_prices_csv(file.path(), &DataConfig::default(), ReturnKind::Simple).unwrap();
        assert_eq!(m.len(), 2);
        assert!((m.rows()[0][0] - 0.10).abs() < 1e-12);
        assert!((m.rows()[1][1] - 0.10).abs() < 1e-12);
    }

    #[test]
    fn test_load_returns_csv() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "date,A").unwrap();
        writeln!(file, "2024-01-02,0.5").unwrap();
        file.flush().unwrap();

        let m = load_returns_csv(file.path(), &DataConfig::default()).unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m.column("A").unwrap(), vec![0.5]);
    }
}
