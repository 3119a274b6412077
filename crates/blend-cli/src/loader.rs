use std::path::Path;

use anyhow::{bail, Context, Result};
use blend_core::{DailyRecord, DailySeries};
use chrono::NaiveDate;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];

/// Load one strategy from a CSV file. The strategy id is the file stem.
pub fn load_series(path: &Path) -> Result<DailySeries> {
    let id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .with_context(|| format!("cannot derive a strategy id from {}", path.display()))?;
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_series(id, &raw).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn load_all(paths: &[impl AsRef<Path>]) -> Result<Vec<DailySeries>> {
    paths.iter().map(|p| load_series(p.as_ref())).collect()
}

/// Parse `date,pl,cumulative_pl,account_value` rows (header required).
///
/// Rows are sorted by date; a repeated date is an error.
pub fn parse_series(id: &str, csv_data: &str) -> Result<DailySeries> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(csv_data.as_bytes());

    let mut records = Vec::new();
    for (i, row) in reader.records().enumerate() {
        let row = row?;
        // header is line 1
        let line = i + 2;
        if row.iter().all(|f| f.is_empty()) {
            continue;
        }
        if row.len() < 4 {
            bail!("line {}: expected 4 columns, found {}", line, row.len());
        }

        let date = parse_date(&row[0])
            .with_context(|| format!("line {}: bad date '{}'", line, &row[0]))?;
        let pl = parse_number(&row[1]).with_context(|| format!("line {}: bad pl", line))?;
        let cumulative_pl =
            parse_number(&row[2]).with_context(|| format!("line {}: bad cumulative_pl", line))?;
        let account_value =
            parse_number(&row[3]).with_context(|| format!("line {}: bad account_value", line))?;

        records.push(DailyRecord::new(date, pl, cumulative_pl, account_value));
    }

    if records.is_empty() {
        bail!("{}: no data rows", id);
    }
    records.sort_by_key(|r| r.date);

    Ok(DailySeries::new(id, records)?)
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    // Accept timestamps by keeping only the date part
    let day = raw.split(['T', ' ']).next().unwrap_or(raw);
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(day, fmt).ok())
        .with_context(|| format!("unrecognised date '{}'", raw))
}

/// Plain or currency-formatted number: `1234.5`, `$1,234.50`, `(250.00)`.
fn parse_number(raw: &str) -> Result<f64> {
    let negative = raw.starts_with('(') && raw.ends_with(')');
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | '(' | ')'))
        .collect();
    let value: f64 = cleaned
        .parse()
        .with_context(|| format!("not a number: '{}'", raw))?;
    Ok(if negative { -value } else { value })
}
