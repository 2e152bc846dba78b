// 🧹 Preprocessing - clean an uploaded sheet before tagging
//
// Blank/duplicate row removal, header renames and datatype normalization.
// Conversion is all-or-nothing per column: a column with too many
// unconvertible cells is reported and left as uploaded.

use crate::catalog::{format_bool, format_number, parse_bool, parse_date, parse_number, ColumnCatalog, Datatype};
use crate::dataset::Dataset;
use crate::error::{PipelineError, Result};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Share of non-empty cells allowed to fail before a column is rejected
pub const MAX_UNCONVERTIBLE_SHARE: f64 = 0.1;

/// Share of non-empty cells that must parse for a datatype to be inferred
const INFERENCE_SHARE: f64 = 0.9;

// ============================================================================
// ROWS
// ============================================================================

/// Remove rows whose cells are all empty; returns how many went
pub fn drop_blank_rows(dataset: &mut Dataset) -> usize {
    let before = dataset.len();
    dataset.retain_rows(|row| row.iter().any(|cell| !cell.trim().is_empty()));
    let removed = before - dataset.len();
    if removed > 0 {
        tracing::debug!(removed, "blank rows dropped");
    }
    removed
}

/// Remove exact duplicates, keeping the first occurrence
pub fn drop_duplicate_rows(dataset: &mut Dataset) -> usize {
    let before = dataset.len();
    let mut seen = HashSet::new();
    dataset.retain_rows(|row| seen.insert(Dataset::row_fingerprint(row)));
    let removed = before - dataset.len();
    if removed > 0 {
        tracing::debug!(removed, "duplicate rows dropped");
    }
    removed
}

// ============================================================================
// HEADERS
// ============================================================================

/// Rename columns `from -> to`. Nothing changes unless every source exists
/// and the resulting header has no duplicates.
pub fn rename_columns(dataset: &mut Dataset, mapping: &BTreeMap<String, String>) -> Result<()> {
    let mut header: Vec<String> = dataset.columns().to_vec();
    for (from, to) in mapping {
        let to = to.trim();
        if to.is_empty() {
            return Err(PipelineError::validation(format!("empty target name for column '{from}'")));
        }
        let idx = dataset
            .column_index(from)
            .ok_or_else(|| PipelineError::not_found("column", from.clone()))?;
        header[idx] = to.to_string();
    }

    let mut seen = HashSet::new();
    if let Some(duplicate) = header.iter().find(|name| !seen.insert(name.to_lowercase())) {
        return Err(PipelineError::validation(format!(
            "renaming would produce duplicate column '{duplicate}'"
        )));
    }

    for (from, to) in mapping {
        dataset.rename_column(from, to.trim());
    }
    tracing::info!(renamed = mapping.len(), "columns renamed");
    Ok(())
}

// ============================================================================
// DATATYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnFailure {
    pub column: String,
    pub datatype: Datatype,
    pub unconvertible: usize,
    pub non_empty: usize,
    pub samples: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConversionReport {
    pub converted: Vec<String>,
    pub failed: Vec<ColumnFailure>,
    pub missing: Vec<String>,
    /// Cells blanked in columns that were still converted
    pub blanked_cells: usize,
}

impl ConversionReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.missing.is_empty()
    }
}

/// Canonical text of one cell, None when it does not fit the datatype
pub fn normalize_cell(cell: &str, datatype: Datatype, date_format: &str) -> Option<String> {
    let trimmed = cell.trim();
    match datatype {
        Datatype::Text => Some(if trimmed.eq_ignore_ascii_case("nan") {
            String::new()
        } else {
            trimmed.to_string()
        }),
        Datatype::Number | Datatype::Decimal | Datatype::Currency => parse_number(trimmed).map(format_number),
        Datatype::Date => parse_date(trimmed).map(|d| d.format(date_format).to_string()),
        Datatype::Boolean => parse_bool(trimmed).map(|b| format_bool(b).to_string()),
    }
}

/// Normalize every mapped column in place
pub fn convert_datatypes(
    dataset: &mut Dataset,
    mapping: &BTreeMap<String, Datatype>,
    date_format: &str,
) -> ConversionReport {
    let mut report = ConversionReport::default();

    for (column, datatype) in mapping {
        let Some(values) = dataset.column(column) else {
            report.missing.push(column.clone());
            continue;
        };

        let mut converted = Vec::with_capacity(values.len());
        let mut non_empty = 0;
        let mut failures = Vec::new();
        for value in &values {
            if value.trim().is_empty() {
                converted.push(String::new());
                continue;
            }
            non_empty += 1;
            match normalize_cell(value, *datatype, date_format) {
                Some(cell) => converted.push(cell),
                None => {
                    failures.push(value.to_string());
                    converted.push(String::new());
                }
            }
        }

        if failures.len() as f64 > non_empty as f64 * MAX_UNCONVERTIBLE_SHARE {
            tracing::warn!(
                column = column.as_str(),
                datatype = %datatype,
                unconvertible = failures.len(),
                "column left unconverted"
            );
            report.failed.push(ColumnFailure {
                column: column.clone(),
                datatype: *datatype,
                unconvertible: failures.len(),
                non_empty,
                samples: failures.into_iter().take(5).collect(),
            });
            continue;
        }

        report.blanked_cells += failures.len();
        if dataset.set_column(column, converted).is_ok() {
            report.converted.push(column.clone());
        }
    }

    tracing::info!(
        converted = report.converted.len(),
        failed = report.failed.len(),
        missing = report.missing.len(),
        "datatype conversion finished"
    );
    report
}

/// Best guess for an unmapped column: boolean, number, date, then text
pub fn infer_datatype(values: &[&str]) -> Datatype {
    let non_empty: Vec<&str> = values.iter().map(|v| v.trim()).filter(|v| !v.is_empty()).collect();
    if non_empty.is_empty() {
        return Datatype::Text;
    }
    if non_empty.iter().all(|v| parse_bool(v).is_some()) {
        return Datatype::Boolean;
    }

    let share = |parsed: usize| parsed as f64 / non_empty.len() as f64;
    if share(non_empty.iter().filter(|v| parse_number(v).is_some()).count()) > INFERENCE_SHARE {
        return Datatype::Number;
    }
    if share(non_empty.iter().filter(|v| parse_date(v).is_some()).count()) > INFERENCE_SHARE {
        return Datatype::Date;
    }
    Datatype::Text
}

// ============================================================================
// COLUMN FIXES
// ============================================================================
//
// Targeted rewrites for columns the bulk conversion could not handle. A
// date fix keeps cells it cannot read; numeric and currency fixes are
// all-or-nothing and leave the column untouched on any bad cell.

/// Month-first fallbacks tried after the day-first formats
const MONTH_FIRST_FORMATS: &[&str] = &["%m/%d/%Y", "%m-%d-%Y"];
const MONTH_FIRST_DATETIME_FORMATS: &[&str] = &["%m/%d/%Y %H:%M:%S", "%Y/%m/%d %H:%M:%S"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rounding {
    Up,
    Down,
}

impl Rounding {
    fn apply(self, value: f64) -> f64 {
        match self {
            Rounding::Up => value.ceil(),
            Rounding::Down => value.floor(),
        }
    }
}

/// How a numeric or currency column is rewritten
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NumericFix {
    #[serde(default)]
    pub convert_to_int: bool,
    #[serde(default, alias = "round_off_using")]
    pub rounding: Option<Rounding>,
    /// Currency only: scale, then truncate to a whole number
    #[serde(default)]
    pub whole_number_multiplier: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ColumnFix {
    pub column: String,
    pub converted: usize,
    pub unconvertible: usize,
    pub samples: Vec<String>,
}

/// "yyyy-mm-dd HH:MM:SS" style pattern to a chrono format string.
/// Patterns that already contain `%` are used as given. `MM` next to a
/// colon means minutes, anywhere else it means month.
pub fn date_pattern_to_format(pattern: &str) -> String {
    if pattern.contains('%') {
        return pattern.to_string();
    }
    const TOKENS: &[(&str, &str)] = &[
        ("MMMM", "%B"),
        ("MMM", "%b"),
        ("yyyy", "%Y"),
        ("YYYY", "%Y"),
        ("yy", "%y"),
        ("YY", "%y"),
        ("mm", "%m"),
        ("dd", "%d"),
        ("DD", "%d"),
        ("HH", "%H"),
        ("hh", "%I"),
        ("SS", "%S"),
        ("ss", "%S"),
    ];

    let mut out = String::new();
    let mut rest = pattern;
    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix("MM").filter(|t| !t.starts_with('M')) {
            let after_colon = out.ends_with(':');
            out.push_str(if after_colon || tail.starts_with(':') { "%M" } else { "%m" });
            rest = tail;
            continue;
        }
        match TOKENS.iter().find(|(token, _)| rest.starts_with(token)) {
            Some((token, format)) => {
                out.push_str(format);
                rest = &rest[token.len()..];
            }
            None => {
                let mut chars = rest.chars();
                if let Some(c) = chars.next() {
                    out.push(c);
                }
                rest = chars.as_str();
            }
        }
    }
    out
}

fn parse_with(value: &str, format: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, format)
        .ok()
        .or_else(|| NaiveDate::parse_from_str(value, format).ok().and_then(|d| d.and_hms_opt(0, 0, 0)))
}

/// Rewrite a date column read with `source_pattern` into `date_format`.
/// Cells matching neither the pattern nor a common format are kept.
pub fn reformat_dates(dataset: &mut Dataset, column: &str, source_pattern: &str, date_format: &str) -> Result<ColumnFix> {
    let values = dataset
        .column(column)
        .ok_or_else(|| PipelineError::not_found("column", column))?;
    let source = date_pattern_to_format(source_pattern.trim());

    let mut fix = ColumnFix {
        column: column.to_string(),
        ..ColumnFix::default()
    };
    let mut rewritten = Vec::with_capacity(values.len());
    for value in &values {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            rewritten.push(String::new());
            continue;
        }
        let parsed = parse_with(trimmed, &source)
            .or_else(|| parse_date(trimmed))
            .or_else(|| MONTH_FIRST_FORMATS.iter().find_map(|f| parse_with(trimmed, f)))
            .or_else(|| MONTH_FIRST_DATETIME_FORMATS.iter().find_map(|f| parse_with(trimmed, f)));
        match parsed {
            Some(date) => {
                fix.converted += 1;
                rewritten.push(date.format(date_format).to_string());
            }
            None => {
                fix.unconvertible += 1;
                if fix.samples.len() < 5 {
                    fix.samples.push(trimmed.to_string());
                }
                rewritten.push(value.to_string());
            }
        }
    }

    if fix.converted == 0 && fix.unconvertible > 0 {
        return Err(PipelineError::validation(format!(
            "no value in column '{column}' matches date format '{source_pattern}'"
        )));
    }
    dataset.set_column(column, rewritten)?;
    tracing::info!(column, converted = fix.converted, kept = fix.unconvertible, "date format updated");
    Ok(fix)
}

/// Plain float parse; no symbols or separators allowed
pub fn fix_numeric_column(dataset: &mut Dataset, column: &str, fix: &NumericFix) -> Result<ColumnFix> {
    rewrite_all(dataset, column, "numeric", |cell| {
        let value = cell.parse::<f64>().ok().filter(|v| v.is_finite())?;
        let value = fix.rounding.map_or(value, |r| r.apply(value));
        Some(if fix.convert_to_int {
            format_number(value.trunc())
        } else {
            format_number(value)
        })
    })
}

/// Strip everything but digits, `.` and `-`, then rewrite. Non-integer
/// output keeps two decimals.
pub fn fix_currency_column(dataset: &mut Dataset, column: &str, fix: &NumericFix) -> Result<ColumnFix> {
    if let Some(multiplier) = fix.whole_number_multiplier {
        if !multiplier.is_finite() {
            return Err(PipelineError::validation(format!("invalid whole number multiplier {multiplier}")));
        }
    }
    rewrite_all(dataset, column, "currency", |cell| {
        let value = strip_currency(cell)?;
        if let Some(multiplier) = fix.whole_number_multiplier {
            return Some(format_number((value * multiplier).trunc()));
        }
        let value = fix.rounding.map_or(value, |r| r.apply(value));
        Some(if fix.convert_to_int {
            format_number(value.trunc())
        } else {
            format!("{value:.2}")
        })
    })
}

fn strip_currency(cell: &str) -> Option<f64> {
    let cleaned: String = cell
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    // "1.234.56" keeps its first point only
    let cleaned = match cleaned.split_once('.') {
        Some((whole, fraction)) => format!("{whole}.{}", fraction.replace('.', "")),
        None => cleaned,
    };
    if matches!(cleaned.as_str(), "" | "." | "-" | "-.") {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Every cell must convert; blanks count as failures
fn rewrite_all(
    dataset: &mut Dataset,
    column: &str,
    kind: &str,
    convert: impl Fn(&str) -> Option<String>,
) -> Result<ColumnFix> {
    let values = dataset
        .column(column)
        .ok_or_else(|| PipelineError::not_found("column", column))?;

    let mut fix = ColumnFix {
        column: column.to_string(),
        ..ColumnFix::default()
    };
    let mut rewritten = Vec::with_capacity(values.len());
    for value in &values {
        match convert(value.trim()) {
            Some(cell) => {
                fix.converted += 1;
                rewritten.push(cell);
            }
            None => {
                fix.unconvertible += 1;
                if fix.samples.len() < 5 {
                    fix.samples.push(value.to_string());
                }
            }
        }
    }

    if fix.unconvertible > 0 {
        return Err(PipelineError::validation(format!(
            "{} of {} cells in {kind} column '{column}' are blank or malformed (e.g. {:?})",
            fix.unconvertible,
            values.len(),
            fix.samples
        )));
    }
    dataset.set_column(column, rewritten)?;
    tracing::info!(column, kind, converted = fix.converted, "column rewritten");
    Ok(fix)
}

// ============================================================================
// UPLOAD PREPARATION
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrepareOptions {
    /// Uploaded header -> system column name
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
    #[serde(default)]
    pub drop_duplicates: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PrepareSummary {
    pub blank_rows_dropped: usize,
    pub duplicate_rows_dropped: usize,
    pub conversion: ConversionReport,
}

/// Datatype of every column the catalog knows about
pub fn catalog_mapping(dataset: &Dataset, catalog: &ColumnCatalog) -> BTreeMap<String, Datatype> {
    dataset
        .columns()
        .iter()
        .filter_map(|column| catalog.datatype_of(column).map(|dt| (column.clone(), dt)))
        .collect()
}

/// Blank rows, optional dedup, renames, then conversion of every column
/// the catalog knows about
pub fn prepare_dataset(
    dataset: &mut Dataset,
    options: &PrepareOptions,
    catalog: &ColumnCatalog,
    date_format: &str,
) -> Result<PrepareSummary> {
    let blank_rows_dropped = drop_blank_rows(dataset);
    let duplicate_rows_dropped = if options.drop_duplicates {
        drop_duplicate_rows(dataset)
    } else {
        0
    };
    if !options.rename.is_empty() {
        rename_columns(dataset, &options.rename)?;
    }

    let mapping = catalog_mapping(dataset, catalog);
    let conversion = convert_datatypes(dataset, &mapping, date_format);

    Ok(PrepareSummary {
        blank_rows_dropped,
        duplicate_rows_dropped,
        conversion,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sheet(rows: &[[&str; 3]]) -> Dataset {
        Dataset::from_rows(
            ["Loan No", "Amount", "Disbursed"],
            rows.iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect(),
        )
    }

    #[test]
    fn test_drop_blank_and_duplicate_rows() {
        let mut data = sheet(&[
            ["L1", "100", "01/02/2024"],
            ["", " ", ""],
            ["L1", "100", "01/02/2024"],
            ["L2", "200", "03/02/2024"],
        ]);

        assert_eq!(drop_blank_rows(&mut data), 1);
        assert_eq!(drop_duplicate_rows(&mut data), 1);
        assert_eq!(data.column("Loan No").unwrap(), vec!["L1", "L2"]);
    }

    #[test]
    fn test_rename_rejects_missing_and_duplicate_targets() {
        let mut data = sheet(&[["L1", "100", "01/02/2024"]]);

        let missing = BTreeMap::from([("Loan Id".to_string(), "loan_id".to_string())]);
        assert!(rename_columns(&mut data, &missing).is_err());

        let clash = BTreeMap::from([("Loan No".to_string(), "amount".to_string())]);
        assert!(rename_columns(&mut data, &clash).is_err());
        assert_eq!(data.columns()[0], "Loan No");

        let ok = BTreeMap::from([
            ("Loan No".to_string(), "loan_id".to_string()),
            ("Amount".to_string(), "loan_amount".to_string()),
        ]);
        rename_columns(&mut data, &ok).unwrap();
        assert_eq!(data.columns(), &["loan_id", "loan_amount", "Disbursed"]);
    }

    #[test]
    fn test_convert_normalizes_numbers_and_dates() {
        let mut data = sheet(&[
            ["L1", "₹1,200.50", "2024-02-01"],
            ["L2", "300", "15/01/2024"],
        ]);
        let mapping = BTreeMap::from([
            ("Amount".to_string(), Datatype::Currency),
            ("Disbursed".to_string(), Datatype::Date),
            ("Ghost".to_string(), Datatype::Text),
        ]);

        let report = convert_datatypes(&mut data, &mapping, "%d/%m/%Y");

        assert_eq!(report.converted, vec!["Amount", "Disbursed"]);
        assert_eq!(report.missing, vec!["Ghost"]);
        assert_eq!(data.column("Amount").unwrap(), vec!["1200.5", "300"]);
        assert_eq!(data.column("Disbursed").unwrap(), vec!["01/02/2024", "15/01/2024"]);
    }

    #[test]
    fn test_convert_leaves_column_above_threshold() {
        let mut data = sheet(&[
            ["L1", "100", ""],
            ["L2", "n/a", ""],
            ["L3", "300", ""],
        ]);
        let mapping = BTreeMap::from([("Amount".to_string(), Datatype::Number)]);

        let report = convert_datatypes(&mut data, &mapping, "%d/%m/%Y");

        assert!(!report.is_clean());
        assert_eq!(report.failed[0].unconvertible, 1);
        assert_eq!(report.failed[0].samples, vec!["n/a"]);
        assert_eq!(data.column("Amount").unwrap(), vec!["100", "n/a", "300"]);
    }

    #[test]
    fn test_infer_datatype() {
        assert_eq!(infer_datatype(&["yes", "no", ""]), Datatype::Boolean);
        assert_eq!(infer_datatype(&["1,000", "25.5", "7"]), Datatype::Number);
        assert_eq!(infer_datatype(&["01/02/2024", "2024-03-04"]), Datatype::Date);
        assert_eq!(infer_datatype(&["Pune", "Delhi"]), Datatype::Text);
    }

    #[test]
    fn test_date_pattern_to_format() {
        assert_eq!(date_pattern_to_format("yyyy-mm-dd HH:MM:SS"), "%Y-%m-%d %H:%M:%S");
        assert_eq!(date_pattern_to_format("MM/dd/yyyy"), "%m/%d/%Y");
        assert_eq!(date_pattern_to_format("dd-MMM-yy"), "%d-%b-%y");
        assert_eq!(date_pattern_to_format("%m/%d/%Y"), "%m/%d/%Y");
    }

    #[test]
    fn test_reformat_dates_keeps_unreadable_cells() {
        let mut data = sheet(&[
            ["L1", "100", "2024-02-01 00:00:00"],
            ["L2", "200", "03/15/2024"],
            ["L3", "300", "soon"],
            ["L4", "400", ""],
        ]);

        let fix = reformat_dates(&mut data, "Disbursed", "yyyy-mm-dd HH:MM:SS", "%d/%m/%Y").unwrap();

        assert_eq!((fix.converted, fix.unconvertible), (2, 1));
        assert_eq!(data.column("Disbursed").unwrap(), vec!["01/02/2024", "15/03/2024", "soon", ""]);
    }

    #[test]
    fn test_reformat_dates_rejects_column_with_no_match() {
        let mut data = sheet(&[["L1", "100", "soon"], ["L2", "200", "later"]]);
        let err = reformat_dates(&mut data, "Disbursed", "dd/mm/yyyy", "%d/%m/%Y").unwrap_err();
        assert!(err.is_input_error());
        assert!(reformat_dates(&mut data, "Ghost", "dd/mm/yyyy", "%d/%m/%Y").is_err());
    }

    #[test]
    fn test_numeric_fix_rounds_then_truncates() {
        let mut data = sheet(&[["L1", "12.2", ""], ["L2", "-3.5", ""]]);
        let fix = NumericFix {
            convert_to_int: true,
            rounding: Some(Rounding::Up),
            whole_number_multiplier: None,
        };

        fix_numeric_column(&mut data, "Amount", &fix).unwrap();
        assert_eq!(data.column("Amount").unwrap(), vec!["13", "-3"]);
    }

    #[test]
    fn test_numeric_fix_is_all_or_nothing() {
        let mut data = sheet(&[["L1", "12.2", ""], ["L2", "", ""], ["L3", "1,000", ""]]);

        let err = fix_numeric_column(&mut data, "Amount", &NumericFix::default()).unwrap_err();

        assert!(matches!(err, PipelineError::Validation(ref msg) if msg.contains("2 of 3")));
        assert_eq!(data.column("Amount").unwrap(), vec!["12.2", "", "1,000"]);
    }

    #[test]
    fn test_currency_fix_strips_symbols() {
        let mut data = sheet(&[["L1", "₹1,200.5", ""], ["L2", "$300", ""]]);
        fix_currency_column(&mut data, "Amount", &NumericFix::default()).unwrap();
        assert_eq!(data.column("Amount").unwrap(), vec!["1200.50", "300.00"]);

        let lakhs = NumericFix {
            whole_number_multiplier: Some(100000.0),
            ..NumericFix::default()
        };
        let mut data = sheet(&[["L1", "₹12.5", ""], ["L2", "0.333333", ""]]);
        fix_currency_column(&mut data, "Amount", &lakhs).unwrap();
        assert_eq!(data.column("Amount").unwrap(), vec!["1250000", "33333"]);
    }

    #[test]
    fn test_numeric_fix_parses_rounding_alias() {
        let fix: NumericFix = serde_json::from_str(r#"{"convert_to_int": true, "round_off_using": "down"}"#).unwrap();
        assert_eq!(fix.rounding, Some(Rounding::Down));
    }
}
