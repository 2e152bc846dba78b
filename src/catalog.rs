// 🏛️ Column Catalog - system columns and their datatypes
// The catalog decides how a column's cells are compared: numbers, dates
// (day first), booleans or plain text.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ============================================================================
// DATATYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    #[default]
    Text,
    Number,
    Decimal,
    Date,
    Boolean,
    Currency,
}

impl Datatype {
    /// Parse the datatype names found in system column documents
    pub fn parse(name: &str) -> Option<Datatype> {
        match name.trim().to_lowercase().as_str() {
            "text" | "string" | "varchar" | "str" => Some(Datatype::Text),
            "number" | "numeric" | "float" | "integer" | "int" => Some(Datatype::Number),
            "decimal" => Some(Datatype::Decimal),
            "date" | "datetime" => Some(Datatype::Date),
            "boolean" | "bool" => Some(Datatype::Boolean),
            "currency" | "money" => Some(Datatype::Currency),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Datatype::Text => "text",
            Datatype::Number => "number",
            Datatype::Decimal => "decimal",
            Datatype::Date => "date",
            Datatype::Boolean => "boolean",
            Datatype::Currency => "currency",
        }
    }

    /// Number, decimal and currency all compare as parsed floats
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Datatype::Number | Datatype::Decimal | Datatype::Currency
        )
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SYSTEM COLUMNS
// ============================================================================

/// One entry of the externally managed system column list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemColumn {
    pub column_name: String,
    pub datatype: String,

    #[serde(default)]
    pub is_currency: bool,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub alt_names: Vec<String>,
}

impl SystemColumn {
    pub fn new(column_name: impl Into<String>, datatype: Datatype) -> Self {
        SystemColumn {
            column_name: column_name.into(),
            datatype: datatype.as_str().to_string(),
            is_currency: datatype == Datatype::Currency,
            description: String::new(),
            alt_names: Vec::new(),
        }
    }
}

// ============================================================================
// CATALOG
// ============================================================================

/// column_name -> datatype, consulted by the evaluators
#[derive(Debug, Clone, Default)]
pub struct ColumnCatalog {
    types: HashMap<String, Datatype>,
}

impl ColumnCatalog {
    pub fn new() -> Self {
        ColumnCatalog::default()
    }

    /// Build from system columns; unknown datatype names are skipped
    pub fn from_columns(columns: &[SystemColumn]) -> Self {
        let mut catalog = ColumnCatalog::new();
        for column in columns {
            let name = column.column_name.trim();
            if name.is_empty() {
                continue;
            }
            let Some(mut datatype) = Datatype::parse(&column.datatype) else {
                tracing::warn!(
                    column = name,
                    datatype = %column.datatype,
                    "unsupported datatype in system column"
                );
                continue;
            };
            if column.is_currency && datatype.is_numeric() {
                datatype = Datatype::Currency;
            }
            catalog.types.insert(name.to_string(), datatype);
        }
        catalog
    }

    /// Builder: register one column
    pub fn with(mut self, column: impl Into<String>, datatype: Datatype) -> Self {
        self.insert(column, datatype);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, datatype: Datatype) {
        self.types.insert(column.into(), datatype);
    }

    /// Overlay per-dataset datatypes (e.g. calculated columns); these win
    pub fn overlay<'a, I>(&self, overrides: I) -> ColumnCatalog
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut merged = self.clone();
        for (column, name) in overrides {
            if let Some(datatype) = Datatype::parse(name) {
                merged.types.insert(column.clone(), datatype);
            }
        }
        merged
    }

    pub fn datatype_of(&self, column: &str) -> Option<Datatype> {
        self.types.get(column).copied()
    }

    pub fn is_date(&self, column: &str) -> bool {
        self.datatype_of(column) == Some(Datatype::Date)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

// ============================================================================
// CELL PARSING
// ============================================================================

const DATE_FORMATS: &[&str] = &[
    "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%Y-%m-%d", "%Y/%m/%d", "%d-%b-%Y", "%d %b %Y",
    "%d %B %Y",
];

const DATETIME_FORMATS: &[&str] = &[
    "%d/%m/%Y %H:%M:%S",
    "%d-%m-%Y %H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// Parse a date with the day-first convention (dd/mm/yyyy wins over mm/dd/yyyy)
pub fn parse_date(raw: &str) -> Option<NaiveDateTime> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }

    for format in DATETIME_FORMATS {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(value, format) {
            return Some(datetime);
        }
    }

    chrono::DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.naive_utc())
}

/// Parse a number, ignoring currency symbols and thousands separators.
/// Accounting negatives "(1,200)" are read as -1200.
pub fn parse_number(raw: &str) -> Option<f64> {
    let mut value = raw.trim();
    if value.is_empty() {
        return None;
    }

    let mut negative = false;
    if value.starts_with('(') && value.ends_with(')') && value.len() > 2 {
        negative = true;
        value = &value[1..value.len() - 1];
    }

    let cleaned: String = value
        .chars()
        .filter(|c| !matches!(c, '$' | '£' | '€' | '¥' | '₹' | ',' | '_' | '\'') && !c.is_whitespace())
        .collect();

    // Currency codes like "INR", "Rs." or "USD" around the figure
    let without_code = cleaned.trim_start_matches(|c: char| c.is_alphabetic());
    let without_code = if without_code.len() != cleaned.len() {
        without_code.strip_prefix('.').unwrap_or(without_code)
    } else {
        without_code
    };
    let cleaned = without_code.trim_end_matches(|c: char| c.is_alphabetic());

    let parsed: f64 = cleaned.parse().ok()?;
    if !parsed.is_finite() {
        return None;
    }
    Some(if negative { -parsed } else { parsed })
}

/// Map the usual boolean spellings (true/yes/1/t/y and their negatives)
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "yes" | "1" | "t" | "y" => Some(true),
        "false" | "no" | "0" | "f" | "n" => Some(false),
        _ => None,
    }
}

/// Render a float the way written files expect (no trailing ".0" noise)
pub fn format_number(value: f64) -> String {
    if value == 0.0 {
        "0".to_string()
    } else {
        format!("{value}")
    }
}

/// Booleans are stored capitalised, matching the uploaded sheets
pub fn format_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}
