// 🔎 Conditions - single-column tests over typed cells
// A condition never fails: unparseable cells or a missing column simply
// do not match.

use crate::catalog::{parse_bool, parse_date, parse_number, ColumnCatalog, Datatype};
use crate::dataset::{Dataset, Mask};
use crate::error::{PipelineError, Result};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// OPERATOR
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Operator {
    EqualTo,
    NotEqualTo,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    Contains,
    NotContains,
    Includes,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::EqualTo => "equal_to",
            Operator::NotEqualTo => "not_equal_to",
            Operator::GreaterThan => "greater_than",
            Operator::LessThan => "less_than",
            Operator::GreaterOrEqual => "greater_or_equal",
            Operator::LessOrEqual => "less_or_equal",
            Operator::Contains => "contains",
            Operator::NotContains => "not_contains",
            Operator::Includes => "includes",
        }
    }

    fn is_ordering(&self) -> bool {
        matches!(
            self,
            Operator::GreaterThan | Operator::LessThan | Operator::GreaterOrEqual | Operator::LessOrEqual
        )
    }

    fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            Operator::EqualTo => ordering == Ordering::Equal,
            Operator::NotEqualTo => ordering != Ordering::Equal,
            Operator::GreaterThan => ordering == Ordering::Greater,
            Operator::LessThan => ordering == Ordering::Less,
            Operator::GreaterOrEqual => ordering != Ordering::Less,
            Operator::LessOrEqual => ordering != Ordering::Greater,
            Operator::Contains | Operator::NotContains | Operator::Includes => false,
        }
    }
}

impl FromStr for Operator {
    type Err = PipelineError;

    /// Accepts the spellings used by both rule editors ("equal to",
    /// "equal_to", "equals", "greater than or equal", ">=", ...)
    fn from_str(raw: &str) -> Result<Self> {
        let normalized = raw
            .trim()
            .to_lowercase()
            .replace('_', " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");

        let operator = match normalized.as_str() {
            "equal to" | "equals" | "equal" | "eq" | "=" | "==" => Operator::EqualTo,
            "not equal to" | "not equal" | "not equals" | "ne" | "!=" | "<>" => Operator::NotEqualTo,
            "greater than" | "gt" | ">" => Operator::GreaterThan,
            "less than" | "lt" | "<" => Operator::LessThan,
            "greater than or equal" | "greater than or equal to" | "greater or equal" | "gte"
            | ">=" => Operator::GreaterOrEqual,
            "less than or equal" | "less than or equal to" | "less or equal" | "lte" | "<=" => {
                Operator::LessOrEqual
            }
            "contains" => Operator::Contains,
            "not contains" | "does not contain" => Operator::NotContains,
            "includes" | "include" => Operator::Includes,
            _ => {
                return Err(PipelineError::validation(format!(
                    "unsupported operator '{}'",
                    raw.trim()
                )))
            }
        };
        Ok(operator)
    }
}

impl TryFrom<String> for Operator {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Operator> for String {
    fn from(operator: Operator) -> String {
        operator.as_str().to_string()
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CONNECTOR / OUTCOME
// ============================================================================

/// How a condition combines with the NEXT one in its group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE", try_from = "String")]
pub enum Connector {
    #[default]
    And,
    Or,
    Then,
}

impl FromStr for Connector {
    type Err = PipelineError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_uppercase().as_str() {
            "AND" | "&&" => Ok(Connector::And),
            "OR" | "||" => Ok(Connector::Or),
            "THEN" => Ok(Connector::Then),
            other => Err(PipelineError::validation(format!("unsupported connector '{other}'"))),
        }
    }
}

impl TryFrom<String> for Connector {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// What a rule group does with its matched rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Outcome {
    Accept,
    #[default]
    Reject,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Accept => "accept",
            Outcome::Reject => "reject",
        }
    }
}

impl FromStr for Outcome {
    type Err = PipelineError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "accept" => Ok(Outcome::Accept),
            "reject" => Ok(Outcome::Reject),
            other => Err(PipelineError::validation(format!("unsupported rule action '{other}'"))),
        }
    }
}

impl TryFrom<String> for Outcome {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CONDITION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub column: String,

    pub operator: Operator,

    /// Literal compared against each cell (numbers and booleans arrive as text)
    #[serde(default, deserialize_with = "literal_text")]
    pub value: String,

    #[serde(default, deserialize_with = "blank_as_none", skip_serializing_if = "Option::is_none")]
    pub connector: Option<Connector>,

    /// Only meaningful on the last condition of a group
    #[serde(default, deserialize_with = "blank_as_none", skip_serializing_if = "Option::is_none")]
    pub then: Option<Outcome>,
}

impl Condition {
    pub fn new(column: impl Into<String>, operator: Operator, value: impl Into<String>) -> Self {
        Condition {
            column: column.into(),
            operator,
            value: value.into(),
            connector: None,
            then: None,
        }
    }

    pub fn connector(mut self, connector: Connector) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Marks the terminal condition: sets THEN and the group's action
    pub fn then(mut self, outcome: Outcome) -> Self {
        self.connector = Some(Connector::Then);
        self.then = Some(outcome);
        self
    }
}

/// Empty strings and nulls mean "not set"
pub(crate) fn blank_as_none<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => text.parse().map(Some).map_err(de::Error::custom),
    }
}

/// Literal values may be strings, numbers, booleans or null
pub(crate) fn literal_text<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(json_to_text(&value))
}

pub(crate) fn json_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(text) => text.clone(),
        serde_json::Value::Bool(flag) => flag.to_string(),
        serde_json::Value::Number(number) => number.to_string(),
        other => other.to_string(),
    }
}

// ============================================================================
// EVALUATION
// ============================================================================

/// Compare one cell against a literal under the column's datatype
pub fn compare_cell(cell: &str, operator: Operator, literal: &str, datatype: Datatype) -> bool {
    match operator {
        Operator::Contains | Operator::Includes => contains_ci(cell, literal),
        Operator::NotContains => !contains_ci(cell, literal),
        Operator::NotEqualTo => !compare_cell(cell, Operator::EqualTo, literal, datatype),
        _ => match datatype {
            Datatype::Date => compare_dates(cell, operator, literal),
            Datatype::Number | Datatype::Decimal | Datatype::Currency => {
                compare_numbers(cell, operator, literal)
            }
            Datatype::Boolean => compare_booleans(cell, operator, literal),
            Datatype::Text => compare_text(cell, operator, literal),
        },
    }
}

fn contains_ci(cell: &str, literal: &str) -> bool {
    cell.to_lowercase().contains(&literal.to_lowercase())
}

fn compare_dates(cell: &str, operator: Operator, literal: &str) -> bool {
    match (parse_date(cell), parse_date(literal)) {
        (Some(left), Some(right)) => operator.accepts(left.cmp(&right)),
        _ => false,
    }
}

fn compare_numbers(cell: &str, operator: Operator, literal: &str) -> bool {
    let Some(right) = parse_number(literal) else {
        // Non-numeric literal against a numeric column: equality falls back to text
        return !operator.is_ordering() && compare_text(cell, operator, literal);
    };
    match parse_number(cell).and_then(|left| left.partial_cmp(&right)) {
        Some(ordering) => operator.accepts(ordering),
        None => false,
    }
}

fn compare_booleans(cell: &str, operator: Operator, literal: &str) -> bool {
    match (parse_bool(cell), parse_bool(literal)) {
        (Some(left), Some(right)) if !operator.is_ordering() => operator.accepts(left.cmp(&right)),
        _ => compare_text(cell, operator, literal),
    }
}

fn compare_text(cell: &str, operator: Operator, literal: &str) -> bool {
    if operator.is_ordering() {
        // Ordering on text columns only makes sense for numeric-looking cells
        return match (parse_number(cell), parse_number(literal)) {
            (Some(left), Some(right)) => left
                .partial_cmp(&right)
                .map(|ordering| operator.accepts(ordering))
                .unwrap_or(false),
            _ => false,
        };
    }
    let equal = cell.trim().to_lowercase() == literal.trim().to_lowercase();
    operator.accepts(if equal { Ordering::Equal } else { Ordering::Less })
}

/// Evaluate an operator over a column's values
pub fn evaluate_values(values: &[&str], operator: Operator, literal: &str, datatype: Datatype) -> Mask {
    Mask::from_fn(values.len(), |i| compare_cell(values[i], operator, literal, datatype))
}

/// Evaluate one condition; a column absent from the dataset matches nothing
pub fn evaluate_condition(dataset: &Dataset, condition: &Condition, catalog: &ColumnCatalog) -> Mask {
    let column = condition.column.trim();
    let Some(values) = dataset.column(column) else {
        tracing::debug!(column, "condition references a missing column; no rows match");
        return Mask::all(dataset.len(), false);
    };
    let datatype = catalog.datatype_of(column).unwrap_or_default();
    evaluate_values(&values, condition.operator, &condition.value, datatype)
}
