// 🧮 Calculated Columns - derive a new column from rule fragments
//
// Fragments are classified once at parse time (boolean marker,
// calculation, accumulating condition, terminal condition) and then
// replayed in order against the dataset. Conditions accumulate a pending
// mask; calculations write numbers to the masked rows (or all rows);
// a terminal condition writes the declared boolean and its negation.

use crate::catalog::{format_bool, format_number, parse_bool, parse_number, ColumnCatalog, Datatype};
use crate::condition::{compare_cell, json_to_text, Connector, Operator};
use crate::dataset::{Dataset, Mask};
use crate::error::{PipelineError, Result};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Placeholder users type to reference the column being built
pub const NEW_COLUMN_PLACEHOLDER: &str = "column being created";

// ============================================================================
// FRAGMENT TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalcOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Power,
}

impl CalcOp {
    /// None for null results (NaN, infinities, division by zero)
    pub fn apply(&self, left: f64, right: f64) -> Option<f64> {
        let result = match self {
            CalcOp::Add => left + right,
            CalcOp::Subtract => left - right,
            CalcOp::Multiply => left * right,
            CalcOp::Divide if right == 0.0 => return None,
            CalcOp::Divide => left / right,
            CalcOp::Modulo if right == 0.0 => return None,
            // Floored modulo: the result takes the divisor's sign
            CalcOp::Modulo => left - right * (left / right).floor(),
            CalcOp::Power => left.powf(right),
        };
        result.is_finite().then_some(result)
    }
}

impl FromStr for CalcOp {
    type Err = PipelineError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "add" | "addition" | "plus" | "+" => Ok(CalcOp::Add),
            "subtract" | "subtraction" | "minus" | "-" => Ok(CalcOp::Subtract),
            "multiply" | "multiplication" | "times" | "*" => Ok(CalcOp::Multiply),
            "divide" | "division" | "/" => Ok(CalcOp::Divide),
            "modulo" | "mod" | "%" => Ok(CalcOp::Modulo),
            "power" | "pow" | "^" | "**" => Ok(CalcOp::Power),
            other => Err(PipelineError::validation(format!("unsupported calculation '{other}'"))),
        }
    }
}

/// Column reference that may point at the column under construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRef {
    NewColumn,
    Named(String),
}

impl ColumnRef {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case(NEW_COLUMN_PLACEHOLDER) {
            ColumnRef::NewColumn
        } else {
            ColumnRef::Named(trimmed.to_string())
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnRef::NewColumn => f.write_str(NEW_COLUMN_PLACEHOLDER),
            ColumnRef::Named(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Static(String),
    Column(ColumnRef),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    /// Declares a boolean outcome and the value written to matched rows
    BooleanMarker { value: bool },
    Calculation {
        column: ColumnRef,
        op: CalcOp,
        operand: Operand,
        /// AND/OR keep a pending condition mask alive past this calculation
        connector: Option<Connector>,
    },
    /// AND/OR condition feeding the pending mask
    Condition {
        column: ColumnRef,
        operator: Operator,
        operand: Operand,
        connector: Connector,
    },
    /// THEN condition writing the boolean column
    Terminal {
        column: ColumnRef,
        operator: Operator,
        operand: Operand,
    },
}

impl Fragment {
    pub fn boolean(value: bool) -> Self {
        Fragment::BooleanMarker { value }
    }

    pub fn calculation(column: &str, op: CalcOp, operand: Operand) -> Self {
        Fragment::Calculation {
            column: ColumnRef::parse(column),
            op,
            operand,
            connector: None,
        }
    }

    pub fn condition(column: &str, operator: Operator, operand: Operand, connector: Connector) -> Self {
        match connector {
            Connector::Then => Fragment::Terminal {
                column: ColumnRef::parse(column),
                operator,
                operand,
            },
            _ => Fragment::Condition {
                column: ColumnRef::parse(column),
                operator,
                operand,
                connector,
            },
        }
    }

    fn column(&self) -> Option<&ColumnRef> {
        match self {
            Fragment::BooleanMarker { .. } => None,
            Fragment::Calculation { column, .. }
            | Fragment::Condition { column, .. }
            | Fragment::Terminal { column, .. } => Some(column),
        }
    }

    fn operand(&self) -> Option<&Operand> {
        match self {
            Fragment::BooleanMarker { .. } => None,
            Fragment::Calculation { operand, .. }
            | Fragment::Condition { operand, .. }
            | Fragment::Terminal { operand, .. } => Some(operand),
        }
    }
}

// ============================================================================
// PARSING
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawFragment {
    #[serde(default, alias = "column")]
    column_one: Option<String>,
    #[serde(default)]
    operator: Option<String>,
    #[serde(default)]
    value: Value,
    #[serde(default, alias = "valueType")]
    value_type: Option<String>,
    #[serde(default)]
    connector: Option<String>,
    #[serde(default, alias = "isBoolean")]
    is_boolean: Option<Value>,
    #[serde(default, alias = "booleanValue")]
    boolean_value: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawItem {
    Wrapped(Vec<RawFragment>),
    Single(RawFragment),
}

fn truthy(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Null => None,
        other => parse_bool(&json_to_text(other)),
    }
}

impl RawFragment {
    fn is_marker(&self) -> bool {
        let flagged = self.is_boolean.as_ref().and_then(truthy).unwrap_or(false);
        let static_value = self
            .value_type
            .as_deref()
            .map_or(true, |t| t.trim().eq_ignore_ascii_case("static"));
        let no_column = self.column_one.as_deref().map_or(true, |c| c.trim().is_empty());
        flagged || (static_value && self.boolean_value.is_some() && no_column)
    }

    fn into_fragment(self) -> Result<Fragment> {
        if self.is_marker() {
            let value = self.boolean_value.as_ref().and_then(truthy).unwrap_or(true);
            return Ok(Fragment::BooleanMarker { value });
        }

        let column = self
            .column_one
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| PipelineError::validation("rule fragment is missing column_one"))?;
        let operator = self
            .operator
            .filter(|o| !o.trim().is_empty())
            .ok_or_else(|| PipelineError::validation(format!("rule on '{column}' is missing an operator")))?;

        let value = json_to_text(&self.value);
        let operand = match self.value_type.as_deref().map(|t| t.trim().to_lowercase()) {
            Some(kind) if kind == "column" => Operand::Column(ColumnRef::parse(&value)),
            _ => Operand::Static(value),
        };
        let connector = match self.connector.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(raw.parse::<Connector>()?),
        };

        if let Ok(op) = operator.parse::<CalcOp>() {
            return Ok(Fragment::Calculation {
                column: ColumnRef::parse(&column),
                op,
                operand,
                connector,
            });
        }

        let operator: Operator = operator.parse()?;
        // A condition without a connector closes the rule set
        Ok(Fragment::condition(
            &column,
            operator,
            operand,
            connector.unwrap_or(Connector::Then),
        ))
    }
}

/// Parse a rule list; items may be bare objects or one-element arrays
pub fn parse_fragments(content: &str) -> Result<Vec<Fragment>> {
    let items: Vec<RawItem> = serde_json::from_str(content)?;
    fragments_from_items(items)
}

pub fn fragments_from_value(value: Value) -> Result<Vec<Fragment>> {
    let items: Vec<RawItem> = serde_json::from_value(value)?;
    fragments_from_items(items)
}

fn fragments_from_items(items: Vec<RawItem>) -> Result<Vec<Fragment>> {
    let mut fragments = Vec::new();
    for item in items {
        let raw = match item {
            RawItem::Single(raw) => raw,
            RawItem::Wrapped(list) => match list.into_iter().next() {
                Some(raw) => raw,
                None => continue,
            },
        };
        fragments.push(raw.into_fragment()?);
    }
    if fragments.is_empty() {
        return Err(PipelineError::validation("rule list is empty"));
    }
    Ok(fragments)
}

// ============================================================================
// BUILDER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Cell {
    Null,
    Number(f64),
    Bool(bool),
}

impl Cell {
    fn render(&self) -> String {
        match self {
            Cell::Null => String::new(),
            Cell::Number(value) => format_number(*value),
            Cell::Bool(flag) => format_bool(*flag).to_string(),
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Cell::Number(value) => Some(*value),
            _ => None,
        }
    }
}

/// Result of a successful build
#[derive(Debug, Clone)]
pub struct BuiltColumn {
    pub dataset: Dataset,
    pub datatype: Datatype,
    pub rules_processed: usize,
}

struct Builder<'a> {
    dataset: &'a Dataset,
    name: &'a str,
    catalog: &'a ColumnCatalog,
    cells: Vec<Cell>,
}

impl<'a> Builder<'a> {
    fn text_values(&self, column: &ColumnRef) -> Result<Vec<String>> {
        match column {
            ColumnRef::NewColumn => Ok(self.cells.iter().map(Cell::render).collect()),
            ColumnRef::Named(name) if name == self.name => {
                Ok(self.cells.iter().map(Cell::render).collect())
            }
            ColumnRef::Named(name) => self
                .dataset
                .column(name)
                .map(|values| values.into_iter().map(str::to_string).collect())
                .ok_or_else(|| PipelineError::not_found("column", name.clone())),
        }
    }

    fn number_values(&self, column: &ColumnRef) -> Result<Vec<Option<f64>>> {
        if self.is_new(column) {
            return Ok(self.cells.iter().map(Cell::as_number).collect());
        }
        Ok(self
            .text_values(column)?
            .iter()
            .map(|cell| parse_number(cell))
            .collect())
    }

    fn is_new(&self, column: &ColumnRef) -> bool {
        match column {
            ColumnRef::NewColumn => true,
            ColumnRef::Named(name) => name == self.name,
        }
    }

    fn operand_text(&self, operand: &Operand) -> Result<Vec<String>> {
        match operand {
            Operand::Static(value) => Ok(vec![value.clone(); self.dataset.len()]),
            Operand::Column(column) => self.text_values(column),
        }
    }

    fn operand_numbers(&self, operand: &Operand) -> Result<Vec<Option<f64>>> {
        match operand {
            Operand::Static(value) => Ok(vec![parse_number(value); self.dataset.len()]),
            Operand::Column(column) => self.number_values(column),
        }
    }

    fn datatype_of(&self, column: &ColumnRef) -> Datatype {
        match column {
            ColumnRef::Named(name) if !self.is_new(column) => {
                self.catalog.datatype_of(name).unwrap_or(Datatype::Number)
            }
            _ => Datatype::Number,
        }
    }

    fn evaluate(&self, column: &ColumnRef, operator: Operator, operand: &Operand) -> Result<Mask> {
        let left = self.text_values(column)?;
        let right = self.operand_text(operand)?;
        let datatype = self.datatype_of(column);
        Ok(Mask::from_fn(left.len(), |i| {
            compare_cell(&left[i], operator, &right[i], datatype)
        }))
    }

    fn calculate(&self, column: &ColumnRef, op: CalcOp, operand: &Operand) -> Result<Vec<Option<f64>>> {
        let left = self.number_values(column)?;
        let right = self.operand_numbers(operand)?;
        Ok(left
            .iter()
            .zip(&right)
            .map(|(l, r)| match (l, r) {
                (Some(l), Some(r)) => op.apply(*l, *r),
                _ => None,
            })
            .collect())
    }

    fn write_bool(&mut self, mask: &Mask, value: bool) {
        for (i, cell) in self.cells.iter_mut().enumerate() {
            *cell = Cell::Bool(if mask.get(i) { value } else { !value });
        }
    }
}

fn combine(pending: Mask, next: &Mask, connector: Option<Connector>) -> Mask {
    let mut mask = pending;
    match connector {
        Some(Connector::Or) => mask |= next,
        _ => mask &= next,
    }
    mask
}

/// Build `name` on a copy of `dataset` from the fragment list.
///
/// Fails without touching the dataset when a referenced column is missing,
/// when the column under construction is used by the first fragment, or
/// when a boolean result is declared but only calculations are present.
pub fn build_column(
    dataset: &Dataset,
    name: &str,
    fragments: &[Fragment],
    catalog: &ColumnCatalog,
) -> Result<BuiltColumn> {
    let name = name.trim();
    if name.is_empty() {
        return Err(PipelineError::validation("new column name is required"));
    }

    let marker = fragments.iter().find_map(|f| match f {
        Fragment::BooleanMarker { value } => Some(*value),
        _ => None,
    });
    let has_calculation = fragments.iter().any(|f| matches!(f, Fragment::Calculation { .. }));
    let has_condition = fragments
        .iter()
        .any(|f| matches!(f, Fragment::Condition { .. } | Fragment::Terminal { .. }));
    if marker.is_some() && has_calculation && !has_condition {
        return Err(PipelineError::BooleanExpected {
            column: name.to_string(),
        });
    }

    let mut builder = Builder {
        dataset,
        name,
        catalog,
        cells: vec![Cell::Null; dataset.len()],
    };
    let boolean_value = marker.unwrap_or(true);
    let mut datatype = Datatype::Text;
    let mut pending: Option<Mask> = None;
    let mut previous: Option<Connector> = None;
    let mut processed = 0;

    for fragment in fragments {
        let Some(column) = fragment.column() else {
            continue;
        };
        if processed == 0 {
            let operand_is_new = matches!(
                fragment.operand(),
                Some(Operand::Column(c)) if builder.is_new(c)
            );
            if builder.is_new(column) || operand_is_new {
                return Err(PipelineError::validation(format!(
                    "cannot use column being created '{name}' in the first rule"
                )));
            }
        }
        processed += 1;

        match fragment {
            Fragment::BooleanMarker { .. } => {}
            Fragment::Terminal {
                column,
                operator,
                operand,
            } => {
                let mask = builder.evaluate(column, *operator, operand)?;
                let mask = match pending.take() {
                    Some(acc) => combine(acc, &mask, previous),
                    None => mask,
                };
                builder.write_bool(&mask, boolean_value);
                datatype = Datatype::Boolean;
                previous = None;
            }
            Fragment::Condition {
                column,
                operator,
                operand,
                connector,
            } => {
                let mask = builder.evaluate(column, *operator, operand)?;
                pending = Some(match pending.take() {
                    Some(acc) => combine(acc, &mask, previous),
                    None => mask,
                });
                previous = Some(*connector);
            }
            Fragment::Calculation {
                column,
                op,
                operand,
                connector,
            } => {
                let results = builder.calculate(column, *op, operand)?;
                for (i, result) in results.into_iter().enumerate() {
                    if pending.as_ref().map_or(true, |mask| mask.get(i)) {
                        builder.cells[i] = result.map_or(Cell::Null, Cell::Number);
                    }
                }
                datatype = Datatype::Number;

                if matches!(connector, Some(Connector::And | Connector::Or)) {
                    previous = *connector;
                } else {
                    pending = None;
                    previous = None;
                }
            }
        }
    }

    // Conditions left without a THEN still produce the declared boolean
    match (pending.as_ref(), marker.is_some()) {
        (Some(mask), true) => builder.write_bool(mask, boolean_value),
        (Some(_), false) => {
            return Err(PipelineError::validation(format!(
                "column '{name}' ends with conditions without a THEN"
            )))
        }
        _ => {}
    }
    if marker.is_some() {
        datatype = Datatype::Boolean;
    }

    let values: Vec<String> = builder.cells.iter().map(Cell::render).collect();
    let mut output = dataset.clone();
    output.set_column(name, values)?;

    tracing::info!(column = name, datatype = %datatype, rows = output.len(), "calculated column built");
    Ok(BuiltColumn {
        dataset: output,
        datatype,
        rules_processed: processed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loans() -> Dataset {
        Dataset::from_rows(
            ["principal", "interest", "tenure", "city"],
            vec![
                vec!["1000".into(), "100".into(), "12".into(), "Pune".into()],
                vec!["2000".into(), "300".into(), "0".into(), "Delhi".into()],
                vec!["500".into(), "".into(), "6".into(), "Pune".into()],
            ],
        )
    }

    fn stat(value: &str) -> Operand {
        Operand::Static(value.to_string())
    }

    fn col(name: &str) -> Operand {
        Operand::Column(ColumnRef::parse(name))
    }

    #[test]
    fn test_calculation_between_columns() {
        let fragments = vec![Fragment::calculation("principal", CalcOp::Add, col("interest"))];
        let built = build_column(&loans(), "total", &fragments, &ColumnCatalog::new()).unwrap();

        assert_eq!(built.datatype, Datatype::Number);
        assert_eq!(built.dataset.column("total").unwrap(), vec!["1100", "2300", ""]);
    }

    #[test]
    fn test_divide_by_zero_is_null() {
        let fragments = vec![Fragment::calculation("principal", CalcOp::Divide, col("tenure"))];
        let built = build_column(&loans(), "emi", &fragments, &ColumnCatalog::new()).unwrap();
        let emi = built.dataset.column("emi").unwrap();

        assert_eq!(emi[1], "");
        assert!(emi[0].starts_with("83.33"));
    }

    #[test]
    fn test_modulo_takes_divisor_sign() {
        assert_eq!(CalcOp::Modulo.apply(-7.0, 3.0), Some(2.0));
        assert_eq!(CalcOp::Modulo.apply(7.0, -3.0), Some(-2.0));
        assert_eq!(CalcOp::Modulo.apply(7.0, 0.0), None);
        assert_eq!(CalcOp::Power.apply(2.0, 10.0), Some(1024.0));
    }

    #[test]
    fn test_terminal_writes_boolean_and_negation() {
        let fragments = vec![
            Fragment::boolean(true),
            Fragment::condition("principal", Operator::GreaterThan, stat("800"), Connector::Then),
        ];
        let built = build_column(&loans(), "big", &fragments, &ColumnCatalog::new()).unwrap();

        assert_eq!(built.datatype, Datatype::Boolean);
        assert_eq!(built.dataset.column("big").unwrap(), vec!["True", "True", "False"]);
    }

    #[test]
    fn test_false_marker_inverts_output() {
        let fragments = vec![
            Fragment::boolean(false),
            Fragment::condition("principal", Operator::GreaterThan, stat("800"), Connector::Then),
        ];
        let built = build_column(&loans(), "small", &fragments, &ColumnCatalog::new()).unwrap();
        assert_eq!(built.dataset.column("small").unwrap(), vec!["False", "False", "True"]);
    }

    #[test]
    fn test_pending_or_combines_with_terminal() {
        let catalog = ColumnCatalog::new().with("city", Datatype::Text);
        let fragments = vec![
            Fragment::condition("city", Operator::EqualTo, stat("delhi"), Connector::Or),
            Fragment::condition("principal", Operator::LessThan, stat("600"), Connector::Then),
        ];
        let built = build_column(&loans(), "flag", &fragments, &catalog).unwrap();
        assert_eq!(built.dataset.column("flag").unwrap(), vec!["False", "True", "True"]);
    }

    #[test]
    fn test_and_chain_into_terminal() {
        let catalog = ColumnCatalog::new().with("city", Datatype::Text);
        let fragments = vec![
            Fragment::condition("city", Operator::EqualTo, stat("pune"), Connector::And),
            Fragment::condition("tenure", Operator::GreaterThan, stat("0"), Connector::And),
            Fragment::condition("principal", Operator::GreaterThan, stat("800"), Connector::Then),
        ];
        let built = build_column(&loans(), "eligible", &fragments, &catalog).unwrap();

        assert_eq!(built.datatype, Datatype::Boolean);
        assert_eq!(built.dataset.column("eligible").unwrap(), vec!["True", "False", "False"]);
    }

    #[test]
    fn test_conditions_without_then_are_rejected() {
        let catalog = ColumnCatalog::new().with("city", Datatype::Text);
        let fragments = vec![
            Fragment::condition("city", Operator::EqualTo, stat("pune"), Connector::And),
            Fragment::condition("principal", Operator::GreaterThan, stat("800"), Connector::Or),
        ];
        let err = build_column(&loans(), "dangling", &fragments, &catalog).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(ref msg) if msg.contains("without a THEN")));
    }

    #[test]
    fn test_calculation_under_pending_mask_only_touches_matched_rows() {
        let catalog = ColumnCatalog::new().with("city", Datatype::Text);
        let fragments = vec![
            Fragment::condition("city", Operator::EqualTo, stat("pune"), Connector::And),
            Fragment::calculation("principal", CalcOp::Multiply, stat("2")),
        ];
        let built = build_column(&loans(), "doubled", &fragments, &catalog).unwrap();
        assert_eq!(built.dataset.column("doubled").unwrap(), vec!["2000", "", "1000"]);
    }

    #[test]
    fn test_chaining_on_new_column() {
        let fragments = vec![
            Fragment::calculation("principal", CalcOp::Add, col("interest")),
            Fragment::calculation("Column Being Created", CalcOp::Subtract, stat("100")),
        ];
        let built = build_column(&loans(), "net", &fragments, &ColumnCatalog::new()).unwrap();
        assert_eq!(built.dataset.column("net").unwrap(), vec!["1000", "2200", ""]);
    }

    #[test]
    fn test_new_column_in_first_fragment_is_rejected() {
        let fragments = vec![Fragment::calculation("column being created", CalcOp::Add, stat("1"))];
        let err = build_column(&loans(), "x", &fragments, &ColumnCatalog::new()).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn test_boolean_expected_without_condition() {
        let fragments = vec![
            Fragment::boolean(true),
            Fragment::calculation("principal", CalcOp::Add, stat("1")),
        ];
        let err = build_column(&loans(), "flag", &fragments, &ColumnCatalog::new()).unwrap_err();
        assert!(matches!(err, PipelineError::BooleanExpected { ref column } if column == "flag"));
    }

    #[test]
    fn test_missing_column_is_not_found() {
        let fragments = vec![Fragment::calculation("nope", CalcOp::Add, stat("1"))];
        let err = build_column(&loans(), "x", &fragments, &ColumnCatalog::new()).unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { kind: "column", .. }));
    }

    #[test]
    fn test_parse_accepts_wrapped_and_camel_case() {
        let json = r#"[
            [{"column_one": "principal", "operator": "greater than", "value": 800, "valueType": "static", "connector": "AND"}],
            {"column": "city", "operator": "equal", "value": "Pune", "connector": "THEN"},
            [{"isBoolean": true, "booleanValue": true}],
            []
        ]"#;
        let fragments = parse_fragments(json).unwrap();

        assert_eq!(fragments.len(), 3);
        assert!(matches!(
            &fragments[0],
            Fragment::Condition { connector: Connector::And, operand: Operand::Static(v), .. } if v == "800"
        ));
        assert!(matches!(fragments[1], Fragment::Terminal { .. }));
        assert_eq!(fragments[2], Fragment::boolean(true));
    }

    #[test]
    fn test_parse_classifies_calculations() {
        let json = r#"[{"column_one": "principal", "operator": "divide", "value": "tenure", "valueType": "column"}]"#;
        let fragments = parse_fragments(json).unwrap();
        assert_eq!(
            fragments[0],
            Fragment::calculation("principal", CalcOp::Divide, col("tenure"))
        );
    }
}
