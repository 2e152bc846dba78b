// 🏷️ Rule Groups - Rules as Data
// Conditions fold left to right into one mask per group; the group's last
// condition says whether matched rows are accepted or rejected.

use crate::catalog::{parse_number, ColumnCatalog};
use crate::condition::{evaluate_condition, Condition, Connector, Outcome};
use crate::dataset::{Dataset, Mask};
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Ordered conditions evaluated as one unit
pub type RuleGroup = Vec<Condition>;

// ============================================================================
// FOLD
// ============================================================================

/// Sequential fold of a group's conditions.
///
/// The first condition's connector is ignored. Every later condition is
/// combined with the running mask using the PREVIOUS condition's connector:
/// OR unions, AND and THEN intersect. There is no precedence, so
/// `[c1 OR, c2 AND, c3 THEN]` is `(c1 | c2) & c3`.
pub fn fold_conditions<F>(group: &[Condition], rows: usize, mut evaluate: F) -> Mask
where
    F: FnMut(&Condition) -> Mask,
{
    let Some((first, rest)) = group.split_first() else {
        return Mask::all(rows, false);
    };

    let mut mask = evaluate(first);
    let mut previous = first.connector;
    for condition in rest {
        let current = evaluate(condition);
        match previous {
            Some(Connector::Or) => mask |= &current,
            _ => mask &= &current,
        }
        previous = condition.connector;
    }
    mask
}

/// Action carried by the last condition; reject when absent
pub fn group_outcome(group: &[Condition]) -> Outcome {
    group.last().and_then(|c| c.then).unwrap_or_default()
}

/// Combined mask and action for one rule group
pub fn build_mask(dataset: &Dataset, group: &[Condition], catalog: &ColumnCatalog) -> (Mask, Outcome) {
    let mask = fold_conditions(group, dataset.len(), |condition| {
        evaluate_condition(dataset, condition, catalog)
    });
    (mask, group_outcome(group))
}

/// Read rule groups from JSON: either `{"rules": [[...]]}` or a bare `[[...]]`
pub fn load_rule_groups<P: AsRef<Path>>(path: P) -> Result<Vec<RuleGroup>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
    parse_rule_groups(&content)
}

pub fn parse_rule_groups(content: &str) -> Result<Vec<RuleGroup>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Payload {
        Wrapped { rules: Vec<RuleGroup> },
        Bare(Vec<RuleGroup>),
    }

    let groups = match serde_json::from_str::<Payload>(content)? {
        Payload::Wrapped { rules } => rules,
        Payload::Bare(rules) => rules,
    };
    if groups.is_empty() {
        return Err(PipelineError::validation("rule payload contains no rule groups"));
    }
    Ok(groups)
}

// ============================================================================
// COMPLEX RULE ENGINE (whole dataset, cumulative)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DatasetStats {
    pub rows: usize,
    pub loan_amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupResult {
    pub rule_group: RuleGroup,
    pub rule_type: Outcome,
    pub rows_removed: usize,
    pub amount_removed: f64,
    pub rows_remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RulesResults {
    pub total_rows_removed: usize,
    pub total_amount_removed: f64,
    pub rule_groups_applied: usize,
    pub detailed_results: Vec<GroupResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleApplication {
    pub stats_before: DatasetStats,
    pub stats_after: DatasetStats,
    pub results: RulesResults,
}

pub struct RuleEngine {
    catalog: ColumnCatalog,
    amount_column: String,
    date_format: String,
}

impl RuleEngine {
    pub fn new(catalog: ColumnCatalog) -> Self {
        RuleEngine {
            catalog,
            amount_column: "loan_amount".to_string(),
            date_format: "%d/%m/%Y".to_string(),
        }
    }

    /// Column summed for the amount statistics (matched case-insensitively)
    pub fn with_amount_column(mut self, column: impl Into<String>) -> Self {
        self.amount_column = column.into();
        self
    }

    pub fn with_date_format(mut self, format: impl Into<String>) -> Self {
        self.date_format = format.into();
        self
    }

    pub fn catalog(&self) -> &ColumnCatalog {
        &self.catalog
    }

    /// Apply every group in order to the running dataset.
    /// Accept keeps the matched rows, reject drops them.
    pub fn apply_groups(&self, mut dataset: Dataset, groups: &[RuleGroup]) -> (Dataset, RulesResults) {
        let amount_column = self.find_amount_column(&dataset);
        let mut results = RulesResults {
            rule_groups_applied: groups.len(),
            ..RulesResults::default()
        };

        for group in groups {
            let (mask, outcome) = build_mask(&dataset, group, &self.catalog);
            let (matched, unmatched) = dataset.partition(&mask);
            let (kept, removed) = match outcome {
                Outcome::Accept => (matched, unmatched),
                Outcome::Reject => (unmatched, matched),
            };

            let amount_removed = amount_column
                .as_deref()
                .map(|column| sum_amount(&removed, column))
                .unwrap_or(0.0);

            tracing::debug!(
                rule_type = %outcome,
                rows_removed = removed.len(),
                rows_remaining = kept.len(),
                "rule group applied"
            );

            results.total_rows_removed += removed.len();
            results.total_amount_removed += amount_removed;
            results.detailed_results.push(GroupResult {
                rule_group: group.clone(),
                rule_type: outcome,
                rows_removed: removed.len(),
                amount_removed,
                rows_remaining: kept.len(),
            });
            dataset = kept;
        }

        (dataset, results)
    }

    /// Rows and summed amount of a dataset
    pub fn stats(&self, dataset: &Dataset) -> DatasetStats {
        DatasetStats {
            rows: dataset.len(),
            loan_amount: self
                .find_amount_column(dataset)
                .map(|column| sum_amount(dataset, &column))
                .unwrap_or(0.0),
        }
    }

    /// Rewrite a file in place with the rule groups applied
    pub fn apply_to_file(&self, path: &Path, groups: &[RuleGroup]) -> Result<RuleApplication> {
        let dataset = Dataset::read_csv(path)?;
        let stats_before = self.stats(&dataset);

        let (filtered, results) = self.apply_groups(dataset, groups);
        filtered.write_csv(path, &self.catalog, &self.date_format)?;

        let stats_after = self.stats(&filtered);
        tracing::info!(
            path = %path.display(),
            rows_before = stats_before.rows,
            rows_after = stats_after.rows,
            "complex rules applied"
        );

        Ok(RuleApplication {
            stats_before,
            stats_after,
            results,
        })
    }

    fn find_amount_column(&self, dataset: &Dataset) -> Option<String> {
        let wanted = self.amount_column.to_lowercase();
        dataset
            .columns()
            .iter()
            .find(|c| c.to_lowercase() == wanted || c.to_lowercase() == "loan_amount")
            .cloned()
    }
}

/// Sum a column; unparseable cells count as zero
pub fn sum_amount(dataset: &Dataset, column: &str) -> f64 {
    dataset
        .column(column)
        .map(|values| values.iter().filter_map(|v| parse_number(v)).sum())
        .unwrap_or(0.0)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Datatype;
    use crate::condition::Operator;

    fn loans() -> Dataset {
        let rows = [
            ("L1", "50", "pune"),
            ("L2", "150", "pune"),
            ("L3", "250", "delhi"),
            ("L4", "1,000", "mumbai"),
        ];
        Dataset::from_rows(
            ["loan_id", "loan_amount", "city"],
            rows.iter()
                .map(|(a, b, c)| vec![a.to_string(), b.to_string(), c.to_string()])
                .collect(),
        )
    }

    fn catalog() -> ColumnCatalog {
        ColumnCatalog::new().with("loan_amount", Datatype::Currency)
    }

    #[test]
    fn test_fold_is_sequential_not_precedence() {
        // c1=[T,F,F], c2=[F,T,F], c3=[F,F,F]
        // (c1 | c2) & c3 = [F,F,F] while c1 | (c2 & c3) = [T,F,F]
        let group = vec![
            Condition::new("c1", Operator::EqualTo, "x").connector(Connector::Or),
            Condition::new("c2", Operator::EqualTo, "x").connector(Connector::And),
            Condition::new("c3", Operator::EqualTo, "x").then(Outcome::Accept),
        ];
        let masks = |c: &Condition| match c.column.as_str() {
            "c1" => Mask::from(vec![true, false, false]),
            "c2" => Mask::from(vec![false, true, false]),
            _ => Mask::from(vec![false, false, false]),
        };

        let mask = fold_conditions(&group, 3, masks);
        assert_eq!(mask.as_slice(), &[false, false, false]);
    }

    #[test]
    fn test_fold_ignores_first_connector() {
        let group = vec![
            Condition::new("a", Operator::EqualTo, "x").connector(Connector::And),
            Condition::new("b", Operator::EqualTo, "x").connector(Connector::Then),
        ];
        let mask = fold_conditions(&group, 2, |c| {
            if c.column == "a" {
                Mask::from(vec![true, true])
            } else {
                Mask::from(vec![true, false])
            }
        });
        assert_eq!(mask.as_slice(), &[true, false]);
    }

    #[test]
    fn test_empty_group_matches_nothing_and_rejects() {
        let (mask, outcome) = build_mask(&loans(), &[], &catalog());
        assert_eq!(mask.count(), 0);
        assert_eq!(mask.len(), 4);
        assert_eq!(outcome, Outcome::Reject);
    }

    #[test]
    fn test_outcome_defaults_to_reject() {
        let group = vec![Condition::new("city", Operator::EqualTo, "pune")];
        assert_eq!(group_outcome(&group), Outcome::Reject);
    }

    #[test]
    fn test_apply_groups_is_cumulative() {
        let engine = RuleEngine::new(catalog());
        let groups = vec![
            vec![Condition::new("loan_amount", Operator::GreaterThan, "100").then(Outcome::Accept)],
            vec![Condition::new("city", Operator::EqualTo, "Delhi").then(Outcome::Reject)],
        ];

        let (filtered, results) = engine.apply_groups(loans(), &groups);

        assert_eq!(filtered.column("loan_id").unwrap(), vec!["L2", "L4"]);
        assert_eq!(results.rule_groups_applied, 2);
        assert_eq!(results.total_rows_removed, 2);
        assert_eq!(results.detailed_results[0].rows_removed, 1);
        assert_eq!(results.detailed_results[0].amount_removed, 50.0);
        assert_eq!(results.detailed_results[1].rows_remaining, 2);
        assert_eq!(results.total_amount_removed, 300.0);
    }

    #[test]
    fn test_stats_sum_amounts() {
        let engine = RuleEngine::new(catalog());
        let stats = engine.stats(&loans());
        assert_eq!(stats.rows, 4);
        assert_eq!(stats.loan_amount, 1450.0);
    }

    #[test]
    fn test_parse_rule_groups_both_shapes() {
        let wrapped = r#"{"rules": [[{"column": "city", "operator": "equal to", "value": "pune", "connector": "THEN", "then": "accept"}]]}"#;
        let bare = r#"[[{"column": "city", "operator": "equal to", "value": "pune"}]]"#;

        assert_eq!(parse_rule_groups(wrapped).unwrap()[0][0].then, Some(Outcome::Accept));
        assert_eq!(parse_rule_groups(bare).unwrap().len(), 1);
        assert!(parse_rule_groups("[]").is_err());
    }
}
