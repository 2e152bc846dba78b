// 🏛️ Fixed Regulatory Rules - the RBI eligibility filter for transactions
//
// Five fixed filters, each optional, applied in order to the running
// dataset. A filter whose columns are missing is reported as not applied
// instead of failing the run.

use crate::catalog::{parse_bool, parse_date, parse_number};
use crate::dataset::{Dataset, Mask};
use crate::error::{PipelineError, Result};
use crate::rules::{sum_amount, DatasetStats};
use chrono::{Datelike, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Days before cutoff inside which a maturing loan is excluded
const MATURITY_WINDOW_DAYS: i64 = 365;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RbiSelection {
    #[serde(default, alias = "rule1")]
    pub duplicate_transaction_ids: bool,
    #[serde(default, alias = "rule2")]
    pub emi_seasoning: bool,
    #[serde(default, alias = "rule3")]
    pub near_maturity: bool,
    #[serde(default, alias = "rule4")]
    pub overdue: bool,
    #[serde(default, alias = "rule5")]
    pub restructured: bool,
    /// dd/mm/yyyy; required by the seasoning and maturity rules
    #[serde(default)]
    pub cutoff_date: Option<String>,
}

impl RbiSelection {
    pub fn all(cutoff_date: impl Into<String>) -> Self {
        RbiSelection {
            duplicate_transaction_ids: true,
            emi_seasoning: true,
            near_maturity: true,
            overdue: true,
            restructured: true,
            cutoff_date: Some(cutoff_date.into()),
        }
    }

    fn any(&self) -> bool {
        self.duplicate_transaction_ids || self.emi_seasoning || self.near_maturity || self.overdue || self.restructured
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedRuleResult {
    pub rule_number: u8,
    pub rule_name: String,
    pub rows_removed: usize,
    pub rows_left: usize,
    pub loan_amount_removed: f64,
    pub loan_amount_left: f64,
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RbiReport {
    pub cutoff_date: Option<String>,
    pub stats_before: DatasetStats,
    pub stats_after: DatasetStats,
    pub rules_applied: Vec<FixedRuleResult>,
}

/// Column names compared lowercase with spaces as underscores
fn normalized(column: &str) -> String {
    column.trim().to_lowercase().replace(' ', "_")
}

fn find_column(dataset: &Dataset, matches: impl Fn(&str) -> bool) -> Option<String> {
    dataset
        .columns()
        .iter()
        .find(|c| matches(&normalized(c)))
        .cloned()
}

fn months_between(from: &NaiveDateTime, to: &NaiveDateTime) -> i64 {
    i64::from(to.year() - from.year()) * 12 + i64::from(to.month()) - i64::from(from.month())
}

struct Filter {
    dataset: Dataset,
    amount_column: Option<String>,
    results: Vec<FixedRuleResult>,
}

impl Filter {
    fn amount(&self, data: &Dataset) -> f64 {
        self.amount_column
            .as_deref()
            .map(|c| sum_amount(data, c))
            .unwrap_or(0.0)
    }

    fn remove(&mut self, number: u8, name: &str, remove: &Mask) {
        let data = std::mem::take(&mut self.dataset);
        let (removed, kept) = data.partition(remove);
        let result = FixedRuleResult {
            rule_number: number,
            rule_name: name.to_string(),
            rows_removed: removed.len(),
            rows_left: kept.len(),
            loan_amount_removed: self.amount(&removed),
            loan_amount_left: self.amount(&kept),
            applied: true,
            note: None,
        };
        tracing::debug!(rule = number, rows_removed = result.rows_removed, "fixed rule applied");
        self.results.push(result);
        self.dataset = kept;
    }

    fn skip(&mut self, number: u8, name: &str, note: String) {
        let result = FixedRuleResult {
            rule_number: number,
            rule_name: name.to_string(),
            rows_removed: 0,
            rows_left: self.dataset.len(),
            loan_amount_removed: 0.0,
            loan_amount_left: self.amount(&self.dataset),
            applied: false,
            note: Some(note),
        };
        self.results.push(result);
    }

    fn cells(&self, column: &str) -> Vec<String> {
        self.dataset
            .column(column)
            .map(|values| values.into_iter().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// Run the selected fixed rules; `amount_column` feeds the amount statistics
pub fn apply_rbi_rules(dataset: Dataset, selection: &RbiSelection, amount_column: &str) -> Result<(Dataset, RbiReport)> {
    if !selection.any() {
        return Err(PipelineError::validation("no fixed rules selected"));
    }
    let cutoff = match selection.cutoff_date.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => Some(
            parse_date(raw).ok_or_else(|| PipelineError::validation(format!("invalid cutoff date '{raw}'")))?,
        ),
        _ => None,
    };
    if cutoff.is_none() && (selection.emi_seasoning || selection.near_maturity) {
        return Err(PipelineError::validation("cutoff_date is required for the seasoning and maturity rules"));
    }

    let wanted = normalized(amount_column);
    let amount_column = find_column(&dataset, |c| c == wanted || c == "loan_amount");
    let mut filter = Filter {
        dataset,
        amount_column,
        results: Vec::new(),
    };
    let stats_before = DatasetStats {
        rows: filter.dataset.len(),
        loan_amount: filter.amount(&filter.dataset),
    };

    if selection.duplicate_transaction_ids {
        const NAME: &str = "Remove duplicate transaction IDs";
        match find_column(&filter.dataset, |c| c == "transaction_id") {
            Some(column) => {
                let mut seen = HashSet::new();
                let cells = filter.cells(&column);
                let mask = Mask::from_fn(cells.len(), |i| !seen.insert(cells[i].trim().to_string()));
                filter.remove(1, NAME, &mask);
            }
            None => filter.skip(1, NAME, "Transaction ID column not found".to_string()),
        }
    }

    if let (true, Some(cutoff)) = (selection.emi_seasoning, cutoff.as_ref()) {
        const NAME: &str = "Remove loans not meeting EMI criteria";
        let first = find_column(&filter.dataset, |c| c.contains("first_emi"));
        let last = find_column(&filter.dataset, |c| c.contains("last_emi"));
        match (first, last) {
            (Some(first), Some(last)) => {
                let firsts = filter.cells(&first);
                let lasts = filter.cells(&last);
                let mask = Mask::from_fn(firsts.len(), |i| {
                    match (parse_date(&firsts[i]), parse_date(&lasts[i])) {
                        (Some(first), Some(last)) => {
                            // Three months of seasoning per year of tenure
                            let required = months_between(&first, &last) as f64 / 4.0;
                            (months_between(&first, cutoff) as f64) < required
                        }
                        _ => true,
                    }
                });
                filter.remove(2, NAME, &mask);
            }
            (first, last) => {
                let mut missing = Vec::new();
                if first.is_none() {
                    missing.push("First EMI Date");
                }
                if last.is_none() {
                    missing.push("Last EMI Date");
                }
                filter.skip(2, NAME, format!("Required columns not found: {}", missing.join(", ")));
            }
        }
    }

    if let (true, Some(cutoff)) = (selection.near_maturity, cutoff.as_ref()) {
        const NAME: &str = "Remove loans with maturity within 365 days of cutoff";
        match find_column(&filter.dataset, |c| c.contains("maturity")) {
            Some(column) => {
                let cells = filter.cells(&column);
                let mask = Mask::from_fn(cells.len(), |i| {
                    parse_date(&cells[i])
                        .map(|maturity| (0..=MATURITY_WINDOW_DAYS).contains(&(maturity - *cutoff).num_days()))
                        .unwrap_or(false)
                });
                filter.remove(3, NAME, &mask);
            }
            None => filter.skip(3, NAME, "Maturity Date column not found".to_string()),
        }
    }

    if selection.overdue {
        const NAME: &str = "Remove rows with non-zero overdue/dpd";
        let columns: Vec<String> = filter
            .dataset
            .columns()
            .iter()
            .filter(|c| matches!(normalized(c).as_str(), "overdue" | "dpd"))
            .cloned()
            .collect();
        if columns.is_empty() {
            filter.skip(4, NAME, "Overdue/DPD columns not found".to_string());
        } else {
            let mut mask = Mask::all(filter.dataset.len(), false);
            for column in &columns {
                let cells = filter.cells(column);
                mask |= &Mask::from_fn(cells.len(), |i| parse_number(&cells[i]).unwrap_or(0.0) != 0.0);
            }
            filter.remove(4, NAME, &mask);
        }
    }

    if selection.restructured {
        const NAME: &str = "Remove restructured/rescheduled loans";
        let columns: Vec<String> = filter
            .dataset
            .columns()
            .iter()
            .filter(|c| {
                let name = normalized(c);
                name.contains("restructured") || name.contains("rescheduled")
            })
            .cloned()
            .collect();
        if columns.is_empty() {
            filter.skip(5, NAME, "Restructured/Rescheduled loan columns not found".to_string());
        } else {
            let mut mask = Mask::all(filter.dataset.len(), false);
            for column in &columns {
                let cells = filter.cells(column);
                mask |= &Mask::from_fn(cells.len(), |i| parse_bool(&cells[i]) == Some(true));
            }
            filter.remove(5, NAME, &mask);
        }
    }

    let stats_after = DatasetStats {
        rows: filter.dataset.len(),
        loan_amount: filter.amount(&filter.dataset),
    };
    tracing::info!(
        rows_before = stats_before.rows,
        rows_after = stats_after.rows,
        "fixed rules applied"
    );
    Ok((
        filter.dataset,
        RbiReport {
            cutoff_date: selection.cutoff_date.clone(),
            stats_before,
            stats_after,
            rules_applied: filter.results,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> Dataset {
        let rows = [
            ["T1", "1000", "01/01/2020", "01/01/2030", "01/06/2030", "0", "No"],
            ["T1", "500", "01/01/2020", "01/01/2030", "01/06/2030", "0", "No"],
            ["T2", "2000", "01/01/2023", "01/01/2033", "01/01/2033", "0", "No"],
            ["T3", "3000", "01/01/2020", "01/01/2024", "01/12/2024", "0", "No"],
            ["T4", "4000", "01/01/2020", "01/01/2030", "01/01/2030", "15", "No"],
            ["T5", "5000", "01/01/2020", "01/01/2030", "01/01/2030", "0", "Yes"],
            ["T6", "6000", "01/01/2020", "01/01/2030", "01/01/2030", "", "No"],
        ];
        Dataset::from_rows(
            [
                "Transaction ID",
                "loan amount",
                "First EMI Date",
                "Last EMI Date",
                "Maturity Date",
                "DPD",
                "Restructured Loan",
            ],
            rows.iter().map(|r| r.iter().map(|c| c.to_string()).collect()).collect(),
        )
    }

    #[test]
    fn test_all_rules_in_order() {
        let (kept, report) = apply_rbi_rules(book(), &RbiSelection::all("26/03/2024"), "loan amount").unwrap();

        let removed: Vec<usize> = report.rules_applied.iter().map(|r| r.rows_removed).collect();
        // dup T1, T2 unseasoned, T3 near maturity, T4 dpd, T5 restructured
        assert_eq!(removed, vec![1, 1, 1, 1, 1]);
        assert_eq!(kept.column("Transaction ID").unwrap(), vec!["T1", "T6"]);
        assert_eq!(report.rules_applied[0].loan_amount_removed, 500.0);
        assert_eq!(report.stats_before.loan_amount, 21500.0);
        assert_eq!(report.stats_after.loan_amount, 7000.0);
    }

    #[test]
    fn test_missing_columns_are_reported_not_fatal() {
        let data = Dataset::from_rows(["id", "loan_amount"], vec![vec!["a".into(), "1".into()]]);
        let selection = RbiSelection {
            overdue: true,
            restructured: true,
            ..RbiSelection::default()
        };

        let (kept, report) = apply_rbi_rules(data, &selection, "loan_amount").unwrap();

        assert_eq!(kept.len(), 1);
        assert!(report.rules_applied.iter().all(|r| !r.applied && r.note.is_some()));
    }

    #[test]
    fn test_cutoff_required_for_date_rules() {
        let selection = RbiSelection {
            near_maturity: true,
            ..RbiSelection::default()
        };
        assert!(apply_rbi_rules(book(), &selection, "loan amount").is_err());
        assert!(apply_rbi_rules(book(), &RbiSelection::default(), "loan amount").is_err());
    }
}
