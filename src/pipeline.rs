// 🧭 Pipeline Steps
// Ordered step flags per project/transaction; callers check them to know
// which operation is legal next.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};

pub const DATASET_UPLOADED: &str = "dataset_uploaded";
pub const HEADER_MAPPING_DONE: &str = "header_mapping_done";
pub const DATATYPE_CONVERSION_DONE: &str = "datatype_conversion_done";
pub const DATA_VALIDATION_DONE: &str = "data_validation_done";
pub const SPLIT_BY_TAGS_DONE: &str = "split_by_tags_done";
pub const TAGS_SELECTED_FOR_RULES: &str = "tags_selected_for_rules";
pub const RULES_APPLIED: &str = "rules_applied";
pub const FINALIZED: &str = "finalized";

pub const NEW_COLUMNS_ADDED: &str = "new_columns_added";
pub const RBI_RULES_APPLIED: &str = "rbi_rules_applied";
pub const RULE_VERSIONS_CREATED: &str = "rule_versions_created";

pub const DEBT_SHEET_STEPS: &[&str] = &[
    DATASET_UPLOADED,
    HEADER_MAPPING_DONE,
    DATATYPE_CONVERSION_DONE,
    DATA_VALIDATION_DONE,
    SPLIT_BY_TAGS_DONE,
    TAGS_SELECTED_FOR_RULES,
    RULES_APPLIED,
    FINALIZED,
];

pub const TRANSACTION_STEPS: &[&str] = &[
    DATASET_UPLOADED,
    HEADER_MAPPING_DONE,
    DATATYPE_CONVERSION_DONE,
    NEW_COLUMNS_ADDED,
    RBI_RULES_APPLIED,
    RULE_VERSIONS_CREATED,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTracker {
    steps: Vec<Step>,
    current_step: Option<String>,
}

impl StepTracker {
    pub fn new(order: &[&str]) -> Self {
        StepTracker {
            steps: order
                .iter()
                .map(|name| Step {
                    name: name.to_string(),
                    done: false,
                })
                .collect(),
            current_step: None,
        }
    }

    pub fn for_debt_sheet() -> Self {
        StepTracker::new(DEBT_SHEET_STEPS)
    }

    pub fn for_transaction() -> Self {
        StepTracker::new(TRANSACTION_STEPS)
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.steps
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| PipelineError::validation(format!("unknown pipeline step '{name}'")))
    }

    /// Mark a step done and make it the current step
    pub fn complete(&mut self, name: &str) -> Result<()> {
        let idx = self.position(name)?;
        self.steps[idx].done = true;
        self.current_step = Some(name.to_string());
        Ok(())
    }

    pub fn is_done(&self, name: &str) -> bool {
        self.steps.iter().any(|s| s.name == name && s.done)
    }

    /// Fail unless `name` has been completed
    pub fn require(&self, name: &str) -> Result<()> {
        self.position(name)?;
        if self.is_done(name) {
            Ok(())
        } else {
            Err(PipelineError::validation(format!("step '{name}' has not been completed yet")))
        }
    }

    /// Clear every step after `name`; returns the steps that were reset
    pub fn reset_steps_from(&mut self, name: &str) -> Result<Vec<String>> {
        let idx = self.position(name)?;
        let mut reset = Vec::new();
        for step in self.steps.iter_mut().skip(idx + 1) {
            if step.done {
                reset.push(step.name.clone());
            }
            step.done = false;
        }
        self.current_step = if self.steps[idx].done {
            Some(name.to_string())
        } else {
            None
        };
        Ok(reset)
    }

    pub fn current_step(&self) -> Option<&str> {
        self.current_step.as_deref()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_and_require() {
        let mut tracker = StepTracker::for_debt_sheet();
        assert!(tracker.require(SPLIT_BY_TAGS_DONE).is_err());

        tracker.complete(SPLIT_BY_TAGS_DONE).unwrap();
        assert!(tracker.require(SPLIT_BY_TAGS_DONE).is_ok());
        assert_eq!(tracker.current_step(), Some(SPLIT_BY_TAGS_DONE));
        assert!(tracker.complete(NEW_COLUMNS_ADDED).is_err());
    }

    #[test]
    fn test_reset_clears_later_steps_only() {
        let mut tracker = StepTracker::for_debt_sheet();
        for step in [SPLIT_BY_TAGS_DONE, TAGS_SELECTED_FOR_RULES, RULES_APPLIED, FINALIZED] {
            tracker.complete(step).unwrap();
        }

        let reset = tracker.reset_steps_from(SPLIT_BY_TAGS_DONE).unwrap();

        assert_eq!(reset, vec![TAGS_SELECTED_FOR_RULES, RULES_APPLIED, FINALIZED]);
        assert!(tracker.is_done(SPLIT_BY_TAGS_DONE));
        assert!(!tracker.is_done(RULES_APPLIED));
        assert_eq!(tracker.current_step(), Some(SPLIT_BY_TAGS_DONE));
    }
}
