// ⚙️ Configuration
// Where files live and which columns carry tags / loan amounts

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root folder; every project/transaction gets a sub-folder here
    pub datasets_root: PathBuf,

    /// SQLite file holding version/project/transaction records
    pub database_path: PathBuf,

    /// Extension for files created without a source to copy it from
    pub default_extension: String,

    /// Date format used when writing date-typed columns
    pub date_format: String,

    pub tag_column: String,
    pub tag_type_column: String,

    /// Column summed for chain stats (rows + loan amount)
    pub loan_amount_column: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            datasets_root: PathBuf::from("datasets"),
            database_path: PathBuf::from("loan_tape.db"),
            default_extension: "csv".to_string(),
            date_format: "%d/%m/%Y".to_string(),
            tag_column: "tag_name".to_string(),
            tag_type_column: "tag_type".to_string(),
            loan_amount_column: "loan_amount".to_string(),
        }
    }
}

impl Config {
    /// Load from a TOML file; absent keys keep their defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| PipelineError::validation(format!("invalid configuration: {e}")))
    }

    /// Folder for one project or transaction (spaces become underscores)
    pub fn owner_folder(&self, owner_name: &str) -> PathBuf {
        self.datasets_root.join(safe_file_stem(owner_name))
    }
}

/// Eight hex characters for file names that must not be reused
pub fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Keep only characters that are safe in a file name
pub fn safe_file_stem(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches(|c| c == '.' || c == '_').to_string();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            datasets_root = "/srv/tapes"
            loan_amount_column = "Loan Amount"
            "#,
        )
        .unwrap();

        assert_eq!(config.datasets_root, PathBuf::from("/srv/tapes"));
        assert_eq!(config.loan_amount_column, "Loan Amount");
        assert_eq!(config.date_format, "%d/%m/%Y");
        assert_eq!(config.default_extension, "csv");
    }

    #[test]
    fn test_invalid_toml_is_validation_error() {
        let err = Config::from_toml("datasets_root = [").unwrap_err();
        assert!(err.is_input_error());
    }

    #[test]
    fn test_safe_file_stem() {
        assert_eq!(safe_file_stem("Q3 Retail Pool"), "Q3_Retail_Pool");
        assert_eq!(safe_file_stem("../etc"), "etc");
        assert_eq!(safe_file_stem("  "), "unnamed");
    }
}
