// 💼 Transaction Workflow - calculated columns and the fixed-rule filter
//
// New columns are built on a temp copy of the current dataset, one rule
// set at a time, then promoted. The fixed-rule output becomes the source
// every rule chain root copies.

use crate::calculated::{build_column, Fragment};
use crate::catalog::ColumnCatalog;
use crate::config::{safe_file_stem, Config};
use crate::conversion::{ColumnFixRequest, ConversionPhase, PromotedConversion};
use crate::dataset::{copy_backing_file, file_sha256, remove_backing_file, Dataset};
use crate::error::{PipelineError, Result};
use crate::pipeline::{DATASET_UPLOADED, DATATYPE_CONVERSION_DONE, HEADER_MAPPING_DONE, NEW_COLUMNS_ADDED, RBI_RULES_APPLIED};
use crate::preprocess::{prepare_dataset, ColumnFix, NumericFix, PrepareOptions, PrepareSummary};
use crate::rbi::{apply_rbi_rules, RbiReport, RbiSelection};
use crate::store::{Event, MetadataStore, TransactionRecord, VersionRecord};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};

const ENTITY: &str = "transaction";
const ACTOR: &str = "transaction";

const CONVERTED_VERSION: f64 = 2.0;
const NEW_COLUMNS_TEMP_VERSION: f64 = 5.0;
const NEW_COLUMNS_FINAL_VERSION: f64 = 6.0;
const RBI_VERSION: f64 = 8.0;

const SAMPLE_VALUES: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionImport {
    pub transaction_id: String,
    pub version_id: String,
    pub rows: usize,
    pub summary: PrepareSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnAddition {
    pub version_id: String,
    pub column: String,
    pub datatype: String,
    pub sample_values: Vec<String>,
    pub rules_processed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RbiApplication {
    pub version_id: String,
    pub report: RbiReport,
}

pub struct TransactionWorkflow<'a, S: MetadataStore> {
    store: &'a S,
    config: &'a Config,
}

impl<'a, S: MetadataStore> TransactionWorkflow<'a, S> {
    pub fn new(store: &'a S, config: &'a Config) -> Self {
        TransactionWorkflow { store, config }
    }

    fn path(&self, transaction: &TransactionRecord, suffix: &str, ext: &str) -> PathBuf {
        self.config.owner_folder(&transaction.name).join(format!(
            "{}_{suffix}.{ext}",
            safe_file_stem(&transaction.name)
        ))
    }

    fn extension(&self, version: &VersionRecord) -> String {
        version
            .file_path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| self.config.default_extension.clone())
    }

    fn catalog(&self, transaction: &TransactionRecord) -> Result<ColumnCatalog> {
        Ok(self
            .store
            .column_catalog()?
            .overlay(transaction.new_added_columns_datatype.iter()))
    }

    fn current(&self, transaction: &TransactionRecord) -> Result<VersionRecord> {
        let id = transaction
            .current_version
            .as_deref()
            .ok_or_else(|| PipelineError::validation("transaction has no current dataset"))?;
        self.store.require_version(id)
    }

    fn record(&self, transaction_id: &str, event_type: &str, data: serde_json::Value) -> Result<()> {
        self.store
            .record_event(&Event::new(event_type, ENTITY, transaction_id, data, ACTOR))
    }

    fn discard_version(&self, version_id: &str) -> Result<()> {
        if let Some(version) = self.store.get_version(version_id)? {
            remove_backing_file(&version.file_path)?;
            self.store.delete_version(&version.id)?;
        }
        Ok(())
    }

    /// Create a transaction from an uploaded CSV: clean, rename, convert
    pub fn init_transaction(&self, name: &str, source: &Path, options: &PrepareOptions) -> Result<TransactionImport> {
        if name.trim().is_empty() {
            return Err(PipelineError::validation("transaction name is required"));
        }
        let mut transaction = TransactionRecord::new(name.trim());
        let catalog = self.catalog(&transaction)?;
        let mut data = Dataset::read_csv(source)?;
        let summary = prepare_dataset(&mut data, options, &catalog, &self.config.date_format)?;

        let path = self.path(
            &transaction,
            "original_preprocessed_updated_column_names_datatype_converted",
            &self.config.default_extension,
        );
        data.write_csv(&path, &catalog, &self.config.date_format)?;
        let version = VersionRecord::new(&transaction.id, "Preprocessed and datatype converted upload", &path, CONVERTED_VERSION)
            .with_rows(data.len())
            .with_digest(file_sha256(&path)?);
        let version_id = self.store.create_version(&version)?;

        transaction.current_version = Some(version_id.clone());
        for step in [DATASET_UPLOADED, HEADER_MAPPING_DONE, DATATYPE_CONVERSION_DONE] {
            transaction.steps.complete(step)?;
        }
        self.store.create_transaction(&transaction)?;
        self.record(&transaction.id, "transaction_created", json!({ "version_id": version_id, "rows": data.len() }))?;

        tracing::info!(transaction_id = %transaction.id, rows = data.len(), "transaction created");
        Ok(TransactionImport {
            transaction_id: transaction.id,
            version_id,
            rows: data.len(),
            summary,
        })
    }

    // ------------------------------------------------------------------------
    // Datatype conversion
    // ------------------------------------------------------------------------

    /// Copy the current dataset for per-column fixes; only before new columns
    pub fn start_datatype_conversion(&self, transaction_id: &str) -> Result<String> {
        let mut transaction = self.store.require_transaction(transaction_id)?;
        transaction.steps.require(HEADER_MAPPING_DONE)?;
        if transaction.steps.is_done(NEW_COLUMNS_ADDED) || transaction.temp_new_column_adding.is_some() {
            return Err(PipelineError::validation(
                "datatype fixes must happen before new columns are added",
            ));
        }
        let current = self.current(&transaction)?;

        if let Some(previous) = transaction.temp_datatype_conversion.take() {
            self.discard_version(&previous)?;
        }
        let phase = ConversionPhase::new(self.store, self.config, self.catalog(&transaction)?);
        let temp_id = phase.start(&transaction.id, &transaction.name, &current)?;

        transaction.temp_datatype_conversion = Some(temp_id.clone());
        transaction.steps.reset_steps_from(HEADER_MAPPING_DONE)?;
        self.store.save_transaction(&transaction)?;
        self.record(&transaction.id, "datatype_conversion_started", json!({ "version_id": temp_id }))?;
        Ok(temp_id)
    }

    pub fn update_date_format(&self, transaction_id: &str, column: &str, source_format: &str) -> Result<ColumnFix> {
        let request = ColumnFixRequest::Date {
            source_format: source_format.to_string(),
        };
        self.fix_column(transaction_id, column, &request)
    }

    pub fn update_numeric_column(&self, transaction_id: &str, column: &str, fix: &NumericFix) -> Result<ColumnFix> {
        self.fix_column(transaction_id, column, &ColumnFixRequest::Numeric(fix.clone()))
    }

    pub fn update_currency_column(&self, transaction_id: &str, column: &str, fix: &NumericFix) -> Result<ColumnFix> {
        self.fix_column(transaction_id, column, &ColumnFixRequest::Currency(fix.clone()))
    }

    pub fn fix_column(&self, transaction_id: &str, column: &str, request: &ColumnFixRequest) -> Result<ColumnFix> {
        let transaction = self.store.require_transaction(transaction_id)?;
        let temp_id = transaction
            .temp_datatype_conversion
            .as_deref()
            .ok_or_else(|| PipelineError::validation("start the datatype conversion phase first"))?;
        let phase = ConversionPhase::new(self.store, self.config, self.catalog(&transaction)?);
        let fix = phase.fix_column(temp_id, column, request)?;
        self.record(
            &transaction.id,
            "column_datatype_fixed",
            json!({ "column": column, "request": request, "converted": fix.converted }),
        )?;
        Ok(fix)
    }

    /// Promote the fixed copy to the transaction's current dataset
    pub fn finalize_datatype_conversion(&self, transaction_id: &str) -> Result<PromotedConversion> {
        let mut transaction = self.store.require_transaction(transaction_id)?;
        let temp_id = transaction
            .temp_datatype_conversion
            .clone()
            .ok_or_else(|| PipelineError::validation("no datatype conversion in progress"))?;
        let phase = ConversionPhase::new(self.store, self.config, self.catalog(&transaction)?);
        let promoted = phase.promote(&transaction.id, &transaction.name, &temp_id)?;

        transaction.temp_datatype_conversion = None;
        transaction.current_version = Some(promoted.version_id.clone());
        transaction.steps.complete(DATATYPE_CONVERSION_DONE)?;
        self.store.save_transaction(&transaction)?;
        self.record(
            &transaction.id,
            "datatype_conversion_finalized",
            json!({ "version_id": promoted.version_id, "failed_columns": promoted.report.failed.len() }),
        )?;

        tracing::info!(transaction_id = %transaction.id, version_id = %promoted.version_id, "datatype conversion finalized");
        Ok(promoted)
    }

    // ------------------------------------------------------------------------
    // Calculated columns
    // ------------------------------------------------------------------------

    /// Copy the current dataset into a fresh temp version
    pub fn start_new_column_phase(&self, transaction_id: &str) -> Result<String> {
        let mut transaction = self.store.require_transaction(transaction_id)?;
        transaction.steps.require(DATATYPE_CONVERSION_DONE)?;
        let current = self.current(&transaction)?;

        if let Some(previous) = transaction.temp_new_column_adding.take() {
            self.discard_version(&previous)?;
        }

        let path = self.path(&transaction, "temp_new_columns", &self.extension(&current));
        copy_backing_file(&current.file_path, &path)?;
        let version = VersionRecord::new(&transaction.id, "Temporary copy for new columns", &path, NEW_COLUMNS_TEMP_VERSION)
            .with_rows(current.rows_count)
            .with_digest(file_sha256(&path)?);
        let version_id = self.store.create_version(&version)?;

        transaction.temp_new_column_adding = Some(version_id.clone());
        self.store.save_transaction(&transaction)?;
        self.record(&transaction.id, "new_column_phase_started", json!({ "version_id": version_id }))?;
        Ok(version_id)
    }

    /// Build one calculated column on the temp copy
    pub fn add_column_with_rules(&self, transaction_id: &str, name: &str, fragments: &[Fragment]) -> Result<ColumnAddition> {
        let mut transaction = self.store.require_transaction(transaction_id)?;
        let temp_id = transaction
            .temp_new_column_adding
            .clone()
            .ok_or_else(|| PipelineError::validation("start the new column phase first"))?;
        let mut temp = self.store.require_version(&temp_id)?;
        let catalog = self.catalog(&transaction)?;

        let data = Dataset::read_csv(&temp.file_path)?;
        let built = build_column(&data, name, fragments, &catalog)?;
        built
            .dataset
            .write_csv(&temp.file_path, &catalog, &self.config.date_format)?;

        temp.rows_count = built.dataset.len();
        temp.file_sha256 = Some(file_sha256(&temp.file_path)?);
        temp.modified = true;
        self.store.update_version(&temp)?;

        let column = name.trim().to_string();
        let datatype = built.datatype.as_str().to_string();
        transaction
            .new_added_columns_datatype
            .insert(column.clone(), datatype.clone());
        self.store.save_transaction(&transaction)?;
        self.record(
            &transaction.id,
            "column_added",
            json!({ "column": column, "datatype": datatype, "rules": built.rules_processed }),
        )?;

        let sample_values = built
            .dataset
            .column(&column)
            .map(|values| values.into_iter().take(SAMPLE_VALUES).map(str::to_string).collect())
            .unwrap_or_default();
        Ok(ColumnAddition {
            version_id: temp_id,
            column,
            datatype,
            sample_values,
            rules_processed: built.rules_processed,
        })
    }

    /// Promote the temp copy to the transaction's current dataset
    pub fn finalize_new_columns(&self, transaction_id: &str) -> Result<String> {
        let mut transaction = self.store.require_transaction(transaction_id)?;
        let temp_id = transaction
            .temp_new_column_adding
            .clone()
            .ok_or_else(|| PipelineError::validation("no new column phase in progress"))?;
        let temp = self.store.require_version(&temp_id)?;

        let path = self.path(
            &transaction,
            "original_preprocessed_updated_column_names_datatype_converted_new_columns_added",
            &self.extension(&temp),
        );
        copy_backing_file(&temp.file_path, &path)?;
        let version = VersionRecord::new(&transaction.id, "New columns added", &path, NEW_COLUMNS_FINAL_VERSION)
            .with_rows(temp.rows_count)
            .with_digest(file_sha256(&path)?);
        let version_id = self.store.create_version(&version)?;
        self.discard_version(&temp_id)?;

        transaction.temp_new_column_adding = None;
        transaction.current_version = Some(version_id.clone());
        transaction.steps.complete(NEW_COLUMNS_ADDED)?;
        self.store.save_transaction(&transaction)?;
        self.record(&transaction.id, "new_columns_finalized", json!({ "version_id": version_id }))?;

        tracing::info!(transaction_id = %transaction.id, version_id = %version_id, "new columns finalized");
        Ok(version_id)
    }

    // ------------------------------------------------------------------------
    // Fixed rules
    // ------------------------------------------------------------------------

    /// Filter the current dataset with the fixed rules; the output becomes
    /// the source of every rule chain root
    pub fn apply_rbi_rules(&self, transaction_id: &str, selection: &RbiSelection) -> Result<RbiApplication> {
        let mut transaction = self.store.require_transaction(transaction_id)?;
        let current = self.current(&transaction)?;
        let catalog = self.catalog(&transaction)?;

        let data = Dataset::read_csv(&current.file_path)?;
        let (filtered, report) = apply_rbi_rules(data, selection, &self.config.loan_amount_column)?;

        if let Some(previous) = transaction.final_rbi_rules_applied.take() {
            self.discard_version(&previous)?;
        }
        let path = self.path(&transaction, "rbi_rules_applied", &self.extension(&current));
        filtered.write_csv(&path, &catalog, &self.config.date_format)?;
        let version = VersionRecord::new(&transaction.id, "Fixed RBI rules applied", &path, RBI_VERSION)
            .with_rows(filtered.len())
            .with_changes(0, report.stats_before.rows - report.stats_after.rows, true)
            .with_digest(file_sha256(&path)?);
        let version_id = self.store.create_version(&version)?;

        transaction.final_rbi_rules_applied = Some(version_id.clone());
        transaction.steps.complete(RBI_RULES_APPLIED)?;
        self.store.save_transaction(&transaction)?;
        self.record(&transaction.id, "rbi_rules_applied", json!({ "version_id": version_id, "report": report }))?;

        Ok(RbiApplication { version_id, report })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculated::{CalcOp, ColumnRef, Operand};
    use crate::catalog::{Datatype, SystemColumn};
    use crate::condition::{Connector, Operator};
    use crate::preprocess::Rounding;
    use crate::store::SqliteStore;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, SqliteStore, Config, String) {
        let dir = TempDir::new().unwrap();
        let config = Config {
            datasets_root: dir.path().join("data"),
            ..Config::default()
        };
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .upsert_system_column(&SystemColumn::new("loan_amount", Datatype::Currency))
            .unwrap();

        let upload = dir.path().join("tx.csv");
        fs::write(
            &upload,
            "transaction_id,loan_amount,interest,dpd\nT1,1000,100,0\nT2,2000,150,30\nT2,2000,150,30\nT3,500,20,0\n",
        )
        .unwrap();
        let import = TransactionWorkflow::new(&store, &config)
            .init_transaction("Deal 7", &upload, &PrepareOptions::default())
            .unwrap();
        (dir, store, config, import.transaction_id)
    }

    #[test]
    fn test_new_column_phase() {
        let (_dir, store, config, tx) = setup();
        let workflow = TransactionWorkflow::new(&store, &config);

        assert!(workflow.add_column_with_rules(&tx, "total", &[]).is_err());

        workflow.start_new_column_phase(&tx).unwrap();
        let added = workflow
            .add_column_with_rules(
                &tx,
                "total",
                &[Fragment::calculation(
                    "loan_amount",
                    CalcOp::Add,
                    Operand::Column(ColumnRef::parse("interest")),
                )],
            )
            .unwrap();
        assert_eq!(added.datatype, "number");
        assert_eq!(added.sample_values, vec!["1100", "2150", "2150", "520"]);

        let version_id = workflow.finalize_new_columns(&tx).unwrap();
        let transaction = store.require_transaction(&tx).unwrap();
        assert_eq!(transaction.current_version, Some(version_id));
        assert_eq!(transaction.new_added_columns_datatype["total"], "number");
        assert!(transaction.temp_new_column_adding.is_none());
        assert!(transaction.steps.is_done(NEW_COLUMNS_ADDED));
    }

    #[test]
    fn test_datatype_conversion_precedes_new_columns() {
        let (_dir, store, config, tx) = setup();
        let workflow = TransactionWorkflow::new(&store, &config);

        let temp_id = workflow.start_datatype_conversion(&tx).unwrap();
        assert!(workflow.start_new_column_phase(&tx).is_err());
        let fix = NumericFix {
            rounding: Some(Rounding::Down),
            ..NumericFix::default()
        };
        assert_eq!(workflow.update_numeric_column(&tx, "interest", &fix).unwrap().converted, 4);
        assert!(workflow.update_numeric_column(&tx, "missing", &fix).unwrap_err().is_input_error());

        let promoted = workflow.finalize_datatype_conversion(&tx).unwrap();
        assert_eq!(promoted.rows, 4);
        let transaction = store.require_transaction(&tx).unwrap();
        assert_eq!(transaction.current_version, Some(promoted.version_id));
        assert!(transaction.temp_datatype_conversion.is_none());
        assert!(store.get_version(&temp_id).unwrap().is_none());

        workflow.start_new_column_phase(&tx).unwrap();
        assert!(workflow.start_datatype_conversion(&tx).is_err());
        let events = store.events_for("transaction", &tx).unwrap();
        assert!(events.iter().any(|e| e.event_type == "column_datatype_fixed"));
    }

    #[test]
    fn test_boolean_error_leaves_temp_untouched() {
        let (_dir, store, config, tx) = setup();
        let workflow = TransactionWorkflow::new(&store, &config);
        let temp_id = workflow.start_new_column_phase(&tx).unwrap();
        let before = store.require_version(&temp_id).unwrap().file_sha256;

        let err = workflow
            .add_column_with_rules(
                &tx,
                "flag",
                &[
                    Fragment::boolean(true),
                    Fragment::calculation("loan_amount", CalcOp::Add, Operand::Static("1".into())),
                ],
            )
            .unwrap_err();

        assert!(matches!(err, PipelineError::BooleanExpected { .. }));
        assert_eq!(store.require_version(&temp_id).unwrap().file_sha256, before);
        assert!(store.require_transaction(&tx).unwrap().new_added_columns_datatype.is_empty());
    }

    #[test]
    fn test_boolean_column_datatype_recorded() {
        let (_dir, store, config, tx) = setup();
        let workflow = TransactionWorkflow::new(&store, &config);
        workflow.start_new_column_phase(&tx).unwrap();

        let added = workflow
            .add_column_with_rules(
                &tx,
                "large",
                &[
                    Fragment::boolean(true),
                    Fragment::condition("loan_amount", Operator::GreaterOrEqual, Operand::Static("1000".into()), Connector::Then),
                ],
            )
            .unwrap();

        assert_eq!(added.datatype, "boolean");
        assert_eq!(added.sample_values, vec!["True", "True", "True", "False"]);
    }

    #[test]
    fn test_rbi_rules_set_chain_source() {
        let (_dir, store, config, tx) = setup();
        let workflow = TransactionWorkflow::new(&store, &config);
        let selection = RbiSelection {
            duplicate_transaction_ids: true,
            overdue: true,
            ..RbiSelection::default()
        };

        let applied = workflow.apply_rbi_rules(&tx, &selection).unwrap();

        assert_eq!(applied.report.stats_after.rows, 2);
        let transaction = store.require_transaction(&tx).unwrap();
        assert_eq!(transaction.final_rbi_rules_applied, Some(applied.version_id.clone()));
        assert!(transaction.steps.is_done(RBI_RULES_APPLIED));

        // Re-running replaces the previous output
        let again = workflow.apply_rbi_rules(&tx, &selection).unwrap();
        assert!(store.get_version(&applied.version_id).unwrap().is_none());
        assert!(store.get_version(&again.version_id).unwrap().is_some());
    }
}
