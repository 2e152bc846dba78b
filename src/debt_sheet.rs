// 📒 Debt Sheet Workflow - upload, split by tags, rules, finalize
//
// Each operation loads the project document, does its file work, saves
// the document and appends an audit event. Temp versions written by a
// rule run are scratch state: cleared before every run, promoted to
// final versions by `finalize_temp_versions`.

use crate::catalog::ColumnCatalog;
use crate::config::{safe_file_stem, Config};
use crate::conversion::{ColumnFixRequest, ConversionPhase, PromotedConversion};
use crate::dataset::{copy_backing_file, file_sha256, remove_backing_file, Dataset};
use crate::error::{PipelineError, Result};
use crate::migration::{ApplyRule, RulePayload, RuleRunResult, TagKey, UNKNOWN_TYPE};
use crate::pipeline::{
    DATASET_UPLOADED, DATATYPE_CONVERSION_DONE, DATA_VALIDATION_DONE, FINALIZED, HEADER_MAPPING_DONE,
    RULES_APPLIED, SPLIT_BY_TAGS_DONE, TAGS_SELECTED_FOR_RULES,
};
use crate::preprocess::{prepare_dataset, ColumnFix, NumericFix, PrepareOptions, PrepareSummary};
use crate::store::{Event, MetadataStore, ProjectRecord, VersionEntry, VersionRecord};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

const ENTITY: &str = "project";
const ACTOR: &str = "debt_sheet";

const CONVERTED_VERSION: f64 = 2.0;
const SPLIT_VERSION_BASE: u32 = 30;
const FINAL_VERSION_BASE: u32 = 60;
const COMBINED_VERSION: f64 = 7.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectImport {
    pub project_id: String,
    pub version_id: String,
    pub rows: usize,
    pub summary: PrepareSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitPartition {
    pub version_id: String,
    pub tag_name: String,
    pub tag_type: String,
    pub rows: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizeResult {
    pub final_versions: Vec<VersionEntry>,
    pub combined_version_id: String,
    pub combined_rows: usize,
}

pub struct DebtSheetWorkflow<'a, S: MetadataStore> {
    store: &'a S,
    config: &'a Config,
}

impl<'a, S: MetadataStore> DebtSheetWorkflow<'a, S> {
    pub fn new(store: &'a S, config: &'a Config) -> Self {
        DebtSheetWorkflow { store, config }
    }

    fn catalog(&self) -> Result<ColumnCatalog> {
        self.store.column_catalog()
    }

    fn folder(&self, project: &ProjectRecord) -> PathBuf {
        self.config.owner_folder(&project.name)
    }

    fn file_stem(&self, project: &ProjectRecord) -> String {
        format!(
            "{}_original_preprocessed_updated_column_names_datatype_converted",
            safe_file_stem(&project.name)
        )
    }

    fn write(&self, data: &Dataset, path: &Path, catalog: &ColumnCatalog) -> Result<String> {
        data.write_csv(path, catalog, &self.config.date_format)?;
        file_sha256(path)
    }

    fn record(&self, project_id: &str, event_type: &str, data: serde_json::Value) -> Result<()> {
        self.store
            .record_event(&Event::new(event_type, ENTITY, project_id, data, ACTOR))
    }

    /// Delete a version and its file if the record still exists
    fn discard_version(&self, version_id: &str) -> Result<bool> {
        match self.store.get_version(version_id)? {
            Some(version) => {
                remove_backing_file(&version.file_path)?;
                self.store.delete_version(&version.id)
            }
            None => Ok(false),
        }
    }

    // ------------------------------------------------------------------------
    // Upload
    // ------------------------------------------------------------------------

    /// Create a project from an uploaded CSV: clean, rename, convert
    pub fn init_project(&self, name: &str, source: &Path, options: &PrepareOptions) -> Result<ProjectImport> {
        if name.trim().is_empty() {
            return Err(PipelineError::validation("project name is required"));
        }
        let catalog = self.catalog()?;
        let mut data = Dataset::read_csv(source)?;
        let summary = prepare_dataset(&mut data, options, &catalog, &self.config.date_format)?;

        let mut project = ProjectRecord::new(name.trim());
        let path = self.folder(&project).join(format!(
            "{}.{}",
            self.file_stem(&project),
            self.config.default_extension
        ));
        let digest = self.write(&data, &path, &catalog)?;

        let version = VersionRecord::new(&project.id, "Preprocessed and datatype converted upload", &path, CONVERTED_VERSION)
            .with_rows(data.len())
            .with_digest(digest);
        let version_id = self.store.create_version(&version)?;

        project.current_version = Some(version_id.clone());
        for step in [DATASET_UPLOADED, HEADER_MAPPING_DONE, DATATYPE_CONVERSION_DONE] {
            project.steps.complete(step)?;
        }
        if summary.conversion.is_clean() {
            project.steps.complete(DATA_VALIDATION_DONE)?;
        }
        self.store.create_project(&project)?;
        self.record(&project.id, "project_created", json!({ "version_id": version_id, "rows": data.len() }))?;

        tracing::info!(project_id = %project.id, rows = data.len(), "project created");
        Ok(ProjectImport {
            project_id: project.id,
            version_id,
            rows: data.len(),
            summary,
        })
    }

    // ------------------------------------------------------------------------
    // Datatype conversion
    // ------------------------------------------------------------------------

    fn conversion(&self) -> Result<ConversionPhase<'a, S>> {
        Ok(ConversionPhase::new(self.store, self.config, self.catalog()?))
    }

    /// Copy the converted dataset for per-column fixes; only before the tag split
    pub fn start_datatype_conversion(&self, project_id: &str) -> Result<String> {
        let mut project = self.store.require_project(project_id)?;
        project.steps.require(HEADER_MAPPING_DONE)?;
        if project.steps.is_done(SPLIT_BY_TAGS_DONE) {
            return Err(PipelineError::validation(
                "datatype fixes must happen before the dataset is split by tags",
            ));
        }
        let current_id = project
            .current_version
            .clone()
            .ok_or_else(|| PipelineError::validation("project has no converted dataset"))?;
        let current = self.store.require_version(&current_id)?;

        if let Some(previous) = project.temp_datatype_conversion.take() {
            self.discard_version(&previous)?;
        }
        let temp_id = self.conversion()?.start(&project.id, &project.name, &current)?;

        project.temp_datatype_conversion = Some(temp_id.clone());
        project.steps.reset_steps_from(HEADER_MAPPING_DONE)?;
        self.store.save_project(&project)?;
        self.record(&project.id, "datatype_conversion_started", json!({ "version_id": temp_id }))?;
        Ok(temp_id)
    }

    pub fn update_date_format(&self, project_id: &str, column: &str, source_format: &str) -> Result<ColumnFix> {
        let request = ColumnFixRequest::Date {
            source_format: source_format.to_string(),
        };
        self.fix_column(project_id, column, &request)
    }

    pub fn update_numeric_column(&self, project_id: &str, column: &str, fix: &NumericFix) -> Result<ColumnFix> {
        self.fix_column(project_id, column, &ColumnFixRequest::Numeric(fix.clone()))
    }

    pub fn update_currency_column(&self, project_id: &str, column: &str, fix: &NumericFix) -> Result<ColumnFix> {
        self.fix_column(project_id, column, &ColumnFixRequest::Currency(fix.clone()))
    }

    /// Apply one column fix to the project's conversion copy
    pub fn fix_column(&self, project_id: &str, column: &str, request: &ColumnFixRequest) -> Result<ColumnFix> {
        let project = self.store.require_project(project_id)?;
        let temp_id = project
            .temp_datatype_conversion
            .as_deref()
            .ok_or_else(|| PipelineError::validation("start the datatype conversion phase first"))?;
        let fix = self.conversion()?.fix_column(temp_id, column, request)?;
        self.record(
            &project.id,
            "column_datatype_fixed",
            json!({ "column": column, "request": request, "converted": fix.converted }),
        )?;
        Ok(fix)
    }

    /// Promote the fixed copy to the project's converted dataset
    pub fn finalize_datatype_conversion(&self, project_id: &str) -> Result<PromotedConversion> {
        let mut project = self.store.require_project(project_id)?;
        let temp_id = project
            .temp_datatype_conversion
            .clone()
            .ok_or_else(|| PipelineError::validation("no datatype conversion in progress"))?;
        let promoted = self.conversion()?.promote(&project.id, &project.name, &temp_id)?;

        project.temp_datatype_conversion = None;
        project.current_version = Some(promoted.version_id.clone());
        project.steps.complete(DATATYPE_CONVERSION_DONE)?;
        if promoted.report.is_clean() {
            project.steps.complete(DATA_VALIDATION_DONE)?;
        }
        self.store.save_project(&project)?;
        self.record(
            &project.id,
            "datatype_conversion_finalized",
            json!({ "version_id": promoted.version_id, "failed_columns": promoted.report.failed.len() }),
        )?;
        Ok(promoted)
    }

    // ------------------------------------------------------------------------
    // Tag split
    // ------------------------------------------------------------------------

    /// One partition per `(tag_name, tag_type)`; blank tags go to Untagged/Unknown
    pub fn split_by_tags(&self, project_id: &str) -> Result<Vec<SplitPartition>> {
        let mut project = self.store.require_project(project_id)?;
        project.steps.require(DATATYPE_CONVERSION_DONE)?;
        let current_id = project
            .current_version
            .clone()
            .ok_or_else(|| PipelineError::validation("project has no converted dataset"))?;
        let current = self.store.require_version(&current_id)?;
        let catalog = self.catalog()?;
        let data = Dataset::read_csv(&current.file_path)?;
        let groups = data.group_by_pair(&self.config.tag_column, &self.config.tag_type_column)?;

        // Re-splitting replaces everything downstream of the split
        self.clear_downstream(&mut project)?;
        for entry in std::mem::take(&mut project.split_with_tags) {
            self.discard_version(&entry.version_id)?;
        }
        project.steps.reset_steps_from(DATA_VALIDATION_DONE)?;

        let mut merged: Vec<((String, String), Dataset)> = Vec::new();
        for ((name, kind), rows) in groups {
            let key = if name.is_empty() {
                ("Untagged".to_string(), "Unknown".to_string())
            } else if kind.is_empty() {
                (name, "Unknown".to_string())
            } else {
                (name, kind)
            };
            match merged.iter_mut().find(|(k, _)| k == &key) {
                Some((_, existing)) => existing.append(rows),
                None => merged.push((key, rows)),
            }
        }

        let ext = current
            .file_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or(&self.config.default_extension)
            .to_string();
        let mut partitions = Vec::new();
        for (n, ((tag_name, tag_type), rows)) in merged.into_iter().enumerate() {
            let index = n as u32 + 1;
            // Distinct tags can share a sanitized stem; the split index keeps paths apart
            let path = self.folder(&project).join(format!(
                "{}_tags_{}_v3_{index}.{}",
                self.file_stem(&project),
                safe_file_stem(&format!("{tag_name}_{tag_type}")),
                ext
            ));
            let digest = self.write(&rows, &path, &catalog)?;
            let version = VersionRecord::new(
                &project.id,
                format!("Split by tags: {tag_name} - {tag_type}"),
                &path,
                f64::from(SPLIT_VERSION_BASE + index) / 10.0,
            )
            .with_tag(&tag_name, &tag_type)
            .with_rows(rows.len())
            .with_digest(digest);
            let version_id = self.store.create_version(&version)?;

            project
                .split_with_tags
                .push(VersionEntry::new(format!("v3.{index}"), &version_id));
            partitions.push(SplitPartition {
                version_id,
                tag_name,
                tag_type,
                rows: rows.len(),
            });
        }

        project.steps.complete(SPLIT_BY_TAGS_DONE)?;
        self.store.save_project(&project)?;
        self.record(&project.id, "split_by_tags", json!({ "partitions": partitions.len() }))?;

        tracing::info!(project_id = %project.id, partitions = partitions.len(), "dataset split by tags");
        Ok(partitions)
    }

    /// Flag (or unflag) split partitions for the rule engine
    pub fn set_sent_for_rule_addition(&self, project_id: &str, version_ids: &[String], flag: bool) -> Result<usize> {
        let mut project = self.store.require_project(project_id)?;
        project.steps.require(SPLIT_BY_TAGS_DONE)?;
        let split: HashSet<&str> = project
            .split_with_tags
            .iter()
            .map(|e| e.version_id.as_str())
            .collect();

        let mut versions = Vec::new();
        for id in version_ids {
            if !split.contains(id.as_str()) {
                return Err(PipelineError::not_found("split partition", id.clone()));
            }
            versions.push(self.store.require_version(id)?);
        }
        for mut version in versions {
            version.sent_for_rule_addition = flag;
            self.store.update_version(&version)?;
        }

        if flag && !version_ids.is_empty() {
            project.steps.complete(TAGS_SELECTED_FOR_RULES)?;
            self.store.save_project(&project)?;
        }
        self.record(
            &project.id,
            "tags_selected_for_rules",
            json!({ "version_ids": version_ids, "sent_for_rule_addition": flag }),
        )?;
        Ok(version_ids.len())
    }

    pub fn update_bdc_multiplier(&self, project_id: &str, version_id: &str, value: f64) -> Result<()> {
        if !value.is_finite() || value <= 0.0 {
            return Err(PipelineError::validation(format!("invalid bdc multiplier {value}")));
        }
        let project = self.store.require_project(project_id)?;
        let mut version = self.store.require_version(version_id)?;
        if version.owner_id != project.id {
            return Err(PipelineError::not_found("project version", version_id));
        }
        version.bdc_multiplier = value;
        self.store.update_version(&version)?;
        self.record(&project.id, "bdc_multiplier_updated", json!({ "version_id": version_id, "value": value }))
    }

    // ------------------------------------------------------------------------
    // Rules
    // ------------------------------------------------------------------------

    /// Delete every temp version and its file; returns how many went
    pub fn clear_temp_files(&self, project_id: &str) -> Result<usize> {
        let mut project = self.store.require_project(project_id)?;
        let cleared = self.clear_temp(&mut project)?;
        self.store.save_project(&project)?;
        Ok(cleared)
    }

    fn clear_temp(&self, project: &mut ProjectRecord) -> Result<usize> {
        let mut cleared = 0;
        for entry in std::mem::take(&mut project.temp_files) {
            if self.discard_version(&entry.version_id)? {
                cleared += 1;
            }
        }
        if cleared > 0 {
            tracing::debug!(project_id = %project.id, cleared, "temp versions cleared");
        }
        Ok(cleared)
    }

    fn clear_tracking(&self, project: &mut ProjectRecord) -> Result<()> {
        for entry in std::mem::take(&mut project.rows_added_files)
            .into_iter()
            .chain(std::mem::take(&mut project.rows_removed_files))
        {
            self.discard_version(&entry.version_id)?;
        }
        Ok(())
    }

    fn clear_final(&self, project: &mut ProjectRecord) -> Result<()> {
        let split: HashSet<String> = project
            .split_with_tags
            .iter()
            .map(|e| e.version_id.clone())
            .collect();
        for entry in std::mem::take(&mut project.files_with_rules_applied) {
            // Untouched split partitions are referenced, not copied
            if !split.contains(&entry.version_id) {
                self.discard_version(&entry.version_id)?;
            }
        }
        if let Some(combined) = project.combined_version.take() {
            self.discard_version(&combined)?;
        }
        Ok(())
    }

    fn clear_downstream(&self, project: &mut ProjectRecord) -> Result<()> {
        self.clear_temp(project)?;
        self.clear_tracking(project)?;
        self.clear_final(project)
    }

    /// Clear temp state, then run ejection/inclusion over the flagged partitions
    pub fn apply_rules(&self, project_id: &str, payload: &RulePayload) -> Result<RuleRunResult> {
        let mut project = self.store.require_project(project_id)?;
        project.steps.require(SPLIT_BY_TAGS_DONE)?;
        if payload.ejection.is_empty() && payload.acception_rules_for_all_files.is_empty() {
            return Err(PipelineError::validation("rule payload has no ejection or inclusion rules"));
        }
        self.clear_temp(&mut project)?;
        self.store.save_project(&project)?;

        let engine = ApplyRule::new(self.store, self.config, self.catalog()?, project.clone());
        let result = engine.run(payload)?;

        let mut project = self.store.require_project(project_id)?;
        project.steps.complete(RULES_APPLIED)?;
        self.store.save_project(&project)?;
        self.record(
            &project.id,
            "rules_applied",
            json!({
                "ejections": result.ejection_results.len(),
                "inclusions": result.inclusion_results.len(),
                "new_versions": result.new_versions,
            }),
        )?;
        Ok(result)
    }

    // ------------------------------------------------------------------------
    // Finalize / revert
    // ------------------------------------------------------------------------

    /// Promote temp versions to final ones and write the combined dataset
    pub fn finalize_temp_versions(&self, project_id: &str) -> Result<FinalizeResult> {
        let mut project = self.store.require_project(project_id)?;
        if project.temp_files.is_empty() {
            return Err(PipelineError::validation("no temporary versions to finalize; apply rules first"));
        }
        let catalog = self.catalog()?;
        self.clear_final(&mut project)?;

        let mut final_versions = Vec::new();
        let mut finalized_keys = HashSet::new();
        let mut counter = 1;
        for entry in std::mem::take(&mut project.temp_files) {
            let temp = self.store.require_version(&entry.version_id)?;
            let path = final_path(&temp.file_path);
            copy_backing_file(&temp.file_path, &path)?;

            let mut version = VersionRecord::new(
                &project.id,
                format!("Rules applied: {} - {}", temp.tag_name(), temp.tag_type()),
                &path,
                f64::from(FINAL_VERSION_BASE + counter) / 10.0,
            )
            .with_tag(temp.tag_name(), temp.tag_type())
            .with_rows(temp.rows_count)
            .with_changes(temp.rows_added, temp.rows_removed, temp.modified)
            .with_digest(file_sha256(&path)?);
            version.sent_for_rule_addition = true;
            version.bdc_multiplier = temp.bdc_multiplier;
            let version_id = self.store.create_version(&version)?;

            remove_backing_file(&temp.file_path)?;
            self.store.delete_version(&temp.id)?;

            finalized_keys.insert(TagKey::new(temp.tag_name(), temp.tag_type()));
            final_versions.push(VersionEntry::new(entry.key, version_id));
            counter += 1;
        }

        // Flagged partitions that never reached the temp list keep their split version
        for entry in &project.split_with_tags {
            let Some(split) = self.store.get_version(&entry.version_id)? else {
                continue;
            };
            let key = TagKey::new(split.tag_name(), split.tag_type());
            if split.sent_for_rule_addition && !finalized_keys.contains(&key) {
                final_versions.push(VersionEntry::new(split.tag_name(), &split.id));
                finalized_keys.insert(key);
            }
        }

        let mut combined = Dataset::default();
        for entry in &final_versions {
            let version = self.store.require_version(&entry.version_id)?;
            combined.append(Dataset::read_csv(&version.file_path)?);
        }
        let combined_path = self.folder(&project).join(format!(
            "{}_final_combined.{}",
            safe_file_stem(&project.name),
            self.config.default_extension
        ));
        let digest = self.write(&combined, &combined_path, &catalog)?;
        let combined_version = VersionRecord::new(&project.id, "Combined dataset after rules", &combined_path, COMBINED_VERSION)
            .with_tag("combined", UNKNOWN_TYPE)
            .with_rows(combined.len())
            .with_digest(digest);
        let combined_version_id = self.store.create_version(&combined_version)?;

        project.files_with_rules_applied = final_versions.clone();
        project.combined_version = Some(combined_version_id.clone());
        project.steps.complete(FINALIZED)?;
        self.store.save_project(&project)?;
        self.record(
            &project.id,
            "rules_finalized",
            json!({ "final_versions": final_versions.len(), "combined_rows": combined.len() }),
        )?;

        tracing::info!(
            project_id = %project.id,
            partitions = final_versions.len(),
            rows = combined.len(),
            "temp versions finalized"
        );
        Ok(FinalizeResult {
            final_versions,
            combined_version_id,
            combined_rows: combined.len(),
        })
    }

    /// Back to the state right after the tag split
    pub fn revert_to_split_tags(&self, project_id: &str) -> Result<Vec<String>> {
        let mut project = self.store.require_project(project_id)?;
        project.steps.require(SPLIT_BY_TAGS_DONE)?;
        self.clear_downstream(&mut project)?;

        for entry in &project.split_with_tags {
            if let Some(mut version) = self.store.get_version(&entry.version_id)? {
                if version.sent_for_rule_addition {
                    version.sent_for_rule_addition = false;
                    self.store.update_version(&version)?;
                }
            }
        }

        let reset = project.steps.reset_steps_from(SPLIT_BY_TAGS_DONE)?;
        self.store.save_project(&project)?;
        self.record(&project.id, "reverted_to_split_tags", json!({ "reset_steps": reset }))?;
        Ok(reset)
    }
}

/// `..._temp.csv` -> `..._final.csv`
fn final_path(temp: &Path) -> PathBuf {
    let stem = temp.file_stem().and_then(|s| s.to_str()).unwrap_or("partition");
    let stem = stem.strip_suffix("_temp").unwrap_or(stem);
    let ext = temp.extension().and_then(|e| e.to_str()).unwrap_or("csv");
    temp.with_file_name(format!("{stem}_final.{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Datatype, SystemColumn};
    use crate::condition::{Condition, Operator, Outcome};
    use crate::migration::TagRules;
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
            .upsert_system_column(&SystemColumn::new("sanction_amount", Datatype::Currency))
            .unwrap();

        let upload = dir.path().join("upload.csv");
        let mut csv = String::from("Loan No,Sanction Amount,tag_name,tag_type\n");
        for i in 0..6 {
            let tag = if i < 4 { "Lender A" } else { "" };
            csv.push_str(&format!("L{i},\"{},000\",{tag},{}\n", (i + 1) * 50, if i < 4 { "pool" } else { "" }));
        }
        csv.push_str(",,,\n");
        fs::write(&upload, csv).unwrap();

        let options = PrepareOptions {
            rename: [("Sanction Amount".to_string(), "sanction_amount".to_string())]
                .into_iter()
                .collect(),
            drop_duplicates: true,
        };
        let import = DebtSheetWorkflow::new(&store, &config)
            .init_project("Book One", &upload, &options)
            .unwrap();
        assert_eq!(import.summary.blank_rows_dropped, 1);
        (dir, store, config, import.project_id)
    }

    #[test]
    fn test_split_creates_partitions() {
        let (_dir, store, config, project_id) = setup();
        let workflow = DebtSheetWorkflow::new(&store, &config);

        let partitions = workflow.split_by_tags(&project_id).unwrap();

        assert_eq!(partitions.len(), 2);
        assert_eq!((partitions[0].tag_name.as_str(), partitions[0].rows), ("Lender A", 4));
        assert_eq!(partitions[1].tag_name, "Untagged");
        let project = store.require_project(&project_id).unwrap();
        assert_eq!(project.split_with_tags[1].key, "v3.2");
        assert_eq!(store.require_version(&partitions[1].version_id).unwrap().version_number, 3.2);
    }

    #[test]
    fn test_apply_finalize_and_revert() {
        let (_dir, store, config, project_id) = setup();
        let workflow = DebtSheetWorkflow::new(&store, &config);
        let partitions = workflow.split_by_tags(&project_id).unwrap();
        workflow
            .set_sent_for_rule_addition(&project_id, &[partitions[0].version_id.clone()], true)
            .unwrap();

        let payload = RulePayload {
            ejection: vec![TagRules::new(
                "lender a",
                "POOL",
                vec![vec![Condition::new("sanction_amount", Operator::GreaterThan, "120000")
                    .then(Outcome::Reject)]],
            )],
            acception_rules_for_all_files: vec![],
        };
        let result = workflow.apply_rules(&project_id, &payload).unwrap();
        assert_eq!(result.ejection_results[0].ejected_rows, 2);
        assert_eq!(result.new_versions.len(), 2);

        // A second run replaces the temp versions instead of stacking them
        workflow.apply_rules(&project_id, &payload).unwrap();
        assert_eq!(store.require_project(&project_id).unwrap().temp_files.len(), 2);

        let finalized = workflow.finalize_temp_versions(&project_id).unwrap();
        assert_eq!(finalized.final_versions.len(), 2);
        assert_eq!(finalized.combined_rows, 6);
        let project = store.require_project(&project_id).unwrap();
        assert!(project.temp_files.is_empty());
        assert!(project.steps.is_done(FINALIZED));

        let reset = workflow.revert_to_split_tags(&project_id).unwrap();
        assert!(reset.contains(&FINALIZED.to_string()));
        let project = store.require_project(&project_id).unwrap();
        assert!(project.rows_removed_files.is_empty());
        assert!(project.files_with_rules_applied.is_empty());
        assert!(!store.require_version(&partitions[0].version_id).unwrap().sent_for_rule_addition);
    }

    #[test]
    fn test_ejection_requires_flagged_partition() {
        let (_dir, store, config, project_id) = setup();
        let workflow = DebtSheetWorkflow::new(&store, &config);
        workflow.split_by_tags(&project_id).unwrap();

        let payload = RulePayload {
            ejection: vec![TagRules::new("Lender A", "pool", vec![])],
            acception_rules_for_all_files: vec![],
        };
        let err = workflow.apply_rules(&project_id, &payload).unwrap_err();
        assert!(err.is_input_error());
        assert!(store.require_project(&project_id).unwrap().temp_files.is_empty());
    }

    #[test]
    fn test_datatype_conversion_phase() {
        let (_dir, store, config, project_id) = setup();
        let workflow = DebtSheetWorkflow::new(&store, &config);
        let original = store.require_project(&project_id).unwrap().current_version;

        assert!(workflow.update_date_format(&project_id, "sanction_amount", "dd/mm/yyyy").is_err());
        let temp_id = workflow.start_datatype_conversion(&project_id).unwrap();
        assert!(workflow.split_by_tags(&project_id).is_err());

        let halves = NumericFix {
            whole_number_multiplier: Some(0.5),
            ..NumericFix::default()
        };
        let fix = workflow
            .update_currency_column(&project_id, "sanction_amount", &halves)
            .unwrap();
        assert_eq!(fix.converted, 6);
        let promoted = workflow.finalize_datatype_conversion(&project_id).unwrap();

        assert!(store.get_version(&temp_id).unwrap().is_none());
        let project = store.require_project(&project_id).unwrap();
        assert_eq!(project.current_version.as_deref(), Some(promoted.version_id.as_str()));
        assert_ne!(project.current_version, original);
        assert!(project.temp_datatype_conversion.is_none());
        assert!(project.steps.is_done(DATATYPE_CONVERSION_DONE));
        let data = Dataset::read_csv(&store.require_version(&promoted.version_id).unwrap().file_path).unwrap();
        assert_eq!(data.column("sanction_amount").unwrap()[0], "25000");

        workflow.split_by_tags(&project_id).unwrap();
        assert!(workflow.start_datatype_conversion(&project_id).is_err());
    }

    #[test]
    fn test_tags_with_same_file_stem_keep_their_rows() {
        let (dir, store, config, _) = setup();
        let upload = dir.path().join("stems.csv");
        fs::write(
            &upload,
            "loan_no,sanction_amount,tag_name,tag_type\nL1,100,A B,pool\nL2,200,A B,pool\nL3,300,A_B,pool\n",
        )
        .unwrap();
        let workflow = DebtSheetWorkflow::new(&store, &config);
        let project_id = workflow
            .init_project("Stems", &upload, &PrepareOptions::default())
            .unwrap()
            .project_id;

        let partitions = workflow.split_by_tags(&project_id).unwrap();
        assert_eq!(partitions.len(), 2);
        let mut paths = HashSet::new();
        for partition in &partitions {
            let version = store.require_version(&partition.version_id).unwrap();
            assert_eq!(Dataset::read_csv(&version.file_path).unwrap().len(), version.rows_count);
            paths.insert(version.file_path);
        }
        assert_eq!(paths.len(), 2);

        let ids: Vec<String> = partitions.iter().map(|p| p.version_id.clone()).collect();
        workflow.set_sent_for_rule_addition(&project_id, &ids, true).unwrap();
        let payload = RulePayload {
            ejection: vec![TagRules::new(
                "A B",
                "pool",
                vec![vec![Condition::new("sanction_amount", Operator::GreaterThan, "150")
                    .then(Outcome::Reject)]],
            )],
            acception_rules_for_all_files: vec![],
        };
        let result = workflow.apply_rules(&project_id, &payload).unwrap();
        assert_eq!(result.new_versions.len(), 3);

        let mut temp_paths = HashSet::new();
        for entry in &result.new_versions {
            let version = store.require_version(&entry.version_id).unwrap();
            assert_eq!(Dataset::read_csv(&version.file_path).unwrap().len(), version.rows_count);
            temp_paths.insert(version.file_path);
        }
        assert_eq!(temp_paths.len(), 3);
        assert_eq!(workflow.finalize_temp_versions(&project_id).unwrap().combined_rows, 3);
    }

    #[test]
    fn test_final_path_swaps_suffix() {
        assert_eq!(
            final_path(Path::new("/d/book_tags_A_pool_temp.csv")),
            PathBuf::from("/d/book_tags_A_pool_final.csv")
        );
    }
}
