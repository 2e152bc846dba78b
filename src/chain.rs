// 🔗 Version Chains - iterative rule application on transactions
//
// A chain starts at a root copied from the fixed-rule output and grows one
// sub-version at a time. Every version has at most one child, so a chain
// is a path: root (branch 0) -> 1 -> 2 -> ... Deletes keep the branch
// numbers contiguous.

use crate::catalog::ColumnCatalog;
use crate::config::{safe_file_stem, short_id, Config};
use crate::dataset::{copy_backing_file, file_sha256, remove_backing_file};
use crate::error::{ChainViolation, PipelineError, Result};
use crate::pipeline::RULE_VERSIONS_CREATED;
use crate::rules::{DatasetStats, RuleApplication, RuleEngine, RuleGroup, RulesResults};
use crate::store::{ChainLink, Event, MetadataStore, TransactionRecord, VersionRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};

const ROOT_VERSION_BASE: f64 = 9.0;
const CHILD_VERSION_STEP: f64 = 0.01;
const ACTOR: &str = "version_chain";

// ============================================================================
// RESULT TYPES
// ============================================================================

/// Version created by a root or append operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainVersion {
    pub version_id: String,
    pub version_number: f64,
    pub parent_version_id: Option<String>,
    pub root_version_id: String,
    pub branch_level: u32,
    pub branch_number: u32,
    pub file_path: PathBuf,
    pub stats_before: DatasetStats,
    pub stats_after: DatasetStats,
    pub rules_results: RulesResults,
}

/// Flattened chain row for listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleVersionSummary {
    pub version_id: String,
    pub parent_version: Option<String>,
    pub root_version: String,
    pub branch_number: u32,
    pub branch_level: u32,
    pub description: String,
    pub rows_before: usize,
    pub rows_after: usize,
    pub rows_removed: usize,
    pub total_amount_before: f64,
    pub total_amount_after: f64,
    pub amount_removed: f64,
    pub rule_applied: serde_json::Value,
    pub file_path: PathBuf,
    pub version_number: f64,
    pub created_at: DateTime<Utc>,
    pub is_root: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStep {
    pub version_id: String,
    pub branch_number: u32,
    pub description: String,
    pub rows_count: usize,
    pub is_current: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionChain {
    pub chain: Vec<ChainStep>,
    pub current_branch_number: u32,
}

/// What a delete removed or rewired
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChainDeletion {
    pub deleted_versions: Vec<String>,
    /// Child re-parented or promoted after a single-node delete
    pub reconnected_child: Option<String>,
    pub promoted_to_root: bool,
}

// ============================================================================
// MANAGER
// ============================================================================

pub struct VersionChainManager<'a, S: MetadataStore> {
    store: &'a S,
    config: &'a Config,
    catalog: ColumnCatalog,
}

impl<'a, S: MetadataStore> VersionChainManager<'a, S> {
    pub fn new(store: &'a S, config: &'a Config, catalog: ColumnCatalog) -> Self {
        VersionChainManager {
            store,
            config,
            catalog,
        }
    }

    fn engine(&self, transaction: &TransactionRecord) -> RuleEngine {
        let catalog = self.catalog.overlay(transaction.new_added_columns_datatype.iter());
        RuleEngine::new(catalog)
            .with_amount_column(&self.config.loan_amount_column)
            .with_date_format(&self.config.date_format)
    }

    /// Start a new chain from the transaction's fixed-rule output
    pub fn create_root(
        &self,
        transaction_id: &str,
        groups: &[RuleGroup],
        description: Option<&str>,
    ) -> Result<ChainVersion> {
        if groups.is_empty() {
            return Err(PipelineError::validation("at least one rule group is required"));
        }
        let transaction = self.store.require_transaction(transaction_id)?;
        let source_id = transaction.final_rbi_rules_applied.as_deref().ok_or_else(|| {
            PipelineError::validation("fixed rules have not been finalized for this transaction")
        })?;
        let source = self.store.require_version(source_id)?;

        let root_number = transaction.rule_application_root_versions.len() + 1;
        let highest = self.store.highest_version_number(&transaction.id)?.unwrap_or(0.0);
        let version_number = (highest + 1.0).max(ROOT_VERSION_BASE + root_number as f64);

        let stem = format!(
            "{}_rules_v{}_{}",
            safe_file_stem(&transaction.name),
            root_number,
            short_id()
        );
        let path = self.target_path(&transaction, &source, &stem);
        let application = self.copy_and_apply(&transaction, &source.file_path, &path, groups)?;

        let mut version = VersionRecord::new(
            &transaction.id,
            description
                .map(str::to_string)
                .unwrap_or_else(|| format!("Rule application v{root_number}")),
            &path,
            version_number,
        )
        .with_rows(application.stats_after.rows)
        .with_digest(file_sha256(&path)?);
        let root_id = version.id.clone();
        version = version.with_chain(ChainLink {
            parent_version_id: None,
            root_version_id: root_id.clone(),
            branch_level: 0,
            branch_number: 0,
            rule_applied: json!({ "rules": groups }),
            stats_before_rule: application.stats_before,
            stats_after_rule: application.stats_after,
        });

        self.store.create_version(&version)?;
        self.store
            .add_rule_application_root_version(&transaction.id, &root_id)?;
        self.finish_step(&transaction.id, "rule_version_root_created", &version)?;

        tracing::info!(
            transaction_id = %transaction.id,
            version_id = %root_id,
            rows = application.stats_after.rows,
            "rule chain root created"
        );
        Ok(chain_version(&version, application))
    }

    /// Add the single sub-version of `parent_id`
    pub fn append_child(
        &self,
        transaction_id: &str,
        parent_id: &str,
        groups: &[RuleGroup],
        description: Option<&str>,
    ) -> Result<ChainVersion> {
        if groups.is_empty() {
            return Err(PipelineError::validation("at least one rule group is required"));
        }
        let transaction = self.store.require_transaction(transaction_id)?;
        let parent = self.store.require_version(parent_id)?;
        let link = self.chain_link(&transaction, &parent)?;

        if let Some(child) = self.store.find_child(&parent.id)? {
            return Err(ChainViolation::AlreadyHasChild {
                parent: parent.id.clone(),
                existing_child: child.id,
            }
            .into());
        }

        let branch_number = link.branch_number + 1;
        let highest = self
            .store
            .highest_version_number(&transaction.id)?
            .unwrap_or(parent.version_number);
        let version_number = round_hundredths(highest + CHILD_VERSION_STEP);

        let stem = format!(
            "{}_rules_branch{}_{}",
            safe_file_stem(&transaction.name),
            branch_number,
            short_id()
        );
        let path = self.target_path(&transaction, &parent, &stem);
        let application = self.copy_and_apply(&transaction, &parent.file_path, &path, groups)?;

        let version = VersionRecord::new(
            &transaction.id,
            description
                .map(str::to_string)
                .unwrap_or_else(|| format!("Sub-version {branch_number} of {}", parent.description)),
            &path,
            version_number,
        )
        .with_rows(application.stats_after.rows)
        .with_digest(file_sha256(&path)?)
        .with_chain(ChainLink {
            parent_version_id: Some(parent.id.clone()),
            root_version_id: link.root_version_id.clone(),
            branch_level: link.branch_level + 1,
            branch_number,
            rule_applied: json!({ "rules": groups }),
            stats_before_rule: application.stats_before,
            stats_after_rule: application.stats_after,
        });

        self.store.create_version(&version)?;
        self.finish_step(&transaction.id, "rule_version_appended", &version)?;

        tracing::info!(
            transaction_id = %transaction.id,
            version_id = %version.id,
            parent = %parent.id,
            branch_number,
            "sub-version created"
        );
        Ok(chain_version(&version, application))
    }

    /// Delete `version_id` and every version below it
    pub fn delete_chain(&self, transaction_id: &str, version_id: &str) -> Result<ChainDeletion> {
        let transaction = self.store.require_transaction(transaction_id)?;
        let start = self.store.require_version(version_id)?;
        let link = self.chain_link(&transaction, &start)?;

        let mut deletion = ChainDeletion::default();
        let mut current = Some(start);
        while let Some(version) = current {
            current = self.store.find_child(&version.id)?;
            remove_backing_file(&version.file_path)?;
            self.store.delete_version(&version.id)?;
            deletion.deleted_versions.push(version.id);
        }

        if link.parent_version_id.is_none() {
            self.store
                .remove_rule_application_root_version(&transaction.id, version_id)?;
        }
        self.record(&transaction.id, "rule_chain_deleted", json!(deletion))?;

        tracing::info!(
            transaction_id = %transaction.id,
            version_id,
            deleted = deletion.deleted_versions.len(),
            "rule chain deleted"
        );
        Ok(deletion)
    }

    /// Delete one version and splice its child into its place
    pub fn delete_node(&self, transaction_id: &str, version_id: &str) -> Result<ChainDeletion> {
        let transaction = self.store.require_transaction(transaction_id)?;
        let node = self.store.require_version(version_id)?;
        let link = self.chain_link(&transaction, &node)?;

        let children = self.store.find_children(&node.id)?;
        if children.len() > 1 {
            return Err(ChainViolation::MultipleChildren {
                version: node.id.clone(),
                children: children.len(),
            }
            .into());
        }

        let mut deletion = ChainDeletion::default();
        if let Some(mut child) = children.into_iter().next() {
            let child_id = child.id.clone();
            match &link.parent_version_id {
                Some(parent_id) => {
                    if let Some(child_link) = child.chain.as_mut() {
                        child_link.parent_version_id = Some(parent_id.clone());
                        child_link.branch_level = child_link.branch_level.saturating_sub(1);
                        child_link.branch_number = child_link.branch_number.saturating_sub(1);
                    }
                    self.store.update_version(&child)?;
                    self.shift_descendants(&child_id, |l| {
                        l.branch_level = l.branch_level.saturating_sub(1);
                        l.branch_number = l.branch_number.saturating_sub(1);
                    })?;
                }
                None => {
                    if let Some(child_link) = child.chain.as_mut() {
                        child_link.parent_version_id = None;
                        child_link.root_version_id = child_id.clone();
                        child_link.branch_level = 0;
                        child_link.branch_number = 0;
                    }
                    self.store.update_version(&child)?;
                    let new_root = child_id.clone();
                    self.shift_descendants(&child_id, move |l| {
                        l.root_version_id = new_root.clone();
                        l.branch_level = l.branch_level.saturating_sub(1);
                        l.branch_number = l.branch_number.saturating_sub(1);
                    })?;
                    self.store
                        .replace_rule_application_root_version(&transaction.id, &node.id, &child_id)?;
                    deletion.promoted_to_root = true;
                }
            }
            deletion.reconnected_child = Some(child_id);
        }

        if link.parent_version_id.is_none() && !deletion.promoted_to_root {
            self.store
                .remove_rule_application_root_version(&transaction.id, &node.id)?;
        }
        remove_backing_file(&node.file_path)?;
        self.store.delete_version(&node.id)?;
        deletion.deleted_versions.push(node.id.clone());
        self.record(&transaction.id, "rule_version_deleted", json!(deletion))?;

        tracing::info!(
            transaction_id = %transaction.id,
            version_id,
            reconnected = ?deletion.reconnected_child,
            "rule version deleted"
        );
        Ok(deletion)
    }

    /// `delete_children=false` splices, otherwise the whole tail goes
    pub fn delete(&self, transaction_id: &str, version_id: &str, delete_children: bool) -> Result<ChainDeletion> {
        if delete_children {
            self.delete_chain(transaction_id, version_id)
        } else {
            self.delete_node(transaction_id, version_id)
        }
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Every chain of the transaction, flattened root first
    pub fn list_rule_versions(&self, transaction_id: &str) -> Result<Vec<RuleVersionSummary>> {
        let transaction = self.store.require_transaction(transaction_id)?;
        let mut summaries = Vec::new();
        for root_id in &transaction.rule_application_root_versions {
            let mut chain = self.walk_from(root_id)?;
            chain.sort_by_key(|v| v.chain.as_ref().map_or(0, |l| l.branch_number));
            summaries.extend(chain.iter().map(summarize));
        }
        Ok(summaries)
    }

    /// The chain containing `version_id`, with that version flagged
    pub fn get_version_chain(&self, version_id: &str) -> Result<VersionChain> {
        let version = self.store.require_version(version_id)?;
        let root_id = version
            .chain
            .as_ref()
            .map(|l| l.root_version_id.clone())
            .unwrap_or_else(|| version.id.clone());

        let chain = self
            .walk_from(&root_id)?
            .into_iter()
            .map(|v| ChainStep {
                is_current: v.id == version.id,
                branch_number: v.chain.as_ref().map_or(0, |l| l.branch_number),
                rows_count: v.chain.as_ref().map_or(v.rows_count, |l| l.stats_after_rule.rows),
                description: v.description,
                version_id: v.id,
            })
            .collect();

        Ok(VersionChain {
            chain,
            current_branch_number: version.chain.as_ref().map_or(0, |l| l.branch_number),
        })
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn chain_link(&self, transaction: &TransactionRecord, version: &VersionRecord) -> Result<ChainLink> {
        if version.owner_id != transaction.id {
            return Err(PipelineError::not_found("rule version of transaction", version.id.clone()));
        }
        version.chain.clone().ok_or_else(|| {
            PipelineError::validation(format!("version {} is not a rule application version", version.id))
        })
    }

    fn target_path(&self, transaction: &TransactionRecord, source: &VersionRecord, stem: &str) -> PathBuf {
        let ext = source
            .file_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or(&self.config.default_extension);
        self.config
            .owner_folder(&transaction.name)
            .join(format!("{stem}.{ext}"))
    }

    /// Copy the source and run the groups; the copy is removed on failure
    fn copy_and_apply(
        &self,
        transaction: &TransactionRecord,
        source: &Path,
        target: &Path,
        groups: &[RuleGroup],
    ) -> Result<RuleApplication> {
        copy_backing_file(source, target)?;
        match self.engine(transaction).apply_to_file(target, groups) {
            Ok(application) => Ok(application),
            Err(e) => {
                remove_backing_file(target)?;
                Err(e)
            }
        }
    }

    fn walk_from(&self, root_id: &str) -> Result<Vec<VersionRecord>> {
        let mut chain = Vec::new();
        let mut current = self.store.get_version(root_id)?;
        while let Some(version) = current {
            current = self.store.find_child(&version.id)?;
            chain.push(version);
        }
        Ok(chain)
    }

    /// Apply `adjust` to every version below `version_id`
    fn shift_descendants<F>(&self, version_id: &str, mut adjust: F) -> Result<()>
    where
        F: FnMut(&mut ChainLink),
    {
        let mut current = self.store.find_child(version_id)?;
        while let Some(mut version) = current {
            current = self.store.find_child(&version.id)?;
            if let Some(link) = version.chain.as_mut() {
                adjust(link);
            }
            self.store.update_version(&version)?;
        }
        Ok(())
    }

    fn finish_step(&self, transaction_id: &str, event_type: &str, version: &VersionRecord) -> Result<()> {
        let mut transaction = self.store.require_transaction(transaction_id)?;
        transaction.steps.complete(RULE_VERSIONS_CREATED)?;
        self.store.save_transaction(&transaction)?;
        self.record(
            transaction_id,
            event_type,
            json!({
                "version_id": version.id,
                "version_number": version.version_number,
                "rows": version.rows_count,
            }),
        )
    }

    fn record(&self, transaction_id: &str, event_type: &str, data: serde_json::Value) -> Result<()> {
        self.store
            .record_event(&Event::new(event_type, "transaction", transaction_id, data, ACTOR))
    }
}

fn chain_version(version: &VersionRecord, application: RuleApplication) -> ChainVersion {
    let link = version.chain.as_ref();
    ChainVersion {
        version_id: version.id.clone(),
        version_number: version.version_number,
        parent_version_id: link.and_then(|l| l.parent_version_id.clone()),
        root_version_id: link.map_or_else(|| version.id.clone(), |l| l.root_version_id.clone()),
        branch_level: link.map_or(0, |l| l.branch_level),
        branch_number: link.map_or(0, |l| l.branch_number),
        file_path: version.file_path.clone(),
        stats_before: application.stats_before,
        stats_after: application.stats_after,
        rules_results: application.results,
    }
}

fn summarize(version: &VersionRecord) -> RuleVersionSummary {
    let link = version.chain.as_ref();
    let before = link.map(|l| l.stats_before_rule).unwrap_or_default();
    let after = link.map(|l| l.stats_after_rule).unwrap_or_default();
    let branch_number = link.map_or(0, |l| l.branch_number);
    RuleVersionSummary {
        version_id: version.id.clone(),
        parent_version: link.and_then(|l| l.parent_version_id.clone()),
        root_version: link.map_or_else(|| version.id.clone(), |l| l.root_version_id.clone()),
        branch_number,
        branch_level: link.map_or(0, |l| l.branch_level),
        description: version.description.clone(),
        rows_before: before.rows,
        rows_after: after.rows,
        rows_removed: before.rows.saturating_sub(after.rows),
        total_amount_before: before.loan_amount,
        total_amount_after: after.loan_amount,
        amount_removed: before.loan_amount - after.loan_amount,
        rule_applied: link
            .and_then(|l| l.rule_applied.get("rules").cloned())
            .unwrap_or_else(|| json!([])),
        file_path: version.file_path.clone(),
        version_number: version.version_number,
        created_at: version.created_at,
        is_root: branch_number == 0,
    }
}

fn round_hundredths(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Datatype;
    use crate::condition::{Condition, Operator, Outcome};
    use crate::dataset::Dataset;
    use crate::store::SqliteStore;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: SqliteStore,
        config: Config,
        transaction_id: String,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = Config {
            datasets_root: dir.path().to_path_buf(),
            ..Config::default()
        };
        let store = SqliteStore::open_in_memory().unwrap();

        let mut transaction = TransactionRecord::new("Pool A");
        let source_path = config.owner_folder(&transaction.name).join("pool_rbi_final.csv");
        let data = Dataset::from_rows(
            ["loan_id", "loan_amount", "dpd"],
            (0..10)
                .map(|i| vec![format!("L{i}"), format!("{}", (i + 1) * 100), format!("{}", i * 10)])
                .collect(),
        );
        data.write_csv(&source_path, &ColumnCatalog::new(), "%d/%m/%Y").unwrap();

        let source = VersionRecord::new(&transaction.id, "fixed rules", &source_path, 8.0).with_rows(10);
        store.create_version(&source).unwrap();
        transaction.final_rbi_rules_applied = Some(source.id.clone());
        store.create_transaction(&transaction).unwrap();

        Fixture {
            _dir: dir,
            store,
            config,
            transaction_id: transaction.id,
        }
    }

    fn manager(f: &Fixture) -> VersionChainManager<'_, SqliteStore> {
        let catalog = ColumnCatalog::new()
            .with("dpd", Datatype::Number)
            .with("loan_amount", Datatype::Currency);
        VersionChainManager::new(&f.store, &f.config, catalog)
    }

    fn drop_dpd_over(limit: u32) -> Vec<RuleGroup> {
        vec![vec![
            Condition::new("dpd", Operator::GreaterThan, limit.to_string()).then(Outcome::Reject)
        ]]
    }

    #[test]
    fn test_create_root_applies_rules() {
        let f = fixture();
        let root = manager(&f).create_root(&f.transaction_id, &drop_dpd_over(60), None).unwrap();

        assert_eq!(root.branch_number, 0);
        assert_eq!(root.root_version_id, root.version_id);
        assert_eq!(root.stats_before.rows, 10);
        assert_eq!(root.stats_after.rows, 7);
        assert_eq!(root.stats_before.loan_amount, 5500.0);
        assert_eq!(root.version_number, 10.0);

        let transaction = f.store.require_transaction(&f.transaction_id).unwrap();
        assert_eq!(transaction.rule_application_root_versions, vec![root.version_id.clone()]);
        assert!(transaction.steps.is_done(RULE_VERSIONS_CREATED));
    }

    #[test]
    fn test_root_requires_finalized_fixed_rules() {
        let f = fixture();
        let bare = TransactionRecord::new("Empty");
        f.store.create_transaction(&bare).unwrap();

        let err = manager(&f).create_root(&bare.id, &drop_dpd_over(60), None).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn test_second_child_is_rejected_without_side_effects() {
        let f = fixture();
        let m = manager(&f);
        let root = m.create_root(&f.transaction_id, &drop_dpd_over(80), None).unwrap();
        let child = m
            .append_child(&f.transaction_id, &root.version_id, &drop_dpd_over(50), None)
            .unwrap();
        assert_eq!(child.branch_number, 1);
        assert_eq!(child.root_version_id, root.version_id);

        let versions_before = f.store.versions_for_owner(&f.transaction_id).unwrap().len();
        let folder = f.config.owner_folder("Pool A");
        let files_before = std::fs::read_dir(&folder).unwrap().count();

        let err = m
            .append_child(&f.transaction_id, &root.version_id, &drop_dpd_over(10), None)
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Chain(ChainViolation::AlreadyHasChild { ref existing_child, .. })
                if existing_child == &child.version_id
        ));
        assert_eq!(f.store.versions_for_owner(&f.transaction_id).unwrap().len(), versions_before);
        assert_eq!(std::fs::read_dir(&folder).unwrap().count(), files_before);

        // Independent roots still work
        assert!(m.create_root(&f.transaction_id, &drop_dpd_over(10), None).is_ok());
    }

    #[test]
    fn test_delete_node_renumbers_descendants() {
        let f = fixture();
        let m = manager(&f);
        let root = m.create_root(&f.transaction_id, &drop_dpd_over(90), None).unwrap();
        let v1 = m.append_child(&f.transaction_id, &root.version_id, &drop_dpd_over(80), None).unwrap();
        let v2 = m.append_child(&f.transaction_id, &v1.version_id, &drop_dpd_over(70), None).unwrap();
        let v3 = m.append_child(&f.transaction_id, &v2.version_id, &drop_dpd_over(60), None).unwrap();

        let deletion = m.delete_node(&f.transaction_id, &v1.version_id).unwrap();
        assert_eq!(deletion.reconnected_child, Some(v2.version_id.clone()));

        let chain = m.get_version_chain(&v3.version_id).unwrap();
        let ids: Vec<_> = chain.chain.iter().map(|s| s.version_id.clone()).collect();
        let numbers: Vec<_> = chain.chain.iter().map(|s| s.branch_number).collect();
        assert_eq!(ids, vec![root.version_id.clone(), v2.version_id.clone(), v3.version_id.clone()]);
        assert_eq!(numbers, vec![0, 1, 2]);
        assert_eq!(chain.current_branch_number, 2);

        let v3_record = f.store.require_version(&v3.version_id).unwrap();
        assert_eq!(v3_record.chain.unwrap().branch_level, 2);
        assert!(!v1.file_path.exists());
    }

    #[test]
    fn test_delete_root_promotes_child() {
        let f = fixture();
        let m = manager(&f);
        let root = m.create_root(&f.transaction_id, &drop_dpd_over(90), None).unwrap();
        let v1 = m.append_child(&f.transaction_id, &root.version_id, &drop_dpd_over(80), None).unwrap();
        let v2 = m.append_child(&f.transaction_id, &v1.version_id, &drop_dpd_over(70), None).unwrap();

        let deletion = m.delete_node(&f.transaction_id, &root.version_id).unwrap();
        assert!(deletion.promoted_to_root);

        let transaction = f.store.require_transaction(&f.transaction_id).unwrap();
        assert_eq!(transaction.rule_application_root_versions, vec![v1.version_id.clone()]);

        let v2_link = f.store.require_version(&v2.version_id).unwrap().chain.unwrap();
        assert_eq!(v2_link.root_version_id, v1.version_id);
        assert_eq!(v2_link.branch_number, 1);
    }

    #[test]
    fn test_delete_chain_removes_tail_and_root_entry() {
        let f = fixture();
        let m = manager(&f);
        let root = m.create_root(&f.transaction_id, &drop_dpd_over(90), None).unwrap();
        let v1 = m.append_child(&f.transaction_id, &root.version_id, &drop_dpd_over(80), None).unwrap();

        let deletion = m.delete_chain(&f.transaction_id, &root.version_id).unwrap();

        assert_eq!(deletion.deleted_versions, vec![root.version_id.clone(), v1.version_id.clone()]);
        assert!(f.store.get_version(&v1.version_id).unwrap().is_none());
        assert!(f
            .store
            .require_transaction(&f.transaction_id)
            .unwrap()
            .rule_application_root_versions
            .is_empty());
        assert!(m.list_rule_versions(&f.transaction_id).unwrap().is_empty());
    }

    #[test]
    fn test_list_reports_removed_rows_and_amounts() {
        let f = fixture();
        let m = manager(&f);
        let root = m.create_root(&f.transaction_id, &drop_dpd_over(70), None).unwrap();
        m.append_child(&f.transaction_id, &root.version_id, &drop_dpd_over(40), None)
            .unwrap();

        let listed = m.list_rule_versions(&f.transaction_id).unwrap();

        assert_eq!(listed.len(), 2);
        assert!(listed[0].is_root);
        assert_eq!(listed[0].rows_removed, 2);
        assert_eq!(listed[0].amount_removed, 1900.0);
        assert_eq!(listed[1].rows_before, 8);
        assert_eq!(listed[1].rows_after, 5);
        assert_eq!(listed[1].branch_number, 1);
    }
}
