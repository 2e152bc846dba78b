// 🔀 Row Migration - ejection/inclusion between tag partitions
//
// One run owns a `PartitionSet` built from the project's split versions:
// every partition flagged for rule addition that a rule references, plus
// the untagged/unknown pool. Ejections run first and push rows into the
// pool; inclusions then pull rows out of the post-ejection pool. Every
// move is recorded in a `RowLedger`, which becomes the rows-added and
// rows-removed audit files.

use crate::catalog::ColumnCatalog;
use crate::condition::Outcome;
use crate::config::{safe_file_stem, short_id, Config};
use crate::dataset::{file_sha256, remove_backing_file, Dataset};
use crate::error::{PipelineError, Result};
use crate::rules::{build_mask, RuleGroup};
use crate::store::{MetadataStore, ProjectRecord, VersionEntry, VersionRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const FROM_TAG_COLUMN: &str = "from_tag";
pub const UNTAGGED_NAME: &str = "untagged";
pub const UNKNOWN_TYPE: &str = "unknown";

const TEMP_VERSION_MAJOR: u32 = 4;
const ROWS_REMOVED_VERSION: f64 = 5.0;
const ROWS_ADDED_VERSION: f64 = 5.1;

// ============================================================================
// TAG KEYS
// ============================================================================

/// Case-insensitive identity of a partition
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TagKey {
    name: String,
    kind: String,
}

impl TagKey {
    pub fn new(tag_name: &str, tag_type: &str) -> Self {
        TagKey {
            name: tag_name.trim().to_lowercase(),
            kind: tag_type.trim().to_lowercase(),
        }
    }

    pub fn untagged() -> Self {
        TagKey::new(UNTAGGED_NAME, UNKNOWN_TYPE)
    }

    pub fn is_untagged(&self) -> bool {
        self.name == UNTAGGED_NAME && self.kind == UNKNOWN_TYPE
    }

    /// Label used in audit file names and tracking entries
    fn label(&self) -> String {
        if self.is_untagged() {
            UNTAGGED_NAME.to_string()
        } else {
            safe_file_stem(&format!("{}_{}", self.name, self.kind))
        }
    }
}

impl fmt::Display for TagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.name, self.kind)
    }
}

// ============================================================================
// PAYLOAD
// ============================================================================

/// Rule groups aimed at one tag partition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagRules {
    #[serde(default)]
    pub version_id: Option<String>,
    pub tag_name: String,
    pub tag_type: String,
    #[serde(default)]
    pub rules: Vec<RuleGroup>,
}

impl TagRules {
    pub fn new(tag_name: impl Into<String>, tag_type: impl Into<String>, rules: Vec<RuleGroup>) -> Self {
        TagRules {
            version_id: None,
            tag_name: tag_name.into(),
            tag_type: tag_type.into(),
            rules,
        }
    }

    fn key(&self) -> TagKey {
        TagKey::new(&self.tag_name, &self.tag_type)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulePayload {
    #[serde(default)]
    pub ejection: Vec<TagRules>,

    #[serde(default, alias = "inclusion")]
    pub acception_rules_for_all_files: Vec<TagRules>,
}

impl RulePayload {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    fn referenced_keys(&self) -> HashSet<TagKey> {
        self.ejection
            .iter()
            .chain(&self.acception_rules_for_all_files)
            .map(TagRules::key)
            .collect()
    }
}

// ============================================================================
// RESULTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EjectionResult {
    pub tag_name: String,
    pub tag_type: String,
    pub rule_type: Outcome,
    pub rule_group: RuleGroup,
    pub ejected_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InclusionResult {
    pub tag_name: String,
    pub tag_type: String,
    pub rule_type: Outcome,
    pub rule_group: RuleGroup,
    pub added_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRunResult {
    pub ejection_results: Vec<EjectionResult>,
    pub inclusion_results: Vec<InclusionResult>,
    /// `{tag_name: version_id}` for every temp version written
    pub new_versions: Vec<VersionEntry>,
    pub rows_removed_files: Vec<VersionEntry>,
    pub rows_added_files: Vec<VersionEntry>,
}

// ============================================================================
// PARTITIONS
// ============================================================================

#[derive(Debug, Clone)]
pub struct Partition {
    pub key: TagKey,
    pub tag_name: String,
    pub tag_type: String,
    pub data: Dataset,
    /// Split version the partition was loaded from (None when created by an inclusion)
    pub source: Option<VersionRecord>,
}

/// Named partitions plus the untagged pool, owned by one run
#[derive(Debug, Clone, Default)]
pub struct PartitionSet {
    partitions: Vec<Partition>,
    untagged: Dataset,
    untagged_sources: Vec<VersionRecord>,
}

impl PartitionSet {
    pub fn new(untagged: Dataset) -> Self {
        PartitionSet {
            partitions: Vec::new(),
            untagged,
            untagged_sources: Vec::new(),
        }
    }

    pub fn insert(&mut self, partition: Partition) {
        match self.get_mut(&partition.key) {
            Some(existing) => existing.data.append(partition.data),
            None => self.partitions.push(partition),
        }
    }

    pub fn get(&self, key: &TagKey) -> Option<&Partition> {
        self.partitions.iter().find(|p| &p.key == key)
    }

    pub fn get_mut(&mut self, key: &TagKey) -> Option<&mut Partition> {
        self.partitions.iter_mut().find(|p| &p.key == key)
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn untagged(&self) -> &Dataset {
        &self.untagged
    }

    /// Rows across every partition including the untagged pool
    pub fn total_rows(&self) -> usize {
        self.untagged.len() + self.partitions.iter().map(|p| p.data.len()).sum::<usize>()
    }
}

// ============================================================================
// LEDGER
// ============================================================================

/// Rows removed from / added to each partition during one run
#[derive(Debug, Clone, Default)]
pub struct RowLedger {
    ejected: Vec<(TagKey, Dataset)>,
    injected: Vec<(TagKey, Dataset)>,
}

impl RowLedger {
    fn record(entries: &mut Vec<(TagKey, Dataset)>, key: &TagKey, rows: &Dataset) {
        match entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => existing.append(rows.clone()),
            None => entries.push((key.clone(), rows.clone())),
        }
    }

    pub fn record_ejected(&mut self, key: &TagKey, rows: &Dataset) {
        Self::record(&mut self.ejected, key, rows);
    }

    pub fn record_injected(&mut self, key: &TagKey, rows: &Dataset) {
        Self::record(&mut self.injected, key, rows);
    }

    pub fn ejected_count(&self, key: &TagKey) -> usize {
        Self::count(&self.ejected, key)
    }

    pub fn injected_count(&self, key: &TagKey) -> usize {
        Self::count(&self.injected, key)
    }

    fn count(entries: &[(TagKey, Dataset)], key: &TagKey) -> usize {
        entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, rows)| rows.len())
            .unwrap_or(0)
    }
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct ApplyRule<'a, S: MetadataStore> {
    store: &'a S,
    config: &'a Config,
    catalog: ColumnCatalog,
    project: ProjectRecord,
}

impl<'a, S: MetadataStore> ApplyRule<'a, S> {
    pub fn new(store: &'a S, config: &'a Config, catalog: ColumnCatalog, project: ProjectRecord) -> Self {
        ApplyRule {
            store,
            config,
            catalog,
            project,
        }
    }

    /// Load, eject, include, persist, audit
    pub fn run(&self, payload: &RulePayload) -> Result<RuleRunResult> {
        let split = self.split_versions()?;
        self.validate(payload, &split)?;

        let mut set = self.load_partitions(payload, &split)?;
        let rows_before = set.total_rows();
        let mut ledger = RowLedger::default();

        let ejection_results = apply_ejections(&mut set, &mut ledger, &payload.ejection, &self.catalog);
        let inclusion_results =
            apply_inclusions(&mut set, &mut ledger, &payload.acception_rules_for_all_files, &self.catalog);

        debug_assert_eq!(rows_before, set.total_rows());
        tracing::info!(
            project_id = %self.project.id,
            rows = rows_before,
            ejections = ejection_results.len(),
            inclusions = inclusion_results.len(),
            "rules evaluated"
        );

        let new_versions = self.persist(&set, &ledger, &split)?;
        let (rows_removed_files, rows_added_files) = self.write_audit_files(&ledger)?;

        Ok(RuleRunResult {
            ejection_results,
            inclusion_results,
            new_versions,
            rows_removed_files,
            rows_added_files,
        })
    }

    fn split_versions(&self) -> Result<Vec<VersionRecord>> {
        let mut versions = Vec::new();
        for entry in &self.project.split_with_tags {
            match self.store.get_version(&entry.version_id)? {
                Some(version) => versions.push(version),
                None => tracing::warn!(version_id = %entry.version_id, "split version record missing"),
            }
        }
        Ok(versions)
    }

    /// Reject malformed payloads before any file is touched
    fn validate(&self, payload: &RulePayload, split: &[VersionRecord]) -> Result<()> {
        let flagged: HashSet<TagKey> = split
            .iter()
            .filter(|v| v.sent_for_rule_addition)
            .map(|v| TagKey::new(v.tag_name(), v.tag_type()))
            .collect();

        for rule in payload.ejection.iter().chain(&payload.acception_rules_for_all_files) {
            if rule.tag_name.trim().is_empty() || rule.tag_type.trim().is_empty() {
                return Err(PipelineError::validation("every rule entry needs tag_name and tag_type"));
            }
        }

        for rule in &payload.ejection {
            let key = rule.key();
            if key.is_untagged() {
                return Err(PipelineError::validation(
                    "ejection rules cannot target the untagged partition",
                ));
            }
            if !flagged.contains(&key) {
                return Err(PipelineError::not_found("tag partition sent for rule addition", key.to_string()));
            }
        }

        if payload
            .acception_rules_for_all_files
            .iter()
            .any(|rule| rule.key().is_untagged())
        {
            return Err(PipelineError::validation(
                "inclusion rules cannot target the untagged partition",
            ));
        }
        Ok(())
    }

    fn load_partitions(&self, payload: &RulePayload, split: &[VersionRecord]) -> Result<PartitionSet> {
        let referenced = payload.referenced_keys();
        let mut set = PartitionSet::default();
        let mut untagged: Option<Dataset> = None;

        for version in split {
            let key = TagKey::new(version.tag_name(), version.tag_type());
            if key.is_untagged() {
                let mut data = Dataset::read_csv(&version.file_path)?;
                data.ensure_column(FROM_TAG_COLUMN, "");
                match untagged.as_mut() {
                    Some(pool) => pool.append(data),
                    None => untagged = Some(data),
                }
                set.untagged_sources.push(version.clone());
                continue;
            }
            if !version.sent_for_rule_addition || !referenced.contains(&key) {
                continue;
            }

            let mut data = Dataset::read_csv(&version.file_path)?;
            data.ensure_column(FROM_TAG_COLUMN, "");
            tracing::debug!(tag = %key, rows = data.len(), "partition loaded");
            set.insert(Partition {
                key,
                tag_name: version.tag_name().to_string(),
                tag_type: version.tag_type().to_string(),
                data,
                source: Some(version.clone()),
            });
        }

        set.untagged = match untagged {
            Some(pool) => pool,
            None => {
                // Empty pool with the schema of the first loaded partition
                let columns = set
                    .partitions
                    .first()
                    .map(|p| p.data.columns().to_vec())
                    .unwrap_or_else(|| vec![FROM_TAG_COLUMN.to_string()]);
                Dataset::new(columns)
            }
        };
        Ok(set)
    }

    // ------------------------------------------------------------------------
    // Persist
    // ------------------------------------------------------------------------

    fn project_folder(&self) -> PathBuf {
        self.config.owner_folder(&self.project.name)
    }

    fn extension_of(&self, version: Option<&VersionRecord>) -> String {
        version
            .and_then(|v| v.file_path.extension())
            .and_then(|e| e.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| self.config.default_extension.clone())
    }

    /// The counter keeps tags that sanitize to the same stem apart
    fn temp_path(&self, tag_name: &str, tag_type: &str, counter: u32, ext: &str) -> PathBuf {
        let project = safe_file_stem(&self.project.name);
        let tag = safe_file_stem(&format!("{}_{}", capitalize(tag_name), tag_type));
        self.project_folder().join(format!(
            "{project}_original_preprocessed_updated_column_names_datatype_converted_tags_{tag}_{counter}_temp.{ext}"
        ))
    }

    fn write_file(&self, data: &Dataset, path: &Path) -> Result<String> {
        data.write_csv(path, &self.catalog, &self.config.date_format)?;
        file_sha256(path)
    }

    /// Temp versions for touched partitions, the untagged pool and every
    /// flagged partition no rule referenced
    fn persist(&self, set: &PartitionSet, ledger: &RowLedger, split: &[VersionRecord]) -> Result<Vec<VersionEntry>> {
        let mut counter = 1;
        let slots = set.partitions.len() + 1 + split.len();
        let mut new_versions = Vec::new();
        let mut written: HashSet<TagKey> = HashSet::new();

        for partition in &set.partitions {
            let ext = self.extension_of(partition.source.as_ref());
            let path = self.temp_path(&partition.tag_name, &partition.tag_type, counter, &ext);
            let digest = self.write_file(&partition.data, &path)?;

            let mut version = VersionRecord::new(
                &self.project.id,
                format!(
                    "Temporary rules applied for {} - {}",
                    partition.tag_name, partition.tag_type
                ),
                &path,
                temp_version_number(counter, slots),
            )
            .with_tag(&partition.tag_name, &partition.tag_type)
            .with_rows(partition.data.len())
            .with_changes(
                ledger.injected_count(&partition.key),
                ledger.ejected_count(&partition.key),
                true,
            )
            .with_digest(digest);
            if let Some(source) = &partition.source {
                version.bdc_multiplier = source.bdc_multiplier;
            }

            new_versions.push(self.register_temp(&version)?);
            written.insert(partition.key.clone());
            counter += 1;
        }

        // Untagged pool, written even when empty
        let untagged_key = TagKey::untagged();
        let ext = self.extension_of(set.untagged_sources.first().or(split.first()));
        let path = self.temp_path("Untagged", UNKNOWN_TYPE, counter, &ext);
        let digest = self.write_file(&set.untagged, &path)?;
        let added = ledger.injected_count(&untagged_key);
        let removed = ledger.ejected_count(&untagged_key);
        let version = VersionRecord::new(
            &self.project.id,
            "Temporary untagged data after rules",
            &path,
            temp_version_number(counter, slots),
        )
        .with_tag(UNTAGGED_NAME, UNKNOWN_TYPE)
        .with_rows(set.untagged.len())
        .with_changes(added, removed, added > 0 || removed > 0)
        .with_digest(digest);
        new_versions.push(self.register_temp(&version)?);
        counter += 1;

        // Flagged partitions no rule touched
        for source in split.iter().filter(|v| v.sent_for_rule_addition) {
            let key = TagKey::new(source.tag_name(), source.tag_type());
            if key.is_untagged() || written.contains(&key) {
                continue;
            }
            let data = Dataset::read_csv(&source.file_path)?;
            let ext = self.extension_of(Some(source));
            let path = self.temp_path(source.tag_name(), source.tag_type(), counter, &ext);
            let digest = self.write_file(&data, &path)?;

            let mut version = VersionRecord::new(
                &self.project.id,
                format!(
                    "Temporary version for {} - {} (no rules applied)",
                    source.tag_name(),
                    source.tag_type()
                ),
                &path,
                temp_version_number(counter, slots),
            )
            .with_tag(source.tag_name(), source.tag_type())
            .with_rows(data.len())
            .with_changes(0, 0, false)
            .with_digest(digest);
            version.bdc_multiplier = source.bdc_multiplier;

            new_versions.push(self.register_temp(&version)?);
            written.insert(key);
            counter += 1;
        }

        Ok(new_versions)
    }

    fn register_temp(&self, version: &VersionRecord) -> Result<VersionEntry> {
        let id = self.store.create_version(version)?;
        let entry = VersionEntry::new(version.tag_name(), &id);
        self.store.append_temp_file(&self.project.id, entry.clone())?;
        tracing::debug!(
            project_id = %self.project.id,
            tag = version.tag_name(),
            version_id = %id,
            rows = version.rows_count,
            "temp version written"
        );
        Ok(entry)
    }

    // ------------------------------------------------------------------------
    // Audit files
    // ------------------------------------------------------------------------

    /// Replace the project's rows-added/removed files with this run's ledger
    fn write_audit_files(&self, ledger: &RowLedger) -> Result<(Vec<VersionEntry>, Vec<VersionEntry>)> {
        for stale in self.store.clear_rows_tracking_files(&self.project.id)? {
            remove_backing_file(&stale.file_path)?;
        }

        let project = safe_file_stem(&self.project.name);
        let ext = &self.config.default_extension;
        let mut removed_files = Vec::new();
        let mut added_files = Vec::new();

        for (key, rows) in &ledger.ejected {
            if rows.is_empty() {
                continue;
            }
            let label = key.label();
            let path = self
                .project_folder()
                .join(format!("{project}_rows_removed_{label}_{}.{ext}", short_id()));
            let digest = self.write_file(rows, &path)?;
            let version = VersionRecord::new(
                &self.project.id,
                format!("Rows removed from {label}"),
                &path,
                ROWS_REMOVED_VERSION,
            )
            .with_tag(&label, "removed")
            .with_rows(rows.len())
            .with_digest(digest);
            let id = self.store.create_version(&version)?;
            let entry = VersionEntry::new(&label, &id);
            self.store.append_rows_removed_file(&self.project.id, entry.clone())?;
            removed_files.push(entry);
        }

        for (key, rows) in &ledger.injected {
            if rows.is_empty() {
                continue;
            }
            let label = key.label();
            let path = self
                .project_folder()
                .join(format!("{project}_rows_added_{label}_{}.{ext}", short_id()));
            let digest = self.write_file(rows, &path)?;
            let version = VersionRecord::new(
                &self.project.id,
                format!("Rows added to {label}"),
                &path,
                ROWS_ADDED_VERSION,
            )
            .with_tag(&label, "added")
            .with_rows(rows.len())
            .with_digest(digest);
            let id = self.store.create_version(&version)?;
            let entry = VersionEntry::new(&label, &id);
            self.store.append_rows_added_file(&self.project.id, entry.clone())?;
            added_files.push(entry);
        }

        tracing::info!(
            project_id = %self.project.id,
            removed = removed_files.len(),
            added = added_files.len(),
            "row tracking files written"
        );
        Ok((removed_files, added_files))
    }
}

// ============================================================================
// MIGRATION STEPS
// ============================================================================

/// Move rows out of their partition into the untagged pool.
/// accept: rows failing the mask leave; reject: matching rows leave.
pub fn apply_ejections(
    set: &mut PartitionSet,
    ledger: &mut RowLedger,
    rules: &[TagRules],
    catalog: &ColumnCatalog,
) -> Vec<EjectionResult> {
    let untagged_key = TagKey::untagged();
    let mut results = Vec::new();

    for rule in rules {
        let key = rule.key();
        for group in &rule.rules {
            let Some(partition) = set.get_mut(&key) else {
                tracing::warn!(tag = %key, "ejection skipped for missing partition");
                break;
            };

            let (mask, outcome) = build_mask(&partition.data, group, catalog);
            let eject = match outcome {
                Outcome::Accept => !mask,
                Outcome::Reject => mask,
            };

            let data = std::mem::take(&mut partition.data);
            let (mut ejected, kept) = data.partition(&eject);
            partition.data = kept;
            ejected.fill_column(FROM_TAG_COLUMN, &partition.tag_name);

            let count = ejected.len();
            ledger.record_ejected(&key, &ejected);
            ledger.record_injected(&untagged_key, &ejected);
            set.untagged.append(ejected);

            tracing::debug!(tag = %key, rule_type = %outcome, ejected = count, "ejection group applied");
            results.push(EjectionResult {
                tag_name: rule.tag_name.clone(),
                tag_type: rule.tag_type.clone(),
                rule_type: outcome,
                rule_group: group.clone(),
                ejected_rows: count,
            });
        }
    }
    results
}

/// Pull rows from the untagged pool into a target partition.
/// accept: matching rows move; reject: non-matching rows move.
pub fn apply_inclusions(
    set: &mut PartitionSet,
    ledger: &mut RowLedger,
    rules: &[TagRules],
    catalog: &ColumnCatalog,
) -> Vec<InclusionResult> {
    let untagged_key = TagKey::untagged();
    let mut results = Vec::new();

    for rule in rules {
        let key = rule.key();
        if set.get(&key).is_none() {
            tracing::info!(tag = %key, "creating partition for inclusion target");
            set.partitions.push(Partition {
                key: key.clone(),
                tag_name: rule.tag_name.trim().to_string(),
                tag_type: rule.tag_type.trim().to_string(),
                data: Dataset::new(set.untagged.columns().to_vec()),
                source: None,
            });
        }

        for group in &rule.rules {
            let (mask, outcome) = build_mask(&set.untagged, group, catalog);
            let mut count = 0;

            if !set.untagged.is_empty() {
                let include = match outcome {
                    Outcome::Accept => mask,
                    Outcome::Reject => !mask,
                };
                let pool = std::mem::take(&mut set.untagged);
                let (mut included, rest) = pool.partition(&include);
                set.untagged = rest;

                if !included.is_empty() {
                    included.fill_empty(FROM_TAG_COLUMN, UNTAGGED_NAME);
                    count = included.len();
                    ledger.record_injected(&key, &included);
                    ledger.record_ejected(&untagged_key, &included);
                    if let Some(target) = set.get_mut(&key) {
                        target.data.append(included);
                    }
                }
            }

            tracing::debug!(tag = %key, rule_type = %outcome, included = count, "inclusion group applied");
            results.push(InclusionResult {
                tag_name: rule.tag_name.clone(),
                tag_type: rule.tag_type.clone(),
                rule_type: outcome,
                rule_group: group.clone(),
                added_rows: count,
            });
        }
    }
    results
}

/// 4.01, 4.02, ... with enough decimal places that `slots` temp
/// versions stay below the rows-removed/added numbers (5.0, 5.1)
fn temp_version_number(counter: u32, slots: usize) -> f64 {
    let mut scale: u32 = 100;
    while (scale as usize) <= slots {
        scale *= 10;
    }
    f64::from(TEMP_VERSION_MAJOR * scale + counter) / f64::from(scale)
}

fn capitalize(tag: &str) -> String {
    let mut chars = tag.trim().chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}
