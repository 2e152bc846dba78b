// 🔧 Datatype Conversion Phase - per-column fixes on a temp copy
//
// Both workflows copy their current dataset into a temp version, rewrite
// single columns there, then re-run the catalog conversion and promote
// the copy. The owning record holds the temp version id in between.

use crate::catalog::ColumnCatalog;
use crate::config::{safe_file_stem, short_id, Config};
use crate::dataset::{copy_backing_file, file_sha256, remove_backing_file, Dataset};
use crate::error::Result;
use crate::preprocess::{
    catalog_mapping, convert_datatypes, fix_currency_column, fix_numeric_column, reformat_dates, ColumnFix,
    ConversionReport, NumericFix,
};
use crate::store::{MetadataStore, VersionRecord};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const TEMP_CONVERSION_VERSION: f64 = 2.1;
pub const RECONVERTED_VERSION: f64 = 2.2;

/// One column rewrite on the temp copy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnFixRequest {
    /// Source pattern such as "yyyy-mm-dd HH:MM:SS" or a chrono format
    Date { source_format: String },
    Numeric(NumericFix),
    Currency(NumericFix),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotedConversion {
    pub version_id: String,
    pub rows: usize,
    pub report: ConversionReport,
}

pub struct ConversionPhase<'a, S: MetadataStore> {
    store: &'a S,
    config: &'a Config,
    catalog: ColumnCatalog,
}

impl<'a, S: MetadataStore> ConversionPhase<'a, S> {
    pub fn new(store: &'a S, config: &'a Config, catalog: ColumnCatalog) -> Self {
        ConversionPhase { store, config, catalog }
    }

    fn path(&self, owner_name: &str, suffix: &str, source: &VersionRecord) -> PathBuf {
        let ext = source
            .file_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or(&self.config.default_extension);
        self.config
            .owner_folder(owner_name)
            .join(format!("{}_{suffix}.{ext}", safe_file_stem(owner_name)))
    }

    /// Copy `source` into a new temp version owned by `owner_id`
    pub fn start(&self, owner_id: &str, owner_name: &str, source: &VersionRecord) -> Result<String> {
        let path = self.path(owner_name, "temp_datatype_conversion", source);
        copy_backing_file(&source.file_path, &path)?;
        let version = VersionRecord::new(owner_id, "Temporary copy for datatype conversion", &path, TEMP_CONVERSION_VERSION)
            .with_rows(source.rows_count)
            .with_digest(file_sha256(&path)?);
        let version_id = self.store.create_version(&version)?;

        tracing::debug!(owner_id, version_id = %version_id, "datatype conversion copy created");
        Ok(version_id)
    }

    /// Rewrite one column of the temp copy. Other columns are written back
    /// exactly as read.
    pub fn fix_column(&self, temp_id: &str, column: &str, request: &ColumnFixRequest) -> Result<ColumnFix> {
        let mut temp = self.store.require_version(temp_id)?;
        let mut data = Dataset::read_csv(&temp.file_path)?;
        let fix = match request {
            ColumnFixRequest::Date { source_format } => {
                reformat_dates(&mut data, column, source_format, &self.config.date_format)?
            }
            ColumnFixRequest::Numeric(fix) => fix_numeric_column(&mut data, column, fix)?,
            ColumnFixRequest::Currency(fix) => fix_currency_column(&mut data, column, fix)?,
        };
        data.write_csv(&temp.file_path, &ColumnCatalog::new(), &self.config.date_format)?;

        temp.file_sha256 = Some(file_sha256(&temp.file_path)?);
        temp.modified = true;
        self.store.update_version(&temp)?;
        Ok(fix)
    }

    /// Re-run the catalog conversion over the fixed copy and write it as a
    /// new converted version. The temp version and its file are removed.
    pub fn promote(&self, owner_id: &str, owner_name: &str, temp_id: &str) -> Result<PromotedConversion> {
        let temp = self.store.require_version(temp_id)?;
        let mut data = Dataset::read_csv(&temp.file_path)?;
        let mapping = catalog_mapping(&data, &self.catalog);
        let report = convert_datatypes(&mut data, &mapping, &self.config.date_format);

        // Earlier converted versions stay on disk as history
        let suffix = format!(
            "original_preprocessed_updated_column_names_datatype_converted_{}",
            short_id()
        );
        let path = self.path(owner_name, &suffix, &temp);
        data.write_csv(&path, &self.catalog, &self.config.date_format)?;
        let version = VersionRecord::new(owner_id, "Datatype conversion completed", &path, RECONVERTED_VERSION)
            .with_rows(data.len())
            .with_digest(file_sha256(&path)?);
        let version_id = self.store.create_version(&version)?;

        remove_backing_file(&temp.file_path)?;
        self.store.delete_version(&temp.id)?;

        tracing::info!(
            owner_id,
            version_id = %version_id,
            failed = report.failed.len(),
            "datatype conversion promoted"
        );
        Ok(PromotedConversion {
            version_id,
            rows: data.len(),
            report,
        })
    }
}
