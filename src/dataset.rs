// 📋 Dataset - rectangular table of named columns
// Cells are kept as the text read from disk; typed meaning comes from the
// column catalog at comparison time, so unconvertible cells never fail a load.

use crate::catalog::{parse_date, ColumnCatalog};
use crate::error::{PipelineError, Result};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::ops::{BitAndAssign, BitOrAssign, Not};
use std::path::Path;

// ============================================================================
// MASK
// ============================================================================

/// One boolean per row
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Mask(Vec<bool>);

impl Mask {
    pub fn all(len: usize, value: bool) -> Self {
        Mask(vec![value; len])
    }

    pub fn from_fn(len: usize, f: impl FnMut(usize) -> bool) -> Self {
        Mask((0..len).map(f).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, row: usize) -> bool {
        self.0.get(row).copied().unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.0.iter().filter(|m| **m).count()
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.0
    }
}

impl From<Vec<bool>> for Mask {
    fn from(values: Vec<bool>) -> Self {
        Mask(values)
    }
}

impl BitAndAssign<&Mask> for Mask {
    fn bitand_assign(&mut self, rhs: &Mask) {
        for (i, value) in self.0.iter_mut().enumerate() {
            *value = *value && rhs.get(i);
        }
    }
}

impl BitOrAssign<&Mask> for Mask {
    fn bitor_assign(&mut self, rhs: &Mask) {
        for (i, value) in self.0.iter_mut().enumerate() {
            *value = *value || rhs.get(i);
        }
    }
}

impl Not for Mask {
    type Output = Mask;

    fn not(self) -> Mask {
        Mask(self.0.into_iter().map(|m| !m).collect())
    }
}

impl Not for &Mask {
    type Output = Mask;

    fn not(self) -> Mask {
        Mask(self.0.iter().map(|m| !m).collect())
    }
}

// ============================================================================
// DATASET
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dataset {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Dataset {
    /// Empty dataset with a schema
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Dataset {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Rows shorter than the header are padded with empty cells, longer ones truncated
    pub fn from_rows<S: Into<String>>(
        columns: impl IntoIterator<Item = S>,
        rows: Vec<Vec<String>>,
    ) -> Self {
        let mut dataset = Dataset::new(columns);
        for row in rows {
            dataset.push_row(row);
        }
        dataset
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Cells of one column, top to bottom
    pub fn column(&self, name: &str) -> Option<Vec<&str>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|row| row[idx].as_str()).collect())
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|r| r[idx].as_str())
    }

    pub fn push_row(&mut self, mut row: Vec<String>) {
        row.resize(self.columns.len(), String::new());
        self.rows.push(row);
    }

    /// Add a column filled with `default` unless it already exists
    pub fn ensure_column(&mut self, name: &str, default: &str) {
        if self.has_column(name) {
            return;
        }
        self.columns.push(name.to_string());
        for row in &mut self.rows {
            row.push(default.to_string());
        }
    }

    /// Replace (or create) a column with the given cells
    pub fn set_column(&mut self, name: &str, values: Vec<String>) -> Result<()> {
        if values.len() != self.rows.len() {
            return Err(PipelineError::validation(format!(
                "column '{}' has {} values for {} rows",
                name,
                values.len(),
                self.rows.len()
            )));
        }
        self.ensure_column(name, "");
        let idx = self.column_index(name).unwrap_or(self.columns.len() - 1);
        for (row, value) in self.rows.iter_mut().zip(values) {
            row[idx] = value;
        }
        Ok(())
    }

    /// Overwrite one column for every row
    pub fn fill_column(&mut self, name: &str, value: &str) {
        self.ensure_column(name, value);
        if let Some(idx) = self.column_index(name) {
            for row in &mut self.rows {
                row[idx] = value.to_string();
            }
        }
    }

    /// Fill only the empty cells of a column
    pub fn fill_empty(&mut self, name: &str, value: &str) {
        self.ensure_column(name, "");
        if let Some(idx) = self.column_index(name) {
            for row in &mut self.rows {
                if row[idx].trim().is_empty() {
                    row[idx] = value.to_string();
                }
            }
        }
    }

    /// Split into (rows where mask is true, rows where it is false), order kept
    pub fn partition(self, mask: &Mask) -> (Dataset, Dataset) {
        let mut matched = Dataset::new(self.columns.clone());
        let mut rest = Dataset::new(self.columns);
        for (i, row) in self.rows.into_iter().enumerate() {
            if mask.get(i) {
                matched.rows.push(row);
            } else {
                rest.rows.push(row);
            }
        }
        (matched, rest)
    }

    /// Append rows of another dataset, aligning columns by name.
    /// Columns missing on either side are added and left empty.
    pub fn append(&mut self, other: Dataset) {
        for column in &other.columns {
            self.ensure_column(column, "");
        }
        let positions: Vec<usize> = other
            .columns
            .iter()
            .filter_map(|c| self.column_index(c))
            .collect();
        for row in other.rows {
            let mut aligned = vec![String::new(); self.columns.len()];
            for (cell, &target) in row.into_iter().zip(&positions) {
                aligned[target] = cell;
            }
            self.rows.push(aligned);
        }
    }

    pub fn retain_rows(&mut self, mut keep: impl FnMut(&[String]) -> bool) {
        self.rows.retain(|row| keep(row));
    }

    pub fn rename_column(&mut self, from: &str, to: &str) -> bool {
        match self.column_index(from) {
            Some(idx) => {
                self.columns[idx] = to.to_string();
                true
            }
            None => false,
        }
    }

    pub(crate) fn rows_mut(&mut self) -> &mut Vec<Vec<String>> {
        &mut self.rows
    }

    /// Group rows by the values of two columns, in first-seen order
    pub fn group_by_pair(&self, first: &str, second: &str) -> Result<Vec<((String, String), Dataset)>> {
        let a = self
            .column_index(first)
            .ok_or_else(|| PipelineError::validation(format!("column '{first}' not found")))?;
        let b = self
            .column_index(second)
            .ok_or_else(|| PipelineError::validation(format!("column '{second}' not found")))?;

        let mut order: Vec<(String, String)> = Vec::new();
        let mut groups: HashMap<(String, String), Dataset> = HashMap::new();
        for row in &self.rows {
            let key = (row[a].trim().to_string(), row[b].trim().to_string());
            let group = groups.entry(key.clone()).or_insert_with(|| {
                order.push(key.clone());
                Dataset::new(self.columns.clone())
            });
            group.rows.push(row.clone());
        }

        Ok(order
            .into_iter()
            .filter_map(|key| groups.remove(&key).map(|group| (key, group)))
            .collect())
    }

    /// SHA-256 over a row's cells (unit-separated so "a","bc" != "ab","c")
    pub fn row_fingerprint(row: &[String]) -> String {
        let mut hasher = Sha256::new();
        for cell in row {
            hasher.update(cell.as_bytes());
            hasher.update([0x1f]);
        }
        format!("{:x}", hasher.finalize())
    }

    /// Distinct row fingerprints (used to check row conservation)
    pub fn fingerprints(&self) -> HashSet<String> {
        self.rows.iter().map(|r| Dataset::row_fingerprint(r)).collect()
    }

    // ========================================================================
    // CSV I/O
    // ========================================================================

    /// Read a CSV file; every cell is kept as text
    pub fn read_csv(path: &Path) -> Result<Dataset> {
        ensure_csv(path)?;
        let csv_err = |source| PipelineError::Csv {
            path: path.to_path_buf(),
            source,
        };

        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(csv_err)?;

        let headers = rdr.headers().map_err(csv_err)?.clone();
        let mut dataset = Dataset::new(headers.iter().map(|h| h.trim().to_string()));

        for record in rdr.records() {
            let record = record.map_err(csv_err)?;
            dataset.push_row(record.iter().map(str::to_string).collect());
        }

        Ok(dataset)
    }

    /// Write as CSV; date-typed columns are rendered with `date_format`
    pub fn write_csv(&self, path: &Path, catalog: &ColumnCatalog, date_format: &str) -> Result<()> {
        ensure_csv(path)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
            }
        }

        let csv_err = |source| PipelineError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let date_columns: Vec<bool> = self.columns.iter().map(|c| catalog.is_date(c)).collect();

        let mut wtr = csv::Writer::from_path(path).map_err(csv_err)?;
        wtr.write_record(&self.columns).map_err(csv_err)?;
        for row in &self.rows {
            let rendered: Vec<String> = row
                .iter()
                .zip(&date_columns)
                .map(|(cell, is_date)| {
                    if *is_date {
                        format_date_cell(cell, date_format)
                    } else {
                        cell.clone()
                    }
                })
                .collect();
            wtr.write_record(&rendered).map_err(csv_err)?;
        }
        wtr.flush().map_err(|e| PipelineError::io(path, e))?;
        Ok(())
    }
}

/// Unparseable dates are written back untouched
pub fn format_date_cell(cell: &str, date_format: &str) -> String {
    match parse_date(cell) {
        Some(date) => date.format(date_format).to_string(),
        None => cell.to_string(),
    }
}

fn ensure_csv(path: &Path) -> Result<()> {
    match path.extension().and_then(|e| e.to_str()).map(str::to_lowercase) {
        Some(ext) if ext == "csv" => Ok(()),
        Some(ext) => Err(PipelineError::validation(format!(
            "unsupported file format '.{ext}' for {}",
            path.display()
        ))),
        None => Err(PipelineError::validation(format!(
            "file {} has no extension",
            path.display()
        ))),
    }
}

/// SHA-256 of a file's bytes, recorded on every version
pub fn file_sha256(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| PipelineError::io(path, e))?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Delete a backing file. Already-missing files are only warned about.
pub fn remove_backing_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "backing file already missing");
            Ok(())
        }
        Err(e) => Err(PipelineError::io(path, e)),
    }
}

/// Byte copy of a backing file into a (possibly new) folder
pub fn copy_backing_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }
    }
    fs::copy(from, to).map_err(|e| PipelineError::io(from, e))?;
    Ok(())
}
