//! Closed tag vocabulary: conversion from a raw tabular source, the YAML
//! taxonomy document, and membership checks used by the tagger and the loader.

use calamine::{open_workbook_auto, Data, Reader};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::report::write_atomic;

const CATEGORY_COLUMNS: &[&str] = &["category", "key", "tag"];
const VALUE_COLUMNS: &[&str] = &["value", "values", "enum_values"];
const HINT_COLUMNS: &[&str] = &["hint", "description", "prompt_hint"];
const SYNONYM_COLUMNS: &[&str] = &["synonyms", "aliases"];
/// Header of the wide layout: one category per row, its values across the other columns
const WIDE_CATEGORY_COLUMNS: &[&str] = &["теги", "tags"];

#[derive(Debug, Error)]
pub enum TaxonomyError {
    #[error("failed to read taxonomy source {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("taxonomy schema error: {0}")]
    Schema(String),
    #[error("taxonomy source is structurally unreadable: {0}")]
    Unreadable(String),
    #[error("unsupported taxonomy source format: {0:?}")]
    UnsupportedFormat(PathBuf),
    #[error("failed to write taxonomy document: {0}")]
    Write(String),
}

/// Trim, collapse inner whitespace, lower-case
pub fn normalize_label(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyCategory {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    pub values: Vec<String>,
    /// Alternative wording → allowed value, both normalized
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub synonyms: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaxonomyDocument {
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    updated_at: String,
    categories: Vec<TaxonomyCategory>,
}

fn default_version() -> String {
    "v1".to_string()
}

/// Immutable category → ordered allowed values mapping
#[derive(Debug, Clone)]
pub struct Taxonomy {
    version: String,
    updated_at: String,
    categories: Vec<TaxonomyCategory>,
    members: HashSet<(String, String)>,
    synonyms: HashMap<(String, String), String>,
}

impl Taxonomy {
    fn from_parts(version: String, updated_at: String, categories: Vec<TaxonomyCategory>) -> Self {
        let members = categories
            .iter()
            .flat_map(|c| c.values.iter().map(move |v| (c.name.clone(), v.clone())))
            .collect();
        let synonyms = categories
            .iter()
            .flat_map(|c| {
                c.synonyms
                    .iter()
                    .map(move |(raw, canonical)| ((c.name.clone(), raw.clone()), canonical.clone()))
            })
            .collect();
        Self {
            version,
            updated_at,
            categories,
            members,
            synonyms,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn updated_at(&self) -> &str {
        &self.updated_at
    }

    pub fn categories(&self) -> &[TaxonomyCategory] {
        &self.categories
    }

    pub fn category(&self, name: &str) -> Option<&TaxonomyCategory> {
        let name = normalize_label(name);
        self.categories.iter().find(|c| c.name == name)
    }

    pub fn value_count(&self) -> usize {
        self.members.len()
    }

    /// Membership of an already-normalized pair
    pub fn contains_normalized(&self, category: &str, value: &str) -> bool {
        self.members
            .contains(&(category.to_string(), value.to_string()))
    }

    /// Allowed value a normalized proposal stands for: its synonym target when
    /// the category declares one, otherwise the value itself
    pub fn canonical_value(&self, category: &str, value: &str) -> String {
        self.synonyms
            .get(&(category.to_string(), value.to_string()))
            .cloned()
            .unwrap_or_else(|| value.to_string())
    }

    /// Membership after normalizing both labels
    pub fn contains(&self, category: &str, value: &str) -> bool {
        self.contains_normalized(&normalize_label(category), &normalize_label(value))
    }

    /// Category batches bounding prompt size
    pub fn batches(&self, size: usize) -> impl Iterator<Item = &[TaxonomyCategory]> {
        self.categories.chunks(size.max(1))
    }

    /// Load a taxonomy document written by [`Taxonomy::save`] (or by hand)
    pub fn load(path: &Path) -> Result<Self, TaxonomyError> {
        let raw = fs::read_to_string(path).map_err(|source| TaxonomyError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let doc: TaxonomyDocument = serde_yaml::from_str(&raw)
            .map_err(|e| TaxonomyError::Unreadable(format!("{:?}: {}", path, e)))?;

        // Hand-edited documents get the same canonical form as converted ones
        let mut builder = TaxonomyBuilder::default();
        for category in doc.categories {
            let synonyms: Vec<(String, String)> = category.synonyms.into_iter().collect();
            builder.add_row(
                &category.name,
                &category.values,
                category.hint.as_deref(),
                &synonyms,
            );
        }
        for warning in builder.prune_synonyms() {
            tracing::warn!("{:?}: {}", path, warning);
        }
        let categories = builder.finish();
        if categories.is_empty() {
            return Err(TaxonomyError::Schema(format!(
                "{:?} defines no categories with values",
                path
            )));
        }
        Ok(Self::from_parts(doc.version, doc.updated_at, categories))
    }

    pub fn save(&self, path: &Path) -> Result<(), TaxonomyError> {
        let doc = TaxonomyDocument {
            version: self.version.clone(),
            updated_at: self.updated_at.clone(),
            categories: self.categories.clone(),
        };
        let text = serde_yaml::to_string(&doc).map_err(|e| TaxonomyError::Write(e.to_string()))?;
        write_atomic(path, text.as_bytes()).map_err(|e| TaxonomyError::Write(format!("{:#}", e)))
    }
}

/// Accumulates normalized rows, collapsing duplicates in first-seen order
#[derive(Debug, Default)]
struct TaxonomyBuilder {
    order: Vec<String>,
    categories: HashMap<String, TaxonomyCategory>,
    duplicates: usize,
}

impl TaxonomyBuilder {
    /// Returns false when the row carried no usable category or value
    fn add_row(
        &mut self,
        category: &str,
        values: &[String],
        hint: Option<&str>,
        synonyms: &[(String, String)],
    ) -> bool {
        let name = normalize_label(category);
        let values: Vec<String> = values
            .iter()
            .map(|v| normalize_label(v))
            .filter(|v| !v.is_empty())
            .collect();
        if name.is_empty() || values.is_empty() {
            return false;
        }

        if !self.categories.contains_key(&name) {
            self.order.push(name.clone());
            self.categories.insert(
                name.clone(),
                TaxonomyCategory {
                    name: name.clone(),
                    hint: None,
                    values: Vec::new(),
                    synonyms: BTreeMap::new(),
                },
            );
        }
        let Some(entry) = self.categories.get_mut(&name) else {
            return false;
        };

        if entry.hint.is_none() {
            entry.hint = hint
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty());
        }
        for value in values {
            if entry.values.contains(&value) {
                self.duplicates += 1;
            } else {
                entry.values.push(value);
            }
        }
        for (raw, canonical) in synonyms {
            let raw = normalize_label(raw);
            let canonical = normalize_label(canonical);
            if !raw.is_empty() && !canonical.is_empty() && raw != canonical {
                entry.synonyms.entry(raw).or_insert(canonical);
            }
        }
        true
    }

    /// Drop synonyms that point outside their category's values or shadow an
    /// allowed value. Returns one warning per dropped synonym.
    fn prune_synonyms(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();
        for name in &self.order {
            let Some(entry) = self.categories.get_mut(name) else {
                continue;
            };
            let values = &entry.values;
            entry.synonyms.retain(|raw, canonical| {
                let keep = values.contains(canonical) && !values.contains(raw);
                if !keep {
                    warnings.push(format!(
                        "category {}: synonym {:?} -> {:?} dropped",
                        name, raw, canonical
                    ));
                }
                keep
            });
        }
        warnings
    }

    fn finish(mut self) -> Vec<TaxonomyCategory> {
        self.order
            .iter()
            .filter_map(|name| self.categories.remove(name))
            .collect()
    }
}

/// Closed set of raw taxonomy source formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabularFormat {
    Csv,
    Tsv,
    Yaml,
    /// Excel workbook (first sheet)
    Xlsx,
}

impl TabularFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_string_lossy().to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(TabularFormat::Csv),
            "tsv" => Some(TabularFormat::Tsv),
            "yaml" | "yml" => Some(TabularFormat::Yaml),
            "xlsx" | "xlsm" | "xls" => Some(TabularFormat::Xlsx),
            _ => None,
        }
    }
}

/// One source row before normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub line: usize,
    pub category: String,
    pub values: Vec<String>,
    pub hint: Option<String>,
    /// Raw `(alternative wording, allowed value)` pairs
    pub synonyms: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversionReport {
    pub rows_read: usize,
    pub rows_dropped: usize,
    pub duplicates_collapsed: usize,
    pub synonyms_dropped: usize,
    pub categories: usize,
    pub values: usize,
    pub warnings: Vec<String>,
}

fn split_cell(cell: &str) -> Vec<String> {
    cell.split(|c| c == '|' || c == ',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

/// `{"raw": "canonical"}` JSON, or `raw=canonical` pairs separated by `;`
fn parse_synonyms(cell: &str) -> Vec<(String, String)> {
    let cell = cell.trim();
    if cell.is_empty() {
        return Vec::new();
    }
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(cell) {
        return map
            .into_iter()
            .filter_map(|(raw, canonical)| canonical.as_str().map(|c| (raw, c.to_string())))
            .collect();
    }
    cell.split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(raw, canonical)| (raw.trim().to_string(), canonical.trim().to_string()))
        .collect()
}

fn find_column(headers: &[String], aliases: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|h| aliases.contains(&normalize_label(h).as_str()))
}

fn cell(record: &[String], col: usize) -> &str {
    record.get(col).map(String::as_str).unwrap_or("")
}

/// Header row plus records → raw rows. Accepts the long layout (one row per
/// category with a value column) and the wide layout.
fn rows_from_table(headers: &[String], records: Vec<Vec<String>>) -> Result<Vec<RawRow>, TaxonomyError> {
    let category_col = find_column(headers, CATEGORY_COLUMNS);
    if category_col.is_none() {
        if let Some(wide_col) = find_column(headers, WIDE_CATEGORY_COLUMNS) {
            return Ok(wide_rows(wide_col, records));
        }
    }

    let category_col = category_col.ok_or_else(|| {
        TaxonomyError::Schema(format!(
            "no category column (expected one of {:?}, found {:?})",
            CATEGORY_COLUMNS, headers
        ))
    })?;
    let value_col = find_column(headers, VALUE_COLUMNS).ok_or_else(|| {
        TaxonomyError::Schema(format!(
            "no value column (expected one of {:?}, found {:?})",
            VALUE_COLUMNS, headers
        ))
    })?;
    let hint_col = find_column(headers, HINT_COLUMNS);
    let synonym_col = find_column(headers, SYNONYM_COLUMNS);

    Ok(records
        .iter()
        .enumerate()
        .map(|(idx, record)| RawRow {
            // header is line 1
            line: idx + 2,
            category: cell(record, category_col).to_string(),
            values: split_cell(cell(record, value_col)),
            hint: hint_col.map(|col| cell(record, col).to_string()),
            synonyms: synonym_col
                .map(|col| parse_synonyms(cell(record, col)))
                .unwrap_or_default(),
        })
        .collect())
}

fn wide_rows(category_col: usize, records: Vec<Vec<String>>) -> Vec<RawRow> {
    records
        .into_iter()
        .enumerate()
        .map(|(idx, record)| RawRow {
            line: idx + 2,
            category: cell(&record, category_col).to_string(),
            values: record
                .iter()
                .enumerate()
                .filter(|(col, _)| *col != category_col)
                .map(|(_, value)| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect(),
            hint: None,
            synonyms: Vec::new(),
        })
        .collect()
}

fn read_delimited(raw: &str, delimiter: u8) -> Result<Vec<RawRow>, TaxonomyError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(raw.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| TaxonomyError::Unreadable(e.to_string()))?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();

    let mut records = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| TaxonomyError::Unreadable(e.to_string()))?;
        records.push(record.iter().map(str::to_string).collect());
    }
    rows_from_table(&headers, records)
}

fn spreadsheet_cell(data: &Data) -> String {
    match data {
        Data::Empty => String::new(),
        other => other.to_string().trim().to_string(),
    }
}

fn read_spreadsheet(path: &Path) -> Result<Vec<RawRow>, TaxonomyError> {
    let mut workbook = open_workbook_auto(path)
        .map_err(|e| TaxonomyError::Unreadable(format!("{:?}: {}", path, e)))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| TaxonomyError::Unreadable(format!("{:?} has no worksheets", path)))?
        .map_err(|e| TaxonomyError::Unreadable(format!("{:?}: {}", path, e)))?;

    let mut rows = range
        .rows()
        .map(|row| row.iter().map(spreadsheet_cell).collect::<Vec<String>>());
    let headers = rows.next().unwrap_or_default();
    rows_from_table(&headers, rows.collect())
}

fn yaml_scalar(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn yaml_lookup<'a>(
    map: &'a serde_yaml::Mapping,
    aliases: &[&str],
) -> Option<&'a serde_yaml::Value> {
    map.iter().find_map(|(k, v)| {
        let key = k.as_str().map(normalize_label)?;
        aliases.contains(&key.as_str()).then_some(v)
    })
}

fn read_yaml(raw: &str) -> Result<Vec<RawRow>, TaxonomyError> {
    let doc: serde_yaml::Value =
        serde_yaml::from_str(raw).map_err(|e| TaxonomyError::Unreadable(e.to_string()))?;
    let items = doc.as_sequence().ok_or_else(|| {
        TaxonomyError::Unreadable("YAML source must be a list of rows".to_string())
    })?;

    let mut saw_category = false;
    let mut saw_value = false;
    let mut rows = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        let Some(map) = item.as_mapping() else {
            rows.push(RawRow {
                line: idx + 1,
                category: String::new(),
                values: Vec::new(),
                hint: None,
                synonyms: Vec::new(),
            });
            continue;
        };

        let category = yaml_lookup(map, CATEGORY_COLUMNS);
        let value = yaml_lookup(map, VALUE_COLUMNS);
        saw_category |= category.is_some();
        saw_value |= value.is_some();

        let values = match value {
            Some(serde_yaml::Value::Sequence(seq)) => seq.iter().filter_map(yaml_scalar).collect(),
            Some(other) => yaml_scalar(other)
                .map(|s| split_cell(&s))
                .unwrap_or_default(),
            None => Vec::new(),
        };

        let synonyms = match yaml_lookup(map, SYNONYM_COLUMNS) {
            Some(serde_yaml::Value::Mapping(pairs)) => pairs
                .iter()
                .filter_map(|(raw, canonical)| Some((yaml_scalar(raw)?, yaml_scalar(canonical)?)))
                .collect(),
            Some(other) => yaml_scalar(other)
                .map(|s| parse_synonyms(&s))
                .unwrap_or_default(),
            None => Vec::new(),
        };

        rows.push(RawRow {
            line: idx + 1,
            category: category.and_then(yaml_scalar).unwrap_or_default(),
            values,
            hint: yaml_lookup(map, HINT_COLUMNS).and_then(yaml_scalar),
            synonyms,
        });
    }

    if !items.is_empty() && !saw_category {
        return Err(TaxonomyError::Schema(format!(
            "no row has a category key (expected one of {:?})",
            CATEGORY_COLUMNS
        )));
    }
    if !items.is_empty() && !saw_value {
        return Err(TaxonomyError::Schema(format!(
            "no row has a value key (expected one of {:?})",
            VALUE_COLUMNS
        )));
    }
    Ok(rows)
}

/// Read raw rows from a tabular source
pub fn read_source(path: &Path) -> Result<Vec<RawRow>, TaxonomyError> {
    let format = TabularFormat::from_path(path)
        .ok_or_else(|| TaxonomyError::UnsupportedFormat(path.to_path_buf()))?;
    let read_text = || {
        fs::read_to_string(path).map_err(|source| TaxonomyError::Read {
            path: path.to_path_buf(),
            source,
        })
    };
    match format {
        TabularFormat::Csv => read_delimited(&read_text()?, b','),
        TabularFormat::Tsv => read_delimited(&read_text()?, b'\t'),
        TabularFormat::Yaml => read_yaml(&read_text()?),
        TabularFormat::Xlsx => read_spreadsheet(path),
    }
}

/// Normalize rows into a taxonomy. Empty/incomplete rows and duplicate values are
/// advisory: they are counted and logged, never fatal.
pub fn build_taxonomy(rows: &[RawRow]) -> Result<(Taxonomy, ConversionReport), TaxonomyError> {
    let mut builder = TaxonomyBuilder::default();
    let mut report = ConversionReport {
        rows_read: rows.len(),
        ..ConversionReport::default()
    };

    for row in rows {
        if !builder.add_row(&row.category, &row.values, row.hint.as_deref(), &row.synonyms) {
            report.rows_dropped += 1;
            let warning = format!("row {}: empty or incomplete, dropped", row.line);
            tracing::warn!("{}", warning);
            report.warnings.push(warning);
        }
    }

    for warning in builder.prune_synonyms() {
        tracing::warn!("{}", warning);
        report.synonyms_dropped += 1;
        report.warnings.push(warning);
    }

    report.duplicates_collapsed = builder.duplicates;
    if builder.duplicates > 0 {
        tracing::warn!(
            "Collapsed {} duplicate taxonomy value(s)",
            builder.duplicates
        );
    }

    let categories = builder.finish();
    if categories.is_empty() {
        return Err(TaxonomyError::Schema(
            "source contains no complete (category, value) row".to_string(),
        ));
    }

    let taxonomy = Taxonomy::from_parts(
        default_version(),
        Utc::now().format("%Y-%m-%d").to_string(),
        categories,
    );
    report.categories = taxonomy.categories.len();
    report.values = taxonomy.value_count();
    Ok((taxonomy, report))
}

/// Raw source → canonical taxonomy
pub fn convert_source(path: &Path) -> Result<(Taxonomy, ConversionReport), TaxonomyError> {
    let rows = read_source(path)?;
    let (taxonomy, report) = build_taxonomy(&rows)?;
    tracing::info!(
        "Converted taxonomy from {:?}: {} categories, {} values ({} rows dropped, {} duplicates collapsed)",
        path,
        report.categories,
        report.values,
        report.rows_dropped,
        report.duplicates_collapsed
    );
    Ok((taxonomy, report))
}
