//! Validated, idempotent persistence of reviewed tag exports.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::database::{PersonaDatabase, StoredTag};
use crate::report::{ItemFailure, RunStatus};
use crate::taxonomy::{normalize_label, Taxonomy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_string_lossy().to_ascii_lowercase();
        match ext.as_str() {
            "json" => Some(ExportFormat::Json),
            "csv" => Some(ExportFormat::Csv),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Only add triples
    #[default]
    Merge,
    /// Swap each touched persona's tag set for the artifact's
    Replace,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadSkip {
    #[error("malformed record: missing {0}")]
    Malformed(&'static str),
    #[error("unknown persona_id {0}")]
    UnknownPersona(String),
    #[error("({category}, {value}) is not in the taxonomy")]
    OffTaxonomy { category: String, value: String },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub records_read: usize,
    pub inserted: usize,
    pub already_present: usize,
    pub personas_replaced: usize,
    pub skipped: usize,
    pub skips: Vec<ItemFailure>,
}

impl LoadReport {
    pub fn status(&self) -> RunStatus {
        RunStatus::from_counts(self.inserted + self.already_present, self.skipped)
    }

    fn skip(&mut self, index: usize, skip: LoadSkip) {
        tracing::warn!("Skipping tag record #{}: {}", index + 1, skip);
        self.skipped += 1;
        self.skips
            .push(ItemFailure::new(format!("record #{}", index + 1), skip));
    }
}

/// Record fields as read, before validation
#[derive(Debug, Clone, Default)]
struct RawRecord {
    persona_id: Option<String>,
    category: Option<String>,
    value: Option<String>,
    justification: Option<String>,
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn json_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn read_json(raw: &str, path: &Path) -> Result<Vec<RawRecord>> {
    let items: Vec<Value> = serde_json::from_str(raw)
        .with_context(|| format!("Tag artifact {:?} is not a JSON array", path))?;
    Ok(items
        .iter()
        .map(|item| RawRecord {
            persona_id: json_text(item.get("persona_id")),
            category: json_text(item.get("category")),
            value: json_text(item.get("value")),
            justification: json_text(item.get("justification")),
        })
        .collect())
}

fn read_csv(raw: &str, path: &Path) -> Result<Vec<RawRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(raw.as_bytes());
    let headers: Vec<String> = reader
        .headers()
        .with_context(|| format!("Tag artifact {:?} has no header row", path))?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_ascii_lowercase())
        .collect();
    let column = |name: &str| headers.iter().position(|h| h == name);
    let (Some(id_col), Some(category_col), Some(value_col)) =
        (column("persona_id"), column("category"), column("value"))
    else {
        anyhow::bail!(
            "Tag artifact {:?} needs persona_id,category,value columns, found {:?}",
            path,
            headers
        );
    };
    let justification_col = column("justification");

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.with_context(|| format!("Failed to read CSV row in {:?}", path))?;
        let field = |col: usize| row.get(col).map(str::to_string);
        records.push(RawRecord {
            persona_id: field(id_col),
            category: field(category_col),
            value: field(value_col),
            justification: justification_col.and_then(field),
        });
    }
    Ok(records)
}

/// Read an export artifact. A missing or unreadable artifact is fatal.
fn read_artifact(path: &Path) -> Result<Vec<RawRecord>> {
    let format = ExportFormat::from_path(path)
        .ok_or_else(|| anyhow::anyhow!("Unsupported tag artifact format: {:?}", path))?;
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read tag artifact {:?}", path))?;
    match format {
        ExportFormat::Json => read_json(&raw, path),
        ExportFormat::Csv => read_csv(&raw, path),
    }
}

fn validate(
    record: RawRecord,
    known: &HashSet<String>,
    taxonomy: &Taxonomy,
) -> std::result::Result<StoredTag, LoadSkip> {
    let persona_id = non_empty(record.persona_id).ok_or(LoadSkip::Malformed("persona_id"))?;
    let category = non_empty(record.category).ok_or(LoadSkip::Malformed("category"))?;
    let value = non_empty(record.value).ok_or(LoadSkip::Malformed("value"))?;

    if !known.contains(&persona_id) {
        return Err(LoadSkip::UnknownPersona(persona_id));
    }
    let category = normalize_label(&category);
    let value = taxonomy.canonical_value(&category, &normalize_label(&value));
    if !taxonomy.contains_normalized(&category, &value) {
        return Err(LoadSkip::OffTaxonomy { category, value });
    }
    Ok(StoredTag {
        persona_id,
        category,
        value,
        justification: non_empty(record.justification),
    })
}

/// Validate every record against the store and the taxonomy in effect, then
/// persist the valid ones. Store failures abort the load; triples already
/// written stay in place.
pub fn load_tags(
    db: &PersonaDatabase,
    taxonomy: &Taxonomy,
    artifact: &Path,
    mode: LoadMode,
) -> Result<LoadReport> {
    let records = read_artifact(artifact)?;
    let known = db.persona_ids()?;
    let mut report = LoadReport {
        records_read: records.len(),
        ..LoadReport::default()
    };

    let mut valid = Vec::new();
    for (index, record) in records.into_iter().enumerate() {
        match validate(record, &known, taxonomy) {
            Ok(tag) => valid.push(tag),
            Err(skip) => report.skip(index, skip),
        }
    }

    match mode {
        LoadMode::Merge => {
            for tag in &valid {
                let inserted = db.upsert_tag(tag).with_context(|| {
                    format!("Failed to store tag for persona {}", tag.persona_id)
                })?;
                if inserted {
                    report.inserted += 1;
                } else {
                    report.already_present += 1;
                }
            }
        }
        LoadMode::Replace => {
            let mut grouped: BTreeMap<String, Vec<StoredTag>> = BTreeMap::new();
            for tag in valid {
                let entry = grouped.entry(tag.persona_id.clone()).or_default();
                if entry
                    .iter()
                    .any(|t| t.category == tag.category && t.value == tag.value)
                {
                    report.already_present += 1;
                } else {
                    entry.push(tag);
                }
            }
            for (persona_id, tags) in grouped {
                let written = db
                    .replace_tags(&persona_id, &tags)
                    .with_context(|| format!("Failed to replace tags for persona {}", persona_id))?;
                report.inserted += written;
                report.personas_replaced += 1;
            }
        }
    }

    tracing::info!(
        "Tag load finished ({:?}): {} read, {} inserted, {} already present, {} skipped",
        mode,
        report.records_read,
        report.inserted,
        report.already_present,
        report.skipped
    );
    Ok(report)
}
