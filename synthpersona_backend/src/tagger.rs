//! Taxonomy-governed auto-tagging. Proposals are validated and exported for
//! review; nothing is written to the store here.

use anyhow::{Context, Result};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::database::{Persona, PersonaDatabase};
use crate::llm_client::{parse_json_response, CompletionRequest, LanguageModel};
use crate::report::{
    manifest_path_for, write_atomic, FailureManifest, ItemFailure, RunStatus, Stage,
};
use crate::retry::{RetryFailure, RetryPolicy};
use crate::taxonomy::{normalize_label, Taxonomy, TaxonomyCategory};

const SYSTEM_PROMPT: &str = "You extract structured tags from persona cards.\n\
Reply with strictly valid JSON and nothing else: no comments, no explanations.\n\
Only use categories and values from the allowed list. If the card has no evidence for a \
category, leave that category out. Never invent values.";

/// One exported `(persona_id, category, value)` triple
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TagRecord {
    pub persona_id: String,
    pub category: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
}

/// Which personas a run covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSet {
    All,
    Ids(Vec<String>),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaggingError {
    #[error("persona not found in store")]
    NotFound,
    #[error("model call failed: {0}")]
    Model(RetryFailure),
    #[error("unparseable model response: {0}")]
    Unparseable(String),
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TaggerOptions {
    pub batch_size: usize,
    pub workers: usize,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaggingReport {
    pub targeted: usize,
    pub tagged: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub triples_exported: usize,
    /// Proposals outside the taxonomy or malformed, dropped
    pub candidates_dropped: usize,
    pub failures: Vec<ItemFailure>,
    pub export: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<PathBuf>,
    pub status: RunStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    category: String,
    value: String,
    justification: Option<String>,
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Candidates plus the number of malformed entries skipped
fn parse_candidates(text: &str) -> Result<(Vec<Candidate>, usize), TaggingError> {
    let parsed: Value =
        parse_json_response(text).map_err(|e| TaggingError::Unparseable(format!("{:#}", e)))?;
    let tags = parsed
        .get("tags")
        .ok_or_else(|| TaggingError::Unparseable("response has no `tags` field".to_string()))?;

    let mut candidates = Vec::new();
    let mut malformed = 0;
    match tags {
        Value::Null => {}
        Value::Array(items) => {
            for item in items {
                let category = item.get("category").and_then(scalar_text);
                let values = match item.get("value") {
                    Some(Value::Array(list)) => list.iter().filter_map(scalar_text).collect(),
                    Some(other) => scalar_text(other).into_iter().collect(),
                    None => Vec::new(),
                };
                let justification = item
                    .get("justification")
                    .and_then(scalar_text)
                    .map(|j| j.trim().to_string())
                    .filter(|j| !j.is_empty());
                match category {
                    Some(category) if !values.is_empty() => {
                        for value in values {
                            candidates.push(Candidate {
                                category: category.clone(),
                                value,
                                justification: justification.clone(),
                            });
                        }
                    }
                    _ => malformed += 1,
                }
            }
        }
        Value::Object(map) => {
            for (category, value) in map {
                match value {
                    Value::Null => {}
                    Value::Array(list) => {
                        for item in list {
                            match scalar_text(item) {
                                Some(value) => candidates.push(Candidate {
                                    category: category.clone(),
                                    value,
                                    justification: None,
                                }),
                                None => malformed += 1,
                            }
                        }
                    }
                    other => match scalar_text(other) {
                        Some(value) => candidates.push(Candidate {
                            category: category.clone(),
                            value,
                            justification: None,
                        }),
                        None => malformed += 1,
                    },
                }
            }
        }
        _ => {
            return Err(TaggingError::Unparseable(
                "`tags` is neither a list nor an object".to_string(),
            ))
        }
    }
    Ok((candidates, malformed))
}

fn build_user_prompt(persona: &Persona, batch: &[TaxonomyCategory]) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "Persona card (Markdown):");
    let _ = writeln!(prompt, "{}", persona.profile.trim());
    let _ = writeln!(prompt);
    let _ = writeln!(
        prompt,
        "Assign values for these categories, only where the card states them explicitly:"
    );
    for category in batch {
        let _ = write!(
            prompt,
            "- category={}, allowed values: {}",
            category.name,
            category.values.join(" | ")
        );
        if let Some(hint) = &category.hint {
            let _ = write!(prompt, ", hint: {}", hint);
        }
        let _ = writeln!(prompt);
    }
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "Return JSON of exactly this shape:");
    let _ = writeln!(
        prompt,
        r#"{{"tags": [{{"category": "<category>", "value": "<allowed value>", "justification": "<short evidence from the card>"}}]}}"#
    );
    let _ = writeln!(
        prompt,
        "One entry per value; a category may have several values."
    );
    prompt
}

enum PersonaOutcome {
    Tagged {
        records: Vec<TagRecord>,
        dropped: usize,
    },
    Failed(TaggingError),
}

pub struct AutoTagger {
    model: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
    db: Arc<PersonaDatabase>,
    options: TaggerOptions,
}

impl AutoTagger {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        retry: RetryPolicy,
        db: Arc<PersonaDatabase>,
        options: TaggerOptions,
    ) -> Self {
        Self {
            model,
            retry,
            db,
            options,
        }
    }

    async fn tag_persona(
        &self,
        persona: &Persona,
        taxonomy: &Taxonomy,
        cancel: &CancellationToken,
    ) -> PersonaOutcome {
        if cancel.is_cancelled() {
            return PersonaOutcome::Failed(TaggingError::Cancelled);
        }

        let mut seen = HashSet::new();
        let mut records = Vec::new();
        let mut dropped = 0;

        for (idx, batch) in taxonomy.batches(self.options.batch_size).enumerate() {
            let request = CompletionRequest {
                system: SYSTEM_PROMPT.to_string(),
                user: build_user_prompt(persona, batch),
                temperature: self.options.temperature,
                max_tokens: self.options.max_tokens,
            };
            let label = format!("tag {} batch {}", persona.persona_id, idx + 1);
            let completion = match self
                .retry
                .call(cancel, &label, || {
                    let model = self.model.clone();
                    let request = request.clone();
                    async move { model.complete(&request).await }
                })
                .await
            {
                Ok(completion) => completion,
                Err(failure) if failure.is_cancelled() => {
                    return PersonaOutcome::Failed(TaggingError::Cancelled)
                }
                Err(failure) => return PersonaOutcome::Failed(TaggingError::Model(failure)),
            };

            let (candidates, malformed) = match parse_candidates(&completion.text) {
                Ok(parsed) => parsed,
                Err(e) => return PersonaOutcome::Failed(e),
            };
            dropped += malformed;

            for candidate in candidates {
                let category = normalize_label(&candidate.category);
                let value = taxonomy.canonical_value(&category, &normalize_label(&candidate.value));
                if !taxonomy.contains_normalized(&category, &value) {
                    tracing::warn!(
                        "Dropping off-taxonomy tag for {}: {} = {}",
                        persona.persona_id,
                        category,
                        value
                    );
                    dropped += 1;
                    continue;
                }
                if seen.insert((category.clone(), value.clone())) {
                    records.push(TagRecord {
                        persona_id: persona.persona_id.clone(),
                        category,
                        value,
                        justification: candidate.justification,
                    });
                }
            }
        }

        tracing::debug!(
            "Tagged {}: {} triple(s), {} dropped",
            persona.persona_id,
            records.len(),
            dropped
        );
        PersonaOutcome::Tagged { records, dropped }
    }

    fn resolve_targets(&self, targets: &TargetSet) -> Result<(Vec<Persona>, Vec<ItemFailure>)> {
        match targets {
            TargetSet::All => Ok((self.db.list_personas()?, Vec::new())),
            TargetSet::Ids(ids) => {
                let mut personas = Vec::new();
                let mut missing = Vec::new();
                let mut unique = HashSet::new();
                for id in ids {
                    if !unique.insert(id.as_str()) {
                        continue;
                    }
                    match self.db.get_persona(id)? {
                        Some(persona) => personas.push(persona),
                        None => {
                            tracing::warn!("Requested persona {} is not in the store", id);
                            missing.push(ItemFailure::new(id.clone(), TaggingError::NotFound));
                        }
                    }
                }
                Ok((personas, missing))
            }
        }
    }

    /// Tag the target set and write the export artifact (plus a failure manifest
    /// next to it when some personas failed).
    pub async fn run(
        &self,
        targets: &TargetSet,
        taxonomy: &Taxonomy,
        export_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<TaggingReport> {
        let (personas, mut failures) = self.resolve_targets(targets)?;
        let targeted = personas.len() + failures.len();
        tracing::info!(
            "Auto-tagging {} persona(s) against {} categories with {}",
            personas.len(),
            taxonomy.categories().len(),
            self.model.describe()
        );

        let outcomes: Vec<(String, PersonaOutcome)> = stream::iter(personas.iter())
            .map(|persona| async move {
                let outcome = self.tag_persona(persona, taxonomy, cancel).await;
                (persona.persona_id.clone(), outcome)
            })
            .buffer_unordered(self.options.workers.max(1))
            .collect()
            .await;

        let mut records = Vec::new();
        let mut tagged = 0;
        let mut cancelled = 0;
        let mut dropped_total = 0;
        for (persona_id, outcome) in outcomes {
            match outcome {
                PersonaOutcome::Tagged {
                    records: persona_records,
                    dropped,
                } => {
                    tagged += 1;
                    dropped_total += dropped;
                    records.extend(persona_records);
                }
                PersonaOutcome::Failed(error) => {
                    if error == TaggingError::Cancelled {
                        cancelled += 1;
                    } else {
                        tracing::warn!("Tagging failed for {}: {}", persona_id, error);
                    }
                    failures.push(ItemFailure::new(persona_id, error));
                }
            }
        }
        records.sort();
        failures.sort_by(|a, b| a.item.cmp(&b.item));

        let json = serde_json::to_string_pretty(&records).context("Failed to serialize export")?;
        write_atomic(export_path, json.as_bytes())
            .with_context(|| format!("Failed to write tag export {:?}", export_path))?;

        let manifest = FailureManifest::write_or_clear(
            Stage::AutoTag,
            &failures,
            &manifest_path_for(export_path),
        )?;

        let report = TaggingReport {
            targeted,
            tagged,
            failed: failures.len() - cancelled,
            cancelled,
            triples_exported: records.len(),
            candidates_dropped: dropped_total,
            status: RunStatus::from_counts(tagged, failures.len()),
            failures,
            export: export_path.to_path_buf(),
            manifest,
        };
        tracing::info!(
            "Auto-tag finished: {} tagged, {} failed, {} cancelled, {} triple(s) exported, {} candidate(s) dropped ({:?})",
            report.tagged,
            report.failed,
            report.cancelled,
            report.triples_exported,
            report.candidates_dropped,
            report.status
        );
        Ok(report)
    }
}

/// Read a tag export artifact back
pub fn read_export(path: &Path) -> Result<Vec<TagRecord>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read tag export {:?}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse tag export {:?}", path))
}
