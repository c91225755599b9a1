//! Persona generation: one normalized transcript in, one card file plus one
//! store row out.

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::card::{card_file_name, heading_title, render_card, CardHeader};
use crate::database::{Persona, PersonaDatabase, Provenance, WriteMode, WriteOutcome};
use crate::llm_client::{CompletionRequest, LanguageModel};
use crate::report::{write_atomic, FailureManifest, ItemFailure, RunStatus, Stage};
use crate::retry::{RetryFailure, RetryPolicy};

pub const GENERATE_MANIFEST_NAME: &str = "generate.failures.json";

const SYSTEM_PROMPT: &str = "You turn interview transcripts into synthetic persona cards.\n\
Write the card in Markdown. The first line MUST be a level-one heading with a short \
persona title: name, age and occupation, for example `# Anna, 34, interior designer`.\n\
After the heading write these sections: Demographics, Background, Daily life, Values and \
motivations, Pain points, Communication style, Typical quotes.\n\
Use only facts present in the transcript. Do not invent names of real people or companies.";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("unreadable transcript: {0}")]
    UnreadableTranscript(String),
    #[error("transcript is empty")]
    EmptyTranscript,
    #[error("model call failed: {0}")]
    Model(RetryFailure),
    #[error("model returned empty output")]
    EmptyOutput,
    #[error("model output was truncated at the token limit")]
    Truncated,
    #[error("model output has no leading `# <title>` heading")]
    MissingHeading,
    #[error("failed to write card: {0}")]
    CardWrite(String),
}

/// `p_` + first 12 hex chars of SHA-256(`<batch>:<stem>`)
pub fn derive_persona_id(batch: &str, stem: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}", batch, stem).as_bytes());
    format!("p_{}", &hex::encode(digest)[..12])
}

#[derive(Debug, Clone)]
pub struct GeneratorOptions {
    /// Batch/version tag mixed into every persona id
    pub batch: String,
    pub card_dir: PathBuf,
    pub overwrite: bool,
    pub workers: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Restrict a batch run to these transcript stems
    pub only_stems: Option<HashSet<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Generated { card_path: PathBuf },
    Regenerated { card_path: PathBuf },
    Skipped,
    Failed(GenerationError),
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Generated,
    Regenerated,
    Skipped,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptResult {
    pub stem: String,
    pub persona_id: String,
    pub outcome: OutcomeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TranscriptResult {
    fn new(stem: String, persona_id: String, outcome: &GenerationOutcome) -> Self {
        let (kind, detail) = match outcome {
            GenerationOutcome::Generated { card_path } => {
                (OutcomeKind::Generated, Some(card_path.display().to_string()))
            }
            GenerationOutcome::Regenerated { card_path } => {
                (OutcomeKind::Regenerated, Some(card_path.display().to_string()))
            }
            GenerationOutcome::Skipped => (OutcomeKind::Skipped, None),
            GenerationOutcome::Failed(e) => (OutcomeKind::Failed, Some(e.to_string())),
            GenerationOutcome::Cancelled => (OutcomeKind::Cancelled, None),
        };
        Self {
            stem,
            persona_id,
            outcome: kind,
            detail,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationReport {
    pub results: Vec<TranscriptResult>,
    pub generated: usize,
    pub regenerated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<PathBuf>,
}

impl GenerationReport {
    fn from_results(mut results: Vec<TranscriptResult>) -> Self {
        results.sort_by(|a, b| a.stem.cmp(&b.stem));
        let count = |kind: OutcomeKind| results.iter().filter(|r| r.outcome == kind).count();
        let generated = count(OutcomeKind::Generated);
        let regenerated = count(OutcomeKind::Regenerated);
        let skipped = count(OutcomeKind::Skipped);
        let failed = count(OutcomeKind::Failed);
        let cancelled = count(OutcomeKind::Cancelled);
        Self {
            status: RunStatus::from_counts(generated + regenerated + skipped, failed + cancelled),
            results,
            generated,
            regenerated,
            skipped,
            failed,
            cancelled,
            manifest: None,
        }
    }

    /// Failed and cancelled stems, ready for an `only_stems` retry run
    pub fn failures(&self) -> Vec<ItemFailure> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, OutcomeKind::Failed | OutcomeKind::Cancelled))
            .map(|r| {
                ItemFailure::new(
                    r.stem.clone(),
                    r.detail.clone().unwrap_or_else(|| "cancelled".to_string()),
                )
            })
            .collect()
    }
}

pub struct PersonaGenerator {
    model: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
    db: Arc<PersonaDatabase>,
    options: GeneratorOptions,
}

impl PersonaGenerator {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        retry: RetryPolicy,
        db: Arc<PersonaDatabase>,
        options: GeneratorOptions,
    ) -> Self {
        Self {
            model,
            retry,
            db,
            options,
        }
    }

    /// Generate one persona. `Err` is reserved for store failures, which are fatal.
    pub async fn generate_one(
        &self,
        transcript: &Path,
        cancel: &CancellationToken,
    ) -> Result<(String, GenerationOutcome)> {
        let stem = transcript
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let persona_id = derive_persona_id(&self.options.batch, &stem);

        if cancel.is_cancelled() {
            return Ok((persona_id, GenerationOutcome::Cancelled));
        }

        if !self.options.overwrite && self.db.persona_exists(&persona_id)? {
            tracing::debug!("{} already stored as {}, skipping", stem, persona_id);
            return Ok((persona_id, GenerationOutcome::Skipped));
        }

        let outcome = match self.produce(transcript, &stem, &persona_id, cancel).await {
            Ok(card) => self.store(card, &persona_id, transcript)?,
            Err(GenerationError::Model(failure)) if failure.is_cancelled() => {
                GenerationOutcome::Cancelled
            }
            Err(e) => {
                tracing::warn!("Generation failed for {}: {}", stem, e);
                GenerationOutcome::Failed(e)
            }
        };
        Ok((persona_id, outcome))
    }

    async fn produce(
        &self,
        transcript: &Path,
        stem: &str,
        persona_id: &str,
        cancel: &CancellationToken,
    ) -> Result<GeneratedCard, GenerationError> {
        let text = fs::read_to_string(transcript)
            .map_err(|e| GenerationError::UnreadableTranscript(e.to_string()))?;
        if text.trim().is_empty() {
            return Err(GenerationError::EmptyTranscript);
        }

        let request = CompletionRequest {
            system: SYSTEM_PROMPT.to_string(),
            user: format!("Interview transcript:\n\n{}", text.trim()),
            temperature: self.options.temperature,
            max_tokens: self.options.max_tokens,
        };

        let label = format!("generate {}", stem);
        let completion = self
            .retry
            .call(cancel, &label, || {
                let model = self.model.clone();
                let request = request.clone();
                async move { model.complete(&request).await }
            })
            .await
            .map_err(GenerationError::Model)?;

        // Validation failures are permanent and never retried
        if completion.truncated {
            return Err(GenerationError::Truncated);
        }
        let profile = completion.text.trim().to_string();
        if profile.is_empty() {
            return Err(GenerationError::EmptyOutput);
        }
        let title = heading_title(&profile).ok_or(GenerationError::MissingHeading)?;

        let header = CardHeader {
            persona_id: persona_id.to_string(),
            title,
            batch: Some(self.options.batch.clone()),
            source: transcript
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
            generated_at: Some(Utc::now().to_rfc3339()),
        };
        let card_path = self
            .write_card(&header, &profile)
            .map_err(|e| GenerationError::CardWrite(format!("{:#}", e)))?;

        Ok(GeneratedCard {
            header,
            profile,
            card_path,
        })
    }

    fn write_card(&self, header: &CardHeader, profile: &str) -> Result<PathBuf> {
        let file_name = card_file_name(&header.title, &header.persona_id);
        let path = self.options.card_dir.join(&file_name);
        write_atomic(&path, render_card(header, profile)?.as_bytes())?;

        // A regenerated persona may have a new title; drop cards under the old slug
        let suffix = format!("_{}.md", header.persona_id);
        for entry in fs::read_dir(&self.options.card_dir)?.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name != file_name && name.ends_with(&suffix) {
                if let Err(e) = fs::remove_file(entry.path()) {
                    tracing::warn!("Failed to remove stale card {}: {}", name, e);
                }
            }
        }
        Ok(path)
    }

    fn store(
        &self,
        card: GeneratedCard,
        persona_id: &str,
        transcript: &Path,
    ) -> Result<GenerationOutcome> {
        let persona = Persona {
            persona_id: persona_id.to_string(),
            title: card.header.title,
            profile: card.profile,
            created_at: Utc::now(),
        };
        let mode = if self.options.overwrite {
            WriteMode::Replace
        } else {
            WriteMode::KeepExisting
        };
        let provenance = Provenance {
            source_path: transcript.display().to_string(),
            source_label: self.options.batch.clone(),
        };
        let written = self
            .db
            .write_persona(&persona, mode, &provenance)
            .with_context(|| format!("Failed to store persona {}", persona_id))?;

        tracing::info!("Generated {} ({:?}) -> {:?}", persona_id, written, card.card_path);
        Ok(match written {
            WriteOutcome::Replaced => GenerationOutcome::Regenerated {
                card_path: card.card_path,
            },
            WriteOutcome::Inserted => GenerationOutcome::Generated {
                card_path: card.card_path,
            },
            WriteOutcome::KeptExisting => GenerationOutcome::Skipped,
        })
    }

    /// Generate personas for every `*.txt` in `txt_dir` with bounded parallelism.
    pub async fn generate_directory(
        &self,
        txt_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<GenerationReport> {
        let transcripts = list_transcripts(txt_dir, self.options.only_stems.as_ref())?;
        fs::create_dir_all(&self.options.card_dir).with_context(|| {
            format!("Failed to create card directory {:?}", self.options.card_dir)
        })?;
        tracing::info!(
            "Generating {} persona(s) from {:?} with {} using {} worker(s)",
            transcripts.len(),
            txt_dir,
            self.model.describe(),
            self.options.workers.max(1)
        );

        let results: Vec<TranscriptResult> = stream::iter(transcripts)
            .map(|path| async move {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let (persona_id, outcome) = self.generate_one(&path, cancel).await?;
                Ok::<_, anyhow::Error>(TranscriptResult::new(stem, persona_id, &outcome))
            })
            .buffer_unordered(self.options.workers.max(1))
            .try_collect()
            .await?;

        let mut report = GenerationReport::from_results(results);
        report.manifest = FailureManifest::write_or_clear(
            Stage::Generate,
            &report.failures(),
            &self.options.card_dir.join(GENERATE_MANIFEST_NAME),
        )?;

        tracing::info!(
            "Generation finished: {} generated, {} regenerated, {} skipped, {} failed, {} cancelled ({:?})",
            report.generated,
            report.regenerated,
            report.skipped,
            report.failed,
            report.cancelled,
            report.status
        );
        Ok(report)
    }
}

struct GeneratedCard {
    header: CardHeader,
    profile: String,
    card_path: PathBuf,
}

fn list_transcripts(dir: &Path, only: Option<&HashSet<String>>) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("Failed to read transcript directory {:?}", dir))?
    {
        let path = entry?.path();
        let is_txt = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("txt"))
            .unwrap_or(false);
        if !path.is_file() || !is_txt {
            continue;
        }
        if let Some(only) = only {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !only.contains(&stem) {
                continue;
            }
        }
        paths.push(path);
    }
    paths.sort();
    Ok(paths)
}
