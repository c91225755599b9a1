//! Versioned card import with deterministic id-collision resolution.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::card::{parse_card, CardParseError, ParsedCard};
use crate::database::{Persona, PersonaDatabase, Provenance, WriteMode, WriteOutcome};
use crate::report::{ItemFailure, RunStatus};

pub const CARDS_SUBDIR: &str = "cards_md";

/// How a `persona_id` seen twice is resolved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DedupPolicy {
    /// First directory (or an existing store row) wins
    #[default]
    SkipExisting,
    /// Last directory wins
    Overwrite,
    /// Any repeat is a recorded conflict
    ErrorOnConflict,
}

#[derive(Debug, Error)]
pub enum ImportIssue {
    #[error("parse error: {0}")]
    Parse(CardParseError),
    #[error("duplicate persona_id {persona_id}: already provided by {existing}")]
    DuplicateConflict { persona_id: String, existing: String },
    #[error("io error: {0}")]
    Io(String),
}

impl From<CardParseError> for ImportIssue {
    fn from(error: CardParseError) -> Self {
        match error {
            CardParseError::Read { reason, .. } => {
                ImportIssue::Io(format!("cannot read card: {}", reason))
            }
            other => ImportIssue::Parse(other),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportSummary {
    pub written: usize,
    pub replaced: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub conflicted: usize,
    pub failed: usize,
    pub issues: Vec<ItemFailure>,
}

impl ImportSummary {
    pub fn status(&self) -> RunStatus {
        RunStatus::from_counts(
            self.written + self.replaced + self.unchanged + self.skipped,
            self.conflicted + self.failed,
        )
    }

    fn record(&mut self, item: &Path, issue: ImportIssue) {
        tracing::warn!("Import issue for {:?}: {}", item, issue);
        match issue {
            ImportIssue::DuplicateConflict { .. } => self.conflicted += 1,
            ImportIssue::Parse(_) | ImportIssue::Io(_) => self.failed += 1,
        }
        self.issues
            .push(ItemFailure::new(item.display().to_string(), issue));
    }
}

fn sorted_markdown(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut cards: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .map(|e| e.eq_ignore_ascii_case("md"))
                    .unwrap_or(false)
        })
        .collect();
    cards.sort();
    Ok(cards)
}

/// Card files of one version directory: top level first, then `cards_md/`
pub fn discover_cards(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut cards = sorted_markdown(dir)?;
    let nested = dir.join(CARDS_SUBDIR);
    if nested.is_dir() {
        cards.extend(sorted_markdown(&nested)?);
    }
    Ok(cards)
}

fn dir_label(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string())
}

fn card_created_at(card: &ParsedCard) -> DateTime<Utc> {
    card.header
        .generated_at
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

struct Importer<'a> {
    db: &'a PersonaDatabase,
    policy: DedupPolicy,
    /// persona_id → card that introduced it in this run
    seen: HashMap<String, PathBuf>,
    summary: ImportSummary,
}

impl<'a> Importer<'a> {
    fn import_card(&mut self, path: &Path, label: &str) -> Result<()> {
        let card = match parse_card(path) {
            Ok(card) => card,
            Err(e) => {
                self.summary.record(path, e.into());
                return Ok(());
            }
        };
        let persona_id = card.header.persona_id.clone();
        let persona = Persona {
            persona_id: persona_id.clone(),
            title: card.header.title.clone(),
            profile: card.profile.clone(),
            created_at: card_created_at(&card),
        };
        let provenance = Provenance {
            source_path: path.display().to_string(),
            source_label: label.to_string(),
        };

        match self.policy {
            DedupPolicy::SkipExisting => {
                if self.seen.contains_key(&persona_id) {
                    tracing::debug!("{} already imported in this run, skipping {:?}", persona_id, path);
                    self.summary.skipped += 1;
                    return Ok(());
                }
                match self.write(&persona, WriteMode::KeepExisting, &provenance)? {
                    WriteOutcome::KeptExisting => self.summary.skipped += 1,
                    _ => self.summary.written += 1,
                }
            }
            DedupPolicy::Overwrite => {
                let existing = self.db.get_persona(&persona_id)?;
                let identical = existing
                    .as_ref()
                    .map(|p| p.title == persona.title && p.profile == persona.profile)
                    .unwrap_or(false);
                if identical {
                    self.summary.unchanged += 1;
                } else {
                    match self.write(&persona, WriteMode::Replace, &provenance)? {
                        WriteOutcome::Replaced => self.summary.replaced += 1,
                        _ => self.summary.written += 1,
                    }
                }
            }
            DedupPolicy::ErrorOnConflict => {
                let existing = match self.seen.get(&persona_id) {
                    Some(earlier) => Some(earlier.display().to_string()),
                    None if self.db.persona_exists(&persona_id)? => {
                        Some("existing store row".to_string())
                    }
                    None => None,
                };
                if let Some(existing) = existing {
                    self.summary.record(
                        path,
                        ImportIssue::DuplicateConflict {
                            persona_id,
                            existing,
                        },
                    );
                    return Ok(());
                }
                self.write(&persona, WriteMode::KeepExisting, &provenance)?;
                self.summary.written += 1;
            }
        }

        self.seen.insert(persona_id, path.to_path_buf());
        Ok(())
    }

    fn write(
        &self,
        persona: &Persona,
        mode: WriteMode,
        provenance: &Provenance,
    ) -> Result<WriteOutcome> {
        self.db
            .write_persona(persona, mode, provenance)
            .with_context(|| format!("Failed to store persona {}", persona.persona_id))
    }
}

/// Import card directories strictly in the given order. Per-card problems are
/// recorded in the summary; only store failures abort the import.
pub fn import_directories(
    db: &PersonaDatabase,
    dirs: &[PathBuf],
    policy: DedupPolicy,
) -> Result<ImportSummary> {
    db.check_connectivity()?;
    let mut importer = Importer {
        db,
        policy,
        seen: HashMap::new(),
        summary: ImportSummary::default(),
    };

    for dir in dirs {
        let cards = match discover_cards(dir) {
            Ok(cards) => cards,
            Err(e) => {
                importer
                    .summary
                    .record(dir, ImportIssue::Io(format!("cannot read directory: {}", e)));
                continue;
            }
        };
        let label = dir_label(dir);
        tracing::info!("Importing {} card(s) from {:?} ({:?})", cards.len(), dir, policy);
        for card in cards {
            importer.import_card(&card, &label)?;
        }
    }

    let summary = importer.summary;
    tracing::info!(
        "Import finished: {} written, {} replaced, {} unchanged, {} skipped, {} conflicted, {} failed",
        summary.written,
        summary.replaced,
        summary.unchanged,
        summary.skipped,
        summary.conflicted,
        summary.failed
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::{render_card, CardHeader};
    use crate::testing::temp_db_path;

    fn write_card(dir: &Path, name: &str, id: &str, title: &str, body: &str) {
        fs::create_dir_all(dir).unwrap();
        let header = CardHeader {
            persona_id: id.to_string(),
            title: title.to_string(),
            batch: None,
            source: None,
            generated_at: None,
        };
        fs::write(dir.join(name), render_card(&header, body).unwrap()).unwrap();
    }

    fn setup() -> (tempfile::TempDir, PersonaDatabase) {
        let dir = tempfile::tempdir().unwrap();
        let db = PersonaDatabase::new(temp_db_path(dir.path())).unwrap();
        (dir, db)
    }

    #[test]
    fn default_policy_is_skip_existing() {
        assert_eq!(DedupPolicy::default(), DedupPolicy::SkipExisting);
    }

    #[test]
    fn skip_existing_is_idempotent() {
        let (tmp, db) = setup();
        let v1 = tmp.path().join("v1");
        write_card(&v1, "a.md", "p_aaaaaaaa01", "Anna", "Anna profile");
        write_card(&v1.join(CARDS_SUBDIR), "b.md", "p_bbbbbbbb02", "Boris", "Boris profile");

        let first = import_directories(&db, &[v1.clone()], DedupPolicy::SkipExisting).unwrap();
        assert_eq!(first.written, 2);
        assert_eq!(first.status(), RunStatus::Success);

        let before = db.list_personas().unwrap();
        let second = import_directories(&db, &[v1], DedupPolicy::SkipExisting).unwrap();
        assert_eq!(second.written, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(db.list_personas().unwrap(), before);
        assert_eq!(db.count_versions("p_aaaaaaaa01").unwrap(), 1);
    }

    #[test]
    fn skip_existing_keeps_first_directory() {
        let (tmp, db) = setup();
        let d1 = tmp.path().join("d1");
        let d2 = tmp.path().join("d2");
        write_card(&d1, "p.md", "p_cccccccc03", "From D1", "one");
        write_card(&d2, "p.md", "p_cccccccc03", "From D2", "two");

        let summary = import_directories(&db, &[d1, d2], DedupPolicy::SkipExisting).unwrap();
        assert_eq!((summary.written, summary.skipped), (1, 1));
        assert_eq!(db.get_persona("p_cccccccc03").unwrap().unwrap().title, "From D1");
    }

    #[test]
    fn overwrite_keeps_last_directory() {
        let (tmp, db) = setup();
        let d1 = tmp.path().join("d1");
        let d2 = tmp.path().join("d2");
        write_card(&d1, "p.md", "p_cccccccc03", "From D1", "one");
        write_card(&d2, "p.md", "p_cccccccc03", "From D2", "two");

        let summary =
            import_directories(&db, &[d1.clone(), d2.clone()], DedupPolicy::Overwrite).unwrap();
        assert_eq!((summary.written, summary.replaced), (1, 1));
        let stored = db.get_persona("p_cccccccc03").unwrap().unwrap();
        assert_eq!(stored.title, "From D2");
        assert_eq!(stored.profile, "two");
        assert_eq!(
            db.active_version_label("p_cccccccc03").unwrap().as_deref(),
            Some("d2")
        );

        let again = import_directories(&db, &[d2], DedupPolicy::Overwrite).unwrap();
        assert_eq!(again.unchanged, 1);
        assert_eq!(db.count_versions("p_cccccccc03").unwrap(), 2);
    }

    #[test]
    fn error_on_conflict_records_both_sources() {
        let (tmp, db) = setup();
        let d1 = tmp.path().join("d1");
        let d2 = tmp.path().join("d2");
        write_card(&d1, "p.md", "p_cccccccc03", "From D1", "one");
        write_card(&d2, "p.md", "p_cccccccc03", "From D2", "two");
        write_card(&d2, "q.md", "p_dddddddd04", "Other", "three");

        let summary =
            import_directories(&db, &[d1.clone(), d2.clone()], DedupPolicy::ErrorOnConflict)
                .unwrap();
        assert_eq!(summary.written, 2);
        assert_eq!(summary.conflicted, 1);
        assert_eq!(summary.status(), RunStatus::SuccessWithWarnings);
        let issue = &summary.issues[0];
        assert!(issue.item.ends_with("p.md"));
        assert!(issue.item.contains("d2"));
        assert!(issue.reason.contains("d1"));
        assert_eq!(db.get_persona("p_cccccccc03").unwrap().unwrap().title, "From D1");

        // pre-existing rows conflict as well
        let rerun = import_directories(&db, &[d1], DedupPolicy::ErrorOnConflict).unwrap();
        assert_eq!(rerun.conflicted, 1);
        assert!(rerun.issues[0].reason.contains("existing store row"));
    }

    #[test]
    fn bad_cards_and_missing_dirs_are_recorded() {
        let (tmp, db) = setup();
        let d1 = tmp.path().join("d1");
        write_card(&d1, "good.md", "p_eeeeeeee05", "Good", "fine");
        fs::write(d1.join("broken.md"), "---\ntitle: no id\n---\nbody").unwrap();
        fs::write(d1.join("legacy_p_ffffffff06.md"), "# Legacy title\n\nbody").unwrap();
        fs::write(d1.join("readme.txt"), "not a card").unwrap();

        let summary = import_directories(
            &db,
            &[d1, tmp.path().join("missing")],
            DedupPolicy::SkipExisting,
        )
        .unwrap();
        assert_eq!(summary.written, 2);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.issues.len(), 2);
        assert_eq!(
            db.get_persona("p_ffffffff06").unwrap().unwrap().title,
            "Legacy title"
        );
    }

    #[test]
    fn unreadable_card_is_an_io_issue() {
        let (tmp, db) = setup();
        let d1 = tmp.path().join("d1");
        fs::create_dir_all(&d1).unwrap();
        fs::write(d1.join("latin1_p_abababab07.md"), b"# Caf\xe9\n\nbody").unwrap();
        fs::write(d1.join("broken.md"), "---\ntitle: no id\n---\nbody").unwrap();

        let summary = import_directories(&db, &[d1], DedupPolicy::SkipExisting).unwrap();
        assert_eq!(summary.failed, 2);
        let reasons: Vec<_> = summary.issues.iter().map(|i| i.reason.as_str()).collect();
        assert!(reasons[0].starts_with("parse error:"), "{:?}", reasons);
        assert!(reasons[1].starts_with("io error: cannot read card"), "{:?}", reasons);
    }
}
