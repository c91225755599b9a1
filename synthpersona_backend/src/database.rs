use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

/// A synthetic respondent record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub persona_id: String,
    pub title: String,
    pub profile: String,
    pub created_at: DateTime<Utc>,
}

/// A stored `(persona_id, category, value)` assertion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTag {
    pub persona_id: String,
    pub category: String,
    pub value: String,
    pub justification: Option<String>,
}

/// Where a persona write came from, for the audit log
#[derive(Debug, Clone)]
pub struct Provenance {
    pub source_path: String,
    /// Version directory or batch tag
    pub source_label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Leave an existing row untouched
    KeepExisting,
    /// Replace an existing row in full
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Replaced,
    KeptExisting,
}

/// SQLite-backed persona store. All access goes through one connection lock,
/// which serializes writers for every persona id.
pub struct PersonaDatabase {
    conn: Mutex<Connection>,
}

impl PersonaDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create database directory {:?}", parent))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open persona store at {:?}", path))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()
            .with_context(|| format!("Persona store at {:?} is unusable", path))?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS personas (
                persona_id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                profile TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS persona_tags (
                persona_id TEXT NOT NULL,
                category TEXT NOT NULL,
                value TEXT NOT NULL,
                justification TEXT,
                PRIMARY KEY (persona_id, category, value),
                FOREIGN KEY (persona_id) REFERENCES personas(persona_id)
            )"#,
            [],
        )?;

        // Audit log of every persona write; the newest row per id is active
        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS persona_versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                persona_id TEXT NOT NULL,
                title TEXT NOT NULL,
                profile TEXT NOT NULL,
                source_path TEXT NOT NULL,
                source_label TEXT NOT NULL,
                written_at TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_persona_versions_persona ON persona_versions(persona_id)",
            [],
        )?;

        Ok(())
    }

    /// Round-trip query used to detect an unreachable or corrupt store early
    pub fn check_connectivity(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.query_row("SELECT COUNT(*) FROM personas", [], |row| row.get::<_, i64>(0))
            .context("Persona store is not readable")?;
        Ok(())
    }

    // ========================================================================
    // Personas
    // ========================================================================

    pub fn persona_exists(&self, persona_id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM personas WHERE persona_id = ?1",
                [persona_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get_persona(&self, persona_id: &str) -> Result<Option<Persona>> {
        let conn = self.lock_conn()?;
        let persona = conn
            .query_row(
                "SELECT persona_id, title, profile, created_at FROM personas WHERE persona_id = ?1",
                [persona_id],
                row_to_persona,
            )
            .optional()?;
        Ok(persona)
    }

    /// All personas, newest first
    pub fn list_personas(&self) -> Result<Vec<Persona>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT persona_id, title, profile, created_at FROM personas
             ORDER BY created_at DESC, persona_id ASC",
        )?;
        let personas = stmt
            .query_map([], row_to_persona)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(personas)
    }

    pub fn persona_ids(&self) -> Result<HashSet<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT persona_id FROM personas")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    pub fn count_personas(&self) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM personas", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Write a persona row whole, plus its audit entry, in one transaction.
    /// The existence check and the write happen under the same lock.
    pub fn write_persona(
        &self,
        persona: &Persona,
        mode: WriteMode,
        provenance: &Provenance,
    ) -> Result<WriteOutcome> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM personas WHERE persona_id = ?1",
                [&persona.persona_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        let outcome = match (exists, mode) {
            (true, WriteMode::KeepExisting) => return Ok(WriteOutcome::KeptExisting),
            (true, WriteMode::Replace) => {
                tx.execute(
                    "UPDATE personas SET title = ?2, profile = ?3, created_at = ?4
                     WHERE persona_id = ?1",
                    params![
                        persona.persona_id,
                        persona.title,
                        persona.profile,
                        persona.created_at.to_rfc3339()
                    ],
                )?;
                WriteOutcome::Replaced
            }
            (false, _) => {
                tx.execute(
                    "INSERT INTO personas (persona_id, title, profile, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        persona.persona_id,
                        persona.title,
                        persona.profile,
                        persona.created_at.to_rfc3339()
                    ],
                )?;
                WriteOutcome::Inserted
            }
        };

        tx.execute(
            "UPDATE persona_versions SET active = 0 WHERE persona_id = ?1",
            [&persona.persona_id],
        )?;
        tx.execute(
            "INSERT INTO persona_versions
                (persona_id, title, profile, source_path, source_label, written_at, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
            params![
                persona.persona_id,
                persona.title,
                persona.profile,
                provenance.source_path,
                provenance.source_label,
                Utc::now().to_rfc3339()
            ],
        )?;

        tx.commit()?;
        Ok(outcome)
    }

    /// Number of audit rows for a persona (all, active or not)
    pub fn count_versions(&self, persona_id: &str) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM persona_versions WHERE persona_id = ?1",
            [persona_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Source label of the active audit row for a persona
    pub fn active_version_label(&self, persona_id: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let label = conn
            .query_row(
                "SELECT source_label FROM persona_versions
                 WHERE persona_id = ?1 AND active = 1
                 ORDER BY id DESC LIMIT 1",
                [persona_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(label)
    }

    // ========================================================================
    // Tags
    // ========================================================================

    /// Insert a tag if absent. Returns true when a new row was written.
    pub fn upsert_tag(&self, tag: &StoredTag) -> Result<bool> {
        let conn = self.lock_conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO persona_tags (persona_id, category, value, justification)
             VALUES (?1, ?2, ?3, ?4)",
            params![tag.persona_id, tag.category, tag.value, tag.justification],
        )?;
        Ok(inserted > 0)
    }

    /// Replace all tags of one persona with `tags`, atomically
    pub fn replace_tags(&self, persona_id: &str, tags: &[StoredTag]) -> Result<usize> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM persona_tags WHERE persona_id = ?1", [persona_id])?;
        let mut written = 0;
        for tag in tags.iter().filter(|t| t.persona_id == persona_id) {
            written += tx.execute(
                "INSERT OR IGNORE INTO persona_tags (persona_id, category, value, justification)
                 VALUES (?1, ?2, ?3, ?4)",
                params![tag.persona_id, tag.category, tag.value, tag.justification],
            )?;
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn tags_for_persona(&self, persona_id: &str) -> Result<Vec<StoredTag>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT persona_id, category, value, justification FROM persona_tags
             WHERE persona_id = ?1 ORDER BY category, value",
        )?;
        let tags = stmt
            .query_map([persona_id], row_to_tag)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tags)
    }

    pub fn all_tags(&self) -> Result<Vec<StoredTag>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT persona_id, category, value, justification FROM persona_tags
             ORDER BY persona_id, category, value",
        )?;
        let tags = stmt
            .query_map([], row_to_tag)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tags)
    }

    /// Tag rows whose persona is missing; empty while foreign keys are enforced
    pub fn count_orphan_tags(&self) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM persona_tags t
             LEFT JOIN personas p ON p.persona_id = t.persona_id
             WHERE p.persona_id IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn row_to_persona(row: &rusqlite::Row<'_>) -> rusqlite::Result<Persona> {
    Ok(Persona {
        persona_id: row.get(0)?,
        title: row.get(1)?,
        profile: row.get(2)?,
        created_at: row.get::<_, String>(3)?.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?,
    })
}

fn row_to_tag(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredTag> {
    Ok(StoredTag {
        persona_id: row.get(0)?,
        category: row.get(1)?,
        value: row.get(2)?,
        justification: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("synthpersona_{}_{}.db", name, uuid::Uuid::new_v4()));
        path
    }

    fn persona(id: &str, title: &str) -> Persona {
        Persona {
            persona_id: id.to_string(),
            title: title.to_string(),
            profile: format!("# {}\n\nprofile body", title),
            created_at: Utc::now(),
        }
    }

    fn provenance(label: &str) -> Provenance {
        Provenance {
            source_path: format!("/cards/{}/card.md", label),
            source_label: label.to_string(),
        }
    }

    #[test]
    fn write_modes_insert_keep_and_replace() {
        let db = PersonaDatabase::new(temp_db_path("write_modes")).expect("db init");

        let first = persona("p_1", "Anna");
        assert_eq!(
            db.write_persona(&first, WriteMode::KeepExisting, &provenance("v1"))
                .unwrap(),
            WriteOutcome::Inserted
        );

        let second = persona("p_1", "Anna v2");
        assert_eq!(
            db.write_persona(&second, WriteMode::KeepExisting, &provenance("v2"))
                .unwrap(),
            WriteOutcome::KeptExisting
        );
        assert_eq!(db.get_persona("p_1").unwrap().unwrap().title, "Anna");
        assert_eq!(db.count_versions("p_1").unwrap(), 1);

        assert_eq!(
            db.write_persona(&second, WriteMode::Replace, &provenance("v2"))
                .unwrap(),
            WriteOutcome::Replaced
        );
        let stored = db.get_persona("p_1").unwrap().unwrap();
        assert_eq!(stored.title, "Anna v2");
        assert_eq!(stored.profile, second.profile);
        assert_eq!(db.count_versions("p_1").unwrap(), 2);
        assert_eq!(db.active_version_label("p_1").unwrap().as_deref(), Some("v2"));
        assert_eq!(db.count_personas().unwrap(), 1);
    }

    #[test]
    fn tag_upsert_is_idempotent() {
        let db = PersonaDatabase::new(temp_db_path("tag_upsert")).expect("db init");
        db.write_persona(&persona("p_1", "Anna"), WriteMode::KeepExisting, &provenance("v1"))
            .unwrap();

        let tag = StoredTag {
            persona_id: "p_1".into(),
            category: "style".into(),
            value: "formal".into(),
            justification: Some("speaks formally".into()),
        };
        assert!(db.upsert_tag(&tag).unwrap());
        assert!(!db.upsert_tag(&tag).unwrap());
        assert_eq!(db.tags_for_persona("p_1").unwrap().len(), 1);
    }

    #[test]
    fn foreign_key_rejects_unknown_persona() {
        let db = PersonaDatabase::new(temp_db_path("fk")).expect("db init");
        let tag = StoredTag {
            persona_id: "p_missing".into(),
            category: "style".into(),
            value: "formal".into(),
            justification: None,
        };
        assert!(db.upsert_tag(&tag).is_err());
        assert_eq!(db.count_orphan_tags().unwrap(), 0);
    }

    #[test]
    fn replace_tags_swaps_the_full_set() {
        let db = PersonaDatabase::new(temp_db_path("replace_tags")).expect("db init");
        db.write_persona(&persona("p_1", "Anna"), WriteMode::KeepExisting, &provenance("v1"))
            .unwrap();
        let tag = |value: &str| StoredTag {
            persona_id: "p_1".into(),
            category: "style".into(),
            value: value.into(),
            justification: None,
        };
        db.upsert_tag(&tag("formal")).unwrap();
        db.upsert_tag(&tag("casual")).unwrap();

        let written = db.replace_tags("p_1", &[tag("ironic")]).unwrap();
        assert_eq!(written, 1);
        let values: Vec<_> = db
            .tags_for_persona("p_1")
            .unwrap()
            .into_iter()
            .map(|t| t.value)
            .collect();
        assert_eq!(values, vec!["ironic".to_string()]);
    }

    #[test]
    fn reopen_keeps_rows() {
        let path = temp_db_path("reopen");
        {
            let db = PersonaDatabase::new(&path).expect("db init");
            db.write_persona(&persona("p_9", "Ivan"), WriteMode::KeepExisting, &provenance("v1"))
                .unwrap();
        }
        let db = PersonaDatabase::new(&path).expect("db reopen");
        db.check_connectivity().expect("connectivity");
        assert!(db.persona_exists("p_9").unwrap());
        assert_eq!(db.persona_ids().unwrap().len(), 1);
    }
}
