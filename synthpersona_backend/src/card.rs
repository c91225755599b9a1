use anyhow::{Context, Result};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

pub const MAX_TITLE_CHARS: usize = 160;
const MAX_SLUG_CHARS: usize = 60;

/// Header block of a persona card
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardHeader {
    #[serde(default)]
    pub persona_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardFormat {
    /// `---` delimited YAML header, body is the profile
    FrontMatter,
    /// id from `*_p_<hex>.md`, title from the first line, whole text is the profile
    LegacyFilename,
}

/// Unified card representation
#[derive(Debug, Clone)]
pub struct ParsedCard {
    pub header: CardHeader,
    pub profile: String,
    pub format: CardFormat,
}

#[derive(Debug, Error)]
pub enum CardParseError {
    #[error("failed to read card {path:?}: {reason}")]
    Read { path: PathBuf, reason: String },
    #[error("front matter is not closed by a `---` line")]
    UnterminatedFrontMatter,
    #[error("front matter is not valid YAML: {0}")]
    Header(String),
    #[error("card header has no {0}")]
    MissingField(&'static str),
    #[error("invalid persona_id {0:?}")]
    InvalidPersonaId(String),
    #[error("no front matter and file name carries no `_p_<hex>` persona id")]
    NoIdInFilename,
    #[error("card has no title line")]
    NoTitle,
    #[error("card has no profile text")]
    EmptyProfile,
}

fn legacy_id_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?:^|_)(p_[0-9a-f]{8,})$").ok())
        .as_ref()
}

/// Ids must be usable as file name components and SQL keys
pub fn is_valid_persona_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Title from the first markdown heading, only if it is the first non-empty line
pub fn heading_title(text: &str) -> Option<String> {
    let first = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    if !first.starts_with('#') {
        return None;
    }
    let title = clean_title(first);
    (!title.is_empty()).then_some(title)
}

/// Title from the first non-empty line, heading markers stripped
pub fn infer_title(text: &str) -> Option<String> {
    let first = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    let title = clean_title(first);
    (!title.is_empty()).then_some(title)
}

fn clean_title(line: &str) -> String {
    let stripped = line.trim_start_matches('#').trim().trim_matches('*').trim();
    stripped.chars().take(MAX_TITLE_CHARS).collect()
}

/// File-name safe slug. Keeps letters of any script.
pub fn slugify(text: &str) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for c in text.chars() {
        if c.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
        if slug.chars().count() >= MAX_SLUG_CHARS {
            break;
        }
    }
    if slug.is_empty() {
        "persona".to_string()
    } else {
        slug
    }
}

/// `<slug(title)>_<persona_id>.md`
pub fn card_file_name(title: &str, persona_id: &str) -> String {
    format!("{}_{}.md", slugify(title), persona_id)
}

fn split_front_matter(text: &str) -> Result<Option<(&str, &str)>, CardParseError> {
    let Some(rest) = text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))
    else {
        return Ok(None);
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let header = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Ok(Some((header, body)));
        }
        offset += line.len();
    }
    Err(CardParseError::UnterminatedFrontMatter)
}

/// Parse card text. `file_name` is only consulted for the legacy format.
pub fn parse_card_text(file_name: &str, text: &str) -> Result<ParsedCard, CardParseError> {
    let text = text.trim_start_matches('\u{feff}');

    if let Some((raw_header, body)) = split_front_matter(text)? {
        let header: CardHeader =
            serde_yaml::from_str(raw_header).map_err(|e| CardParseError::Header(e.to_string()))?;
        let header = CardHeader {
            persona_id: header.persona_id.trim().to_string(),
            title: header.title.trim().to_string(),
            ..header
        };
        if header.persona_id.is_empty() {
            return Err(CardParseError::MissingField("persona_id"));
        }
        if !is_valid_persona_id(&header.persona_id) {
            return Err(CardParseError::InvalidPersonaId(header.persona_id));
        }
        if header.title.is_empty() {
            return Err(CardParseError::MissingField("title"));
        }
        let profile = body.trim().to_string();
        if profile.is_empty() {
            return Err(CardParseError::EmptyProfile);
        }
        return Ok(ParsedCard {
            header,
            profile,
            format: CardFormat::FrontMatter,
        });
    }

    let stem = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let persona_id = legacy_id_pattern()
        .and_then(|re| re.captures(&stem))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or(CardParseError::NoIdInFilename)?;

    let profile = text.trim().to_string();
    if profile.is_empty() {
        return Err(CardParseError::EmptyProfile);
    }
    let title = infer_title(&profile).ok_or(CardParseError::NoTitle)?;

    Ok(ParsedCard {
        header: CardHeader {
            persona_id,
            title,
            batch: None,
            source: None,
            generated_at: None,
        },
        profile,
        format: CardFormat::LegacyFilename,
    })
}

/// Parse a card file
pub fn parse_card(path: &Path) -> Result<ParsedCard, CardParseError> {
    let text = fs::read_to_string(path).map_err(|e| CardParseError::Read {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    parse_card_text(&file_name, &text)
}

/// Front matter card text accepted by [`parse_card_text`]
pub fn render_card(header: &CardHeader, profile: &str) -> Result<String> {
    let yaml = serde_yaml::to_string(header).context("Failed to serialize card header")?;
    Ok(format!("---\n{}---\n\n{}\n", yaml, profile.trim()))
}
