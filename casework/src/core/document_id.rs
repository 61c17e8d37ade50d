//! Case references and deterministic document ids.
//!
//! Document ids have the form `<CASE>_DOC_<seq>.<ext>` where `seq` is a
//! three-digit, one-based counter scoped to the case.

use std::sync::LazyLock;

use regex::Regex;

static DOCUMENT_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Z0-9_-]+)_DOC_(\d{3,})((?:\.[a-z0-9]+)?)$")
        .expect("document id regex should be valid")
});

static DOCUMENT_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z0-9_-]+)_(?i:doc)_(\d{3,})((?:\.[A-Za-z0-9]+)?)")
        .expect("document reference regex should be valid")
});

/// A document id split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentId {
    pub case_reference: String,
    pub seq: u32,
    /// Lowercase extension including the leading dot, or empty.
    pub extension: String,
}

impl DocumentId {
    pub fn render(&self) -> String {
        format_document_id(&self.case_reference, self.seq, &self.extension)
    }
}

/// Normalize a user-supplied case reference.
///
/// Trims, uppercases, and turns inner whitespace into `_`. Hyphens are kept so
/// references such as `KYC-2026-001` survive unchanged.
pub fn normalize_case_reference(raw: &str) -> Result<String, String> {
    let normalized: String = raw
        .trim()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_ascii_uppercase();
    if normalized.is_empty() {
        return Err("case reference must not be empty".to_string());
    }
    if let Some(bad) = normalized
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(format!(
            "case reference '{}' contains invalid character '{}'",
            raw.trim(),
            bad
        ));
    }
    Ok(normalized)
}

/// Normalize a file extension to `.ext` lowercase form (empty stays empty).
pub fn normalize_extension(ext: &str) -> String {
    let trimmed = ext.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(".{}", trimmed.to_ascii_lowercase())
    }
}

pub fn format_document_id(case_reference: &str, seq: u32, extension: &str) -> String {
    format!(
        "{}_DOC_{:03}{}",
        case_reference,
        seq,
        normalize_extension(extension)
    )
}

pub fn parse_document_id(raw: &str) -> Option<DocumentId> {
    let caps = DOCUMENT_ID_RE.captures(raw.trim())?;
    Some(DocumentId {
        case_reference: caps.get(1)?.as_str().to_string(),
        seq: caps.get(2)?.as_str().parse().ok()?,
        extension: caps.get(3).map(|m| m.as_str().to_string()).unwrap_or_default(),
    })
}

/// Next sequence number for a case given the ids it already holds.
///
/// Uses the maximum existing sequence rather than a count, so ids stay unique
/// even if a record was removed by hand.
pub fn next_sequence<'a, I>(case_reference: &str, existing: I) -> u32
where
    I: IntoIterator<Item = &'a str>,
{
    existing
        .into_iter()
        .filter_map(parse_document_id)
        .filter(|id| id.case_reference == case_reference)
        .map(|id| id.seq)
        .max()
        .unwrap_or(0)
        + 1
}

/// Find document id references in free text, in order of appearance.
///
/// References come back in stored form: uppercase case part, lowercase
/// extension, digits as written.
pub fn find_document_refs(text: &str) -> Vec<String> {
    let mut refs: Vec<String> = Vec::new();
    for caps in DOCUMENT_REF_RE.captures_iter(text) {
        let case = caps.get(1).map_or("", |m| m.as_str()).to_ascii_uppercase();
        let digits = caps.get(2).map_or("", |m| m.as_str());
        let extension = normalize_extension(caps.get(3).map_or("", |m| m.as_str()));
        let candidate = format!("{case}_DOC_{digits}{extension}");
        if !refs.contains(&candidate) {
            refs.push(candidate);
        }
    }
    refs
}
