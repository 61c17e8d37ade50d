//! Filename and extension heuristics used before any worker call.
//!
//! These give specialists a deterministic opinion to fall back on when
//! reasoning is unavailable, and a prior to compare worker results against.

use serde::{Deserialize, Serialize};

use crate::core::types::{DocumentCategory, ExtractionMethod};

/// Broad file family, decided by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatFamily {
    Image,
    Pdf,
    WordProcessor,
    Text,
    Other,
}

pub fn format_family(extension: &str) -> FormatFamily {
    match extension.trim_start_matches('.').to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" | "png" | "bmp" | "tiff" | "tif" | "gif" => FormatFamily::Image,
        "pdf" => FormatFamily::Pdf,
        "docx" | "doc" => FormatFamily::WordProcessor,
        "txt" | "csv" | "json" | "md" => FormatFamily::Text,
        _ => FormatFamily::Other,
    }
}

/// Extraction methods to try for a file, in priority order.
///
/// Images need OCR, preferring the remote service when one is configured.
/// PDFs try their text layer first and fall back to OCR.
pub fn extraction_methods(family: FormatFamily, remote_ocr: bool) -> Vec<ExtractionMethod> {
    let mut ocr = Vec::new();
    if remote_ocr {
        ocr.push(ExtractionMethod::OcrRemote);
    }
    ocr.push(ExtractionMethod::OcrLocal);

    match family {
        FormatFamily::Image => ocr,
        FormatFamily::Pdf => {
            let mut methods = vec![ExtractionMethod::DirectText];
            methods.extend(ocr);
            methods
        }
        FormatFamily::WordProcessor | FormatFamily::Text | FormatFamily::Other => {
            vec![ExtractionMethod::DirectText]
        }
    }
}

/// A filename-derived guess at what a document is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryHint {
    pub document_type: String,
    pub category: DocumentCategory,
    pub confidence: f64,
}

impl CategoryHint {
    pub fn unknown() -> Self {
        Self {
            document_type: "unknown".to_string(),
            category: DocumentCategory::Unknown,
            confidence: 0.0,
        }
    }
}

const KEYWORDS: &[(&[&str], &str, DocumentCategory)] = &[
    (&["passport"], "Passport", DocumentCategory::IdentityProof),
    (
        &["license", "licence", "driving", "dl"],
        "Driving License",
        DocumentCategory::IdentityProof,
    ),
    (
        &["aadhar", "aadhaar", "national"],
        "Aadhar",
        DocumentCategory::IdentityProof,
    ),
    (&["pan"], "PAN Card", DocumentCategory::IdentityProof),
    (&["voter"], "Voter ID", DocumentCategory::IdentityProof),
    (
        &["utility", "electricity", "water", "gas"],
        "Utility Bill",
        DocumentCategory::AddressProof,
    ),
    (&["lease", "rental"], "Lease Agreement", DocumentCategory::AddressProof),
    (
        &["bank", "statement"],
        "Bank Statement",
        DocumentCategory::FinancialDocument,
    ),
    (
        &["tax", "salary", "payslip", "itr"],
        "Tax Return",
        DocumentCategory::FinancialDocument,
    ),
];

/// Guess the document type from its filename tokens.
///
/// Tokens are split on any non-alphanumeric character so `pan` matches
/// `pan_card.jpg` but not `company.pdf`.
pub fn hint_from_filename(file_name: &str) -> CategoryHint {
    let stem = file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(file_name)
        .to_ascii_lowercase();
    let tokens: Vec<&str> = stem
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    KEYWORDS
        .iter()
        .find(|(keys, _, _)| keys.iter().any(|k| tokens.contains(k)))
        .map(|(_, document_type, category)| CategoryHint {
            document_type: (*document_type).to_string(),
            category: *category,
            confidence: 0.6,
        })
        .unwrap_or_else(CategoryHint::unknown)
}

/// Flag suspicious traits of an incoming file. Flags are advisory only.
pub fn filename_anomalies(file_name: &str, size_bytes: u64) -> Vec<String> {
    let mut anomalies = Vec::new();
    let parts: Vec<&str> = file_name.split('.').collect();
    if parts.len() > 2 {
        anomalies.push(format!("multiple extensions in '{file_name}'"));
    }
    if parts.first().is_some_and(|stem| stem.is_empty()) {
        anomalies.push("hidden or nameless file".to_string());
    }
    if size_bytes == 0 {
        anomalies.push("file is empty".to_string());
    }
    if file_name.chars().any(char::is_control) {
        anomalies.push("control characters in filename".to_string());
    }
    anomalies
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_by_extension() {
        assert_eq!(format_family(".JPG"), FormatFamily::Image);
        assert_eq!(format_family("pdf"), FormatFamily::Pdf);
        assert_eq!(format_family(".docx"), FormatFamily::WordProcessor);
        assert_eq!(format_family(".txt"), FormatFamily::Text);
        assert_eq!(format_family(".exe"), FormatFamily::Other);
    }

    #[test]
    fn images_prefer_remote_ocr_when_configured() {
        assert_eq!(
            extraction_methods(FormatFamily::Image, true),
            vec![ExtractionMethod::OcrRemote, ExtractionMethod::OcrLocal]
        );
        assert_eq!(
            extraction_methods(FormatFamily::Image, false),
            vec![ExtractionMethod::OcrLocal]
        );
        assert_eq!(
            extraction_methods(FormatFamily::Text, true),
            vec![ExtractionMethod::DirectText]
        );
        assert_eq!(
            extraction_methods(FormatFamily::Pdf, false)[0],
            ExtractionMethod::DirectText
        );
    }

    #[test]
    fn hint_matches_whole_tokens() {
        let hint = hint_from_filename("passport_sample.txt");
        assert_eq!(hint.document_type, "Passport");
        assert_eq!(hint.category, DocumentCategory::IdentityProof);

        assert_eq!(
            hint_from_filename("pan_card.jpg").document_type,
            "PAN Card"
        );
        assert_eq!(
            hint_from_filename("company.pdf").category,
            DocumentCategory::Unknown
        );
        assert_eq!(
            hint_from_filename("March-Bank-Statement.pdf").category,
            DocumentCategory::FinancialDocument
        );
    }

    #[test]
    fn anomalies_flag_double_extension_and_empty() {
        let flags = filename_anomalies("invoice.pdf.exe", 0);
        assert_eq!(flags.len(), 2);
        assert!(filename_anomalies("passport.jpg", 1024).is_empty());
    }
}
