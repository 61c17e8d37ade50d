//! Heuristic quality score for extracted text.

/// Score extracted text in `[0, 1]`.
///
/// Starts at 1.0 and applies multiplicative penalties:
/// - fewer than 10 characters: x0.3
/// - alphabetic ratio below 0.3: x0.5
/// - non-alphanumeric, non-space ratio above 0.3: x0.6
///
/// Blank text scores 0.
pub fn text_quality_score(text: &str) -> f64 {
    if text.trim().is_empty() {
        return 0.0;
    }

    let total = text.chars().count() as f64;
    let mut score = 1.0_f64;

    if total < 10.0 {
        score *= 0.3;
    }

    let alpha = text.chars().filter(|c| c.is_alphabetic()).count() as f64;
    if alpha / total < 0.3 {
        score *= 0.5;
    }

    let special = text
        .chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
        .count() as f64;
    if special / total > 0.3 {
        score *= 0.6;
    }

    score.min(1.0)
}

/// Whether a score falls below the configured low-quality threshold.
pub fn is_low_quality(score: f64, threshold: f64) -> bool {
    score < threshold
}
