//! Confidence scores and fusion for inferred facts
//!
//! Every score is a fixed constant from a rule table, optionally adjusted by a
//! bounded bonus, and combined across evidence with Noisy-OR.

/// Score type shared by mappings and relationships.
pub type ConfidenceScore = f64;

/// A field typed as another document type.
pub const EMBEDDED: ConfidenceScore = 0.95;

/// A `$lookup`-style stage joining two mapped collections.
pub const LOOKUP: ConfidenceScore = 0.85;

/// Foreign-key named field corroborated by a filter on that field.
pub const REFERS_TO_STRONG: ConfidenceScore = 0.72;

/// Upper bound of the specificity bonus added to [`REFERS_TO_STRONG`].
pub const REFERS_TO_SPECIFICITY_BONUS: ConfidenceScore = 0.08;

/// Filter links two collections but the field name only loosely matches.
pub const REFERS_TO_WEAK_MIN: ConfidenceScore = 0.55;
pub const REFERS_TO_WEAK_MAX: ConfidenceScore = 0.65;

/// Strong name match without a corroborating operation.
pub const REFERS_TO_NAMING_ONLY: ConfidenceScore = 0.6;

/// Weak and naming-only references stay below a corroborated strong match,
/// however much evidence accumulates.
pub const REFERS_TO_WEAK_CEILING: ConfidenceScore = 0.69;

/// Sampled data stores the referencing field as an ObjectId.
pub const OBJECT_ID_BONUS: ConfidenceScore = 0.05;

/// Fused scores never claim certainty.
pub const MAX_FUSED_CONFIDENCE: ConfidenceScore = 0.99;

pub fn clamp(score: ConfidenceScore) -> ConfidenceScore {
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, 1.0)
}

/// Fuse multiple confidence scores using Noisy-OR
///
/// Noisy-OR assumes independent evidence sources and computes:
/// combined = 1 - PRODUCT(1 - c_i)
///
/// # Examples
///
/// ```
/// use colldex::confidence::fuse_confidence_noisy_or;
///
/// assert_eq!(fuse_confidence_noisy_or(&[0.9]), 0.9);
/// assert_eq!(fuse_confidence_noisy_or(&[0.5, 0.5]), 0.75);
/// ```
pub fn fuse_confidence_noisy_or(scores: &[ConfidenceScore]) -> ConfidenceScore {
    if scores.is_empty() {
        return 0.0;
    }
    let product: ConfidenceScore = scores.iter().map(|&c| 1.0 - clamp(c)).product();
    1.0 - product
}

/// Noisy-OR capped at [`MAX_FUSED_CONFIDENCE`], and never below the strongest
/// single contributor.
pub fn fuse_capped(scores: &[ConfidenceScore]) -> ConfidenceScore {
    let max = scores.iter().copied().map(clamp).fold(0.0, f64::max);
    if scores.len() < 2 {
        return max;
    }
    let fused = fuse_confidence_noisy_or(scores).min(MAX_FUSED_CONFIDENCE);
    clamp(fused.max(max))
}

/// Specificity of a foreign-key stem: longer stems are less likely to match
/// by accident. Maps stem length onto `[0, REFERS_TO_SPECIFICITY_BONUS]`.
pub fn specificity_bonus(stem: &str) -> ConfidenceScore {
    let len = stem.chars().count().min(12) as f64;
    if len <= 2.0 {
        return 0.0;
    }
    REFERS_TO_SPECIFICITY_BONUS * ((len - 2.0) / 10.0)
}
