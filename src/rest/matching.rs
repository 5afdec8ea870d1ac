//! Name similarity used to pair path parameters with response fields.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchThresholds {
    /// At or above: accepted outright.
    pub accept: f64,
    /// Below: rejected outright. In between, only the suffix heuristic
    /// accepts.
    pub reject: f64,
}

impl Default for MatchThresholds {
    fn default() -> Self {
        Self {
            accept: 0.9,
            reject: 0.5,
        }
    }
}

/// Lowercase a name and drop camelCase, `_`, `-`, `.` and space boundaries.
pub fn normalize_name(name: &str) -> String {
    tokenize(name).concat()
}

fn tokenize(name: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for ch in name.chars() {
        if !ch.is_alphanumeric() {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if ch.is_uppercase() && prev_lower && !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
        prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        current.extend(ch.to_lowercase());
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Singular form of a collection segment (`items` -> `item`).
fn singular(resource: &str) -> String {
    let normalized = normalize_name(resource);
    if let Some(stem) = normalized.strip_suffix("ies") {
        return format!("{stem}y");
    }
    match normalized.strip_suffix('s') {
        Some(stem) if !stem.ends_with('s') && !stem.is_empty() => stem.to_string(),
        _ => normalized,
    }
}

/// Score a parameter against one response field (its last segment).
///
/// `resource` is the literal path segment right before the parameter; a
/// field that spells out `resource + field` (`items`/`id` for `itemId`) is an
/// exact match.
pub fn score_field(
    param: &str,
    field: &str,
    resource: Option<&str>,
    thresholds: &MatchThresholds,
) -> Option<f64> {
    let leaf = field.rsplit('.').next().unwrap_or(field);
    let param_norm = normalize_name(param);
    let leaf_norm = normalize_name(leaf);
    if param_norm.is_empty() || leaf_norm.is_empty() {
        return None;
    }
    if let Some(resource) = resource {
        if format!("{}{}", singular(resource), leaf_norm) == param_norm {
            return Some(1.0);
        }
    }
    let score = strsim::normalized_levenshtein(&param_norm, &leaf_norm);
    if score >= thresholds.accept {
        return Some(score);
    }
    if score < thresholds.reject {
        return None;
    }
    // ambiguous band
    let suffix = leaf_norm.len() >= 2 && param_norm.ends_with(&leaf_norm);
    suffix.then_some(score)
}

/// Best-scoring field for `param`, preferring shallower fields on ties.
pub fn best_field<'a>(
    param: &str,
    fields: &'a [String],
    resource: Option<&str>,
    thresholds: &MatchThresholds,
) -> Option<&'a str> {
    let mut best: Option<(&str, f64, usize)> = None;
    for field in fields {
        let Some(score) = score_field(param, field, resource, thresholds) else {
            continue;
        };
        let depth = field.matches('.').count();
        let better = match best {
            None => true,
            Some((_, best_score, best_depth)) => {
                score > best_score || (score == best_score && depth < best_depth)
            }
        };
        if better {
            best = Some((field.as_str(), score, depth));
        }
    }
    best.map(|(field, _, _)| field)
}
