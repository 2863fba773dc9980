//! Free-form name normalization for lifecycle commands.
//!
//! Runs before anything reaches the routing resolver; mention routing itself
//! only ever matches names exactly.

use crate::types::AgentName;

/// Resolves `input` against `candidates`: exact match, then a unique prefix
/// match, then the single closest name by edit distance. Ties and distances
/// above the bound resolve to `None`.
pub fn resolve_name(input: &str, candidates: &[AgentName]) -> Option<AgentName> {
    let needle = AgentName::new(input.trim_start_matches('@'));
    if needle.is_empty() {
        return None;
    }

    if let Some(exact) = candidates.iter().find(|c| **c == needle) {
        return Some(exact.clone());
    }

    let mut prefixed = candidates
        .iter()
        .filter(|c| c.as_str().starts_with(needle.as_str()));
    if let (Some(only), None) = (prefixed.next(), prefixed.next()) {
        return Some(only.clone());
    }

    let bound = max_distance(needle.as_str());
    let mut best: Option<(&AgentName, usize)> = None;
    let mut tied = false;
    for candidate in candidates {
        let distance = levenshtein(needle.as_str(), candidate.as_str());
        if distance > bound {
            continue;
        }
        match best {
            Some((_, current)) if distance == current => tied = true,
            Some((_, current)) if distance > current => {}
            _ => {
                best = Some((candidate, distance));
                tied = false;
            }
        }
    }

    if tied {
        tracing::debug!(target = "router::registry", input = %needle, "ambiguous agent name");
        return None;
    }
    best.map(|(name, _)| name.clone())
}

fn max_distance(needle: &str) -> usize {
    (needle.chars().count() / 3).max(2)
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b_chars.len()).collect();

    for (i, ca) in a.chars().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let above = row[j + 1];
            let cost = usize::from(ca != *cb);
            row[j + 1] = (above + 1).min(row[j] + 1).min(diagonal + cost);
            diagonal = above;
        }
    }

    row[b_chars.len()]
}
