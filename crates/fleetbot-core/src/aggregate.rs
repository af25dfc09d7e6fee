//! Reductions over fan-out results.

use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::fmt::Display;

pub fn count_matching<T: PartialEq>(results: &[T], target: &T) -> usize {
    results.iter().filter(|r| *r == target).count()
}

/// Occurrences per distinct label, highest first, at most `k` entries. Ties
/// keep the order in which labels were first seen.
pub fn rank_by_frequency<I, S>(labels: I, k: usize) -> Vec<(String, usize)>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut counts: Vec<(String, usize)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for label in labels {
        let label = label.into();
        match index.get(&label) {
            Some(&slot) => counts[slot].1 += 1,
            None => {
                index.insert(label.clone(), counts.len());
                counts.push((label, 1));
            }
        }
    }
    // sort_by is stable, so equal counts stay in first-seen order
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts.truncate(k);
    counts
}

/// Number of distinct labels.
pub fn distinct_count<I, S>(labels: I) -> usize
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = std::collections::HashSet::new();
    for label in labels {
        seen.insert(label.into());
    }
    seen.len()
}

/// Keep entries strictly older than `cutoff`, ordered by name.
pub fn threshold_filter(
    items: Vec<(String, NaiveDateTime)>,
    cutoff: NaiveDateTime,
) -> Vec<(String, NaiveDateTime)> {
    let mut kept: Vec<_> = items.into_iter().filter(|(_, ts)| *ts < cutoff).collect();
    kept.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
    kept
}

pub fn render_threshold_lines(items: &[(String, NaiveDateTime)]) -> Vec<String> {
    items
        .iter()
        .map(|(name, ts)| format!("`{}`: {}", name, ts.format("%Y-%m-%d %H:%M:%S")))
        .collect()
}

/// One line per item, no reduction.
pub fn passthrough<T: Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}
