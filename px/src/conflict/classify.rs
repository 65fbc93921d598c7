//! Three-way severity classification for a single file

use std::ops::Range;

use serde::{Deserialize, Serialize};
use similar::{DiffTag, TextDiff};

/// How hard an overlap is to resolve, ordered from harmless to blocking
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    /// Both sides made the same change
    #[default]
    None,
    /// Changes touch disjoint line ranges; git will merge them
    AutoResolvable,
    /// Overlapping ranges, add/add with different content, or modify/delete
    Manual,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::AutoResolvable => write!(f, "auto-resolvable"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Classify one path given its content at the merge-base and on each side
///
/// `None` means the file does not exist at that revision.
pub fn classify(base: Option<&str>, ours: Option<&str>, theirs: Option<&str>) -> Severity {
    if ours == theirs {
        return Severity::None;
    }
    if ours == base || theirs == base {
        // Only one side really changed the file
        return Severity::AutoResolvable;
    }
    match (base, ours, theirs) {
        (Some(base), Some(ours), Some(theirs)) => {
            let a = changed_ranges(base, ours);
            let b = changed_ranges(base, theirs);
            if a.iter().any(|x| b.iter().any(|y| ranges_overlap(x, y))) {
                Severity::Manual
            } else {
                Severity::AutoResolvable
            }
        }
        // add/add with different content, or modify/delete
        _ => Severity::Manual,
    }
}

/// Base line ranges a side replaced, deleted or inserted at
fn changed_ranges(base: &str, side: &str) -> Vec<Range<usize>> {
    TextDiff::from_lines(base, side)
        .ops()
        .iter()
        .filter(|op| op.tag() != DiffTag::Equal)
        .map(|op| op.old_range())
        .collect()
}

/// Git refuses to auto-merge hunks that touch or abut, so an insertion point
/// counts as overlapping the lines on either side of it
fn ranges_overlap(a: &Range<usize>, b: &Range<usize>) -> bool {
    let widen = |r: &Range<usize>| {
        if r.is_empty() {
            r.start.saturating_sub(1)..r.start + 1
        } else {
            r.clone()
        }
    };
    let (a, b) = (widen(a), widen(b));
    (a.start < b.end && b.start < a.end) || a.end == b.start || b.end == a.start
}
