//! Identity partition of live against baseline collections.
//!
//! Collections are compared as multisets: two live objects with the same
//! identity match at most two baseline objects, and any surplus is
//! live-only.

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct Partition<T> {
    pub in_both: Vec<T>,
    /// Present live but not in the baseline, to delete
    pub live_only: Vec<T>,
    /// Present in the baseline but not live, to report
    pub baseline_only: Vec<T>,
}

fn counts<T, K: Ord>(items: &[T], key: &impl Fn(&T) -> K) -> BTreeMap<K, usize> {
    let mut counts = BTreeMap::new();
    for item in items {
        *counts.entry(key(item)).or_insert(0) += 1;
    }
    counts
}

/// Partition `live` and `baseline` by the identity `key`
pub fn partition<T: Clone, K: Ord>(live: &[T], baseline: &[T], key: impl Fn(&T) -> K) -> Partition<T> {
    let mut unmatched_baseline = counts(baseline, &key);
    let mut unmatched_live = counts(live, &key);

    let mut in_both = Vec::new();
    let mut live_only = Vec::new();
    for item in live {
        match unmatched_baseline.get_mut(&key(item)) {
            Some(count) if *count > 0 => {
                *count -= 1;
                in_both.push(item.clone());
            }
            _ => live_only.push(item.clone()),
        }
    }

    let mut baseline_only = Vec::new();
    for item in baseline {
        match unmatched_live.get_mut(&key(item)) {
            Some(count) if *count > 0 => *count -= 1,
            _ => baseline_only.push(item.clone()),
        }
    }

    Partition { in_both, live_only, baseline_only }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disjoint_and_shared() {
        let live = ["a", "b", "x"];
        let baseline = ["a", "b", "c"];
        let result = partition(&live, &baseline, |s| s.to_string());
        assert_eq!(result.in_both, vec!["a", "b"]);
        assert_eq!(result.live_only, vec!["x"]);
        assert_eq!(result.baseline_only, vec!["c"]);
    }

    #[test]
    fn test_duplicates_counted() {
        let live = [("dup", 0), ("dup", 1), ("dup", 2)];
        let baseline = [("dup", 9)];
        let result = partition(&live, &baseline, |item| item.0);
        assert_eq!(result.in_both, vec![("dup", 0)]);
        assert_eq!(result.live_only, vec![("dup", 1), ("dup", 2)]);
        assert!(result.baseline_only.is_empty());

        let result = partition(&baseline, &live, |item| item.0);
        assert!(result.live_only.is_empty());
        assert_eq!(result.baseline_only, vec![("dup", 1), ("dup", 2)]);
    }

    #[test]
    fn test_empty_inputs() {
        let result = partition::<&str, &str>(&[], &["a"], |s| *s);
        assert!(result.in_both.is_empty());
        assert_eq!(result.baseline_only, vec!["a"]);
    }
}
