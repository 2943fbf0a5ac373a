//! Stable merge of two sorted sequences.

use std::cmp::Ordering;

/// Merges two sequences that are already sorted under `cmp`.
///
/// The merge is stable: when `cmp` reports equality, the element from
/// `left` precedes the one from `right`.
pub fn merge_by<T, F>(left: Vec<T>, right: Vec<T>, mut cmp: F) -> Vec<T>
where
    F: FnMut(&T, &T) -> Ordering,
{
    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();

    loop {
        let take_right = match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => cmp(l, r) == Ordering::Greater,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (None, None) => break,
        };
        if take_right {
            if let Some(item) = right.next() {
                merged.push(item);
            }
        } else if let Some(item) = left.next() {
            merged.push(item);
        }
    }

    merged
}
