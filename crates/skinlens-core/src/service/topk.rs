//! Class selection over a probability vector.

/// Clamp a requested `k` into `1..=num_classes`.
pub fn clamp_k(k: i64, num_classes: usize) -> usize {
    if num_classes == 0 {
        return 0;
    }
    usize::try_from(k.max(1)).map_or(num_classes, |k| k.min(num_classes))
}

/// Highest probability and its index; the lowest index wins ties.
pub fn argmax(probabilities: &[f32]) -> Option<(usize, f32)> {
    let (&first, rest) = probabilities.split_first()?;
    let mut best = (0, first);
    for (offset, &p) in rest.iter().enumerate() {
        if p > best.1 {
            best = (offset + 1, p);
        }
    }
    Some(best)
}

/// The `clamp_k(k, len)` most probable `(index, probability)` pairs in
/// descending order.
///
/// Partial selection sort: pass `i` scans the unselected tail for the maximum
/// and swaps it into slot `i`.  Only a strictly greater value replaces the
/// running maximum, so among equal values the one met first in the pass wins.
pub fn select_top_k(probabilities: &[f32], k: i64) -> Vec<(usize, f32)> {
    let k = clamp_k(k, probabilities.len());
    let mut candidates: Vec<(usize, f32)> = probabilities.iter().copied().enumerate().collect();

    for i in 0..k {
        let mut max = i;
        for j in (i + 1)..candidates.len() {
            if candidates[j].1 > candidates[max].1 {
                max = j;
            }
        }
        candidates.swap(i, max);
    }

    candidates.truncate(k);
    candidates
}
