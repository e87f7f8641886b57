//! Sequential pattern mining via PrefixSpan.
//!
//! Operates on tool-id sequences, one per session. Support counts a
//! sequence at most once per pattern regardless of how many embeddings it
//! holds. Exploration is sorted at every level so the emitted pattern set
//! and its order are deterministic for a fixed input.

use std::collections::BTreeMap;

/// Mine all patterns with absolute support >= `min_count` and length in
/// `[2, max_len]`, in depth-first lexicographic order.
pub fn mine_patterns(
    sequences: &[Vec<String>],
    min_count: usize,
    max_len: usize,
) -> Vec<Vec<String>> {
    let mut out = Vec::new();
    if sequences.is_empty() || min_count == 0 || max_len < 2 {
        return out;
    }
    // A projection is (sequence index, suffix start offset).
    let projections: Vec<(usize, usize)> = (0..sequences.len()).map(|i| (i, 0)).collect();
    let mut prefix = Vec::new();
    span(sequences, &projections, &mut prefix, min_count, max_len, &mut out);
    out
}

fn span(
    sequences: &[Vec<String>],
    projections: &[(usize, usize)],
    prefix: &mut Vec<String>,
    min_count: usize,
    max_len: usize,
    out: &mut Vec<Vec<String>>,
) {
    if prefix.len() >= max_len {
        return;
    }

    // Count each extension item once per projected sequence.
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for &(seq_idx, start) in projections {
        let mut seen: Vec<&str> = Vec::new();
        for item in &sequences[seq_idx][start..] {
            if !seen.contains(&item.as_str()) {
                seen.push(item);
                *counts.entry(item).or_insert(0) += 1;
            }
        }
    }

    let frequent: Vec<String> = counts
        .into_iter()
        .filter(|(_, c)| *c >= min_count)
        .map(|(item, _)| item.to_string())
        .collect();

    for item in frequent {
        // Project each sequence past its first occurrence of `item`.
        let projected: Vec<(usize, usize)> = projections
            .iter()
            .filter_map(|&(seq_idx, start)| {
                sequences[seq_idx][start..]
                    .iter()
                    .position(|x| *x == item)
                    .map(|offset| (seq_idx, start + offset + 1))
            })
            .collect();

        prefix.push(item);
        if prefix.len() >= 2 {
            out.push(prefix.clone());
        }
        span(sequences, &projected, prefix, min_count, max_len, out);
        prefix.pop();
    }
}

/// True when `needle` is a (not necessarily contiguous) subsequence of `hay`.
pub fn is_subsequence(needle: &[String], hay: &[String]) -> bool {
    let mut it = hay.iter();
    needle.iter().all(|n| it.any(|h| h == n))
}

/// Leftmost embedding of `needle` in `hay` as indices, if any.
pub fn leftmost_embedding(needle: &[String], hay: &[String]) -> Option<Vec<usize>> {
    let mut indices = Vec::with_capacity(needle.len());
    let mut from = 0;
    for n in needle {
        let pos = hay[from..].iter().position(|h| h == n)? + from;
        indices.push(pos);
        from = pos + 1;
    }
    Some(indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seqs(raw: &[&[&str]]) -> Vec<Vec<String>> {
        raw.iter()
            .map(|s| s.iter().map(|t| t.to_string()).collect())
            .collect()
    }

    #[test]
    fn mines_shared_subsequences() {
        let sequences = seqs(&[
            &["search", "read", "summarize"],
            &["search", "read", "summarize"],
            &["search", "other", "read", "summarize"],
        ]);
        let patterns = mine_patterns(&sequences, 3, 3);
        assert!(patterns.contains(&vec![
            "search".to_string(),
            "read".to_string(),
            "summarize".to_string()
        ]));
        // Sub-patterns are emitted too; dedup happens downstream.
        assert!(patterns.contains(&vec!["search".to_string(), "read".to_string()]));
    }

    #[test]
    fn respects_min_count() {
        let sequences = seqs(&[&["a", "b"], &["a", "c"], &["a", "b"]]);
        let patterns = mine_patterns(&sequences, 2, 4);
        assert!(patterns.contains(&vec!["a".to_string(), "b".to_string()]));
        assert!(!patterns.contains(&vec!["a".to_string(), "c".to_string()]));
    }

    #[test]
    fn respects_max_len() {
        let sequences = seqs(&[&["a", "b", "c", "d"], &["a", "b", "c", "d"]]);
        let patterns = mine_patterns(&sequences, 2, 3);
        assert!(patterns.iter().all(|p| p.len() <= 3));
    }

    #[test]
    fn counts_each_sequence_once() {
        // `b` occurs twice in one sequence; support is still 1 per sequence.
        let sequences = seqs(&[&["a", "b", "b"], &["a", "b"]]);
        let patterns = mine_patterns(&sequences, 2, 3);
        assert!(patterns.contains(&vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn deterministic_order() {
        let sequences = seqs(&[&["b", "a", "c"], &["b", "a", "c"]]);
        let first = mine_patterns(&sequences, 2, 3);
        let second = mine_patterns(&sequences, 2, 3);
        assert_eq!(first, second);
    }

    #[test]
    fn subsequence_check() {
        let hay = seqs(&[&["a", "x", "b", "y", "c"]]).remove(0);
        assert!(is_subsequence(&seqs(&[&["a", "b", "c"]]).remove(0), &hay));
        assert!(!is_subsequence(&seqs(&[&["b", "a"]]).remove(0), &hay));
        assert_eq!(
            leftmost_embedding(&seqs(&[&["a", "c"]]).remove(0), &hay),
            Some(vec![0, 4])
        );
    }
}
