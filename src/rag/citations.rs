//! Citation marker parsing and quote grounding.

use regex::Regex;

/// A `[n]` marker found in model output, with the answer text it annotates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Marker {
    pub index: usize,
    /// The sentence (or line) the marker closes, markers stripped.
    pub claim: String,
}

/// Extract citation markers and the claims they annotate, in order of first
/// appearance. Duplicate indices keep their first claim.
pub fn parse_markers(answer: &str) -> Vec<Marker> {
    let marker = Regex::new(r"\[(\d+)\]").expect("static regex");
    let mut seen = Vec::new();
    let mut out = Vec::new();
    for line in answer.lines() {
        for captures in marker.captures_iter(line) {
            let Ok(index) = captures[1].parse::<usize>() else {
                continue;
            };
            if seen.contains(&index) {
                continue;
            }
            seen.push(index);
            let claim = marker.replace_all(line, "").trim().to_string();
            out.push(Marker { index, claim });
        }
    }
    out
}

/// Longest common substring (byte-wise) between `claim` and `text`, returned
/// as `(start_in_text, length)`. Boundaries are clamped inward to `char`
/// boundaries so the result is always a valid slice of `text`.
pub fn longest_common_substring(claim: &str, text: &str) -> Option<(usize, usize)> {
    if claim.is_empty() || text.is_empty() {
        return None;
    }
    let a = claim.as_bytes();
    let b = text.as_bytes();
    let mut prev = vec![0usize; b.len() + 1];
    let mut best_len = 0usize;
    let mut best_end_in_b = 0usize;

    for &byte_a in a {
        let mut current = vec![0usize; b.len() + 1];
        for (j, &byte_b) in b.iter().enumerate() {
            if byte_a == byte_b {
                let run = prev[j] + 1;
                current[j + 1] = run;
                if run > best_len {
                    best_len = run;
                    best_end_in_b = j + 1;
                }
            }
        }
        prev = current;
    }

    if best_len == 0 {
        return None;
    }
    let mut start = best_end_in_b - best_len;
    let mut end = best_end_in_b;
    while start < end && !text.is_char_boundary(start) {
        start += 1;
    }
    while end > start && !text.is_char_boundary(end) {
        end -= 1;
    }
    (end > start).then_some((start, end - start))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_parse_in_order_with_claims() {
        let markers = parse_markers("Solar output doubled. [1]\nCosts fell by half. [2]");
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].index, 1);
        assert_eq!(markers[0].claim, "Solar output doubled.");
        assert_eq!(markers[1].index, 2);
    }

    #[test]
    fn duplicate_markers_collapse_to_first_claim() {
        let markers = parse_markers("First claim [1]. Restated claim [1].");
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].claim, "First claim . Restated claim .");
    }

    #[test]
    fn exact_quotes_are_found_verbatim() {
        let chunk = "Before. Solar output doubled in 2024. After.";
        let (start, len) =
            longest_common_substring("Solar output doubled in 2024.", chunk).unwrap();
        assert_eq!(&chunk[start..start + len], "Solar output doubled in 2024.");
    }

    #[test]
    fn paraphrase_still_anchors_on_the_shared_span() {
        let chunk = "The company reported that solar output doubled in 2024 overall.";
        let (start, len) =
            longest_common_substring("solar output doubled in 2024, analysts said", chunk)
                .unwrap();
        let quote = &chunk[start..start + len];
        assert!(quote.contains("solar output doubled in 2024"));
    }

    #[test]
    fn disjoint_text_yields_no_anchor_of_substance() {
        let found = longest_common_substring("zzzz", "aaaa");
        assert!(found.is_none());
    }

    #[test]
    fn multibyte_boundaries_are_respected() {
        let chunk = "prefix — héllo wörld — suffix";
        let result = longest_common_substring("héllo wörld", chunk);
        let (start, len) = result.unwrap();
        assert_eq!(&chunk[start..start + len], "héllo wörld");
    }
}
