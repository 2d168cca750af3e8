//! Fuzzy resolution of client-supplied names to known candidates
//!
//! Clients refer to personas by name ("einstein", "Albert"), rarely by exact
//! identifier. Scoring tiers, case-insensitive throughout:
//!
//! | Relation                     | Score                                   |
//! |------------------------------|-----------------------------------------|
//! | exact match                  | 100                                     |
//! | candidate starts with query  | 90                                      |
//! | candidate contains query     | 80                                      |
//! | otherwise                    | `(max_len - edit_distance) / max_len × 70` |
//!
//! Edit-distance scores never exceed 70, so a partial match can never beat a
//! substring match.

/// Score for a case-insensitive exact match
pub const EXACT_SCORE: f64 = 100.0;
/// Score when the candidate starts with the query
pub const PREFIX_SCORE: f64 = 90.0;
/// Score when the candidate contains the query
pub const SUBSTRING_SCORE: f64 = 80.0;
/// Upper bound of edit-distance similarity scores
pub const SIMILARITY_CEILING: f64 = 70.0;

/// A candidate that cleared the acceptance threshold
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match<'a, T> {
    /// The matched candidate
    pub candidate: &'a T,
    /// Its score in `0.0..=100.0`
    pub score: f64,
}

/// Outcome of resolving a name against a candidate list
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<'a, T> {
    /// A candidate scored at or above the threshold
    Found(Match<'a, T>),
    /// Nothing acceptable; every candidate is returned for disambiguation
    NotFound {
        /// The query as supplied
        query: String,
        /// All candidates, in input order
        candidates: Vec<&'a T>,
    },
}

/// Score `name` against `query`
///
/// Both sides are trimmed before comparison, so `" stein"` still scores as a
/// substring of `"Einstein"`. An empty (or all-whitespace) query scores 0
/// against every non-empty name instead of prefix-matching all of them.
#[must_use]
pub fn score(query: &str, name: &str) -> f64 {
    let query = query.trim().to_lowercase();
    let name = name.trim().to_lowercase();

    if query.is_empty() {
        return if name.is_empty() { EXACT_SCORE } else { 0.0 };
    }
    if name == query {
        return EXACT_SCORE;
    }
    if name.starts_with(&query) {
        return PREFIX_SCORE;
    }
    if name.contains(&query) {
        return SUBSTRING_SCORE;
    }

    let max_len = query.chars().count().max(name.chars().count());
    let distance = levenshtein(&query, &name);
    #[allow(clippy::cast_precision_loss)]
    let similarity = (max_len - distance) as f64 / max_len as f64;
    similarity * SIMILARITY_CEILING
}

/// Highest-scoring candidate at or above `min_score`
///
/// Ties keep the first candidate encountered.
pub fn best_match<'a, T, F>(
    query: &str,
    candidates: &'a [T],
    name_of: F,
    min_score: f64,
) -> Option<Match<'a, T>>
where
    F: Fn(&T) -> &str,
{
    let mut best: Option<Match<'a, T>> = None;
    for candidate in candidates {
        let s = score(query, name_of(candidate));
        if best.as_ref().is_none_or(|b| s > b.score) {
            best = Some(Match {
                candidate,
                score: s,
            });
        }
    }
    best.filter(|b| b.score >= min_score)
}

/// [`best_match`], returning every candidate when nothing is acceptable
pub fn resolve<'a, T, F>(
    query: &str,
    candidates: &'a [T],
    name_of: F,
    min_score: f64,
) -> Resolution<'a, T>
where
    F: Fn(&T) -> &str,
{
    match best_match(query, candidates, name_of, min_score) {
        Some(found) => Resolution::Found(found),
        None => {
            tracing::debug!(query, candidates = candidates.len(), "No acceptable fuzzy match");
            Resolution::NotFound {
                query: query.to_string(),
                candidates: candidates.iter().collect(),
            }
        }
    }
}

/// All candidates by descending score; equal scores keep input order
pub fn rank<'a, T, F>(query: &str, candidates: &'a [T], name_of: F) -> Vec<Match<'a, T>>
where
    F: Fn(&T) -> &str,
{
    let mut ranked: Vec<Match<'a, T>> = candidates
        .iter()
        .map(|candidate| Match {
            candidate,
            score: score(query, name_of(candidate)),
        })
        .collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked
}

/// Levenshtein edit distance over Unicode scalar values
#[must_use]
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    // Single rolling row
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let above = row[j + 1];
            let cost = usize::from(ca != cb);
            row[j + 1] = (above + 1).min(row[j] + 1).min(diagonal + cost);
            diagonal = above;
        }
    }
    row[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Persona {
        name: &'static str,
        id: u32,
    }

    fn personas() -> Vec<Persona> {
        vec![
            Persona { name: "Einstein", id: 1 },
            Persona { name: "Albert Einstein", id: 2 },
            Persona { name: "Steve Jobs", id: 3 },
        ]
    }

    #[test]
    fn exact_beats_substring() {
        // GIVEN: "Einstein" (exact) and "Albert Einstein" (substring)
        // WHEN: matching "einstein" with threshold 50
        // THEN: the exact candidate wins with 100
        let list = personas();
        let m = best_match("einstein", &list, |p| p.name, 50.0).unwrap();
        assert_eq!(m.candidate.id, 1);
        assert!((m.score - EXACT_SCORE).abs() < f64::EPSILON);
    }

    #[test]
    fn tier_scores() {
        assert!((score("ein", "Einstein") - PREFIX_SCORE).abs() < f64::EPSILON);
        assert!((score("stein", "Einstein") - SUBSTRING_SCORE).abs() < f64::EPSILON);
        assert!((score("EINSTEIN", "einstein") - EXACT_SCORE).abs() < f64::EPSILON);
    }

    #[test]
    fn similarity_score_is_capped_below_tiers() {
        // "einstien" vs "einstein": distance 2, max_len 8 → 6/8 × 70 = 52.5
        let s = score("einstien", "Einstein");
        assert!((s - 52.5).abs() < 1e-9, "got {s}");
        assert!(s < SUBSTRING_SCORE);
    }

    #[test]
    fn below_threshold_returns_none() {
        let list = personas();
        assert!(best_match("zzzzzz", &list, |p| p.name, 50.0).is_none());
    }

    #[test]
    fn ties_keep_first_candidate() {
        let list = vec![
            Persona { name: "Ada One", id: 10 },
            Persona { name: "Ada Two", id: 11 },
        ];
        let m = best_match("ada", &list, |p| p.name, 0.0).unwrap();
        assert_eq!(m.candidate.id, 10);
    }

    #[test]
    fn resolve_not_found_returns_all_candidates() {
        let list = personas();
        match resolve("qqq", &list, |p| p.name, 60.0) {
            Resolution::NotFound { query, candidates } => {
                assert_eq!(query, "qqq");
                assert_eq!(candidates.len(), 3);
            }
            Resolution::Found(m) => panic!("unexpected match {m:?}"),
        }
    }

    #[test]
    fn rank_orders_by_score() {
        let list = personas();
        let ranked = rank("einstein", &list, |p| p.name);
        let ids: Vec<u32> = ranked.iter().map(|m| m.candidate.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("abc", ""), 3);
        assert_eq!(levenshtein("flaw", "lawn"), 2);
        assert_eq!(levenshtein("café", "cafe"), 1);
    }

    #[test]
    fn surrounding_whitespace_is_ignored() {
        assert!((score(" stein", "Einstein") - SUBSTRING_SCORE).abs() < f64::EPSILON);
        assert!((score("einstein ", " Einstein") - EXACT_SCORE).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_query_matches_nothing() {
        // GIVEN: an empty or blank query
        // WHEN: matching against real names
        // THEN: nothing clears any positive threshold
        let list = personas();
        assert!(score("", "Einstein").abs() < f64::EPSILON);
        assert!(best_match("", &list, |p| p.name, 50.0).is_none());
        assert!(best_match("   ", &list, |p| p.name, 1.0).is_none());
    }

    #[test]
    fn empty_candidate_list() {
        let list: Vec<Persona> = Vec::new();
        assert!(best_match("x", &list, |p| p.name, 0.0).is_none());
    }
}
