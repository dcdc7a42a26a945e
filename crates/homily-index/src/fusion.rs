//! Fusion of lexical and semantic results into one ranked list.
//!
//! Both inputs are first deduplicated by paragraph id so that several blocks
//! of one paragraph never score independently. Keyword scores are min-max
//! normalized, semantic similarities are scaled by their maximum unless the
//! distribution is flat, and the two are blended with a reciprocal rank
//! fusion term:
//!
//! ```text
//! score = alpha * semantic + (1 - alpha) * keyword + beta * (1/(k + rank_lex) + 1/(k + rank_sem))
//! ```
//!
//! Ties on score break by semantic rank, then lexical rank (absent ranks
//! last), then paragraph id, so the output order is total and deterministic.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::hydrate::ResolvedHit;
use crate::lexical::LexicalHit;

/// Semantic spreads at or below this are left unscaled.
pub const FLAT_RANGE: f64 = 0.05;

/// Decay of the positional keyword score used when no BM25 value exists.
const FALLBACK_DECAY: f64 = 0.05;

/// Named fusion policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionPreset {
    /// Weighted sum of normalized scores plus a small RRF term.
    #[default]
    WeightedRrf,
    /// RRF term only.
    ReciprocalRank,
    /// Alternate between the two lists, taking the stronger head each step.
    Interleave,
}

impl FusionPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            FusionPreset::WeightedRrf => "weighted_rrf",
            FusionPreset::ReciprocalRank => "reciprocal_rank",
            FusionPreset::Interleave => "interleave",
        }
    }
}

impl fmt::Display for FusionPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FusionPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "weighted_rrf" | "weighted" => Ok(FusionPreset::WeightedRrf),
            "reciprocal_rank" | "rrf" => Ok(FusionPreset::ReciprocalRank),
            "interleave" => Ok(FusionPreset::Interleave),
            other => Err(format!("unknown fusion preset: {other}")),
        }
    }
}

/// Configuration for fusion.
#[derive(Debug, Clone, PartialEq)]
pub struct FusionConfig {
    pub preset: FusionPreset,
    /// Weight of the semantic score; the keyword score gets `1 - alpha`.
    pub alpha: f64,
    /// Weight of the RRF term.
    pub beta: f64,
    /// RRF k parameter (default 60)
    pub rrf_k: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            preset: FusionPreset::WeightedRrf,
            alpha: 0.95,
            beta: 0.02,
            rrf_k: 60.0,
        }
    }
}

/// Per-result audit trail of how the score was assembled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusionComponents {
    /// Normalized semantic score, 0 when absent from the semantic list.
    pub semantic: f64,
    /// Normalized keyword score, 0 when absent from the lexical list.
    pub keyword: f64,
    pub rrf: f64,
    pub raw_semantic: Option<f64>,
    pub raw_keyword: Option<f64>,
    /// 1-based position in the deduplicated semantic list.
    pub semantic_rank: Option<usize>,
    /// 1-based position in the deduplicated lexical list.
    pub keyword_rank: Option<usize>,
    /// Whether semantic scores were scaled by their maximum.
    pub normalized_semantic_range: bool,
}

/// One paragraph in the fused ranking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedResult {
    /// Paragraph id, unique within one fused list.
    pub uid: String,
    /// Best matching block, when the semantic leg found one.
    pub block_uid: Option<String>,
    pub section_uid: String,
    pub sermon_uid: String,
    pub text: String,
    pub sermon_title: String,
    pub sermon_date: Option<String>,
    pub score: f64,
    pub components: FusionComponents,
}

/// Positional keyword score for the `i`-th (0-based) lexical hit.
pub fn fallback_keyword_score(i: usize) -> f64 {
    (-FALLBACK_DECAY * i as f64).exp()
}

/// Higher-is-better keyword score: negated BM25 when usable, else positional.
fn raw_keyword_score(rank: Option<f64>, i: usize) -> f64 {
    match rank.map(|r| -r) {
        Some(s) if s.is_finite() && s > 0.0 => s,
        _ => fallback_keyword_score(i),
    }
}

fn dedup_by_key<'a, T, F>(items: &'a [T], key: F) -> Vec<&'a T>
where
    F: Fn(&T) -> &str,
{
    let mut seen = HashSet::new();
    items.iter().filter(|item| seen.insert(key(*item))).collect()
}

fn rrf_term(k: f64, rank: Option<usize>) -> f64 {
    rank.map_or(0.0, |r| 1.0 / (k + r as f64))
}

/// Fuse lexical and semantic results.
///
/// Either input may be empty; both empty yields an empty list.
pub fn fuse(lexical: &[LexicalHit], semantic: &[ResolvedHit], config: &FusionConfig) -> Vec<FusedResult> {
    let lexical = dedup_by_key(lexical, |h| h.paragraph_uid.as_str());
    let semantic = dedup_by_key(semantic, |h| h.record.paragraph_uid.as_str());

    let raw_keyword: Vec<f64> = lexical
        .iter()
        .enumerate()
        .map(|(i, h)| raw_keyword_score(h.rank, i))
        .collect();
    let kw_min = raw_keyword.iter().copied().fold(0.0, f64::min);
    let kw_max = raw_keyword.iter().copied().fold(1.0, f64::max);
    let kw_span = kw_max - kw_min;

    let raw_semantic: Vec<f64> = semantic.iter().map(|h| h.similarity.max(0.0)).collect();
    let sem_min = raw_semantic.iter().copied().fold(f64::INFINITY, f64::min);
    let sem_max = raw_semantic.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let scale_semantic = !raw_semantic.is_empty() && sem_max - sem_min > FLAT_RANGE && sem_max > 0.0;

    let mut results: Vec<FusedResult> = Vec::with_capacity(lexical.len() + semantic.len());
    let mut by_uid: HashMap<String, usize> = HashMap::new();

    for (i, hit) in lexical.iter().enumerate() {
        let raw = raw_keyword[i];
        by_uid.insert(hit.paragraph_uid.clone(), results.len());
        results.push(FusedResult {
            uid: hit.paragraph_uid.clone(),
            block_uid: hit.block_uid.clone(),
            section_uid: hit.section_uid.clone(),
            sermon_uid: hit.sermon_uid.clone(),
            text: hit.text.clone(),
            sermon_title: hit.sermon_title.clone(),
            sermon_date: hit.sermon_date.clone(),
            score: 0.0,
            components: FusionComponents {
                semantic: 0.0,
                keyword: (raw - kw_min) / kw_span,
                rrf: 0.0,
                raw_semantic: None,
                raw_keyword: Some(raw),
                semantic_rank: None,
                keyword_rank: Some(i + 1),
                normalized_semantic_range: scale_semantic,
            },
        });
    }

    for (i, hit) in semantic.iter().enumerate() {
        let raw = raw_semantic[i];
        let normalized = if scale_semantic { raw / sem_max } else { raw };
        let record = &hit.record;

        let idx = match by_uid.get(&record.paragraph_uid) {
            Some(&idx) => idx,
            None => {
                by_uid.insert(record.paragraph_uid.clone(), results.len());
                results.push(FusedResult {
                    uid: record.paragraph_uid.clone(),
                    block_uid: None,
                    section_uid: String::new(),
                    sermon_uid: String::new(),
                    text: String::new(),
                    sermon_title: String::new(),
                    sermon_date: None,
                    score: 0.0,
                    components: FusionComponents {
                        semantic: 0.0,
                        keyword: 0.0,
                        rrf: 0.0,
                        raw_semantic: None,
                        raw_keyword: None,
                        semantic_rank: None,
                        keyword_rank: None,
                        normalized_semantic_range: scale_semantic,
                    },
                });
                results.len() - 1
            }
        };

        // The semantic record carries the paragraph text and matching block.
        let merged = &mut results[idx];
        merged.block_uid = Some(record.block_uid.clone());
        merged.section_uid = record.section_uid.clone();
        merged.sermon_uid = record.sermon_uid.clone();
        merged.text = record.paragraph_text.clone();
        merged.sermon_title = record.sermon_title.clone();
        merged.sermon_date = record.sermon_date.clone();
        merged.components.semantic = normalized;
        merged.components.raw_semantic = Some(raw);
        merged.components.semantic_rank = Some(i + 1);
    }

    for result in &mut results {
        let c = &mut result.components;
        c.rrf = rrf_term(config.rrf_k, c.keyword_rank) + rrf_term(config.rrf_k, c.semantic_rank);
        result.score = match config.preset {
            FusionPreset::WeightedRrf | FusionPreset::Interleave => {
                config.alpha * c.semantic + (1.0 - config.alpha) * c.keyword + config.beta * c.rrf
            }
            FusionPreset::ReciprocalRank => c.rrf,
        };
    }

    if config.preset == FusionPreset::Interleave {
        apply_interleave(&mut results, &lexical, &semantic);
    }

    results.sort_by(compare);
    results
}

/// Replace scores with a strictly decreasing sequence in interleaved order.
fn apply_interleave(results: &mut [FusedResult], lexical: &[&LexicalHit], semantic: &[&ResolvedHit]) {
    let by_uid: HashMap<String, usize> = results
        .iter()
        .enumerate()
        .map(|(i, r)| (r.uid.clone(), i))
        .collect();
    let lex: Vec<usize> = lexical.iter().filter_map(|h| by_uid.get(&h.paragraph_uid).copied()).collect();
    let sem: Vec<usize> = semantic
        .iter()
        .filter_map(|h| by_uid.get(&h.record.paragraph_uid).copied())
        .collect();

    let total = results.len();
    let mut emitted = vec![false; total];
    let (mut i, mut j, mut position) = (0, 0, 0);
    loop {
        while i < lex.len() && emitted[lex[i]] {
            i += 1;
        }
        while j < sem.len() && emitted[sem[j]] {
            j += 1;
        }
        let next = match (lex.get(i), sem.get(j)) {
            (Some(&l), Some(&s)) => {
                if results[s].components.semantic >= results[l].components.keyword {
                    s
                } else {
                    l
                }
            }
            (Some(&l), None) => l,
            (None, Some(&s)) => s,
            (None, None) => break,
        };
        emitted[next] = true;
        results[next].score = (total - position) as f64 / total as f64;
        position += 1;
    }
}

fn compare(a: &FusedResult, b: &FusedResult) -> std::cmp::Ordering {
    let rank = |r: Option<usize>| r.unwrap_or(usize::MAX);
    b.score
        .total_cmp(&a.score)
        .then_with(|| rank(a.components.semantic_rank).cmp(&rank(b.components.semantic_rank)))
        .then_with(|| rank(a.components.keyword_rank).cmp(&rank(b.components.keyword_rank)))
        .then_with(|| a.uid.cmp(&b.uid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hydrate::HydratedRecord;

    const EPS: f64 = 1e-9;

    fn lex(paragraph: &str, rank: Option<f64>) -> LexicalHit {
        LexicalHit {
            block_uid: None,
            paragraph_uid: paragraph.to_string(),
            section_uid: "sec".into(),
            sermon_uid: "s1".into(),
            text: format!("lexical {paragraph}"),
            sermon_title: "Title".into(),
            sermon_date: None,
            rank,
        }
    }

    fn sem(paragraph: &str, block: &str, similarity: f64) -> ResolvedHit {
        ResolvedHit {
            record: HydratedRecord {
                block_uid: block.to_string(),
                paragraph_uid: paragraph.to_string(),
                section_uid: "sec".into(),
                sermon_uid: "s1".into(),
                paragraph_text: format!("semantic {paragraph}"),
                sermon_title: "Title".into(),
                sermon_date: Some("1965-01-01".into()),
            },
            similarity,
            distance: Some(1.0 - similarity),
            score: None,
        }
    }

    fn uids(results: &[FusedResult]) -> Vec<&str> {
        results.iter().map(|r| r.uid.as_str()).collect()
    }

    #[test]
    fn test_fusion_config_default() {
        let config = FusionConfig::default();
        assert_eq!(config.preset, FusionPreset::WeightedRrf);
        assert!((config.alpha - 0.95).abs() < EPS);
        assert!((config.beta - 0.02).abs() < EPS);
        assert!((config.rrf_k - 60.0).abs() < EPS);
    }

    #[test]
    fn test_fallback_scores_strictly_decrease() {
        assert!((fallback_keyword_score(0) - 1.0).abs() < EPS);
        for i in 0..50 {
            assert!(fallback_keyword_score(i) > fallback_keyword_score(i + 1));
        }
    }

    #[test]
    fn test_worked_example() {
        let lexical = vec![lex("a", None), lex("b", None)];
        let semantic = vec![sem("b", "b.1", 0.9), sem("c", "c.1", 0.4)];
        let fused = fuse(&lexical, &semantic, &FusionConfig::default());

        assert_eq!(uids(&fused), vec!["b", "c", "a"]);

        let b = &fused[0];
        assert!((b.components.rrf - (1.0 / 62.0 + 1.0 / 61.0)).abs() < EPS);
        assert!((b.components.semantic - 1.0).abs() < EPS);
        assert!(b.components.normalized_semantic_range);
        let expected_b = 0.95 * 1.0 + 0.05 * (-0.05f64).exp() + 0.02 * (1.0 / 62.0 + 1.0 / 61.0);
        assert!((b.score - expected_b).abs() < EPS);

        let c = &fused[1];
        assert!((c.components.semantic - 0.4 / 0.9).abs() < EPS);
        assert_eq!(c.components.keyword_rank, None);
    }

    #[test]
    fn test_duplicate_paragraph_merges_into_one_record() {
        let lexical = vec![lex("y", None), lex("x", None)];
        let semantic = vec![sem("x", "x.3", 0.8), sem("z", "z.1", 0.7)];
        let config = FusionConfig::default();
        let fused = fuse(&lexical, &semantic, &config);

        let xs: Vec<&FusedResult> = fused.iter().filter(|r| r.uid == "x").collect();
        assert_eq!(xs.len(), 1);
        let x = xs[0];
        assert_eq!(x.components.keyword_rank, Some(2));
        assert_eq!(x.components.semantic_rank, Some(1));
        assert!((x.components.rrf - (1.0 / 62.0 + 1.0 / 61.0)).abs() < EPS);
        assert!(x.components.raw_keyword.is_some());
        assert!(x.components.raw_semantic.is_some());
        // Metadata comes from the semantic record.
        assert_eq!(x.block_uid.as_deref(), Some("x.3"));
        assert_eq!(x.text, "semantic x");
    }

    #[test]
    fn test_blocks_of_one_paragraph_collapse() {
        let mut first = lex("p", Some(-4.0));
        first.block_uid = Some("p.1".into());
        let mut second = lex("p", Some(-3.0));
        second.block_uid = Some("p.2".into());
        let semantic = vec![sem("q", "q.1", 0.9), sem("q", "q.2", 0.85)];

        let fused = fuse(&[first, second], &semantic, &FusionConfig::default());
        assert_eq!(fused.len(), 2);
        let p = fused.iter().find(|r| r.uid == "p").unwrap();
        assert_eq!(p.block_uid.as_deref(), Some("p.1"));
        let q = fused.iter().find(|r| r.uid == "q").unwrap();
        assert_eq!(q.block_uid.as_deref(), Some("q.1"));
    }

    #[test]
    fn test_lexical_only_keeps_lexical_order() {
        let lexical = vec![lex("a", Some(-5.0)), lex("b", Some(-3.0)), lex("c", Some(-1.0))];
        let fused = fuse(&lexical, &[], &FusionConfig::default());
        assert_eq!(uids(&fused), vec!["a", "b", "c"]);
        assert!((fused[0].components.keyword - 1.0).abs() < EPS);
        assert!((fused[1].components.keyword - 0.6).abs() < EPS);
        assert!(fused.iter().all(|r| r.components.semantic_rank.is_none()));
    }

    #[test]
    fn test_semantic_only_keeps_provider_order() {
        let semantic = vec![sem("a", "a.1", 0.7), sem("b", "b.1", 0.5), sem("c", "c.1", 0.2)];
        let fused = fuse(&[], &semantic, &FusionConfig::default());
        assert_eq!(uids(&fused), vec!["a", "b", "c"]);
        assert!((fused[0].components.semantic - 1.0).abs() < EPS);
    }

    #[test]
    fn test_both_empty() {
        assert!(fuse(&[], &[], &FusionConfig::default()).is_empty());
    }

    #[test]
    fn test_flat_semantic_distribution_is_not_scaled() {
        let semantic = vec![sem("a", "a.1", 0.42), sem("b", "b.1", 0.40)];
        let fused = fuse(&[], &semantic, &FusionConfig::default());
        assert!(!fused[0].components.normalized_semantic_range);
        assert!((fused[0].components.semantic - 0.42).abs() < EPS);
    }

    #[test]
    fn test_fusion_is_deterministic() {
        let lexical = vec![lex("a", None), lex("b", None), lex("c", Some(-2.0))];
        let semantic = vec![sem("c", "c.1", 0.6), sem("d", "d.1", 0.6), sem("a", "a.1", 0.1)];
        let config = FusionConfig::default();
        let first = fuse(&lexical, &semantic, &config);
        let second = fuse(&lexical, &semantic, &config);
        assert_eq!(first, second);
    }

    #[test]
    fn test_ties_break_by_semantic_then_lexical_rank() {
        let config = FusionConfig {
            preset: FusionPreset::WeightedRrf,
            alpha: 0.5,
            beta: 0.0,
            rrf_k: 60.0,
        };
        // Flat semantic list: both keep raw similarity 0.5, no keyword side.
        let semantic = vec![sem("late", "l.1", 0.5), sem("early", "e.1", 0.5)];
        let fused = fuse(&[], &semantic, &config);
        assert_eq!(fused[0].score, fused[1].score);
        assert_eq!(uids(&fused), vec!["late", "early"]);
    }

    #[test]
    fn test_reciprocal_rank_preset() {
        let config = FusionConfig {
            preset: FusionPreset::ReciprocalRank,
            ..FusionConfig::default()
        };
        let lexical = vec![lex("a", None), lex("b", None)];
        let semantic = vec![sem("b", "b.1", 0.1), sem("a", "a.1", 0.05)];
        let fused = fuse(&lexical, &semantic, &config);
        for r in &fused {
            assert!((r.score - r.components.rrf).abs() < EPS);
        }
        // a: 1/61 + 1/62, b: 1/62 + 1/61 -> tie, semantic rank decides.
        assert_eq!(uids(&fused), vec!["b", "a"]);
    }

    #[test]
    fn test_interleave_preset_alternates_heads() {
        let config = FusionConfig {
            preset: FusionPreset::Interleave,
            ..FusionConfig::default()
        };
        let lexical = vec![lex("l1", None), lex("l2", None)];
        let semantic = vec![sem("s1", "s1.1", 0.9), sem("s2", "s2.1", 0.2)];
        let fused = fuse(&lexical, &semantic, &config);

        // s1 (1.0) beats l1 (1.0 tie -> semantic), then l1 (1.0) beats s2 (0.22),
        // then l2 (0.95) beats s2, then s2.
        assert_eq!(uids(&fused), vec!["s1", "l1", "l2", "s2"]);
        assert!(fused.windows(2).all(|w| w[0].score > w[1].score));
    }

    #[test]
    fn test_preset_parsing() {
        assert_eq!("weighted-rrf".parse::<FusionPreset>().unwrap(), FusionPreset::WeightedRrf);
        assert_eq!("RRF".parse::<FusionPreset>().unwrap(), FusionPreset::ReciprocalRank);
        assert_eq!("interleave".parse::<FusionPreset>().unwrap(), FusionPreset::Interleave);
        assert!("cosine".parse::<FusionPreset>().is_err());
    }
}
