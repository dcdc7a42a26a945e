//! Query normalization: raw text to tokens and FTS5 query forms.

use regex::Regex;

/// Characters that survive tokenization besides letters and digits.
fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '\'' || c == '-'
}

/// Split raw text into lowercase words, keeping repeats and order.
///
/// SQL wildcards and punctuation other than apostrophes and hyphens are
/// dropped; typographic apostrophes are folded to `'`.
pub fn words(raw: &str) -> Vec<String> {
    raw.split_whitespace()
        .map(|chunk| {
            chunk
                .chars()
                .map(|c| if c == '\u{2019}' || c == '\u{2018}' { '\'' } else { c })
                .filter(|c| is_word_char(*c))
                .flat_map(char::to_lowercase)
                .collect::<String>()
        })
        .filter(|w| w.chars().any(char::is_alphanumeric))
        .collect()
}

/// Tokenize a query into an ordered set of lowercase terms.
///
/// An empty result means "no matches", not an error.
pub fn tokenize(raw: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for word in words(raw) {
        if !tokens.contains(&word) {
            tokens.push(word);
        }
    }
    tokens
}

/// Quote one term as an FTS5 string, doubling embedded quotes.
pub fn quote_term(term: &str) -> String {
    format!("\"{}\"", term.replace('"', "\"\""))
}

/// Strip quotes from raw text and wrap the rest as one exact-phrase query.
pub fn to_phrase_query(raw: &str) -> Option<String> {
    let stripped = raw.replace(['"', '\u{201c}', '\u{201d}'], " ");
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    if !collapsed.chars().any(char::is_alphanumeric) {
        return None;
    }
    Some(quote_term(&collapsed))
}

/// All terms required, any order.
pub fn to_conjunctive_query(tokens: &[String]) -> Option<String> {
    join_terms(tokens, " AND ")
}

/// Any term suffices.
pub fn to_disjunctive_query(tokens: &[String]) -> Option<String> {
    join_terms(tokens, " OR ")
}

fn join_terms(tokens: &[String], op: &str) -> Option<String> {
    if tokens.is_empty() {
        return None;
    }
    Some(
        tokens
            .iter()
            .map(|t| quote_term(t))
            .collect::<Vec<_>>()
            .join(op),
    )
}

/// `%term%` for a `LIKE ... ESCAPE '\'` clause.
pub fn like_pattern(term: &str) -> String {
    let mut out = String::with_capacity(term.len() + 2);
    out.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

const BOUNDARY_START: &str = r"(?:^|[^\p{L}\p{N}'-])";
const BOUNDARY_END: &str = r"(?:$|[^\p{L}\p{N}'-])";

/// Regex matching `words` consecutively as whole words.
///
/// Words may be separated by any run of non-alphanumeric characters, so
/// "love, god" matches the phrase "love god" but "glove god" does not.
pub fn whole_phrase_regex(words: &[String]) -> Option<Regex> {
    if words.is_empty() {
        return None;
    }
    let body = words
        .iter()
        .map(|w| regex::escape(w))
        .collect::<Vec<_>>()
        .join(r"[^\p{L}\p{N}]+");
    Regex::new(&format!("(?i){}{}{}", BOUNDARY_START, body, BOUNDARY_END)).ok()
}

/// One whole-word regex per term.
pub fn whole_word_regexes(tokens: &[String]) -> Vec<Regex> {
    tokens
        .iter()
        .filter_map(|t| whole_phrase_regex(std::slice::from_ref(t)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_tokenize_basic() {
        assert_eq!(tokenize("Love   GOD's grace!!"), strings(&["love", "god's", "grace"]));
    }

    #[test]
    fn test_tokenize_dedupes_case_insensitively() {
        assert_eq!(tokenize("Grace grace GRACE faith"), strings(&["grace", "faith"]));
    }

    #[test]
    fn test_tokenize_strips_wildcards() {
        assert_eq!(tokenize("100% f_aith *"), strings(&["100", "faith"]));
    }

    #[test]
    fn test_tokenize_keeps_hyphens_and_curly_apostrophes() {
        assert_eq!(tokenize("born-again Lord\u{2019}s"), strings(&["born-again", "lord's"]));
    }

    #[test]
    fn test_tokenize_empty_inputs() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("   !!! -- ''").is_empty());
    }

    #[test]
    fn test_words_keep_repeats() {
        assert_eq!(words("the word of the Lord"), strings(&["the", "word", "of", "the", "lord"]));
    }

    #[test]
    fn test_phrase_query_strips_quotes() {
        assert_eq!(to_phrase_query(r#""the  spoken Word""#).as_deref(), Some(r#""the spoken Word""#));
        assert_eq!(to_phrase_query(r#"  ""  "#), None);
    }

    #[test]
    fn test_conjunctive_and_disjunctive() {
        let tokens = strings(&["faith", "god's"]);
        assert_eq!(to_conjunctive_query(&tokens).as_deref(), Some(r#""faith" AND "god's""#));
        assert_eq!(to_disjunctive_query(&tokens).as_deref(), Some(r#""faith" OR "god's""#));
        assert_eq!(to_conjunctive_query(&[]), None);
    }

    #[test]
    fn test_quote_term_escapes_quotes() {
        assert_eq!(quote_term(r#"a"b"#), r#""a""b""#);
    }

    #[test]
    fn test_like_pattern_escapes() {
        assert_eq!(like_pattern("50%_off"), r"%50\%\_off%");
    }

    #[test]
    fn test_whole_phrase_regex() {
        let re = whole_phrase_regex(&strings(&["love", "god"])).unwrap();
        assert!(re.is_match("We love God."));
        assert!(re.is_match("love, god"));
        assert!(!re.is_match("gloves god"));
        assert!(!re.is_match("love godly things"));
        assert!(!re.is_match("love god's"));
    }

    #[test]
    fn test_whole_word_regexes() {
        let res = whole_word_regexes(&strings(&["faith"]));
        assert_eq!(res.len(), 1);
        assert!(res[0].is_match("by faith alone"));
        assert!(!res[0].is_match("faithful"));
    }
}
