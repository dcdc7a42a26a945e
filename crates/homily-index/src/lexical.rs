//! Lexical full-text search with an ordered fallback chain.
//!
//! Each search is an explicit list of [`LexicalStrategy`] values tried in
//! order. A strategy whose FTS syntax is rejected hands over to the next one;
//! a storage failure stops the chain and propagates.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, ErrorCode, Row};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{SearchError, StorageError};
use crate::pagination::Window;
use crate::query;

/// Failure of a single lexical strategy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LexicalError {
    /// The FTS engine rejected the query text. Recoverable.
    #[error("full-text query rejected: {0}")]
    Syntax(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl LexicalError {
    /// Classify an error raised by an FTS `MATCH` statement.
    fn from_match(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(err, Some(msg)) = &e {
            let lower = msg.to_lowercase();
            let fts_complaint = lower.contains("fts5")
                || lower.contains("syntax error")
                || lower.contains("unterminated string")
                || lower.contains("no such column")
                || lower.contains("unknown special query");
            if err.code == ErrorCode::Unknown && fts_complaint {
                return LexicalError::Syntax(msg.clone());
            }
        }
        LexicalError::Storage(e.into())
    }
}

impl From<LexicalError> for SearchError {
    fn from(e: LexicalError) -> Self {
        match e {
            LexicalError::Syntax(msg) => SearchError::InvalidQuery(msg),
            LexicalError::Storage(e) => SearchError::Storage(e),
        }
    }
}

/// Named lexical query strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LexicalStrategy {
    /// The FTS engine's exact-phrase query.
    NativePhrase,
    /// Every term required, any order.
    AllTerms,
    /// Any term suffices.
    AnyTerm,
    /// Case-insensitive substring scan with a whole-word post-filter.
    SubstringScan,
}

impl LexicalStrategy {
    /// Order tried by phrase search.
    pub const PHRASE_CHAIN: [LexicalStrategy; 4] = [
        LexicalStrategy::NativePhrase,
        LexicalStrategy::AllTerms,
        LexicalStrategy::AnyTerm,
        LexicalStrategy::SubstringScan,
    ];

    /// Order tried by general search.
    pub const GENERAL_CHAIN: [LexicalStrategy; 2] =
        [LexicalStrategy::AllTerms, LexicalStrategy::SubstringScan];

    pub fn as_str(&self) -> &'static str {
        match self {
            LexicalStrategy::NativePhrase => "native_phrase",
            LexicalStrategy::AllTerms => "all_terms",
            LexicalStrategy::AnyTerm => "any_term",
            LexicalStrategy::SubstringScan => "substring_scan",
        }
    }
}

/// Try `chain` in order and return the first strategy that answers.
///
/// `attempt` returns `Ok(None)` when a strategy does not apply to the query
/// (for example no usable terms). Syntax errors move on to the next strategy;
/// storage errors stop the chain. `Ok(None)` means no strategy could run.
pub fn run_chain<T, F>(
    chain: &[LexicalStrategy],
    mut attempt: F,
) -> Result<Option<(LexicalStrategy, T)>, StorageError>
where
    F: FnMut(LexicalStrategy) -> Result<Option<T>, LexicalError>,
{
    for &strategy in chain {
        match attempt(strategy) {
            Ok(Some(value)) => return Ok(Some((strategy, value))),
            Ok(None) => continue,
            Err(LexicalError::Syntax(msg)) => {
                debug!(strategy = strategy.as_str(), error = %msg, "Lexical strategy rejected, falling back");
            }
            Err(LexicalError::Storage(e)) => return Err(e),
        }
    }
    warn!("No lexical strategy could run for this query");
    Ok(None)
}

/// A lexical match with enough metadata to display it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LexicalHit {
    /// Matching block, for block-level (phrase) searches.
    pub block_uid: Option<String>,
    pub paragraph_uid: String,
    pub section_uid: String,
    pub sermon_uid: String,
    pub text: String,
    pub sermon_title: String,
    pub sermon_date: Option<String>,
    /// BM25 relevance (lower is better). `None` for the substring scan.
    pub rank: Option<f64>,
}

/// One page of lexical results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LexicalPage {
    pub hits: Vec<LexicalHit>,
    /// Strategy that answered; `None` when the query had nothing searchable.
    pub strategy: Option<LexicalStrategy>,
}

const BLOCK_COLUMNS: &str = "b.uid, b.paragraph_uid, b.section_uid, b.sermon_uid, b.text, ser.title, ser.date";

const BLOCK_JOINS: &str = "JOIN sermons ser ON ser.uid = b.sermon_uid
     LEFT JOIN sections sec ON sec.uid = b.section_uid
     LEFT JOIN paragraphs p ON p.uid = b.paragraph_uid";

const BLOCK_ORDER: &str =
    "ORDER BY ser.date DESC, b.sermon_uid, sec.order_index, p.order_index, b.order_index, b.uid";

fn block_hit(row: &Row<'_>, rank: Option<f64>) -> rusqlite::Result<LexicalHit> {
    Ok(LexicalHit {
        block_uid: Some(row.get(0)?),
        paragraph_uid: row.get(1)?,
        section_uid: row.get(2)?,
        sermon_uid: row.get(3)?,
        text: row.get(4)?,
        sermon_title: row.get(5)?,
        sermon_date: row.get(6)?,
        rank,
    })
}

fn paragraph_hit(row: &Row<'_>, rank: Option<f64>) -> rusqlite::Result<LexicalHit> {
    Ok(LexicalHit {
        block_uid: None,
        paragraph_uid: row.get(0)?,
        section_uid: row.get(1)?,
        sermon_uid: row.get(2)?,
        text: row.get(3)?,
        sermon_title: row.get(4)?,
        sermon_date: row.get(5)?,
        rank,
    })
}

fn sermon_param(sermon: Option<&str>) -> SqlValue {
    sermon.map_or(SqlValue::Null, |s| SqlValue::Text(s.to_string()))
}

/// Exact consecutive-word search over blocks.
///
/// Results are ordered by sermon date (newest first), then sermon, then
/// position inside the sermon, whichever strategy answers.
pub fn phrase_search(
    conn: &Connection,
    raw: &str,
    window: Window,
    sermon: Option<&str>,
) -> Result<LexicalPage, StorageError> {
    phrase_search_with(conn, &LexicalStrategy::PHRASE_CHAIN, raw, window, sermon)
}

/// Phrase search restricted to an explicit strategy chain.
pub fn phrase_search_with(
    conn: &Connection,
    chain: &[LexicalStrategy],
    raw: &str,
    window: Window,
    sermon: Option<&str>,
) -> Result<LexicalPage, StorageError> {
    let tokens = query::tokenize(raw);
    let words = query::words(raw);

    let answered = run_chain(chain, |strategy| {
        let fts = match strategy {
            LexicalStrategy::NativePhrase => query::to_phrase_query(raw),
            LexicalStrategy::AllTerms => query::to_conjunctive_query(&tokens),
            LexicalStrategy::AnyTerm => query::to_disjunctive_query(&tokens),
            LexicalStrategy::SubstringScan => {
                let Some(pattern) = query::whole_phrase_regex(&words) else {
                    return Ok(None);
                };
                return scan_blocks(conn, &tokens, &[pattern], window, sermon).map(Some);
            }
        };
        match fts {
            Some(fts) => match_blocks(conn, &fts, window, sermon).map(Some),
            None => Ok(None),
        }
    })?;

    Ok(into_page(answered))
}

fn match_blocks(
    conn: &Connection,
    fts: &str,
    window: Window,
    sermon: Option<&str>,
) -> Result<Vec<LexicalHit>, LexicalError> {
    let sql = format!(
        "SELECT {BLOCK_COLUMNS}, bm25(blocks_fts)
         FROM blocks_fts
         JOIN blocks b ON b.rowid = blocks_fts.rowid
         {BLOCK_JOINS}
         WHERE blocks_fts MATCH ?1 AND (?2 IS NULL OR b.sermon_uid = ?2)
         {BLOCK_ORDER}
         LIMIT ?3 OFFSET ?4"
    );
    let params = [
        SqlValue::Text(fts.to_string()),
        sermon_param(sermon),
        SqlValue::Integer(window.sql_limit()),
        SqlValue::Integer(window.offset as i64),
    ];
    let mut stmt = conn.prepare(&sql).map_err(LexicalError::from_match)?;
    let rows = stmt
        .query_map(params_from_iter(params), |row| {
            let rank: Option<f64> = row.get(7)?;
            block_hit(row, rank)
        })
        .map_err(LexicalError::from_match)?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(LexicalError::from_match)
}

/// `LIKE` prefilter on every token, then a regex post-filter in Rust.
fn scan_blocks(
    conn: &Connection,
    tokens: &[String],
    patterns: &[regex::Regex],
    window: Window,
    sermon: Option<&str>,
) -> Result<Vec<LexicalHit>, LexicalError> {
    let (clause, mut params) = like_clause("b.text", tokens);
    params.insert(0, sermon_param(sermon));
    let sql = format!(
        "SELECT {BLOCK_COLUMNS}
         FROM blocks b
         {BLOCK_JOINS}
         WHERE (?1 IS NULL OR b.sermon_uid = ?1){clause}
         {BLOCK_ORDER}"
    );
    let mut stmt = conn.prepare(&sql).map_err(StorageError::from)?;
    let rows = stmt
        .query_map(params_from_iter(params), |row| block_hit(row, None))
        .map_err(StorageError::from)?;

    let mut matched = Vec::new();
    for row in rows {
        let hit = row.map_err(StorageError::from)?;
        if patterns.iter().all(|re| re.is_match(&hit.text)) {
            matched.push(hit);
        }
    }
    Ok(window.slice(matched))
}

/// ` AND col LIKE ? ESCAPE '\'` for each ASCII token. Parameters start at ?2.
///
/// SQLite's `LIKE` folds ASCII case only, so tokens with other characters
/// are left to the case-insensitive regex post-filter.
fn like_clause(column: &str, tokens: &[String]) -> (String, Vec<SqlValue>) {
    let mut clause = String::new();
    let mut params = Vec::with_capacity(tokens.len() + 1);
    for token in tokens.iter().filter(|t| t.is_ascii()) {
        clause.push_str(&format!(" AND {column} LIKE ?{} ESCAPE '\\'", params.len() + 2));
        params.push(SqlValue::Text(query::like_pattern(token)));
    }
    (clause, params)
}

/// Conjunctive ranked search over paragraphs, best BM25 first.
pub fn general_search(
    conn: &Connection,
    tokens: &[String],
    window: Window,
    sermon: Option<&str>,
) -> Result<LexicalPage, StorageError> {
    general_search_with(conn, &LexicalStrategy::GENERAL_CHAIN, tokens, window, sermon)
}

/// General search restricted to an explicit strategy chain.
pub fn general_search_with(
    conn: &Connection,
    chain: &[LexicalStrategy],
    tokens: &[String],
    window: Window,
    sermon: Option<&str>,
) -> Result<LexicalPage, StorageError> {
    let answered = run_chain(chain, |strategy| match strategy {
        LexicalStrategy::AllTerms => match query::to_conjunctive_query(tokens) {
            Some(fts) => match_paragraphs(conn, &fts, window, sermon).map(Some),
            None => Ok(None),
        },
        LexicalStrategy::SubstringScan => {
            let patterns = query::whole_word_regexes(tokens);
            if patterns.is_empty() {
                return Ok(None);
            }
            scan_paragraphs(conn, tokens, &patterns, sermon).map(|hits| Some(window.slice(hits)))
        }
        _ => Ok(None),
    })?;

    Ok(into_page(answered))
}

/// Exact number of paragraphs `general_search` would return without paging.
pub fn count_general(
    conn: &Connection,
    tokens: &[String],
    sermon: Option<&str>,
) -> Result<usize, StorageError> {
    let answered = run_chain(&LexicalStrategy::GENERAL_CHAIN, |strategy| match strategy {
        LexicalStrategy::AllTerms => match query::to_conjunctive_query(tokens) {
            Some(fts) => count_paragraphs(conn, &fts, sermon).map(Some),
            None => Ok(None),
        },
        LexicalStrategy::SubstringScan => {
            let patterns = query::whole_word_regexes(tokens);
            if patterns.is_empty() {
                return Ok(None);
            }
            scan_paragraphs(conn, tokens, &patterns, sermon).map(|hits| Some(hits.len()))
        }
        _ => Ok(None),
    })?;

    Ok(answered.map_or(0, |(_, n)| n))
}

const PARAGRAPH_COLUMNS: &str = "pt.uid, pt.section_uid, pt.sermon_uid, pt.text, ser.title, ser.date";

fn match_paragraphs(
    conn: &Connection,
    fts: &str,
    window: Window,
    sermon: Option<&str>,
) -> Result<Vec<LexicalHit>, LexicalError> {
    let sql = format!(
        "SELECT {PARAGRAPH_COLUMNS}, bm25(paragraphs_fts) AS score
         FROM paragraphs_fts
         JOIN paragraphs_text pt ON pt.rowid = paragraphs_fts.rowid
         JOIN sermons ser ON ser.uid = pt.sermon_uid
         WHERE paragraphs_fts MATCH ?1 AND (?2 IS NULL OR pt.sermon_uid = ?2)
         ORDER BY score, pt.uid
         LIMIT ?3 OFFSET ?4"
    );
    let params = [
        SqlValue::Text(fts.to_string()),
        sermon_param(sermon),
        SqlValue::Integer(window.sql_limit()),
        SqlValue::Integer(window.offset as i64),
    ];
    let mut stmt = conn.prepare(&sql).map_err(LexicalError::from_match)?;
    let rows = stmt
        .query_map(params_from_iter(params), |row| {
            let rank: Option<f64> = row.get(6)?;
            paragraph_hit(row, rank)
        })
        .map_err(LexicalError::from_match)?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(LexicalError::from_match)
}

fn count_paragraphs(conn: &Connection, fts: &str, sermon: Option<&str>) -> Result<usize, LexicalError> {
    let params = [SqlValue::Text(fts.to_string()), sermon_param(sermon)];
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*)
             FROM paragraphs_fts
             JOIN paragraphs_text pt ON pt.rowid = paragraphs_fts.rowid
             WHERE paragraphs_fts MATCH ?1 AND (?2 IS NULL OR pt.sermon_uid = ?2)",
            params_from_iter(params),
            |row| row.get(0),
        )
        .map_err(LexicalError::from_match)?;
    Ok(count.max(0) as usize)
}

/// Substring scan over paragraphs in a stable order (sermon date, position).
fn scan_paragraphs(
    conn: &Connection,
    tokens: &[String],
    patterns: &[regex::Regex],
    sermon: Option<&str>,
) -> Result<Vec<LexicalHit>, LexicalError> {
    let (clause, mut params) = like_clause("pt.text", tokens);
    params.insert(0, sermon_param(sermon));
    let sql = format!(
        "SELECT {PARAGRAPH_COLUMNS}
         FROM paragraphs_text pt
         JOIN sermons ser ON ser.uid = pt.sermon_uid
         LEFT JOIN sections sec ON sec.uid = pt.section_uid
         LEFT JOIN paragraphs p ON p.uid = pt.uid
         WHERE (?1 IS NULL OR pt.sermon_uid = ?1){clause}
         ORDER BY ser.date DESC, pt.sermon_uid, sec.order_index, p.order_index, pt.uid"
    );
    let mut stmt = conn.prepare(&sql).map_err(StorageError::from)?;
    let rows = stmt
        .query_map(params_from_iter(params), |row| paragraph_hit(row, None))
        .map_err(StorageError::from)?;

    let mut matched = Vec::new();
    for row in rows {
        let hit = row.map_err(StorageError::from)?;
        if patterns.iter().all(|re| re.is_match(&hit.text)) {
            matched.push(hit);
        }
    }
    Ok(matched)
}

fn into_page(answered: Option<(LexicalStrategy, Vec<LexicalHit>)>) -> LexicalPage {
    match answered {
        Some((strategy, hits)) => {
            debug!(strategy = strategy.as_str(), hits = hits.len(), "Lexical search answered");
            LexicalPage {
                hits,
                strategy: Some(strategy),
            }
        }
        None => LexicalPage::default(),
    }
}
