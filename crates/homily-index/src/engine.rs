//! Search orchestration: the `search(query, limit, mode, sermon, page)` surface.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cache::{Clock, QueryCache, DEFAULT_TTL};
use crate::error::SearchError;
use crate::fusion::{fuse, FusedResult, FusionConfig};
use crate::hydrate::{self, ResolvedHit};
use crate::lexical::{self, LexicalHit, LexicalPage, LexicalStrategy};
use crate::pagination::{self, PageInfo, PageSize, Window};
use crate::query;
use crate::store::SermonStore;
use crate::vector::{SemanticHit, VectorSearchEngine};

/// What kind of search to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Exact consecutive words, newest sermon first.
    Phrase,
    /// All terms, fused with semantic matches when available.
    #[default]
    General,
    /// Meaning only.
    Similar,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Phrase => "phrase",
            SearchMode::General => "general",
            SearchMode::Similar => "similar",
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "phrase" => Ok(SearchMode::Phrase),
            "general" => Ok(SearchMode::General),
            "similar" | "semantic" => Ok(SearchMode::Similar),
            other => Err(format!("unknown search mode: {other}")),
        }
    }
}

/// One search request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub mode: SearchMode,
    /// Page size; `-1` returns every match on one page.
    pub limit: i64,
    /// 1-based page; values below 1 are treated as 1.
    pub page: u64,
    /// Restrict results to one sermon.
    pub sermon: Option<String>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, mode: SearchMode) -> Self {
        Self {
            query: query.into(),
            mode,
            limit: 20,
            page: 1,
            sermon: None,
        }
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_page(mut self, page: u64) -> Self {
        self.page = page;
        self
    }

    pub fn with_sermon(mut self, sermon: impl Into<String>) -> Self {
        self.sermon = Some(sermon.into());
        self
    }
}

/// Result rows; the shape depends on the mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SearchData {
    Fused(Vec<FusedResult>),
    Lexical(Vec<LexicalHit>),
    Semantic(Vec<ResolvedHit>),
}

impl SearchData {
    pub fn len(&self) -> usize {
        match self {
            SearchData::Fused(v) => v.len(),
            SearchData::Lexical(v) => v.len(),
            SearchData::Semantic(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of the semantic leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticStatus {
    Ok,
    /// The provider failed; results are lexical only.
    Degraded,
    /// Not configured, disabled, or not applicable to the mode.
    Skipped,
}

/// How a response was produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    pub request_id: String,
    pub lexical_strategy: Option<LexicalStrategy>,
    pub semantic: SemanticStatus,
    pub cached: bool,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    pub data: SearchData,
    pub pagination: PageInfo,
    pub diagnostics: Diagnostics,
}

/// Configuration for the search engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub fusion: FusionConfig,
    /// Fuse semantic results into general searches.
    pub hybrid: bool,
    /// Candidates fetched from each leg before fusion.
    pub candidate_limit: usize,
    pub cache_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fusion: FusionConfig::default(),
            hybrid: true,
            candidate_limit: crate::DEFAULT_CANDIDATE_LIMIT,
            cache_ttl: DEFAULT_TTL,
        }
    }
}

/// Fused candidates for one (tokens, limit, sermon) key.
#[derive(Clone)]
struct CachedFusion {
    results: Arc<Vec<FusedResult>>,
    lexical_strategy: Option<LexicalStrategy>,
    semantic: SemanticStatus,
}

/// Body of a response before diagnostics are stamped on.
struct Answer {
    data: SearchData,
    pagination: PageInfo,
    lexical_strategy: Option<LexicalStrategy>,
    semantic: SemanticStatus,
    cached: bool,
}

impl Answer {
    fn empty(page_size: PageSize, data: SearchData) -> Self {
        Self {
            pagination: pagination::compute(1, page_size, Some(0), 0),
            data,
            lexical_strategy: None,
            semantic: SemanticStatus::Skipped,
            cached: false,
        }
    }
}

/// Hybrid search engine over a sermon store and an optional vector engine.
pub struct SearchEngine {
    store: Arc<SermonStore>,
    vector: Option<Arc<VectorSearchEngine>>,
    config: EngineConfig,
    cache: QueryCache<CachedFusion>,
}

impl SearchEngine {
    pub fn new(store: Arc<SermonStore>, vector: Option<VectorSearchEngine>, config: EngineConfig) -> Self {
        let cache = QueryCache::new(config.cache_ttl);
        Self {
            store,
            vector: vector.map(Arc::new),
            config,
            cache,
        }
    }

    /// Use `clock` for cache expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.cache = QueryCache::with_clock(self.config.cache_ttl, clock);
        self
    }

    pub fn store(&self) -> &Arc<SermonStore> {
        &self.store
    }

    pub fn has_semantic(&self) -> bool {
        self.vector.is_some()
    }

    /// Run one search. Cancelling `cancel` abandons every in-flight leg and
    /// interrupts any SQLite statement still running for it.
    pub async fn search(
        &self,
        request: &SearchRequest,
        cancel: &CancellationToken,
    ) -> Result<SearchResponse, SearchError> {
        let request_id = Uuid::new_v4().to_string();
        let span = info_span!("search", request_id = %request_id, mode = %request.mode);

        async {
            let started = Instant::now();
            let answer = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Search cancelled");
                    return Err(SearchError::Cancelled);
                }
                answer = self.dispatch(request) => answer?,
            };

            let elapsed_ms = started.elapsed().as_millis() as u64;
            info!(
                results = answer.data.len(),
                cached = answer.cached,
                semantic = ?answer.semantic,
                elapsed_ms,
                "Search complete"
            );
            Ok::<_, SearchError>(SearchResponse {
                data: answer.data,
                pagination: answer.pagination,
                diagnostics: Diagnostics {
                    request_id: request_id.clone(),
                    lexical_strategy: answer.lexical_strategy,
                    semantic: answer.semantic,
                    cached: answer.cached,
                    elapsed_ms,
                },
            })
        }
        .instrument(span)
        .await
    }

    async fn dispatch(&self, request: &SearchRequest) -> Result<Answer, SearchError> {
        let page_size = PageSize::from_limit(request.limit)
            .ok_or_else(|| SearchError::InvalidQuery("limit must be -1 or a positive number".into()))?;
        let page = match page_size {
            PageSize::Unlimited => 1,
            PageSize::Limited(_) => request.page.max(1),
        };
        let sermon = request.sermon.clone().filter(|s| !s.trim().is_empty());
        debug!(query = %request.query, limit = request.limit, page, sermon = ?sermon, "Dispatching search");

        match request.mode {
            SearchMode::Phrase => self.phrase(&request.query, page, page_size, sermon).await,
            SearchMode::General => self.general(&request.query, page, page_size, sermon).await,
            SearchMode::Similar => self.similar(&request.query, page, page_size, sermon).await,
        }
    }

    async fn phrase(
        &self,
        raw: &str,
        page: u64,
        page_size: PageSize,
        sermon: Option<String>,
    ) -> Result<Answer, SearchError> {
        if query::to_phrase_query(raw).is_none() {
            return Ok(Answer::empty(page_size, SearchData::Lexical(Vec::new())));
        }

        let raw = raw.to_string();
        let window = page_size.window(page);
        let result: LexicalPage = self
            .store
            .run(move |conn| lexical::phrase_search(conn, &raw, window, sermon.as_deref()))
            .await?;

        let total = match page_size {
            PageSize::Unlimited => Some(result.hits.len()),
            PageSize::Limited(_) => None,
        };
        Ok(Answer {
            pagination: pagination::compute(page, page_size, total, result.hits.len()),
            data: SearchData::Lexical(result.hits),
            lexical_strategy: result.strategy,
            semantic: SemanticStatus::Skipped,
            cached: false,
        })
    }

    async fn general(
        &self,
        raw: &str,
        page: u64,
        page_size: PageSize,
        sermon: Option<String>,
    ) -> Result<Answer, SearchError> {
        let tokens = query::tokenize(raw);
        if tokens.is_empty() {
            return Ok(Answer::empty(page_size, SearchData::Fused(Vec::new())));
        }

        match &self.vector {
            Some(vector) if self.config.hybrid => {
                self.general_hybrid(raw, tokens, page, page_size, sermon, vector)
                    .await
            }
            _ => self.general_lexical(tokens, page, page_size, sermon).await,
        }
    }

    /// Lexical ∥ semantic candidates, fused, paged in memory, cached.
    async fn general_hybrid(
        &self,
        raw: &str,
        tokens: Vec<String>,
        page: u64,
        page_size: PageSize,
        sermon: Option<String>,
        vector: &Arc<VectorSearchEngine>,
    ) -> Result<Answer, SearchError> {
        let key = format!(
            "{}|{}",
            QueryCache::<CachedFusion>::key(&tokens, page_size),
            sermon.as_deref().unwrap_or("")
        );

        let compute = || async move {
            let candidates = match page_size {
                PageSize::Unlimited => Window::ALL,
                PageSize::Limited(_) => Window::first(self.config.candidate_limit),
            };
            let lexical_sermon = sermon.clone();
            let lexical_leg = self.store.run(move |conn| {
                lexical::general_search(conn, &tokens, candidates, lexical_sermon.as_deref())
                    .map_err(SearchError::from)
            });
            // Provider failures are already folded into a degraded `Ok`, so
            // only fatal errors end the join early.
            let semantic_leg = self.semantic_candidates(vector, raw, sermon.as_deref());

            let (lexical, (semantic, status)): (LexicalPage, _) =
                tokio::try_join!(lexical_leg, semantic_leg)?;

            let results = fuse(&lexical.hits, &semantic, &self.config.fusion);
            debug!(
                lexical = lexical.hits.len(),
                semantic = semantic.len(),
                fused = results.len(),
                preset = %self.config.fusion.preset,
                "Fused candidates"
            );
            let entry = CachedFusion {
                results: Arc::new(results),
                lexical_strategy: lexical.strategy,
                semantic: status,
            };
            // A degraded answer would hide the semantic leg for a whole TTL.
            let cacheable = status == SemanticStatus::Ok;
            Ok::<_, SearchError>((entry, cacheable))
        };
        let (fused, cached) = self.cache.get_or_try_insert_with(&key, compute).await?;
        if cached {
            debug!(key = %key, "Serving fused results from cache");
        }

        let total = fused.results.len();
        let window = page_size.window(page);
        let rows: Vec<FusedResult> = fused
            .results
            .iter()
            .skip(window.offset)
            .take(window.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(Answer {
            pagination: pagination::compute(page, page_size, Some(total), rows.len()),
            data: SearchData::Fused(rows),
            lexical_strategy: fused.lexical_strategy,
            semantic: fused.semantic,
            cached,
        })
    }

    /// SQL-paged lexical search with an exact total from a parallel count.
    async fn general_lexical(
        &self,
        tokens: Vec<String>,
        page: u64,
        page_size: PageSize,
        sermon: Option<String>,
    ) -> Result<Answer, SearchError> {
        let window = page_size.window(page);
        let tokens = Arc::new(tokens);

        let (search_tokens, search_sermon) = (Arc::clone(&tokens), sermon.clone());
        let search = self.store.run(move |conn| {
            lexical::general_search(conn, &search_tokens, window, search_sermon.as_deref())
        });

        let (result, total) = match page_size {
            PageSize::Unlimited => {
                let result: LexicalPage = search.await?;
                let total = result.hits.len();
                (result, total)
            }
            PageSize::Limited(_) => {
                let count = self.store.run(move |conn| {
                    lexical::count_general(conn, &tokens, sermon.as_deref())
                });
                tokio::try_join!(search, count)?
            }
        };

        // Lexical hits become single-leg fused rows so the shape matches hybrid mode.
        let fused = fuse(&result.hits, &[], &self.config.fusion);
        Ok(Answer {
            pagination: pagination::compute(page, page_size, Some(total), fused.len()),
            data: SearchData::Fused(fused),
            lexical_strategy: result.strategy,
            semantic: SemanticStatus::Skipped,
            cached: false,
        })
    }

    async fn similar(
        &self,
        raw: &str,
        page: u64,
        page_size: PageSize,
        sermon: Option<String>,
    ) -> Result<Answer, SearchError> {
        let vector = self
            .vector
            .as_ref()
            .ok_or_else(|| SearchError::Configuration("semantic search is not configured".into()))?;
        if raw.trim().is_empty() {
            return Ok(Answer::empty(page_size, SearchData::Semantic(Vec::new())));
        }

        let window = page_size.window(page);
        // Hits outside the sermon are dropped after hydration, so a filtered
        // page needs the whole candidate pool to draw from.
        let fetch = match (window.end(), &sermon) {
            (Some(end), None) => end,
            (Some(end), Some(_)) => end.max(self.config.candidate_limit),
            (None, _) => self.config.candidate_limit,
        };
        let hits = vector.search_text(raw, fetch).await?;
        let resolved = self.hydrate(hits, sermon.as_deref()).await?;
        let rows = window.slice(resolved);

        let total = match page_size {
            PageSize::Unlimited => Some(rows.len()),
            PageSize::Limited(_) => None,
        };
        Ok(Answer {
            pagination: pagination::compute(page, page_size, total, rows.len()),
            data: SearchData::Semantic(rows),
            lexical_strategy: None,
            semantic: SemanticStatus::Ok,
            cached: false,
        })
    }

    /// Semantic leg of a hybrid search. Provider failures other than missing
    /// configuration degrade to an empty candidate list.
    async fn semantic_candidates(
        &self,
        vector: &VectorSearchEngine,
        raw: &str,
        sermon: Option<&str>,
    ) -> Result<(Vec<ResolvedHit>, SemanticStatus), SearchError> {
        match vector.search_text(raw, self.config.candidate_limit).await {
            Ok(hits) => {
                let resolved = self.hydrate(hits, sermon).await?;
                Ok((resolved, SemanticStatus::Ok))
            }
            Err(e) if e.is_configuration() => Err(e.into()),
            Err(e) => {
                warn!(error = %e, status = ?e.status(), "Semantic search failed, continuing with lexical results only");
                Ok((Vec::new(), SemanticStatus::Degraded))
            }
        }
    }

    async fn hydrate(
        &self,
        hits: Vec<SemanticHit>,
        sermon: Option<&str>,
    ) -> Result<Vec<ResolvedHit>, SearchError> {
        if hits.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = hits.iter().map(|h| h.id.clone()).collect();
        let records = self
            .store
            .run(move |conn| hydrate::resolve(conn, &ids))
            .await?;

        let mut resolved = hydrate::attach(hits, &records);
        if let Some(sermon) = sermon {
            resolved.retain(|h| h.record.sermon_uid == sermon);
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_mode_parsing() {
        assert_eq!("Phrase".parse::<SearchMode>().unwrap(), SearchMode::Phrase);
        assert_eq!("semantic".parse::<SearchMode>().unwrap(), SearchMode::Similar);
        assert!("fuzzy".parse::<SearchMode>().is_err());
        assert_eq!(SearchMode::default(), SearchMode::General);
    }

    #[test]
    fn test_request_builder() {
        let request = SearchRequest::new("grace", SearchMode::Phrase)
            .with_limit(-1)
            .with_page(3)
            .with_sermon("63-0317M");
        assert_eq!(request.limit, -1);
        assert_eq!(request.page, 3);
        assert_eq!(request.sermon.as_deref(), Some("63-0317M"));
    }

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert!(config.hybrid);
        assert_eq!(config.candidate_limit, crate::DEFAULT_CANDIDATE_LIMIT);
        assert_eq!(config.cache_ttl, Duration::from_millis(4000));
    }

    #[test]
    fn test_search_data_serializes_untagged() {
        let data = SearchData::Lexical(Vec::new());
        assert_eq!(serde_json::to_string(&data).unwrap(), "[]");
        assert!(data.is_empty());
    }
}
