//! ANN vector search over a Milvus/Zilliz-style REST API.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::embeddings::build_client;
use crate::error::{sanitize_body, ProviderError};
use crate::retry::{post_json_with_retry, RetryPolicy};

const SERVICE: &str = "vector";
const SEARCH_PATH: &str = "/v2/vectordb/entities/search";

/// Distance metric configured on the collection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Metric {
    #[default]
    Cosine,
    InnerProduct,
    L2,
    /// Anything the engine does not know how to interpret.
    Unknown(String),
}

impl Metric {
    /// Name sent to the provider as `metricType`.
    pub fn as_str(&self) -> &str {
        match self {
            Metric::Cosine => "COSINE",
            Metric::InnerProduct => "IP",
            Metric::L2 => "L2",
            Metric::Unknown(name) => name,
        }
    }
}

impl FromStr for Metric {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Ok(match upper.as_str() {
            "COSINE" => Metric::Cosine,
            "IP" | "INNER_PRODUCT" => Metric::InnerProduct,
            "L2" | "EUCLIDEAN" => Metric::L2,
            _ => Metric::Unknown(upper),
        })
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single ANN request.
#[derive(Debug, Clone)]
pub struct AnnQuery {
    pub vector: Vec<f32>,
    pub limit: usize,
}

/// One hit as the provider returned it, before any score conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct RawHit {
    /// Primary key of the vector entity.
    pub id: String,
    /// Block the vector was computed from, when the collection stores it.
    pub block_uid: Option<String>,
    pub distance: Option<f64>,
    pub score: Option<f64>,
}

impl RawHit {
    /// Id used to resolve this hit against the relational store.
    pub fn target(&self) -> &str {
        self.block_uid.as_deref().unwrap_or(&self.id)
    }
}

/// Trait for ANN search backends.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Run one ANN search, returning hits in provider order.
    async fn search(&self, query: &AnnQuery) -> Result<Vec<RawHit>, ProviderError>;

    /// Metric the collection was built with.
    fn metric(&self) -> &Metric;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest<'a> {
    collection_name: &'a str,
    data: [&'a [f32]; 1],
    limit: usize,
    output_fields: [&'static str; 2],
    search_params: SearchParams<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchParams<'a> {
    anns_field: &'a str,
    metric_type: &'a str,
    params: Value,
}

/// REST client for Zilliz Cloud / Milvus `entities/search`.
pub struct RestVectorStore {
    api_key: Option<String>,
    base_url: String,
    collection: String,
    vector_field: String,
    metric: Metric,
    nprobe: u32,
    ef_cap: usize,
    client: Client,
    retry: RetryPolicy,
}

impl RestVectorStore {
    /// Create a client. A missing key is reported on first search.
    pub fn new(base_url: impl Into<String>, collection: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            collection: collection.into(),
            vector_field: "embedding".to_string(),
            metric: Metric::Cosine,
            nprobe: 64,
            ef_cap: 2000,
            client: build_client(Duration::from_secs(30)),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_vector_field(mut self, field: impl Into<String>) -> Self {
        self.vector_field = field.into();
        self
    }

    /// Index search parameters: IVF `nprobe` and the HNSW `ef` ceiling.
    pub fn with_search_params(mut self, nprobe: u32, ef_cap: usize) -> Self {
        self.nprobe = nprobe;
        self.ef_cap = ef_cap;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = build_client(timeout);
        self
    }

    fn ef_for(&self, limit: usize) -> usize {
        limit.saturating_mul(2).min(self.ef_cap).max(limit)
    }
}

#[async_trait]
impl VectorStore for RestVectorStore {
    async fn search(&self, query: &AnnQuery) -> Result<Vec<RawHit>, ProviderError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(ProviderError::Configuration { service: SERVICE })?;
        if self.base_url.is_empty() {
            return Err(ProviderError::Configuration { service: SERVICE });
        }

        let request = SearchRequest {
            collection_name: &self.collection,
            data: [query.vector.as_slice()],
            limit: query.limit,
            output_fields: ["id", "block_uid"],
            search_params: SearchParams {
                anns_field: &self.vector_field,
                metric_type: self.metric.as_str(),
                params: json!({ "nprobe": self.nprobe, "ef": self.ef_for(query.limit) }),
            },
        };

        debug!(
            collection = %self.collection,
            limit = query.limit,
            dims = query.vector.len(),
            metric = %self.metric,
            "Running ANN search"
        );

        let url = format!("{}{}", self.base_url, SEARCH_PATH);
        let body =
            post_json_with_retry(&self.client, SERVICE, &url, api_key, &request, &self.retry)
                .await?;

        let hits = parse_hits(&body, Some(api_key))?;
        debug!(hits = hits.len(), "ANN search returned");
        Ok(hits)
    }

    fn metric(&self) -> &Metric {
        &self.metric
    }
}

/// Decode a search response, tolerating the envelope shapes Milvus and
/// Zilliz have used over time.
pub fn parse_hits(body: &str, secret: Option<&str>) -> Result<Vec<RawHit>, ProviderError> {
    let value: Value = serde_json::from_str(body).map_err(|e| ProviderError::InvalidResponse {
        service: SERVICE,
        detail: format!("{}: {}", e, sanitize_body(body, secret)),
    })?;

    if let Some(code) = value.get("code").and_then(Value::as_i64) {
        if code != 0 {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(ProviderError::Api {
                service: SERVICE,
                code,
                message: sanitize_body(message, secret),
            });
        }
    }

    let data = match value.get("data") {
        Some(data) => data,
        None => &value,
    };
    let rows = locate_rows(data).ok_or_else(|| ProviderError::InvalidResponse {
        service: SERVICE,
        detail: format!("no hit list in response: {}", sanitize_body(body, secret)),
    })?;

    Ok(rows.iter().filter_map(parse_hit).collect())
}

fn locate_rows(data: &Value) -> Option<&Vec<Value>> {
    match data {
        Value::Array(items) => match items.first() {
            Some(Value::Array(inner)) => Some(inner),
            Some(first) if first.get("results").is_some() => {
                first.get("results").and_then(Value::as_array)
            }
            _ => Some(items),
        },
        Value::Object(map) => ["results", "rows", "entities"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array)),
        _ => None,
    }
}

fn parse_hit(row: &Value) -> Option<RawHit> {
    let block_uid = lookup(row, "block_uid").and_then(as_id);
    let id = lookup(row, "id").and_then(as_id).or_else(|| block_uid.clone())?;

    Some(RawHit {
        id,
        block_uid,
        distance: row.get("distance").and_then(Value::as_f64),
        score: row.get("score").and_then(Value::as_f64),
    })
}

/// Field lookup on the hit itself, then its `entity` or `fields` object.
fn lookup<'a>(row: &'a Value, name: &str) -> Option<&'a Value> {
    [Some(row), row.get("entity"), row.get("fields")]
        .into_iter()
        .flatten()
        .find_map(|v| v.get(name).filter(|f| !f.is_null()))
}

fn as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_parsing() {
        assert_eq!("cosine".parse::<Metric>().unwrap(), Metric::Cosine);
        assert_eq!("IP".parse::<Metric>().unwrap(), Metric::InnerProduct);
        assert_eq!("euclidean".parse::<Metric>().unwrap(), Metric::L2);
        assert_eq!(
            "hamming".parse::<Metric>().unwrap(),
            Metric::Unknown("HAMMING".to_string())
        );
        assert_eq!(Metric::Unknown("HAMMING".into()).as_str(), "HAMMING");
    }

    #[test]
    fn test_parse_flat_array() {
        let body = r#"{"code":0,"data":[{"id":"1","block_uid":"b1","distance":0.2},{"id":"2","distance":0.4}]}"#;
        let hits = parse_hits(body, None).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].target(), "b1");
        assert_eq!(hits[0].distance, Some(0.2));
        assert_eq!(hits[1].target(), "2");
        assert_eq!(hits[1].block_uid, None);
    }

    #[test]
    fn test_parse_nested_results() {
        let body = r#"{"data":{"results":[{"id":7,"score":0.9}]}}"#;
        let hits = parse_hits(body, None).unwrap();
        assert_eq!(hits[0].id, "7");
        assert_eq!(hits[0].score, Some(0.9));

        let body = r#"{"data":[{"results":[{"id":"x","distance":0.1}]}]}"#;
        assert_eq!(parse_hits(body, None).unwrap()[0].id, "x");

        let body = r#"{"data":[[{"id":"y","distance":0.1}]]}"#;
        assert_eq!(parse_hits(body, None).unwrap()[0].id, "y");
    }

    #[test]
    fn test_parse_rows_and_entities() {
        let body = r#"{"data":{"rows":[{"entity":{"id":"1","block_uid":"b9"},"distance":0.3}]}}"#;
        let hits = parse_hits(body, None).unwrap();
        assert_eq!(hits[0].target(), "b9");

        let body = r#"{"data":{"entities":[{"fields":{"block_uid":"b4"},"score":0.5}]}}"#;
        let hits = parse_hits(body, None).unwrap();
        assert_eq!(hits[0].id, "b4");
        assert_eq!(hits[0].target(), "b4");
    }

    #[test]
    fn test_parse_skips_rows_without_ids() {
        let body = r#"{"data":[{"distance":0.1},{"id":"ok","distance":0.2}]}"#;
        let hits = parse_hits(body, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "ok");
    }

    #[test]
    fn test_parse_api_error_code() {
        let body = r#"{"code":1100,"message":"collection not found"}"#;
        let err = parse_hits(body, None).unwrap_err();
        assert_eq!(
            err,
            ProviderError::Api {
                service: "vector",
                code: 1100,
                message: "collection not found".to_string()
            }
        );
    }

    #[test]
    fn test_parse_unknown_envelope() {
        let err = parse_hits(r#"{"code":0,"data":{"hits":[]}}"#, None).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse { .. }));
    }

    #[test]
    fn test_request_payload_shape() {
        let store = RestVectorStore::new("https://example.zilliz", "sermon_blocks", None);
        let vector = vec![0.5f32, 0.25];
        let request = SearchRequest {
            collection_name: &store.collection,
            data: [vector.as_slice()],
            limit: 5,
            output_fields: ["id", "block_uid"],
            search_params: SearchParams {
                anns_field: &store.vector_field,
                metric_type: store.metric.as_str(),
                params: json!({ "nprobe": store.nprobe, "ef": store.ef_for(5) }),
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["collectionName"], "sermon_blocks");
        assert_eq!(value["data"][0][1], 0.25);
        assert_eq!(value["outputFields"][1], "block_uid");
        assert_eq!(value["searchParams"]["metricType"], "COSINE");
        assert_eq!(value["searchParams"]["params"]["ef"], 10);
        assert_eq!(value["searchParams"]["params"]["nprobe"], 64);
    }

    #[test]
    fn test_ef_is_capped() {
        let store = RestVectorStore::new("u", "c", None).with_search_params(16, 100);
        assert_eq!(store.ef_for(10), 20);
        assert_eq!(store.ef_for(80), 100);
        assert_eq!(store.ef_for(500), 500);
    }

    #[tokio::test]
    async fn test_missing_key_fails_fast() {
        let store = RestVectorStore::new("http://127.0.0.1:9", "c", None);
        let err = store
            .search(&AnnQuery { vector: vec![1.0], limit: 3 })
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }
}
