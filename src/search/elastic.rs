//! Elasticsearch-compatible index client over HTTP/JSON.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{SearchBackend, SearchDocument, SearchHit, TRANSCRIPT_TERM_FIELD};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ElasticConfig {
    pub url: String,
    /// HTTP basic auth
    pub credentials: Option<(String, String)>,
    /// Extra attempts after a connection-level failure
    pub max_retries: usize,
    pub max_idle: usize,
    pub max_active: usize,
    pub request_timeout: Duration,
    /// Hits requested per term query. Elasticsearch answers 10 when unset;
    /// 10 000 is its default `index.max_result_window`.
    pub max_hits: usize,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:9200".into(),
            credentials: None,
            max_retries: 10,
            max_idle: 80,
            max_active: 12_000,
            request_timeout: Duration::from_secs(30),
            max_hits: 10_000,
        }
    }
}

#[derive(Clone)]
pub struct ElasticClient {
    http: Client,
    base: Url,
    credentials: Option<(String, String)>,
    max_retries: usize,
    max_hits: usize,
    permits: Arc<Semaphore>,
}

#[derive(Deserialize)]
struct GetResponse {
    #[serde(default)]
    found: bool,
    #[serde(rename = "_source")]
    source: Option<SearchDocument>,
}

#[derive(Deserialize)]
struct SearchResponse {
    hits: HitsEnvelope,
}

#[derive(Deserialize)]
struct HitsEnvelope {
    #[serde(default)]
    total: Option<TotalHits>,
    #[serde(default)]
    hits: Vec<RawHit>,
}

#[derive(Deserialize)]
struct TotalHits {
    value: u64,
}

#[derive(Deserialize)]
struct RawHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_score", default)]
    score: Option<f64>,
    #[serde(rename = "_source")]
    source: SearchDocument,
}

#[derive(Deserialize)]
struct InfoResponse {
    version: VersionInfo,
}

#[derive(Deserialize)]
struct VersionInfo {
    number: String,
}

impl ElasticClient {
    /// Builds the client. Nothing is contacted until the first call.
    pub fn new(config: ElasticConfig) -> Result<Self> {
        let base = Url::parse(&config.url)
            .map_err(|e| Error::Config(format!("invalid index url {:?}: {}", config.url, e)))?;
        if base.cannot_be_a_base() {
            return Err(Error::Config(format!("index url {:?} cannot be a base", config.url)));
        }
        let http = Client::builder()
            .pool_max_idle_per_host(config.max_idle)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("cannot build index http client: {}", e)))?;

        Ok(Self {
            http,
            base,
            credentials: config.credentials,
            max_retries: config.max_retries,
            max_hits: config.max_hits.max(1),
            permits: Arc::new(Semaphore::new(config.max_active.max(1))),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| Error::Config("index url cannot be a base".into()))?;
            path.pop_if_empty();
            path.extend(segments);
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let req = self.http.request(method, url);
        match &self.credentials {
            Some((user, pass)) => req.basic_auth(user, Some(pass)),
            None => req,
        }
    }

    /// Sends the request built by `build`, retrying connection failures.
    async fn send<F>(&self, what: &str, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Index("index client is closed".into()))?;

        let mut attempt = 0;
        loop {
            match build().send().await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_connect() && attempt < self.max_retries => {
                    attempt += 1;
                    debug!("{}: connection failed (attempt {}): {}", what, attempt, e);
                }
                Err(e) => return Err(Error::Index(format!("{}: {}", what, e))),
            }
        }
    }
}

async fn failure(what: &str, resp: Response) -> Error {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Error::Index(format!("{} returned {}: {}", what, status, body))
}

async fn read_json<T: for<'de> Deserialize<'de>>(what: &str, resp: Response) -> Result<T> {
    resp.json::<T>()
        .await
        .map_err(|e| Error::Index(format!("{}: unreadable response: {}", what, e)))
}

/// Index mapping that keeps transcript tokens unanalysed, so a term query
/// matches them exactly.
fn collection_mapping() -> Value {
    json!({
        "mappings": {
            "properties": {
                "transcript": {
                    "properties": {
                        "words": {
                            "properties": {
                                "token": { "type": "keyword" }
                            }
                        }
                    }
                }
            }
        }
    })
}

fn term_body(field: &str, term: &str, size: usize) -> Value {
    let mut clause = Map::new();
    clause.insert(field.to_string(), Value::String(term.to_string()));
    json!({
        "query": { "term": Value::Object(clause) },
        "size": size,
        "track_total_hits": true,
    })
}

impl SearchBackend for ElasticClient {
    async fn ensure_collection(&self, collection: &str) -> Result<()> {
        let url = self.url(&[collection])?;
        let resp = self
            .send("collection check", || self.request(Method::HEAD, url.clone()))
            .await?;
        match resp.status() {
            s if s.is_success() => return Ok(()),
            StatusCode::NOT_FOUND => {}
            _ => return Err(failure("collection check", resp).await),
        }

        let body = collection_mapping();
        let resp = self
            .send("collection create", || self.request(Method::PUT, url.clone()).json(&body))
            .await?;
        if resp.status().is_success() {
            info!("Created index collection {:?}", collection);
            return Ok(());
        }
        // Lost a creation race with another writer
        let err = failure("collection create", resp).await;
        if err.to_string().contains("resource_already_exists_exception") {
            Ok(())
        } else {
            Err(err)
        }
    }

    async fn upsert(&self, collection: &str, id: &str, doc: &SearchDocument) -> Result<()> {
        let mut url = self.url(&[collection, "_doc", id])?;
        url.query_pairs_mut().append_pair("refresh", "wait_for");

        let resp = self
            .send("upsert", || self.request(Method::PUT, url.clone()).json(doc))
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(failure("upsert", resp).await)
        }
    }

    async fn fetch(&self, collection: &str, id: &str) -> Result<Option<SearchDocument>> {
        let url = self.url(&[collection, "_doc", id])?;
        let resp = self.send("fetch", || self.request(Method::GET, url.clone())).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let body: GetResponse = read_json("fetch", resp).await?;
                Ok(if body.found { body.source } else { None })
            }
            _ => Err(failure("fetch", resp).await),
        }
    }

    async fn term_query(&self, collection: &str, field: &str, term: &str) -> Result<Vec<SearchHit>> {
        let url = self.url(&[collection, "_search"])?;
        let body = term_body(field, term, self.max_hits);
        let resp = self
            .send("search", || self.request(Method::POST, url.clone()).json(&body))
            .await?;

        match resp.status() {
            // Nothing indexed yet
            StatusCode::NOT_FOUND => {
                warn!("Search against missing collection {:?}", collection);
                Ok(Vec::new())
            }
            s if s.is_success() => {
                let body: SearchResponse = read_json("search", resp).await?;
                if let Some(total) = &body.hits.total {
                    if total.value > body.hits.hits.len() as u64 {
                        warn!(
                            "Term {:?} matched {} documents, returning the first {}",
                            term,
                            total.value,
                            body.hits.hits.len()
                        );
                    }
                }
                Ok(body
                    .hits
                    .hits
                    .into_iter()
                    .map(|h| SearchHit { id: h.id, score: h.score.unwrap_or(0.0), document: h.source })
                    .collect())
            }
            _ => Err(failure("search", resp).await),
        }
    }

    async fn version(&self) -> Result<String> {
        let url = self.url(&[])?;
        let resp = self.send("version", || self.request(Method::GET, url.clone())).await?;
        if !resp.status().is_success() {
            return Err(failure("version", resp).await);
        }
        let info: InfoResponse = read_json("version", resp).await?;
        Ok(info.version.number)
    }
}

impl std::fmt::Debug for ElasticClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElasticClient")
            .field("base", &self.base.as_str())
            .field("term_field", &TRANSCRIPT_TERM_FIELD)
            .finish_non_exhaustive()
    }
}
