//! HTTP boundary. Every error is turned into a status code and a JSON body
//! here; nothing below this layer decides what the caller sees.

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::client::StoreClient;
use crate::error::{Error, Result};
use crate::indexer::{Indexer, SyncQueue};
use crate::model::{Transcript, Video};
use crate::query::QueryExecutor;
use crate::search::SearchBackend;

/// Upper bound for form bodies (transcripts can be long).
const MAX_FORM_BYTES: u64 = 8 * 1024 * 1024;

/// Everything a request handler can reach. Cheap to clone.
pub struct AppState<B> {
    pub store: StoreClient,
    pub indexer: Arc<Indexer<B>>,
    pub query: Arc<QueryExecutor<B>>,
    pub converter: Option<Arc<Converter>>,
    pub sync_queue: Option<SyncQueue>,
}

impl<B> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            indexer: self.indexer.clone(),
            query: self.query.clone(),
            converter: self.converter.clone(),
            sync_queue: self.sync_queue.clone(),
        }
    }
}

impl<B: SearchBackend> AppState<B> {
    pub fn new(store: StoreClient, backend: Arc<B>, timeout: Duration) -> Self {
        Self {
            indexer: Arc::new(Indexer::new(store.clone(), backend.clone(), timeout)),
            query: Arc::new(QueryExecutor::new(backend, timeout)),
            store,
            converter: None,
            sync_queue: None,
        }
    }

    pub fn with_converter(mut self, converter: Converter) -> Self {
        self.converter = Some(Arc::new(converter));
        self
    }

    pub fn with_sync_queue(mut self, queue: SyncQueue) -> Self {
        self.sync_queue = Some(queue);
        self
    }
}

/// Runs an external media converter (`<program> -i <url> <dest>.mp3`).
#[derive(Debug, Clone)]
pub struct Converter {
    program: String,
    output_dir: PathBuf,
}

impl Converter {
    pub fn new(program: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), output_dir: output_dir.into() }
    }

    /// Converts `url` and returns the name of the produced file.
    pub async fn convert(&self, url: &str) -> Result<String> {
        let name = audio_name(url)?;
        let dest = self.output_dir.join(&name);
        let output = tokio::process::Command::new(&self.program)
            .arg("-i")
            .arg(url)
            .arg(&dest)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Process(format!("cannot run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Process(format!("{} exited with {}: {}", self.program, output.status, stderr.trim())));
        }
        info!("Converted {} into {}", url, dest.display());
        Ok(name)
    }
}

/// `https://cdn/bucket/clip.webm` becomes `clip.mp3`.
fn audio_name(url: &str) -> Result<String> {
    let last = url.trim_end_matches('/').rsplit('/').next().unwrap_or("");
    let stem = Path::new(last)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Validation(format!("cannot derive a file name from {:?}", url)))?;
    Ok(format!("{}.mp3", stem))
}

/// Form body of `POST /api/videos`. Lists are comma separated, the
/// transcript is JSON.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(default)]
pub struct VideoForm {
    pub title: String,
    pub url: String,
    pub hash: String,
    pub creator: String,
    pub private: Option<String>,
    pub views: Option<String>,
    pub likes: String,
    pub dislikes: String,
    pub comments: String,
    pub transcript: String,
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

impl From<&Video> for VideoForm {
    fn from(v: &Video) -> Self {
        let join = |items: Vec<String>| items.join(",");
        Self {
            title: v.title.clone(),
            url: v.url.clone(),
            hash: v.hash.clone(),
            creator: v.creator.clone(),
            private: Some(v.private.to_string()),
            views: Some(v.views.to_string()),
            likes: join(v.likes.iter().cloned().collect()),
            dislikes: join(v.dislikes.iter().cloned().collect()),
            comments: join(v.comments.iter().map(|c| c.to_string()).collect()),
            transcript: serde_json::to_string(&v.transcript).unwrap_or_default(),
        }
    }
}

impl VideoForm {
    pub fn into_video(self) -> Result<Video> {
        let private = match self.private.as_deref().map(str::trim) {
            None | Some("") => false,
            Some("true") | Some("1") | Some("on") => true,
            Some("false") | Some("0") | Some("off") => false,
            Some(other) => return Err(Error::Validation(format!("private must be a boolean, got {:?}", other))),
        };
        let views = match self.views.as_deref().map(str::trim) {
            None | Some("") => 0,
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::Validation(format!("views must be a count, got {:?}", raw)))?,
        };
        let comments = split_list(&self.comments)
            .map(|c| c.parse().map_err(|_| Error::Validation(format!("comment id {:?} is not a number", c))))
            .collect::<Result<Vec<i64>>>()?;
        let transcript = if self.transcript.trim().is_empty() {
            Transcript::default()
        } else {
            serde_json::from_str(&self.transcript)
                .map_err(|e| Error::Validation(format!("transcript is not valid JSON: {}", e)))?
        };

        Ok(Video {
            title: self.title,
            url: self.url,
            hash: self.hash,
            creator: self.creator,
            private,
            views,
            likes: split_list(&self.likes).map(String::from).collect(),
            dislikes: split_list(&self.dislikes).map(String::from).collect(),
            comments,
            transcript,
            ..Default::default()
        })
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct SearchParams {
    pub q: String,
}

#[derive(Deserialize, Debug)]
pub struct ConvertForm {
    pub url: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

/// Status code each error kind is reported with.
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::MalformedQuery(_) => StatusCode::BAD_REQUEST,
        Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        Error::Index(_) | Error::Query(_) | Error::Process(_) => StatusCode::BAD_GATEWAY,
        Error::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Decode(_) | Error::Validation(_) | Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_reply(err: &Error) -> Response {
    let status = status_for(err);
    if status.is_server_error() {
        warn!("Request failed ({}): {}", status, err);
    }
    let body = ErrorBody { error: err.kind(), message: err.to_string() };
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

fn respond<T: Reply>(result: Result<T>) -> std::result::Result<Response, Rejection> {
    Ok(match result {
        Ok(reply) => reply.into_response(),
        Err(e) => error_reply(&e),
    })
}

fn ok_status() -> warp::reply::Json {
    warp::reply::json(&json!({ "status": "OK" }))
}

fn decode_segment(raw: &str) -> Result<String> {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .map_err(|_| Error::NotFound(format!("path segment {:?} is not valid utf-8", raw)))
}

fn with_state<B: SearchBackend>(
    state: AppState<B>,
) -> impl Filter<Extract = (AppState<B>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

// --- Handlers ---

async fn create_video<B: SearchBackend>(form: VideoForm, state: AppState<B>) -> std::result::Result<Response, Rejection> {
    let result = async {
        let video = form.into_video()?;
        state.store.put(&video).await?;
        // Without a hash there is nothing to index yet
        if let Some(queue) = state.sync_queue.as_ref().filter(|_| !video.hash.is_empty()) {
            // The write already succeeded; indexing can be retried by hand
            if let Err(e) = queue.enqueue(&video.hash) {
                warn!("Could not queue sync for {}: {}", video.hash, e);
            }
        }
        Ok::<_, Error>(ok_status())
    }
    .await;
    respond(result)
}

async fn get_video<B: SearchBackend>(raw_url: String, state: AppState<B>) -> std::result::Result<Response, Rejection> {
    let result = async {
        let url = decode_segment(&raw_url)?;
        let bytes = state.store.get(&url).await?;
        Ok::<_, Error>(warp::reply::with_header(bytes, "content-type", "application/json"))
    }
    .await;
    respond(result)
}

async fn convert_video<B: SearchBackend>(form: ConvertForm, state: AppState<B>) -> std::result::Result<Response, Rejection> {
    let result = async {
        let converter = state
            .converter
            .as_ref()
            .ok_or_else(|| Error::Process("no media converter configured".into()))?;
        let output = converter.convert(&form.url).await?;
        Ok::<_, Error>(warp::reply::json(&json!({ "output": output })))
    }
    .await;
    respond(result)
}

async fn sync_index<B: SearchBackend>(raw_hash: String, state: AppState<B>) -> std::result::Result<Response, Rejection> {
    let result = async {
        let hash = decode_segment(&raw_hash)?;
        state.indexer.sync(&hash).await?;
        Ok::<_, Error>(ok_status())
    }
    .await;
    respond(result)
}

async fn get_document<B: SearchBackend>(raw_hash: String, state: AppState<B>) -> std::result::Result<Response, Rejection> {
    let result = async {
        let hash = decode_segment(&raw_hash)?;
        let doc = state.indexer.document(&hash).await?;
        Ok::<_, Error>(warp::reply::json(&doc))
    }
    .await;
    respond(result)
}

async fn search<B: SearchBackend>(params: SearchParams, state: AppState<B>) -> std::result::Result<Response, Rejection> {
    let result = state
        .query
        .search(&params.q)
        .await
        .map(|ids| warp::reply::json(&json!({ "ids": ids })));
    respond(result)
}

async fn index_version<B: SearchBackend>(state: AppState<B>) -> std::result::Result<Response, Rejection> {
    let result = state
        .indexer
        .backend()
        .version()
        .await
        .map_err(|e| match e {
            Error::Index(msg) => Error::Query(msg),
            other => other,
        })
        .map(|version| warp::reply::json(&json!({ "version": version })));
    respond(result)
}

fn sign_not_implemented() -> Response {
    let body = ErrorBody { error: "NotImplemented", message: "upload signing is not provided by this service".into() };
    warp::reply::with_status(warp::reply::json(&body), StatusCode::NOT_IMPLEMENTED).into_response()
}

fn sign_preflight() -> Response {
    let reply = warp::reply::with_header(warp::reply(), "access-control-allow-origin", "*");
    let reply = warp::reply::with_header(reply, "access-control-allow-methods", "POST, OPTIONS");
    warp::reply::with_header(reply, "access-control-allow-headers", "Content-Type").into_response()
}

/// Turns warp's own rejections (bad route, bad body) into the same JSON
/// error shape the handlers use.
async fn handle_rejection(err: Rejection) -> std::result::Result<Response, Infallible> {
    let (status, kind, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "NotFound", "no such route".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, "ValidationError", e.to_string())
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, "QueryError", e.to_string())
    } else if let Some(e) = err.find::<warp::reject::LengthRequired>() {
        (StatusCode::LENGTH_REQUIRED, "ValidationError", e.to_string())
    } else if let Some(e) = err.find::<warp::reject::PayloadTooLarge>() {
        (StatusCode::PAYLOAD_TOO_LARGE, "ValidationError", e.to_string())
    } else if let Some(e) = err.find::<warp::reject::UnsupportedMediaType>() {
        (StatusCode::UNSUPPORTED_MEDIA_TYPE, "ValidationError", e.to_string())
    } else if let Some(e) = err.find::<warp::reject::MethodNotAllowed>() {
        (StatusCode::METHOD_NOT_ALLOWED, "NotFound", e.to_string())
    } else {
        warn!("Unhandled rejection: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal", "unhandled rejection".to_string())
    };
    let body = ErrorBody { error: kind, message };
    Ok(warp::reply::with_status(warp::reply::json(&body), status).into_response())
}

/// All routes, with rejection recovery and request logging.
pub fn routes<B: SearchBackend>(
    state: AppState<B>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    // 1. GET /api/isalive
    let is_alive = warp::get()
        .and(warp::path!("api" / "isalive"))
        .map(|| "I'm Alive");

    // 2. POST /api/videos
    let create = warp::post()
        .and(warp::path!("api" / "videos"))
        .and(warp::body::content_length_limit(MAX_FORM_BYTES))
        .and(warp::body::form())
        .and(with_state(state.clone()))
        .and_then(create_video::<B>);

    // 3. POST/OPTIONS /api/videos/sign
    let sign = warp::post().and(warp::path!("api" / "videos" / "sign")).map(sign_not_implemented);
    let sign_options = warp::options().and(warp::path!("api" / "videos" / "sign")).map(sign_preflight);

    // 4. POST /api/videos/process
    let process = warp::post()
        .and(warp::path!("api" / "videos" / "process"))
        .and(warp::body::content_length_limit(MAX_FORM_BYTES))
        .and(warp::body::form())
        .and(with_state(state.clone()))
        .and_then(convert_video::<B>);

    // 5. GET /api/videos/{url}
    let read = warp::get()
        .and(warp::path!("api" / "videos" / String))
        .and(with_state(state.clone()))
        .and_then(get_video::<B>);

    // 6. POST + GET /api/index/{hash}
    let sync = warp::post()
        .and(warp::path!("api" / "index" / String))
        .and(with_state(state.clone()))
        .and_then(sync_index::<B>);
    let document = warp::get()
        .and(warp::path!("api" / "index" / String))
        .and(with_state(state.clone()))
        .and_then(get_document::<B>);

    // 7. GET /api/search?q=term
    let query = warp::get()
        .and(warp::path!("api" / "search"))
        .and(warp::query::<SearchParams>())
        .and(with_state(state.clone()))
        .and_then(search::<B>);

    // 8. GET /api/version
    let version = warp::get()
        .and(warp::path!("api" / "version"))
        .and(with_state(state))
        .and_then(index_version::<B>);

    is_alive
        .or(create)
        .or(sign)
        .or(sign_options)
        .or(process)
        .or(read)
        .or(sync)
        .or(document)
        .or(query)
        .or(version)
        .recover(handle_rejection)
        .with(warp::log::custom(|info| {
            info!("{} {} -> {} in {:?}", info.method(), info.path(), info.status().as_u16(), info.elapsed());
        }))
}
