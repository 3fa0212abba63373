//! Record Store Client: pooled, timeout-bounded access to the record store.

use std::time::Duration;

use chrono::Utc;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::codec;
use crate::config::StoreCredentials;
use crate::error::{with_timeout, Error, Result};
use crate::model::{hash_key, video_key, Video};
use crate::pool::{ManageConnection, Pool, PoolConfig, PoolState, PooledConnection};
use crate::protocol::{self, Reply, OP_AUTH, OP_COMPACT, OP_GET, OP_PING, OP_SET};

#[derive(Debug, Clone)]
pub struct StoreClientConfig {
    pub addr: String,
    pub credentials: Option<StoreCredentials>,
    pub pool: PoolConfig,
    pub op_timeout: Duration,
}

impl Default for StoreClientConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:6380".into(),
            credentials: None,
            pool: PoolConfig::default(),
            op_timeout: Duration::from_secs(5),
        }
    }
}

/// One TCP connection to the record store.
pub struct StoreConnection {
    stream: BufReader<TcpStream>,
}

impl StoreConnection {
    async fn call(&mut self, op: u8, payload: &[u8]) -> Result<Reply> {
        protocol::write_frame(self.stream.get_mut(), op, payload)
            .await
            .map_err(|e| Error::Store(format!("write failed: {}", e)))?;
        protocol::read_reply(&mut self.stream)
            .await
            .map_err(|e| Error::Store(format!("read failed: {}", e)))
    }
}

/// Dials the store and logs in when credentials are configured.
pub struct StoreConnector {
    addr: String,
    credentials: Option<StoreCredentials>,
}

impl ManageConnection for StoreConnector {
    type Connection = StoreConnection;

    async fn connect(&self) -> Result<StoreConnection> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| Error::Store(format!("cannot reach store at {}: {}", self.addr, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::Store(e.to_string()))?;
        let mut conn = StoreConnection { stream: BufReader::new(stream) };

        if let Some(creds) = &self.credentials {
            let payload = protocol::encode_auth(&creds.user, &creds.pass)
                .map_err(|e| Error::Store(e.to_string()))?;
            match conn.call(OP_AUTH, &payload).await? {
                Reply::Ok => {}
                Reply::Error(msg) => return Err(Error::Store(format!("store login failed: {}", msg))),
                other => return Err(Error::Store(format!("unexpected AUTH reply {:?}", other))),
            }
        }
        debug!("Opened store connection to {}", self.addr);
        Ok(conn)
    }
}

/// Cheap to clone; clones share one pool.
#[derive(Clone)]
pub struct StoreClient {
    pool: Pool<StoreConnector>,
    op_timeout: Duration,
}

impl StoreClient {
    /// Builds the client. No connection is opened until the first operation.
    pub fn new(config: StoreClientConfig) -> Self {
        let connector = StoreConnector { addr: config.addr, credentials: config.credentials };
        Self {
            pool: Pool::new(connector, config.pool),
            op_timeout: config.op_timeout,
        }
    }

    /// Writes the full record under `video:{url}` (overwriting any previous
    /// value) together with its `hash:{hash}` alias when it has a hash.
    /// `timestamp` is set to now.
    pub async fn put(&self, video: &Video) -> Result<()> {
        video.validate()?;
        let mut stamped = video.clone();
        stamped.timestamp = Utc::now();
        let bytes = codec::encode(&stamped)?;

        let mut pairs = vec![(video_key(&stamped.url), bytes)];
        if !stamped.hash.is_empty() {
            pairs.push((hash_key(&stamped.hash), stamped.url.clone().into_bytes()));
        }
        let payload = protocol::encode_batch(&pairs).map_err(|e| Error::Validation(e.to_string()))?;

        match self.exchange("put", OP_SET, &payload).await? {
            Reply::Ok => Ok(()),
            other => Err(unexpected("put", other)),
        }
    }

    /// Raw encoded record for `url`.
    pub async fn get(&self, url: &str) -> Result<Vec<u8>> {
        self.fetch("get", &video_key(url))
            .await?
            .ok_or_else(|| Error::NotFound(format!("no video stored for url {:?}", url)))
    }

    pub async fn get_video(&self, url: &str) -> Result<Video> {
        let bytes = self.get(url).await?;
        codec::decode(&bytes)
    }

    /// Url of the record last written with `hash`.
    pub async fn resolve_hash(&self, hash: &str) -> Result<String> {
        let bytes = self
            .fetch("resolve_hash", &hash_key(hash))
            .await?
            .ok_or_else(|| Error::NotFound(format!("no video stored for hash {:?}", hash)))?;
        String::from_utf8(bytes).map_err(|_| Error::Decode(format!("alias for {:?} is not utf-8", hash)))
    }

    pub async fn ping(&self) -> Result<()> {
        match self.exchange("ping", OP_PING, &[]).await? {
            Reply::Ok => Ok(()),
            other => Err(unexpected("ping", other)),
        }
    }

    /// Asks the server to compact its segment.
    pub async fn compact(&self) -> Result<()> {
        match self.exchange("compact", OP_COMPACT, &[]).await? {
            Reply::Ok => Ok(()),
            other => Err(unexpected("compact", other)),
        }
    }

    pub fn pool_state(&self) -> PoolState {
        self.pool.state()
    }

    /// Drops idle connections and refuses further operations.
    pub fn close(&self) {
        self.pool.close();
    }

    async fn fetch(&self, op: &'static str, key: &str) -> Result<Option<Vec<u8>>> {
        match self.exchange(op, OP_GET, key.as_bytes()).await? {
            Reply::Value(bytes) => Ok(Some(bytes)),
            Reply::NotFound => Ok(None),
            other => Err(unexpected(op, other)),
        }
    }

    /// One request/response on a pooled connection, bounded by `op_timeout`.
    async fn exchange(&self, op: &'static str, code: u8, payload: &[u8]) -> Result<Reply> {
        with_timeout(op, self.op_timeout, async {
            let mut conn: PooledConnection<StoreConnector> = self.pool.get().await?;
            let reply = conn.call(code, payload).await;
            match &reply {
                // A server-side error reply still leaves the stream in sync
                Ok(_) => conn.mark_reusable(),
                Err(e) => {
                    warn!("Store {} failed, discarding connection: {}", op, e);
                    conn.mark_broken();
                }
            }
            reply
        })
        .await
    }
}

fn unexpected(op: &str, reply: Reply) -> Error {
    match reply {
        Reply::Error(msg) => Error::Store(format!("{} rejected: {}", op, msg)),
        other => Error::Store(format!("{}: unexpected reply {:?}", op, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Transcript, Word};
    use crate::server::StoreServer;
    use crate::StoreEngine;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn start(credentials: Option<StoreCredentials>) -> (String, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(StoreEngine::open(&dir.path().join("store.dat"), false).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(StoreServer::new(engine, credentials).serve(listener));
        (addr, dir)
    }

    fn client(addr: &str) -> StoreClient {
        StoreClient::new(StoreClientConfig {
            addr: addr.to_string(),
            pool: PoolConfig { max_idle: 2, max_active: 8 },
            op_timeout: Duration::from_secs(2),
            ..Default::default()
        })
    }

    fn sample() -> Video {
        Video::new("abc", "h1", "Test").with_transcript(Transcript::new(vec![
            Word::new("hello", 0.0, 0.4, 0.9),
            Word::new("world", 0.5, 0.9, 0.8),
        ]))
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let (addr, _dir) = start(None).await;
        let store = client(&addr);
        let before = Utc::now();

        store.put(&sample()).await.unwrap();
        let got = store.get_video("abc").await.unwrap();

        assert_eq!(got.title, "Test");
        assert_eq!(got.transcript, sample().transcript);
        assert!(got.timestamp >= before);
        assert_eq!(store.resolve_hash("h1").await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn second_put_overwrites_everything() {
        let (addr, _dir) = start(None).await;
        let store = client(&addr);

        let mut first = sample();
        first.like("alice");
        store.put(&first).await.unwrap();

        let second = Video::new("abc", "h1", "Renamed");
        store.put(&second).await.unwrap();

        let got = store.get_video("abc").await.unwrap();
        assert_eq!(got.title, "Renamed");
        assert!(got.likes.is_empty());
        assert!(got.transcript.is_empty());
    }

    #[tokio::test]
    async fn cdn_urls_round_trip() {
        let (addr, _dir) = start(None).await;
        let store = client(&addr);
        let url = "https://amazoncdn.com/bucketname/videotitle.webm";

        store.put(&Video::new(url, "a1b2c3d4-e5f6g7h8", "Sample Title")).await.unwrap();
        assert_eq!(store.get_video(url).await.unwrap().title, "Sample Title");
        assert_eq!(store.resolve_hash("a1b2c3d4-e5f6g7h8").await.unwrap(), url);
    }

    #[tokio::test]
    async fn missing_url_is_not_found() {
        let (addr, _dir) = start(None).await;
        let store = client(&addr);
        assert!(store.get("nope").await.unwrap_err().is_not_found());
        assert!(store.resolve_hash("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn invalid_record_never_reaches_the_store() {
        let (addr, _dir) = start(None).await;
        let store = client(&addr);
        let err = store.put(&Video::new("", "h1", "t")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(store.pool_state().active, 0);
    }

    #[tokio::test]
    async fn unreachable_store_is_store_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = client(&addr).ping().await.unwrap_err();
        assert!(matches!(err, Error::Store(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn silent_store_times_out() {
        // Accepts but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let store = StoreClient::new(StoreClientConfig {
            addr,
            op_timeout: Duration::from_millis(100),
            ..Default::default()
        });
        let err = store.get("abc").await.unwrap_err();
        assert!(matches!(err, Error::Timeout { op: "get", .. }), "got {:?}", err);
        assert_eq!(store.pool_state(), PoolState { idle: 0, active: 0 });
    }

    #[tokio::test]
    async fn connections_are_reused_after_success() {
        let (addr, _dir) = start(None).await;
        let store = client(&addr);
        store.ping().await.unwrap();
        store.ping().await.unwrap();
        assert_eq!(store.pool_state(), PoolState { idle: 1, active: 0 });
    }

    #[tokio::test]
    async fn authenticated_store() {
        let creds = StoreCredentials { user: "u".into(), pass: "p".into() };
        let (addr, _dir) = start(Some(creds.clone())).await;

        let good = StoreClient::new(StoreClientConfig {
            addr: addr.clone(),
            credentials: Some(creds),
            ..Default::default()
        });
        good.put(&sample()).await.unwrap();

        let bad = StoreClient::new(StoreClientConfig {
            addr,
            credentials: Some(StoreCredentials { user: "u".into(), pass: "wrong".into() }),
            ..Default::default()
        });
        assert!(matches!(bad.get("abc").await, Err(Error::Store(_))));
    }

    #[tokio::test]
    async fn closed_client_refuses_work() {
        let (addr, _dir) = start(None).await;
        let store = client(&addr);
        store.ping().await.unwrap();
        store.close();
        assert!(matches!(store.ping().await, Err(Error::Store(_))));
    }
}
