use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpListener;
use vidsearch::client::{StoreClient, StoreClientConfig};
use vidsearch::codec;
use vidsearch::indexer::{Indexer, COLLECTION};
use vidsearch::model::{hash_key, video_key, Transcript, Video, Word};
use vidsearch::pool::PoolConfig;
use vidsearch::query::QueryExecutor;
use vidsearch::search::{MemoryIndex, SearchBackend};
use vidsearch::server::StoreServer;
use vidsearch::StoreEngine;

struct Pipeline {
    store: StoreClient,
    indexer: Indexer<MemoryIndex>,
    query: QueryExecutor<MemoryIndex>,
    index: Arc<MemoryIndex>,
    engine: Arc<StoreEngine>,
    _dir: tempfile::TempDir,
}

async fn pipeline() -> Pipeline {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(StoreEngine::open(&dir.path().join("videos.dat"), false).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(StoreServer::new(engine.clone(), None).serve(listener));

    let store = StoreClient::new(StoreClientConfig {
        addr,
        pool: PoolConfig { max_idle: 4, max_active: 16 },
        op_timeout: Duration::from_secs(5),
        ..Default::default()
    });
    let index = Arc::new(MemoryIndex::new());
    Pipeline {
        indexer: Indexer::new(store.clone(), index.clone(), Duration::from_secs(5)),
        query: QueryExecutor::new(index.clone(), Duration::from_secs(5)),
        store,
        index,
        engine,
        _dir: dir,
    }
}

fn transcript(words: &[&str]) -> Transcript {
    Transcript::new(
        words
            .iter()
            .enumerate()
            .map(|(i, t)| Word::new(*t, i as f64 * 0.4, i as f64 * 0.4 + 0.3, 0.95))
            .collect(),
    )
}

#[tokio::test]
async fn scenario_a_put_then_get() {
    let p = pipeline().await;
    let before = Utc::now();

    let mut v = Video::default();
    v.url = "abc".into();
    v.title = "Test".into();
    p.store.put(&v).await.unwrap();

    let got = codec::decode(&p.store.get("abc").await.unwrap()).unwrap();
    assert_eq!(got.title, "Test");
    let skew = got.timestamp.signed_duration_since(before).num_milliseconds();
    assert!((0..5_000).contains(&skew), "timestamp off by {}ms", skew);
}

#[tokio::test]
async fn scenario_b_sync_then_search() {
    let p = pipeline().await;
    p.store
        .put(&Video::new("abc", "h1", "Greeting").with_transcript(transcript(&["hello", "there"])))
        .await
        .unwrap();

    p.indexer.sync("h1").await.unwrap();
    assert!(p.query.search("hello").await.unwrap().contains(&"h1".to_string()));
}

#[tokio::test]
async fn scenario_c_sync_of_unknown_hash() {
    let p = pipeline().await;
    let err = p.indexer.sync("h-missing").await.unwrap_err();
    assert!(err.is_not_found(), "got {:?}", err);
    assert_eq!(p.index.len(COLLECTION), 0);
    assert_eq!(p.index.fetch(COLLECTION, "h-missing").await.unwrap(), None);
}

#[tokio::test]
async fn round_trip_keeps_every_field_but_timestamp() {
    let p = pipeline().await;
    let mut v = Video::new("clip-1", "h1", "Round trip").with_transcript(transcript(&["a", "b", "c"]));
    v.creator = "dana".into();
    v.private = true;
    v.views = 1_234;
    v.comments = vec![5, -1, 9];
    v.like("alice");
    v.like("bob");
    v.dislike("carol");

    p.store.put(&v).await.unwrap();
    let mut got = p.store.get_video("clip-1").await.unwrap();
    assert_ne!(got.timestamp, v.timestamp);
    got.timestamp = v.timestamp;
    assert_eq!(got, v);
}

#[tokio::test]
async fn upsert_overwrites_without_merging() {
    let p = pipeline().await;
    let mut v1 = Video::new("abc", "h1", "First").with_transcript(transcript(&["one"]));
    v1.views = 10;
    v1.like("alice");
    v1.comments = vec![1];
    p.store.put(&v1).await.unwrap();

    let v2 = Video::new("abc", "h1", "Second");
    p.store.put(&v2).await.unwrap();

    let mut got = p.store.get_video("abc").await.unwrap();
    got.timestamp = v2.timestamp;
    assert_eq!(got, v2);
}

#[tokio::test]
async fn sync_twice_gives_one_identical_document() {
    let p = pipeline().await;
    p.store
        .put(&Video::new("abc", "h1", "Test").with_transcript(transcript(&["hello"])))
        .await
        .unwrap();

    p.indexer.sync("h1").await.unwrap();
    let first = p.indexer.document("h1").await.unwrap();
    p.indexer.sync("h1").await.unwrap();
    let second = p.indexer.document("h1").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(p.index.len(COLLECTION), 1);
    assert_eq!(p.query.search("hello").await.unwrap(), vec!["h1"]);
}

#[tokio::test]
async fn absent_token_finds_nothing() {
    let p = pipeline().await;
    p.store
        .put(&Video::new("abc", "h1", "Test").with_transcript(transcript(&["hello"])))
        .await
        .unwrap();
    p.indexer.sync("h1").await.unwrap();

    assert!(p.query.search("xylophone").await.unwrap().is_empty());
}

#[tokio::test]
async fn unwritten_url_is_not_found() {
    let p = pipeline().await;
    let err = p.store.get("never-written").await.unwrap_err();
    assert!(err.is_not_found(), "got {:?}", err);
}

#[tokio::test]
async fn index_lags_store_until_resync() {
    let p = pipeline().await;
    p.store
        .put(&Video::new("abc", "h1", "Test").with_transcript(transcript(&["hello"])))
        .await
        .unwrap();
    p.indexer.sync("h1").await.unwrap();

    p.store
        .put(&Video::new("abc", "h1", "Test").with_transcript(transcript(&["goodbye"])))
        .await
        .unwrap();
    assert_eq!(p.query.search("hello").await.unwrap(), vec!["h1"]);
    assert!(p.query.search("goodbye").await.unwrap().is_empty());

    p.indexer.sync("h1").await.unwrap();
    assert!(p.query.search("hello").await.unwrap().is_empty());
    assert_eq!(p.query.search("goodbye").await.unwrap(), vec!["h1"]);
}

#[tokio::test]
async fn concurrent_writers_each_land() {
    let p = pipeline().await;
    let store = p.store.clone();

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                let own = format!("own{}", i);
                let v = Video::new(format!("clip-{}", i), format!("h{}", i), format!("Clip {}", i))
                    .with_transcript(transcript(&["shared", own.as_str()]));
                store.put(&v).await
            })
        })
        .collect();
    for t in tasks {
        t.await.unwrap().unwrap();
    }

    for i in 0..32 {
        p.indexer.sync(&format!("h{}", i)).await.unwrap();
    }
    assert_eq!(p.query.search("shared").await.unwrap().len(), 32);
    assert_eq!(p.query.search("own7").await.unwrap(), vec!["h7"]);
    assert!(p.store.pool_state().idle <= 4);
    assert_eq!(p.store.pool_state().active, 0);
}

#[tokio::test]
async fn records_survive_store_compaction() {
    let p = pipeline().await;
    for title in ["one", "two", "three"] {
        p.store.put(&Video::new("abc", "h1", title)).await.unwrap();
    }
    p.store.compact().await.unwrap();

    assert_eq!(p.store.get_video("abc").await.unwrap().title, "three");
    assert_eq!(p.store.resolve_hash("h1").await.unwrap(), "abc");
}

#[tokio::test]
async fn legacy_records_sync_like_new_ones() {
    let p = pipeline().await;
    // Written by the old double-encoding writer, straight into the segment
    let v = Video::new("old", "h-old", "Legacy").with_transcript(transcript(&["archive"]));
    p.engine
        .set_many(vec![
            (video_key("old"), codec::encode_legacy(&v).unwrap()),
            (hash_key("h-old"), b"old".to_vec()),
        ])
        .unwrap();

    assert_eq!(p.store.get_video("old").await.unwrap().transcript, v.transcript);
    p.indexer.sync("h-old").await.unwrap();
    assert_eq!(p.query.search("archive").await.unwrap(), vec!["h-old"]);
}
