//! Integration tests for the persisted state: save/load fidelity and the
//! single-instance lock.

use gleaner::config::FeedOptions;
use gleaner::storage::{
    AggregatorState, ArticleRecord, ContentBlock, Database, DatabaseError, EntryInfo, FeedRecord,
    LockMode,
};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;

async fn memory_db() -> Database {
    Database::open(":memory:", LockMode::Wait).await.unwrap()
}

fn sample_state() -> AggregatorState {
    let mut state = AggregatorState::new();

    let mut options = FeedOptions {
        keep_min: Some(3),
        max_age: Some(7200),
        allow_duplicates: Some(true),
        user: Some("alice".into()),
        password: Some("secret".into()),
        ..FeedOptions::default()
    };
    options.defines.insert("colour".into(), "blue".into());

    let mut feed = FeedRecord::new("https://a.example/rss", 1800, options);
    feed.etag = Some("\"v1\"".into());
    feed.last_modified = Some("Mon, 01 Jan 2024 00:00:00 GMT".into());
    feed.last_update = 1_700_000_000;
    feed.title = Some("Example A".into());
    feed.link = Some("https://a.example/".into());
    state.feeds.insert(feed.url.clone(), feed);

    let bare = FeedRecord::new("https://b.example/atom", 600, FeedOptions::default());
    state.feeds.insert(bare.url.clone(), bare);

    let entry = EntryInfo {
        id: Some("urn:a:1".into()),
        title: Some("First".into()),
        link: Some("https://a.example/1".into()),
        content: vec![ContentBlock {
            value: "<p>Hello</p>".into(),
            content_type: Some("text/html".into()),
        }],
        summary: Some(ContentBlock {
            value: "Hello".into(),
            content_type: None,
        }),
        published: Some(1_699_999_000),
        updated: Some(1_699_999_500),
        created: None,
        author: Some("Alice".into()),
        categories: vec!["news".into(), "rust".into()],
    };
    let mut first = ArticleRecord::new("https://a.example/rss", entry, 0, 1_700_000_000);
    first.last_seen = 1_700_000_100;
    state.articles.insert(first.hash.clone(), first);

    let plain = EntryInfo {
        title: Some("Untitled link".into()),
        ..EntryInfo::default()
    };
    let second = ArticleRecord::new("https://b.example/atom", plain, 4, 1_600_000_000);
    state.articles.insert(second.hash.clone(), second);

    state
}

#[tokio::test]
async fn test_fresh_database_loads_empty_state() {
    let db = memory_db().await;
    let state = db.load_state().await.unwrap();
    assert_eq!(state, AggregatorState::new());
}

#[tokio::test]
async fn test_save_then_load_reproduces_state() {
    let db = memory_db().await;
    let state = sample_state();

    db.save_state(&state).await.unwrap();
    let loaded = db.load_state().await.unwrap();

    assert_eq!(loaded, state);
}

#[tokio::test]
async fn test_save_replaces_previous_state() {
    let db = memory_db().await;
    db.save_state(&sample_state()).await.unwrap();

    let mut smaller = sample_state();
    smaller.feeds.remove("https://b.example/atom");
    smaller.articles.retain(|_, a| a.feed_url != "https://b.example/atom");
    db.save_state(&smaller).await.unwrap();

    let loaded = db.load_state().await.unwrap();
    assert_eq!(loaded.feeds.len(), 1);
    assert_eq!(loaded.articles.len(), 1);
    assert_eq!(loaded, smaller);
}

#[tokio::test]
async fn test_many_articles_span_batches() {
    let db = memory_db().await;
    let mut state = AggregatorState::new();
    let feed = FeedRecord::new("https://a.example/rss", 1800, FeedOptions::default());
    state.feeds.insert(feed.url.clone(), feed);
    for i in 0..250 {
        let entry = EntryInfo {
            title: Some(format!("Article {i}")),
            ..EntryInfo::default()
        };
        let article = ArticleRecord::new("https://a.example/rss", entry, i, 1000 + i as i64);
        state.articles.insert(article.hash.clone(), article);
    }

    db.save_state(&state).await.unwrap();
    let loaded = db.load_state().await.unwrap();

    assert_eq!(loaded.articles.len(), 250);
    assert_eq!(loaded, state);
}

#[tokio::test]
async fn test_second_instance_is_locked_out() {
    let dir = std::env::temp_dir().join(format!("gleaner_lock_test_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("state.db");
    let path = path.to_str().unwrap();

    let first = Database::open(path, LockMode::Wait).await.unwrap();
    first.save_state(&sample_state()).await.unwrap();

    let second = Database::open(path, LockMode::NoWait).await;
    assert!(matches!(second, Err(DatabaseError::InstanceLocked)));

    drop(first);
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_options_survive_with_empty_maps() {
    let db = memory_db().await;
    let mut state = AggregatorState::new();
    let feed = FeedRecord::new("https://c.example/feed", 60, FeedOptions::default());
    state.feeds.insert(feed.url.clone(), feed);

    db.save_state(&state).await.unwrap();
    let loaded = db.load_state().await.unwrap();

    let options = &loaded.feeds["https://c.example/feed"].options;
    assert_eq!(options.proxies, BTreeMap::new());
    assert_eq!(options.keep_min, None);
}
