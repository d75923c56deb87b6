//! Tests for the bounded result cache: caps, eviction order, immutability of
//! the newest record.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crashdbg::cache::ResultCache;
use crashdbg::queue::{CommandRecord, CommandState};

fn record(id: &str, output_len: usize) -> Arc<CommandRecord> {
    let now = Utc::now();
    Arc::new(CommandRecord {
        command_id: id.to_string(),
        session_id: "sess-test".to_string(),
        command: "k".to_string(),
        state: CommandState::Completed,
        queued_at: now,
        started_at: Some(now),
        completed_at: Some(now),
        output: Some("x".repeat(output_len)),
        error: None,
        cancel_reason: None,
        timeout: Duration::from_secs(120),
    })
}

#[test]
fn test_put_get_roundtrip() {
    let cache = ResultCache::new(1024 * 1024, 100);
    cache.put(record("a", 10));

    let fetched = cache.get("a").expect("record should be cached");
    assert_eq!(fetched.command_id, "a");
    assert_eq!(fetched.output.as_deref(), Some("xxxxxxxxxx"));
    assert!(cache.get("missing").is_none());
}

#[test]
fn test_count_cap_evicts_oldest() {
    let cache = ResultCache::new(1024 * 1024, 3);
    for id in ["a", "b", "c", "d", "e"] {
        cache.put(record(id, 10));
    }

    assert_eq!(cache.len(), 3);
    assert!(cache.get("a").is_none());
    assert!(cache.get("b").is_none());
    assert!(cache.get("c").is_some());
    assert!(cache.get("d").is_some());
    assert!(cache.get("e").is_some());
}

#[test]
fn test_byte_cap_evicts_oldest() {
    // Each record costs roughly output_len + overhead; three fit, four don't.
    let cache = ResultCache::new(3000, 100);
    cache.put(record("a", 700));
    cache.put(record("b", 700));
    cache.put(record("c", 700));
    assert_eq!(cache.len(), 3);

    cache.put(record("d", 700));
    assert!(cache.get("a").is_none(), "oldest record should be evicted");
    assert!(cache.get("d").is_some());
    assert!(cache.stats().bytes <= 3000);
}

#[test]
fn test_newest_record_never_evicted() {
    // A cap smaller than a single record still keeps the newest entry.
    let cache = ResultCache::new(100, 100);
    cache.put(record("a", 500));
    assert!(cache.get("a").is_some());

    cache.put(record("b", 500));
    assert!(cache.get("a").is_none());
    assert!(cache.get("b").is_some(), "most recent record must survive");
}

#[test]
fn test_evicted_record_stays_readable_for_holders() {
    let cache = ResultCache::new(100, 100);
    cache.put(record("a", 500));
    let held = cache.get("a").unwrap();

    cache.put(record("b", 500));
    assert!(cache.get("a").is_none());
    // The Arc we fetched earlier is unaffected by eviction.
    assert_eq!(held.command_id, "a");
}

#[test]
fn test_all_in_completion_order() {
    let cache = ResultCache::new(1024 * 1024, 100);
    for id in ["first", "second", "third"] {
        cache.put(record(id, 5));
    }
    let ids: Vec<String> = cache.all().iter().map(|r| r.command_id.clone()).collect();
    assert_eq!(ids, vec!["first", "second", "third"]);
}

#[test]
fn test_stats_and_clear() {
    let cache = ResultCache::new(1024 * 1024, 2);
    cache.put(record("a", 10));
    cache.put(record("b", 10));
    cache.put(record("c", 10));

    let stats = cache.stats();
    assert_eq!(stats.records, 2);
    assert_eq!(stats.inserted, 3);
    assert_eq!(stats.evictions, 1);
    assert!(stats.bytes > 0);

    cache.clear();
    assert!(cache.is_empty());
    assert_eq!(cache.stats().bytes, 0);
}
