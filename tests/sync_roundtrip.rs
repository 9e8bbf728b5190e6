//! Sync driver tests
//!
//! Drives the whole protocol through the `sync` module with stub discovery
//! and fetch collaborators, the way the embedding application would.

use favicon_sync::{checker, schema, sync, IconPair, StoreSession};
use rusqlite::Connection;
use std::collections::HashSet;
use std::path::PathBuf;
use tempfile::TempDir;

fn create_store(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("Favicons");
    let conn = Connection::open(&path).unwrap();
    schema::initialize_store(&conn).unwrap();
    conn.close().unwrap();
    path
}

fn bookmarks(urls: &[&str]) -> HashSet<String> {
    urls.iter().map(|url| url.to_string()).collect()
}

/// Locator stub: every page advertises `<page>favicon.ico`.
fn locate(page_url: &str) -> Option<String> {
    Some(format!("{page_url}favicon.ico"))
}

fn icon_pair(tag: u8) -> IconPair {
    IconPair::new(vec![tag; 16], vec![tag; 32])
}

#[test]
fn fresh_store_sync_resolves_every_bookmark() {
    let dir = TempDir::new().unwrap();
    let path = create_store(&dir);
    let marks = bookmarks(&["https://example.com/", "https://example.org/"]);

    let mut session = StoreSession::open(&path).unwrap();
    let mut locator = locate;
    let mut fetcher = |_: &str| Some(icon_pair(1));
    let report = sync::run(&mut session, &marks, &mut locator, &mut fetcher).unwrap();

    assert_eq!(report.already_mapped, 0);
    assert_eq!(report.discovered, 2);
    assert_eq!(report.reused, 0);
    assert_eq!(report.added, 2);
    assert!(report.unresolved.is_empty());

    let mappings = session.existing_mappings().unwrap();
    for page in &marks {
        assert!(mappings.contains(page.as_str()));
    }

    // The store the sync produced is structurally sound.
    assert!(checker::check(session.connection()).unwrap().passed());
    session.close().unwrap();
}

#[test]
fn second_run_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let path = create_store(&dir);
    let marks = bookmarks(&["https://example.com/", "https://example.org/"]);

    let mut session = StoreSession::open(&path).unwrap();
    let mut locator = locate;
    let mut fetcher = |_: &str| Some(icon_pair(1));
    sync::run(&mut session, &marks, &mut locator, &mut fetcher).unwrap();
    session.close().unwrap();

    let mut session = StoreSession::open(&path).unwrap();
    let mut fetch_count = 0usize;
    let mut counting_fetcher = |_: &str| {
        fetch_count += 1;
        Some(icon_pair(2))
    };
    let report = sync::run(&mut session, &marks, &mut locator, &mut counting_fetcher).unwrap();
    session.close().unwrap();

    // Everything was already mapped, so nothing was fetched or stored.
    assert_eq!(report.already_mapped, 2);
    assert_eq!(report.discovered, 0);
    assert_eq!(report.added, 0);
    assert_eq!(fetch_count, 0);
}

#[test]
fn shared_favicon_is_fetched_once() {
    let dir = TempDir::new().unwrap();
    let path = create_store(&dir);
    let marks = bookmarks(&["https://en.example.com/", "https://de.example.com/"]);

    let mut session = StoreSession::open(&path).unwrap();
    let mut locator = |_: &str| Some("https://example.com/favicon.ico".to_string());
    let mut fetch_count = 0usize;
    let mut fetcher = |_: &str| {
        fetch_count += 1;
        Some(icon_pair(1))
    };
    let report = sync::run(&mut session, &marks, &mut locator, &mut fetcher).unwrap();
    session.close().unwrap();

    assert_eq!(fetch_count, 1);
    assert_eq!(report.added, 1);
    assert!(report.unresolved.is_empty());

    let conn = Connection::open(&path).unwrap();
    let favicons: i64 = conn
        .query_row("SELECT COUNT(*) FROM favicons", [], |r| r.get(0))
        .unwrap();
    let mappings: i64 = conn
        .query_row("SELECT COUNT(*) FROM icon_mapping", [], |r| r.get(0))
        .unwrap();
    assert_eq!(favicons, 1);
    assert_eq!(mappings, 2);
}

#[test]
fn cached_icons_are_reused_without_fetching() {
    let dir = TempDir::new().unwrap();
    let path = create_store(&dir);

    // First run caches the icon for example.com.
    let mut session = StoreSession::open(&path).unwrap();
    let mut locator = |_: &str| Some("https://cdn.example.com/favicon.ico".to_string());
    let mut fetcher = |_: &str| Some(icon_pair(1));
    sync::run(
        &mut session,
        &bookmarks(&["https://example.com/"]),
        &mut locator,
        &mut fetcher,
    )
    .unwrap();
    session.close().unwrap();

    // A new bookmark advertising the same favicon URL reuses the record.
    let mut session = StoreSession::open(&path).unwrap();
    let mut failing_fetcher = |_: &str| -> Option<IconPair> {
        panic!("nothing should be fetched for a cached favicon")
    };
    let report = sync::run(
        &mut session,
        &bookmarks(&["https://example.com/", "https://mirror.example.com/"]),
        &mut locator,
        &mut failing_fetcher,
    )
    .unwrap();
    session.close().unwrap();

    assert_eq!(report.already_mapped, 1);
    assert_eq!(report.reused, 1);
    assert_eq!(report.added, 0);
    assert!(report.unresolved.is_empty());
}

#[test]
fn failed_fetches_are_reported_not_fatal() {
    let dir = TempDir::new().unwrap();
    let path = create_store(&dir);
    let marks = bookmarks(&["https://up.example.com/", "https://down.example.com/"]);

    let mut session = StoreSession::open(&path).unwrap();
    let mut locator = locate;
    let mut fetcher = |favicon_url: &str| {
        if favicon_url.contains("down") {
            None
        } else {
            Some(icon_pair(1))
        }
    };
    let report = sync::run(&mut session, &marks, &mut locator, &mut fetcher).unwrap();

    assert_eq!(report.added, 1);
    assert_eq!(report.unresolved, vec!["https://down.example.com/".to_string()]);
    let mappings = session.existing_mappings().unwrap();
    assert!(mappings.contains("https://up.example.com/"));
    assert!(!mappings.contains("https://down.example.com/"));
    session.close().unwrap();

    // A later run with the icon reachable again picks the page up.
    let mut session = StoreSession::open(&path).unwrap();
    let mut working_fetcher = |_: &str| Some(icon_pair(2));
    let report = sync::run(&mut session, &marks, &mut locator, &mut working_fetcher).unwrap();
    session.close().unwrap();

    assert_eq!(report.already_mapped, 1);
    assert!(report.unresolved.is_empty());
}

#[test]
fn pages_without_a_favicon_are_skipped() {
    let dir = TempDir::new().unwrap();
    let path = create_store(&dir);
    let marks = bookmarks(&["https://bare.example.com/", "https://rich.example.com/"]);

    let mut session = StoreSession::open(&path).unwrap();
    let mut locator = |page_url: &str| {
        if page_url.contains("bare") {
            None
        } else {
            Some(format!("{page_url}favicon.ico"))
        }
    };
    let mut fetcher = |_: &str| Some(icon_pair(1));
    let report = sync::run(&mut session, &marks, &mut locator, &mut fetcher).unwrap();

    assert_eq!(report.discovered, 1);
    assert_eq!(report.added, 1);
    let mappings = session.existing_mappings().unwrap();
    assert!(!mappings.contains("https://bare.example.com/"));
    session.close().unwrap();
}
