//! End-to-end reconciliation of a bookmark set against the favicon store.
//!
//! The driver owns the call order of the merge protocol; favicon discovery
//! and icon fetching stay behind the [`FaviconLocator`] and [`IconFetcher`]
//! seams so the embedding application decides how (and whether) to talk to
//! the network. Per-item collaborator failures never abort a run; a page
//! whose icon cannot be located or fetched is simply reported unresolved.

use crate::error::Result;
use crate::schema::IconPair;
use crate::session::StoreSession;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Discovers the favicon URL a page advertises.
pub trait FaviconLocator {
    /// Favicon URL for `page_url`, or `None` when the page has no usable
    /// favicon. Lookup failures (timeouts, unknown schemes) are reported as
    /// `None` as well; a missing icon never aborts a run.
    fn favicon_url(&mut self, page_url: &str) -> Option<String>;
}

impl<F: FnMut(&str) -> Option<String>> FaviconLocator for F {
    fn favicon_url(&mut self, page_url: &str) -> Option<String> {
        self(page_url)
    }
}

/// Fetches a favicon and normalizes it to the two stored sizes.
pub trait IconFetcher {
    /// Icon bitmaps for `favicon_url`, or `None` when it is unreachable or
    /// not a recognizable image.
    fn fetch(&mut self, favicon_url: &str) -> Option<IconPair>;
}

impl<F: FnMut(&str) -> Option<IconPair>> IconFetcher for F {
    fn fetch(&mut self, favicon_url: &str) -> Option<IconPair> {
        self(favicon_url)
    }
}

/// What one sync pass did, stage by stage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// Bookmarks that already had a mapping and were skipped outright.
    pub already_mapped: usize,
    /// Pages for which the locator produced a favicon URL.
    pub discovered: usize,
    /// Pages linked to an icon that was already stored before this run.
    pub reused: usize,
    /// Distinct new icons fetched and stored.
    pub added: usize,
    /// Pages whose favicon could not be fetched this run.
    pub unresolved: Vec<String>,
}

/// Synchronize `bookmarks` against the session's store.
///
/// Runs the full protocol: filter already-mapped pages, discover favicon
/// URLs for the rest, link everything whose icon is already cached, fetch
/// each genuinely missing icon exactly once, store the fetched icons, and
/// link the pages that waited on them.
///
/// The driver never calls [`StoreSession::close`]; committing (or
/// abandoning) the session stays with its owner.
pub fn run<L, F>(
    session: &mut StoreSession,
    bookmarks: &HashSet<String>,
    locator: &mut L,
    fetcher: &mut F,
) -> Result<SyncReport>
where
    L: FaviconLocator,
    F: IconFetcher,
{
    let existing = session.existing_mappings()?;
    let pending: Vec<&String> = bookmarks
        .iter()
        .filter(|page| !existing.contains(page.as_str()))
        .collect();
    let already_mapped = bookmarks.len() - pending.len();
    debug!(
        "{} bookmark(s) pending, {} already mapped",
        pending.len(),
        already_mapped
    );

    let mut discovered: HashMap<String, String> = HashMap::new();
    for page_url in pending {
        match locator.favicon_url(page_url) {
            Some(favicon_url) => {
                discovered.insert(page_url.clone(), favicon_url);
            }
            None => info!("{page_url}: no favicon found, skipping"),
        }
    }

    // First pass links every page whose favicon is already cached.
    let leftover: HashSet<String> = session.merge(&discovered)?.into_iter().collect();
    let reused = discovered.len() - leftover.len();

    // Each missing favicon URL is fetched once, no matter how many pages
    // share it.
    let wanted: HashSet<&String> = leftover
        .iter()
        .filter_map(|page| discovered.get(page))
        .collect();
    let mut fetched = Vec::with_capacity(wanted.len());
    for favicon_url in wanted {
        match fetcher.fetch(favicon_url) {
            Some(icons) => fetched.push((favicon_url.clone(), icons)),
            None => info!("{favicon_url}: fetch failed, skipping"),
        }
    }
    let added = fetched.len();
    session.add_icons(&fetched)?;

    // Second pass with only the still-unmapped pages; anything left now is
    // a page whose icon could not be fetched.
    let remaining: HashMap<String, String> = discovered
        .iter()
        .filter(|(page, _)| leftover.contains(page.as_str()))
        .map(|(page, favicon)| (page.clone(), favicon.clone()))
        .collect();
    let unresolved = session.merge(&remaining)?;

    info!(
        already_mapped,
        discovered = discovered.len(),
        reused,
        added,
        unresolved = unresolved.len(),
        "Favicon sync pass complete"
    );
    Ok(SyncReport {
        already_mapped,
        discovered: discovered.len(),
        reused,
        added,
        unresolved,
    })
}
