//! # favicon-sync - Bookmark favicon cache synchronizer
//!
//! `favicon-sync` reconciles a set of bookmarked page URLs against a
//! Chromium-compatible favicon store: every bookmark without a stored icon
//! gets one, and no icon already present in the cache is ever fetched or
//! stored twice.
//!
//! The crate owns two things: the **merge protocol**
//! ([`session::StoreSession`]), a single-connection write session with exact
//! consistency guarantees over the append-only store, and the **integrity
//! checker** ([`checker`]), a read-only validator that reports structural
//! corruption as data. Bookmark parsing, favicon discovery and icon
//! fetching stay outside, behind the seams in [`sync`].
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use favicon_sync::{IconPair, Result, StoreSession};
//!
//! fn main() -> Result<()> {
//!     let mut session = StoreSession::open("Favicons")?;
//!
//!     // Bookmarks that already have an icon need no work at all.
//!     let done = session.existing_mappings()?;
//!
//!     // Link every page whose favicon is already cached; the rest come
//!     // back and need an actual fetch.
//!     let mut candidates = HashMap::new();
//!     candidates.insert(
//!         "https://example.com/".to_string(),
//!         "https://example.com/favicon.ico".to_string(),
//!     );
//!     assert!(!done.contains("https://example.com/"));
//!     let missing = session.merge(&candidates)?;
//!
//!     // Fetch and normalize icons for `missing` (elsewhere), store them,
//!     // then merge once more to link the pages that waited on them.
//!     let fetched: Vec<(String, IconPair)> = Vec::new();
//!     session.add_icons(&fetched)?;
//!     let _unresolved = session.merge(&candidates)?;
//!     let _ = missing;
//!
//!     session.close()?;
//!     Ok(())
//! }
//! ```
//!
//! The [`sync`] module drives this sequence end-to-end behind pluggable
//! discovery/fetch seams; [`checker::check_store`] validates a store's
//! structural invariants without modifying it.

pub mod checker;
pub mod error;
pub mod ids;
pub mod schema;
pub mod session;
pub mod sync;

pub use crate::checker::{check, check_store, Check, CheckReport, Violation};
pub use crate::error::{FaviconError, Result};
pub use crate::schema::{IconPair, SUPPORTED_VERSION};
pub use crate::session::StoreSession;
pub use crate::sync::{FaviconLocator, IconFetcher, SyncReport};
