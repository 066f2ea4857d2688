//! Incremental loading of a paginated remote listing, with per-row avatar
//! downloads that never leave stale or duplicate work in flight.
//!
//! [`ScrollController`] owns the loaded [`Record`]s. The rendering layer
//! tells it which rows became visible; it then loads the next page through
//! [`PageLoader`] when the end of the list comes close, and resolves each
//! visible row's avatar from [`KeyedCache`] or through a single-flight
//! download in [`TaskCoordinator`].

pub mod cache;
pub mod config;
pub mod controller;
mod errors;
pub mod pages;
pub mod record;
pub mod source;
pub mod tasks;

pub use cache::KeyedCache;
pub use config::FeedConfig;
pub use controller::{
    FeedEvent, FeedHandle, FeedSnapshot, ImageAction, ScrollController,
};
pub use errors::{FeedError, Result};
pub use pages::PageLoader;
pub use record::{Avatar, Cursor, Record, RecordId};
pub use source::{FeedSource, HttpSource};
pub use tasks::{TaskCoordinator, TaskStats};

pub const DEFAULT_LISTING_URL: &str = "https://api.github.com/users";
pub const DEFAULT_PER_PAGE: u32 = 30;
pub const DEFAULT_PREFETCH_DISTANCE: u64 = 3;
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:102.0) Gecko/20100101 Firefox/102.0";
