use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::record::{Cursor, Record};
use crate::source::FeedSource;
use crate::Result;

/// A fetched (or failed) page on its way back to the list owner.
#[derive(Debug)]
pub struct PageOutcome {
    /// Identifies the `load_next` call that produced the page
    pub request: u64,
    pub cursor: Cursor,
    /// Number of records loaded when the page was requested
    pub base_count: usize,
    pub result: Result<Vec<Record>>,
}

struct PendingPage {
    request: u64,
    cursor: Cursor,
    base_count: usize,
    handle: JoinHandle<()>,
}

/// Sequential, append-only loading of listing pages.
///
/// Only one page is ever outstanding: a request made while another one is
/// in flight is dropped, so pages land in the order they were asked for
/// and no two pages share a cursor.
pub struct PageLoader<S> {
    source: Arc<S>,
    outcomes: mpsc::UnboundedSender<PageOutcome>,
    pending: Option<PendingPage>,
    next_request: u64,
    pages_loaded: usize,
}

impl<S: FeedSource> PageLoader<S> {
    pub fn new(
        source: Arc<S>,
        outcomes: mpsc::UnboundedSender<PageOutcome>,
    ) -> Self {
        Self {
            source,
            outcomes,
            pending: None,
            next_request: 0,
            pages_loaded: 0,
        }
    }

    /// Requests the page following `current_count` loaded records.
    ///
    /// Returns `false` without fetching when a page is already on its
    /// way. Must be called from within a tokio runtime.
    pub fn load_next(&mut self, current_count: usize) -> bool {
        let cursor = Cursor::after(current_count);

        if let Some(pending) = &self.pending {
            log::debug!(
                "pages: skipping {}, {} is still loading",
                cursor,
                pending.cursor
            );
            return false;
        }

        self.next_request += 1;
        let request = self.next_request;

        log::debug!("pages: loading {} (request {})", cursor, request);
        let source = self.source.clone();
        let outcomes = self.outcomes.clone();
        let handle = tokio::spawn(async move {
            let result = source.fetch_page(cursor).await;
            let _ = outcomes.send(PageOutcome {
                request,
                cursor,
                base_count: current_count,
                result,
            });
        });

        self.pending = Some(PendingPage {
            request,
            cursor,
            base_count: current_count,
            handle,
        });
        true
    }

    /// Applies a delivered page to `records`.
    ///
    /// On success the whole page is appended in server order and the
    /// number of appended records is returned. A failed page leaves the
    /// list untouched. Outcomes of cancelled or earlier requests, or of
    /// requests made for a list of a different length, are dropped and
    /// yield `None`, as is a fetch that reported its own cancellation.
    pub fn complete(
        &mut self,
        outcome: PageOutcome,
        records: &mut Vec<Arc<Record>>,
    ) -> Option<Result<usize>> {
        let expected = match &self.pending {
            Some(pending) => {
                pending.request == outcome.request
                    && pending.cursor == outcome.cursor
                    && pending.base_count == outcome.base_count
            }
            None => false,
        };
        if !expected {
            log::warn!("pages: discarding unexpected page {}", outcome.cursor);
            return None;
        }
        self.pending = None;

        if records.len() != outcome.base_count {
            log::warn!(
                "pages: discarding {}, list grew from {} to {} meanwhile",
                outcome.cursor,
                outcome.base_count,
                records.len()
            );
            return None;
        }

        match outcome.result {
            Ok(page) => {
                let count = page.len();
                records.extend(page.into_iter().map(Arc::new));
                self.pages_loaded += 1;
                log::debug!(
                    "pages: appended {} records from {}, {} loaded",
                    count,
                    outcome.cursor,
                    records.len()
                );
                Some(Ok(count))
            }
            Err(e) if e.is_cancelled() => {
                log::debug!("pages: {} was cancelled", outcome.cursor);
                None
            }
            Err(e) => {
                log::error!("pages: failed to load {}: {}", outcome.cursor, e);
                Some(Err(e))
            }
        }
    }

    /// Aborts the outstanding request, if any.
    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            log::debug!("pages: cancelling {}", pending.cursor);
            pending.handle.abort();
        }
    }

    pub fn is_loading(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pages_loaded(&self) -> usize {
        self.pages_loaded
    }
}

impl<S> Drop for PageLoader<S> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.handle.abort();
        }
    }
}
