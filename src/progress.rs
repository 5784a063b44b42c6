//! Progress-callback trait for per-page processing events.
//!
//! Pass an [`Arc<dyn RunProgressCallback>`] to
//! [`crate::process::Processor::with_progress`] to receive events as the
//! orchestrator extracts each page.
//!
//! # Why callbacks instead of channels?
//!
//! A callback is the least-invasive integration point: the host can forward
//! events to a broadcast channel, a job table, or a terminal progress bar
//! without the library knowing how it communicates. The trait is
//! `Send + Sync` because pages may be extracted concurrently.
//!
//! # Example
//!
//! ```rust
//! use menu_ingest::RunProgressCallback;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct ItemCounter(AtomicUsize);
//!
//! impl RunProgressCallback for ItemCounter {
//!     fn on_page_complete(&self, page: u32, total_pages: usize, items: usize) {
//!         self.0.fetch_add(items, Ordering::SeqCst);
//!         eprintln!("page {}/{}: {} items", page, total_pages, items);
//!     }
//! }
//! ```

use std::sync::Arc;

/// Called by the orchestrator as it moves through a run.
///
/// All methods default to no-ops so implementations override only what they
/// need. With `extraction_concurrency > 1` the page methods may be called
/// concurrently from different tasks.
pub trait RunProgressCallback: Send + Sync {
    /// Called once pages are converted, before the first extraction.
    fn on_run_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called just before a page is sent to the extraction service.
    fn on_page_start(&self, page: u32, total_pages: usize) {
        let _ = (page, total_pages);
    }

    /// Called when a page's extraction returned.
    ///
    /// `items` is the raw item count before merging; a degraded page reports 0.
    fn on_page_complete(&self, page: u32, total_pages: usize, items: usize) {
        let _ = (page, total_pages, items);
    }

    /// Called when a page fails after all retries; the run fails next.
    fn on_page_error(&self, page: u32, total_pages: usize, error: &str) {
        let _ = (page, total_pages, error);
    }

    /// Called once after the merge, with the deduplicated item count.
    fn on_run_complete(&self, items_count: usize, pages_processed: usize) {
        let _ = (items_count, pages_processed);
    }
}

/// No-op callback, used when none is configured.
pub struct NoopProgressCallback;

impl RunProgressCallback for NoopProgressCallback {}

pub type ProgressCallback = Arc<dyn RunProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        items: AtomicUsize,
        errors: AtomicUsize,
        total: AtomicUsize,
    }

    impl RunProgressCallback for TrackingCallback {
        fn on_run_start(&self, total_pages: usize) {
            self.total.store(total_pages, Ordering::SeqCst);
        }

        fn on_page_start(&self, _page: u32, _total_pages: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_complete(&self, _page: u32, _total_pages: usize, items: usize) {
            self.items.fetch_add(items, Ordering::SeqCst);
        }

        fn on_page_error(&self, _page: u32, _total_pages: usize, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_run_start(2);
        cb.on_page_start(1, 2);
        cb.on_page_complete(1, 2, 7);
        cb.on_page_error(2, 2, "HTTP 502");
        cb.on_run_complete(7, 2);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        tracker.on_run_start(3);
        tracker.on_page_start(1, 3);
        tracker.on_page_complete(1, 3, 4);
        tracker.on_page_start(2, 3);
        tracker.on_page_complete(2, 3, 6);
        tracker.on_page_start(3, 3);
        tracker.on_page_error(3, 3, "timeout");

        assert_eq!(tracker.total.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.starts.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.items.load(Ordering::SeqCst), 10);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_run_start(1);
        cb.on_page_complete(1, 1, 0);
    }
}
