use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use pdfsift_core::{
    find_matches, merge_match_rects, CharacterExtractor, Match, MatchNavigator, SearchError,
    SearchOptions, SearchSession, SearchSummary, TextIndexCache,
};

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub debounce_ms: u64,
    pub soft_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 200,
            soft_timeout_ms: 2_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn soft_timeout(&self) -> Duration {
        Duration::from_millis(self.soft_timeout_ms)
    }
}

#[derive(Debug, Clone)]
pub enum SearchEvent {
    Started {
        query: String,
    },
    Progress {
        pages_scanned: usize,
        page_count: usize,
        matches_found: usize,
        /// Soft-timeout advisory: the scan is taking long but keeps going.
        slow: bool,
    },
    Published(Arc<SearchSession>),
}

type Subscriber = Box<dyn Fn(&SearchEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct SearchRequest {
    query: String,
    options: SearchOptions,
}

/// Drives debounced, cancellable, multi-page search over one document and
/// publishes immutable session snapshots.
///
/// Query edits restart the debounce window; only the last value in effect
/// when the window elapses runs. At most one session is Running at a time:
/// entering Running cancels the prior run, whose partial matches are
/// discarded unpublished. Published sessions are replaced atomically, so a
/// reader always sees either the previous complete session or the new one.
///
/// Scans run as spawned Tokio tasks; construct and drive the coordinator
/// from within a runtime.
pub struct SearchCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    extractor: Arc<dyn CharacterExtractor>,
    cache: TextIndexCache,
    config: CoordinatorConfig,
    sessions: watch::Sender<Arc<SearchSession>>,
    navigator: Mutex<MatchNavigator>,
    subscribers: Mutex<Vec<Subscriber>>,
    request: Mutex<SearchRequest>,
    last_submitted: Mutex<Option<SearchRequest>>,
    generation: AtomicU64,
    running: Mutex<Option<Arc<AtomicBool>>>,
}

impl SearchCoordinator {
    pub fn new(extractor: Arc<dyn CharacterExtractor>, config: CoordinatorConfig) -> Self {
        let (sessions, _) = watch::channel(Arc::new(SearchSession::idle()));
        Self {
            inner: Arc::new(Inner {
                extractor,
                cache: TextIndexCache::new(),
                config,
                sessions,
                navigator: Mutex::new(MatchNavigator::empty()),
                subscribers: Mutex::new(Vec::new()),
                request: Mutex::new(SearchRequest {
                    query: String::new(),
                    options: SearchOptions::default(),
                }),
                last_submitted: Mutex::new(None),
                generation: AtomicU64::new(0),
                running: Mutex::new(None),
            }),
        }
    }

    /// Starts (or restarts) the debounce window for a new query value. An
    /// empty query is the clear operation: no session is created, any
    /// running scan is canceled, and navigation drops to NoMatches.
    pub fn set_query(&self, query: impl Into<String>) {
        let query = query.into();
        if query.is_empty() {
            self.inner.clear();
            return;
        }
        self.inner.request.lock().query = query;
        Inner::schedule(&self.inner);
    }

    /// Changing options re-runs the current query through the same
    /// debounce path; with no query in effect it only records them.
    pub fn set_options(&self, options: SearchOptions) {
        let has_query = {
            let mut request = self.inner.request.lock();
            request.options = options;
            !request.query.is_empty()
        };
        if has_query {
            Inner::schedule(&self.inner);
        }
    }

    /// Aborts the pending debounce and any Running session. The previously
    /// published session stays in place.
    pub fn cancel(&self) {
        self.inner.supersede();
        self.inner.last_submitted.lock().take();
    }

    /// Read-only snapshot of the most recently published session.
    pub fn current_session(&self) -> Arc<SearchSession> {
        self.inner.sessions.borrow().clone()
    }

    /// Change-notified view of published sessions.
    pub fn watch_sessions(&self) -> watch::Receiver<Arc<SearchSession>> {
        self.inner.sessions.subscribe()
    }

    pub fn subscribe(&self, subscriber: impl Fn(&SearchEvent) + Send + Sync + 'static) {
        self.inner.subscribers.lock().push(Box::new(subscriber));
    }

    pub fn current_match(&self) -> Option<Match> {
        self.inner.navigator.lock().current().cloned()
    }

    pub fn next(&self) -> Option<Match> {
        self.inner.navigator.lock().next().cloned()
    }

    pub fn previous(&self) -> Option<Match> {
        self.inner.navigator.lock().previous().cloned()
    }

    pub fn summary(&self) -> SearchSummary {
        self.inner.navigator.lock().summary()
    }
}

impl Inner {
    /// Invalidates the pending debounce window and flags the running scan.
    fn supersede(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(flag) = self.running.lock().take() {
            flag.store(true, Ordering::SeqCst);
        }
    }

    fn clear(&self) {
        self.supersede();
        self.last_submitted.lock().take();
        self.request.lock().query.clear();
        self.publish(Arc::new(SearchSession::idle()));
    }

    fn schedule(inner: &Arc<Inner>) {
        let request = inner.request.lock().clone();
        {
            let mut last = inner.last_submitted.lock();
            if last.as_ref() == Some(&request) {
                debug!(query = %request.query, "identical search request; not rescheduling");
                return;
            }
            *last = Some(request.clone());
        }

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.debounce()).await;
            if inner.generation.load(Ordering::SeqCst) != generation {
                // A newer edit restarted the window.
                return;
            }

            let cancel = Arc::new(AtomicBool::new(false));
            {
                let mut running = inner.running.lock();
                if let Some(prev) = running.replace(Arc::clone(&cancel)) {
                    prev.store(true, Ordering::SeqCst);
                }
            }

            inner
                .run_scan(request, generation, Arc::clone(&cancel))
                .await;

            let mut running = inner.running.lock();
            if running
                .as_ref()
                .map_or(false, |flag| Arc::ptr_eq(flag, &cancel))
            {
                *running = None;
            }
        });
    }

    #[instrument(skip(self, cancel), fields(query = %request.query))]
    async fn run_scan(&self, request: SearchRequest, generation: u64, cancel: Arc<AtomicBool>) {
        let mut session = SearchSession::running(request.query.clone(), request.options);
        self.notify(&SearchEvent::Started {
            query: request.query.clone(),
        });

        let page_count = self.extractor.page_count();
        let started = Instant::now();
        let mut slow_reported = false;

        for page in 0..page_count {
            if cancel.load(Ordering::SeqCst) {
                let canceled = session.cancel();
                debug!(
                    query = %canceled.query,
                    "scan canceled; partial matches discarded"
                );
                return;
            }

            match self.cache.get_or_build(self.extractor.as_ref(), page) {
                Ok(index) => {
                    for span in find_matches(&index, &request.query, &request.options) {
                        let rects = merge_match_rects(index.characters(), span.start, span.len);
                        session.matches.push(Match {
                            page_number: page,
                            start_index: span.start,
                            length: span.len,
                            text: index.slice_text(span.start, span.len),
                            rects,
                        });
                    }
                }
                Err(err) if err.is_fatal() => {
                    warn!(page, error = %err, "document unavailable; failing session");
                    let failed = Arc::new(session.fail(SearchError::Fatal(err.to_string())));
                    self.publish_if_current(generation, failed);
                    return;
                }
                Err(err) => {
                    warn!(page, error = %err, "page extraction failed; skipping");
                    session.skipped_pages.push(page);
                }
            }

            let slow = started.elapsed() >= self.config.soft_timeout();
            if slow && !slow_reported {
                slow_reported = true;
                warn!(
                    query = %request.query,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "scan exceeding soft timeout; continuing"
                );
            }
            self.notify(&SearchEvent::Progress {
                pages_scanned: page + 1,
                page_count,
                matches_found: session.matches.len(),
                slow,
            });

            // Cancellation is cooperative: between pages the scan yields so
            // a newer query can flag it before the next extraction.
            tokio::task::yield_now().await;
        }

        if cancel.load(Ordering::SeqCst) {
            let canceled = session.cancel();
            debug!(
                query = %canceled.query,
                "scan canceled at completion; nothing published"
            );
            return;
        }

        self.publish_if_current(generation, Arc::new(session.complete()));
    }

    /// A scan that was superseded after its last cancellation check must not
    /// replace the published snapshot.
    fn publish_if_current(&self, generation: u64, session: Arc<SearchSession>) {
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(query = %session.query, "session superseded before publication; dropping");
            return;
        }
        self.publish(session);
    }

    fn publish(&self, session: Arc<SearchSession>) {
        self.sessions.send_replace(Arc::clone(&session));
        *self.navigator.lock() = MatchNavigator::for_session(Arc::clone(&session));
        self.notify(&SearchEvent::Published(session));
    }

    fn notify(&self, event: &SearchEvent) {
        for subscriber in self.subscribers.lock().iter() {
            subscriber(event);
        }
    }
}

impl Drop for SearchCoordinator {
    fn drop(&mut self) {
        // Document closed: flag any in-flight scan and drop the index cache.
        self.inner.supersede();
        self.inner.cache.clear();
    }
}
