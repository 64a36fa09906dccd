use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

pub type DocumentId = Uuid;

static DOCUMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f6a1c2e-8d4b-5f7a-9c1d-2e6b40a8d5c3").expect("valid namespace UUID")
});

pub fn document_id_for_path(path: &Path) -> DocumentId {
    let resolved = path
        .canonicalize()
        .or_else(|_| {
            if path.is_absolute() {
                Ok(path.to_path_buf())
            } else {
                std::env::current_dir().map(|cwd| cwd.join(path))
            }
        })
        .unwrap_or_else(|_| path.to_path_buf());
    let rendered = resolved.to_string_lossy();
    Uuid::new_v5(&*DOCUMENT_NAMESPACE, rendered.as_bytes())
}

/// Rectangle in document space: origin bottom-left, units of points (1/72").
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageRect {
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
    pub top: f64,
}

impl PageRect {
    pub fn new(left: f64, bottom: f64, right: f64, top: f64) -> Self {
        Self {
            left,
            bottom,
            right,
            top,
        }
    }

    pub fn width(&self) -> f64 {
        self.right - self.left
    }

    pub fn height(&self) -> f64 {
        self.top - self.bottom
    }

    pub fn union(&self, other: &PageRect) -> PageRect {
        PageRect {
            left: self.left.min(other.left),
            bottom: self.bottom.min(other.bottom),
            right: self.right.max(other.right),
            top: self.top.max(other.top),
        }
    }

    /// Length of the overlap between the vertical bands of two rectangles.
    pub fn vertical_overlap(&self, other: &PageRect) -> f64 {
        (self.top.min(other.top) - self.bottom.max(other.bottom)).max(0.0)
    }

    pub fn is_valid(&self) -> bool {
        self.left.is_finite()
            && self.bottom.is_finite()
            && self.right.is_finite()
            && self.top.is_finite()
            && self.right >= self.left
            && self.top >= self.bottom
    }
}

/// Rectangle in display space: origin top-left, units of device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplayRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

pub const POINTS_PER_INCH: f64 = 72.0;

/// Invertible mapping between document space and display space for one page.
///
/// The vertical axis is flipped: document space grows upward from the page
/// bottom, display space grows downward from the surface top.
#[derive(Debug, Clone, Copy)]
pub struct CoordinateTransform {
    page_height: f64,
    scale: f64,
    dpi_ratio: f64,
}

impl CoordinateTransform {
    pub fn new(page_height: f64, scale: f64, dpi_ratio: f64) -> Self {
        debug_assert!(page_height > 0.0, "page height must be positive");
        debug_assert!(scale > 0.0, "scale must be positive");
        debug_assert!(dpi_ratio > 0.0, "dpi ratio must be positive");
        Self {
            page_height,
            scale,
            dpi_ratio,
        }
    }

    pub fn for_device_dpi(page_height: f64, scale: f64, device_dpi: f64) -> Self {
        Self::new(page_height, scale, device_dpi / POINTS_PER_INCH)
    }

    fn factor(&self) -> f64 {
        self.scale * self.dpi_ratio
    }

    pub fn to_display(&self, rect: PageRect) -> DisplayRect {
        let k = self.factor();
        DisplayRect {
            x: rect.left * k,
            y: (self.page_height - rect.top) * k,
            width: rect.width() * k,
            height: rect.height() * k,
        }
    }

    pub fn to_document(&self, rect: DisplayRect) -> PageRect {
        let k = self.factor();
        let top = self.page_height - rect.y / k;
        PageRect {
            left: rect.x / k,
            bottom: top - rect.height / k,
            right: (rect.x + rect.width) / k,
            top,
        }
    }
}

/// One extracted character with its bounding box in document space.
///
/// Plain owned value: extraction must not leak native handles into these.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageChar {
    pub codepoint: u32,
    pub index: usize,
    pub bounds: PageRect,
}

impl PageChar {
    pub fn scalar(&self) -> char {
        char::from_u32(self.codepoint).unwrap_or(char::REPLACEMENT_CHARACTER)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExtractionError {
    #[error("page {page} out of range (document has {page_count} pages)")]
    PageOutOfRange { page: usize, page_count: usize },

    #[error("document is no longer available: {0}")]
    DocumentClosed(String),

    #[error("text extraction failed: {0}")]
    Engine(String),
}

impl ExtractionError {
    /// Fatal errors abort the whole session; the rest skip a single page.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExtractionError::DocumentClosed(_))
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SearchError {
    #[error("search query is empty")]
    EmptyQuery,

    #[error("search failed: {0}")]
    Fatal(String),
}

/// Immutable per-page text snapshot: the concatenated character string plus
/// an index-aligned character/box lookup. `text.chars().count()` always
/// equals `characters.len()`.
#[derive(Debug, Clone)]
pub struct PageTextIndex {
    page_number: usize,
    text: String,
    characters: Vec<PageChar>,
}

impl PageTextIndex {
    pub fn new(page_number: usize, characters: Vec<PageChar>) -> Self {
        let characters: Vec<PageChar> = characters
            .into_iter()
            .enumerate()
            .map(|(index, ch)| PageChar { index, ..ch })
            .collect();
        let text = characters.iter().map(PageChar::scalar).collect();
        Self {
            page_number,
            text,
            characters,
        }
    }

    pub fn page_number(&self) -> usize {
        self.page_number
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn characters(&self) -> &[PageChar] {
        &self.characters
    }

    pub fn len(&self) -> usize {
        self.characters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
    }

    /// Text of the character range, by scalar-value indices.
    pub fn slice_text(&self, start: usize, len: usize) -> String {
        let end = (start + len).min(self.characters.len());
        self.characters[start.min(end)..end]
            .iter()
            .map(PageChar::scalar)
            .collect()
    }
}

/// Supplies the per-page character stream. Implementations sit on the native
/// document engine and are expected to return characters in reading order;
/// the search core does not reorder them.
pub trait CharacterExtractor: Send + Sync {
    fn page_count(&self) -> usize;

    /// A page with no extractable text yields an empty vec, not an error.
    fn extract_page(&self, page_number: usize) -> Result<Vec<PageChar>, ExtractionError>;
}

#[async_trait::async_trait]
pub trait DocumentTextProvider: Send + Sync {
    async fn open(&self, path: &Path) -> Result<Arc<dyn CharacterExtractor>>;
}

type PageCell = Arc<OnceCell<Result<Arc<PageTextIndex>, ExtractionError>>>;

/// Per-document cache of page text indexes. Entries are written once and
/// read many times; the map lock only guards cell lookup, and the build runs
/// under the per-page cell so a concurrent request for the same unbuilt page
/// blocks on that cell instead of invoking the extractor again.
#[derive(Default)]
pub struct TextIndexCache {
    pages: Mutex<HashMap<usize, PageCell>>,
}

impl TextIndexCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The extractor runs at most once per page per document lifetime; the
    /// outcome, including failure, is cached until `clear`.
    pub fn get_or_build(
        &self,
        extractor: &dyn CharacterExtractor,
        page_number: usize,
    ) -> Result<Arc<PageTextIndex>, ExtractionError> {
        let cell = {
            let mut pages = self.pages.lock();
            Arc::clone(pages.entry(page_number).or_default())
        };
        cell.get_or_init(|| {
            debug!(page = page_number, "building page text index");
            extractor
                .extract_page(page_number)
                .map(|chars| Arc::new(PageTextIndex::new(page_number, chars)))
        })
        .clone()
    }

    pub fn cached(&self, page_number: usize) -> Option<Arc<PageTextIndex>> {
        let pages = self.pages.lock();
        pages
            .get(&page_number)
            .and_then(|cell| cell.get())
            .and_then(|result| result.as_ref().ok())
            .cloned()
    }

    /// Invalidates every entry. Called when the owning document closes.
    pub fn clear(&self) {
        self.pages.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.lock().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    pub case_sensitive: bool,
    pub whole_word: bool,
}

/// A matched character range on one page, by scalar-value indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchSpan {
    pub start: usize,
    pub len: usize,
}

/// Finds query occurrences in a page index: greedy, leftmost-first,
/// non-overlapping. Empty queries are rejected upstream and never reach
/// this function; one is answered with no matches regardless.
pub fn find_matches(index: &PageTextIndex, query: &str, options: &SearchOptions) -> Vec<MatchSpan> {
    let mut needle: Vec<char> = query.chars().collect();
    if needle.is_empty() {
        return Vec::new();
    }
    let mut haystack: Vec<char> = index.characters().iter().map(PageChar::scalar).collect();
    if !options.case_sensitive {
        for c in &mut needle {
            *c = fold_char(*c);
        }
        for c in &mut haystack {
            *c = fold_char(*c);
        }
    }

    let mut spans = Vec::new();
    let mut at = 0;
    while at + needle.len() <= haystack.len() {
        if haystack[at..at + needle.len()] == needle[..] {
            if !options.whole_word || is_word_bounded(&haystack, at, needle.len()) {
                spans.push(MatchSpan {
                    start: at,
                    len: needle.len(),
                });
                at += needle.len();
                continue;
            }
        }
        at += 1;
    }
    spans
}

/// Per-character simple case fold: the first scalar of the full lowercase
/// mapping, so folded text stays index-aligned with the original.
fn fold_char(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

fn is_word_bounded(haystack: &[char], start: usize, len: usize) -> bool {
    let before_ok = start == 0 || !haystack[start - 1].is_alphanumeric();
    let after_ok = start + len >= haystack.len() || !haystack[start + len].is_alphanumeric();
    before_ok && after_ok
}

/// Adjacent characters share a visual line when their vertical bands overlap
/// by more than this fraction of the smaller character's height.
pub const LINE_OVERLAP_RATIO: f64 = 0.25;

/// Merges a matched character range into one rectangle per visual line the
/// match touches, in reading order. A zero-height box never extends a line.
pub fn merge_match_rects(characters: &[PageChar], start: usize, len: usize) -> Vec<PageRect> {
    let end = (start + len).min(characters.len());
    if start >= end {
        return Vec::new();
    }

    let mut rects = Vec::new();
    let mut current = characters[start].bounds;
    let mut prev = characters[start].bounds;
    for ch in &characters[start + 1..end] {
        if shares_line(&prev, &ch.bounds) {
            current = current.union(&ch.bounds);
        } else {
            rects.push(current);
            current = ch.bounds;
        }
        prev = ch.bounds;
    }
    rects.push(current);
    rects
}

fn shares_line(a: &PageRect, b: &PageRect) -> bool {
    let reference = a.height().min(b.height());
    reference > 0.0 && a.vertical_overlap(b) > reference * LINE_OVERLAP_RATIO
}

/// One occurrence of the query on one page, with its highlight geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub page_number: usize,
    pub start_index: usize,
    pub length: usize,
    pub text: String,
    pub rects: Vec<PageRect>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Running,
    Completed,
    Canceled,
    Failed,
}

/// One complete (or canceled/failed) search run. Matches accumulate while
/// Running and freeze at a terminal state; a new session object is created
/// for every new search.
#[derive(Debug, Clone, Serialize)]
pub struct SearchSession {
    pub query: String,
    pub options: SearchOptions,
    pub state: SessionState,
    pub matches: Vec<Match>,
    /// Pages whose extraction failed and were skipped, for diagnostics.
    pub skipped_pages: Vec<usize>,
    pub error: Option<String>,
}

impl SearchSession {
    pub fn idle() -> Self {
        Self {
            query: String::new(),
            options: SearchOptions::default(),
            state: SessionState::Idle,
            matches: Vec::new(),
            skipped_pages: Vec::new(),
            error: None,
        }
    }

    pub fn running(query: String, options: SearchOptions) -> Self {
        Self {
            query,
            options,
            state: SessionState::Running,
            matches: Vec::new(),
            skipped_pages: Vec::new(),
            error: None,
        }
    }

    pub fn complete(mut self) -> Self {
        self.state = SessionState::Completed;
        self
    }

    /// Partial matches are discarded: a canceled run must never be observed
    /// as a half-populated result set.
    pub fn cancel(mut self) -> Self {
        self.state = SessionState::Canceled;
        self.matches.clear();
        self
    }

    pub fn fail(mut self, error: SearchError) -> Self {
        self.state = SessionState::Failed;
        self.matches.clear();
        self.error = Some(error.to_string());
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            SessionState::Completed | SessionState::Canceled | SessionState::Failed
        )
    }

    pub fn match_count(&self) -> usize {
        self.matches.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationState {
    NoMatches,
    HasMatches { current: usize },
}

/// Current-match selection over a completed session, with wraparound.
#[derive(Debug, Clone)]
pub struct MatchNavigator {
    session: Arc<SearchSession>,
    state: NavigationState,
}

impl MatchNavigator {
    pub fn empty() -> Self {
        Self {
            session: Arc::new(SearchSession::idle()),
            state: NavigationState::NoMatches,
        }
    }

    /// A non-empty Completed session auto-selects its first match; anything
    /// else yields NoMatches.
    pub fn for_session(session: Arc<SearchSession>) -> Self {
        let state = if session.state == SessionState::Completed && !session.matches.is_empty() {
            NavigationState::HasMatches { current: 0 }
        } else {
            NavigationState::NoMatches
        };
        Self { session, state }
    }

    pub fn state(&self) -> NavigationState {
        self.state
    }

    pub fn current_index(&self) -> Option<usize> {
        match self.state {
            NavigationState::HasMatches { current } => Some(current),
            NavigationState::NoMatches => None,
        }
    }

    pub fn current(&self) -> Option<&Match> {
        self.current_index()
            .and_then(|idx| self.session.matches.get(idx))
    }

    pub fn next(&mut self) -> Option<&Match> {
        if let NavigationState::HasMatches { current } = self.state {
            let count = self.session.matches.len();
            self.state = NavigationState::HasMatches {
                current: (current + 1) % count,
            };
        }
        self.current()
    }

    pub fn previous(&mut self) -> Option<&Match> {
        if let NavigationState::HasMatches { current } = self.state {
            let count = self.session.matches.len();
            self.state = NavigationState::HasMatches {
                current: (current + count - 1) % count,
            };
        }
        self.current()
    }

    pub fn clear(&mut self) {
        *self = Self::empty();
    }

    pub fn summary(&self) -> SearchSummary {
        SearchSummary {
            query: self.session.query.clone(),
            total: self.session.matches.len(),
            current_index: self.current_index(),
        }
    }
}

/// Status-line style digest of the active search.
#[derive(Debug, Clone, Serialize)]
pub struct SearchSummary {
    pub query: String,
    pub total: usize,
    pub current_index: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tempfile::tempdir;

    const CHAR_WIDTH: f64 = 6.0;
    const CHAR_HEIGHT: f64 = 10.0;
    const LINE_STEP: f64 = 20.0;

    /// Lays lines of text out on a synthetic page: fixed-width characters,
    /// one band per line, top line first.
    fn index_from_lines(page_number: usize, lines: &[&str]) -> PageTextIndex {
        let mut characters = Vec::new();
        for (line_no, line) in lines.iter().enumerate() {
            let bottom = 700.0 - line_no as f64 * LINE_STEP;
            for (col, ch) in line.chars().enumerate() {
                let left = 72.0 + col as f64 * CHAR_WIDTH;
                characters.push(PageChar {
                    codepoint: ch as u32,
                    index: characters.len(),
                    bounds: PageRect::new(left, bottom, left + CHAR_WIDTH, bottom + CHAR_HEIGHT),
                });
            }
        }
        PageTextIndex::new(page_number, characters)
    }

    struct FakeExtractor {
        pages: Vec<Vec<&'static str>>,
        calls: AtomicUsize,
    }

    impl FakeExtractor {
        fn new(pages: Vec<Vec<&'static str>>) -> Self {
            Self {
                pages,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl CharacterExtractor for FakeExtractor {
        fn page_count(&self) -> usize {
            self.pages.len()
        }

        fn extract_page(&self, page_number: usize) -> Result<Vec<PageChar>, ExtractionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let lines = self
                .pages
                .get(page_number)
                .ok_or(ExtractionError::PageOutOfRange {
                    page: page_number,
                    page_count: self.pages.len(),
                })?;
            Ok(index_from_lines(page_number, lines)
                .characters()
                .to_vec())
        }
    }

    #[test]
    fn index_text_aligns_with_characters() {
        let index = index_from_lines(0, &["The pdf", "format"]);
        assert_eq!(index.text(), "The pdfformat");
        assert_eq!(index.text().chars().count(), index.len());
        assert_eq!(index.characters()[7].scalar(), 'f');
        assert_eq!(index.characters()[7].index, 7);
        assert_eq!(index.slice_text(4, 3), "pdf");
    }

    #[test]
    fn empty_page_yields_empty_index() {
        let index = PageTextIndex::new(3, Vec::new());
        assert!(index.is_empty());
        assert_eq!(index.text(), "");
        assert_eq!(index.page_number(), 3);
    }

    #[test]
    fn case_insensitive_search_folds_both_sides() {
        let index = index_from_lines(0, &["The pdf format"]);
        let insensitive = find_matches(&index, "PDF", &SearchOptions::default());
        assert_eq!(insensitive.len(), 1);
        assert_eq!(insensitive[0], MatchSpan { start: 4, len: 3 });

        let sensitive = find_matches(
            &index,
            "PDF",
            &SearchOptions {
                case_sensitive: true,
                ..Default::default()
            },
        );
        assert!(sensitive.is_empty());
    }

    #[test]
    fn whole_word_rejects_embedded_occurrences() {
        let index = index_from_lines(0, &["concatenate cats cat"]);
        let options = SearchOptions {
            whole_word: true,
            ..Default::default()
        };
        let spans = find_matches(&index, "cat", &options);
        assert_eq!(spans, vec![MatchSpan { start: 17, len: 3 }]);

        let unrestricted = find_matches(&index, "cat", &SearchOptions::default());
        assert_eq!(unrestricted.len(), 3);
    }

    #[test]
    fn matches_are_greedy_and_non_overlapping() {
        let index = index_from_lines(0, &["aaaa"]);
        let spans = find_matches(&index, "aa", &SearchOptions::default());
        assert_eq!(
            spans,
            vec![MatchSpan { start: 0, len: 2 }, MatchSpan { start: 2, len: 2 }]
        );
    }

    #[test]
    fn repeated_search_is_deterministic() {
        let index = index_from_lines(0, &["status quo status", "quo vadis status"]);
        let first = find_matches(&index, "status", &SearchOptions::default());
        let second = find_matches(&index, "status", &SearchOptions::default());
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn single_line_match_merges_to_one_rect() {
        let index = index_from_lines(0, &["highlight me"]);
        let rects = merge_match_rects(index.characters(), 0, 9);
        assert_eq!(rects.len(), 1);
        let rect = rects[0];
        assert_eq!(rect.left, 72.0);
        assert_eq!(rect.right, 72.0 + 9.0 * CHAR_WIDTH);
        assert_eq!(rect.height(), CHAR_HEIGHT);
    }

    #[test]
    fn line_wrap_splits_into_one_rect_per_line() {
        let index = index_from_lines(0, &["ab", "cd"]);
        let spans = find_matches(&index, "bc", &SearchOptions::default());
        assert_eq!(spans, vec![MatchSpan { start: 1, len: 2 }]);

        let rects = merge_match_rects(index.characters(), spans[0].start, spans[0].len);
        assert_eq!(rects.len(), 2);
        // First rect covers 'b' on the upper line, second covers 'c' below.
        assert_eq!(rects[0], index.characters()[1].bounds);
        assert_eq!(rects[1], index.characters()[2].bounds);
        assert!(rects[0].bottom > rects[1].top);
    }

    #[test]
    fn merge_unions_character_boxes_per_line() {
        let index = index_from_lines(0, &["wrap", "ping"]);
        let rects = merge_match_rects(index.characters(), 2, 4);
        assert_eq!(rects.len(), 2);
        assert_eq!(rects[0].width(), 2.0 * CHAR_WIDTH);
        assert_eq!(rects[1].width(), 2.0 * CHAR_WIDTH);
    }

    #[test]
    fn transform_round_trips_within_tolerance() {
        let rects = [
            PageRect::new(0.0, 0.0, 612.0, 792.0),
            PageRect::new(72.5, 700.25, 300.125, 710.75),
            PageRect::new(10.0, 10.0, 10.0, 10.0),
        ];
        for &rect in &rects {
            for &scale in &[0.25, 1.0, 2.5] {
                for &dpi_ratio in &[1.0, 96.0 / 72.0, 2.0] {
                    let transform = CoordinateTransform::new(792.0, scale, dpi_ratio);
                    let back = transform.to_document(transform.to_display(rect));
                    assert!((back.left - rect.left).abs() < 1e-9);
                    assert!((back.bottom - rect.bottom).abs() < 1e-9);
                    assert!((back.right - rect.right).abs() < 1e-9);
                    assert!((back.top - rect.top).abs() < 1e-9);
                }
            }
        }
    }

    #[test]
    fn transform_flips_vertical_axis() {
        let transform = CoordinateTransform::for_device_dpi(792.0, 1.0, 72.0);
        let display = transform.to_display(PageRect::new(72.0, 700.0, 172.0, 750.0));
        assert_eq!(display.x, 72.0);
        assert_eq!(display.y, 42.0);
        assert_eq!(display.width, 100.0);
        assert_eq!(display.height, 50.0);
    }

    fn completed_session(match_count: usize) -> Arc<SearchSession> {
        let mut session = SearchSession::running("cat".into(), SearchOptions::default());
        for i in 0..match_count {
            session.matches.push(Match {
                page_number: i,
                start_index: 0,
                length: 3,
                text: "cat".into(),
                rects: vec![PageRect::new(0.0, 0.0, 18.0, 10.0)],
            });
        }
        Arc::new(session.complete())
    }

    #[test]
    fn navigator_selects_first_match_and_wraps() {
        let mut nav = MatchNavigator::for_session(completed_session(3));
        assert_eq!(nav.current_index(), Some(0));

        nav.next();
        nav.next();
        assert_eq!(nav.current_index(), Some(2));
        nav.next();
        assert_eq!(nav.current_index(), Some(0));
        nav.previous();
        assert_eq!(nav.current_index(), Some(2));
    }

    #[test]
    fn navigator_is_inert_without_matches() {
        let mut nav = MatchNavigator::for_session(completed_session(0));
        assert_eq!(nav.state(), NavigationState::NoMatches);
        assert!(nav.next().is_none());
        assert!(nav.previous().is_none());

        let summary = nav.summary();
        assert_eq!(summary.total, 0);
        assert_eq!(summary.current_index, None);
    }

    #[test]
    fn navigator_ignores_non_completed_sessions() {
        let running = Arc::new(SearchSession::running("x".into(), SearchOptions::default()));
        let nav = MatchNavigator::for_session(running);
        assert_eq!(nav.state(), NavigationState::NoMatches);
    }

    #[test]
    fn canceling_discards_partial_matches() {
        let mut session = SearchSession::running("cat".into(), SearchOptions::default());
        session.matches.push(Match {
            page_number: 0,
            start_index: 0,
            length: 3,
            text: "cat".into(),
            rects: vec![PageRect::new(0.0, 0.0, 18.0, 10.0)],
        });
        let canceled = session.cancel();
        assert_eq!(canceled.state, SessionState::Canceled);
        assert!(canceled.matches.is_empty());
        assert!(canceled.is_terminal());
    }

    #[test]
    fn cache_builds_each_page_once() {
        let extractor = FakeExtractor::new(vec![vec!["one"], vec!["two"]]);
        let cache = TextIndexCache::new();

        let first = cache.get_or_build(&extractor, 0).unwrap();
        let again = cache.get_or_build(&extractor, 0).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);

        cache.get_or_build(&extractor, 1).unwrap();
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn cache_deduplicates_concurrent_builds() {
        struct SlowExtractor {
            calls: AtomicUsize,
        }

        impl CharacterExtractor for SlowExtractor {
            fn page_count(&self) -> usize {
                1
            }

            fn extract_page(&self, page_number: usize) -> Result<Vec<PageChar>, ExtractionError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(50));
                Ok(index_from_lines(page_number, &["slow page"])
                    .characters()
                    .to_vec())
            }
        }

        let extractor = Arc::new(SlowExtractor {
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(TextIndexCache::new());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let extractor = Arc::clone(&extractor);
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.get_or_build(extractor.as_ref(), 0).unwrap())
            })
            .collect();
        let indexes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
        for index in &indexes[1..] {
            assert!(Arc::ptr_eq(&indexes[0], index));
        }
    }

    #[test]
    fn cache_remembers_extraction_failure() {
        struct FailingExtractor {
            calls: AtomicUsize,
        }

        impl CharacterExtractor for FailingExtractor {
            fn page_count(&self) -> usize {
                1
            }

            fn extract_page(&self, _page_number: usize) -> Result<Vec<PageChar>, ExtractionError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(ExtractionError::Engine("damaged content stream".into()))
            }
        }

        let extractor = FailingExtractor {
            calls: AtomicUsize::new(0),
        };
        let cache = TextIndexCache::new();

        assert!(cache.get_or_build(&extractor, 0).is_err());
        assert!(cache.get_or_build(&extractor, 0).is_err());
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
        assert!(cache.cached(0).is_none());
    }

    #[test]
    fn document_id_is_stable_for_same_path() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("sample.pdf");
        std::fs::write(&file_path, b"dummy").unwrap();

        let first = document_id_for_path(&file_path);
        let second = document_id_for_path(&file_path);
        assert_eq!(first, second);

        let other = dir.path().join("other.pdf");
        std::fs::write(&other, b"dummy").unwrap();
        assert_ne!(first, document_id_for_path(&other));
    }

    #[tokio::test]
    async fn provider_trait_is_object_safe_for_async_open() {
        struct FakeProvider;

        #[async_trait::async_trait]
        impl DocumentTextProvider for FakeProvider {
            async fn open(&self, _path: &Path) -> Result<Arc<dyn CharacterExtractor>> {
                Ok(Arc::new(FakeExtractor::new(vec![vec!["hello"]])))
            }
        }

        let provider: Arc<dyn DocumentTextProvider> = Arc::new(FakeProvider);
        let extractor = provider.open(Path::new("/tmp/example.pdf")).await.unwrap();
        assert_eq!(extractor.page_count(), 1);
        let chars = extractor.extract_page(0).unwrap();
        assert_eq!(chars.len(), 5);
    }
}
