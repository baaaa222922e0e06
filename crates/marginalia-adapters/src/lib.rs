//! Notebook page adapters: HTML extraction, highlight dates, and the scrape loop.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use marginalia_core::{format_timestamp, HighlightRecord, TIMESTAMP_FORMAT};
use marginalia_storage::ArtifactStore;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, info, warn};

mod browser;

pub use browser::{interactive_login, ChromeNotebookSource, ChromeSourceConfig};

pub const CRATE_NAME: &str = "marginalia-adapters";

pub const SUPPORTED_REGIONS: [&str; 2] = ["com", "co.uk"];

pub const LIBRARY_READY_SELECTOR: &str = "#kp-notebook-library, .kp-notebook-library, [id*='notebook']";

pub const BOOK_SELECTORS: [&str; 4] = [
    ".kp-notebook-library-each-book",
    "[id^='library-section'] .a-row",
    ".library-book",
    "div[data-asin]",
];

pub const TITLE_SELECTORS: [&str; 5] = [
    "h2",
    ".kp-notebook-searchable",
    ".book-title",
    "span[id*='title']",
    "a",
];

pub const HIGHLIGHT_SELECTORS: [&str; 5] = [
    "#highlight",
    ".kp-notebook-highlight",
    "[id*='highlight']",
    ".highlight-text",
    ".a-size-base-plus",
];

pub const TIME_SELECTORS: [&str; 4] = [
    "#annotationHighlightHeader",
    ".kp-notebook-metadata",
    "[id*='highlight'] + *",
    ".a-color-secondary",
];

pub fn notebook_url(region: &str) -> String {
    format!("https://read.amazon.{region}/notebook")
}

pub fn is_sign_in_url(url: &str) -> bool {
    url.to_ascii_lowercase().contains("signin")
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("auth session expired (redirected to {0}); regenerate auth.json with `marginalia login`")]
    AuthExpired(String),
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
    #[error("fixture page missing: {0}")]
    MissingFixture(PathBuf),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Browser(#[from] anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How to get back to a book element on the library page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookLocator {
    Attribute { name: &'static str, value: String },
    Nth { selector: &'static str, index: usize },
}

impl BookLocator {
    /// Selector matching exactly this book; `None` for positional locators,
    /// whose selector matches every book.
    pub fn css(&self) -> Option<String> {
        match self {
            BookLocator::Attribute { name, value } => {
                Some(format!("[{name}=\"{}\"]", value.replace('"', "\\\"")))
            }
            BookLocator::Nth { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookEntry {
    pub title: String,
    pub locator: BookLocator,
}

/// Supplies raw notebook HTML; the browser session and the fixture directory
/// both implement it so extraction is tested against saved pages.
pub trait NotebookSource {
    fn library_html(&self) -> Result<String, AdapterError>;
    fn book_html(&self, book: &BookEntry) -> Result<String, AdapterError>;
}

#[derive(Debug, Clone, Copy)]
pub struct ScrapeOptions {
    pub max_books: usize,
    pub max_candidates: usize,
    pub min_text_chars: usize,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        Self {
            max_books: 10,
            max_candidates: 5,
            min_text_chars: 10,
        }
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn element_text(el: ElementRef<'_>) -> Option<String> {
    text_or_none(el.text().collect::<String>())
}

fn first_text_within(el: ElementRef<'_>, candidates: &[&str]) -> Result<Option<String>, AdapterError> {
    for css in candidates {
        let sel = selector(css)?;
        if let Some(text) = el.select(&sel).next().and_then(element_text) {
            return Ok(Some(text));
        }
    }
    Ok(None)
}

/// Books listed on the library page, in page order, capped at `max_books`
/// candidates. Elements without a readable title are skipped.
pub fn parse_library(html: &str, max_books: usize) -> Result<Vec<BookEntry>, AdapterError> {
    let document = Html::parse_document(html);

    for css in BOOK_SELECTORS {
        let sel = selector(css)?;
        let elements = document.select(&sel).collect::<Vec<_>>();
        if elements.is_empty() {
            continue;
        }
        debug!(selector = css, count = elements.len(), "found books");

        let mut books = Vec::new();
        for (index, el) in elements.into_iter().take(max_books).enumerate() {
            let Some(title) = first_text_within(el, &TITLE_SELECTORS)? else {
                debug!(index, "skipping book element without title");
                continue;
            };
            let locator = if let Some(id) = el.value().attr("id").filter(|v| !v.is_empty()) {
                BookLocator::Attribute { name: "id", value: id.to_string() }
            } else if let Some(asin) = el.value().attr("data-asin").filter(|v| !v.is_empty()) {
                BookLocator::Attribute { name: "data-asin", value: asin.to_string() }
            } else {
                BookLocator::Nth { selector: css, index }
            };
            books.push(BookEntry { title, locator });
        }
        return Ok(books);
    }

    Ok(Vec::new())
}

/// First highlight on a book's annotation page that is long enough to be
/// worth showing, with the first parseable date found on the page.
pub fn parse_book_highlight(
    html: &str,
    options: &ScrapeOptions,
) -> Result<Option<(String, Option<String>)>, AdapterError> {
    let document = Html::parse_document(html);

    let mut candidates = Vec::new();
    for css in HIGHLIGHT_SELECTORS {
        let sel = selector(css)?;
        candidates = document.select(&sel).collect::<Vec<_>>();
        if !candidates.is_empty() {
            break;
        }
    }

    let Some(text) = candidates
        .into_iter()
        .take(options.max_candidates)
        .filter_map(element_text)
        .find(|t| t.chars().count() >= options.min_text_chars)
    else {
        return Ok(None);
    };

    let mut highlight_time = None;
    for css in TIME_SELECTORS {
        let sel = selector(css)?;
        let parsed = document
            .select(&sel)
            .next()
            .and_then(element_text)
            .and_then(|t| parse_highlight_time(&t));
        if parsed.is_some() {
            highlight_time = parsed;
            break;
        }
    }

    Ok(Some((text, highlight_time)))
}

/// Extracts a calendar date such as `Monday 28 February 2026`,
/// `February 28, 2026` or `28 Feb 2026` and returns it as midnight UTC.
/// Relative phrases ("Yesterday", "2 hours ago") yield `None`.
pub fn parse_highlight_time(text: &str) -> Option<String> {
    let tokens = text
        .split(|c: char| c.is_whitespace() || c == '|')
        .map(|t| t.trim_matches(|c: char| c == ',' || c == '.'))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>();
    if tokens.len() < 3 {
        return None;
    }

    let is_day = |t: &str| (1..=2).contains(&t.len()) && t.chars().all(|c| c.is_ascii_digit());
    let is_year = |t: &str| t.len() == 4 && t.chars().all(|c| c.is_ascii_digit());
    let is_word = |t: &str| t.chars().all(|c| c.is_alphabetic());

    let day_first = tokens.windows(3).find_map(|w| {
        if is_day(w[0]) && is_word(w[1]) && is_year(w[2]) {
            NaiveDate::parse_from_str(&format!("{} {} {}", w[0], w[1], w[2]), "%d %B %Y").ok()
        } else {
            None
        }
    });
    let date = day_first.or_else(|| {
        tokens.windows(3).find_map(|w| {
            if is_word(w[0]) && is_day(w[1]) && is_year(w[2]) {
                NaiveDate::parse_from_str(&format!("{} {} {}", w[0], w[1], w[2]), "%B %d %Y").ok()
            } else {
                None
            }
        })
    })?;

    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.format(TIMESTAMP_FORMAT).to_string())
}

/// Walks the library and returns at most one highlight per book. Every record
/// carries the same `fetched_at`, taken once by the caller for the whole run.
pub fn scrape_highlights(
    source: &dyn NotebookSource,
    options: &ScrapeOptions,
    fetched_at: DateTime<Utc>,
    artifacts: Option<&ArtifactStore>,
) -> Result<Vec<HighlightRecord>, AdapterError> {
    let fetched_at_text = format_timestamp(fetched_at);
    let library = source.library_html()?;
    let books = parse_library(&library, options.max_books)?;

    if books.is_empty() {
        warn!("no books found on the notebook page");
        if let Some(store) = artifacts {
            match store.store_bytes(fetched_at, "library", "html", library.as_bytes()) {
                Ok(stored) => info!(path = %stored.absolute_path.display(), "saved library page for debugging"),
                Err(err) => warn!(error = %err, "could not save library page"),
            }
        }
        return Ok(Vec::new());
    }
    info!(books = books.len(), "processing books");

    let mut highlights = Vec::new();
    for (i, book) in books.iter().enumerate() {
        let short_title = book.title.chars().take(50).collect::<String>();
        debug!(index = i, title = %short_title, "processing book");

        let html = match source.book_html(book) {
            Ok(html) => html,
            Err(err) => {
                warn!(index = i, title = %short_title, error = %err, "could not open book");
                continue;
            }
        };
        match parse_book_highlight(&html, options) {
            Ok(Some((text, highlight_time))) => highlights.push(HighlightRecord::new(
                book.title.clone(),
                text,
                highlight_time,
                fetched_at_text.clone(),
            )),
            Ok(None) => debug!(index = i, title = %short_title, "no usable highlight"),
            Err(err) => warn!(index = i, title = %short_title, error = %err, "error processing book"),
        }
    }

    info!(count = highlights.len(), "scraped highlights");
    Ok(highlights)
}

/// Saved notebook pages on disk: `library.html` plus `books/<slug>.html`,
/// where the slug comes from the book's id attribute or, failing that, its title.
#[derive(Debug, Clone)]
pub struct FixtureNotebookSource {
    root: PathBuf,
}

impl FixtureNotebookSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn book_path(&self, book: &BookEntry) -> PathBuf {
        let key = match &book.locator {
            BookLocator::Attribute { value, .. } => value.as_str(),
            BookLocator::Nth { .. } => book.title.as_str(),
        };
        self.root.join("books").join(format!("{}.html", fixture_slug(key)))
    }

    fn read(&self, path: &Path) -> Result<String, AdapterError> {
        if !path.exists() {
            return Err(AdapterError::MissingFixture(path.to_path_buf()));
        }
        Ok(fs::read_to_string(path)?)
    }
}

impl NotebookSource for FixtureNotebookSource {
    fn library_html(&self) -> Result<String, AdapterError> {
        self.read(&self.root.join("library.html"))
    }

    fn book_html(&self, book: &BookEntry) -> Result<String, AdapterError> {
        self.read(&self.book_path(book))
    }
}

fn fixture_slug(input: &str) -> String {
    input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::cell::RefCell;
    use tempfile::tempdir;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fetched_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap()
    }

    #[test]
    fn parses_absolute_dates_in_notebook_formats() {
        assert_eq!(
            parse_highlight_time("Monday 28 February 2026").as_deref(),
            Some("2026-02-28T00:00:00Z")
        );
        assert_eq!(
            parse_highlight_time("February 28, 2026").as_deref(),
            Some("2026-02-28T00:00:00Z")
        );
        assert_eq!(
            parse_highlight_time("28 Feb 2026").as_deref(),
            Some("2026-02-28T00:00:00Z")
        );
        assert_eq!(
            parse_highlight_time("Last annotated: Sunday March 1, 2026").as_deref(),
            Some("2026-03-01T00:00:00Z")
        );
    }

    #[test]
    fn relative_or_garbled_dates_are_none() {
        assert_eq!(parse_highlight_time(""), None);
        assert_eq!(parse_highlight_time("Yesterday"), None);
        assert_eq!(parse_highlight_time("2 hours ago"), None);
        assert_eq!(parse_highlight_time("Yellow highlight | Location: 1234"), None);
        assert_eq!(parse_highlight_time("31 February 2026"), None);
    }

    #[test]
    fn library_falls_back_through_selectors() {
        let html = r#"
            <div id="library-section-1">
              <div class="a-row"><span id="book-title-1">  </span><a>Fallback Link Title</a></div>
              <div class="a-row"><span id="book-title-2">Second Book</span></div>
            </div>"#;
        let books = parse_library(html, 10).unwrap();
        assert_eq!(books.len(), 2);
        assert_eq!(books[0].title, "Fallback Link Title");
        assert_eq!(
            books[1].locator,
            BookLocator::Nth { selector: "[id^='library-section'] .a-row", index: 1 }
        );
        assert_eq!(books[1].locator.css(), None);
    }

    #[test]
    fn library_respects_book_cap_and_skips_untitled() {
        let html = (0..12)
            .map(|i| {
                if i == 1 {
                    format!(r#"<div class="kp-notebook-library-each-book" id="B{i:03}"></div>"#)
                } else {
                    format!(r#"<div class="kp-notebook-library-each-book" id="B{i:03}"><h2>Book {i}</h2></div>"#)
                }
            })
            .collect::<String>();
        let books = parse_library(&html, 10).unwrap();
        assert_eq!(books.len(), 9);
        assert_eq!(books[0].locator.css().as_deref(), Some(r#"[id="B000"]"#));
        assert_eq!(books.last().unwrap().title, "Book 9");
    }

    #[test]
    fn book_highlight_skips_short_candidates_and_reads_date() {
        let html = r#"
            <span id="kp-notebook-annotated-date" class="a-color-secondary">Friday February 27, 2026</span>
            <div id="annotationHighlightHeader">Yellow highlight | Location: 12</div>
            <span id="highlight">Short</span>
            <span id="highlight">  The first long enough highlight.  </span>
            <span id="highlight">Another long highlight that is ignored.</span>"#;
        let (text, time) = parse_book_highlight(html, &ScrapeOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(text, "The first long enough highlight.");
        assert_eq!(time.as_deref(), Some("2026-02-27T00:00:00Z"));
    }

    #[test]
    fn book_highlight_reads_date_next_to_highlight_metadata() {
        let html = r#"
            <div id="annotationHighlightHeader">Blue highlight | Page: 3</div>
            <div id="highlight-meta"></div><span class="note-date">Added on Friday February 27, 2026</span>
            <span id="highlight">A highlight that is long enough.</span>
            <span class="a-color-secondary">Monday 2 March 2026</span>"#;
        let (_, time) = parse_book_highlight(html, &ScrapeOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(time.as_deref(), Some("2026-02-27T00:00:00Z"));
    }

    #[test]
    fn book_highlight_only_considers_first_candidates() {
        let spans = (0..5).map(|_| r#"<span id="highlight">tiny</span>"#).collect::<String>();
        let html = format!(r#"{spans}<span id="highlight">Sixth candidate is long enough</span>"#);
        assert!(parse_book_highlight(&html, &ScrapeOptions::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn scrape_fixture_notebook() {
        let source = FixtureNotebookSource::new(workspace_root().join("fixtures/notebook"));
        let records = scrape_highlights(&source, &ScrapeOptions::default(), fetched_at(), None).unwrap();

        let titles = records.iter().map(|r| r.book_title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["Dune", "Le Petit Prince", "Meditations"]);
        assert!(records.iter().all(|r| r.fetched_at == "2026-03-01T06:00:00Z"));
        assert_eq!(records[0].highlight_time.as_deref(), Some("2026-02-27T00:00:00Z"));
        assert_eq!(records[1].highlight_text, "On ne voit bien qu'avec le cœur.");
        assert_eq!(records[2].highlight_time, None);
    }

    struct EmptyLibrary;

    impl NotebookSource for EmptyLibrary {
        fn library_html(&self) -> Result<String, AdapterError> {
            Ok("<html><body>Nothing here</body></html>".into())
        }

        fn book_html(&self, _book: &BookEntry) -> Result<String, AdapterError> {
            unreachable!("no books to open")
        }
    }

    #[test]
    fn empty_library_dumps_page_for_debugging() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let records =
            scrape_highlights(&EmptyLibrary, &ScrapeOptions::default(), fetched_at(), Some(&store)).unwrap();
        assert!(records.is_empty());
        assert!(dir.path().join("20260301_060000").join("library").exists());
    }

    struct FlakySource {
        opened: RefCell<Vec<String>>,
    }

    impl NotebookSource for FlakySource {
        fn library_html(&self) -> Result<String, AdapterError> {
            Ok(r#"<div data-asin="A1"><h2>Broken</h2></div><div data-asin="A2"><h2>Fine</h2></div>"#.into())
        }

        fn book_html(&self, book: &BookEntry) -> Result<String, AdapterError> {
            self.opened.borrow_mut().push(book.title.clone());
            if book.title == "Broken" {
                return Err(AdapterError::Message("click failed".into()));
            }
            Ok(r#"<span class="kp-notebook-highlight">A highlight worth keeping</span>"#.into())
        }
    }

    #[test]
    fn one_failing_book_does_not_stop_the_run() {
        let source = FlakySource { opened: RefCell::new(Vec::new()) };
        let records = scrape_highlights(&source, &ScrapeOptions::default(), fetched_at(), None).unwrap();
        assert_eq!(*source.opened.borrow(), vec!["Broken".to_string(), "Fine".to_string()]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].book_title, "Fine");
    }

    #[test]
    fn notebook_urls_and_sign_in_detection() {
        assert_eq!(notebook_url("co.uk"), "https://read.amazon.co.uk/notebook");
        assert!(is_sign_in_url("https://www.amazon.com/ap/signin?openid.return_to=x"));
        assert!(!is_sign_in_url("https://read.amazon.com/notebook"));
    }

    #[test]
    fn missing_fixture_page_is_reported() {
        let source = FixtureNotebookSource::new("/nonexistent/notebook");
        assert!(matches!(source.library_html(), Err(AdapterError::MissingFixture(_))));
    }
}
