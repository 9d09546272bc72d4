use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::LazyLock;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::api::{self, Fetched, PageHit};
use crate::store::{self, ClassifiedRecord};

const COMMONS_PAGE_BASE: &str = "https://commons.wikimedia.org/wiki/";

/// Files that mention BHL but sit outside the attribution categories.
const SEARCH_QUERY: &str = "filetype:bitmap|drawing -fileres:0 biodiversitylibrary.org \
     -incategory:\"Files from the Biodiversity Heritage Library\" \
     -incategory:\"Biodiversity Heritage Library\"";

/// Provenance markers checked against the cleaned snippet. Any hit counts.
static SNIPPET_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bbiodiversitylibrary\.org\b",
        r"(?i)\bbiodivlibrary\b",
        r"(?i)https://doi\.org/10\.5962/bhl\.title",
        r"(?i)61021753@N02",
        r"(?i)Biodiversity  Heritage Library Flickr",
        r"(?i)This work is from the Biodiversity Heritage Library",
        r"(?i)BHL Collection",
        r"(?i)author name string: Biodiversity Heritage",
        r"(?i)DescriptionHortus Eystettensis",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Markers that also make sense inside a file title: the domain, the short
/// alias, the DOI prefix, and the BHL Flickr account ID.
static TITLE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bbiodiversitylibrary\.org\b",
        r"(?i)\bbiodivlibrary\b",
        r"(?i)https://doi\.org/10\.5962/bhl\.title",
        r"(?i)61021753@N02",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());

/// Opaque cursor echoed back to the API on the next request.
pub type Continuation = BTreeMap<String, Value>;

pub fn base_params() -> Vec<(String, String)> {
    [
        ("action", "query"),
        ("format", "json"),
        ("uselang", "en"),
        ("generator", "search"),
        ("gsrsearch", SEARCH_QUERY),
        ("gsrlimit", "50"),
        ("gsrinfo", "totalhits|suggestion"),
        ("gsrprop", "size|wordcount|timestamp|snippet"),
        ("gsrnamespace", "6"),
        ("prop", "info|imageinfo|entityterms"),
        ("inprop", "url"),
        ("iiprop", "url|size|mime"),
        ("iiurlheight", "180"),
        ("wbetterms", "label"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Merge continuation fields into the static query. The `continue` key is a
/// pagination sentinel, not a parameter, and is never echoed back.
pub fn merge_continuation(
    base: &[(String, String)],
    cont: &Continuation,
) -> Vec<(String, String)> {
    let mut params = base.to_vec();
    for (key, value) in cont {
        if key == "continue" {
            continue;
        }
        let value = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        params.push((key.clone(), value));
    }
    params
}

/// Remove tag-like markup, then decode HTML entities. Snippets that fail
/// entity decoding keep their raw text.
pub fn strip_markup(snippet: &str) -> String {
    let stripped = TAG_RE.replace_all(snippet, "");
    match quick_xml::escape::unescape(&stripped) {
        Ok(text) => text.into_owned(),
        Err(_) => stripped.into_owned(),
    }
}

pub fn is_bhl_match(snippet: &str, title: &str) -> bool {
    SNIPPET_PATTERNS.iter().any(|re| re.is_match(snippet))
        || TITLE_PATTERNS.iter().any(|re| re.is_match(title))
}

pub fn commons_url(title: &str) -> String {
    format!("{}{}", COMMONS_PAGE_BASE, urlencoding::encode(title))
}

/// The two accumulator sets, owned by the running command. Seeded from the
/// stores at start, flushed back after every page.
#[derive(Debug, Default)]
pub struct Accumulators {
    pub matched: Vec<ClassifiedRecord>,
    pub unmatched: Vec<ClassifiedRecord>,
}

impl Accumulators {
    /// Every item lands in exactly one of the two sets.
    pub fn classify(&mut self, hit: &PageHit) {
        let snippet = strip_markup(&hit.snippet);
        let record = ClassifiedRecord {
            title: hit.title.clone(),
            snippet: snippet.clone(),
            commons_url: commons_url(&hit.title),
        };
        if is_bhl_match(&snippet, &hit.title) {
            self.matched.push(record);
        } else {
            self.unmatched.push(record);
        }
    }

    pub fn total(&self) -> usize {
        self.matched.len() + self.unmatched.len()
    }
}

/// Destinations for the two accumulator sets.
pub struct DetectStores {
    pub matched_path: PathBuf,
    pub unmatched_path: PathBuf,
}

impl DetectStores {
    pub fn load(&self) -> Result<Accumulators> {
        Ok(Accumulators {
            matched: store::load_records(&self.matched_path)?,
            unmatched: store::load_records(&self.unmatched_path)?,
        })
    }

    pub fn flush(&self, acc: &Accumulators) -> Result<()> {
        store::save_records(&self.matched_path, &acc.matched)?;
        store::save_records(&self.unmatched_path, &acc.unmatched)?;
        Ok(())
    }
}

/// Where one search page comes from. The production source wraps the
/// Commons API client; tests feed canned responses through the same seam.
pub trait SearchSource {
    async fn fetch(&mut self, params: &[(String, String)]) -> Result<Fetched>;
}

pub struct CommonsSearch {
    client: api::Client,
}

impl CommonsSearch {
    pub fn new(client: api::Client) -> Self {
        Self { client }
    }
}

impl SearchSource for CommonsSearch {
    async fn fetch(&mut self, params: &[(String, String)]) -> Result<Fetched> {
        self.client.search_page(params).await
    }
}

pub struct DetectSummary {
    /// Total records in each store, including those seeded from prior runs.
    pub matched: usize,
    pub unmatched: usize,
    /// Items classified during this run.
    pub processed: usize,
    pub pages: usize,
}

/// The paginated classify-and-persist loop. Both stores are rewritten after
/// every page, so an interrupt loses at most the in-flight page.
pub async fn run<S: SearchSource>(
    source: &mut S,
    stores: &DetectStores,
    max_pages: Option<usize>,
) -> Result<DetectSummary> {
    let mut acc = stores.load()?;
    if acc.total() > 0 {
        info!(
            "Resuming with {} previously classified records ({} matched)",
            acc.total(),
            acc.matched.len()
        );
    }

    let base = base_params();
    let mut cont = Continuation::new();
    let mut pages = 0usize;
    let mut processed = 0usize;
    let mut progress: Option<ProgressBar> = None;

    loop {
        let params = merge_continuation(&base, &cont);
        let response = match source.fetch(&params).await? {
            Fetched::Page(response) => response,
            Fetched::HttpError(status) => {
                warn!("Error fetching data: HTTP {}", status);
                break;
            }
        };

        // totalhits is progress reporting only; the loop does not depend on it.
        if progress.is_none() {
            let totalhits = response
                .query
                .as_ref()
                .and_then(|q| q.searchinfo.as_ref())
                .and_then(|info| info.totalhits)
                .unwrap_or(0);
            let bar = ProgressBar::new(totalhits);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:40} {pos}/{len} files")
                    .unwrap()
                    .progress_chars("=> "),
            );
            progress = Some(bar);
        }

        let mut hits: Vec<&PageHit> = response
            .query
            .as_ref()
            .map(|q| q.pages.values().collect())
            .unwrap_or_default();
        hits.sort_by_key(|hit| hit.index.unwrap_or(i64::MAX));

        for hit in hits {
            acc.classify(hit);
            processed += 1;
            if let Some(bar) = &progress {
                bar.inc(1);
            }
        }

        stores.flush(&acc)?;
        pages += 1;

        if response.batchcomplete.is_some() {
            debug!("batch complete");
        }

        match response.cont {
            Some(next) => {
                debug!(?next, "next continuation");
                cont = next;
            }
            None => break,
        }

        if let Some(max) = max_pages {
            if pages >= max {
                info!("Stopping after {} pages (--limit)", pages);
                break;
            }
        }
    }

    if let Some(bar) = progress {
        bar.finish_and_clear();
    }

    Ok(DetectSummary {
        matched: acc.matched.len(),
        unmatched: acc.unmatched.len(),
        processed,
        pages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{QueryBody, SearchInfo, SearchResponse};
    use serde_json::json;
    use std::collections::VecDeque;

    struct FakeSource {
        responses: VecDeque<Fetched>,
        calls: usize,
    }

    impl FakeSource {
        fn new(responses: Vec<Fetched>) -> Self {
            Self {
                responses: responses.into(),
                calls: 0,
            }
        }
    }

    impl SearchSource for FakeSource {
        async fn fetch(&mut self, _params: &[(String, String)]) -> Result<Fetched> {
            self.calls += 1;
            Ok(self
                .responses
                .pop_front()
                .expect("source exhausted: loop did not terminate"))
        }
    }

    fn hit(title: &str, snippet: &str, index: i64) -> (String, PageHit) {
        (
            index.to_string(),
            PageHit {
                title: title.to_string(),
                snippet: snippet.to_string(),
                index: Some(index),
            },
        )
    }

    fn page(hits: Vec<(String, PageHit)>, with_continuation: bool, totalhits: u64) -> Fetched {
        let cont = with_continuation.then(|| {
            BTreeMap::from([
                ("gsroffset".to_string(), json!(50)),
                ("continue".to_string(), json!("gsroffset||")),
            ])
        });
        Fetched::Page(SearchResponse {
            query: Some(QueryBody {
                searchinfo: Some(SearchInfo {
                    totalhits: Some(totalhits),
                }),
                pages: hits.into_iter().collect(),
            }),
            cont,
            batchcomplete: None,
        })
    }

    fn temp_stores(tag: &str) -> DetectStores {
        let dir = std::env::temp_dir();
        let stores = DetectStores {
            matched_path: dir.join(format!("bhl_detect_{}_matched.yaml", tag)),
            unmatched_path: dir.join(format!("bhl_detect_{}_unmatched.yaml", tag)),
        };
        let _ = std::fs::remove_file(&stores.matched_path);
        let _ = std::fs::remove_file(&stores.unmatched_path);
        stores
    }

    #[test]
    fn strips_span_and_classifies_matched() {
        let cleaned = strip_markup("<span>biodiversitylibrary.org</span>");
        assert_eq!(cleaned, "biodiversitylibrary.org");
        assert!(is_bhl_match(&cleaned, ""));
    }

    #[test]
    fn decodes_entities() {
        assert_eq!(
            strip_markup("Hortus &quot;Eystettensis&quot; &amp; co"),
            "Hortus \"Eystettensis\" & co"
        );
    }

    #[test]
    fn title_without_listed_pattern_is_unmatched() {
        // "BHL Flickr" alone is not a provenance marker
        assert!(!is_bhl_match("", "File:BHL Flickr 12345.jpg"));
    }

    #[test]
    fn provenance_markers_match() {
        assert!(is_bhl_match("see https://doi.org/10.5962/bhl.title.123", ""));
        assert!(is_bhl_match("uploaded from 61021753@N02", ""));
        assert!(is_bhl_match("part of the bhl collection", ""));
        assert!(is_bhl_match("", "File:Image from biodivlibrary stream.jpg"));
        assert!(!is_bhl_match("an unrelated botanical plate", "File:Plate.jpg"));
    }

    #[test]
    fn continuation_merge_excludes_sentinel() {
        let base = vec![("action".to_string(), "query".to_string())];
        let cont = BTreeMap::from([
            ("continue".to_string(), json!("gsroffset||")),
            ("gsroffset".to_string(), json!(100)),
        ]);
        let params = merge_continuation(&base, &cont);
        assert!(params.contains(&("gsroffset".to_string(), "100".to_string())));
        assert!(!params.iter().any(|(k, _)| k == "continue"));
    }

    #[test]
    fn commons_url_percent_encodes_title() {
        assert_eq!(
            commons_url("File:A plate.jpg"),
            "https://commons.wikimedia.org/wiki/File%3AA%20plate.jpg"
        );
    }

    #[tokio::test]
    async fn two_page_run_classifies_and_flushes_per_page() {
        let stores = temp_stores("two_page");
        let mut source = FakeSource::new(vec![
            page(
                vec![
                    hit("File:A.jpg", "from <span>biodivlibrary</span>", 1),
                    hit("File:B.jpg", "an unrelated plate", 2),
                ],
                true,
                3,
            ),
            page(
                vec![hit("File:C.jpg", "BHL Collection scan", 1)],
                false,
                3,
            ),
        ]);

        let summary = run(&mut source, &stores, None).await.unwrap();
        assert_eq!(source.calls, 2);
        assert_eq!(summary.pages, 2);
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.matched, 2);
        assert_eq!(summary.unmatched, 1);

        let matched = store::load_records(&stores.matched_path).unwrap();
        let unmatched = store::load_records(&stores.unmatched_path).unwrap();
        assert_eq!(matched.len() + unmatched.len(), 3);
        assert_eq!(matched[0].title, "File:A.jpg");
        assert_eq!(matched[0].snippet, "from biodivlibrary");
    }

    #[tokio::test]
    async fn resume_seeds_accumulators_from_disk() {
        let stores = temp_stores("resume");
        store::save_records(
            &stores.matched_path,
            &[ClassifiedRecord {
                title: "File:Old.jpg".into(),
                snippet: "biodivlibrary".into(),
                commons_url: commons_url("File:Old.jpg"),
            }],
        )
        .unwrap();

        let mut source = FakeSource::new(vec![page(
            vec![hit("File:New.jpg", "nothing of note", 1)],
            false,
            1,
        )]);

        let summary = run(&mut source, &stores, None).await.unwrap();
        assert_eq!(summary.matched, 1);
        assert_eq!(summary.unmatched, 1);
        assert_eq!(summary.processed, 1);

        // The pre-existing record survived the overwrite
        let matched = store::load_records(&stores.matched_path).unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].title, "File:Old.jpg");
    }

    #[tokio::test]
    async fn http_error_keeps_prior_pages() {
        let stores = temp_stores("http_error");
        let mut source = FakeSource::new(vec![
            page(
                vec![
                    hit("File:A.jpg", "biodiversitylibrary.org", 1),
                    hit("File:B.jpg", "plain", 2),
                ],
                true,
                10,
            ),
            Fetched::HttpError(503),
        ]);

        let summary = run(&mut source, &stores, None).await.unwrap();
        assert_eq!(summary.pages, 1);
        assert_eq!(summary.processed, 2);

        let matched = store::load_records(&stores.matched_path).unwrap();
        let unmatched = store::load_records(&stores.unmatched_path).unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(unmatched.len(), 1);
        // nothing from the never-received page 2
        assert!(matched.iter().chain(&unmatched).all(|r| r.title != "File:C.jpg"));
    }

    #[tokio::test]
    async fn page_limit_stops_early() {
        let stores = temp_stores("limit");
        let mut source = FakeSource::new(vec![
            page(vec![hit("File:A.jpg", "", 1)], true, 100),
        ]);

        let summary = run(&mut source, &stores, Some(1)).await.unwrap();
        assert_eq!(summary.pages, 1);
        assert_eq!(source.calls, 1);
    }
}
