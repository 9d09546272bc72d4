use std::sync::LazyLock;

use anyhow::Result;
use indicatif::ProgressBar;
use regex::Regex;
use tracing::{info, warn};

use crate::api;
use crate::store::ClassifiedRecord;

pub const ATTRIBUTION_TEMPLATE: &str = "{{Biodiversity Heritage Library}}";

static BHL_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{\{BHL\s*\|.*?\}\}").unwrap());
static TRAILING_BRACES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\}\}.*").unwrap());
static NAME_CONFIRMED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"NameFound:([A-Za-z ]+)NameConfirmed").unwrap());
static NAME_FOUND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"NameFound:([A-Za-z ]+)").unwrap());

/// Fields of a `{{BHL |...}}` template block. Absent fields stay empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BhlTemplate {
    pub pageid: String,
    pub titleid: String,
    pub pagetypes: String,
    pub date: String,
    pub names: String,
}

pub fn parse_bhl_template(wikitext: &str) -> BhlTemplate {
    let Some(block) = BHL_BLOCK_RE.find(wikitext) else {
        return BhlTemplate::default();
    };
    let block = block.as_str();
    BhlTemplate {
        pageid: field(block, "pageid"),
        titleid: field(block, "titleid"),
        pagetypes: field(block, "pagetypes"),
        date: field(block, "date"),
        names: scientific_name(&field(block, "names")),
    }
}

fn field(block: &str, name: &str) -> String {
    // to end of line, or end of block when the value shares a line with }}
    let re = Regex::new(&format!(r"\|\s*{}\s*=\s*([^\n]*)", name)).unwrap();
    match re.captures(block) {
        Some(caps) => {
            let value = caps[1].trim();
            TRAILING_BRACES_RE.replace(value, "").trim().to_string()
        }
        None => String::new(),
    }
}

/// The BHL `names` field packs OCR results into marker pairs, e.g.
/// `NameFound:Dicholophus cristatus NameConfirmed:Dicholophus cristatus`.
/// Prefer the confirmed form, fall back to the found form, else keep raw.
fn scientific_name(raw: &str) -> String {
    if let Some(caps) = NAME_CONFIRMED_RE.captures(raw) {
        return caps[1].trim().to_string();
    }
    if let Some(caps) = NAME_FOUND_RE.captures(raw) {
        return caps[1].trim().to_string();
    }
    raw.to_string()
}

/// Insert the attribution template before the first `[[Category:` marker,
/// appending at the end when the page has no category. Returns `None` when
/// the template is already present.
pub fn insert_attribution(wikitext: &str) -> Option<String> {
    if wikitext.contains(ATTRIBUTION_TEMPLATE) {
        return None;
    }
    Some(match wikitext.find("[[Category:") {
        Some(idx) => format!(
            "{}{}\n{}",
            &wikitext[..idx],
            ATTRIBUTION_TEMPLATE,
            &wikitext[idx..]
        ),
        None => format!("{}\n{}\n", wikitext.trim_end(), ATTRIBUTION_TEMPLATE),
    })
}

pub struct TagSummary {
    pub tagged: usize,
    pub already_tagged: usize,
    pub failed: usize,
}

/// Add the attribution template to every detected file. Per-file failures
/// are logged and the sweep continues.
pub async fn tag_files(
    client: &api::Client,
    records: &[ClassifiedRecord],
    write: bool,
) -> Result<TagSummary> {
    let summary_text = format!("Bot: Adding {} before first category.", ATTRIBUTION_TEMPLATE);
    let token = if write {
        Some(client.csrf_token().await?)
    } else {
        None
    };

    let progress = ProgressBar::new(records.len() as u64);
    let mut summary = TagSummary {
        tagged: 0,
        already_tagged: 0,
        failed: 0,
    };

    for record in records {
        progress.inc(1);
        let title = record.title.as_str();
        if title.is_empty() {
            warn!("Skipping record with empty title");
            continue;
        }

        let old_text = match client.file_wikitext(&title.replace("File:", "")).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Could not load wikitext for {}: {:#}", title, e);
                summary.failed += 1;
                continue;
            }
        };

        let Some(new_text) = insert_attribution(&old_text) else {
            info!("Skipping {} because template is already present", title);
            summary.already_tagged += 1;
            continue;
        };

        match &token {
            Some(token) => {
                if let Err(e) = client
                    .edit_page(title, &new_text, &summary_text, token)
                    .await
                {
                    warn!("Error saving {}: {:#}", title, e);
                    summary.failed += 1;
                } else {
                    summary.tagged += 1;
                }
            }
            None => {
                println!("[dry run] would tag {}", title);
                summary.tagged += 1;
            }
        }
    }

    progress.finish_and_clear();
    Ok(summary)
}
