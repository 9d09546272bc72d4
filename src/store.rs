use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One classified search hit, as persisted in the YAML stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedRecord {
    pub title: String,
    pub snippet: String,
    pub commons_url: String,
}

/// Load previously persisted records, or an empty list when the file is
/// absent or holds an empty document. Records are append-only across runs.
pub fn load_records(path: &Path) -> Result<Vec<ClassifiedRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let records: Option<Vec<ClassifiedRecord>> = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(records.unwrap_or_default())
}

/// Overwrite the store in full so disk always mirrors memory.
pub fn save_records(path: &Path, records: &[ClassifiedRecord]) -> Result<()> {
    let text = serde_yaml::to_string(records)?;
    fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

/// One worksheet row per Commons file. The trailing columns (engraver,
/// lithographer, reference URL, Flickr fields) start empty and are filled
/// in by hand before upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRow {
    #[serde(rename = "File")]
    pub file: String,
    #[serde(rename = "BHL Page ID")]
    pub bhl_page_id: String,
    #[serde(rename = "Instance of")]
    pub instance_of: String,
    #[serde(rename = "Published In")]
    pub published_in: String,
    #[serde(rename = "Published In QID")]
    pub published_in_qid: String,
    #[serde(rename = "Collection")]
    pub collection: String,
    #[serde(rename = "Sponsor")]
    pub sponsor: String,
    #[serde(rename = "Bibliography ID")]
    pub bibliography_id: String,
    #[serde(rename = "Illustrator")]
    pub illustrator: String,
    #[serde(rename = "Inception")]
    pub inception: String,
    #[serde(rename = "Names")]
    pub names: String,
    #[serde(rename = "Engraver", default)]
    pub engraver: String,
    #[serde(rename = "Lithographer", default)]
    pub lithographer: String,
    #[serde(rename = "Ref URL for Authors", default)]
    pub ref_url_for_authors: String,
    #[serde(rename = "Flickr Tags", default)]
    pub flickr_tags: String,
    #[serde(rename = "Flickr ID", default)]
    pub flickr_id: String,
}

pub fn write_worksheet(path: &Path, rows: &[MetadataRow]) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn read_worksheet(path: &Path) -> Result<Vec<MetadataRow>> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    rdr.deserialize()
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing {}", path.display()))
}
