use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use indicatif::ProgressBar;
use regex::Regex;
use tracing::{info, warn};

use crate::api;
use crate::wikidata;

static TAXON_CATEGORY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+?) - botanical illustrations$").unwrap());

/// Reference marker: statement inferred from the Commons category structure.
const Q_INFERRED_FROM_CATEGORY: &str = "Q131478853";

pub fn species_from_category(category: &str) -> Option<&str> {
    TAXON_CATEGORY_RE
        .captures(category)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

pub fn p180_line(media_id: &str, taxon_qid: &str) -> String {
    format!(
        "{}\tP180\t{}\tS887\t{}",
        media_id, taxon_qid, Q_INFERRED_FROM_CATEGORY
    )
}

pub fn p18_line(taxon_qid: &str, file: &str) -> String {
    format!(
        "{}\tP18\t\"{}\"\tS887\t{}",
        taxon_qid, file, Q_INFERRED_FROM_CATEGORY
    )
}

pub fn p13162_line(taxon_qid: &str, file: &str) -> String {
    format!(
        "{}\tP13162\t\"{}\"\tS887\t{}",
        taxon_qid, file, Q_INFERRED_FROM_CATEGORY
    )
}

/// QuickStatements batches plus the review logs, one output file each.
#[derive(Debug, Default)]
pub struct SweepOutputs {
    pub commons_statements: Vec<String>,
    pub p18_statements: Vec<String>,
    pub reference_single: Vec<String>,
    pub reference_double: Vec<String>,
    pub manual_log: Vec<String>,
    pub two_file_log: Vec<String>,
}

impl SweepOutputs {
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        write_lines(&dir.join("commons_quickstatements.txt"), &self.commons_statements)?;
        write_lines(&dir.join("p18_quickstatements.txt"), &self.p18_statements)?;
        write_lines(&dir.join("quickstatements_1.txt"), &self.reference_single)?;
        write_lines(&dir.join("quickstatements_2.txt"), &self.reference_double)?;
        write_lines(&dir.join("manual_log.txt"), &self.manual_log)?;
        write_lines(&dir.join("log_2_files.txt"), &self.two_file_log)?;
        Ok(())
    }
}

fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    let mut text = lines.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

async fn sweep_taxon(
    client: &api::Client,
    taxon_category: &str,
    species: &str,
    out: &mut SweepOutputs,
) -> Result<()> {
    let files = client.category_files(taxon_category).await?;
    let file_count = files.len();

    let Some(taxon_qid) = client.search_entity(species).await? else {
        info!("No Wikidata item found for {}", species);
        out.manual_log
            .push(format!("https://commons.wikimedia.org/wiki/{}", taxon_category));
        return Ok(());
    };

    for file in &files {
        match client.media_info_id(file).await {
            Ok(media_id) => out.commons_statements.push(p180_line(&media_id, &taxon_qid)),
            Err(e) => warn!("No M-ID for {}: {:#}", file, e),
        }
    }

    if file_count == 1 {
        let missing = wikidata::missing_p18(client, std::slice::from_ref(&taxon_qid)).await?;
        if missing.contains(&taxon_qid) {
            out.p18_statements.push(p18_line(&taxon_qid, &files[0]));
        }
    }

    match file_count {
        1 => out.reference_single.push(p13162_line(&taxon_qid, &files[0])),
        2 => {
            out.reference_double.push(p13162_line(&taxon_qid, &files[0]));
            out.reference_double.push(p13162_line(&taxon_qid, &files[1]));
            out.two_file_log.push(taxon_category.to_string());
        }
        _ => out
            .manual_log
            .push(format!("https://commons.wikimedia.org/wiki/{}", taxon_category)),
    }

    Ok(())
}

/// Walk a genus/species category tree and emit QuickStatements linking each
/// taxon to its Commons illustrations. Per-taxon failures are logged and the
/// sweep continues.
pub async fn run(client: &api::Client, root_category: &str) -> Result<SweepOutputs> {
    let genera = client.subcategories(root_category).await?;
    info!("Top-level category has {} subcategories", genera.len());

    let mut out = SweepOutputs::default();
    let progress = ProgressBar::new(genera.len() as u64);

    for genus in &genera {
        progress.inc(1);
        if genus.contains("Unidentified") {
            continue;
        }
        let taxa = client.subcategories(genus).await?;
        for taxon_category in &taxa {
            let Some(species) = species_from_category(taxon_category) else {
                continue;
            };
            if let Err(e) = sweep_taxon(client, taxon_category, species, &mut out).await {
                warn!("Skipping {}: {:#}", taxon_category, e);
                out.manual_log.push(format!(
                    "https://commons.wikimedia.org/wiki/{}",
                    taxon_category
                ));
            }
        }
    }

    progress.finish_and_clear();
    Ok(out)
}
