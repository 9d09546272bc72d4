use anyhow::Result;
use indicatif::ProgressBar;
use tracing::warn;

use crate::api;
use crate::bhl::{self, BibliographyDetails};
use crate::store::MetadataRow;
use crate::wikidata::{self, Publication};
use crate::wikitext::{self, BhlTemplate};

/// Operator-supplied values filling gaps the automatic lookups leave.
#[derive(Debug, Default)]
pub struct Overrides {
    pub collection: Option<String>,
    pub sponsor: Option<String>,
    pub illustrator: Option<String>,
}

pub fn normalize_category(raw: &str) -> String {
    raw.replace('_', " ").replace("Category:", "").trim().to_string()
}

fn assemble_row(
    file: &str,
    template: &BhlTemplate,
    publication: &Publication,
    details: &BibliographyDetails,
    overrides: &Overrides,
) -> MetadataRow {
    let collection = if details.holding_institution.is_empty() {
        overrides.collection.clone().unwrap_or_default()
    } else {
        details.holding_institution.clone()
    };
    let sponsor = if details.sponsor.is_empty() {
        overrides.sponsor.clone().unwrap_or_default()
    } else {
        details.sponsor.clone()
    };
    // The template's own date stands in when Wikidata has no publication date.
    let inception = if publication.date.is_empty() {
        template.date.clone()
    } else {
        publication.date.clone()
    };

    MetadataRow {
        file: file.to_string(),
        bhl_page_id: template.pageid.clone(),
        instance_of: template.pagetypes.clone(),
        published_in: publication.label.clone(),
        published_in_qid: publication.qid.clone(),
        collection,
        sponsor,
        bibliography_id: template.titleid.clone(),
        illustrator: overrides.illustrator.clone().unwrap_or_default(),
        inception,
        names: template.names.clone(),
        ..Default::default()
    }
}

/// Build one worksheet row per file in the category. The bibliography page
/// is scraped once, from the first file carrying a title ID.
pub async fn build(
    client: &api::Client,
    category: &str,
    overrides: &Overrides,
) -> Result<Vec<MetadataRow>> {
    let files = client.category_files(category).await?;
    let publication = wikidata::publication_for_category(client, category)
        .await?
        .unwrap_or_default();
    if publication.qid.is_empty() {
        warn!("No publication with a BHL bibliography ID found for {}", category);
    }

    let mut details: Option<BibliographyDetails> = None;
    let mut rows = Vec::with_capacity(files.len());
    let progress = ProgressBar::new(files.len() as u64);

    for file in &files {
        progress.inc(1);
        let wikitext = match client.file_wikitext(file).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Could not load wikitext for {}: {:#}", file, e);
                String::new()
            }
        };
        let template = wikitext::parse_bhl_template(&wikitext);

        if details.is_none() && !template.titleid.is_empty() {
            let url = bhl::bibliography_url(&template.titleid);
            println!("Visit the BHL page for this category: {}", url);
            let scraped =
                bhl::fetch_bibliography_details(client.http(), &template.titleid).await;
            println!("Detected Collection: {}", scraped.holding_institution);
            println!("Detected Sponsor: {}", scraped.sponsor);
            details = Some(scraped);
        }

        rows.push(assemble_row(
            file,
            &template,
            &publication,
            details.as_ref().unwrap_or(&BibliographyDetails::default()),
            overrides,
        ));
    }

    progress.finish_and_clear();
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_names_normalize() {
        assert_eq!(
            normalize_category("Category:Oiseaux_brillans_du_Brésil"),
            "Oiseaux brillans du Brésil"
        );
        assert_eq!(normalize_category("  Plain name "), "Plain name");
    }

    #[test]
    fn row_prefers_scraped_details_over_overrides() {
        let template = BhlTemplate {
            pageid: "12345".into(),
            titleid: "678".into(),
            pagetypes: "Illustration".into(),
            names: "Dicholophus cristatus".into(),
            ..Default::default()
        };
        let publication = Publication {
            qid: "Q100".into(),
            label: "Oiseaux brillans".into(),
            date: "1834-01-01".into(),
        };
        let details = BibliographyDetails {
            holding_institution: "Smithsonian Libraries and Archives".into(),
            sponsor: String::new(),
        };
        let overrides = Overrides {
            collection: Some("ignored".into()),
            sponsor: Some("Missouri Botanical Garden".into()),
            illustrator: Some("Q200".into()),
        };

        let row = assemble_row("Plate 1.jpg", &template, &publication, &details, &overrides);
        assert_eq!(row.collection, "Smithsonian Libraries and Archives");
        assert_eq!(row.sponsor, "Missouri Botanical Garden");
        assert_eq!(row.illustrator, "Q200");
        assert_eq!(row.published_in_qid, "Q100");
        assert_eq!(row.inception, "1834-01-01");
        assert_eq!(row.bibliography_id, "678");
        assert_eq!(row.engraver, "");
    }

    #[test]
    fn template_date_backfills_missing_publication_date() {
        let template = BhlTemplate {
            date: "1834".into(),
            ..Default::default()
        };
        let row = assemble_row(
            "Plate 3.jpg",
            &template,
            &Publication::default(),
            &BibliographyDetails::default(),
            &Overrides::default(),
        );
        assert_eq!(row.inception, "1834");
    }

    #[test]
    fn empty_template_yields_empty_fields() {
        let row = assemble_row(
            "Plate 2.jpg",
            &BhlTemplate::default(),
            &Publication::default(),
            &BibliographyDetails::default(),
            &Overrides::default(),
        );
        assert_eq!(row.file, "Plate 2.jpg");
        assert_eq!(row.bhl_page_id, "");
        assert_eq!(row.names, "");
    }
}
