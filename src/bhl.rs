use anyhow::{Context, Result};
use scraper::{ElementRef, Html, Selector};
use tracing::warn;

pub const BHL_BASE_URL: &str = "https://www.biodiversitylibrary.org";

pub fn bibliography_url(titleid: &str) -> String {
    format!("{}/bibliography/{}", BHL_BASE_URL, titleid)
}

/// Provenance details shown on a BHL bibliography page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BibliographyDetails {
    pub holding_institution: String,
    pub sponsor: String,
}

/// Scrape holding institution and sponsor. Failures degrade to empty
/// details; the caller falls back to operator-supplied values.
pub async fn fetch_bibliography_details(
    http: &reqwest::Client,
    titleid: &str,
) -> BibliographyDetails {
    let url = bibliography_url(titleid);
    match fetch_page(http, &url).await {
        Ok(html) => parse_details(&html),
        Err(e) => {
            warn!("Could not scrape {}: {:#}", url, e);
            BibliographyDetails::default()
        }
    }
}

async fn fetch_page(http: &reqwest::Client, url: &str) -> Result<String> {
    http.get(url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await
        .with_context(|| format!("fetching {}", url))
}

pub fn parse_details(html: &str) -> BibliographyDetails {
    let doc = Html::parse_document(html);
    BibliographyDetails {
        holding_institution: heading_value(&doc, "Holding Institution:"),
        sponsor: heading_value(&doc, "Sponsor:"),
    }
}

/// The page lists each detail as an `<h5>` label followed by a `<p>` value.
fn heading_value(doc: &Html, label: &str) -> String {
    let h5 = Selector::parse("h5").unwrap();
    for heading in doc.select(&h5) {
        let text: String = heading.text().collect();
        if text.trim() != label {
            continue;
        }
        for sibling in heading.next_siblings() {
            if let Some(el) = ElementRef::wrap(sibling) {
                if el.value().name() == "p" {
                    return el.text().collect::<String>().trim().to_string();
                }
            }
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
        <div class="details">
            <h5>Title:</h5><p>Oiseaux brillans du Bresil</p>
            <h5>Holding Institution:</h5>
            <p>Smithsonian Libraries and Archives</p>
            <h5>Sponsor:</h5>
            <p>
                Smithsonian Institution
            </p>
        </div>
        </body></html>"#;

    #[test]
    fn pulls_institution_and_sponsor() {
        let details = parse_details(PAGE);
        assert_eq!(
            details.holding_institution,
            "Smithsonian Libraries and Archives"
        );
        assert_eq!(details.sponsor, "Smithsonian Institution");
    }

    #[test]
    fn missing_headings_give_empty_details() {
        let details = parse_details("<html><body><h5>Title:</h5><p>x</p></body></html>");
        assert_eq!(details, BibliographyDetails::default());
    }

    #[test]
    fn bibliography_url_format() {
        assert_eq!(
            bibliography_url("678"),
            "https://www.biodiversitylibrary.org/bibliography/678"
        );
    }
}
