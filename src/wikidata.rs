use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::api;

pub const SPARQL_ENDPOINT: &str = "https://query.wikidata.org/sparql";

#[derive(Debug, Deserialize)]
struct SparqlResponse {
    results: SparqlResults,
}

#[derive(Debug, Deserialize)]
struct SparqlResults {
    bindings: Vec<HashMap<String, SparqlValue>>,
}

#[derive(Debug, Deserialize)]
struct SparqlValue {
    value: String,
}

async fn sparql(
    client: &api::Client,
    query: &str,
) -> Result<Vec<HashMap<String, SparqlValue>>> {
    let params: Vec<(String, String)> = vec![
        ("query".into(), query.to_string()),
        ("format".into(), "json".into()),
    ];
    let data = client.get_json(SPARQL_ENDPOINT, &params).await?;
    let response: SparqlResponse =
        serde_json::from_value(data).context("decoding SPARQL response")?;
    Ok(response.results.bindings)
}

/// The publication a Commons category documents: resolved by category name
/// (P373), restricted to items with a BHL bibliography ID (P4327).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Publication {
    pub qid: String,
    pub label: String,
    pub date: String,
}

pub fn publication_query(category: &str) -> String {
    format!(
        r#"SELECT ?item ?itemLabel ?publicationDate
WHERE
{{
  ?item wdt:P373 "{category}" .
  ?item wdt:P4327 ?bhl_bib_id .
  OPTIONAL {{ ?item wdt:P577 ?publicationDate. }}
  SERVICE wikibase:label {{ bd:serviceParam wikibase:language "en". }}
}}
LIMIT 1"#
    )
}

pub async fn publication_for_category(
    client: &api::Client,
    category: &str,
) -> Result<Option<Publication>> {
    let bindings = sparql(client, &publication_query(category)).await?;
    let Some(row) = bindings.first() else {
        return Ok(None);
    };

    let qid = row
        .get("item")
        .map(|v| entity_qid(&v.value))
        .unwrap_or_default();
    let label = row
        .get("itemLabel")
        .map(|v| v.value.clone())
        .unwrap_or_default();
    let date = row
        .get("publicationDate")
        .map(|v| format_date(&v.value))
        .unwrap_or_default();

    Ok(Some(Publication { qid, label, date }))
}

/// Wikidata item for an exact scientific name (P225). Ambiguous names
/// (zero or several hits) resolve to `None`.
pub async fn taxon_qid(client: &api::Client, taxon_name: &str) -> Result<Option<String>> {
    let query = format!(
        r#"SELECT ?item WHERE {{
    ?item wdt:P225 "{taxon_name}".
}}"#
    );
    let bindings = sparql(client, &query).await?;
    if bindings.len() != 1 {
        if bindings.len() > 1 {
            warn!("{} taxa share the name {}", bindings.len(), taxon_name);
        }
        return Ok(None);
    }
    Ok(bindings[0].get("item").map(|v| entity_qid(&v.value)))
}

/// QIDs from `qids` that have no image (P18) yet.
pub async fn missing_p18(client: &api::Client, qids: &[String]) -> Result<HashSet<String>> {
    if qids.is_empty() {
        return Ok(HashSet::new());
    }
    let values: Vec<String> = qids.iter().map(|q| format!("wd:{}", q)).collect();
    let query = format!(
        r#"SELECT ?item WHERE {{
    VALUES ?item {{ {} }}
    FILTER NOT EXISTS {{ ?item wdt:P18 ?image }}
}}"#,
        values.join(" ")
    );
    let bindings = sparql(client, &query).await?;
    Ok(bindings
        .iter()
        .filter_map(|row| row.get("item").map(|v| entity_qid(&v.value)))
        .collect())
}

/// `http://www.wikidata.org/entity/Q123` -> `Q123`
fn entity_qid(uri: &str) -> String {
    uri.rsplit('/').next().unwrap_or(uri).to_string()
}

/// `1834-01-01T00:00:00Z` -> `1834-01-01`
fn format_date(raw: &str) -> String {
    match chrono::DateTime::parse_from_rfc3339(raw) {
        Ok(date) => date.format("%Y-%m-%d").to_string(),
        Err(_) => raw.split('T').next().unwrap_or(raw).to_string(),
    }
}

/// Holding institutions seen on BHL bibliography pages, by their page labels.
pub fn institution_qid(label: &str) -> Option<&'static str> {
    match label {
        "Smithsonian Libraries and Archives" => Some("Q1609326"),
        "Smithsonian Institution" => Some("Q131626"),
        "Smithsonian Institution Libraries" => Some("Q1609326"),
        "Missouri Botanical Garden, Peter H. Raven Library" => Some("Q53530601"),
        "Missouri Botanical Garden" => Some("Q1852803"),
        "New York Botanical Garden, LuEsther T. Mertz Library" => Some("Q31079305"),
        "The LuEsther T Mertz Library, the New York Botanical Garden" => Some("Q31079305"),
        "Natural History Museum Library, London" => Some("Q69792905"),
        _ => None,
    }
}

/// BHL page types, as spelled in the `pagetypes` template field.
pub fn instance_of_qid(label: &str) -> Option<&'static str> {
    match label {
        "Illustration" => Some("Q178659"),
        "Text Illustration" => Some("Q131597974"),
        "Text Table of Contents" => Some("Q1456936"),
        "Title Page Text Illustration" => Some("Q1339862"),
        _ => None,
    }
}
