use anyhow::Result;
use indicatif::ProgressBar;
use rand::Rng;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::api;
use crate::store::MetadataRow;
use crate::wikidata;

const Q_ANALOG_WORK: &str = "Q112134971";
const Q_NO_LATER_THAN: &str = "Q110290992";
const Q_HOLDING_INSTITUTION: &str = "Q131597993";
const Q_DIGITIZATION_SPONSOR: &str = "Q131344184";
const Q_ILLUSTRATOR: &str = "Q644687";
const Q_ENGRAVER: &str = "Q329439";
const Q_LITHOGRAPHER: &str = "Q16947657";
const Q_INFERRED_FROM_TAXON_NAME: &str = "Q131783016";
const Q_INFERRED_FROM_FLICKR_TAG: &str = "Q131782980";
const Q_INFERRED_FROM_PUB_DATE: &str = "Q110393725";
const Q_ILLUSTRATED_TEXT: &str = "Q131597974";
const Q_ILLUSTRATION: &str = "Q178659";

// ── Snak and statement scaffolding ──

fn item_snak(property: &str, qid: &str) -> Value {
    json!({
        "snaktype": "value",
        "property": property,
        "datavalue": {
            "value": {"entity-type": "item", "id": qid},
            "type": "wikibase-entityid"
        }
    })
}

fn string_snak(property: &str, value: &str) -> Value {
    json!({
        "snaktype": "value",
        "property": property,
        "datavalue": {"value": value, "type": "string"}
    })
}

fn somevalue_snak(property: &str) -> Value {
    json!({"snaktype": "somevalue", "property": property})
}

fn time_snak(property: &str, time: &str) -> Value {
    json!({
        "snaktype": "value",
        "property": property,
        "datavalue": {
            "value": {
                "time": time,
                "timezone": 0,
                "before": 0,
                "after": 0,
                "precision": 9,
                "calendarmodel": "http://www.wikidata.org/entity/Q1985727"
            },
            "type": "time"
        }
    })
}

fn statement(mainsnak: Value) -> Value {
    json!({"mainsnak": mainsnak, "type": "statement", "rank": "normal"})
}

fn snak_map(snaks: &[Value]) -> (Value, Value) {
    let mut map = serde_json::Map::new();
    let mut order = Vec::new();
    for snak in snaks {
        let prop = snak["property"].as_str().unwrap_or_default().to_string();
        if !map.contains_key(&prop) {
            order.push(Value::String(prop.clone()));
            map.insert(prop.clone(), json!([]));
        }
        if let Some(list) = map.get_mut(&prop).and_then(Value::as_array_mut) {
            list.push(snak.clone());
        }
    }
    (Value::Object(map), Value::Array(order))
}

fn with_qualifiers(mut stmt: Value, qualifiers: &[Value]) -> Value {
    let (map, order) = snak_map(qualifiers);
    stmt["qualifiers"] = map;
    stmt["qualifiers-order"] = order;
    stmt
}

fn with_reference(mut stmt: Value, reference_snaks: &[Value]) -> Value {
    let (map, order) = snak_map(reference_snaks);
    let reference = json!({"snaks": map, "snaks-order": order});
    match stmt.get_mut("references").and_then(Value::as_array_mut) {
        Some(refs) => refs.push(reference),
        None => stmt["references"] = json!([reference]),
    }
    stmt
}

fn bibliography_reference(row: &MetadataRow) -> Option<Vec<Value>> {
    let bib_id = row.bibliography_id.trim();
    if bib_id.is_empty() {
        return None;
    }
    Some(vec![string_snak(
        "P854",
        &crate::bhl::bibliography_url(bib_id),
    )])
}

// ── Claim builders, one per statement family ──

pub fn instance_claim(row: &MetadataRow) -> Option<Value> {
    let instance_of = row.instance_of.trim();
    if instance_of.is_empty() {
        return None;
    }
    let qid = wikidata::instance_of_qid(instance_of).unwrap_or(instance_of);
    Some(statement(item_snak("P31", qid)))
}

pub fn published_in_claim(row: &MetadataRow) -> Option<Value> {
    let published_in = row.published_in_qid.trim();
    if published_in.is_empty() {
        return None;
    }
    let stmt = statement(item_snak("P1433", published_in));
    Some(with_qualifiers(
        stmt,
        &[item_snak("P518", Q_ANALOG_WORK)],
    ))
}

pub fn collection_claim(row: &MetadataRow) -> Option<Value> {
    let collection = row.collection.trim();
    if collection.is_empty() {
        return None;
    }
    let qid = wikidata::institution_qid(collection).unwrap_or(collection);
    let mut stmt = with_qualifiers(
        statement(item_snak("P195", qid)),
        &[item_snak("P3831", Q_HOLDING_INSTITUTION)],
    );
    if let Some(reference) = bibliography_reference(row) {
        stmt = with_reference(stmt, &reference);
    }
    Some(stmt)
}

pub fn sponsor_claim(row: &MetadataRow) -> Option<Value> {
    let sponsor = row.sponsor.trim();
    if sponsor.is_empty() {
        return None;
    }
    let qid = wikidata::institution_qid(sponsor).unwrap_or(sponsor);
    let mut stmt = with_qualifiers(
        statement(item_snak("P859", qid)),
        &[item_snak("P3831", Q_DIGITIZATION_SPONSOR)],
    );
    if let Some(reference) = bibliography_reference(row) {
        stmt = with_reference(stmt, &reference);
    }
    Some(stmt)
}

/// Sponsor known to exist but not identified: an explicit unknown-value snak.
pub fn blank_sponsor_claim(row: &MetadataRow) -> Value {
    let mut stmt = with_qualifiers(
        statement(somevalue_snak("P859")),
        &[item_snak("P3831", Q_DIGITIZATION_SPONSOR)],
    );
    if let Some(reference) = bibliography_reference(row) {
        stmt = with_reference(stmt, &reference);
    }
    stmt
}

pub fn bhl_page_id_claim(row: &MetadataRow) -> Option<Value> {
    let page_id = row.bhl_page_id.trim();
    if page_id.is_empty() {
        return None;
    }
    Some(statement(string_snak("P687", page_id)))
}

fn creator_claim(person_qid: &str, role_qid: &str, ref_url: &str) -> Value {
    let mut stmt = with_qualifiers(
        statement(item_snak("P170", person_qid)),
        &[
            item_snak("P518", Q_ANALOG_WORK),
            item_snak("P3831", role_qid),
        ],
    );
    if !ref_url.is_empty() {
        stmt = with_reference(stmt, &[string_snak("P854", ref_url)]);
    }
    stmt
}

/// Creator statements for the three plate-production roles present in the row.
pub fn creator_claims(row: &MetadataRow) -> Vec<Value> {
    let ref_url = row.ref_url_for_authors.trim();
    [
        (row.illustrator.trim(), Q_ILLUSTRATOR),
        (row.engraver.trim(), Q_ENGRAVER),
        (row.lithographer.trim(), Q_LITHOGRAPHER),
    ]
    .iter()
    .filter(|(person, _)| !person.is_empty())
    .map(|(person, role)| creator_claim(person, role, ref_url))
    .collect()
}

pub fn depicts_claim(taxon_qid: &str) -> Value {
    with_reference(
        statement(item_snak("P180", taxon_qid)),
        &[item_snak("P887", Q_INFERRED_FROM_TAXON_NAME)],
    )
}

pub fn depicts_from_flickr_claim(taxon_qid: &str, flickr_id: &str) -> Value {
    with_reference(
        statement(item_snak("P180", taxon_qid)),
        &[
            item_snak("P887", Q_INFERRED_FROM_FLICKR_TAG),
            string_snak(
                "P854",
                &format!("https://www.flickr.com/photo.gne?id={}", flickr_id),
            ),
        ],
    )
}

pub fn inception_claim(row: &MetadataRow) -> Option<Value> {
    let inception = row.inception.trim();
    if inception.is_empty() {
        return None;
    }
    // Year precision; longer date strings collapse to their year.
    let year: String = inception.chars().take(4).collect();
    let time = format!("+{}-01-01T00:00:00Z", year);
    let stmt = with_qualifiers(
        statement(time_snak("P571", &time)),
        &[
            item_snak("P1480", Q_NO_LATER_THAN),
            item_snak("P518", Q_ANALOG_WORK),
        ],
    );
    Some(with_reference(
        stmt,
        &[item_snak("P887", Q_INFERRED_FROM_PUB_DATE)],
    ))
}

/// `'taxonomy:binomial=Psittacus cyanogaster'` -> `Psittacus cyanogaster`
pub fn binomial_from_tag(tag: &str) -> Option<String> {
    let (_, rest) = tag.split_once("taxonomy:binomial=")?;
    let name = rest.trim().replace('\'', "");
    (!name.is_empty()).then_some(name)
}

/// Edit summary carrying an editgroups batch marker, one per run.
pub fn edit_summary(test_edit: bool) -> String {
    if test_edit {
        return "SDC import (BHL Model v0.1.1, manual curation - tests)".to_string();
    }
    let random_hex = format!("{:x}", rand::thread_rng().gen_range(0..(1u64 << 48)));
    format!(
        "SDC import (BHL Model v0.1.1, manual curation) \
         ([[:toolforge:editgroups-commons/b/CB/{}|details]])",
        random_hex
    )
}

// ── Upload driver ──

pub struct UploadOptions {
    /// Apply edits; without it the claims are printed instead.
    pub write: bool,
    pub skip_published_in: bool,
    /// Write P31 from the worksheet instead of gating creators on the
    /// entity's existing instance-of claim.
    pub plain_instance_of: bool,
    /// Leave the sponsor statement out entirely when the row has none.
    pub no_empty_sponsor: bool,
}

pub struct UploadSummary {
    pub edited: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub fn should_skip_file(file_name: &str) -> bool {
    let lower = file_name.to_lowercase();
    lower.is_empty() || lower.ends_with(".pdf") || lower.ends_with(".djvu")
}

/// Existing P31 value of a MediaInfo entity, if any.
fn existing_instance_of(claims: &Value) -> Option<String> {
    claims["P31"][0]["mainsnak"]["datavalue"]["value"]["id"]
        .as_str()
        .map(str::to_string)
}

async fn depicts_for_row(client: &api::Client, row: &MetadataRow) -> Result<Vec<Value>> {
    let mut claims = Vec::new();

    let names = row.names.trim();
    if !names.is_empty() {
        if let Some(qid) = wikidata::taxon_qid(client, names).await? {
            claims.push(depicts_claim(&qid));
        }
    }

    let flickr_id = row.flickr_id.trim();
    for tag in row.flickr_tags.split(',') {
        let Some(binomial) = binomial_from_tag(tag) else {
            continue;
        };
        if let Some(qid) = wikidata::taxon_qid(client, &binomial).await? {
            claims.push(depicts_from_flickr_claim(&qid, flickr_id));
        }
    }

    Ok(claims)
}

async fn claims_for_row(
    client: &api::Client,
    entity_id: &str,
    row: &MetadataRow,
    opts: &UploadOptions,
) -> Result<Vec<Value>> {
    let mut claims = Vec::new();

    if opts.plain_instance_of {
        claims.extend(instance_claim(row));
    }
    if !opts.skip_published_in {
        claims.extend(published_in_claim(row));
    }
    claims.extend(collection_claim(row));
    match sponsor_claim(row) {
        Some(claim) => claims.push(claim),
        None if !opts.no_empty_sponsor => claims.push(blank_sponsor_claim(row)),
        None => {}
    }
    claims.extend(bhl_page_id_claim(row));

    // Creator roles only make sense on illustration-type files.
    if row.instance_of.contains("Illustration") {
        if opts.plain_instance_of {
            claims.extend(creator_claims(row));
        } else {
            let existing = client.entity_claims(entity_id).await?;
            match existing_instance_of(&existing).as_deref() {
                Some(Q_ILLUSTRATED_TEXT) | Some(Q_ILLUSTRATION) => {
                    claims.extend(creator_claims(row));
                }
                // photographs and other page types get no creator roles
                _ => {}
            }
        }
    }

    claims.extend(depicts_for_row(client, row).await?);
    claims.extend(inception_claim(row));

    Ok(claims)
}

/// Walk the worksheet and merge-append SDC statements onto each file's
/// MediaInfo entity. Per-row failures are logged and the run continues.
pub async fn upload_rows(
    client: &api::Client,
    rows: &[MetadataRow],
    opts: &UploadOptions,
) -> Result<UploadSummary> {
    let summary_text = edit_summary(!opts.write);
    let token = if opts.write {
        Some(client.csrf_token().await?)
    } else {
        None
    };

    let progress = ProgressBar::new(rows.len() as u64);
    let mut summary = UploadSummary {
        edited: 0,
        skipped: 0,
        failed: 0,
    };

    for row in rows {
        progress.inc(1);
        let file_name = row.file.trim();
        if should_skip_file(file_name) {
            warn!("Skipping row with empty or PDF/DJVU file: {:?}", file_name);
            summary.skipped += 1;
            continue;
        }

        let entity_id = match client.media_info_id(file_name).await {
            Ok(id) => id,
            Err(e) => {
                error!("Could not load MediaInfo for File:{}: {:#}", file_name, e);
                summary.failed += 1;
                continue;
            }
        };

        let claims = match claims_for_row(client, &entity_id, row, opts).await {
            Ok(claims) => claims,
            Err(e) => {
                error!("Could not build claims for File:{}: {:#}", file_name, e);
                summary.failed += 1;
                continue;
            }
        };

        if claims.is_empty() {
            info!("No SDC data to add for {}, skipping...", file_name);
            summary.skipped += 1;
            continue;
        }

        match &token {
            Some(token) => {
                match client
                    .edit_entity(&entity_id, &claims, &summary_text, token)
                    .await
                {
                    Ok(()) => summary.edited += 1,
                    Err(e) => {
                        error!("Failed to write SDC for {}: {:#}", file_name, e);
                        summary.failed += 1;
                    }
                }
            }
            None => {
                println!(
                    "[dry run] {} ({}): {}",
                    file_name,
                    entity_id,
                    serde_json::to_string_pretty(&claims)?
                );
                summary.edited += 1;
            }
        }
    }

    progress.finish_and_clear();
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> MetadataRow {
        MetadataRow {
            file: "Plate 1.jpg".into(),
            bhl_page_id: "12345".into(),
            instance_of: "Illustration".into(),
            published_in_qid: "Q100".into(),
            collection: "Smithsonian Libraries and Archives".into(),
            sponsor: String::new(),
            bibliography_id: "678".into(),
            illustrator: "Q200".into(),
            inception: "1834".into(),
            names: "Dicholophus cristatus".into(),
            ..Default::default()
        }
    }

    #[test]
    fn instance_claim_maps_label() {
        let claim = instance_claim(&row()).unwrap();
        assert_eq!(
            claim["mainsnak"]["datavalue"]["value"]["id"],
            json!("Q178659")
        );
        assert_eq!(claim["mainsnak"]["property"], json!("P31"));
    }

    #[test]
    fn collection_claim_carries_qualifier_and_reference() {
        let claim = collection_claim(&row()).unwrap();
        assert_eq!(claim["mainsnak"]["datavalue"]["value"]["id"], json!("Q1609326"));
        assert_eq!(
            claim["qualifiers"]["P3831"][0]["datavalue"]["value"]["id"],
            json!(Q_HOLDING_INSTITUTION)
        );
        assert_eq!(
            claim["references"][0]["snaks"]["P854"][0]["datavalue"]["value"],
            json!("https://www.biodiversitylibrary.org/bibliography/678")
        );
    }

    #[test]
    fn blank_sponsor_uses_somevalue() {
        let claim = blank_sponsor_claim(&row());
        assert_eq!(claim["mainsnak"]["snaktype"], json!("somevalue"));
        assert_eq!(claim["mainsnak"]["property"], json!("P859"));
        assert!(claim["mainsnak"].get("datavalue").is_none());
    }

    #[test]
    fn inception_formats_year_precision() {
        let claim = inception_claim(&row()).unwrap();
        let value = &claim["mainsnak"]["datavalue"]["value"];
        assert_eq!(value["time"], json!("+1834-01-01T00:00:00Z"));
        assert_eq!(value["precision"], json!(9));
        // qualifier order is stable
        assert_eq!(
            claim["qualifiers-order"],
            json!(["P1480", "P518"])
        );
    }

    #[test]
    fn inception_truncates_full_dates_to_year() {
        let mut r = row();
        r.inception = "1834-01-01".into();
        let claim = inception_claim(&r).unwrap();
        assert_eq!(
            claim["mainsnak"]["datavalue"]["value"]["time"],
            json!("+1834-01-01T00:00:00Z")
        );
    }

    #[test]
    fn creator_claims_cover_present_roles() {
        let mut r = row();
        r.engraver = "Q300".into();
        r.ref_url_for_authors = "https://example.org/authors".into();
        let claims = creator_claims(&r);
        assert_eq!(claims.len(), 2);
        assert_eq!(
            claims[0]["qualifiers"]["P3831"][0]["datavalue"]["value"]["id"],
            json!(Q_ILLUSTRATOR)
        );
        assert_eq!(
            claims[1]["references"][0]["snaks"]["P854"][0]["datavalue"]["value"],
            json!("https://example.org/authors")
        );
    }

    #[test]
    fn flickr_binomial_tags_parse() {
        assert_eq!(
            binomial_from_tag(" 'taxonomy:binomial=Psittacus cyanogaster'"),
            Some("Psittacus cyanogaster".to_string())
        );
        assert_eq!(binomial_from_tag("taxonomy:family=Psittacidae"), None);
    }

    #[test]
    fn pdf_and_djvu_rows_are_skipped() {
        assert!(should_skip_file("scan.PDF"));
        assert!(should_skip_file("book.djvu"));
        assert!(should_skip_file(""));
        assert!(!should_skip_file("Plate 1.jpg"));
    }

    #[test]
    fn edit_summary_carries_editgroup_marker() {
        let summary = edit_summary(false);
        assert!(summary.contains("editgroups-commons/b/CB/"));
        assert!(edit_summary(true).ends_with("- tests)"));
    }

    #[test]
    fn existing_instance_of_reads_first_claim() {
        let claims = json!({
            "P31": [{"mainsnak": {"datavalue": {"value": {"id": "Q178659"}}}}]
        });
        assert_eq!(existing_instance_of(&claims).as_deref(), Some("Q178659"));
        assert_eq!(existing_instance_of(&json!({})), None);
    }
}
