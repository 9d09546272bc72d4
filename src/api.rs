use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::sleep;
use tracing::debug;

pub const COMMONS_API: &str = "https://commons.wikimedia.org/w/api.php";
pub const WIKIDATA_API: &str = "https://www.wikidata.org/w/api.php";

/// Identify the tool to Wikimedia ops, per the API etiquette policy.
pub const USER_AGENT: &str =
    "BhlReconciler/0.1 (https://commons.wikimedia.org/wiki/User:BhlReconciler)";

/// Fixed politeness delay after every request. Not adaptive.
pub const REQUEST_DELAY_MS: u64 = 100;

/// Search API response. Validated at the deserialization boundary;
/// malformed items degrade to empty fields rather than aborting a run.
#[derive(Debug, Default, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub query: Option<QueryBody>,
    #[serde(rename = "continue")]
    pub cont: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub batchcomplete: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct QueryBody {
    #[serde(default)]
    pub searchinfo: Option<SearchInfo>,
    #[serde(default)]
    pub pages: BTreeMap<String, PageHit>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchInfo {
    #[serde(default)]
    pub totalhits: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct PageHit {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub snippet: String,
    /// Result-order hint from generator=search; pages objects are unordered.
    #[serde(default)]
    pub index: Option<i64>,
}

/// One search fetch: either a decoded page or a non-2xx status.
/// Transport errors surface as `Err` and are fatal to the run.
pub enum Fetched {
    Page(SearchResponse),
    HttpError(u16),
}

#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    delay: Duration,
}

impl Client {
    pub fn new() -> Result<Self> {
        Self::with_delay(Duration::from_millis(REQUEST_DELAY_MS))
    }

    pub fn with_delay(delay: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .context("building HTTP client")?;
        Ok(Self { http, delay })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// GET a JSON document, pausing for the politeness delay afterwards.
    pub async fn get_json(&self, url: &str, params: &[(String, String)]) -> Result<Value> {
        let resp = self.http.get(url).query(params).send().await?;
        sleep(self.delay).await;
        let resp = resp.error_for_status()?;
        resp.json().await.context("decoding JSON response")
    }

    /// Fetch one page of full-text search results. A non-2xx status is
    /// reported as `Fetched::HttpError` so the caller can stop cleanly
    /// with previously persisted state intact.
    pub async fn search_page(&self, params: &[(String, String)]) -> Result<Fetched> {
        let resp = self.http.get(COMMONS_API).query(params).send().await?;
        sleep(self.delay).await;
        if !resp.status().is_success() {
            return Ok(Fetched::HttpError(resp.status().as_u16()));
        }
        let page = resp
            .json::<SearchResponse>()
            .await
            .context("decoding search response")?;
        Ok(Fetched::Page(page))
    }

    async fn category_members(&self, category: &str, cmtype: &str) -> Result<Vec<String>> {
        let cmtitle = format!("Category:{}", category);
        let mut titles = Vec::new();
        let mut cont: Option<String> = None;

        loop {
            let mut params: Vec<(String, String)> = [
                ("action", "query"),
                ("format", "json"),
                ("list", "categorymembers"),
                ("cmtype", cmtype),
                ("cmlimit", "max"),
            ]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
            params.push(("cmtitle".into(), cmtitle.clone()));
            if let Some(c) = &cont {
                params.push(("cmcontinue".into(), c.clone()));
            }

            let data = self.get_json(COMMONS_API, &params).await?;
            if let Some(members) = data["query"]["categorymembers"].as_array() {
                titles.extend(
                    members
                        .iter()
                        .filter_map(|m| m["title"].as_str().map(str::to_string)),
                );
            }

            match data["continue"]["cmcontinue"].as_str() {
                Some(c) => cont = Some(c.to_string()),
                None => break,
            }
        }

        Ok(titles)
    }

    /// File names in a category, with the `File:` prefix stripped.
    pub async fn category_files(&self, category: &str) -> Result<Vec<String>> {
        let titles = self.category_members(category, "file").await?;
        Ok(titles
            .into_iter()
            .map(|t| t.replace("File:", ""))
            .collect())
    }

    /// Subcategory names, with the `Category:` prefix stripped.
    pub async fn subcategories(&self, category: &str) -> Result<Vec<String>> {
        let titles = self.category_members(category, "subcat").await?;
        Ok(titles
            .into_iter()
            .map(|t| t.replace("Category:", ""))
            .collect())
    }

    /// Current wikitext of a file page, or empty when the page is missing.
    pub async fn file_wikitext(&self, file_name: &str) -> Result<String> {
        let params: Vec<(String, String)> = vec![
            ("action".into(), "query".into()),
            ("prop".into(), "revisions".into()),
            ("titles".into(), format!("File:{}", file_name)),
            ("rvslots".into(), "*".into()),
            ("rvprop".into(), "content".into()),
            ("formatversion".into(), "2".into()),
            ("format".into(), "json".into()),
        ];
        let data = self.get_json(COMMONS_API, &params).await?;
        let page = &data["query"]["pages"][0];
        if page.get("missing").is_some() {
            return Ok(String::new());
        }
        Ok(page["revisions"][0]["slots"]["main"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    /// MediaInfo entity ID (`M<pageid>`) for a file.
    pub async fn media_info_id(&self, file_name: &str) -> Result<String> {
        let file_name = file_name.replace("File:", "");
        let params: Vec<(String, String)> = vec![
            ("action".into(), "query".into()),
            ("titles".into(), format!("File:{}", file_name)),
            ("prop".into(), "info".into()),
            ("format".into(), "json".into()),
        ];
        let data = self.get_json(COMMONS_API, &params).await?;
        let pages = data["query"]["pages"]
            .as_object()
            .context("no page data in response")?;
        let page = pages.values().next().context("empty page set")?;
        match page["pageid"].as_i64() {
            Some(id) => Ok(format!("M{}", id)),
            None => bail!("no MediaInfo ID found for File:{}", file_name),
        }
    }

    /// Existing claims of a MediaInfo entity, keyed by property.
    pub async fn entity_claims(&self, entity_id: &str) -> Result<Value> {
        let params: Vec<(String, String)> = vec![
            ("action".into(), "wbgetentities".into()),
            ("ids".into(), entity_id.to_string()),
            ("props".into(), "claims".into()),
            ("format".into(), "json".into()),
        ];
        let data = self.get_json(COMMONS_API, &params).await?;
        Ok(data["entities"][entity_id]["statements"]
            .as_object()
            .or_else(|| data["entities"][entity_id]["claims"].as_object())
            .map(|o| Value::Object(o.clone()))
            .unwrap_or(Value::Null))
    }

    /// First Wikidata item matching a label, via wbsearchentities.
    pub async fn search_entity(&self, label: &str) -> Result<Option<String>> {
        let params: Vec<(String, String)> = vec![
            ("action".into(), "wbsearchentities".into()),
            ("format".into(), "json".into()),
            ("search".into(), label.to_string()),
            ("language".into(), "en".into()),
            ("type".into(), "item".into()),
            ("props".into(), "descriptions|aliases".into()),
        ];
        let data = self.get_json(WIKIDATA_API, &params).await?;
        Ok(data["search"][0]["id"].as_str().map(str::to_string))
    }

    /// Anonymous CSRF token for write operations. Login is out of scope;
    /// authenticated runs rely on ambient cookies, not credentials here.
    pub async fn csrf_token(&self) -> Result<String> {
        let params: Vec<(String, String)> = vec![
            ("action".into(), "query".into()),
            ("meta".into(), "tokens".into()),
            ("format".into(), "json".into()),
        ];
        let data = self.get_json(COMMONS_API, &params).await?;
        data["query"]["tokens"]["csrftoken"]
            .as_str()
            .map(str::to_string)
            .context("no CSRF token in response")
    }

    /// Replace a page's wikitext via action=edit.
    pub async fn edit_page(
        &self,
        title: &str,
        text: &str,
        summary: &str,
        token: &str,
    ) -> Result<()> {
        let form = [
            ("action", "edit"),
            ("title", title),
            ("text", text),
            ("summary", summary),
            ("token", token),
            ("format", "json"),
        ];
        let resp = self.http.post(COMMONS_API).form(&form).send().await?;
        sleep(self.delay).await;
        let data: Value = resp.error_for_status()?.json().await?;
        if let Some(err) = data.get("error") {
            bail!(
                "edit of {} rejected: {}",
                title,
                err["info"].as_str().unwrap_or("unknown error")
            );
        }
        debug!(title, "page saved");
        Ok(())
    }

    /// Append claims to a MediaInfo entity via action=wbeditentity.
    pub async fn edit_entity(
        &self,
        entity_id: &str,
        claims: &[Value],
        summary: &str,
        token: &str,
    ) -> Result<()> {
        let data = serde_json::to_string(&serde_json::json!({ "claims": claims }))?;
        let form = [
            ("action", "wbeditentity"),
            ("id", entity_id),
            ("data", data.as_str()),
            ("summary", summary),
            ("token", token),
            ("format", "json"),
        ];
        let resp = self.http.post(COMMONS_API).form(&form).send().await?;
        sleep(self.delay).await;
        let data: Value = resp.error_for_status()?.json().await?;
        if let Some(err) = data.get("error") {
            bail!(
                "wbeditentity for {} rejected: {}",
                entity_id,
                err["info"].as_str().unwrap_or("unknown error")
            );
        }
        debug!(entity_id, "entity saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_response_decodes() {
        let raw = r#"{
            "batchcomplete": "",
            "continue": {"gsroffset": 50, "continue": "gsroffset||"},
            "query": {
                "searchinfo": {"totalhits": 1234},
                "pages": {
                    "999": {"pageid": 999, "ns": 6, "title": "File:B.jpg", "index": 2,
                            "snippet": "from <span>biodivlibrary</span>"},
                    "1234": {"pageid": 1234, "ns": 6, "title": "File:A.jpg", "index": 1,
                             "snippet": ""}
                }
            }
        }"#;
        let resp: SearchResponse = serde_json::from_str(raw).unwrap();
        let query = resp.query.unwrap();
        assert_eq!(query.searchinfo.unwrap().totalhits, Some(1234));
        assert_eq!(query.pages.len(), 2);

        let cont = resp.cont.unwrap();
        assert_eq!(cont["gsroffset"], serde_json::json!(50));
        assert!(cont.contains_key("continue"));
    }

    #[test]
    fn search_response_tolerates_missing_fields() {
        let resp: SearchResponse =
            serde_json::from_str(r#"{"query": {"pages": {"1": {"title": "File:X.jpg"}}}}"#)
                .unwrap();
        let query = resp.query.unwrap();
        let hit = &query.pages["1"];
        assert_eq!(hit.title, "File:X.jpg");
        assert_eq!(hit.snippet, "");
        assert!(resp.cont.is_none());
    }

    #[test]
    fn empty_body_is_valid() {
        let resp: SearchResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.query.is_none());
        assert!(resp.cont.is_none());
    }
}
