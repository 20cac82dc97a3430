//! Web search through the Brave Search API.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::{Capability, CapabilityContext, CapabilityParam, CapabilitySpec, ParamType};

const BRAVE_ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";
const DEFAULT_MAX_RESULTS: usize = 5;

/// The registry resolves the `BRAVE_SEARCH` credential and hands it over in
/// the context; the capability never reads the environment itself.
pub struct WebSearchCapability {
    client: reqwest::Client,
    endpoint: String,
}

impl Default for WebSearchCapability {
    fn default() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("conductor/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: BRAVE_ENDPOINT.to_string(),
        }
    }
}

#[async_trait]
impl Capability for WebSearchCapability {
    fn spec(&self) -> CapabilitySpec {
        CapabilitySpec::new("web_search", "Search the web and return the top results.")
            .param(CapabilityParam::required("query", "Search query string"))
            .param(
                CapabilityParam::optional("max_results", "Maximum results to return")
                    .of_type(ParamType::Integer)
                    .with_default(json!(DEFAULT_MAX_RESULTS)),
            )
            .requires_credential("BRAVE_SEARCH")
    }

    async fn invoke(&self, params: Value, ctx: &CapabilityContext) -> anyhow::Result<Value> {
        let query = params
            .get("query")
            .and_then(|q| q.as_str())
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("missing required param: query"))?;
        let max_results = params
            .get("max_results")
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .map(|n| n.clamp(1, 20) as usize)
            .unwrap_or(DEFAULT_MAX_RESULTS);
        let api_key = ctx
            .credential()
            .ok_or_else(|| anyhow::anyhow!("web_search invoked without a credential"))?;

        let count = max_results.to_string();
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("count", count.as_str())])
            .header("Accept", "application/json")
            .header("X-Subscription-Token", api_key)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Brave Search API error {status}: {body}");
        }

        let body: Value = resp.json().await?;
        Ok(json!({
            "query": query,
            "results": brave_results(&body, max_results),
        }))
    }
}

/// `{title, url, description}` for each web result, skipping untitled ones.
fn brave_results(body: &Value, max_results: usize) -> Vec<Value> {
    body["web"]["results"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let title = item["title"].as_str().unwrap_or("").trim();
                    if title.is_empty() {
                        return None;
                    }
                    Some(json!({
                        "title": title,
                        "url": item["url"].as_str().unwrap_or("").trim(),
                        "description": item["description"].as_str().unwrap_or("").trim(),
                    }))
                })
                .take(max_results)
                .collect()
        })
        .unwrap_or_default()
}
