//! Current date and time.

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{Capability, CapabilityContext, CapabilitySpec};

#[derive(Debug, Default, Deserialize, JsonSchema)]
struct CurrentTimeParams {
    /// IANA timezone name such as `Europe/Berlin`.  Defaults to UTC.
    #[serde(default)]
    timezone: Option<String>,
}

pub struct CurrentTimeCapability;

#[async_trait]
impl Capability for CurrentTimeCapability {
    fn spec(&self) -> CapabilitySpec {
        CapabilitySpec::new(
            "current_time",
            "Current date and time, optionally in a given IANA timezone.",
        )
        .with_schema_for::<CurrentTimeParams>()
    }

    async fn invoke(&self, params: Value, _ctx: &CapabilityContext) -> anyhow::Result<Value> {
        let params: CurrentTimeParams =
            serde_json::from_value(params).context("invalid current_time params")?;
        let now = Utc::now();

        match params.timezone.as_deref().map(str::trim).filter(|tz| !tz.is_empty()) {
            Some(name) => {
                let tz: Tz = name
                    .parse()
                    .map_err(|_| anyhow::anyhow!("unknown timezone: {name}"))?;
                let local = now.with_timezone(&tz);
                Ok(json!({
                    "timezone": tz.name(),
                    "iso": local.to_rfc3339(),
                    "unix": now.timestamp(),
                    "weekday": local.format("%A").to_string(),
                }))
            }
            None => Ok(json!({
                "timezone": "UTC",
                "iso": now.to_rfc3339(),
                "unix": now.timestamp(),
                "weekday": now.format("%A").to_string(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_to_utc() {
        let out = CurrentTimeCapability
            .invoke(json!({}), &CapabilityContext::new())
            .await
            .unwrap();
        assert_eq!(out["timezone"], "UTC");
        assert!(out["unix"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn named_timezone() {
        let out = CurrentTimeCapability
            .invoke(json!({"timezone": "Asia/Tokyo"}), &CapabilityContext::new())
            .await
            .unwrap();
        assert_eq!(out["timezone"], "Asia/Tokyo");
        assert!(out["iso"].as_str().unwrap().ends_with("+09:00"));
    }

    #[tokio::test]
    async fn unknown_timezone_errors() {
        let err = CurrentTimeCapability
            .invoke(json!({"timezone": "Mars/Olympus"}), &CapabilityContext::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Mars/Olympus"));
    }

    #[test]
    fn timezone_is_optional_in_schema() {
        let spec = CurrentTimeCapability.spec();
        assert!(spec.required_params().is_empty());
        assert!(spec.parameter_schema()["properties"].get("timezone").is_some());
    }
}
