//! Input validation for project and settings commands.
//!
//! Every check runs before anything is persisted.

use crate::db::{
    BodyTemplate, HeaderTemplate, Settings, WebhookConfig, MAX_INTERVAL_MS, MAX_LOAD_DELAY_MS,
    MIN_INTERVAL_MS,
};
use crate::webhook::{self, MAX_BODY_BYTES, MAX_HEADER_BYTES};

use scraper::Selector;
use serde_json::Value;
use thiserror::Error;
use url::Url;

pub const MAX_NAME_CHARS: usize = 100;
pub const MAX_URL_CHARS: usize = 2000;
pub const MAX_SELECTOR_CHARS: usize = 500;
pub const MAX_WEBHOOK_TIMEOUT_SECS: u64 = 120;

/// Rejected input, naming the offending field.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Project name, or a name derived from the page host when none is given.
pub fn name(name: Option<&str>, page_url: &str) -> Result<String, ValidationError> {
    let name = name.map(str::trim).unwrap_or_default();
    if name.is_empty() {
        let host = Url::parse(page_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));
        return Ok(host.unwrap_or_else(|| "Untitled".to_string()));
    }

    if name.chars().count() > MAX_NAME_CHARS {
        return Err(ValidationError::new(
            "name",
            format!("must be at most {MAX_NAME_CHARS} characters"),
        ));
    }
    if name.chars().any(char::is_control) {
        return Err(ValidationError::new("name", "must not contain control characters"));
    }
    Ok(name.to_string())
}

pub fn page_url(url: &str) -> Result<String, ValidationError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(ValidationError::new("url", "is required"));
    }
    if url.chars().count() > MAX_URL_CHARS {
        return Err(ValidationError::new(
            "url",
            format!("must be at most {MAX_URL_CHARS} characters"),
        ));
    }

    let parsed = Url::parse(url).map_err(|e| ValidationError::new("url", e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(url.to_string()),
        other => Err(ValidationError::new(
            "url",
            format!("scheme '{other}' is not allowed, use http or https"),
        )),
    }
}

pub fn selector(selector: &str) -> Result<String, ValidationError> {
    let selector = selector.trim();
    if selector.is_empty() {
        return Err(ValidationError::new("selector", "is required"));
    }
    if selector.chars().count() > MAX_SELECTOR_CHARS {
        return Err(ValidationError::new(
            "selector",
            format!("must be at most {MAX_SELECTOR_CHARS} characters"),
        ));
    }
    Selector::parse(selector)
        .map_err(|e| ValidationError::new("selector", format!("not a valid CSS selector: {e}")))?;
    Ok(selector.to_string())
}

pub fn interval(ms: u64) -> Result<u64, ValidationError> {
    if !(MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&ms) {
        return Err(ValidationError::new(
            "interval",
            format!("must be between {MIN_INTERVAL_MS} and {MAX_INTERVAL_MS} ms"),
        ));
    }
    Ok(ms)
}

pub fn load_delay(ms: u64) -> Result<u64, ValidationError> {
    if ms > MAX_LOAD_DELAY_MS {
        return Err(ValidationError::new(
            "loadDelay",
            format!("must be at most {MAX_LOAD_DELAY_MS} ms"),
        ));
    }
    Ok(ms)
}

/// Size and destination checks for a webhook configuration. The URL is only
/// checked against the address policy while the webhook is enabled.
pub fn webhook_config(config: &WebhookConfig) -> Result<(), ValidationError> {
    let url = config.url.trim();
    if url.chars().count() > MAX_URL_CHARS {
        return Err(ValidationError::new(
            "webhook.url",
            format!("must be at most {MAX_URL_CHARS} characters"),
        ));
    }
    if config.enabled {
        if url.is_empty() {
            return Err(ValidationError::new("webhook.url", "is required"));
        }
        webhook::validate_url(url).map_err(|e| ValidationError::new("webhook.url", e.to_string()))?;
    }

    if let Some(headers) = &config.headers {
        header_template(headers)?;
    }
    if let Some(body) = &config.body {
        let size = match body {
            BodyTemplate::Text(text) => text.len(),
            BodyTemplate::Json(value) => value.to_string().len(),
        };
        if size > MAX_BODY_BYTES {
            return Err(ValidationError::new(
                "webhook.body",
                format!("must be at most {MAX_BODY_BYTES} bytes"),
            ));
        }
    }
    Ok(())
}

fn header_template(headers: &HeaderTemplate) -> Result<(), ValidationError> {
    let size = match headers {
        HeaderTemplate::Map(map) => map.iter().map(|(k, v)| k.len() + v.len()).sum(),
        HeaderTemplate::Text(text) => {
            if !text.trim().is_empty()
                && !matches!(serde_json::from_str::<Value>(text), Ok(Value::Object(_)))
            {
                return Err(ValidationError::new("webhook.headers", "must be a JSON object"));
            }
            text.len()
        }
    };
    if size > MAX_HEADER_BYTES {
        return Err(ValidationError::new(
            "webhook.headers",
            format!("must be at most {MAX_HEADER_BYTES} bytes"),
        ));
    }
    Ok(())
}

pub fn settings(settings: &Settings) -> Result<(), ValidationError> {
    interval(settings.default_interval)
        .map_err(|e| ValidationError::new("defaultInterval", e.message))?;
    load_delay(settings.default_load_delay)
        .map_err(|e| ValidationError::new("defaultLoadDelay", e.message))?;
    if !(1..=MAX_WEBHOOK_TIMEOUT_SECS).contains(&settings.webhook_timeout) {
        return Err(ValidationError::new(
            "webhookTimeout",
            format!("must be between 1 and {MAX_WEBHOOK_TIMEOUT_SECS} seconds"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn test_name() {
        assert_eq!(name(Some("  Price  "), "https://a.example/x").unwrap(), "Price");
        assert_eq!(name(None, "https://shop.example/item").unwrap(), "shop.example");
        assert_eq!(name(Some(""), "not a url").unwrap(), "Untitled");

        let long = "x".repeat(MAX_NAME_CHARS + 1);
        assert_eq!(name(Some(&long), "").unwrap_err().field, "name");
        assert!(name(Some(&"é".repeat(MAX_NAME_CHARS)), "").is_ok());
        assert!(name(Some("bad\u{7}name"), "").is_err());
    }

    #[test]
    fn test_page_url() {
        assert!(page_url("https://example.com/").is_ok());
        assert!(page_url("http://example.com/a?b=c").is_ok());
        assert!(page_url("ftp://example.com/").is_err());
        assert!(page_url("javascript:alert(1)").is_err());
        assert!(page_url("").is_err());

        let long = format!("https://example.com/{}", "a".repeat(MAX_URL_CHARS));
        assert_eq!(page_url(&long).unwrap_err().field, "url");
    }

    #[test]
    fn test_selector() {
        assert_eq!(selector(" #price > span ").unwrap(), "#price > span");
        assert!(selector("div:nth-child(2)").is_ok());
        assert!(selector("").is_err());
        assert!(selector("div[[").is_err());
        assert!(selector(&"a".repeat(MAX_SELECTOR_CHARS + 1)).is_err());
    }

    #[test]
    fn test_interval_and_load_delay() {
        assert!(interval(MIN_INTERVAL_MS).is_ok());
        assert!(interval(MAX_INTERVAL_MS).is_ok());
        assert!(interval(MIN_INTERVAL_MS - 1).is_err());
        assert!(interval(MAX_INTERVAL_MS + 1).is_err());
        assert!(load_delay(0).is_ok());
        assert_eq!(load_delay(MAX_LOAD_DELAY_MS + 1).unwrap_err().field, "loadDelay");
    }

    #[test]
    fn test_webhook() {
        let mut config = WebhookConfig {
            enabled: true,
            url: "https://hooks.example.com/x".to_string(),
            ..Default::default()
        };
        assert!(webhook_config(&config).is_ok());

        config.url = "http://10.0.0.1/x".to_string();
        assert_eq!(webhook_config(&config).unwrap_err().field, "webhook.url");

        // Disabled webhooks may keep an unfinished URL.
        config.enabled = false;
        assert!(webhook_config(&config).is_ok());

        config.headers = Some(HeaderTemplate::Text("not json".to_string()));
        assert_eq!(webhook_config(&config).unwrap_err().field, "webhook.headers");

        let mut map = BTreeMap::new();
        map.insert("X-Big".to_string(), "v".repeat(MAX_HEADER_BYTES));
        config.headers = Some(HeaderTemplate::Map(map));
        assert_eq!(webhook_config(&config).unwrap_err().field, "webhook.headers");

        config.headers = None;
        config.body = Some(BodyTemplate::Json(json!({ "x": "y".repeat(MAX_BODY_BYTES) })));
        assert_eq!(webhook_config(&config).unwrap_err().field, "webhook.body");
    }

    #[test]
    fn test_settings() {
        assert!(settings(&Settings::default()).is_ok());

        let bad_timeout = Settings {
            webhook_timeout: 0,
            ..Default::default()
        };
        assert_eq!(settings(&bad_timeout).unwrap_err().field, "webhookTimeout");

        let bad_interval = Settings {
            default_interval: 1_000,
            ..Default::default()
        };
        assert_eq!(settings(&bad_interval).unwrap_err().field, "defaultInterval");
    }
}
