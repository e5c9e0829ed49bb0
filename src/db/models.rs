//! Persisted model types.
//!
//! Field names serialize in camelCase so the stored JSON matches the layout
//! shared with the command API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Shortest allowed check interval (1 minute).
pub const MIN_INTERVAL_MS: u64 = 60_000;
/// Longest allowed check interval (1 day).
pub const MAX_INTERVAL_MS: u64 = 86_400_000;
/// Longest extra wait after a page finishes loading.
pub const MAX_LOAD_DELAY_MS: u64 = 60_000;
/// Log entries kept per project, newest first.
pub const MAX_LOG_ENTRIES: usize = 100;

fn default_true() -> bool {
    true
}

/// A monitored page fragment and its notification settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub url: String,
    pub selector: String,
    /// Check interval in milliseconds.
    pub interval: u64,
    /// Extra wait after load, in milliseconds.
    #[serde(default)]
    pub load_delay: u64,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default = "default_true")]
    pub browser_notification: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_content: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_time",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(
        default,
        deserialize_with = "lenient_time",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_webhook_time: Option<DateTime<Utc>>,
}

impl Default for Project {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            url: String::new(),
            selector: String::new(),
            interval: Settings::default().default_interval,
            load_delay: 0,
            active: true,
            browser_notification: true,
            webhook: None,
            last_content: None,
            last_checked: None,
            last_webhook_time: None,
        }
    }
}

impl Project {
    /// Trigger period, never shorter than one millisecond.
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.interval.max(1))
    }

    /// The webhook configuration, if one is present and enabled.
    pub fn enabled_webhook(&self) -> Option<&WebhookConfig> {
        self.webhook.as_ref().filter(|w| w.enabled)
    }
}

/// A partial update applied by [`ProjectRepository::update_project`].
///
/// `None` leaves the field untouched. `webhook: Some(None)` clears the webhook.
///
/// [`ProjectRepository::update_project`]: super::ProjectRepository::update_project
#[derive(Debug, Clone, Default)]
pub struct ProjectPatch {
    pub name: Option<String>,
    pub url: Option<String>,
    pub selector: Option<String>,
    pub interval: Option<u64>,
    pub load_delay: Option<u64>,
    pub active: Option<bool>,
    pub browser_notification: Option<bool>,
    pub webhook: Option<Option<WebhookConfig>>,
    pub last_content: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_webhook_time: Option<DateTime<Utc>>,
}

impl ProjectPatch {
    pub fn apply(self, project: &mut Project) {
        if let Some(name) = self.name {
            project.name = name;
        }
        if let Some(url) = self.url {
            project.url = url;
        }
        if let Some(selector) = self.selector {
            project.selector = selector;
        }
        if let Some(interval) = self.interval {
            project.interval = interval;
        }
        if let Some(load_delay) = self.load_delay {
            project.load_delay = load_delay;
        }
        if let Some(active) = self.active {
            project.active = active;
        }
        if let Some(browser_notification) = self.browser_notification {
            project.browser_notification = browser_notification;
        }
        if let Some(webhook) = self.webhook {
            project.webhook = webhook;
        }
        if let Some(content) = self.last_content {
            project.last_content = Some(content);
        }
        if let Some(checked) = self.last_checked {
            project.last_checked = Some(checked);
        }
        if let Some(sent) = self.last_webhook_time {
            project.last_webhook_time = Some(sent);
        }
    }
}

/// HTTP method used for webhook delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WebhookMethod {
    Get,
    #[default]
    Post,
    Put,
    Patch,
}

impl WebhookMethod {
    /// Whether requests with this method carry a body.
    pub fn has_body(self) -> bool {
        !matches!(self, WebhookMethod::Get)
    }
}

/// Header template: either JSON object text or a flat name/value map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderTemplate {
    Text(String),
    Map(BTreeMap<String, String>),
}

/// Body template: raw JSON text or a structured JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BodyTemplate {
    Text(String),
    Json(Value),
}

/// Per-project webhook configuration. `url`, `headers` and `body` may embed
/// `{{variable}}` placeholders.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,
    pub url: String,
    #[serde(default)]
    pub method: WebhookMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HeaderTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<BodyTemplate>,
}

/// One check (or delivery) outcome in a project's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LogEntry {
    /// A successful check.
    pub fn checked(
        timestamp: DateTime<Utc>,
        content: String,
        old_content: Option<String>,
        changed: bool,
    ) -> Self {
        Self {
            timestamp,
            success: true,
            content: Some(content),
            old_content,
            changed: Some(changed),
            error: None,
        }
    }

    /// A failed check or delivery.
    pub fn failed(timestamp: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            timestamp,
            success: false,
            content: None,
            old_content: None,
            changed: None,
            error: Some(error.into()),
        }
    }
}

/// Global user settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Interval for new projects, in milliseconds.
    pub default_interval: u64,
    /// Load delay for new projects, in milliseconds.
    pub default_load_delay: u64,
    pub default_browser_notification: bool,
    /// Webhook request timeout in seconds.
    pub webhook_timeout: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_interval: 300_000,
            default_load_delay: 0,
            default_browser_notification: true,
            webhook_timeout: 10,
        }
    }
}

impl Settings {
    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout.max(1))
    }
}

/// Accepts RFC 3339 strings or epoch milliseconds; anything else reads as
/// `None` so one bad timestamp can't make a project unreadable.
fn lenient_time<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Some(Value::Number(n)) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    })
}
