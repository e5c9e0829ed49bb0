//! Webhook delivery for content changes.
//!
//! Every request is checked against the SSRF policy before and after template
//! substitution, sent with redirects disabled, and limited to one delivery
//! per project per rate-limit window.

mod ssrf;
mod template;

pub use ssrf::*;
pub use template::*;

use crate::db::{DbError, Project, ProjectPatch, ProjectRepository, WebhookConfig, WebhookMethod};

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, LOCATION};
use reqwest::redirect::Policy;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Minimum time between two deliveries for the same project.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
/// Cap on the combined size of header names and values.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;
/// Cap on the request body.
pub const MAX_BODY_BYTES: usize = 100 * 1024;

/// Webhook error types.
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("blocked destination: {0}")]
    Blocked(#[from] SsrfError),
    #[error("template error: {0}")]
    Template(#[from] TemplateError),
    #[error("headers exceed {} bytes", MAX_HEADER_BYTES)]
    HeadersTooLarge,
    #[error("body exceeds {} bytes", MAX_BODY_BYTES)]
    BodyTooLarge,
    #[error("invalid header '{0}'")]
    InvalidHeader(String),
    #[error("redirect blocked{}", redirect_target(.location))]
    RedirectBlocked { location: Option<String> },
    #[error("webhook timed out after {0:?}")]
    Timeout(Duration),
    #[error("webhook returned {status} {status_text}")]
    Status { status: u16, status_text: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("store error: {0}")]
    Store(#[from] DbError),
}

/// Status line of a delivered webhook.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResponse {
    pub status: u16,
    pub status_text: String,
}

/// Result of a delivery attempt that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Sent(DispatchResponse),
    /// Skipped because the previous delivery was too recent.
    Suppressed { retry_after: Duration },
    /// The project has no enabled webhook.
    Disabled,
}

/// Time still to wait before `project` may receive another delivery, if any.
/// A missing timestamp counts as infinitely long ago.
pub fn rate_limit_remaining(
    last: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    window: Duration,
) -> Option<Duration> {
    let last = last?;
    let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
    (elapsed < window).then(|| window - elapsed)
}

/// SSRF-hardened webhook dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
    repo: ProjectRepository,
    rate_limit_window: Duration,
    enforce_address_policy: bool,
}

impl Dispatcher {
    pub fn new(repo: ProjectRepository) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .user_agent(concat!("pagewatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| WebhookError::Network(e.to_string()))?;

        Ok(Self {
            client,
            repo,
            rate_limit_window: RATE_LIMIT_WINDOW,
            enforce_address_policy: true,
        })
    }

    /// Lets tests deliver to a local mock server.
    #[cfg(test)]
    pub(crate) fn allow_any_address(mut self) -> Self {
        self.enforce_address_policy = false;
        self
    }

    /// Deliver a change notification for `project`, honouring the rate limit.
    ///
    /// On success the project's `lastWebhookTime` is set to `now`. A failure
    /// to store it is logged and the delivery still counts as sent.
    pub async fn deliver(
        &self,
        project: &Project,
        old: &str,
        new: &str,
        now: DateTime<Utc>,
    ) -> Result<Delivery, WebhookError> {
        let Some(config) = project.enabled_webhook() else {
            return Ok(Delivery::Disabled);
        };

        if let Some(retry_after) =
            rate_limit_remaining(project.last_webhook_time, now, self.rate_limit_window)
        {
            tracing::warn!(
                "Webhook: rate limited for {}, next delivery allowed in {:?}",
                project.name,
                retry_after
            );
            return Ok(Delivery::Suppressed { retry_after });
        }

        let timeout = self.repo.get_settings().await?.webhook_timeout();
        let vars = TemplateVars::for_change(project, old, new, now);
        let response = self.send(config, &vars, timeout).await?;

        // The request already went out, so a failed write does not undo it.
        let patch = ProjectPatch {
            last_webhook_time: Some(now),
            ..Default::default()
        };
        if let Err(e) = self.repo.update_project(&project.id, patch).await {
            tracing::error!(
                "Webhook: delivered for {} but failed to record delivery time: {}",
                project.name,
                e
            );
        }

        tracing::info!(
            "Webhook: delivered for {} ({} {})",
            project.name,
            response.status,
            response.status_text
        );
        Ok(Delivery::Sent(response))
    }

    /// Run `config` through the full pipeline with sample values. Not rate
    /// limited and nothing is persisted.
    pub async fn test(&self, config: &WebhookConfig) -> Result<DispatchResponse, WebhookError> {
        let timeout = self.repo.get_settings().await?.webhook_timeout();
        let vars = TemplateVars::sample(Utc::now());
        self.send(config, &vars, timeout).await
    }

    async fn send(
        &self,
        config: &WebhookConfig,
        vars: &TemplateVars,
        timeout: Duration,
    ) -> Result<DispatchResponse, WebhookError> {
        // Checked before substitution and again after, since a substituted
        // value can change what the URL points at.
        self.check_destination(&config.url)?;
        let url = render_url(&config.url, vars);
        let url = self.check_destination(&url)?;

        let headers = self.build_headers(config, vars)?;

        let mut request = self
            .client
            .request(method(config.method), url.clone())
            .headers(headers.clone())
            .timeout(timeout);

        if config.method.has_body() {
            let body = match &config.body {
                Some(template) => render_body(template, vars)?,
                None => default_body(vars),
            };
            if body.len() > MAX_BODY_BYTES {
                return Err(WebhookError::BodyTooLarge);
            }
            if !headers.contains_key(CONTENT_TYPE) {
                request = request.header(CONTENT_TYPE, "application/json");
            }
            request = request.body(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                WebhookError::Timeout(timeout)
            } else {
                WebhookError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(|l| url.join(l).map(|u| u.to_string()).unwrap_or_else(|_| l.to_string()));
            tracing::warn!(
                "Webhook: blocked redirect from {} to {}",
                url,
                location.as_deref().unwrap_or("<unknown>")
            );
            return Err(WebhookError::RedirectBlocked { location });
        }

        let status_text = status.canonical_reason().unwrap_or("").to_string();
        if !status.is_success() {
            return Err(WebhookError::Status {
                status: status.as_u16(),
                status_text,
            });
        }

        Ok(DispatchResponse {
            status: status.as_u16(),
            status_text,
        })
    }

    fn check_destination(&self, raw: &str) -> Result<url::Url, WebhookError> {
        if self.enforce_address_policy {
            return Ok(validate_url(raw)?);
        }
        url::Url::parse(raw).map_err(|e| SsrfError::InvalidUrl(e.to_string()).into())
    }

    fn build_headers(
        &self,
        config: &WebhookConfig,
        vars: &TemplateVars,
    ) -> Result<HeaderMap, WebhookError> {
        let pairs = match &config.headers {
            Some(template) => render_headers(template, vars)?,
            None => Vec::new(),
        };

        let total: usize = pairs.iter().map(|(k, v)| k.len() + v.len()).sum();
        if total > MAX_HEADER_BYTES {
            return Err(WebhookError::HeadersTooLarge);
        }

        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| WebhookError::InvalidHeader(name.clone()))?;
            let header_value =
                HeaderValue::from_str(&value).map_err(|_| WebhookError::InvalidHeader(name))?;
            headers.insert(header_name, header_value);
        }
        Ok(headers)
    }
}

fn redirect_target(location: &Option<String>) -> String {
    location
        .as_ref()
        .map(|l| format!(" (target: {l})"))
        .unwrap_or_default()
}

fn method(method: WebhookMethod) -> reqwest::Method {
    match method {
        WebhookMethod::Get => reqwest::Method::GET,
        WebhookMethod::Post => reqwest::Method::POST,
        WebhookMethod::Put => reqwest::Method::PUT,
        WebhookMethod::Patch => reqwest::Method::PATCH,
    }
}
