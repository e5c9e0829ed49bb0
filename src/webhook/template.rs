//! `{{variable}}` substitution for webhook URL, header and body templates.
//!
//! The same variables are escaped differently for each destination: percent
//! encoding in URLs, control-character stripping in header values and JSON
//! string escaping in bodies.

use crate::db::{BodyTemplate, HeaderTemplate, Project};

use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use serde_json::Value;
use std::borrow::Cow;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("headers must be a JSON object of strings: {0}")]
    Headers(String),
    #[error("body is not valid JSON after substitution: {0}")]
    Body(#[from] serde_json::Error),
}

/// Values available to templates.
#[derive(Debug, Clone)]
pub struct TemplateVars {
    pub project_id: String,
    pub project_name: String,
    pub url: String,
    pub selector: String,
    pub old_content: String,
    pub new_content: String,
    pub timestamp: String,
}

impl TemplateVars {
    pub fn for_change(project: &Project, old: &str, new: &str, now: DateTime<Utc>) -> Self {
        Self {
            project_id: project.id.clone(),
            project_name: project.name.clone(),
            url: project.url.clone(),
            selector: project.selector.clone(),
            old_content: old.to_string(),
            new_content: new.to_string(),
            timestamp: now.to_rfc3339(),
        }
    }

    /// Synthetic values used when testing a configuration before saving it.
    pub fn sample(now: DateTime<Utc>) -> Self {
        Self {
            project_id: "test-project".to_string(),
            project_name: "Test Project".to_string(),
            url: "https://example.com/".to_string(),
            selector: "#example".to_string(),
            old_content: "Old content".to_string(),
            new_content: "New content".to_string(),
            timestamp: now.to_rfc3339(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let value = match name {
            "projectId" => &self.project_id,
            "projectName" => &self.project_name,
            "url" => &self.url,
            "selector" => &self.selector,
            "oldContent" => &self.old_content,
            "newContent" => &self.new_content,
            "timestamp" => &self.timestamp,
            _ => return None,
        };
        Some(value)
    }
}

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z][A-Za-z0-9_]*)\s*\}\}").unwrap())
}

/// Replace known placeholders with `escape(value)`. Unknown placeholders are
/// left as written.
fn substitute<F>(template: &str, vars: &TemplateVars, escape: F) -> String
where
    F: Fn(&str) -> Cow<'_, str>,
{
    placeholder()
        .replace_all(template, |caps: &Captures| match vars.get(&caps[1]) {
            Some(value) => escape(value).into_owned(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Substitute into a URL, percent-encoding every value.
pub fn render_url(template: &str, vars: &TemplateVars) -> String {
    substitute(template, vars, urlencoding::encode)
}

/// Strip CR, LF and every other ASCII control character.
pub fn sanitize_header_value(value: &str) -> Cow<'_, str> {
    if value.chars().any(|c| c.is_ascii_control()) {
        Cow::Owned(value.chars().filter(|c| !c.is_ascii_control()).collect())
    } else {
        Cow::Borrowed(value)
    }
}

/// Substitute into a header value. Values go in raw, minus control characters.
pub fn render_header_value(template: &str, vars: &TemplateVars) -> String {
    let rendered = substitute(template, vars, sanitize_header_value);
    sanitize_header_value(&rendered).into_owned()
}

/// Render a header template into name/value pairs.
pub fn render_headers(
    template: &HeaderTemplate,
    vars: &TemplateVars,
) -> Result<Vec<(String, String)>, TemplateError> {
    let pairs: Vec<(String, String)> = match template {
        HeaderTemplate::Map(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        HeaderTemplate::Text(text) if text.trim().is_empty() => Vec::new(),
        HeaderTemplate::Text(text) => {
            let parsed: Value =
                serde_json::from_str(text).map_err(|e| TemplateError::Headers(e.to_string()))?;
            let Value::Object(map) = parsed else {
                return Err(TemplateError::Headers("expected an object".to_string()));
            };
            map.into_iter()
                .map(|(k, v)| match v {
                    Value::String(s) => (k, s),
                    other => (k, other.to_string()),
                })
                .collect()
        }
    };

    Ok(pairs
        .into_iter()
        .map(|(name, value)| {
            (
                sanitize_header_value(name.trim()).into_owned(),
                render_header_value(&value, vars),
            )
        })
        .collect())
}

/// The characters `value` encodes to inside a JSON string literal.
fn json_string_contents(value: &str) -> Cow<'_, str> {
    let quoted = Value::String(value.to_string()).to_string();
    Cow::Owned(quoted[1..quoted.len() - 1].to_string())
}

/// Substitute into JSON text and check the result still parses.
pub fn render_json(template: &str, vars: &TemplateVars) -> Result<String, TemplateError> {
    let rendered = substitute(template, vars, json_string_contents);
    serde_json::from_str::<Value>(&rendered)?;
    Ok(rendered)
}

/// Render a body template to JSON text.
pub fn render_body(template: &BodyTemplate, vars: &TemplateVars) -> Result<String, TemplateError> {
    match template {
        BodyTemplate::Text(text) => render_json(text, vars),
        BodyTemplate::Json(value) => render_json(&value.to_string(), vars),
    }
}

/// Body sent when a project configures none.
pub fn default_body(vars: &TemplateVars) -> String {
    serde_json::json!({
        "projectId": vars.project_id,
        "projectName": vars.project_name,
        "url": vars.url,
        "selector": vars.selector,
        "oldContent": vars.old_content,
        "newContent": vars.new_content,
        "timestamp": vars.timestamp,
    })
    .to_string()
}
