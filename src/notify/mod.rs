//! Change notifications: a local alert plus the project's webhook.

use crate::db::{LogEntry, Project, ProjectRepository};
use crate::webhook::{Delivery, Dispatcher};

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;

/// Maximum characters of page content quoted in an alert body.
const ALERT_PREVIEW_CHARS: usize = 200;

#[derive(Error, Debug)]
pub enum AlertError {
    #[error("alert sink unavailable: {0}")]
    Unavailable(String),
}

/// Local alert surface. Delivery is fire-and-forget: failures are only logged.
pub trait AlertSink: Send + Sync {
    fn notify(&self, title: &str, body: &str) -> Result<(), AlertError>;
}

/// Alert sink that writes alerts to the log.
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, title: &str, body: &str) -> Result<(), AlertError> {
        tracing::info!(target: "pagewatch::alert", "{}: {}", title, body);
        Ok(())
    }
}

/// Fans a detected change out to the alert sink and the webhook dispatcher.
#[derive(Clone)]
pub struct Notifier {
    alerts: Arc<dyn AlertSink>,
    dispatcher: Dispatcher,
    repo: ProjectRepository,
}

impl Notifier {
    pub fn new(
        alerts: Arc<dyn AlertSink>,
        dispatcher: Dispatcher,
        repo: ProjectRepository,
    ) -> Self {
        Self {
            alerts,
            dispatcher,
            repo,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Notify about a change. Never fails; problems are logged and, for
    /// webhooks, recorded in the project's log.
    pub async fn notify(&self, project: &Project, old: &str, new: &str) {
        if project.browser_notification {
            let title = format!("Content changed: {}", project.name);
            self.alert(&title, &preview(new));
        }

        match self.dispatcher.deliver(project, old, new, Utc::now()).await {
            Ok(Delivery::Sent(_)) => {}
            Ok(Delivery::Suppressed { .. } | Delivery::Disabled) => {
                tracing::debug!("Notifier: no webhook sent for {}", project.name);
            }
            Err(e) => {
                tracing::error!("Webhook: delivery failed for {}: {}", project.name, e);
                let entry = LogEntry::failed(Utc::now(), format!("Webhook failed: {e}"));
                if let Err(e) = self.repo.add_log(&project.id, entry).await {
                    tracing::error!("Notifier: failed to log webhook failure: {}", e);
                }
            }
        }
    }

    /// Send a local alert, logging (not returning) any failure.
    pub fn alert(&self, title: &str, body: &str) {
        if let Err(e) = self.alerts.notify(title, body) {
            tracing::warn!("Notifier: alert failed: {}", e);
        }
    }
}

fn preview(content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(ALERT_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}
