//! HTTP request handlers.
//!
//! Every command is one JSON request tagged with `action` and gets exactly one
//! JSON response: `{"success": true, ...}` or `{"success": false, "error": ...}`.

use super::validation::{self, ValidationError};
use super::AppState;
use crate::db::{DbError, Project, ProjectPatch, Settings, WebhookConfig};
use crate::webhook::WebhookError;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("project not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Webhook(#[from] WebhookError),
    #[error(transparent)]
    Store(#[from] DbError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Webhook(WebhookError::Blocked(_) | WebhookError::RedirectBlocked { .. }) => {
                StatusCode::FORBIDDEN
            }
            Self::Webhook(WebhookError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            Self::Webhook(_) => StatusCode::BAD_GATEWAY,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Command failed: {}", self);
        }
        (
            status,
            Json(json!({ "success": false, "error": self.to_string() })),
        )
            .into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Distinguishes a missing field (`None`) from an explicit `null` (`Some(None)`).
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    StartMonitor {
        project: Project,
    },
    StopMonitor {
        project_id: String,
    },
    ElementSelected {
        url: String,
        selector: String,
        name: Option<String>,
        interval: Option<u64>,
        load_delay: Option<u64>,
        browser_notification: Option<bool>,
        webhook: Option<WebhookConfig>,
        initial_content: Option<String>,
    },
    UpdateProject {
        project_id: String,
        name: Option<String>,
        selector: Option<String>,
        interval: Option<u64>,
        load_delay: Option<u64>,
        browser_notification: Option<bool>,
        /// Missing keeps the current webhook; `null` removes it.
        #[serde(default, deserialize_with = "present")]
        webhook: Option<Option<WebhookConfig>>,
        initial_content: Option<String>,
    },
    GetProjectLogs {
        project_id: String,
    },
    ClearProjectLogs {
        project_id: String,
    },
    TestBrowserNotification,
    TestWebhook {
        config: WebhookConfig,
    },
    GetProjects,
    DeleteProject {
        project_id: String,
    },
    GetSettings,
    SaveSettings {
        settings: Settings,
    },
}

pub async fn handle_command(
    State(state): State<AppState>,
    payload: Result<Json<Command>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(command) = payload?;
    execute(&state, command).await.map(Json)
}

/// Run one command against the application state.
pub async fn execute(state: &AppState, command: Command) -> Result<Value, ApiError> {
    match command {
        Command::StartMonitor { project } => {
            let patch = ProjectPatch {
                active: Some(true),
                ..Default::default()
            };
            let mut stored = state
                .repo
                .update_project(&project.id, patch.clone())
                .await?
                .ok_or_else(|| ApiError::NotFound(project.id.clone()))?;
            patch.apply(&mut stored);

            state.monitor.start(&stored).await;
            Ok(json!({ "success": true }))
        }

        Command::StopMonitor { project_id } => {
            let patch = ProjectPatch {
                active: Some(false),
                ..Default::default()
            };
            state.repo.update_project(&project_id, patch).await?;
            state.monitor.stop(&project_id).await;
            Ok(json!({ "success": true }))
        }

        Command::ElementSelected {
            url,
            selector,
            name,
            interval,
            load_delay,
            browser_notification,
            webhook,
            initial_content,
        } => {
            let url = validation::page_url(&url)?;
            let selector = validation::selector(&selector)?;
            let name = validation::name(name.as_deref(), &url)?;
            let settings = state.repo.get_settings().await?;
            let interval = validation::interval(interval.unwrap_or(settings.default_interval))?;
            let load_delay =
                validation::load_delay(load_delay.unwrap_or(settings.default_load_delay))?;
            if let Some(webhook) = &webhook {
                validation::webhook_config(webhook)?;
            }

            let project = Project {
                id: Uuid::new_v4().to_string(),
                name,
                url,
                selector,
                interval,
                load_delay,
                active: true,
                browser_notification: browser_notification
                    .unwrap_or(settings.default_browser_notification),
                webhook,
                last_content: initial_content.filter(|c| !c.is_empty()),
                last_checked: None,
                last_webhook_time: None,
            };

            state.repo.add_project(project.clone()).await?;
            state.monitor.start(&project).await;
            tracing::info!("Created project {} ({})", project.name, project.id);

            Ok(json!({ "success": true, "projectId": project.id }))
        }

        Command::UpdateProject {
            project_id,
            name,
            selector,
            interval,
            load_delay,
            browser_notification,
            webhook,
            initial_content,
        } => {
            let current = state
                .repo
                .get_project(&project_id)
                .await?
                .ok_or_else(|| ApiError::NotFound(project_id.clone()))?;

            let patch = ProjectPatch {
                name: name
                    .map(|n| validation::name(Some(&n), &current.url))
                    .transpose()?,
                selector: selector.as_deref().map(validation::selector).transpose()?,
                interval: interval.map(validation::interval).transpose()?,
                load_delay: load_delay.map(validation::load_delay).transpose()?,
                browser_notification,
                webhook: match webhook {
                    Some(Some(config)) => {
                        validation::webhook_config(&config)?;
                        Some(Some(config))
                    }
                    other => other,
                },
                last_content: initial_content.filter(|c| !c.is_empty()),
                ..Default::default()
            };

            let mut updated = state
                .repo
                .update_project(&project_id, patch.clone())
                .await?
                .ok_or_else(|| ApiError::NotFound(project_id.clone()))?;
            patch.apply(&mut updated);

            if updated.active {
                state.monitor.start(&updated).await;
            }
            Ok(json!({ "success": true, "project": updated }))
        }

        Command::GetProjectLogs { project_id } => {
            let logs = state.repo.get_project_logs(&project_id).await?;
            Ok(json!({ "success": true, "logs": logs }))
        }

        Command::ClearProjectLogs { project_id } => {
            state.repo.clear_project_logs(&project_id).await?;
            Ok(json!({ "success": true }))
        }

        Command::TestBrowserNotification => {
            state
                .notifier
                .alert("pagewatch", "Notifications are working.");
            Ok(json!({ "success": true }))
        }

        Command::TestWebhook { config } => {
            let response = state.notifier.dispatcher().test(&config).await?;
            Ok(json!({
                "success": true,
                "status": response.status,
                "statusText": response.status_text,
            }))
        }

        Command::GetProjects => {
            let projects = state.repo.get_projects().await?;
            Ok(json!({ "success": true, "projects": projects }))
        }

        Command::DeleteProject { project_id } => {
            state.monitor.stop(&project_id).await;
            let deleted = state.repo.remove_project(&project_id).await?;
            if deleted {
                tracing::info!("Deleted project {}", project_id);
            }
            Ok(json!({ "success": true, "deleted": deleted }))
        }

        Command::GetSettings => {
            let settings = state.repo.get_settings().await?;
            Ok(json!({ "success": true, "settings": settings }))
        }

        Command::SaveSettings { settings } => {
            validation::settings(&settings)?;
            state.repo.set_settings(settings.clone()).await?;
            Ok(json!({ "success": true, "settings": settings }))
        }
    }
}

// ============================================================================
// API: Read-only
// ============================================================================

pub async fn handle_get_projects(
    State(state): State<AppState>,
) -> Result<Json<Vec<Project>>, ApiError> {
    Ok(Json(state.repo.get_projects().await?))
}

pub async fn handle_health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::db::test_support::{memory_repo, sample_project};
    use crate::monitor::{
        ContextId, ContextInfo, ContextProvider, FetchError, Monitor, MonitorOptions, PageFetcher,
    };
    use crate::notify::tests::RecordingSink;
    use crate::notify::Notifier;
    use crate::webhook::Dispatcher;
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use std::sync::Arc;

    /// Environment with no reachable pages.
    struct Offline;

    #[async_trait]
    impl ContextProvider for Offline {
        async fn inspect(&self, _id: ContextId) -> Option<ContextInfo> {
            None
        }

        async fn find(&self, _url: &str) -> Option<ContextInfo> {
            None
        }

        async fn open(&self, _url: &str) -> Result<ContextId, FetchError> {
            Err(FetchError::Network("offline".to_string()))
        }

        async fn close(&self, _id: ContextId) {}
    }

    #[async_trait]
    impl PageFetcher for Offline {
        async fn fetch(&self, _context: ContextId, _selector: &str) -> Result<String, FetchError> {
            Err(FetchError::ContextGone)
        }
    }

    fn test_state() -> (AppState, Arc<RecordingSink>) {
        let repo = memory_repo();
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = Dispatcher::new(repo.clone()).unwrap();
        let notifier = Notifier::new(sink.clone(), dispatcher, repo.clone());
        let env = Arc::new(Offline);
        let monitor = Monitor::new(
            repo.clone(),
            env.clone(),
            env,
            notifier.clone(),
            MonitorOptions::default(),
        );

        let state = AppState {
            config: ServerConfig::default(),
            repo,
            monitor,
            notifier,
        };
        (state, sink)
    }

    async fn run(state: &AppState, request: Value) -> Result<Value, ApiError> {
        let command: Command = serde_json::from_value(request).unwrap();
        execute(state, command).await
    }

    #[tokio::test]
    async fn test_element_selected_creates_and_schedules() {
        let (state, _) = test_state();
        state
            .repo
            .set_settings(Settings {
                default_interval: 600_000,
                default_browser_notification: false,
                ..Default::default()
            })
            .await
            .unwrap();

        let response = run(
            &state,
            json!({
                "action": "elementSelected",
                "url": "https://shop.example/item",
                "selector": "#price",
                "initialContent": "19.99"
            }),
        )
        .await
        .unwrap();

        assert_eq!(response["success"], true);
        let id = response["projectId"].as_str().unwrap();

        let project = state.repo.get_project(id).await.unwrap().unwrap();
        assert_eq!(project.name, "shop.example");
        assert_eq!(project.interval, 600_000);
        assert!(!project.browser_notification);
        assert!(project.active);
        assert_eq!(project.last_content.as_deref(), Some("19.99"));
        assert!(state.monitor.is_scheduled(id).await);
        state.monitor.stop(id).await;
    }

    #[tokio::test]
    async fn test_invalid_input_has_no_side_effects() {
        let (state, _) = test_state();

        let cases = [
            json!({"action": "elementSelected", "url": "file:///etc/passwd", "selector": "#a"}),
            json!({"action": "elementSelected", "url": "https://a.example/", "selector": "div[["}),
            json!({"action": "elementSelected", "url": "https://a.example/", "selector": "#a", "interval": 1000}),
            json!({"action": "elementSelected", "url": "https://a.example/", "selector": "#a",
                   "webhook": {"enabled": true, "url": "http://169.254.169.254/latest"}}),
        ];
        for request in cases {
            let err = run(&state, request).await.unwrap_err();
            assert!(matches!(err, ApiError::Validation(_)), "{err}");
        }

        assert!(state.repo.get_projects().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_project_merges_and_restarts() {
        let (state, _) = test_state();
        let mut project = sample_project("a");
        project.webhook = Some(WebhookConfig {
            enabled: true,
            url: "https://hooks.example.com/x".to_string(),
            ..Default::default()
        });
        state.repo.add_project(project).await.unwrap();

        let response = run(
            &state,
            json!({
                "action": "updateProject",
                "projectId": "a",
                "name": "Renamed",
                "interval": 120000
            }),
        )
        .await
        .unwrap();
        assert_eq!(response["project"]["name"], "Renamed");

        let stored = state.repo.get_project("a").await.unwrap().unwrap();
        assert_eq!(stored.interval, 120_000);
        assert_eq!(stored.selector, "#main");
        assert!(stored.webhook.is_some());
        assert!(state.monitor.is_scheduled("a").await);

        run(&state, json!({"action": "updateProject", "projectId": "a", "webhook": null}))
            .await
            .unwrap();
        assert!(state.repo.get_project("a").await.unwrap().unwrap().webhook.is_none());

        let missing = run(&state, json!({"action": "updateProject", "projectId": "zz"})).await;
        assert!(matches!(missing, Err(ApiError::NotFound(_))));
        state.monitor.stop("a").await;
    }

    #[tokio::test]
    async fn test_stop_and_start_monitor() {
        let (state, _) = test_state();
        let project = sample_project("a");
        state.repo.add_project(project.clone()).await.unwrap();

        run(&state, json!({"action": "startMonitor", "project": project}))
            .await
            .unwrap();
        assert!(state.monitor.is_scheduled("a").await);

        run(&state, json!({"action": "stopMonitor", "projectId": "a"}))
            .await
            .unwrap();
        assert!(!state.monitor.is_scheduled("a").await);
        assert!(!state.repo.get_project("a").await.unwrap().unwrap().active);

        // Stopping twice is fine.
        run(&state, json!({"action": "stopMonitor", "projectId": "a"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_project_and_logs() {
        let (state, _) = test_state();
        state.repo.add_project(sample_project("a")).await.unwrap();
        state
            .repo
            .add_log("a", crate::db::LogEntry::failed(chrono::Utc::now(), "boom"))
            .await
            .unwrap();

        let logs = run(&state, json!({"action": "getProjectLogs", "projectId": "a"}))
            .await
            .unwrap();
        assert_eq!(logs["logs"].as_array().unwrap().len(), 1);

        let response = run(&state, json!({"action": "deleteProject", "projectId": "a"}))
            .await
            .unwrap();
        assert_eq!(response["deleted"], true);

        let logs = run(&state, json!({"action": "getProjectLogs", "projectId": "a"}))
            .await
            .unwrap();
        assert!(logs["logs"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_settings_round_trip_and_validation() {
        let (state, _) = test_state();

        let response = run(&state, json!({"action": "getSettings"})).await.unwrap();
        assert_eq!(response["settings"]["webhookTimeout"], 10);

        run(
            &state,
            json!({"action": "saveSettings", "settings": {"webhookTimeout": 30}}),
        )
        .await
        .unwrap();
        assert_eq!(state.repo.get_settings().await.unwrap().webhook_timeout, 30);

        let err = run(
            &state,
            json!({"action": "saveSettings", "settings": {"webhookTimeout": 500}}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn test_browser_notification() {
        let (state, sink) = test_state();
        run(&state, json!({"action": "testBrowserNotification"}))
            .await
            .unwrap();
        assert_eq!(sink.alerts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_webhook_to_loopback_is_forbidden() {
        let (state, _) = test_state();
        let err = run(
            &state,
            json!({"action": "testWebhook", "config": {"enabled": true, "url": "http://127.0.0.1/x"}}),
        )
        .await
        .unwrap_err();

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().starts_with("blocked destination"));
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let parsed = serde_json::from_value::<Command>(json!({"action": "launchRockets"}));
        assert!(parsed.is_err());
    }

    #[tokio::test]
    async fn test_error_status_codes() {
        let not_found = ApiError::NotFound("a".to_string()).into_response();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let timeout = ApiError::Webhook(WebhookError::Timeout(std::time::Duration::from_secs(10)));
        assert_eq!(timeout.into_response().status(), StatusCode::GATEWAY_TIMEOUT);

        let store = ApiError::Store(DbError::QueueClosed).into_response();
        assert_eq!(store.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
