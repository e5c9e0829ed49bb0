//! Atomic project repository.
//!
//! Every operation is a closure pushed onto one queue and executed by a single
//! worker task. Each closure performs its whole read-then-write cycle against
//! the backing store before the next one starts, so updates from concurrent
//! triggers and commands never overwrite each other.

use super::models::{LogEntry, Project, ProjectPatch, Settings, MAX_LOG_ENTRIES};
use super::store::{DbError, KeyValueStore};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

pub const PROJECTS_KEY: &str = "projects";
pub const LOGS_KEY: &str = "logs";
pub const SETTINGS_KEY: &str = "settings";

type Operation = Box<dyn FnOnce(&dyn KeyValueStore) + Send>;
type LogMap = HashMap<String, Vec<LogEntry>>;

/// Handle to the serialized project store. Cheap to clone.
#[derive(Clone)]
pub struct ProjectRepository {
    queue: mpsc::UnboundedSender<Operation>,
}

impl ProjectRepository {
    /// Create a repository and spawn its worker on the current runtime.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_queue(rx, store));
        Self { queue: tx }
    }

    /// Enqueue an operation and wait for its result.
    async fn run<T, F>(&self, op: F) -> Result<T, DbError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn KeyValueStore) -> Result<T, DbError> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.queue
            .send(Box::new(move |store| {
                // The caller may have gone away; nothing to report then.
                let _ = tx.send(op(store));
            }))
            .map_err(|_| DbError::QueueClosed)?;

        rx.await.map_err(|_| DbError::Aborted)?
    }

    // --- Projects ---

    pub async fn get_projects(&self) -> Result<Vec<Project>, DbError> {
        self.run(|store| read_projects(store)).await
    }

    pub async fn set_projects(&self, projects: Vec<Project>) -> Result<(), DbError> {
        self.run(move |store| write_json(store, PROJECTS_KEY, &projects))
            .await
    }

    pub async fn get_project(&self, id: &str) -> Result<Option<Project>, DbError> {
        let id = id.to_string();
        self.run(move |store| {
            Ok(read_projects(store)?.into_iter().find(|p| p.id == id))
        })
        .await
    }

    /// Append a project. An existing project with the same id is replaced.
    pub async fn add_project(&self, project: Project) -> Result<(), DbError> {
        self.run(move |store| {
            let mut projects = read_projects(store)?;
            projects.retain(|p| p.id != project.id);
            projects.push(project);
            write_json(store, PROJECTS_KEY, &projects)
        })
        .await
    }

    /// Remove a project and its logs. Returns false if it did not exist.
    pub async fn remove_project(&self, id: &str) -> Result<bool, DbError> {
        let id = id.to_string();
        self.run(move |store| {
            let mut projects = read_projects(store)?;
            let before = projects.len();
            projects.retain(|p| p.id != id);
            if projects.len() == before {
                return Ok(false);
            }
            write_json(store, PROJECTS_KEY, &projects)?;

            let mut logs = read_logs(store)?;
            if logs.remove(&id).is_some() {
                write_json(store, LOGS_KEY, &logs)?;
            }
            Ok(true)
        })
        .await
    }

    /// Merge `patch` into the project and return the project as it was
    /// *before* the update, or `None` if no such project exists.
    ///
    /// Change detection must compare against the returned snapshot: it is the
    /// value that was actually replaced, whatever other updates ran in between.
    pub async fn update_project(
        &self,
        id: &str,
        patch: ProjectPatch,
    ) -> Result<Option<Project>, DbError> {
        let id = id.to_string();
        self.run(move |store| {
            let mut projects = read_projects(store)?;
            let Some(project) = projects.iter_mut().find(|p| p.id == id) else {
                return Ok(None);
            };
            let previous = project.clone();
            patch.apply(project);
            write_json(store, PROJECTS_KEY, &projects)?;
            Ok(Some(previous))
        })
        .await
    }

    // --- Logs ---

    /// Prepend a log entry, keeping the newest [`MAX_LOG_ENTRIES`].
    ///
    /// Entries for a project that no longer exists are dropped, so a check
    /// finishing after a delete cannot bring its logs back.
    pub async fn add_log(&self, project_id: &str, entry: LogEntry) -> Result<(), DbError> {
        let project_id = project_id.to_string();
        self.run(move |store| {
            if !read_projects(store)?.iter().any(|p| p.id == project_id) {
                tracing::debug!(
                    "Repository: dropping log entry for deleted project {}",
                    project_id
                );
                return Ok(());
            }
            let mut logs = read_logs(store)?;
            let entries = logs.entry(project_id).or_default();
            entries.insert(0, entry);
            entries.truncate(MAX_LOG_ENTRIES);
            write_json(store, LOGS_KEY, &logs)
        })
        .await
    }

    pub async fn get_project_logs(&self, project_id: &str) -> Result<Vec<LogEntry>, DbError> {
        let project_id = project_id.to_string();
        self.run(move |store| {
            Ok(read_logs(store)?.remove(&project_id).unwrap_or_default())
        })
        .await
    }

    pub async fn clear_project_logs(&self, project_id: &str) -> Result<(), DbError> {
        let project_id = project_id.to_string();
        self.run(move |store| {
            let mut logs = read_logs(store)?;
            if logs.remove(&project_id).is_some() {
                write_json(store, LOGS_KEY, &logs)?;
            }
            Ok(())
        })
        .await
    }

    // --- Settings ---

    pub async fn get_settings(&self) -> Result<Settings, DbError> {
        self.run(|store| read_json(store, SETTINGS_KEY)).await
    }

    pub async fn set_settings(&self, settings: Settings) -> Result<(), DbError> {
        self.run(move |store| write_json(store, SETTINGS_KEY, &settings))
            .await
    }
}

/// Drain the operation queue one operation at a time.
async fn run_queue(mut rx: mpsc::UnboundedReceiver<Operation>, store: Arc<dyn KeyValueStore>) {
    while let Some(op) = rx.recv().await {
        // A panicking operation drops its reply sender; its caller sees
        // `Aborted` and the queue keeps going.
        if std::panic::catch_unwind(AssertUnwindSafe(|| op(store.as_ref()))).is_err() {
            tracing::error!("Repository: store operation panicked");
        }
    }
    tracing::debug!("Repository: operation queue closed");
}

fn read_json<T: DeserializeOwned + Default>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<T, DbError> {
    match store.get(key)? {
        Some(Value::Null) | None => Ok(T::default()),
        Some(value) => Ok(serde_json::from_value(value)?),
    }
}

fn write_json<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), DbError> {
    store.set(key, &serde_json::to_value(value)?)
}

fn read_projects(store: &dyn KeyValueStore) -> Result<Vec<Project>, DbError> {
    read_json(store, PROJECTS_KEY)
}

fn read_logs(store: &dyn KeyValueStore) -> Result<LogMap, DbError> {
    read_json(store, LOGS_KEY)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio_test::{assert_err, assert_ok};

    pub(crate) fn memory_repo() -> ProjectRepository {
        ProjectRepository::new(Arc::new(SqliteStore::in_memory().unwrap()))
    }

    pub(crate) fn sample_project(id: &str) -> Project {
        Project {
            id: id.to_string(),
            name: format!("Project {id}"),
            url: "https://example.com/page".to_string(),
            selector: "#main".to_string(),
            interval: 60_000,
            ..Default::default()
        }
    }

    /// Store whose operations fail while `broken` is set.
    struct FlakyStore {
        inner: SqliteStore,
        broken: AtomicBool,
    }

    impl KeyValueStore for FlakyStore {
        fn get(&self, key: &str) -> Result<Option<Value>, DbError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(DbError::Migration("backend unavailable".to_string()));
            }
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &Value) -> Result<(), DbError> {
            if key == "panic" {
                panic!("simulated backend panic");
            }
            self.inner.set(key, value)
        }
    }

    #[tokio::test]
    async fn test_project_crud() {
        let repo = memory_repo();
        assert!(repo.get_projects().await.unwrap().is_empty());

        repo.add_project(sample_project("a")).await.unwrap();
        repo.add_project(sample_project("b")).await.unwrap();
        assert_eq!(repo.get_projects().await.unwrap().len(), 2);

        assert!(repo.remove_project("a").await.unwrap());
        assert!(!repo.remove_project("a").await.unwrap());
        assert!(repo.get_project("a").await.unwrap().is_none());
        assert!(repo.get_project("b").await.unwrap().is_some());

        repo.set_projects(vec![]).await.unwrap();
        assert!(repo.get_projects().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_returns_previous_snapshot() {
        let repo = memory_repo();
        let mut project = sample_project("a");
        project.last_content = Some("A".to_string());
        repo.add_project(project).await.unwrap();

        let previous = repo
            .update_project(
                "a",
                ProjectPatch {
                    last_content: Some("B".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(previous.last_content.as_deref(), Some("A"));
        let current = repo.get_project("a").await.unwrap().unwrap();
        assert_eq!(current.last_content.as_deref(), Some("B"));

        let missing = repo.update_project("nope", ProjectPatch::default()).await;
        assert!(missing.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_updates_all_apply() {
        let repo = memory_repo();
        repo.add_project(sample_project("a")).await.unwrap();

        let patches = vec![
            ProjectPatch {
                name: Some("renamed".to_string()),
                ..Default::default()
            },
            ProjectPatch {
                url: Some("https://example.org/".to_string()),
                ..Default::default()
            },
            ProjectPatch {
                selector: Some(".price".to_string()),
                ..Default::default()
            },
            ProjectPatch {
                interval: Some(120_000),
                ..Default::default()
            },
            ProjectPatch {
                load_delay: Some(2_500),
                ..Default::default()
            },
            ProjectPatch {
                browser_notification: Some(false),
                ..Default::default()
            },
            ProjectPatch {
                last_content: Some("content".to_string()),
                ..Default::default()
            },
            ProjectPatch {
                active: Some(false),
                ..Default::default()
            },
        ];
        let count = patches.len();

        let handles: Vec<_> = patches
            .into_iter()
            .map(|patch| {
                let repo = repo.clone();
                tokio::spawn(async move { repo.update_project("a", patch).await })
            })
            .collect();

        let mut snapshots = Vec::new();
        for handle in handles {
            snapshots.push(handle.await.unwrap().unwrap().unwrap());
        }

        let project = repo.get_project("a").await.unwrap().unwrap();
        assert_eq!(project.name, "renamed");
        assert_eq!(project.url, "https://example.org/");
        assert_eq!(project.selector, ".price");
        assert_eq!(project.interval, 120_000);
        assert_eq!(project.load_delay, 2_500);
        assert!(!project.browser_notification);
        assert_eq!(project.last_content.as_deref(), Some("content"));
        assert!(!project.active);

        // Each update observed a distinct predecessor.
        for i in 0..count {
            for j in (i + 1)..count {
                assert_ne!(snapshots[i], snapshots[j]);
            }
        }
    }

    #[tokio::test]
    async fn test_logs_newest_first_and_bounded() {
        let repo = memory_repo();
        repo.add_project(sample_project("a")).await.unwrap();

        for i in 0..(MAX_LOG_ENTRIES + 5) {
            repo.add_log("a", LogEntry::checked(Utc::now(), i.to_string(), None, false))
                .await
                .unwrap();
        }

        let logs = repo.get_project_logs("a").await.unwrap();
        assert_eq!(logs.len(), MAX_LOG_ENTRIES);
        assert_eq!(logs[0].content.as_deref(), Some("104"));
        assert_eq!(logs[MAX_LOG_ENTRIES - 1].content.as_deref(), Some("5"));

        repo.clear_project_logs("a").await.unwrap();
        assert!(repo.get_project_logs("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_project_drops_logs() {
        let repo = memory_repo();
        repo.add_project(sample_project("a")).await.unwrap();
        repo.add_log("a", LogEntry::failed(Utc::now(), "boom")).await.unwrap();

        assert!(repo.remove_project("a").await.unwrap());
        assert!(repo.get_project_logs("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_log_for_deleted_project_is_dropped() {
        let repo = memory_repo();
        repo.add_project(sample_project("a")).await.unwrap();
        assert!(repo.remove_project("a").await.unwrap());

        assert_ok!(repo.add_log("a", LogEntry::failed(Utc::now(), "late")).await);
        assert!(repo.get_project_logs("a").await.unwrap().is_empty());
        assert!(read_logs_for_test(&repo).await.is_empty());
    }

    async fn read_logs_for_test(repo: &ProjectRepository) -> LogMap {
        repo.run(|store| read_logs(store)).await.unwrap()
    }

    #[tokio::test]
    async fn test_settings_default_until_saved() {
        let repo = memory_repo();
        assert_eq!(repo.get_settings().await.unwrap(), Settings::default());

        let settings = Settings {
            webhook_timeout: 30,
            ..Default::default()
        };
        repo.set_settings(settings.clone()).await.unwrap();
        assert_eq!(repo.get_settings().await.unwrap(), settings);
    }

    #[tokio::test]
    async fn test_failed_operation_does_not_block_queue() {
        let store = Arc::new(FlakyStore {
            inner: SqliteStore::in_memory().unwrap(),
            broken: AtomicBool::new(true),
        });
        let repo = ProjectRepository::new(store.clone());

        assert_err!(repo.get_projects().await);
        store.broken.store(false, Ordering::SeqCst);
        assert_ok!(repo.add_project(sample_project("a")).await);
        assert_eq!(repo.get_projects().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_operation_reports_aborted() {
        let store = Arc::new(FlakyStore {
            inner: SqliteStore::in_memory().unwrap(),
            broken: AtomicBool::new(false),
        });
        let repo = ProjectRepository::new(store);

        let result = repo
            .run(|store| store.set("panic", &Value::Null))
            .await;
        assert!(matches!(result, Err(DbError::Aborted)));

        assert_ok!(repo.add_project(sample_project("a")).await);
    }
}
