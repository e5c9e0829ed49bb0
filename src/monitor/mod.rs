//! Monitor scheduler: one recurring trigger per active project.

mod contexts;
mod page;

pub use contexts::*;
pub use page::*;

use crate::db::{DbError, LogEntry, Project, ProjectPatch, ProjectRepository, MAX_LOAD_DELAY_MS};
use crate::notify::Notifier;

use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};

/// Content fetch error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("element not found: {0}")]
    NotFound(String),
    #[error("invalid selector: {0}")]
    InvalidSelector(String),
    #[error("page did not finish loading within {0:?}")]
    LoadTimeout(Duration),
    #[error("execution context is gone")]
    ContextGone,
    #[error("network error: {0}")]
    Network(String),
}

/// Timing knobs for checks.
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// Upper bound on waiting for a context to finish loading.
    pub load_timeout: Duration,
    pub poll_interval: Duration,
    /// Wait after load, before the project's own load delay.
    pub settle_delay: Duration,
    pub context_capacity: usize,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            settle_delay: Duration::from_millis(500),
            context_capacity: CONTEXT_CACHE_CAPACITY,
        }
    }
}

/// What a single check did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The content could not be read; a failed log entry was written.
    Failed,
    /// First content seen for the project.
    Baseline,
    Unchanged,
    /// Content differs from the previous value; the notifier was invoked.
    Changed,
    /// The project was deleted while the check ran.
    Vanished,
}

struct Trigger {
    generation: u64,
    stop: broadcast::Sender<()>,
}

/// Schedules and runs content checks.
#[derive(Clone)]
pub struct Monitor {
    repo: ProjectRepository,
    contexts: Arc<ContextPool>,
    fetcher: Arc<dyn PageFetcher>,
    notifier: Notifier,
    options: MonitorOptions,
    triggers: Arc<RwLock<HashMap<String, Trigger>>>,
    generation: Arc<AtomicU64>,
}

impl Monitor {
    pub fn new(
        repo: ProjectRepository,
        provider: Arc<dyn ContextProvider>,
        fetcher: Arc<dyn PageFetcher>,
        notifier: Notifier,
        options: MonitorOptions,
    ) -> Self {
        let contexts = ContextPool::new(provider, options.context_capacity);
        Self {
            repo,
            contexts,
            fetcher,
            notifier,
            options,
            triggers: Arc::new(RwLock::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn contexts(&self) -> &ContextPool {
        &self.contexts
    }

    /// Schedule `project`, replacing any trigger it already has. The first
    /// check runs immediately.
    pub async fn start(&self, project: &Project) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (stop_tx, stop_rx) = broadcast::channel(1);

        let previous = self.triggers.write().await.insert(
            project.id.clone(),
            Trigger {
                generation,
                stop: stop_tx,
            },
        );
        if let Some(previous) = previous {
            let _ = previous.stop.send(());
        }

        tracing::info!(
            "Monitor: scheduling {} every {:?}",
            project.name,
            project.period()
        );

        let monitor = self.clone();
        let id = project.id.clone();
        let period = project.period();

        tokio::spawn(async move {
            run_trigger_loop(&monitor, &id, period, generation, stop_rx).await;
            monitor.forget(&id, generation).await;
        });
    }

    /// Cancel the project's trigger. Returns false if none was scheduled.
    /// A check already in flight runs to completion.
    pub async fn stop(&self, id: &str) -> bool {
        let Some(trigger) = self.triggers.write().await.remove(id) else {
            return false;
        };
        let _ = trigger.stop.send(());
        tracing::info!("Monitor: stopped {}", id);
        true
    }

    pub async fn is_scheduled(&self, id: &str) -> bool {
        self.triggers.read().await.contains_key(id)
    }

    /// Rebuild triggers from the persisted active projects.
    pub async fn resume_active(&self) -> Result<usize, DbError> {
        let projects = self.repo.get_projects().await?;
        let mut started = 0;
        for project in projects.iter().filter(|p| p.active) {
            self.start(project).await;
            started += 1;
        }
        tracing::info!("Monitor: resumed {} of {} projects", started, projects.len());
        Ok(started)
    }

    /// Drop the trigger only if it still belongs to `generation`.
    async fn forget(&self, id: &str, generation: u64) {
        let mut triggers = self.triggers.write().await;
        if triggers.get(id).is_some_and(|t| t.generation == generation) {
            if let Some(trigger) = triggers.remove(id) {
                let _ = trigger.stop.send(());
            }
        }
    }

    /// A trigger fired: re-read the project and check it, or cancel the
    /// trigger if the project is gone or inactive.
    async fn fire(&self, id: &str, generation: u64) {
        let project = match self.repo.get_project(id).await {
            Ok(Some(project)) if project.active => project,
            Ok(_) => {
                tracing::info!("Monitor: {} is gone or inactive, cancelling trigger", id);
                self.forget(id, generation).await;
                return;
            }
            Err(e) => {
                tracing::error!("Monitor: failed to load {}: {}", id, e);
                return;
            }
        };

        self.check_element(&project).await;
    }

    /// Fetch the project's element, record the result and notify on change.
    pub async fn check_element(&self, project: &Project) -> CheckOutcome {
        let lease = match self.contexts.acquire(&project.url).await {
            Ok(lease) => lease,
            Err(e) => return self.record_failure(project, &e).await,
        };

        let fetched = self.load_and_fetch(lease.id, project).await;
        self.contexts.release(lease).await;

        let content = match fetched {
            Ok(content) => content,
            Err(e) => return self.record_failure(project, &e).await,
        };

        let now = Utc::now();
        let patch = ProjectPatch {
            last_content: Some(content.clone()),
            last_checked: Some(now),
            ..Default::default()
        };

        // Compare against what the update replaced, not the copy we were handed.
        let previous = match self.repo.update_project(&project.id, patch).await {
            Ok(Some(previous)) => previous,
            Ok(None) => {
                tracing::debug!("Monitor: {} was deleted during the check", project.id);
                return CheckOutcome::Vanished;
            }
            Err(e) => {
                tracing::error!("Monitor: failed to store content for {}: {}", project.name, e);
                return CheckOutcome::Failed;
            }
        };

        let old = previous.last_content.clone().unwrap_or_default();
        let changed = !old.is_empty() && old != content;
        let old_content = (!old.is_empty()).then(|| old.clone());

        let entry = LogEntry::checked(now, content.clone(), old_content, changed);
        if let Err(e) = self.repo.add_log(&project.id, entry).await {
            tracing::error!("Monitor: failed to log check for {}: {}", project.name, e);
        }

        if changed {
            tracing::info!("Monitor: content changed for {}", previous.name);
            self.notifier.notify(&previous, &old, &content).await;
            CheckOutcome::Changed
        } else if old.is_empty() {
            CheckOutcome::Baseline
        } else {
            CheckOutcome::Unchanged
        }
    }

    async fn load_and_fetch(
        &self,
        context: ContextId,
        project: &Project,
    ) -> Result<String, FetchError> {
        self.wait_for_load(context).await?;

        let load_delay = Duration::from_millis(project.load_delay.min(MAX_LOAD_DELAY_MS));
        tokio::time::sleep(self.options.settle_delay + load_delay).await;

        self.fetcher.fetch(context, &project.selector).await
    }

    async fn wait_for_load(&self, context: ContextId) -> Result<(), FetchError> {
        let deadline = Instant::now() + self.options.load_timeout;
        loop {
            match self.contexts.provider().inspect(context).await {
                None => return Err(FetchError::ContextGone),
                Some(info) if !info.loading => return Ok(()),
                Some(_) => {}
            }
            if Instant::now() >= deadline {
                return Err(FetchError::LoadTimeout(self.options.load_timeout));
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    async fn record_failure(&self, project: &Project, error: &FetchError) -> CheckOutcome {
        tracing::warn!("Monitor: check failed for {}: {}", project.name, error);
        let entry = LogEntry::failed(Utc::now(), error.to_string());
        if let Err(e) = self.repo.add_log(&project.id, entry).await {
            tracing::error!("Monitor: failed to log failure for {}: {}", project.name, e);
        }
        CheckOutcome::Failed
    }
}

/// Fire checks for one project until told to stop.
async fn run_trigger_loop(
    monitor: &Monitor,
    id: &str,
    period: Duration,
    generation: u64,
    mut stop_rx: broadcast::Receiver<()>,
) {
    // One check per project at a time.
    let in_flight = Arc::new(Semaphore::new(1));

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut immediate = true;

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                break;
            }
            _ = interval.tick() => {
                let permit = match in_flight.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        tracing::warn!(
                            "Monitor: skipping tick for {}, previous check still running",
                            id
                        );
                        continue;
                    }
                };

                let jitter = if immediate {
                    Duration::ZERO
                } else {
                    Duration::from_millis(rand::thread_rng().gen_range(0..100))
                };
                immediate = false;

                let monitor = monitor.clone();
                let id = id.to_string();

                tokio::spawn(async move {
                    let _permit = permit;
                    tokio::time::sleep(jitter).await;
                    monitor.fire(&id, generation).await;
                });
            }
        }
    }
}
