//! Execution contexts (rendered pages) and the cache that reuses them.

use super::FetchError;

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

/// Default number of URL → context mappings kept.
pub const CONTEXT_CACHE_CAPACITY: usize = 200;

/// Opaque handle to an execution context.
pub type ContextId = u64;

/// Current state of a live context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextInfo {
    pub id: ContextId,
    pub url: String,
    pub loading: bool,
}

/// Lifecycle events published by a [`ContextProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEvent {
    Closed(ContextId),
    Navigated { id: ContextId, url: String },
}

/// The environment that owns execution contexts.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    /// State of a context, or `None` if it no longer exists.
    async fn inspect(&self, id: ContextId) -> Option<ContextInfo>;
    /// An existing live context showing `url`, if any.
    async fn find(&self, url: &str) -> Option<ContextInfo>;
    /// Create a context and start loading `url`.
    async fn open(&self, url: &str) -> Result<ContextId, FetchError>;
    async fn close(&self, id: ContextId);
    /// Stream of close/navigation events, if the environment reports them.
    fn events(&self) -> Option<broadcast::Receiver<ContextEvent>> {
        None
    }
}

/// Reads element text out of a loaded context.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, context: ContextId, selector: &str) -> Result<String, FetchError>;
}

/// Bounded URL → context map with strict FIFO eviction.
///
/// The oldest inserted URL is evicted first, however recently it was read.
#[derive(Debug)]
pub struct ContextCache {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashMap<String, ContextId>,
}

impl ContextCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
        }
    }

    pub fn get(&self, url: &str) -> Option<ContextId> {
        self.entries.get(url).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a mapping and return the evicted entry, if one was pushed out.
    ///
    /// Re-adding a known URL replaces its handle and keeps its queue position.
    pub fn add(&mut self, url: &str, id: ContextId) -> Option<(String, ContextId)> {
        if let Some(existing) = self.entries.get_mut(url) {
            *existing = id;
            return None;
        }

        let mut evicted = None;
        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                evicted = self.entries.remove(&oldest).map(|old| (oldest, old));
            }
        }

        self.order.push_back(url.to_string());
        self.entries.insert(url.to_string(), id);
        evicted
    }

    pub fn remove(&mut self, url: &str) -> Option<ContextId> {
        let id = self.entries.remove(url)?;
        self.order.retain(|u| u != url);
        Some(id)
    }

    /// Remove `url` only while it still maps to `id`.
    pub fn remove_if(&mut self, url: &str, id: ContextId) -> bool {
        if self.get(url) == Some(id) {
            self.remove(url);
            true
        } else {
            false
        }
    }

    /// Drop every mapping to `id`, optionally keeping the one for `keep_url`.
    fn purge(&mut self, id: ContextId, keep_url: Option<&str>) -> usize {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(url, ctx)| **ctx == id && Some(url.as_str()) != keep_url)
            .map(|(url, _)| url.clone())
            .collect();
        for url in &stale {
            self.remove(url);
        }
        stale.len()
    }
}

/// A context handed out for one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: ContextId,
    pub url: String,
    /// True if the context was opened by this pool. It is closed when the
    /// last lease on it is released.
    pub created: bool,
}

impl Lease {
    fn new(id: ContextId, url: &str, created: bool) -> Self {
        Self {
            id,
            url: url.to_string(),
            created,
        }
    }
}

#[derive(Debug)]
struct PoolState {
    cache: ContextCache,
    /// Outstanding leases per context this pool opened.
    holders: HashMap<ContextId, usize>,
}

impl PoolState {
    /// Count a new lease on `id` and tell whether the pool owns it.
    fn hold(&mut self, id: ContextId) -> bool {
        match self.holders.get_mut(&id) {
            Some(count) => {
                *count += 1;
                true
            }
            None => false,
        }
    }
}

/// Hands out contexts, reusing live ones from the cache or the environment.
pub struct ContextPool {
    provider: Arc<dyn ContextProvider>,
    state: Mutex<PoolState>,
}

impl ContextPool {
    pub fn new(provider: Arc<dyn ContextProvider>, capacity: usize) -> Arc<Self> {
        let pool = Arc::new(Self {
            provider,
            state: Mutex::new(PoolState {
                cache: ContextCache::new(capacity),
                holders: HashMap::new(),
            }),
        });
        pool.watch_events();
        pool
    }

    pub fn provider(&self) -> &dyn ContextProvider {
        self.provider.as_ref()
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A context showing `url`: cached, found in the environment, or new.
    pub async fn acquire(&self, url: &str) -> Result<Lease, FetchError> {
        let cached = self.state().cache.get(url);
        if let Some(id) = cached {
            match self.provider.inspect(id).await {
                Some(info) if info.url == url => {
                    let mut state = self.state();
                    // A release may have dropped the entry while we inspected.
                    if state.cache.get(url) == Some(id) {
                        let created = state.hold(id);
                        return Ok(Lease::new(id, url, created));
                    }
                }
                _ => {
                    self.state().cache.remove_if(url, id);
                }
            }
        }

        if let Some(info) = self.provider.find(url).await {
            let mut state = self.state();
            let created = state.hold(info.id);
            insert(&mut state.cache, url, info.id);
            return Ok(Lease::new(info.id, url, created));
        }

        let id = self.provider.open(url).await?;
        let mut state = self.state();
        state.holders.insert(id, 1);
        insert(&mut state.cache, url, id);
        Ok(Lease::new(id, url, true))
    }

    /// Give a lease back. A context this pool opened is closed once no other
    /// lease holds it; reused ones are left open.
    pub async fn release(&self, lease: Lease) {
        if !lease.created {
            return;
        }
        {
            let mut state = self.state();
            let Some(count) = state.holders.get_mut(&lease.id) else {
                return;
            };
            *count -= 1;
            if *count > 0 {
                return;
            }
            state.holders.remove(&lease.id);
            state.cache.remove_if(&lease.url, lease.id);
        }
        self.provider.close(lease.id).await;
    }

    /// Apply a provider event to the cache.
    pub fn handle_event(&self, event: ContextEvent) {
        let purged = match &event {
            ContextEvent::Closed(id) => self.state().cache.purge(*id, None),
            ContextEvent::Navigated { id, url } => {
                self.state().cache.purge(*id, Some(url.as_str()))
            }
        };
        if purged > 0 {
            tracing::debug!("ContextPool: purged {} entries after {:?}", purged, event);
        }
    }

    pub fn cached(&self, url: &str) -> Option<ContextId> {
        self.state().cache.get(url)
    }

    fn watch_events(self: &Arc<Self>) {
        let Some(mut rx) = self.provider.events() else {
            return;
        };
        let pool = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => match pool.upgrade() {
                        Some(pool) => pool.handle_event(event),
                        None => break,
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("ContextPool: missed {} context events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

fn insert(cache: &mut ContextCache, url: &str, id: ContextId) {
    if let Some((evicted, _)) = cache.add(url, id) {
        tracing::debug!("ContextPool: evicted {}", evicted);
    }
}
