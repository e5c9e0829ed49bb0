//! Static HTML page environment.
//!
//! Each context is one HTTP fetch of the page; element text is extracted
//! from the returned document with a CSS selector. No script runs, so pages
//! that render client-side need a browser-backed provider instead.

use super::contexts::{ContextEvent, ContextId, ContextInfo, ContextProvider, PageFetcher};
use super::FetchError;

use async_trait::async_trait;
use scraper::{Html, Selector};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
enum PageState {
    Loading,
    Loaded(String),
    Failed(String),
}

#[derive(Debug, Clone)]
struct Page {
    url: String,
    state: PageState,
}

type Pages = Arc<Mutex<HashMap<ContextId, Page>>>;

fn lock(pages: &Pages) -> MutexGuard<'_, HashMap<ContextId, Page>> {
    pages.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Page environment backed by plain HTTP requests.
pub struct HttpPageEnvironment {
    client: reqwest::Client,
    next_id: AtomicU64,
    pages: Pages,
    events: broadcast::Sender<ContextEvent>,
}

impl HttpPageEnvironment {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        let (events, _) = broadcast::channel(64);

        Ok(Self {
            client,
            next_id: AtomicU64::new(1),
            pages: Arc::new(Mutex::new(HashMap::new())),
            events,
        })
    }
}

#[async_trait]
impl ContextProvider for HttpPageEnvironment {
    async fn inspect(&self, id: ContextId) -> Option<ContextInfo> {
        lock(&self.pages).get(&id).map(|page| ContextInfo {
            id,
            url: page.url.clone(),
            loading: matches!(page.state, PageState::Loading),
        })
    }

    async fn find(&self, url: &str) -> Option<ContextInfo> {
        lock(&self.pages)
            .iter()
            .find(|(_, page)| page.url == url && matches!(page.state, PageState::Loaded(_)))
            .map(|(id, page)| ContextInfo {
                id: *id,
                url: page.url.clone(),
                loading: false,
            })
    }

    async fn open(&self, url: &str) -> Result<ContextId, FetchError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.pages).insert(
            id,
            Page {
                url: url.to_string(),
                state: PageState::Loading,
            },
        );

        let request = self.client.get(url);
        let pages = self.pages.clone();
        let url = url.to_string();

        tokio::spawn(async move {
            let state = match request.send().await {
                Ok(response) if response.status().is_success() => match response.text().await {
                    Ok(body) => PageState::Loaded(body),
                    Err(e) => PageState::Failed(e.to_string()),
                },
                Ok(response) => PageState::Failed(format!("HTTP {}", response.status())),
                Err(e) => PageState::Failed(e.to_string()),
            };

            if let PageState::Failed(reason) = &state {
                tracing::warn!("Page: failed to load {}: {}", url, reason);
            }

            // The context may have been closed while loading.
            if let Some(page) = lock(&pages).get_mut(&id) {
                page.state = state;
            }
        });

        Ok(id)
    }

    async fn close(&self, id: ContextId) {
        if lock(&self.pages).remove(&id).is_some() {
            // No receivers is fine.
            let _ = self.events.send(ContextEvent::Closed(id));
        }
    }

    fn events(&self) -> Option<broadcast::Receiver<ContextEvent>> {
        Some(self.events.subscribe())
    }
}

#[async_trait]
impl PageFetcher for HttpPageEnvironment {
    async fn fetch(&self, context: ContextId, selector: &str) -> Result<String, FetchError> {
        let state = lock(&self.pages)
            .get(&context)
            .map(|page| page.state.clone())
            .ok_or(FetchError::ContextGone)?;

        match state {
            PageState::Loaded(body) => extract_text(&body, selector),
            PageState::Failed(reason) => Err(FetchError::Network(reason)),
            PageState::Loading => Err(FetchError::Network("page still loading".to_string())),
        }
    }
}

/// Text of the first element matching `selector`, whitespace-collapsed.
pub fn extract_text(html: &str, selector: &str) -> Result<String, FetchError> {
    let parsed = Selector::parse(selector)
        .map_err(|e| FetchError::InvalidSelector(format!("{selector}: {e}")))?;
    let document = Html::parse_document(html);

    let element = document
        .select(&parsed)
        .next()
        .ok_or_else(|| FetchError::NotFound(selector.to_string()))?;

    let text = element.text().collect::<Vec<_>>().join(" ");
    Ok(text.split_whitespace().collect::<Vec<_>>().join(" "))
}
