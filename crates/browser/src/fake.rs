//! In-memory scripted site for exercising portal protocols without a browser.
//!
//! A [`FakeSite`] holds the page state every [`FakePage`] it launches acts
//! on.  Tests describe the site with selectors, texts, table rows and click
//! handlers, then hand [`FakeSite::launcher`] to the code under test.  Each
//! launch starts a fresh, logged-out tab, the same as a new browser profile.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use crate::{
    BrowserError, BrowserLauncher, POLL_INTERVAL, Page, ResponseInfo, ResponseMatcher, Result,
};

pub type ClickHandler = Arc<dyn Fn(&mut SiteState) -> Option<ResponseInfo> + Send + Sync>;

/// Mutable page state shared by every tab of a [`FakeSite`].
#[derive(Debug, Default)]
pub struct SiteState {
    pub url: String,
    pub logged_in: bool,
    /// Unauthenticated navigations anywhere else land here.
    pub login_url: Option<String>,
    pub present: HashSet<String>,
    pub texts: HashMap<String, String>,
    /// Rows returned for a row selector, already projected onto cells.
    pub rows: HashMap<String, Vec<Vec<Option<String>>>>,
    pub navigations: Vec<String>,
    pub fills: Vec<(String, String)>,
    pub clicks: Vec<String>,
    /// Navigations block until the tab is closed or crashes.
    pub hang: bool,
    /// Location reads that fail as if the page were between documents.
    pub busy_reads: usize,
}

impl SiteState {
    pub fn show(&mut self, selector: &str) {
        self.present.insert(selector.to_string());
    }

    pub fn hide(&mut self, selector: &str) {
        self.present.remove(selector);
        self.texts.remove(selector);
    }

    pub fn set_text(&mut self, selector: &str, text: &str) {
        self.show(selector);
        self.texts.insert(selector.to_string(), text.to_string());
    }

    pub fn set_rows(&mut self, row_selector: &str, rows: Vec<Vec<Option<String>>>) {
        self.rows.insert(row_selector.to_string(), rows);
    }

    pub fn value_of(&self, selector: &str) -> Option<&str> {
        self.fills
            .iter()
            .rev()
            .find(|(sel, _)| sel == selector)
            .map(|(_, v)| v.as_str())
    }

    pub fn clicks_on(&self, selector: &str) -> usize {
        self.clicks.iter().filter(|c| *c == selector).count()
    }
}

struct Shared {
    state: Mutex<SiteState>,
    handlers: Mutex<HashMap<String, ClickHandler>>,
    responses: broadcast::Sender<ResponseInfo>,
    current: Mutex<Option<Arc<watch::Sender<bool>>>>,
    launches: AtomicUsize,
    failing_launches: AtomicUsize,
    closes: AtomicUsize,
}

#[derive(Clone)]
pub struct FakeSite {
    shared: Arc<Shared>,
}

impl Default for FakeSite {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSite {
    pub fn new() -> Self {
        let (responses, _) = broadcast::channel(32);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SiteState::default()),
                handlers: Mutex::new(HashMap::new()),
                responses,
                current: Mutex::new(None),
                launches: AtomicUsize::new(0),
                failing_launches: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
            }),
        }
    }

    pub fn with_login_redirect(self, login_url: &str) -> Self {
        self.update(|s| s.login_url = Some(login_url.to_string()));
        self
    }

    /// Run `handler` whenever `selector` is clicked.  A returned response is
    /// delivered to pending [`Page::wait_for_response`] listeners.
    pub fn on_click<F>(&self, selector: &str, handler: F)
    where
        F: Fn(&mut SiteState) -> Option<ResponseInfo> + Send + Sync + 'static,
    {
        lock(&self.shared.handlers).insert(selector.to_string(), Arc::new(handler));
    }

    pub fn update(&self, f: impl FnOnce(&mut SiteState)) {
        f(&mut *lock(&self.shared.state));
    }

    pub fn inspect<R>(&self, f: impl FnOnce(&SiteState) -> R) -> R {
        f(&*lock(&self.shared.state))
    }

    pub fn launcher(&self) -> FakeLauncher {
        FakeLauncher { site: self.clone() }
    }

    pub fn launches(&self) -> usize {
        self.shared.launches.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    pub fn fail_next_launches(&self, n: usize) {
        self.shared.failing_launches.store(n, Ordering::SeqCst);
    }

    /// Drop the connection of the most recently launched tab.
    pub fn crash(&self) {
        if let Some(tx) = lock(&self.shared.current).as_ref() {
            tx.send_replace(true);
        }
    }

    fn state(&self) -> MutexGuard<'_, SiteState> {
        lock(&self.shared.state)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct FakeLauncher {
    site: FakeSite,
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self) -> Result<Arc<dyn Page>> {
        let shared = &self.site.shared;
        let failing = shared.failing_launches.load(Ordering::SeqCst);
        if failing > 0 {
            shared.failing_launches.store(failing - 1, Ordering::SeqCst);
            return Err(BrowserError::Launch("scripted launch failure".to_string()));
        }
        shared.launches.fetch_add(1, Ordering::SeqCst);
        self.site.update(|s| {
            s.url = "about:blank".to_string();
            s.logged_in = false;
        });

        let (tx, rx) = watch::channel(false);
        let tx = Arc::new(tx);
        *lock(&shared.current) = Some(tx.clone());
        Ok(Arc::new(FakePage {
            site: self.site.clone(),
            closed_tx: tx,
            closed: rx,
        }))
    }
}

pub struct FakePage {
    site: FakeSite,
    closed_tx: Arc<watch::Sender<bool>>,
    closed: watch::Receiver<bool>,
}

impl FakePage {
    fn enter(&self) -> Result<()> {
        if *self.closed.borrow() {
            return Err(BrowserError::Disconnected);
        }
        Ok(())
    }

    fn require(&self, selector: &str) -> Result<()> {
        if self.site.state().present.contains(selector) {
            Ok(())
        } else {
            Err(BrowserError::ElementNotFound(selector.to_string()))
        }
    }
}

#[async_trait]
impl Page for FakePage {
    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<()> {
        self.enter()?;
        let hang = self.site.state().hang;
        if hang {
            let mut closed = self.closed.clone();
            let _ = closed.wait_for(|c| *c).await.map(|_| ());
            return Err(BrowserError::Disconnected);
        }
        let mut s = self.site.state();
        s.navigations.push(url.to_string());
        let landed = match &s.login_url {
            Some(login) if !s.logged_in && url != login.as_str() => login.clone(),
            _ => url.to_string(),
        };
        s.url = landed;
        Ok(())
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<()> {
        self.enter()?;
        let poll = async {
            loop {
                if *self.closed.borrow() {
                    return Err(BrowserError::Disconnected);
                }
                if self.site.state().present.contains(selector) {
                    return Ok::<(), BrowserError>(());
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| BrowserError::timeout(format!("selector {selector}"), timeout))?
    }

    async fn fill(&self, selector: &str, text: &str) -> Result<()> {
        self.enter()?;
        self.require(selector)?;
        self.site
            .state()
            .fills
            .push((selector.to_string(), text.to_string()));
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.enter()?;
        self.require(selector)?;
        let handler = lock(&self.site.shared.handlers).get(selector).cloned();
        let response = {
            let mut s = self.site.state();
            s.clicks.push(selector.to_string());
            handler.and_then(|h| h(&mut *s))
        };
        if let Some(response) = response {
            let _ = self.site.shared.responses.send(response);
        }
        Ok(())
    }

    async fn wait_for_response(
        &self,
        matcher: &ResponseMatcher,
        timeout: Duration,
    ) -> Result<ResponseInfo> {
        let mut responses = self.site.shared.responses.subscribe();
        self.enter()?;
        let wait = async {
            loop {
                match responses.recv().await {
                    Ok(response) if matcher.matches(&response) => {
                        return Ok::<ResponseInfo, BrowserError>(response);
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(BrowserError::Disconnected);
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            BrowserError::timeout(format!("response containing {:?}", matcher.url_contains), timeout)
        })?
    }

    async fn text_content(&self, selector: &str) -> Result<Option<String>> {
        self.enter()?;
        Ok(self.site.state().texts.get(selector).cloned())
    }

    async fn row_texts(
        &self,
        row_selector: &str,
        cell_selectors: &[&str],
    ) -> Result<Vec<Vec<Option<String>>>> {
        self.enter()?;
        let rows = self
            .site
            .state()
            .rows
            .get(row_selector)
            .cloned()
            .unwrap_or_default();
        Ok(rows
            .into_iter()
            .map(|mut row| {
                row.resize(cell_selectors.len(), None);
                row
            })
            .collect())
    }

    async fn current_url(&self) -> Result<String> {
        self.enter()?;
        let mut state = self.site.state();
        if state.busy_reads > 0 {
            state.busy_reads -= 1;
            return Err(BrowserError::Protocol(
                "Execution context was destroyed.".to_string(),
            ));
        }
        Ok(state.url.clone())
    }

    fn disconnected(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }

    async fn close(&self) -> Result<()> {
        self.site.shared.closes.fetch_add(1, Ordering::SeqCst);
        self.closed_tx.send_replace(true);
        Ok(())
    }
}
