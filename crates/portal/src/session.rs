//! The one authenticated browser tab, and exclusive access to it.
//!
//! ```text
//!  Uninitialized ──launch──▶ Initializing ──probe ok──▶ Active
//!        ▲                        │                      │  ▲
//!        │ disconnect / poison    └──probe fails──▶ Expired ─login ok─┘
//!        │                                               │
//!        └──────────────────────────────── login exhausted ──▶ Disconnected
//! ```
//!
//! Every caller goes through [`SessionController::lease`], which serialises
//! access with a single async mutex and brings the session to `Active` before
//! handing out the page.  The published [`SessionState`] is readable without
//! the lock, so health checks never queue behind a running query.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, watch};
use tracing::{debug, error, info, warn};

use pvtrack_browser::{BrowserError, BrowserLauncher, Page};
use pvtrack_config::{AppConfig, Credentials, PortalConfig, RetryConfig, TimeoutConfig};

use crate::selectors;

/// Time allowed for closing a page that may be wedged.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Active,
    Expired,
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("could not start the browser: {0}")]
    Launch(#[source] BrowserError),

    #[error("portal login failed after {attempts} attempt(s): {last}")]
    Authentication { attempts: u32, last: String },

    #[error("session still busy after {0:?}")]
    Busy(Duration),
}

struct Slot {
    page: Option<Arc<dyn Page>>,
    generation: u64,
}

pub struct SessionController {
    launcher: Arc<dyn BrowserLauncher>,
    credentials: Credentials,
    portal: PortalConfig,
    retry: RetryConfig,
    timeouts: TimeoutConfig,
    slot: Arc<Mutex<Slot>>,
    /// Generation of the live page; disconnect watchers of older pages are ignored.
    generation: Arc<AtomicU64>,
    state: Arc<watch::Sender<SessionState>>,
}

impl SessionController {
    pub fn new(
        launcher: Arc<dyn BrowserLauncher>,
        credentials: Credentials,
        config: &AppConfig,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Uninitialized);
        Self {
            launcher,
            credentials,
            portal: config.portal.clone(),
            retry: config.retry.clone(),
            timeouts: config.timeouts.clone(),
            slot: Arc::new(Mutex::new(Slot {
                page: None,
                generation: 0,
            })),
            generation: Arc::new(AtomicU64::new(0)),
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn portal(&self) -> &PortalConfig {
        &self.portal
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    /// Exclusive, authenticated access to the page.
    ///
    /// Waits at most the configured lock-wait time for a running operation
    /// to finish, launches the browser if there is none, and logs in again
    /// when the probe finds the session expired.
    pub async fn lease(&self) -> Result<SessionLease, SessionError> {
        let wait = self.timeouts.lock_wait();
        let mut slot = tokio::time::timeout(wait, self.slot.clone().lock_owned())
            .await
            .map_err(|_| SessionError::Busy(wait))?;
        let page = self.ensure_active(&mut slot).await?;
        Ok(SessionLease {
            slot,
            page,
            state: self.state.clone(),
        })
    }

    /// Launch and log in ahead of the first query.
    pub async fn start(&self) -> Result<(), SessionError> {
        self.lease().await.map(drop)
    }

    /// Close the browser.  A later [`lease`](Self::lease) starts a new one.
    pub async fn shutdown(&self) {
        let wait = self.timeouts.lock_wait();
        let Ok(mut slot) = tokio::time::timeout(wait, self.slot.lock()).await else {
            warn!("session still busy at shutdown; leaving browser to exit with the process");
            return;
        };
        if let Some(page) = slot.page.take() {
            info!("closing browser session");
            close_quietly(page.as_ref()).await;
        }
        self.publish(SessionState::Uninitialized);
    }

    async fn ensure_active(&self, slot: &mut Slot) -> Result<Arc<dyn Page>, SessionError> {
        let page = match slot.page.clone() {
            Some(page) if !*page.disconnected().borrow() => page,
            stale => {
                if stale.is_some() {
                    warn!("browser connection lost; relaunching");
                }
                self.launch(slot).await?
            }
        };

        if self.probe(page.as_ref()).await {
            self.publish(SessionState::Active);
            return Ok(page);
        }

        self.publish(SessionState::Expired);
        match self.login(page.as_ref()).await {
            Ok(()) => {
                self.publish(SessionState::Active);
                Ok(page)
            }
            Err(err) => {
                self.publish(SessionState::Disconnected);
                Err(err)
            }
        }
    }

    async fn launch(&self, slot: &mut Slot) -> Result<Arc<dyn Page>, SessionError> {
        self.publish(SessionState::Initializing);
        slot.page = None;
        let page = match self.launcher.launch().await {
            Ok(page) => page,
            Err(err) => {
                error!(%err, "browser launch failed");
                self.publish(SessionState::Uninitialized);
                return Err(SessionError::Launch(err));
            }
        };

        slot.generation += 1;
        self.generation.store(slot.generation, Ordering::SeqCst);
        self.watch_disconnect(page.as_ref(), slot.generation);
        slot.page = Some(page.clone());
        info!(generation = slot.generation, "browser page created");
        Ok(page)
    }

    fn watch_disconnect(&self, page: &dyn Page, generation: u64) {
        let mut closed = page.disconnected();
        let current = self.generation.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            if closed.wait_for(|c| *c).await.is_err() {
                return;
            }
            if current.load(Ordering::SeqCst) == generation {
                error!(generation, "browser connection closed");
                state.send_replace(SessionState::Uninitialized);
            } else {
                debug!(generation, "retired browser page closed");
            }
        });
    }

    /// `true` when the page can reach protected content without logging in.
    async fn probe(&self, page: &dyn Page) -> bool {
        match page.current_url().await {
            Ok(url) if self.portal.is_authenticated_url(&url) => {
                debug!(%url, "already on an authenticated page");
                return true;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(%err, "session probe could not read the page location");
                return false;
            }
        }

        if let Err(err) = page
            .navigate(&self.portal.sales_url(), self.timeouts.probe())
            .await
        {
            warn!(%err, "session probe navigation failed");
            return false;
        }

        match page.current_url().await {
            Ok(url) if self.portal.is_login_url(&url) => {
                warn!("session expired; protected page redirected to login");
                false
            }
            Ok(_) => {
                debug!("session still valid");
                true
            }
            Err(err) => {
                warn!(%err, "session probe could not read the page location");
                false
            }
        }
    }

    /// Bounded retry: `login_attempts` tries, `delay_ms` apart.
    async fn login(&self, page: &dyn Page) -> Result<(), SessionError> {
        let attempts = self.retry.login_attempts.max(1);
        let mut last = String::new();

        for attempt in 1..=attempts {
            info!(attempt, attempts, "logging in to portal");
            match self.attempt_login(page).await {
                Ok(url) => {
                    info!(%url, "portal login succeeded");
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, %err, "portal login attempt failed");
                    last = err.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.retry.delay()).await;
                    }
                }
            }
        }

        error!(attempts, "portal login retries exhausted");
        Err(SessionError::Authentication { attempts, last })
    }

    async fn attempt_login(&self, page: &dyn Page) -> Result<String, BrowserError> {
        page.navigate(&self.portal.login_url(), self.timeouts.page_ready())
            .await?;
        page.wait_for_selector(selectors::LOGIN_ID, self.timeouts.login_field())
            .await?;
        page.fill(selectors::LOGIN_ID, self.credentials.id()).await?;
        page.fill(selectors::LOGIN_PASSWORD, self.credentials.password())
            .await?;

        let marker = self.portal.login_success_marker.as_str();
        let landed = |url: &str| url.contains(marker);
        let (url, ()) = tokio::try_join!(
            page.wait_for_url(&landed, self.timeouts.login_redirect()),
            page.click(selectors::LOGIN_BUTTON),
        )?;
        Ok(url)
    }

    fn publish(&self, next: SessionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(?prev, ?next, "session state changed");
        }
    }
}

/// Exclusive use of the active page; dropping it lets the next caller in.
pub struct SessionLease {
    slot: OwnedMutexGuard<Slot>,
    page: Arc<dyn Page>,
    state: Arc<watch::Sender<SessionState>>,
}

impl SessionLease {
    pub fn page(&self) -> &dyn Page {
        self.page.as_ref()
    }

    /// Tear the session down so the next lease starts from a fresh browser.
    /// Used when an operation overran its deadline and the page state is unknown.
    pub async fn poison(mut self) {
        warn!("resetting browser session");
        if let Some(page) = self.slot.page.take() {
            close_quietly(page.as_ref()).await;
        }
        self.state.send_replace(SessionState::Uninitialized);
    }
}

async fn close_quietly(page: &dyn Page) {
    match tokio::time::timeout(CLOSE_TIMEOUT, page.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(%err, "closing browser page failed"),
        Err(_) => warn!("closing browser page timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedPortal;

    #[tokio::test]
    async fn first_lease_launches_and_logs_in() {
        let portal = ScriptedPortal::new();
        let session = portal.controller();
        assert_eq!(session.state(), SessionState::Uninitialized);

        let lease = session.lease().await.unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert!(lease.page().current_url().await.unwrap().contains("/main"));
        drop(lease);

        assert_eq!(portal.site.launches(), 1);
        assert_eq!(portal.login_attempts(), 1);
        portal.site.inspect(|s| {
            assert_eq!(s.value_of(selectors::LOGIN_ID), Some("member-1"));
            assert_eq!(s.value_of(selectors::LOGIN_PASSWORD), Some("secret"));
        });
    }

    #[tokio::test]
    async fn live_session_is_reused_without_login() {
        let portal = ScriptedPortal::new();
        let session = portal.controller();
        drop(session.lease().await.unwrap());
        drop(session.lease().await.unwrap());
        assert_eq!(portal.site.launches(), 1);
        assert_eq!(portal.login_attempts(), 1);
    }

    #[tokio::test]
    async fn expired_session_logs_in_exactly_once() {
        let portal = ScriptedPortal::new();
        let session = portal.controller();
        drop(session.lease().await.unwrap());

        portal.expire_session();
        drop(session.lease().await.unwrap());

        assert_eq!(portal.login_attempts(), 2);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn login_retry_budget_is_honoured() {
        let portal = ScriptedPortal::new();
        portal.reject_logins(usize::MAX);
        let session = portal.controller();

        let started = tokio::time::Instant::now();
        let err = session.lease().await.err().unwrap();
        let elapsed = started.elapsed();

        assert!(matches!(err, SessionError::Authentication { attempts: 3, .. }));
        assert_eq!(portal.login_attempts(), 3);
        assert!(elapsed >= Duration::from_millis(2 * 5000), "{elapsed:?}");
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_login_is_retried_on_next_lease() {
        let portal = ScriptedPortal::new();
        portal.reject_logins(3);
        let session = portal.controller();

        assert!(session.lease().await.is_err());
        assert!(session.lease().await.is_ok());
        assert_eq!(portal.login_attempts(), 4);
        assert_eq!(portal.site.launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn login_recovers_within_budget() {
        let portal = ScriptedPortal::new();
        portal.reject_logins(2);
        let session = portal.controller();
        assert!(session.lease().await.is_ok());
        assert_eq!(portal.login_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn login_waits_out_the_landing_page_swap() {
        let portal = ScriptedPortal::new();
        portal.slow_login_redirect(3);
        let session = portal.controller();

        drop(session.lease().await.unwrap());

        assert_eq!(portal.login_attempts(), 1);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn disconnect_forces_relaunch() {
        let portal = ScriptedPortal::new();
        let session = portal.controller();
        let mut states = session.subscribe();
        drop(session.lease().await.unwrap());

        portal.site.crash();
        states
            .wait_for(|s| *s == SessionState::Uninitialized)
            .await
            .unwrap();

        drop(session.lease().await.unwrap());
        assert_eq!(portal.site.launches(), 2);
        assert_eq!(portal.login_attempts(), 2);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn poison_closes_page_and_resets() {
        let portal = ScriptedPortal::new();
        let session = portal.controller();
        session.lease().await.unwrap().poison().await;

        assert_eq!(session.state(), SessionState::Uninitialized);
        assert_eq!(portal.site.closes(), 1);

        drop(session.lease().await.unwrap());
        assert_eq!(portal.site.launches(), 2);
    }

    #[tokio::test]
    async fn launch_failure_is_reported() {
        let portal = ScriptedPortal::new();
        portal.site.fail_next_launches(1);
        let session = portal.controller();
        assert!(matches!(
            session.lease().await.err().unwrap(),
            SessionError::Launch(_)
        ));
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert!(session.lease().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn lease_is_single_flight() {
        let portal = ScriptedPortal::new();
        let session = Arc::new(portal.controller());
        let held = session.lease().await.unwrap();

        let contender = {
            let session = session.clone();
            tokio::spawn(async move { session.lease().await.map(drop) })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!contender.is_finished());

        drop(held);
        contender.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn lease_gives_up_after_lock_wait() {
        let portal = ScriptedPortal::new();
        let session = portal.controller();
        let _held = session.lease().await.unwrap();
        assert!(matches!(
            session.lease().await.err().unwrap(),
            SessionError::Busy(_)
        ));
    }

    #[tokio::test]
    async fn shutdown_closes_browser() {
        let portal = ScriptedPortal::new();
        let session = portal.controller();
        session.start().await.unwrap();
        session.shutdown().await;
        assert_eq!(portal.site.closes(), 1);
        assert_eq!(session.state(), SessionState::Uninitialized);
    }
}
