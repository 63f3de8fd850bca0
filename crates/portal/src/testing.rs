//! A scripted copy of the portal on top of the browser fake.
//!
//! Logins succeed unless rejected, every page control is present, the
//! search button answers with a sales-sum response, and PV cells and the
//! allowance table hold whatever the test sets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use pvtrack_browser::ResponseInfo;
use pvtrack_browser::fake::FakeSite;
use pvtrack_config::{AppConfig, Credentials};

use crate::query::QueryEngine;
use crate::selectors;
use crate::session::SessionController;

const CONTROLS: [&str; 11] = [
    selectors::LOGIN_ID,
    selectors::LOGIN_PASSWORD,
    selectors::LOGIN_BUTTON,
    selectors::DATE_FROM,
    selectors::DATE_TO,
    selectors::SEARCH_BUTTON,
    selectors::FIRST_HALF_BUTTON,
    selectors::SECOND_HALF_BUTTON,
    selectors::LEFT_PV,
    selectors::RIGHT_PV,
    selectors::ACHIEVEMENT_TABLE,
];

pub struct ScriptedPortal {
    pub site: FakeSite,
    pub config: AppConfig,
    rejections: Arc<AtomicUsize>,
    redirect_reads: Arc<AtomicUsize>,
    search_status: Arc<Mutex<Option<u16>>>,
}

impl Default for ScriptedPortal {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedPortal {
    pub fn new() -> Self {
        let config = AppConfig::default();
        let portal = &config.portal;
        let site = FakeSite::new().with_login_redirect(&portal.login_url());
        site.update(|s| {
            for control in CONTROLS {
                s.show(control);
            }
            s.set_text(selectors::LEFT_PV, "0");
            s.set_text(selectors::RIGHT_PV, "0");
        });

        let rejections = Arc::new(AtomicUsize::new(0));
        let home = format!("{}/main", portal.base_url);
        let pending = rejections.clone();
        let redirect_reads = Arc::new(AtomicUsize::new(0));
        let busy = redirect_reads.clone();
        site.on_click(selectors::LOGIN_BUTTON, move |s| {
            let left = pending.load(Ordering::SeqCst);
            if left > 0 {
                pending.store(left - 1, Ordering::SeqCst);
            } else {
                s.logged_in = true;
                s.url = home.clone();
                s.busy_reads = busy.load(Ordering::SeqCst);
            }
            None
        });

        let search_status = Arc::new(Mutex::new(Some(200)));
        let status = search_status.clone();
        let endpoint = format!(
            "{}/myoffice/mySales/{}",
            portal.base_url, portal.sales_response_marker
        );
        site.on_click(selectors::SEARCH_BUTTON, move |_| {
            let status = *status.lock().unwrap_or_else(PoisonError::into_inner);
            status.map(|status| ResponseInfo {
                url: endpoint.clone(),
                status,
            })
        });

        Self {
            site,
            config,
            rejections,
            redirect_reads,
            search_status,
        }
    }

    pub fn credentials() -> Credentials {
        Credentials::new("member-1", "secret")
    }

    pub fn controller(&self) -> SessionController {
        SessionController::new(
            Arc::new(self.site.launcher()),
            Self::credentials(),
            &self.config,
        )
    }

    pub fn engine(&self) -> QueryEngine {
        QueryEngine::new(Arc::new(self.controller()))
    }

    /// Ignore the next `n` login submissions.
    pub fn reject_logins(&self, n: usize) {
        self.rejections.store(n, Ordering::SeqCst);
    }

    /// After a successful login the next `reads` location reads fail while
    /// the landing page replaces the login form.
    pub fn slow_login_redirect(&self, reads: usize) {
        self.redirect_reads.store(reads, Ordering::SeqCst);
    }

    pub fn login_attempts(&self) -> usize {
        self.site.inspect(|s| s.clicks_on(selectors::LOGIN_BUTTON))
    }

    /// Invalidate the cookie session and bounce the tab to the login page.
    pub fn expire_session(&self) {
        let login = self.config.portal.login_url();
        self.site.update(|s| {
            s.logged_in = false;
            s.url = login;
        });
    }

    /// Status of the search response; `None` sends no response at all.
    pub fn set_search_status(&self, status: Option<u16>) {
        *self
            .search_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = status;
    }

    pub fn set_pv(&self, left: &str, right: &str) {
        self.site.update(|s| {
            s.set_text(selectors::LEFT_PV, left);
            s.set_text(selectors::RIGHT_PV, right);
        });
    }

    /// Allowance table rows, top to bottom, as `(date, status)`.
    pub fn set_achievements(&self, rows: &[(&str, &str)]) {
        let rows = rows
            .iter()
            .map(|(date, status)| vec![Some(date.to_string()), Some(status.to_string())])
            .collect();
        self.site
            .update(|s| s.set_rows(selectors::ACHIEVEMENT_ROWS, rows));
    }
}
