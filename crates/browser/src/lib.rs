//! Browser automation seam for driving the portal.
//!
//! [`Page`] is the narrow set of operations the portal protocols need from a
//! headless browser; [`BrowserLauncher`] produces exactly one page per launch.
//! [`ChromeLauncher`] is the production implementation, speaking the Chrome
//! DevTools Protocol to a locally spawned Chromium.

mod cdp;
mod error;
#[cfg(any(test, feature = "fake"))]
pub mod fake;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

pub use cdp::{CdpPage, ChromeLauncher};
pub use error::BrowserError;

pub type Result<T, E = BrowserError> = std::result::Result<T, E>;

/// How often the polling helpers re-check the page.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Selects which network responses a [`Page::wait_for_response`] call accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMatcher {
    pub url_contains: String,
    /// Only accept 2xx responses.
    pub success_only: bool,
}

impl ResponseMatcher {
    pub fn url_contains(marker: impl Into<String>) -> Self {
        Self {
            url_contains: marker.into(),
            success_only: false,
        }
    }

    pub fn successful(mut self) -> Self {
        self.success_only = true;
        self
    }

    pub fn matches(&self, response: &ResponseInfo) -> bool {
        response.url.contains(self.url_contains.as_str())
            && (!self.success_only || (200..300).contains(&response.status))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseInfo {
    pub url: String,
    pub status: u16,
}

/// One live browser tab.
///
/// All methods act on the same tab; implementations never open new ones.
#[async_trait]
pub trait Page: Send + Sync {
    /// Load `url` and wait until the document is interactive.
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<()>;

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<()>;

    /// Replace the value of an input and fire its `input`/`change` events.
    async fn fill(&self, selector: &str, text: &str) -> Result<()>;

    async fn click(&self, selector: &str) -> Result<()>;

    /// Resolve with the first response accepted by `matcher`.
    ///
    /// The listener is registered on first poll, so join this future ahead of
    /// the action that triggers the request (`tokio::try_join!(wait, click)`);
    /// awaiting the action first can miss a fast response.
    async fn wait_for_response(
        &self,
        matcher: &ResponseMatcher,
        timeout: Duration,
    ) -> Result<ResponseInfo>;

    /// Text of the first element matching `selector`, `None` when absent.
    async fn text_content(&self, selector: &str) -> Result<Option<String>>;

    /// For every element matching `row_selector`, the text of the first
    /// descendant matching each of `cell_selectors`, in document order.
    async fn row_texts(
        &self,
        row_selector: &str,
        cell_selectors: &[&str],
    ) -> Result<Vec<Vec<Option<String>>>>;

    async fn current_url(&self) -> Result<String>;

    /// Flips to `true` once the underlying browser connection is gone.
    fn disconnected(&self) -> watch::Receiver<bool>;

    async fn close(&self) -> Result<()>;

    async fn wait_for_timeout(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }

    /// Poll the current URL until `predicate` accepts it.
    async fn wait_for_url(
        &self,
        predicate: &(dyn for<'s> Fn(&'s str) -> bool + Send + Sync),
        timeout: Duration,
    ) -> Result<String> {
        poll_until("URL change", timeout, || async move {
            let url = self.current_url().await?;
            Ok(predicate(&url).then_some(url))
        })
        .await
    }
}

/// Re-run `check` every [`POLL_INTERVAL`] until it yields a value or
/// `timeout` passes.  Transient page errors count as "not yet"; anything
/// else, a dropped connection included, ends the wait.
pub(crate) async fn poll_until<T, F, Fut>(what: &str, timeout: Duration, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<Option<T>>> + Send,
    T: Send,
{
    let poll = async {
        loop {
            match check().await {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {}
                Err(err) if err.is_transient() => {
                    debug!(what, "page busy, polling again: {err}");
                }
                Err(err) => return Err(err),
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| BrowserError::timeout(what, timeout))?
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn Page>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(url: &str, status: u16) -> ResponseInfo {
        ResponseInfo {
            url: url.to_string(),
            status,
        }
    }

    #[test]
    fn matcher_checks_url_marker() {
        let m = ResponseMatcher::url_contains("lowerSalesSum");
        assert!(m.matches(&response("https://x/api/lowerSalesSum?x=1", 500)));
        assert!(!m.matches(&response("https://x/api/other", 200)));
    }

    #[tokio::test(start_paused = true)]
    async fn polling_rides_out_transient_errors() {
        let mut calls = 0;
        let value = poll_until("ready", Duration::from_secs(2), || {
            calls += 1;
            let attempt = calls;
            async move {
                match attempt {
                    1 => Err(BrowserError::Protocol("Execution context was destroyed.".into())),
                    2 => Ok(None),
                    _ => Ok(Some(attempt)),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_stops_on_disconnect() {
        let started = tokio::time::Instant::now();
        let err = poll_until("ready", Duration::from_secs(2), || async {
            Err::<Option<()>, _>(BrowserError::Disconnected)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, BrowserError::Disconnected));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn polling_times_out_while_page_stays_busy() {
        let err = poll_until("ready", Duration::from_secs(1), || async {
            Err::<Option<()>, _>(BrowserError::Script("document is null".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, BrowserError::Timeout { .. }));
    }

    #[test]
    fn successful_matcher_rejects_error_status() {
        let m = ResponseMatcher::url_contains("lowerSalesSum").successful();
        assert!(m.matches(&response("https://x/lowerSalesSum", 200)));
        assert!(m.matches(&response("https://x/lowerSalesSum", 204)));
        assert!(!m.matches(&response("https://x/lowerSalesSum", 302)));
        assert!(!m.matches(&response("https://x/lowerSalesSum", 500)));
    }
}
