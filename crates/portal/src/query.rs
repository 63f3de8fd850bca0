//! The two scrape protocols: PV totals for a date range, and the latest
//! achievement date from the allowance table.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::time::error::Elapsed;
use tracing::{debug, error, info, warn};

use pvtrack_browser::{BrowserError, Page, ResponseMatcher};

use crate::dates::{DateRange, QueryKind};
use crate::selectors;
use crate::session::{SessionController, SessionError, SessionLease};

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Page load, element or search response took too long.
    #[error("portal did not respond in time, the site or network may be unstable: {0}")]
    SiteUnstable(#[source] BrowserError),

    /// The page did not look the way the protocol expects.
    #[error("portal page changed or rejected the input: {0}")]
    Layout(#[source] BrowserError),

    #[error("query exceeded its {0:?} deadline; session was reset")]
    DeadlineExceeded(Duration),
}

impl From<BrowserError> for QueryError {
    fn from(err: BrowserError) -> Self {
        if err.is_timeout() {
            Self::SiteUnstable(err)
        } else {
            Self::Layout(err)
        }
    }
}

impl QueryError {
    pub fn is_site_unstable(&self) -> bool {
        matches!(self, Self::SiteUnstable(_) | Self::DeadlineExceeded(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PvResult {
    pub left_pv: u64,
    pub right_pv: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AchievementRecord {
    pub date: String,
    pub status: String,
}

impl AchievementRecord {
    /// The date cell as a calendar date; the portal writes `YYYY-MM-DD`
    /// but older pages used `/` or `.` separators.
    pub fn day(&self) -> Option<NaiveDate> {
        ["%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d"]
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(&self.date, fmt).ok())
    }
}

pub struct QueryEngine {
    session: Arc<SessionController>,
}

impl QueryEngine {
    pub fn new(session: Arc<SessionController>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<SessionController> {
        &self.session
    }

    pub async fn query_pv(&self, range: DateRange, kind: QueryKind) -> Result<PvResult, QueryError> {
        info!(%range, ?kind, "querying PV");
        let lease = self.session.lease().await?;
        let deadline = self.session.timeouts().query_deadline();
        let outcome =
            tokio::time::timeout(deadline, self.pv_protocol(lease.page(), range, kind)).await;
        let pv = finish("PV query", lease, deadline, outcome).await?;
        info!(left = pv.left_pv, right = pv.right_pv, "PV query finished");
        Ok(pv)
    }

    /// `None` when no row on the page has reached the bonus rank.
    pub async fn query_achievement(&self) -> Result<Option<AchievementRecord>, QueryError> {
        info!("querying latest achievement date");
        let lease = self.session.lease().await?;
        let deadline = self.session.timeouts().query_deadline();
        let outcome =
            tokio::time::timeout(deadline, self.achievement_protocol(lease.page())).await;
        let record = finish("achievement query", lease, deadline, outcome).await?;
        match &record {
            Some(r) => info!(date = %r.date, status = %r.status, "latest achievement found"),
            None => warn!("no achievement record on the allowance page"),
        }
        Ok(record)
    }

    async fn pv_protocol(
        &self,
        page: &dyn Page,
        range: DateRange,
        kind: QueryKind,
    ) -> Result<PvResult, BrowserError> {
        let portal = self.session.portal();
        let timeouts = self.session.timeouts();

        if !page.current_url().await?.contains(portal.sales_path.as_str()) {
            page.navigate(&portal.sales_url(), timeouts.page_ready())
                .await?;
        }
        page.wait_for_selector(selectors::DATE_FROM, timeouts.page_ready())
            .await?;

        match kind {
            QueryKind::FirstHalfOfMonth => {
                page.click(selectors::FIRST_HALF_BUTTON).await?;
                page.wait_for_timeout(timeouts.preset_settle()).await;
            }
            QueryKind::SecondHalfOfMonth => {
                page.click(selectors::SECOND_HALF_BUTTON).await?;
                page.wait_for_timeout(timeouts.preset_settle()).await;
            }
            QueryKind::ExactRange => {
                let (from, to) = range.digits();
                debug!(%from, %to, "filling date inputs");
                page.fill(selectors::DATE_FROM, &from).await?;
                page.fill(selectors::DATE_TO, &to).await?;
            }
        }

        // The listener must be armed before the click fires the request.
        let matcher = ResponseMatcher::url_contains(portal.sales_response_marker.as_str()).successful();
        let (response, ()) = tokio::try_join!(
            page.wait_for_response(&matcher, timeouts.search_response()),
            page.click(selectors::SEARCH_BUTTON),
        )?;
        debug!(url = %response.url, status = response.status, "search response received");

        page.wait_for_timeout(timeouts.render_settle()).await;
        let left = page.text_content(selectors::LEFT_PV).await?;
        let right = page.text_content(selectors::RIGHT_PV).await?;
        Ok(PvResult {
            left_pv: parse_pv(left.as_deref()),
            right_pv: parse_pv(right.as_deref()),
        })
    }

    async fn achievement_protocol(
        &self,
        page: &dyn Page,
    ) -> Result<Option<AchievementRecord>, BrowserError> {
        let portal = self.session.portal();
        let timeouts = self.session.timeouts();

        page.navigate(&portal.allowance_url(), timeouts.page_ready())
            .await?;
        page.wait_for_selector(selectors::ACHIEVEMENT_TABLE, timeouts.table())
            .await?;

        let rows = page
            .row_texts(
                selectors::ACHIEVEMENT_ROWS,
                &[selectors::DATE_CELL, selectors::STATUS_CELL],
            )
            .await?;
        info!(rows = rows.len(), "scanning achievement table");

        let pairs: Vec<(Option<String>, Option<String>)> = rows
            .into_iter()
            .map(|cells| {
                let mut cells = cells.into_iter();
                (cells.next().flatten(), cells.next().flatten())
            })
            .collect();
        Ok(first_qualifying(&pairs))
    }
}

/// Apply the deadline outcome; an overrun poisons the session.
async fn finish<T>(
    what: &str,
    lease: SessionLease,
    deadline: Duration,
    outcome: Result<Result<T, BrowserError>, Elapsed>,
) -> Result<T, QueryError> {
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            error!(%err, "{what} failed");
            Err(err.into())
        }
        Err(_) => {
            error!(?deadline, "{what} overran its deadline");
            lease.poison().await;
            Err(QueryError::DeadlineExceeded(deadline))
        }
    }
}

/// The first row, top to bottom, whose status is not the not-achieved
/// marker.  Table order is taken as given; dates are never compared.
pub fn first_qualifying(rows: &[(Option<String>, Option<String>)]) -> Option<AchievementRecord> {
    for (index, (date, status)) in rows.iter().enumerate() {
        let status = status.as_deref().map(str::trim).unwrap_or_default();
        if status.is_empty() || status == selectors::NOT_ACHIEVED {
            continue;
        }
        match date.as_deref().map(str::trim) {
            Some(date) if !date.is_empty() => {
                return Some(AchievementRecord {
                    date: date.to_string(),
                    status: status.to_string(),
                });
            }
            _ => warn!(index, status, "qualifying row has no date cell; skipping"),
        }
    }
    None
}

/// Integer value of a PV cell.
///
/// Thousands separators are dropped and the leading digit run is read, so
/// `"90,100"` is 90100 and `"12.5"` is 12.  Missing, empty, signed or
/// non-numeric text is 0.
pub fn parse_pv(text: Option<&str>) -> u64 {
    let Some(raw) = text else {
        warn!("PV cell missing; using 0");
        return 0;
    };
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    let end = cleaned
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(cleaned.len());
    match cleaned[..end].parse() {
        Ok(value) => value,
        Err(_) => {
            if !raw.trim().is_empty() {
                warn!(text = raw, "unparsable PV cell; using 0");
            }
            0
        }
    }
}
