//! One check-and-report cycle, and the direct queries that share its session.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use pvtrack_portal::{
    AchievementRecord, FollowUp, QueryEngine, QueryError, QueryKind, SessionState, follow_up,
};
use pvtrack_state::StateStore;

use crate::notify::{NotificationSink, PvReport, ReportOrigin};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// No row on the allowance page has reached the rank.
    NoRecord,
    /// Achieved today; the follow-up range starts tomorrow.
    NotYetDue { achieved: NaiveDate },
    Reported { report: PvReport },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastRun {
    pub finished_at: DateTime<Utc>,
    /// `Err` holds the failure message of a run that did not complete.
    pub outcome: Result<RunOutcome, String>,
}

pub struct Tracker {
    engine: Arc<QueryEngine>,
    state: Arc<StateStore>,
    sink: Arc<dyn NotificationSink>,
    tz: Tz,
    last_run: Mutex<Option<LastRun>>,
}

impl Tracker {
    pub fn new(
        engine: Arc<QueryEngine>,
        state: Arc<StateStore>,
        sink: Arc<dyn NotificationSink>,
        tz: Tz,
    ) -> Self {
        Self {
            engine,
            state,
            sink,
            tz,
            last_run: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<QueryEngine> {
        &self.engine
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn sink(&self) -> &Arc<dyn NotificationSink> {
        &self.sink
    }

    /// The current calendar day at the portal.
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.tz).date_naive()
    }

    pub fn session_state(&self) -> SessionState {
        self.engine.session().state()
    }

    pub fn last_run(&self) -> Option<LastRun> {
        self.last_run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Check the latest achievement and, when PV has had time to accumulate
    /// since, report it.
    pub async fn run_once(&self, today: NaiveDate) -> Result<RunOutcome> {
        let Some(record) = self.latest_achievement().await? else {
            info!("no achievement record; nothing to report");
            return Ok(RunOutcome::NoRecord);
        };
        let Some(achieved) = record.day() else {
            bail!("achievement date {:?} is not a calendar date", record.date);
        };

        let range = match follow_up(achieved, today) {
            FollowUp::Due(range) => range,
            FollowUp::NotYet { start } => {
                info!(%achieved, %start, "achieved today; no PV to report yet");
                return Ok(RunOutcome::NotYetDue { achieved });
            }
        };

        let pv = self.engine.query_pv(range, QueryKind::ExactRange).await?;
        let report = PvReport {
            range,
            left_pv: pv.left_pv,
            right_pv: pv.right_pv,
            achievement_date: Some(achieved),
            origin: ReportOrigin::Scheduled,
        };
        self.sink.deliver(&report).await?;
        info!(%range, "scheduled report delivered");
        Ok(RunOutcome::Reported { report })
    }

    /// [`run_once`](Self::run_once) for today, with failures logged rather
    /// than returned.  The result is kept for status queries.
    pub async fn run_logged(&self) -> LastRun {
        let today = self.today();
        info!(%today, "check-and-report run starting");
        let outcome = self.run_once(today).await.map_err(|err| {
            error!("check-and-report run failed: {err:#}");
            format!("{err:#}")
        });
        let run = LastRun {
            finished_at: Utc::now(),
            outcome,
        };
        *self.last_run.lock().unwrap_or_else(PoisonError::into_inner) = Some(run.clone());
        run
    }

    /// Query the allowance table and remember what it says.
    pub async fn latest_achievement(&self) -> Result<Option<AchievementRecord>, QueryError> {
        let record = self.engine.query_achievement().await?;
        if let Some(record) = record.as_ref() {
            let date = match record.day() {
                Some(day) => day.format("%Y-%m-%d").to_string(),
                None => {
                    warn!(
                        date = %record.date,
                        "achievement date is not a calendar date; storing it as scraped"
                    );
                    record.date.trim().to_string()
                }
            };
            if self.state.record_achievement(&date) {
                info!(%date, "stored new achievement date");
            }
        }
        Ok(record)
    }

    pub(crate) fn stored_achievement(&self) -> Option<NaiveDate> {
        self.state
            .get()
            .last_achievement_date
            .and_then(|date| NaiveDate::parse_from_str(&date, "%Y-%m-%d").ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::recording::RecordingSink;
    use pvtrack_portal::selectors;
    use pvtrack_portal::testing::ScriptedPortal;

    struct Fixture {
        portal: ScriptedPortal,
        sink: Arc<RecordingSink>,
        tracker: Tracker,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let portal = ScriptedPortal::new();
        let sink = Arc::new(RecordingSink::default());
        let tracker = Tracker::new(
            Arc::new(portal.engine()),
            Arc::new(StateStore::new(dir.path().join("state.json"))),
            sink.clone(),
            chrono_tz::Asia::Taipei,
        );
        Fixture {
            portal,
            sink,
            tracker,
            _dir: dir,
        }
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[tokio::test]
    async fn no_record_changes_nothing() {
        let f = fixture();
        f.portal.set_achievements(&[("2024-06-01", "未達")]);

        let outcome = f.tracker.run_once(d(2024, 6, 10)).await.unwrap();

        assert_eq!(outcome, RunOutcome::NoRecord);
        assert_eq!(f.tracker.state().get().last_achievement_date, None);
        assert!(f.sink.reports.lock().unwrap().is_empty());
        assert_eq!(f.portal.site.inspect(|s| s.clicks_on(selectors::SEARCH_BUTTON)), 0);
    }

    #[tokio::test]
    async fn achievement_today_skips_pv_query() {
        let f = fixture();
        let today = d(2024, 6, 10);
        f.portal.set_achievements(&[("2024-06-10", "鑽石")]);

        let outcome = f.tracker.run_once(today).await.unwrap();

        assert_eq!(outcome, RunOutcome::NotYetDue { achieved: today });
        assert_eq!(
            f.tracker.state().get().last_achievement_date.as_deref(),
            Some("2024-06-10")
        );
        assert!(f.sink.reports.lock().unwrap().is_empty());
        assert_eq!(f.portal.site.inspect(|s| s.clicks_on(selectors::SEARCH_BUTTON)), 0);
    }

    #[tokio::test]
    async fn older_achievement_is_reported() {
        let f = fixture();
        f.portal.set_achievements(&[("2024-06-01", "未達"), ("2024-05-28", "鑽石")]);
        f.portal.set_pv("12,300", "4,560");

        let outcome = f.tracker.run_once(d(2024, 6, 10)).await.unwrap();

        let reports = f.sink.reports.lock().unwrap().clone();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(outcome, RunOutcome::Reported { report: report.clone() });
        assert_eq!(report.range.start(), d(2024, 5, 29));
        assert_eq!(report.range.end(), d(2024, 6, 10));
        assert_eq!((report.left_pv, report.right_pv), (12300, 4560));
        assert_eq!(report.achievement_date, Some(d(2024, 5, 28)));
        assert_eq!(report.origin, ReportOrigin::Scheduled);
        assert_eq!(
            f.tracker.state().get().last_achievement_date.as_deref(),
            Some("2024-05-28")
        );
        f.portal.site.inspect(|s| {
            assert_eq!(s.value_of(selectors::DATE_FROM), Some("20240529"));
            assert_eq!(s.value_of(selectors::DATE_TO), Some("20240610"));
        });
    }

    #[tokio::test]
    async fn follow_up_range_crosses_new_year() {
        let f = fixture();
        f.portal.set_achievements(&[("2024-12-30", "鑽石")]);
        f.tracker.run_once(d(2025, 1, 2)).await.unwrap();
        f.portal.site.inspect(|s| {
            assert_eq!(s.value_of(selectors::DATE_FROM), Some("20241231"));
            assert_eq!(s.value_of(selectors::DATE_TO), Some("20250102"));
        });
    }

    #[tokio::test]
    async fn unparsable_date_is_stored_as_scraped() {
        let f = fixture();
        f.portal.set_achievements(&[("31 May 2024", "鑽石")]);

        let err = f.tracker.run_once(d(2024, 6, 10)).await.unwrap_err();

        assert!(err.to_string().contains("31 May 2024"));
        assert_eq!(
            f.tracker.state().get().last_achievement_date.as_deref(),
            Some("31 May 2024")
        );
        assert_eq!(f.tracker.stored_achievement(), None);
        assert!(f.sink.reports.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_run_is_logged_and_kept() {
        let f = fixture();
        f.portal.site.update(|s| s.hide(selectors::ACHIEVEMENT_TABLE));

        let failed = f.tracker.run_logged().await;
        assert!(failed.outcome.is_err());
        assert_eq!(f.tracker.last_run(), Some(failed));

        f.portal.site.update(|s| s.show(selectors::ACHIEVEMENT_TABLE));
        f.portal.set_achievements(&[]);
        assert_eq!(f.tracker.run_logged().await.outcome, Ok(RunOutcome::NoRecord));
    }
}
