//! Direct PV queries from a command string.

use chrono::NaiveDate;
use tracing::{info, warn};

use pvtrack_portal::{FollowUp, QueryError, QueryKind, ResolvedQuery, follow_up, resolve};

use crate::notify::{PvReport, ReportOrigin};
use crate::tracker::Tracker;

pub const USAGE: &str = "Unrecognised command. Send one of:\n\
- MMDD (for example 0801)\n\
- MMDD MMDD (for example 0801 0815)\n\
- first-half / 上半個月\n\
- second-half / 下半個月\n\
- from_latest_achievement (PV since the stored achievement date)";

/// Command that queries PV from the day after the stored achievement to today.
pub const SINCE_ACHIEVEMENT: &str = "from_latest_achievement";

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unrecognised command {text:?}")]
    InvalidCommand { text: String },

    #[error("no achievement date has been stored yet")]
    NoStoredAchievement,

    #[error("achievement on {achieved} is too recent; no PV to query yet")]
    AchievementTooRecent { achieved: NaiveDate },

    #[error(transparent)]
    Query(#[from] QueryError),
}

impl DispatchError {
    /// Text suitable for replying to the person who sent the command.
    pub fn reply_text(&self) -> String {
        match self {
            Self::InvalidCommand { .. } => USAGE.to_string(),
            Self::NoStoredAchievement => {
                "No achievement date stored yet. Run a check or /achievement first.".to_string()
            }
            Self::AchievementTooRecent { achieved } => {
                format!("Last achievement was on {achieved}; there is no PV data to query yet.")
            }
            Self::Query(err) => format!("Query failed, please try again later.\nReason: {err}"),
        }
    }
}

impl Tracker {
    /// Resolve `text` against `today`, run the PV query, and attach the last
    /// stored achievement date.
    pub async fn dispatch_query(
        &self,
        text: &str,
        today: NaiveDate,
    ) -> Result<PvReport, DispatchError> {
        let text = text.trim();
        info!(command = text, "direct PV query");
        let query = if text == SINCE_ACHIEVEMENT {
            self.since_stored_achievement(today)?
        } else {
            resolve(text, today).ok_or_else(|| {
                warn!(command = text, "unrecognised query command");
                DispatchError::InvalidCommand {
                    text: text.to_string(),
                }
            })?
        };

        let pv = self.engine().query_pv(query.range, query.kind).await?;
        Ok(PvReport {
            range: query.range,
            left_pv: pv.left_pv,
            right_pv: pv.right_pv,
            achievement_date: self.stored_achievement(),
            origin: ReportOrigin::Manual,
        })
    }

    fn since_stored_achievement(&self, today: NaiveDate) -> Result<ResolvedQuery, DispatchError> {
        let Some(achieved) = self.stored_achievement() else {
            warn!("no stored achievement date to query from");
            return Err(DispatchError::NoStoredAchievement);
        };
        match follow_up(achieved, today) {
            FollowUp::Due(range) => Ok(ResolvedQuery {
                range,
                kind: QueryKind::ExactRange,
            }),
            FollowUp::NotYet { .. } => Err(DispatchError::AchievementTooRecent { achieved }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::notify::LogSink;
    use pvtrack_portal::selectors;
    use pvtrack_portal::testing::ScriptedPortal;
    use pvtrack_state::StateStore;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn tracker(portal: &ScriptedPortal, dir: &tempfile::TempDir) -> Tracker {
        Tracker::new(
            Arc::new(portal.engine()),
            Arc::new(StateStore::new(dir.path().join("state.json"))),
            Arc::new(LogSink),
            chrono_tz::UTC,
        )
    }

    #[tokio::test]
    async fn invalid_command_never_touches_the_portal() {
        let dir = tempfile::tempdir().unwrap();
        let portal = ScriptedPortal::new();
        let tracker = tracker(&portal, &dir);

        let err = tracker.dispatch_query("hello", d(2024, 8, 20)).await.unwrap_err();

        assert!(matches!(err, DispatchError::InvalidCommand { .. }));
        assert_eq!(err.reply_text(), USAGE);
        assert_eq!(portal.site.launches(), 0);
    }

    #[tokio::test]
    async fn second_half_uses_preset_and_stored_achievement() {
        let dir = tempfile::tempdir().unwrap();
        let portal = ScriptedPortal::new();
        portal.set_pv("2,000", "3,000");
        let tracker = tracker(&portal, &dir);
        tracker.state().record_achievement("2024-08-03");

        let report = tracker
            .dispatch_query(" 下半個月 ", d(2024, 9, 2))
            .await
            .unwrap();

        assert_eq!(report.origin, ReportOrigin::Manual);
        assert_eq!(report.range.label(), "09/16 - 09/30");
        assert_eq!((report.left_pv, report.right_pv), (2000, 3000));
        assert_eq!(report.achievement_date, Some(d(2024, 8, 3)));
        assert_eq!(
            portal.site.inspect(|s| s.clicks_on(selectors::SECOND_HALF_BUTTON)),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn query_failure_explains_itself() {
        let dir = tempfile::tempdir().unwrap();
        let portal = ScriptedPortal::new();
        portal.set_search_status(None);
        let tracker = tracker(&portal, &dir);

        let err = tracker.dispatch_query("0801", d(2024, 8, 20)).await.unwrap_err();
        assert!(matches!(err, DispatchError::Query(QueryError::SiteUnstable(_))));
        assert!(err.reply_text().starts_with("Query failed"));
    }

    #[tokio::test]
    async fn since_achievement_queries_from_the_next_day() {
        let dir = tempfile::tempdir().unwrap();
        let portal = ScriptedPortal::new();
        portal.set_pv("8,800", "1,200");
        let tracker = tracker(&portal, &dir);
        tracker.state().record_achievement("2024-05-28");

        let report = tracker
            .dispatch_query(SINCE_ACHIEVEMENT, d(2024, 6, 10))
            .await
            .unwrap();

        assert_eq!(report.range.start(), d(2024, 5, 29));
        assert_eq!(report.range.end(), d(2024, 6, 10));
        assert_eq!((report.left_pv, report.right_pv), (8800, 1200));
        assert_eq!(report.achievement_date, Some(d(2024, 5, 28)));
        portal.site.inspect(|s| {
            assert_eq!(s.value_of(selectors::DATE_FROM), Some("20240529"));
            assert_eq!(s.value_of(selectors::DATE_TO), Some("20240610"));
        });
    }

    #[tokio::test]
    async fn since_achievement_today_has_nothing_to_query() {
        let dir = tempfile::tempdir().unwrap();
        let portal = ScriptedPortal::new();
        let tracker = tracker(&portal, &dir);
        tracker.state().record_achievement("2024-06-10");

        let err = tracker
            .dispatch_query(SINCE_ACHIEVEMENT, d(2024, 6, 10))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DispatchError::AchievementTooRecent { achieved } if achieved == d(2024, 6, 10)
        ));
        assert!(err.reply_text().contains("2024-06-10"));
        assert_eq!(portal.site.launches(), 0);
    }

    #[tokio::test]
    async fn since_achievement_needs_a_stored_date() {
        let dir = tempfile::tempdir().unwrap();
        let portal = ScriptedPortal::new();
        let tracker = tracker(&portal, &dir);

        let err = tracker
            .dispatch_query(SINCE_ACHIEVEMENT, d(2024, 6, 10))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::NoStoredAchievement));
        assert!(err.reply_text().starts_with("No achievement date stored"));
        assert_eq!(portal.site.launches(), 0);
    }
}
