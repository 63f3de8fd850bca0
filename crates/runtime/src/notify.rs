//! Where finished reports and operator alerts go.

use async_trait::async_trait;
use anyhow::Result;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use pvtrack_portal::DateRange;

/// Text pushed to operators when the portal rejects the configured login.
pub const LOGIN_FAILED_ALERT: &str =
    "[pvtrack] Automatic portal login failed. Check the account credentials or the portal status.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportOrigin {
    /// Pushed by the scheduler after a fresh achievement check.
    Scheduled,
    /// Answer to a direct query.
    Manual,
}

impl ReportOrigin {
    pub fn title(self) -> &'static str {
        match self {
            Self::Scheduled => "📈 PV tracking report",
            Self::Manual => "📊 PV query result",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvReport {
    pub range: DateRange,
    pub left_pv: u64,
    pub right_pv: u64,
    pub achievement_date: Option<NaiveDate>,
    pub origin: ReportOrigin,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, report: &PvReport) -> Result<()>;

    async fn alert(&self, text: &str) -> Result<()>;
}

/// Writes everything to the log.  Used when no chat transport is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, report: &PvReport) -> Result<()> {
        info!(
            title = report.origin.title(),
            range = %report.range,
            left_pv = report.left_pv,
            right_pv = report.right_pv,
            achievement = ?report.achievement_date,
            "PV report"
        );
        Ok(())
    }

    async fn alert(&self, text: &str) -> Result<()> {
        warn!(alert = text, "operator alert");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use std::sync::Mutex;

    use super::*;

    /// Keeps every report and alert for assertions.
    #[derive(Default)]
    pub struct RecordingSink {
        pub reports: Mutex<Vec<PvReport>>,
        pub alerts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn deliver(&self, report: &PvReport) -> Result<()> {
            self.reports.lock().unwrap().push(report.clone());
            Ok(())
        }

        async fn alert(&self, text: &str) -> Result<()> {
            self.alerts.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }
}
