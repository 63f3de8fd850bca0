use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pvtrack_portal::{AchievementRecord, SessionState};

use crate::notify::PvReport;
use crate::tracker::LastRun;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub session: SessionState,
    pub uptime_secs: u64,
    pub last_achievement_date: Option<String>,
    pub last_run: Option<LastRun>,
    pub next_run: Option<DateTime<Utc>>,
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientCommand {
    Ping,
    GetStatus,
    /// Resolve a date command (`0801`, `0801 0815`, `first-half`, ...) and
    /// query PV for it.
    QueryPv { text: String },
    QueryAchievement,
    /// Run one check-and-report cycle now, outside the schedule.
    RunNow,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerEvent {
    Ack(String),
    Status(DaemonStatus),
    Report(PvReport),
    Achievement(Option<AchievementRecord>),
    RunFinished(LastRun),
    /// Something went wrong; the text is ready to show to a person.
    Error(String),
}
