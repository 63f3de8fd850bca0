//! Plain-text renderings of daemon replies.

use chrono::{DateTime, Utc};

use pvtrack_portal::{AchievementRecord, SessionState};
use pvtrack_runtime::{DaemonStatus, LastRun, PvReport, RunOutcome};

/// Rank threshold each side's PV is measured against.
pub const PV_TARGET: u64 = 300_000;

pub fn format_report(report: &PvReport) -> String {
    let achieved = report
        .achievement_date
        .map(|day| day.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "none recorded".to_string());
    [
        report.origin.title().to_string(),
        report.range.label(),
        String::new(),
        pv_line("🔵 Left", report.left_pv),
        pv_line("🟢 Right", report.right_pv),
        String::new(),
        format!("🏆 Last achievement: {achieved}"),
    ]
    .join("\n")
}

fn pv_line(side: &str, pv: u64) -> String {
    let percent = (pv.saturating_mul(100) / PV_TARGET).min(100);
    format!(
        "{side}: {} / {} ({percent}%)",
        group_thousands(pv),
        group_thousands(PV_TARGET)
    )
}

/// `1234567` → `1,234,567`.
pub fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

pub fn format_achievement(record: Option<&AchievementRecord>) -> String {
    match record {
        Some(record) => format!("🏆 Latest achievement: {} ({})", record.date, record.status),
        None => "No achievement record on the allowance page.".to_string(),
    }
}

pub fn format_status(status: &DaemonStatus) -> String {
    let mut lines = vec![
        format!("session: {}", session_label(status.session)),
        format!("daemon uptime: {}s", status.uptime_secs),
        format!(
            "last achievement: {}",
            status.last_achievement_date.as_deref().unwrap_or("none recorded")
        ),
    ];
    match &status.last_run {
        Some(run) => lines.push(format!("last run: {}", format_run(run))),
        None => lines.push("last run: not yet".to_string()),
    }
    if let Some(next) = status.next_run {
        lines.push(format!("next run: {}", local_time(next, &status.timezone)));
    }
    lines.join("\n")
}

pub fn format_run(run: &LastRun) -> String {
    let summary = match &run.outcome {
        Ok(RunOutcome::NoRecord) => "no achievement record".to_string(),
        Ok(RunOutcome::NotYetDue { achieved }) => {
            format!("achieved {achieved}, nothing to report yet")
        }
        Ok(RunOutcome::Reported { report }) => format!("reported {}", report.range.label()),
        Err(message) => format!("failed: {message}"),
    };
    format!("{summary} at {}", run.finished_at.format("%Y-%m-%d %H:%M UTC"))
}

fn session_label(state: SessionState) -> &'static str {
    match state {
        SessionState::Uninitialized => "not started",
        SessionState::Initializing => "starting",
        SessionState::Active => "logged in",
        SessionState::Expired => "expired",
        SessionState::Disconnected => "login failed",
    }
}

fn local_time(at: DateTime<Utc>, timezone: &str) -> String {
    match timezone.parse::<chrono_tz::Tz>() {
        Ok(tz) => at.with_timezone(&tz).format("%Y-%m-%d %H:%M %Z").to_string(),
        Err(_) => at.format("%Y-%m-%d %H:%M UTC").to_string(),
    }
}
