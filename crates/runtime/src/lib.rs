//! Everything that runs on top of the portal session: the recurring
//! check-and-report cycle, direct queries, notification delivery and the
//! daemon that clients talk to.

mod client;
mod commands;
pub mod dispatch;
pub mod notify;
pub mod scheduler;
mod server;
pub mod tracker;

pub use client::DaemonClient;
pub use commands::{ClientCommand, DaemonStatus, ServerEvent};
pub use dispatch::{DispatchError, SINCE_ACHIEVEMENT, USAGE};
pub use notify::{LOGIN_FAILED_ALERT, LogSink, NotificationSink, PvReport, ReportOrigin};
pub use scheduler::Scheduler;
pub use server::run_daemon;
pub use tracker::{LastRun, RunOutcome, Tracker};
