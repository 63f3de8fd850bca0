//! The recurring check-and-report loop.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use pvtrack_config::ScheduleConfig;

use crate::tracker::Tracker;

#[derive(Clone)]
pub struct Scheduler {
    schedule: Schedule,
    tz: Tz,
    run_on_startup: bool,
}

impl Scheduler {
    pub fn from_config(config: &ScheduleConfig) -> Result<Self> {
        let schedule = Schedule::from_str(&config.cron)
            .with_context(|| format!("invalid cron expression {:?}", config.cron))?;
        Ok(Self {
            schedule,
            tz: config.tz(),
            run_on_startup: config.run_on_startup,
        })
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// First fire time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&now.with_timezone(&self.tz))
            .next()
            .map(|at| at.with_timezone(&Utc))
    }

    /// Run the loop until `shutdown` flips to `true`.  A failed run is only
    /// logged; the next trigger still fires.
    pub fn spawn(self, tracker: Arc<Tracker>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if self.run_on_startup {
                info!("startup check-and-report run");
                tracker.run_logged().await;
            }

            loop {
                let Some(next) = self.next_after(Utc::now()) else {
                    warn!("schedule has no future fire times; scheduler stopping");
                    break;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                info!(next = %next.with_timezone(&self.tz), "next scheduled run");

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        tracker.run_logged().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("scheduler stopped");
        })
    }
}
