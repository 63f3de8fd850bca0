//! The daemon: owns the portal session, runs the schedule and answers
//! clients on a Unix socket.

mod connection;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use pvtrack_config::AppConfig;
use pvtrack_portal::SessionError;

use crate::DaemonStatus;
use crate::notify::LOGIN_FAILED_ALERT;
use crate::scheduler::Scheduler;
use crate::tracker::Tracker;

/// Extra time the scheduler gets beyond one query deadline to finish a run
/// that was in flight when shutdown was requested.
const SCHEDULER_GRACE: Duration = Duration::from_secs(5);

struct DaemonState {
    tracker: Arc<Tracker>,
    scheduler: Scheduler,
    started_at: Instant,
}

impl DaemonState {
    /// Never takes the session lock, so it answers while a query is running.
    fn status(&self) -> DaemonStatus {
        DaemonStatus {
            session: self.tracker.session_state(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            last_achievement_date: self.tracker.state().get().last_achievement_date,
            last_run: self.tracker.last_run(),
            next_run: self.scheduler.next_after(Utc::now()),
            timezone: self.scheduler.timezone().name().to_string(),
        }
    }
}

/// Serve until a client sends `Shutdown`.
///
/// The first login happens before the schedule starts.  A rejected login is
/// reported to the operators and the daemon keeps running, since every
/// later lease retries it; a browser that cannot be launched at all is
/// returned as an error.
pub async fn run_daemon(
    config: &AppConfig,
    tracker: Arc<Tracker>,
    socket_path: impl AsRef<Path>,
) -> Result<()> {
    let socket_path = socket_path.as_ref().to_path_buf();
    let scheduler = Scheduler::from_config(&config.schedule)?;

    if let Some(parent) = socket_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("binding {}", socket_path.display()))?;
    info!(socket = %socket_path.display(), "daemon listening");

    let session = tracker.engine().session().clone();
    match session.start().await {
        Ok(()) => info!("portal session ready"),
        Err(err @ SessionError::Launch(_)) => {
            let _ = std::fs::remove_file(&socket_path);
            return Err(err).context("browser could not be started");
        }
        Err(err) => {
            error!("initial portal login failed: {err}");
            if let Err(alert_err) = tracker.sink().alert(LOGIN_FAILED_ALERT).await {
                warn!("could not deliver login failure alert: {alert_err:#}");
            }
        }
    }

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let state = Arc::new(DaemonState {
        tracker: tracker.clone(),
        scheduler: scheduler.clone(),
        started_at: Instant::now(),
    });
    let schedule_task = scheduler.spawn(tracker, shutdown_tx.subscribe());

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                let (stream, _) = match accept {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(?err, "accept failed");
                        continue;
                    }
                };
                let state = state.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = connection::handle_connection(stream, state, shutdown_tx).await {
                        error!(?err, "daemon connection handler failed");
                    }
                });
            }
        }
    }

    info!("daemon shutting down gracefully");
    let grace = config.timeouts.query_deadline() + SCHEDULER_GRACE;
    let abort = schedule_task.abort_handle();
    if tokio::time::timeout(grace, schedule_task).await.is_err() {
        warn!(?grace, "scheduled run did not finish in time; abandoning it");
        abort.abort();
    }
    session.shutdown().await;
    let _ = std::fs::remove_file(&socket_path);
    info!("daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DaemonClient;
    use crate::notify::recording::RecordingSink;
    use crate::tracker::RunOutcome;
    use pvtrack_portal::SessionState;
    use pvtrack_portal::testing::ScriptedPortal;
    use pvtrack_state::StateStore;

    struct Harness {
        portal: ScriptedPortal,
        sink: Arc<RecordingSink>,
        client: DaemonClient,
        daemon: tokio::task::JoinHandle<Result<()>>,
        dir: tempfile::TempDir,
    }

    fn spawn_daemon(mut portal: ScriptedPortal) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        portal.config.schedule.run_on_startup = false;
        portal.config.retry.delay_ms = 0;
        portal.config.timeouts.login_redirect_ms = 50;
        let socket = dir.path().join("pvtrack.sock");
        let sink = Arc::new(RecordingSink::default());
        let tracker = Arc::new(Tracker::new(
            Arc::new(portal.engine()),
            Arc::new(StateStore::new(dir.path().join("state.json"))),
            sink.clone(),
            portal.config.schedule.tz(),
        ));
        let config = portal.config.clone();
        let daemon_socket = socket.clone();
        let daemon =
            tokio::spawn(async move { run_daemon(&config, tracker, &daemon_socket).await });
        Harness {
            portal,
            sink,
            client: DaemonClient::new(&socket),
            daemon,
            dir,
        }
    }

    async fn wait_ready(client: &DaemonClient) {
        for _ in 0..200 {
            if client.ping().await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("daemon never answered ping");
    }

    #[tokio::test]
    async fn serves_queries_and_shuts_down() {
        let portal = ScriptedPortal::new();
        portal.set_pv("1,500", "2,250");
        portal.set_achievements(&[("2024-06-01", "鑽石")]);
        let h = spawn_daemon(portal);
        wait_ready(&h.client).await;

        let status = h.client.get_status().await.unwrap();
        assert_eq!(status.session, SessionState::Active);
        assert_eq!(status.timezone, "Asia/Taipei");
        assert!(status.next_run.is_some());
        assert!(status.last_run.is_none());

        let report = h.client.query_pv("0601 0615").await.unwrap();
        assert_eq!((report.left_pv, report.right_pv), (1500, 2250));

        let record = h.client.query_achievement().await.unwrap().unwrap();
        assert_eq!(record.date, "2024-06-01");
        let status = h.client.get_status().await.unwrap();
        assert_eq!(status.last_achievement_date.as_deref(), Some("2024-06-01"));

        let run = h.client.run_now().await.unwrap();
        assert!(matches!(run.outcome, Ok(RunOutcome::Reported { .. })));
        assert_eq!(h.sink.reports.lock().unwrap().len(), 1);

        h.client.graceful_shutdown().await.unwrap();
        h.daemon.await.unwrap().unwrap();
        assert!(!h.dir.path().join("pvtrack.sock").exists());
        assert_eq!(h.portal.site.closes(), 1);
    }

    #[tokio::test]
    async fn bad_command_text_is_explained() {
        let h = spawn_daemon(ScriptedPortal::new());
        wait_ready(&h.client).await;

        let err = h.client.query_pv("tomorrow").await.unwrap_err();
        assert!(err.to_string().contains("MMDD"));

        h.client.graceful_shutdown().await.unwrap();
        h.daemon.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn rejected_login_alerts_and_keeps_serving() {
        let portal = ScriptedPortal::new();
        portal.reject_logins(3);
        let h = spawn_daemon(portal);
        wait_ready(&h.client).await;

        assert_eq!(
            h.sink.alerts.lock().unwrap().as_slice(),
            [LOGIN_FAILED_ALERT.to_string()]
        );
        let status = h.client.get_status().await.unwrap();
        assert_ne!(status.session, SessionState::Active);

        h.client.graceful_shutdown().await.unwrap();
        h.daemon.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn browser_launch_failure_is_fatal() {
        let portal = ScriptedPortal::new();
        portal.site.fail_next_launches(1);
        let h = spawn_daemon(portal);

        let err = h.daemon.await.unwrap().unwrap_err();
        assert!(format!("{err:#}").contains("browser could not be started"));
        assert!(!h.dir.path().join("pvtrack.sock").exists());
    }
}
