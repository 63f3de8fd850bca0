use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use tracing::{info, warn};

use pvtrack_browser::{BrowserLauncher, ChromeLauncher};
use pvtrack_config::{AppConfig, Credentials};
use pvtrack_portal::{QueryEngine, SessionController};
use pvtrack_runtime::{DaemonClient, LogSink, NotificationSink, Tracker, run_daemon};
use pvtrack_state::StateStore;
use pvtrack_telegram::{TelegramSink, start_bot};

#[derive(Debug, Clone)]
pub(crate) struct DaemonPaths {
    runtime_dir: PathBuf,
    pub(crate) pid_file: PathBuf,
    log_file: PathBuf,
    pub(crate) lock_file: PathBuf,
}

pub(crate) fn daemon_paths() -> DaemonPaths {
    let runtime_dir = Path::new(".pvtrack").join("runtime");
    DaemonPaths {
        pid_file: runtime_dir.join("daemon.pid"),
        log_file: runtime_dir.join("daemon.log"),
        lock_file: runtime_dir.join("daemon.lock"),
        runtime_dir,
    }
}

/// Wire the portal session, state file and notification sink together.
pub(crate) fn build_tracker(config: &AppConfig) -> Result<Arc<Tracker>> {
    let credentials = Credentials::from_env()?;
    let launcher: Arc<dyn BrowserLauncher> = Arc::new(ChromeLauncher::new(config.browser.clone()));
    let session = Arc::new(SessionController::new(launcher, credentials, config));
    Ok(Arc::new(Tracker::new(
        Arc::new(QueryEngine::new(session)),
        Arc::new(StateStore::new(&config.state.path)),
        notification_sink(config),
        config.schedule.tz(),
    )))
}

fn notification_sink(config: &AppConfig) -> Arc<dyn NotificationSink> {
    if config.integrations.telegram_enabled {
        match TelegramSink::from_env(&config.integrations.telegram_admin_chat_id) {
            Ok(sink) => {
                info!(chat_id = sink.chat_id(), "reports go to telegram");
                return Arc::new(sink);
            }
            Err(err) => warn!("telegram notifications unavailable, logging reports instead: {err:#}"),
        }
    }
    Arc::new(LogSink)
}

/// Run the daemon in this process until a signal or a `stop` arrives.
pub(crate) async fn run_daemon_process(config: AppConfig) -> Result<()> {
    let paths = daemon_paths();
    fs::create_dir_all(&paths.runtime_dir)?;
    let lock_file = File::create(&paths.lock_file)?;
    lock_file
        .try_lock_exclusive()
        .map_err(|_| anyhow::anyhow!("another pvtrack daemon already holds the lock"))?;
    fs::write(&paths.pid_file, std::process::id().to_string())?;

    let result = serve(&config).await;

    let _ = fs::remove_file(&paths.pid_file);
    // lock_file drop releases the OS lock.
    result
}

async fn serve(config: &AppConfig) -> Result<()> {
    let tracker = build_tracker(config)?;
    let socket_path = PathBuf::from(&config.daemon.socket_path);

    let bot = config.integrations.telegram_enabled.then(|| {
        let client = DaemonClient::new(&socket_path);
        let admin_chat_id = config.integrations.telegram_admin_chat_id.clone();
        tokio::spawn(async move {
            if let Err(err) = client.connect_with_backoff(50).await {
                warn!("telegram bot not started, daemon unreachable: {err}");
                return;
            }
            if let Err(err) = start_bot(client, &admin_chat_id).await {
                warn!("telegram bot exited: {err:#}");
            }
        })
    });

    let daemon = run_daemon(config, tracker, &socket_path);
    tokio::pin!(daemon);

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
        }
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = async {
        tokio::signal::ctrl_c().await?;
        Ok::<(), anyhow::Error>(())
    };

    let result = tokio::select! {
        result = &mut daemon => result,
        signal = terminate => {
            signal?;
            info!("termination signal received; shutting down");
            let client = DaemonClient::new(&socket_path);
            match client.graceful_shutdown().await {
                Ok(()) => daemon.await,
                Err(err) => {
                    warn!("graceful shutdown request failed: {err}");
                    Ok(())
                }
            }
        }
    };

    if let Some(bot) = bot {
        bot.abort();
    }
    result
}

/// Start `pvtrack run` detached, logging to the runtime directory.
pub(crate) fn daemon_start(config: &AppConfig, config_path: &Path) -> Result<()> {
    let paths = daemon_paths();
    fs::create_dir_all(&paths.runtime_dir)?;
    let socket_path = PathBuf::from(&config.daemon.socket_path);

    if is_socket_live(&socket_path) {
        bail!(
            "daemon already running on socket {}; use `pvtrack stop` first",
            socket_path.display()
        );
    }
    if let Some(pid) = read_pid(&paths.pid_file)? {
        if is_pid_running(pid) {
            bail!("daemon already running with pid {pid}");
        }
        let _ = fs::remove_file(&paths.pid_file);
    }

    let exe = std::env::current_exe()?;
    let out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log_file)?;
    let err = out.try_clone()?;

    let mut child = Command::new(exe)
        .arg("--config")
        .arg(config_path)
        .arg("run")
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err))
        .spawn()?;

    for _ in 0..40 {
        if is_socket_live(&socket_path) {
            println!("daemon started");
            println!("- pid: {}", child.id());
            println!("- socket: {}", socket_path.display());
            println!("- log: {}", paths.log_file.display());
            return Ok(());
        }

        if let Some(status) = child.try_wait()? {
            bail!(
                "daemon exited during startup with status {status}; check {}",
                paths.log_file.display()
            );
        }

        std::thread::sleep(Duration::from_millis(100));
    }

    bail!(
        "daemon did not become ready on socket {}; check {}",
        socket_path.display(),
        paths.log_file.display()
    )
}

pub(crate) async fn daemon_stop(config: &AppConfig) -> Result<()> {
    let paths = daemon_paths();
    let client = DaemonClient::new(&config.daemon.socket_path);

    let requested = client.graceful_shutdown().await.is_ok();
    if requested {
        println!("daemon stop requested gracefully");
    }

    let Some(pid) = read_pid(&paths.pid_file)? else {
        if !requested {
            println!("daemon is not running");
        }
        return Ok(());
    };

    // A scheduled run may still be finishing its query.
    let grace = config.timeouts.query_deadline() + Duration::from_secs(10);
    wait_for_pid_exit(pid, if requested { grace } else { Duration::ZERO });
    if !is_pid_running(pid) {
        let _ = fs::remove_file(&paths.pid_file);
        println!("daemon stopped (pid {pid})");
        return Ok(());
    }

    terminate_pid(pid)?;
    wait_for_pid_exit(pid, Duration::from_secs(4));
    let _ = fs::remove_file(&paths.pid_file);
    println!("daemon terminated (pid {pid})");
    Ok(())
}

pub(crate) async fn daemon_status(config: &AppConfig) -> Result<()> {
    let paths = daemon_paths();
    let socket_path = PathBuf::from(&config.daemon.socket_path);
    let client = DaemonClient::new(&socket_path);

    match client.get_status().await {
        Ok(status) => {
            println!("daemon status: running");
            if let Some(pid) = read_pid(&paths.pid_file)? {
                println!("- pid: {pid}");
            }
            println!("- socket: {}", socket_path.display());
            println!("- log: {}", paths.log_file.display());
            for line in pvtrack_telegram::format::format_status(&status).lines() {
                println!("- {line}");
            }
        }
        Err(_) => {
            println!("daemon status: stopped");
            println!("- socket: {}", socket_path.display());
            if let Some(pid) = read_pid(&paths.pid_file)? {
                if is_pid_running(pid) {
                    println!("- pid {pid} is alive but not answering; check the log");
                } else {
                    let _ = fs::remove_file(&paths.pid_file);
                }
            }
        }
    }
    Ok(())
}

/// Client commands need a daemon; say so plainly when there is none.
pub(crate) fn require_daemon(config: &AppConfig) -> Result<DaemonClient> {
    let socket_path = PathBuf::from(&config.daemon.socket_path);
    if !is_socket_live(&socket_path) {
        bail!(
            "no daemon is listening on {}; start one with `pvtrack start` or `pvtrack run`",
            socket_path.display()
        );
    }
    Ok(DaemonClient::new(socket_path))
}

pub(crate) fn is_socket_live(path: &Path) -> bool {
    std::os::unix::net::UnixStream::connect(path).is_ok()
}

pub(crate) fn read_pid(path: &Path) -> Result<Option<u32>> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(raw.trim().parse::<u32>().ok())
}

pub(crate) fn wait_for_pid_exit(pid: u32, timeout: Duration) {
    let step = Duration::from_millis(50);
    let mut waited = Duration::from_millis(0);
    while waited < timeout {
        if !is_pid_running(pid) {
            return;
        }
        std::thread::sleep(step);
        waited += step;
    }
}

pub(crate) fn is_pid_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

pub(crate) fn terminate_pid(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let status = Command::new("kill").arg(pid.to_string()).status()?;
        if !status.success() {
            bail!("failed to terminate daemon pid {pid}");
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        bail!("daemon stop is only implemented on unix in this build")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_files_live_under_pvtrack_dir() {
        let paths = daemon_paths();
        assert!(paths.pid_file.starts_with(".pvtrack/runtime"));
        assert!(paths.lock_file.ends_with("daemon.lock"));
        assert_ne!(paths.pid_file, paths.log_file);
    }

    #[test]
    fn pid_file_parsing_tolerates_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        assert_eq!(read_pid(&path).unwrap(), None);
        fs::write(&path, "4242\n").unwrap();
        assert_eq!(read_pid(&path).unwrap(), Some(4242));
        fs::write(&path, "not a pid").unwrap();
        assert_eq!(read_pid(&path).unwrap(), None);
    }

    #[test]
    fn dead_socket_is_not_live() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_socket_live(&dir.path().join("missing.sock")));
    }
}
