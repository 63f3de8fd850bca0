use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::warn;

use pvtrack_portal::AchievementRecord;

use crate::notify::PvReport;
use crate::tracker::LastRun;
use crate::{ClientCommand, DaemonStatus, ServerEvent};

/// Talks to a running daemon over its Unix socket.  Every method opens a
/// fresh connection, so one client can be shared freely.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn connect_with_backoff(&self, max_attempts: usize) -> Result<()> {
        let mut delay = Duration::from_millis(100);
        for attempt in 0..max_attempts.max(1) {
            match UnixStream::connect(&self.socket_path).await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    if attempt + 1 == max_attempts.max(1) {
                        return Err(err.into());
                    }
                    warn!(attempt, ?err, "daemon connect failed; retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(2));
                }
            }
        }
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        match self.request(ClientCommand::Ping).await? {
            ServerEvent::Ack(_) => Ok(()),
            other => unexpected("ping", other),
        }
    }

    pub async fn get_status(&self) -> Result<DaemonStatus> {
        match self.request(ClientCommand::GetStatus).await? {
            ServerEvent::Status(status) => Ok(status),
            other => unexpected("status", other),
        }
    }

    /// `Err` carries the daemon's explanation when the command was
    /// unrecognised or the portal query failed.
    pub async fn query_pv(&self, text: &str) -> Result<PvReport> {
        let command = ClientCommand::QueryPv {
            text: text.to_string(),
        };
        match self.request(command).await? {
            ServerEvent::Report(report) => Ok(report),
            other => unexpected("query", other),
        }
    }

    pub async fn query_achievement(&self) -> Result<Option<AchievementRecord>> {
        match self.request(ClientCommand::QueryAchievement).await? {
            ServerEvent::Achievement(record) => Ok(record),
            other => unexpected("achievement", other),
        }
    }

    pub async fn run_now(&self) -> Result<LastRun> {
        match self.request(ClientCommand::RunNow).await? {
            ServerEvent::RunFinished(run) => Ok(run),
            other => unexpected("run", other),
        }
    }

    pub async fn graceful_shutdown(&self) -> Result<()> {
        let _ = self.request(ClientCommand::Shutdown).await?;
        Ok(())
    }

    async fn request(&self, command: ClientCommand) -> Result<ServerEvent> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let (read_half, mut write_half) = stream.into_split();

        let request = serde_json::to_string(&command)?;
        write_half.write_all(request.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
        write_half.flush().await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            line.clear();
            let bytes = reader.read_line(&mut line).await?;
            if bytes == 0 {
                bail!("daemon closed the connection without replying; check daemon logs");
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(serde_json::from_str(trimmed)?);
        }
    }
}

fn unexpected<T>(what: &str, event: ServerEvent) -> Result<T> {
    match event {
        ServerEvent::Error(message) => bail!("{message}"),
        other => bail!("daemon {what} response missing (got {other:?})"),
    }
}
