//! Unix domain socket connection handling and command dispatch.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{ClientCommand, ServerEvent};

use super::DaemonState;

pub(super) async fn handle_connection(
    stream: UnixStream,
    state: Arc<DaemonState>,
    shutdown_tx: watch::Sender<bool>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(());
    }

    let command: ClientCommand = match serde_json::from_str(line.trim()) {
        Ok(command) => command,
        Err(err) => {
            warn!(%err, "malformed client command");
            let reply = ServerEvent::Error(format!("malformed command: {err}"));
            return send_event(&mut write_half, reply).await;
        }
    };
    debug!(?command, "client command");

    let tracker = &state.tracker;
    let reply = match command {
        ClientCommand::Ping => ServerEvent::Ack("pong".to_string()),
        ClientCommand::GetStatus => ServerEvent::Status(state.status()),
        ClientCommand::QueryPv { text } => {
            match tracker.dispatch_query(&text, tracker.today()).await {
                Ok(report) => ServerEvent::Report(report),
                Err(err) => {
                    warn!(command = %text, "direct query failed: {err}");
                    ServerEvent::Error(err.reply_text())
                }
            }
        }
        ClientCommand::QueryAchievement => match tracker.latest_achievement().await {
            Ok(record) => ServerEvent::Achievement(record),
            Err(err) => {
                warn!("achievement query failed: {err}");
                ServerEvent::Error(format!("Achievement query failed.\nReason: {err}"))
            }
        },
        ClientCommand::RunNow => {
            info!("check-and-report run requested by client");
            ServerEvent::RunFinished(tracker.run_logged().await)
        }
        ClientCommand::Shutdown => {
            let _ = shutdown_tx.send(true);
            ServerEvent::Ack("shutting down".to_string())
        }
    };

    send_event(&mut write_half, reply).await
}

async fn send_event(writer: &mut OwnedWriteHalf, event: ServerEvent) -> Result<()> {
    let encoded = serde_json::to_string(&event)?;
    writer.write_all(encoded.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
