mod api;
pub mod format;
mod sink;

use std::time::Duration;

use anyhow::Result;
use reqwest::Client;
use tracing::{info, warn};

use pvtrack_runtime::{DaemonClient, SINCE_ACHIEVEMENT};

pub use format::{format_report, group_thousands};
pub use sink::TelegramSink;

const HELP: &str = "\
/help - this message
/status - session and schedule status
/achievement - check the allowance page for the latest achievement
/since - PV from the day after the stored achievement until today

Query PV by sending a date:
- MMDD (for example 0801)
- MMDD MMDD (for example 0801 0815)
- first-half / 上半個月
- second-half / 下半個月";

/// Long-poll for messages and answer those from `admin_chat_id` only.
pub async fn start_bot(client_ipc: DaemonClient, admin_chat_id: &str) -> Result<()> {
    let admin_chat = api::parse_chat_id(admin_chat_id)?;
    let token = api::bot_token()?;
    let client = Client::new();
    let base_url = api::base_url(&token);
    let mut offset: i64 = 0;

    info!(admin_chat, "telegram bot listening for updates");

    loop {
        let updates = match api::fetch_updates(&client, &base_url, offset).await {
            Ok(u) => u,
            Err(err) => {
                if err.to_string().contains("409") {
                    warn!("409 Conflict: another bot instance is polling; waiting 15s");
                    tokio::time::sleep(Duration::from_secs(15)).await;
                } else {
                    warn!("getUpdates failed, retrying in 5s: {err}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                continue;
            }
        };

        for update in updates {
            offset = update.update_id + 1;

            let Some((chat_id, text)) = incoming_text(update, admin_chat) else {
                continue;
            };
            info!(chat_id, text = text.trim(), "telegram message");

            // Portal queries take several seconds; keep the typing indicator
            // alive until the reply is ready.
            let (cancel_typing_tx, mut cancel_typing_rx) = tokio::sync::oneshot::channel::<()>();
            {
                let typing_client = client.clone();
                let typing_url = base_url.clone();
                tokio::spawn(async move {
                    api::send_chat_action(&typing_client, &typing_url, chat_id, "typing").await;
                    let mut interval = tokio::time::interval(Duration::from_secs(4));
                    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    interval.tick().await;
                    loop {
                        tokio::select! {
                            biased;
                            _ = &mut cancel_typing_rx => break,
                            _ = interval.tick() => {
                                api::send_chat_action(&typing_client, &typing_url, chat_id, "typing").await;
                            }
                        }
                    }
                });
            }

            let response = match handle_telegram_input(&client_ipc, &text).await {
                Ok(r) => r,
                Err(err) => {
                    warn!(chat_id, "telegram handler error: {err:#}");
                    format!("⚠️ {err}")
                }
            };

            let _ = cancel_typing_tx.send(());

            for chunk in chunk_message(&response, 3500) {
                if let Err(err) = api::send_message(&client, &base_url, chat_id, &chunk).await {
                    warn!(chat_id, "sendMessage failed: {err}");
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
    }
}

/// Reply text for one incoming message.  `Err` means the daemon could not
/// be reached or rejected the request; its message is shown to the sender.
async fn handle_telegram_input(daemon: &DaemonClient, text: &str) -> Result<String> {
    let line = normalize_telegram_command(text);
    match line.as_str() {
        "/start" | "/help" => Ok(HELP.to_string()),
        "/status" => Ok(format::format_status(&daemon.get_status().await?)),
        "/achievement" => {
            let record = daemon.query_achievement().await?;
            Ok(format::format_achievement(record.as_ref()))
        }
        "/since" => Ok(format_report(&daemon.query_pv(SINCE_ACHIEVEMENT).await?)),
        cmd if cmd.starts_with('/') => Ok("unknown command. use /help".to_string()),
        query => Ok(format_report(&daemon.query_pv(query).await?)),
    }
}

/// Sender and text of a message worth answering.  Messages from any chat
/// other than the admin chat are dropped.
fn incoming_text(update: api::TelegramUpdate, admin_chat: i64) -> Option<(i64, String)> {
    let message = update.message?;
    let chat_id = message.chat.id;
    if chat_id != admin_chat {
        warn!(chat_id, "ignoring message from a chat other than the admin chat");
        return None;
    }
    message.text.map(|text| (chat_id, text))
}

fn normalize_telegram_command(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return trimmed.to_string();
    }

    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or("").trim();

    let command = command
        .split_once('@')
        .map(|(base, _)| base)
        .unwrap_or(command);

    if rest.is_empty() {
        command.to_string()
    } else {
        format!("{command} {rest}")
    }
}

fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.lines() {
        let line_len = line.chars().count() + 1;
        if current_len > 0 && current_len + line_len > max_chars {
            chunks.push(current.trim_end().to_string());
            current.clear();
            current_len = 0;
        }
        current.push_str(line);
        current.push('\n');
        current_len += line_len;
    }

    if !current.trim().is_empty() {
        chunks.push(current.trim_end().to_string());
    }

    if chunks.is_empty() {
        chunks.push(text.to_string());
    }
    chunks
}
