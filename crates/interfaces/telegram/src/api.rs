//! The handful of Bot API calls the bot and the sink need.

use anyhow::{Context, Result, bail};
use reqwest::Client;
use serde::{Deserialize, Serialize};

const API_ROOT: &str = "https://api.telegram.org";

pub(crate) fn bot_token() -> Result<String> {
    let token = std::env::var("TELEGRAM_BOT_TOKEN")
        .map_err(|_| anyhow::anyhow!("TELEGRAM_BOT_TOKEN is not set"))?;
    if token.trim().is_empty() {
        bail!("TELEGRAM_BOT_TOKEN is empty");
    }
    Ok(token.trim().to_string())
}

/// The configured admin chat; Telegram chat ids are signed integers.
pub(crate) fn parse_chat_id(raw: &str) -> Result<i64> {
    raw.trim()
        .parse::<i64>()
        .with_context(|| format!("telegram admin chat id {raw:?} is not numeric"))
}

pub(crate) fn base_url(token: &str) -> String {
    format!("{API_ROOT}/bot{token}")
}

pub(crate) async fn fetch_updates(
    client: &Client,
    base_url: &str,
    offset: i64,
) -> Result<Vec<TelegramUpdate>> {
    let url = format!("{base_url}/getUpdates");
    let response = client
        .get(url)
        .query(&[("timeout", "25"), ("offset", &offset.to_string())])
        .send()
        .await?
        .error_for_status()?;

    let payload: TelegramResponse<Vec<TelegramUpdate>> = response.json().await?;
    if !payload.ok {
        let description = payload
            .description
            .unwrap_or_else(|| "telegram getUpdates failed".to_string());
        bail!(description);
    }

    Ok(payload.result.unwrap_or_default())
}

pub(crate) async fn send_message(
    client: &Client,
    base_url: &str,
    chat_id: i64,
    text: &str,
) -> Result<()> {
    let url = format!("{base_url}/sendMessage");
    let body = SendMessageRequest {
        chat_id,
        text,
        disable_web_page_preview: true,
    };

    let response = client
        .post(url)
        .json(&body)
        .send()
        .await?
        .error_for_status()?;

    let payload: TelegramResponse<serde_json::Value> = response.json().await?;
    if !payload.ok {
        let description = payload
            .description
            .unwrap_or_else(|| "telegram sendMessage failed".to_string());
        bail!(description);
    }

    Ok(())
}

/// Best-effort `sendChatAction`; failures are ignored.
pub(crate) async fn send_chat_action(client: &Client, base_url: &str, chat_id: i64, action: &str) {
    let url = format!("{base_url}/sendChatAction");
    let body = serde_json::json!({ "chat_id": chat_id, "action": action });
    let _ = client.post(url).json(&body).send().await;
}

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TelegramUpdate {
    pub update_id: i64,
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TelegramMessage {
    pub chat: TelegramChat,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    disable_web_page_preview: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_update_batch() {
        let raw = r#"{"ok":true,"result":[
            {"update_id":7,"message":{"chat":{"id":42},"text":"0801"}},
            {"update_id":8,"edited_message":{"chat":{"id":42}}}
        ]}"#;
        let payload: TelegramResponse<Vec<TelegramUpdate>> = serde_json::from_str(raw).unwrap();
        let updates = payload.result.unwrap();
        assert_eq!(updates.len(), 2);
        let message = updates[0].message.as_ref().unwrap();
        assert_eq!(message.chat.id, 42);
        assert_eq!(message.text.as_deref(), Some("0801"));
        assert!(updates[1].message.is_none());
    }
}
