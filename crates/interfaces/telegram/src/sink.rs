use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::info;

use pvtrack_runtime::{NotificationSink, PvReport};

use crate::api;
use crate::format::format_report;

/// Pushes scheduled reports and operator alerts to one admin chat.
pub struct TelegramSink {
    client: Client,
    base_url: String,
    chat_id: i64,
}

impl TelegramSink {
    pub fn new(token: &str, chat_id: i64) -> Self {
        Self {
            client: Client::new(),
            base_url: api::base_url(token),
            chat_id,
        }
    }

    /// Token from `TELEGRAM_BOT_TOKEN`, chat from the config value.
    pub fn from_env(admin_chat_id: &str) -> Result<Self> {
        let token = api::bot_token()?;
        Ok(Self::new(&token, api::parse_chat_id(admin_chat_id)?))
    }

    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }
}

#[async_trait]
impl NotificationSink for TelegramSink {
    async fn deliver(&self, report: &PvReport) -> Result<()> {
        api::send_message(&self.client, &self.base_url, self.chat_id, &format_report(report))
            .await
            .context("telegram report delivery failed")?;
        info!(chat_id = self.chat_id, range = %report.range, "report pushed to telegram");
        Ok(())
    }

    async fn alert(&self, text: &str) -> Result<()> {
        api::send_message(&self.client, &self.base_url, self.chat_id, text)
            .await
            .context("telegram alert delivery failed")
    }
}
