// Copyright (c) Custodia, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Telegram notification sink and operator alert channel.
//!
//! Notifications are fire-and-forget: failures are logged and swallowed,
//! never propagated into a pipeline. Operator alerts go to a dedicated chat
//! and may mention on-call users.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::types::AccountId;

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_SECS: u64 = 2;

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TelegramConfig {
    pub bot_token: String,
    // Chat receiving operator alerts (treasury underfunded, reconciliation
    // stalls). User notifications go to the user's own chat id.
    pub operator_chat_id: String,
    pub operator_mentions: Vec<String>,
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        !self.bot_token.is_empty()
    }
}

pub struct Notifier {
    config: TelegramConfig,
    client: Client,
    api_base: String,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("configured", &self.is_configured())
            .field("api_base", &"<redacted>")
            .finish()
    }
}

impl Notifier {
    pub fn new(config: TelegramConfig) -> Self {
        let api_base = format!("https://api.telegram.org/bot{}", config.bot_token);
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("Failed to build reqwest client");

        Self {
            config,
            client,
            api_base,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    /// Notify a user. Fire-and-forget: errors are logged, never returned.
    pub async fn notify(&self, account_id: AccountId, text: &str) {
        self.send_to_chat(&account_id.to_string(), text).await;
    }

    /// Alert the operator channel, mentioning on-call users.
    pub async fn alert(&self, text: &str) {
        if self.config.operator_chat_id.is_empty() {
            warn!("[Notify] No operator chat configured, alert dropped: {}", text);
            return;
        }
        let message = format!("{}🚨 <b>[Custodia]</b>\n{}", self.mention_text(), text);
        let chat = self.config.operator_chat_id.clone();
        self.send_to_chat(&chat, &message).await;
    }

    pub async fn notify_startup(&self, treasury_address: &str) {
        if self.config.operator_chat_id.is_empty() {
            return;
        }
        let message = format!(
            "<b>[Custodia]</b> 🚀 Settlement engine started\n\
            <b>Treasury:</b> <code>{}</code>",
            truncate_addr(treasury_address)
        );
        let chat = self.config.operator_chat_id.clone();
        self.send_to_chat(&chat, &message).await;
    }

    async fn send_to_chat(&self, chat_id: &str, text: &str) {
        if !self.is_configured() {
            info!(
                "Telegram not configured, would send to {}: {}",
                chat_id,
                &text[..text.len().min(200)]
            );
            return;
        }

        for attempt in 0..MAX_RETRIES {
            match self
                .client
                .post(format!("{}/sendMessage", self.api_base))
                .json(&json!({
                    "chat_id": chat_id,
                    "text": text,
                    "parse_mode": "HTML",
                    "disable_web_page_preview": true,
                }))
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => return,
                Ok(resp) => {
                    warn!(
                        "Telegram send attempt {}/{} failed: {}",
                        attempt + 1,
                        MAX_RETRIES,
                        resp.status()
                    );
                }
                Err(e) => {
                    warn!(
                        "Telegram send attempt {}/{} failed: {:?}",
                        attempt + 1,
                        MAX_RETRIES,
                        e
                    );
                }
            }

            if attempt < MAX_RETRIES - 1 {
                tokio::time::sleep(Duration::from_secs(RETRY_DELAY_SECS * (attempt as u64 + 1)))
                    .await;
            }
        }

        warn!(
            "Failed to send Telegram message after {} attempts",
            MAX_RETRIES
        );
    }

    fn mention_text(&self) -> String {
        if self.config.operator_mentions.is_empty() {
            return String::new();
        }

        let mentions: Vec<String> = self
            .config
            .operator_mentions
            .iter()
            .map(|user| {
                let user = user.trim();
                if user.chars().all(|c| c.is_ascii_digit()) {
                    format!(r#"<a href="tg://user?id={}">{}</a>"#, user, user)
                } else {
                    format!("@{}", user.trim_start_matches('@'))
                }
            })
            .collect();

        format!("🔔 {}\n\n", mentions.join(" "))
    }
}

pub fn truncate_addr(addr: &str) -> String {
    if addr.len() > 20 {
        format!("{}...{}", &addr[..10], &addr[addr.len() - 8..])
    } else {
        addr.to_string()
    }
}

/// Shared notifier type.
pub type SharedNotifier = Arc<Notifier>;

pub fn create_notifier(config: TelegramConfig) -> SharedNotifier {
    Arc::new(Notifier::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_addr() {
        let short = "9xQeWvG8";
        assert_eq!(truncate_addr(short), "9xQeWvG8");

        let long = "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin";
        let truncated = truncate_addr(long);
        assert!(truncated.contains("..."));
        assert_eq!(truncated.len(), 21); // 10 + 3 + 8
    }

    #[test]
    fn test_unconfigured_is_noop() {
        let notifier = Notifier::new(TelegramConfig::default());
        assert!(!notifier.is_configured());
    }

    #[test]
    fn test_mention_text_formats_ids_and_handles() {
        let notifier = Notifier::new(TelegramConfig {
            bot_token: "token".to_string(),
            operator_chat_id: "-100".to_string(),
            operator_mentions: vec!["12345".to_string(), "@oncall".to_string()],
        });
        let text = notifier.mention_text();
        assert!(text.contains(r#"tg://user?id=12345"#));
        assert!(text.contains("@oncall"));
    }
}
