//! Telegram frontend: long-polling `getUpdates` for inbound private text
//! messages, `sendMessage` for replies. The chat id doubles as the wxid.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Contact, Frontend};

const POLL_TIMEOUT_SECS: u64 = 30;

#[derive(Deserialize, Debug)]
struct TgResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Deserialize, Debug)]
struct TgUser {
    #[allow(dead_code)]
    id: i64,
    first_name: String,
    last_name: Option<String>,
    username: Option<String>,
}

#[derive(Deserialize, Debug)]
struct TgChat {
    id: i64,
    #[serde(rename = "type")]
    chat_type: String,
}

#[derive(Deserialize, Debug)]
struct TgMessage {
    from: Option<TgUser>,
    chat: TgChat,
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
struct TgUpdate {
    update_id: i64,
    message: Option<TgMessage>,
}

#[derive(Serialize)]
struct SendMessageRequest {
    chat_id: String,
    text: String,
}

/// Long-poll position and buffered updates, shared behind a mutex so `recv`
/// can take `&self`.
#[derive(Default)]
struct PollState {
    offset: i64,
    buffer: VecDeque<(Contact, String)>,
}

pub struct TelegramBot {
    api_base: String,
    client: Client,
    state: Mutex<PollState>,
}

impl TelegramBot {
    pub fn new(bot_token: &str) -> Self {
        Self {
            api_base: format!("https://api.telegram.org/bot{}", bot_token),
            client: Client::new(),
            state: Mutex::new(PollState::default()),
        }
    }

    fn updates_from(&self, updates: Vec<TgUpdate>, state: &mut PollState) {
        for update in updates {
            state.offset = update.update_id + 1;

            let Some(msg) = update.message else { continue };

            // Private chats only; groups and channels are ignored.
            if msg.chat.chat_type != "private" {
                debug!("Skipping non-private message from chat {}", msg.chat.id);
                continue;
            }

            let text = match msg.text {
                Some(ref t) if !t.is_empty() => t.clone(),
                _ => continue,
            };

            let user = msg.from.unwrap_or(TgUser {
                id: msg.chat.id,
                first_name: "Unknown".into(),
                last_name: None,
                username: None,
            });

            let nickname = match &user.last_name {
                Some(last) => format!("{} {}", user.first_name, last),
                None => user.first_name.clone(),
            };

            let contact = Contact {
                wxid: msg.chat.id.to_string(),
                nickname,
                remark_name: user.username.unwrap_or_default(),
            };

            state.buffer.push_back((contact, text));
        }
    }
}

#[async_trait]
impl Frontend for TelegramBot {
    async fn start(&self) -> Result<()> {
        let url = format!("{}/getMe", self.api_base);
        let resp: TgResponse<TgUser> = self
            .client
            .get(&url)
            .send()
            .await
            .context("Telegram getMe failed; check bot_token and network")?
            .json()
            .await
            .context("Failed to parse getMe response")?;

        if !resp.ok {
            anyhow::bail!(
                "Telegram bot token rejected: {}",
                resp.description.unwrap_or_default()
            );
        }

        let me = resp.result.context("No user in getMe response")?;
        info!(
            "Telegram bot online: @{} ({})",
            me.username.unwrap_or_default(),
            me.first_name
        );
        Ok(())
    }

    async fn recv(&self) -> Result<Option<(Contact, String)>> {
        let mut state = self.state.lock().await;

        if let Some(msg) = state.buffer.pop_front() {
            return Ok(Some(msg));
        }

        loop {
            let url = format!(
                "{}/getUpdates?offset={}&timeout={}&allowed_updates=[\"message\"]",
                self.api_base, state.offset, POLL_TIMEOUT_SECS
            );

            let resp: TgResponse<Vec<TgUpdate>> = self
                .client
                .get(&url)
                .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 5))
                .send()
                .await
                .context("getUpdates request failed")?
                .json()
                .await
                .context("getUpdates parse failed")?;

            if !resp.ok {
                anyhow::bail!(
                    "getUpdates failed: {}",
                    resp.description.unwrap_or_default()
                );
            }

            let updates = resp.result.unwrap_or_default();
            if updates.is_empty() {
                // Long-poll timeout; poll again.
                continue;
            }

            self.updates_from(updates, &mut state);

            if let Some(msg) = state.buffer.pop_front() {
                return Ok(Some(msg));
            }
        }
    }

    async fn send(&self, wxid: &str, text: &str) -> Result<()> {
        let url = format!("{}/sendMessage", self.api_base);
        let body = SendMessageRequest {
            chat_id: wxid.to_string(),
            text: text.to_string(),
        };

        let resp: TgResponse<serde_json::Value> = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("sendMessage request failed")?
            .json()
            .await
            .context("sendMessage parse failed")?;

        if !resp.ok {
            anyhow::bail!(
                "sendMessage failed: {}",
                resp.description.unwrap_or_default()
            );
        }
        Ok(())
    }
}
