//! Telegram Bot API HTTP client.

use std::time::Duration;

use anyhow::{Context, bail};
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::types::{
    AnswerCallbackQueryParams, ApiResponse, BotInfo, EditMessageTextParams, GetFileParams,
    GetUpdatesParams, SendChatActionParams, SendMessageParams, SetMyCommandsParams, TgFile,
    TgMessage, Update,
};

/// Rejection reported by the Bot API itself (`ok: false`).
#[derive(Debug, Clone)]
pub struct ApiError {
    pub method: &'static str,
    pub code: Option<i64>,
    pub description: String,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} failed ({code}): {}", self.method, self.description),
            None => write!(f, "{} failed: {}", self.method, self.description),
        }
    }
}

impl std::error::Error for ApiError {}

/// HTTP client for the Telegram Bot API.
pub struct TelegramApi {
    client: Client,
    base_url: String,
    file_url: String,
}

impl TelegramApi {
    /// Create a new API client with the given bot token.
    pub fn new(bot_token: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url: format!("https://api.telegram.org/bot{bot_token}"),
            file_url: format!("https://api.telegram.org/file/bot{bot_token}"),
        }
    }

    async fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &'static str,
        params: &P,
    ) -> anyhow::Result<Option<R>> {
        let resp: ApiResponse<R> = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .json(params)
            .send()
            .await
            .with_context(|| format!("{method} request failed"))?
            .json()
            .await
            .with_context(|| format!("{method} response parse failed"))?;

        if !resp.ok {
            return Err(ApiError {
                method,
                code: resp.error_code,
                description: resp.description.unwrap_or_else(|| "unknown error".into()),
            }
            .into());
        }
        Ok(resp.result)
    }

    /// Verify the bot token by calling `getMe`.
    pub async fn get_me(&self) -> anyhow::Result<BotInfo> {
        self.call("getMe", &serde_json::json!({}))
            .await?
            .context("getMe returned no result")
    }

    /// Long-poll for updates.
    pub async fn get_updates(&self, params: &GetUpdatesParams) -> anyhow::Result<Vec<Update>> {
        Ok(self.call("getUpdates", params).await?.unwrap_or_default())
    }

    /// Send a chat action (e.g. "typing").
    pub async fn send_chat_action(&self, params: &SendChatActionParams) -> anyhow::Result<()> {
        self.call::<_, bool>("sendChatAction", params).await?;
        Ok(())
    }

    /// Register bot commands in the menu.
    pub async fn set_my_commands(&self, params: &SetMyCommandsParams) -> anyhow::Result<()> {
        self.call::<_, bool>("setMyCommands", params).await?;
        Ok(())
    }

    /// Send a text message.
    pub async fn send_message(&self, params: &SendMessageParams) -> anyhow::Result<TgMessage> {
        self.call("sendMessage", params)
            .await?
            .context("sendMessage returned no result")
    }

    /// Edit an existing message's text.
    pub async fn edit_message_text(
        &self,
        params: &EditMessageTextParams,
    ) -> anyhow::Result<()> {
        // Result is the message, or `true` for inline messages.
        self.call::<_, serde_json::Value>("editMessageText", params)
            .await?;
        Ok(())
    }

    /// Acknowledge an inline button press, optionally with a toast.
    pub async fn answer_callback_query(
        &self,
        params: &AnswerCallbackQueryParams,
    ) -> anyhow::Result<()> {
        self.call::<_, bool>("answerCallbackQuery", params).await?;
        Ok(())
    }

    /// Download a file previously sent to the bot.
    pub async fn download_file(&self, file_id: &str) -> anyhow::Result<Vec<u8>> {
        let file: TgFile = self
            .call(
                "getFile",
                &GetFileParams {
                    file_id: file_id.to_string(),
                },
            )
            .await?
            .context("getFile returned no result")?;
        let Some(path) = file.file_path else {
            bail!("File {} is not downloadable", file.file_id);
        };

        let resp = self
            .client
            .get(format!("{}/{path}", self.file_url))
            .send()
            .await
            .context("File download failed")?;
        if !resp.status().is_success() {
            bail!("File download failed: HTTP {}", resp.status());
        }
        Ok(resp.bytes().await?.to_vec())
    }
}
