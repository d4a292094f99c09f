//! Telegram transport for classbell.
//!
//! Uses the Bot API with long-polling (no webhook required).
//!
//! # Configuration
//!
//! ```json5
//! telegram: {
//!     bot_token: "123456:ABC-DEF...",
//!     admins: ["alice", "bob"],
//! }
//! ```

pub mod api;
pub mod polling;
pub mod types;

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use classbell_cron::{ChatTransport, MessageHandle, SendError, SendRequest, TextFormat};

use api::{ApiError, TelegramApi};
use polling::InboundUpdate;
use types::{InlineKeyboardButton, InlineKeyboardMarkup, LinkPreviewOptions, SendMessageParams};

/// Map a Bot API rejection onto the delivery ladder's error classes.
pub fn classify(error: &anyhow::Error) -> SendError {
    let Some(api) = error.downcast_ref::<ApiError>() else {
        return SendError::Other(format!("{error:#}"));
    };
    let text = api.description.to_ascii_lowercase();
    if text.contains("message thread not found")
        || text.contains("topic_closed")
        || text.contains("topic_deleted")
        || text.contains("thread not found")
    {
        SendError::TopicNotFound(api.description.clone())
    } else if text.contains("can't parse entities") || text.contains("unsupported start tag") {
        SendError::Formatting(api.description.clone())
    } else {
        SendError::Other(api.to_string())
    }
}

pub fn send_params(request: &SendRequest) -> SendMessageParams {
    let reply_markup = (!request.actions.is_empty()).then(|| InlineKeyboardMarkup {
        inline_keyboard: vec![
            request
                .actions
                .iter()
                .map(|a| InlineKeyboardButton {
                    text: a.label.clone(),
                    callback_data: a.data.clone(),
                })
                .collect(),
        ],
    });
    SendMessageParams {
        chat_id: request.chat_id,
        text: request.text.clone(),
        message_thread_id: request.topic_id,
        parse_mode: match request.format {
            TextFormat::Html => Some("HTML".into()),
            TextFormat::Plain => None,
        },
        reply_markup,
        link_preview_options: Some(LinkPreviewOptions { is_disabled: true }),
    }
}

/// [`ChatTransport`] over the Bot API.
pub struct TelegramTransport {
    api: Arc<TelegramApi>,
}

impl TelegramTransport {
    pub fn new(api: Arc<TelegramApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send(&self, request: &SendRequest) -> Result<MessageHandle, SendError> {
        let message = self
            .api
            .send_message(&send_params(request))
            .await
            .map_err(|e| classify(&e))?;
        Ok(MessageHandle {
            chat_id: message.chat.id,
            message_id: message.message_id,
        })
    }
}

/// Owns the polling task.
pub struct TelegramBot {
    api: Arc<TelegramApi>,
    state: Mutex<PollState>,
}

#[derive(Default)]
struct PollState {
    cancel: Option<CancellationToken>,
    poll_handle: Option<JoinHandle<()>>,
}

impl TelegramBot {
    pub fn new(bot_token: &str) -> Self {
        Self {
            api: Arc::new(TelegramApi::new(bot_token)),
            state: Mutex::new(PollState::default()),
        }
    }

    pub fn api(&self) -> &Arc<TelegramApi> {
        &self.api
    }

    pub fn transport(&self) -> TelegramTransport {
        TelegramTransport::new(self.api.clone())
    }

    /// Verify the token and start polling into `sender`.
    pub async fn start(&self, sender: mpsc::Sender<InboundUpdate>) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if state.poll_handle.is_some() {
            bail!("Telegram polling is already running");
        }

        let bot = self
            .api
            .get_me()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to authenticate Telegram bot: {e}"))?;
        info!(
            bot_username = bot.username.as_deref().unwrap_or("unknown"),
            "Telegram bot authenticated"
        );

        let cancel = CancellationToken::new();
        let cancel_child = cancel.child_token();
        let api = self.api.clone();
        let handle = tokio::spawn(async move {
            polling::run_polling_loop(&api, sender, cancel_child).await;
        });

        state.cancel = Some(cancel);
        state.poll_handle = Some(handle);
        Ok(())
    }

    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        if let Some(handle) = state.poll_handle.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use classbell_cron::InlineAction;

    fn api_error(description: &str) -> anyhow::Error {
        ApiError {
            method: "sendMessage",
            code: Some(400),
            description: description.into(),
        }
        .into()
    }

    #[test]
    fn test_classify_topic_errors() {
        assert!(matches!(
            classify(&api_error("Bad Request: message thread not found")),
            SendError::TopicNotFound(_)
        ));
        assert!(matches!(
            classify(&api_error("Bad Request: TOPIC_CLOSED")),
            SendError::TopicNotFound(_)
        ));
    }

    #[test]
    fn test_classify_formatting_and_other() {
        assert!(matches!(
            classify(&api_error(
                "Bad Request: can't parse entities: Unsupported start tag \"marquee\""
            )),
            SendError::Formatting(_)
        ));
        assert!(matches!(
            classify(&api_error("Forbidden: bot was kicked from the supergroup chat")),
            SendError::Other(_)
        ));
        assert!(matches!(
            classify(&anyhow::anyhow!("sendMessage request failed")),
            SendError::Other(_)
        ));
    }

    #[test]
    fn test_send_params_mapping() {
        let request = SendRequest {
            chat_id: -100,
            topic_id: Some(8),
            text: "hi".into(),
            format: TextFormat::Plain,
            actions: vec![InlineAction {
                label: "🙋 I am Present".into(),
                data: "att:1".into(),
            }],
        };
        let params = send_params(&request);
        assert_eq!(params.message_thread_id, Some(8));
        assert!(params.parse_mode.is_none());
        let markup = params.reply_markup.unwrap();
        assert_eq!(markup.inline_keyboard[0][0].callback_data, "att:1");
    }
}
