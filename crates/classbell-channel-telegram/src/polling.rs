//! Telegram long-polling loop.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::TelegramApi;
use crate::types::{Chat, GetUpdatesParams, TgMessage, Update, User};

/// Who sent an update and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub chat_id: i64,
    pub chat_type: String,
    pub chat_title: Option<String>,
    pub thread_id: Option<i64>,
    pub user_id: i64,
    pub username: Option<String>,
    pub display_name: String,
}

impl Origin {
    pub fn is_group(&self) -> bool {
        matches!(self.chat_type.as_str(), "group" | "supergroup")
    }

    /// Username if set, otherwise the display name.
    pub fn handle(&self) -> String {
        self.username
            .clone()
            .unwrap_or_else(|| self.display_name.clone())
    }
}

/// Updates the bot reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundUpdate {
    /// `/name args`, with any `@botname` suffix removed.
    Command {
        origin: Origin,
        name: String,
        args: String,
    },
    Text {
        origin: Origin,
        text: String,
    },
    /// Largest available size of a photo.
    Photo {
        origin: Origin,
        message_id: i64,
        file_id: String,
    },
    Callback {
        origin: Origin,
        query_id: String,
        data: String,
    },
    /// The bot joined a group; `origin` names the user who added it.
    AddedToGroup { origin: Origin },
}

impl InboundUpdate {
    pub fn origin(&self) -> &Origin {
        match self {
            Self::Command { origin, .. }
            | Self::Text { origin, .. }
            | Self::Photo { origin, .. }
            | Self::Callback { origin, .. }
            | Self::AddedToGroup { origin } => origin,
        }
    }
}

fn chat_origin(chat: &Chat, thread_id: Option<i64>, from: Option<&User>) -> Origin {
    Origin {
        chat_id: chat.id,
        chat_type: chat.chat_type.clone(),
        chat_title: chat.title.clone(),
        thread_id,
        user_id: from.map(|u| u.id).unwrap_or(chat.id),
        username: from.and_then(|u| u.username.clone()),
        display_name: from.map(|u| u.display_name()).unwrap_or_default(),
    }
}

fn origin(msg: &TgMessage, from: Option<&User>) -> Origin {
    chat_origin(&msg.chat, msg.message_thread_id, from)
}

/// Convert a raw update; anything the bot does not handle yields `None`.
pub fn convert_update(update: Update) -> Option<InboundUpdate> {
    if let Some(member) = update.my_chat_member {
        let joined = member.new_chat_member.is_present() && !member.old_chat_member.is_present();
        let origin = chat_origin(&member.chat, None, Some(&member.from));
        return (joined && origin.is_group()).then_some(InboundUpdate::AddedToGroup { origin });
    }

    if let Some(cb) = update.callback_query {
        let msg = cb.message?;
        return Some(InboundUpdate::Callback {
            origin: origin(&msg, Some(&cb.from)),
            query_id: cb.id,
            data: cb.data?,
        });
    }

    let msg = update.message?;
    let from = msg.from.as_ref();
    let origin = origin(&msg, from);

    if let Some(largest) = msg.photo.iter().max_by_key(|p| p.width * p.height) {
        return Some(InboundUpdate::Photo {
            origin,
            message_id: msg.message_id,
            file_id: largest.file_id.clone(),
        });
    }

    let text = msg.text.clone()?;
    // Detect bot commands (entity type "bot_command" at offset 0)
    let is_command = msg
        .entities
        .iter()
        .any(|e| e.entity_type == "bot_command" && e.offset == 0);
    if is_command {
        let (head, args) = text
            .split_once(char::is_whitespace)
            .unwrap_or((text.as_str(), ""));
        let name = head
            .trim_start_matches('/')
            .split('@')
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        return Some(InboundUpdate::Command {
            origin,
            name,
            args: args.trim().to_string(),
        });
    }
    Some(InboundUpdate::Text { origin, text })
}

/// Run the long-polling loop, forwarding converted updates to `sender`.
///
/// Exits when `cancel` is cancelled or the `sender` is closed.
pub async fn run_polling_loop(
    api: &TelegramApi,
    sender: mpsc::Sender<InboundUpdate>,
    cancel: CancellationToken,
) {
    let mut offset: Option<i64> = None;
    let mut backoff = Duration::from_secs(1);
    let max_backoff = Duration::from_secs(30);

    info!("Telegram polling loop started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let params = GetUpdatesParams {
            offset,
            timeout: Some(30),
            allowed_updates: Some(vec![
                "message".into(),
                "callback_query".into(),
                "my_chat_member".into(),
            ]),
        };

        let updates = tokio::select! {
            _ = cancel.cancelled() => break,
            result = api.get_updates(&params) => result,
        };

        match updates {
            Ok(updates) => {
                backoff = Duration::from_secs(1);

                for update in updates {
                    offset = Some(update.update_id + 1);
                    let update_id = update.update_id;
                    let Some(inbound) = convert_update(update) else {
                        continue;
                    };

                    debug!(update_id, "Forwarding Telegram update");
                    if sender.send(inbound).await.is_err() {
                        info!("Inbound channel closed, stopping polling");
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(backoff_secs = backoff.as_secs(), "getUpdates error: {e}");

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {},
                }

                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }

    info!("Telegram polling loop stopped");
}
