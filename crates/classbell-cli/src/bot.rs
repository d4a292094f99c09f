//! Chat command router for the Telegram bot.

use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use classbell_channel_telegram::api::TelegramApi;
use classbell_channel_telegram::polling::{InboundUpdate, Origin};
use classbell_channel_telegram::types::{
    AnswerCallbackQueryParams, BotCommand, EditMessageTextParams, SendMessageParams,
    SetMyCommandsParams,
};
use classbell_channel_telegram::TelegramBot;
use classbell_cron::attendance::MarkOutcome;
use classbell_cron::bulk_edit::{EditField, EditScope};
use classbell_cron::delivery::{ATTENDANCE_ACTION_PREFIX, escape_html, strip_markup};
use classbell_types::Target;

use crate::app::App;
use crate::commands::{
    format_agenda, format_attendance, format_status, is_admin, parse_schedule_command,
    split_edit_command, truncate_chars,
};

const HELP: &str = "🔔 <b>ClassBell</b>\n\
/start - link this group (admins, in the group)\n\
/schedule - add weekly classes\n\
/agenda - list scheduled classes\n\
/cancel &lt;id&gt; - remove one class\n\
/edit - change a class, its weekday or the whole subject\n\
/subject &lt;batch&gt; &lt;name&gt; - register a subject\n\
/ask &lt;prompt&gt; - ask the AI\n\
/attendance - recent attendance\n\
/status - bot status\n\
/feedback &lt;text&gt; - send feedback\n\
Send a timetable photo to import it.";

const AGENDA_LIMIT: usize = 25;
const ATTENDANCE_LIMIT: usize = 5;
/// Telegram rejects messages over 4096 characters.
const AI_REPLY_LIMIT: usize = 4000;

fn bot_commands() -> Vec<BotCommand> {
    [
        ("start", "Link this group"),
        ("schedule", "Add weekly classes"),
        ("agenda", "List scheduled classes"),
        ("cancel", "Remove a class"),
        ("edit", "Edit classes"),
        ("subject", "Register a subject"),
        ("ask", "Ask the AI"),
        ("attendance", "Recent attendance"),
        ("status", "Bot status"),
        ("feedback", "Send feedback"),
    ]
    .into_iter()
    .map(|(command, description)| BotCommand {
        command: command.into(),
        description: description.into(),
    })
    .collect()
}

pub struct Router {
    app: Arc<App>,
    api: Arc<TelegramApi>,
}

impl Router {
    pub fn new(app: Arc<App>, api: Arc<TelegramApi>) -> Self {
        Self { app, api }
    }

    async fn reply(&self, origin: &Origin, text: impl Into<String>) -> Result<i64> {
        let mut params = SendMessageParams::html(origin.chat_id, text);
        params.message_thread_id = origin.thread_id;
        Ok(self.api.send_message(&params).await?.message_id)
    }

    async fn admin(&self, origin: &Origin) -> bool {
        let stored = self.app.service.db().read(|doc| doc.admins.clone()).await;
        is_admin(
            &self.app.config.telegram.admins,
            &stored,
            origin.username.as_deref(),
        )
    }

    async fn require_admin(&self, origin: &Origin) -> Result<()> {
        if !self.admin(origin).await {
            bail!("admins only");
        }
        Ok(())
    }

    pub async fn handle(&self, update: InboundUpdate) {
        let origin = update.origin().clone();
        let result = match update {
            InboundUpdate::Command { origin, name, args } => {
                self.command(&origin, &name, &args).await
            }
            InboundUpdate::Photo {
                origin, file_id, ..
            } => self.timetable_photo(&origin, &file_id).await,
            InboundUpdate::Callback {
                origin,
                query_id,
                data,
            } => self.callback(&origin, &query_id, &data).await,
            InboundUpdate::AddedToGroup { origin } => self.joined_group(&origin).await,
            InboundUpdate::Text { .. } => Ok(()),
        };

        if let Err(e) = result {
            debug!(chat_id = origin.chat_id, "Command failed: {e:#}");
            if let Err(e) = self
                .reply(&origin, format!("⚠️ {}", escape_html(&e.to_string())))
                .await
            {
                warn!("Failed to send error reply: {e:#}");
            }
        }
    }

    async fn command(&self, origin: &Origin, name: &str, args: &str) -> Result<()> {
        let service = &self.app.service;
        let tz = service.scheduler().timezone();
        let now = Utc::now();

        match name {
            "start" if origin.is_group() => {
                self.require_admin(origin).await?;
                let title = origin.chat_title.clone().unwrap_or_default();
                let moved = service
                    .link_group(Target::group(origin.chat_id), &title)
                    .await?;
                self.reply(
                    origin,
                    format!("✅ Announcements will be posted here. {moved} pending classes moved."),
                )
                .await?;
            }
            "start" | "help" => {
                self.reply(origin, HELP).await?;
            }
            "feedback" => {
                if args.is_empty() {
                    bail!("usage: /feedback <text>");
                }
                service.record_feedback(&origin.handle(), args, now).await?;
                self.reply(origin, "🙏 Thanks, feedback saved.").await?;
            }
            "schedule" => {
                self.require_admin(origin).await?;
                let topic = origin.thread_id.filter(|_| origin.is_group());
                let spec = parse_schedule_command(args, topic)?;
                let scheduled = service.schedule(&spec, now).await?;
                self.reply(
                    origin,
                    format!(
                        "✅ Scheduled {} classes of {} {}.",
                        scheduled.len(),
                        escape_html(&spec.batch_id),
                        escape_html(&spec.subject_id)
                    ),
                )
                .await?;
            }
            "agenda" => {
                self.require_admin(origin).await?;
                let agenda = service.agenda().await;
                self.reply(origin, format_agenda(&agenda, tz, AGENDA_LIMIT))
                    .await?;
            }
            "cancel" | "delete" => {
                self.require_admin(origin).await?;
                if args.is_empty() {
                    bail!("usage: /cancel <id>");
                }
                let text = if service.cancel(args).await? {
                    "🗑 Class removed."
                } else {
                    "Nothing scheduled with that id."
                };
                self.reply(origin, text).await?;
            }
            "edit" => {
                self.require_admin(origin).await?;
                let (id, scope, field, value) = split_edit_command(args)?;
                let scope: EditScope = scope.parse()?;
                let field = EditField::parse(field, value)?;
                let resolver = service.bulk_edit();
                let matched = resolver.resolve(scope, id).await?;
                let report = resolver.apply(matched, &field, now).await;

                let mut text = format!("✏️ Updated {} classes.", report.applied.len());
                for (id, e) in &report.failures {
                    text.push_str(&format!("\n• <code>{id}</code>: {}", escape_html(&e.to_string())));
                }
                self.reply(origin, text).await?;
            }
            "subject" => {
                self.require_admin(origin).await?;
                let Some((batch, name)) = args
                    .split_once(char::is_whitespace)
                    .map(|(b, n)| (b, n.trim()))
                    .filter(|(_, n)| !n.is_empty())
                else {
                    bail!("usage: /subject <batch> <name>");
                };
                let text = if service.add_subject(batch, name).await? {
                    format!("✅ Added <b>{}</b> to {}.", escape_html(name), escape_html(batch))
                } else {
                    format!("{} already has {}.", escape_html(batch), escape_html(name))
                };
                self.reply(origin, text).await?;
            }
            "ask" => {
                self.require_admin(origin).await?;
                if args.is_empty() {
                    bail!("usage: /ask <prompt>");
                }
                self.ask(origin, args).await?;
            }
            "attendance" => {
                self.require_admin(origin).await?;
                let sheets = service.attendance().recent(ATTENDANCE_LIMIT).await;
                self.reply(origin, format_attendance(&sheets, tz)).await?;
            }
            "status" => {
                self.require_admin(origin).await?;
                let status = service.status().await;
                self.reply(origin, format_status(&status, tz)).await?;
            }
            other => {
                debug!(command = other, "Ignoring unknown command");
            }
        }
        Ok(())
    }

    async fn callback(&self, origin: &Origin, query_id: &str, data: &str) -> Result<()> {
        let Some(occurrence_id) = data.strip_prefix(ATTENDANCE_ACTION_PREFIX) else {
            debug!(data, "Ignoring unknown callback");
            return Ok(());
        };
        let outcome = self
            .app
            .service
            .attendance()
            .mark(occurrence_id, &origin.handle(), Utc::now())
            .await?;
        let text = match outcome {
            MarkOutcome::Marked { total } => format!("✅ Marked present ({total})"),
            MarkOutcome::AlreadyMarked => "You are already marked present".to_string(),
        };
        self.api
            .answer_callback_query(&AnswerCallbackQueryParams {
                callback_query_id: query_id.to_string(),
                text: Some(text),
                show_alert: false,
            })
            .await
    }

    /// Link the group the bot was just added to, if an admin added it.
    async fn joined_group(&self, origin: &Origin) -> Result<()> {
        if !self.admin(origin).await {
            info!(chat_id = origin.chat_id, "Added to a group by a non-admin, not linking");
            return Ok(());
        }
        let title = origin.chat_title.clone().unwrap_or_default();
        let moved = self
            .app
            .service
            .link_group(Target::group(origin.chat_id), &title)
            .await?;
        self.reply(
            origin,
            format!(
                "🤖 <b>ClassBell connected</b>\nID: <code>{}</code>\n{moved} pending classes moved here.",
                origin.chat_id
            ),
        )
        .await?;
        Ok(())
    }

    async fn ask(&self, origin: &Origin, prompt: &str) -> Result<()> {
        let Some(gemini) = &self.app.gemini else {
            bail!("/ask needs a Gemini API key");
        };
        let status_id = self.reply(origin, "🤔 Thinking…").await?;
        if let Err(e) = self.app.service.record_ai_request().await {
            warn!("Failed to count AI request: {e}");
        }
        let answer = gemini.generate_text(prompt).await?;
        let answer = truncate_chars(answer.trim(), AI_REPLY_LIMIT);

        let mut params = EditMessageTextParams {
            chat_id: origin.chat_id,
            message_id: status_id,
            text: answer,
            parse_mode: Some("HTML".into()),
        };
        if let Err(e) = self.api.edit_message_text(&params).await {
            debug!("AI reply rejected as HTML, sending plain: {e:#}");
            params.text = strip_markup(&params.text);
            params.parse_mode = None;
            self.api.edit_message_text(&params).await?;
        }
        Ok(())
    }

    async fn timetable_photo(&self, origin: &Origin, file_id: &str) -> Result<()> {
        if !self.admin(origin).await {
            return Ok(());
        }
        let Some(gemini) = &self.app.gemini else {
            bail!("timetable import needs a Gemini API key");
        };

        let status_id = self.reply(origin, "🔍 Reading timetable…").await?;
        let image = self.api.download_file(file_id).await?;
        if let Err(e) = self.app.service.record_ai_request().await {
            warn!("Failed to count AI request: {e}");
        }
        let entries = gemini.extract_timetable(&image, "image/jpeg").await?;
        let report = self
            .app
            .service
            .import_timetable(&entries, Utc::now())
            .await?;
        info!(
            scheduled = report.scheduled,
            skipped = report.skipped,
            "Timetable imported"
        );

        self.api
            .edit_message_text(&EditMessageTextParams {
                chat_id: origin.chat_id,
                message_id: status_id,
                text: format!(
                    "✅ Timetable imported: {} classes scheduled, {} rows skipped.",
                    report.scheduled, report.skipped
                ),
                parse_mode: None,
            })
            .await
    }
}

/// Poll Telegram and route updates until `cancel` fires.
pub async fn run(app: Arc<App>, bot: TelegramBot, cancel: CancellationToken) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(64);
    bot.start(tx).await?;
    if let Err(e) = bot
        .api()
        .set_my_commands(&SetMyCommandsParams {
            commands: bot_commands(),
        })
        .await
    {
        warn!("Failed to register bot commands: {e:#}");
    }

    let router = Arc::new(Router::new(app, bot.api().clone()));
    info!("ClassBell is running");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            update = rx.recv() => {
                let Some(update) = update else { break };
                let router = router.clone();
                tokio::spawn(async move { router.handle(update).await });
            }
        }
    }

    bot.stop().await;
    Ok(())
}
