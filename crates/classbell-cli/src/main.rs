mod app;
mod bot;
mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use classbell_channel_telegram::TelegramBot;
use classbell_config::ClassBellConfig;
use classbell_cron::backup;
use classbell_cron::delivery::strip_markup;

use crate::app::App;
use crate::commands::{ScheduleArgs, format_agenda, format_status};

#[derive(Parser)]
#[command(name = "classbell", about = "Class announcement bot for Telegram groups")]
struct Cli {
    /// Config file (defaults to ~/.classbell/config.json5)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot: restore scheduled classes and poll Telegram
    Run,
    /// Print the whole stored document as JSON
    Export {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Replace the stored document with a previous export
    Import {
        file: PathBuf,
    },
    /// Add weekly classes for the linked group
    Schedule {
        #[arg(long)]
        batch: String,
        #[arg(long)]
        subject: String,
        /// Comma separated weekdays, e.g. "mon,wed"
        #[arg(long)]
        days: String,
        /// First date (YYYY-MM-DD)
        #[arg(long)]
        start: String,
        /// Last date (YYYY-MM-DD); without it each weekday fires once
        #[arg(long)]
        end: Option<String>,
        /// Class start time, "HH:MM"
        #[arg(long)]
        time: String,
        /// Minutes to announce before the class starts
        #[arg(long, default_value_t = 0)]
        offset: u32,
        #[arg(long)]
        link: Option<String>,
        #[arg(long)]
        topic: Option<i64>,
        /// Fixed announcement text instead of an AI-written one
        #[arg(long)]
        manual: Option<String>,
    },
    /// Show the linked group and the pending classes
    Status,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ClassBellConfig> {
    Ok(match path {
        Some(path) => classbell_config::load_config_at(path)?,
        None => classbell_config::load_config()?,
    })
}

async fn offline_app(config: Option<&PathBuf>) -> anyhow::Result<App> {
    App::offline(load_config(config)?).await
}

async fn run_bot(config: Option<&PathBuf>) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let Some(token) = config.telegram.bot_token.clone() else {
        bail!("No bot token configured (set BOT_TOKEN or telegram.bot_token)");
    };

    let bot = TelegramBot::new(&token);
    let app = Arc::new(App::build(config, Arc::new(bot.transport())).await?);
    app.start().await?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            ctrl_c.cancel();
        }
    });

    bot::run(app.clone(), bot, cancel).await?;
    app.close().await
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config.as_ref();
    let rt = tokio::runtime::Runtime::new()?;

    match cli.command {
        Commands::Run => rt.block_on(run_bot(config))?,
        Commands::Export { out } => rt.block_on(async {
            let app = offline_app(config).await?;
            let json = backup::export(app.service.db()).await?;
            app.close().await?;
            match out {
                Some(path) => std::fs::write(&path, json)
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => println!("{json}"),
            }
            anyhow::Ok(())
        })?,
        Commands::Import { file } => rt.block_on(async {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let app = offline_app(config).await?;
            let report = backup::import(&app.service, &raw, Utc::now()).await?;
            app.close().await?;
            println!(
                "Imported: {} classes pending, {} past due dropped, {} malformed dropped",
                report.recovery.restored,
                report.recovery.discarded,
                report.rejected + report.recovery.skipped
            );
            anyhow::Ok(())
        })?,
        Commands::Schedule {
            batch,
            subject,
            days,
            start,
            end,
            time,
            offset,
            link,
            topic,
            manual,
        } => rt.block_on(async {
            let spec = ScheduleArgs {
                batch: &batch,
                subject: &subject,
                days: &days,
                start: &start,
                end: end.as_deref(),
                time: &time,
                offset,
                link: link.as_deref(),
                manual: manual.as_deref(),
                topic,
            }
            .into_spec()?;
            let app = offline_app(config).await?;
            let scheduled = app.service.schedule(&spec, Utc::now()).await?;
            app.close().await?;
            println!(
                "Scheduled {} classes. Restart a running bot to pick them up.",
                scheduled.len()
            );
            anyhow::Ok(())
        })?,
        Commands::Status => rt.block_on(async {
            let app = offline_app(config).await?;
            let tz = app.service.scheduler().timezone();
            let status = app.service.status().await;
            println!("{}", strip_markup(&format_status(&status, tz)));
            println!();
            println!("{}", strip_markup(&format_agenda(&app.service.agenda().await, tz, 50)));
            app.close().await
        })?,
    }

    Ok(())
}
