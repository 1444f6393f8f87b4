use anyhow::Context;
use calendar_digest::calendar::templating::DigestRenderer;
use calendar_digest::calendar::{Calendar, EventsByDay, GoogleCalendarEventSource, TimeWindow};
use calendar_digest::delivery::{
    ChannelFlags, DeliveryPlan, Dispatcher, SmtpMailer, SystemBrowser,
};
use calendar_digest::{parse_time_zone, AppConfig, Error};
use chrono::Utc;
use clap::Parser;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Calendar to fetch events from [default: DIGEST_CALENDAR__ID]
    #[arg(long, value_name = "ID")]
    calendar_id: Option<String>,

    /// Number of days ahead to fetch events for
    #[arg(long, default_value_t = 7)]
    days: u32,

    /// Subject line for the email [default: DIGEST_EMAIL__SUBJECT]
    #[arg(long)]
    subject: Option<String>,

    /// Comma-separated list of recipient email addresses [default: DIGEST_EMAIL__RECIPIENTS]
    #[arg(long, visible_alias = "to", value_name = "EMAILS")]
    recipient_emails: Option<String>,

    /// Include the current day in the window
    #[arg(long)]
    include_today: bool,

    /// Send the digest by email
    #[arg(long)]
    email: bool,

    /// View the digest in the web browser
    #[arg(long)]
    web: bool,

    /// With --email, build the message but do not send it
    #[arg(long)]
    dry_run: bool,

    /// Time zone events are displayed in [default: DIGEST_CALENDAR__TIME_ZONE]
    #[arg(long, value_name = "TZ")]
    time_zone: Option<String>,

    /// Path to the template directory [default: DIGEST_TEMPLATE_DIR]
    #[arg(long, value_name = "DIR")]
    template_dir: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");

            let usage = err
                .downcast_ref::<Error>()
                .map_or(false, Error::is_usage);

            if usage {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    // Validate everything we can before doing any I/O.
    let time_zone = match &cli.time_zone {
        Some(name) => parse_time_zone(name)?,
        None => config.time_zone()?,
    };

    let subject = cli.subject.as_deref().unwrap_or(&config.email.subject);
    let recipients = cli
        .recipient_emails
        .as_deref()
        .or(config.email.recipients.as_deref());

    let plan = DeliveryPlan::resolve(
        ChannelFlags {
            email: cli.email,
            web: cli.web,
            dry_run: cli.dry_run,
        },
        subject,
        recipients,
        &config.email,
    )?;

    let calendar_id = cli
        .calendar_id
        .or_else(|| config.calendar.id.clone())
        .ok_or(Error::MissingCalendarId)?;

    let template_dir = cli.template_dir.unwrap_or_else(|| config.template_dir.clone());
    let renderer = DigestRenderer::from_path(&template_dir);

    let window = TimeWindow::new(
        Utc::now().with_timezone(&time_zone),
        cli.days,
        cli.include_today,
    )?;

    let events_by_day = if window.is_empty() {
        log::info!("time window is empty, not fetching events");
        EventsByDay::default()
    } else {
        let event_source = GoogleCalendarEventSource::new(&calendar_id)
            .await
            .context("failed to fetch calendar events")?;
        Calendar::new(event_source)
            .get_events_by_day(&window)
            .await
            .context("failed to fetch calendar events")?
    };

    let html = renderer
        .render(subject, &events_by_day)
        .with_context(|| format!("failed to render digest from {}", template_dir.display()))?;

    let stdout = io::stdout();
    Dispatcher::new(stdout.lock(), SystemBrowser, SmtpMailer::from_config(&config.email))
        .dispatch(&plan, &events_by_day, &html)
        .context("failed to deliver digest")?;

    Ok(())
}
