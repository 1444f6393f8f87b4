//! Delivery of the rendered digest through exactly one channel.
//!
//! The channel is resolved from the command line flags by [`DeliveryPlan::resolve`] before any
//! I/O happens. The [`Dispatcher`] then executes the plan using its sinks: a console writer, a
//! [`Browser`] for the web preview and a [`Mailer`] for email.

use crate::calendar::templating::format_day;
use crate::calendar::EventsByDay;
use crate::{EmailConfig, Error, Result};
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Output channel selected for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Print a summary to standard output.
    Console,
    /// Open the rendered digest in the default browser.
    Web,
    /// Send the digest by email.
    Email,
    /// Build the email but only print what would have been sent.
    DryRunEmail,
}

/// Channel related command line flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelFlags {
    pub email: bool,
    pub web: bool,
    pub dry_run: bool,
}

impl Channel {
    /// Resolves the channel from the raw flags. Selecting both email and web is an error.
    pub fn resolve(flags: ChannelFlags) -> Result<Channel> {
        let channel = match flags {
            ChannelFlags {
                email: true,
                web: true,
                ..
            } => return Err(Error::ConflictingChannels),
            ChannelFlags { web: true, .. } => Channel::Web,
            ChannelFlags {
                email: true,
                dry_run: true,
                ..
            } => Channel::DryRunEmail,
            ChannelFlags { email: true, .. } => Channel::Email,
            _ => Channel::Console,
        };

        if flags.dry_run && !matches!(channel, Channel::DryRunEmail) {
            log::warn!("--dry-run only applies to --email, ignoring it");
        }

        Ok(channel)
    }
}

/// Splits a comma-separated address list, trimming whitespace around each address and dropping
/// empty entries. Order is preserved.
pub fn parse_recipients(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|address| !address.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Everything needed to build the digest email, validated up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailRequest {
    pub subject: String,
    pub from: Mailbox,
    pub to: Vec<Mailbox>,
}

impl EmailRequest {
    /// Validates the sender and the comma-separated recipient list.
    pub fn new(subject: &str, from: Option<&str>, recipients: Option<&str>) -> Result<EmailRequest> {
        let to = parse_recipients(recipients.unwrap_or_default());
        if to.is_empty() {
            return Err(Error::MissingRecipients);
        }

        let from: Mailbox = from.ok_or(Error::MissingSender)?.parse()?;
        let to = to
            .iter()
            .map(|address| address.parse::<Mailbox>())
            .collect::<Result<Vec<Mailbox>, _>>()?;

        Ok(EmailRequest {
            subject: subject.to_owned(),
            from,
            to,
        })
    }

    /// Builds a multipart message with the digest as HTML alternative.
    pub fn message(&self, html: &str) -> Result<Message> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(self.subject.clone());

        for to in &self.to {
            builder = builder.to(to.clone());
        }

        let message = builder.multipart(
            MultiPart::alternative().singlepart(SinglePart::html(html.to_owned())),
        )?;

        Ok(message)
    }

    /// The recipients joined for display, e.g. `a@x.com, b@y.com`.
    pub fn recipients(&self) -> String {
        self.to
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// A resolved delivery. Exactly one channel is active per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryPlan {
    Console,
    Web,
    Email {
        request: EmailRequest,
        dry_run: bool,
    },
}

impl DeliveryPlan {
    /// Resolves the channel from the flags and validates the email parameters if email delivery
    /// was requested. The sender and the SMTP credentials come from `email`, credentials are only
    /// required when the message is actually sent. Performs no I/O.
    pub fn resolve(
        flags: ChannelFlags,
        subject: &str,
        recipients: Option<&str>,
        email: &EmailConfig,
    ) -> Result<DeliveryPlan> {
        let plan = match Channel::resolve(flags)? {
            Channel::Console => DeliveryPlan::Console,
            Channel::Web => DeliveryPlan::Web,
            channel @ (Channel::Email | Channel::DryRunEmail) => {
                let request = EmailRequest::new(subject, email.sender(), recipients)?;
                let dry_run = channel == Channel::DryRunEmail;

                if !dry_run {
                    email.credentials()?;
                }

                DeliveryPlan::Email { request, dry_run }
            }
        };

        Ok(plan)
    }

    pub fn channel(&self) -> Channel {
        match self {
            DeliveryPlan::Console => Channel::Console,
            DeliveryPlan::Web => Channel::Web,
            DeliveryPlan::Email { dry_run: false, .. } => Channel::Email,
            DeliveryPlan::Email { dry_run: true, .. } => Channel::DryRunEmail,
        }
    }
}

/// Opens files in a browser.
pub trait Browser {
    fn open(&self, path: &Path) -> io::Result<()>;
}

/// Opens files with the user's default browser.
pub struct SystemBrowser;

impl Browser for SystemBrowser {
    fn open(&self, path: &Path) -> io::Result<()> {
        open::that(path)
    }
}

/// Submits email messages.
pub trait Mailer {
    fn send(&self, message: &Message) -> Result<()>;
}

/// Sends mail through an authenticated SMTP server over implicit TLS. The connection is opened
/// for each message and closed once it has been submitted.
pub struct SmtpMailer {
    host: String,
    port: u16,
    credentials: Option<Credentials>,
}

impl SmtpMailer {
    pub fn from_config(config: &EmailConfig) -> SmtpMailer {
        SmtpMailer {
            host: config.host.clone(),
            port: config.port,
            credentials: config.credentials().ok(),
        }
    }
}

impl Mailer for SmtpMailer {
    fn send(&self, message: &Message) -> Result<()> {
        let credentials = self
            .credentials
            .clone()
            .ok_or(Error::MissingCredentials)?;

        log::info!("connecting to {}:{}", self.host, self.port);

        SmtpTransport::relay(&self.host)?
            .port(self.port)
            .credentials(credentials)
            .build()
            .send(message)?;

        Ok(())
    }
}

/// What a dispatch did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivered {
    Console,
    /// The digest was written to this file and opened in the browser.
    Web(PathBuf),
    Email,
    DryRun,
}

/// Executes a [`DeliveryPlan`].
pub struct Dispatcher<W, B, M> {
    console: W,
    browser: B,
    mailer: M,
    preview_dir: Option<PathBuf>,
}

impl<W, B, M> Dispatcher<W, B, M>
where
    W: Write,
    B: Browser,
    M: Mailer,
{
    pub fn new(console: W, browser: B, mailer: M) -> Self {
        Dispatcher {
            console,
            browser,
            mailer,
            preview_dir: None,
        }
    }

    /// Writes web previews into `dir` instead of the system temp directory.
    pub fn with_preview_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.preview_dir = Some(dir.into());
        self
    }

    pub fn dispatch(
        &mut self,
        plan: &DeliveryPlan,
        events_by_day: &EventsByDay,
        html: &str,
    ) -> Result<Delivered> {
        log::info!("delivering digest via {:?}", plan.channel());

        match plan {
            DeliveryPlan::Console => {
                self.print_summary(events_by_day)?;
                Ok(Delivered::Console)
            }
            DeliveryPlan::Web => {
                let path = self.write_preview(html)?;
                log::info!("wrote digest preview to {}", path.display());
                self.browser.open(&path).map_err(Error::Browser)?;
                Ok(Delivered::Web(path))
            }
            DeliveryPlan::Email {
                request,
                dry_run: false,
            } => {
                let message = request.message(html)?;
                self.mailer.send(&message)?;
                log::info!("sent digest to {}", request.recipients());
                Ok(Delivered::Email)
            }
            DeliveryPlan::Email {
                request,
                dry_run: true,
            } => {
                // Built for validation only, nothing is sent.
                request.message(html)?;
                self.print_dry_run(request)?;
                Ok(Delivered::DryRun)
            }
        }
    }

    /// Prints each day with its all-day events followed by its timed events.
    fn print_summary(&mut self, events_by_day: &EventsByDay) -> Result<()> {
        for (i, date) in events_by_day.dates().iter().enumerate() {
            if i > 0 {
                writeln!(self.console)?;
            }

            writeln!(self.console, "{}", format_day(date))?;

            for event in events_by_day.all_day_on(date) {
                writeln!(self.console, "  [all day] {}", event.summary)?;
            }

            for event in events_by_day.timed_on(date) {
                writeln!(
                    self.console,
                    "  {} {}",
                    event.start.format("%H:%M"),
                    event.summary
                )?;
            }
        }

        self.console.flush()?;

        Ok(())
    }

    fn print_dry_run(&mut self, request: &EmailRequest) -> Result<()> {
        writeln!(self.console, "Dry run, no email was sent.")?;
        writeln!(self.console, "Subject: {}", request.subject)?;
        writeln!(self.console, "From: {}", request.from)?;
        writeln!(self.console, "To: {}", request.recipients())?;
        self.console.flush()?;

        Ok(())
    }

    /// Writes the digest to a new temporary file that outlives this process.
    fn write_preview(&self, html: &str) -> Result<PathBuf> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("calendar-digest-").suffix(".html");

        let mut file = match &self.preview_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };

        file.write_all(html.as_bytes())?;
        file.flush()?;

        let (_, path) = file.keep().map_err(|err| Error::Io(err.error))?;

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{
        normalize, Calendar, CalendarEvent, EventTime, StaticEventSource, TimeWindow,
    };
    use crate::calendar::templating::DigestRenderer;
    use chrono::{NaiveDate, TimeZone, Utc};
    use chrono_tz::America::New_York;
    use std::cell::RefCell;

    const HTML: &str = "<html><body>digest</body></html>";

    /// Records opened paths instead of launching a browser.
    #[derive(Default)]
    struct RecordingBrowser(RefCell<Vec<PathBuf>>);

    impl Browser for &RecordingBrowser {
        fn open(&self, path: &Path) -> io::Result<()> {
            self.0.borrow_mut().push(path.to_owned());
            Ok(())
        }
    }

    /// Records sent messages instead of connecting to a server.
    #[derive(Default)]
    struct RecordingMailer(RefCell<Vec<Message>>);

    impl Mailer for &RecordingMailer {
        fn send(&self, message: &Message) -> Result<()> {
            self.0.borrow_mut().push(message.clone());
            Ok(())
        }
    }

    struct FailingMailer;

    impl Mailer for FailingMailer {
        fn send(&self, _message: &Message) -> Result<()> {
            Err(Error::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "535 authentication failed",
            )))
        }
    }

    fn flags(email: bool, web: bool, dry_run: bool) -> ChannelFlags {
        ChannelFlags {
            email,
            web,
            dry_run,
        }
    }

    fn email_config(
        username: Option<&str>,
        password: Option<&str>,
        from: Option<&str>,
    ) -> EmailConfig {
        EmailConfig {
            host: "smtp.example.com".into(),
            port: 465,
            username: username.map(Into::into),
            password: password.map(Into::into),
            from: from.map(Into::into),
            subject: "Weekly Calendar Events".into(),
            recipients: None,
        }
    }

    fn sender_only() -> EmailConfig {
        email_config(Some("me@x.com"), Some("hunter2"), None)
    }

    fn email_plan(dry_run: bool) -> DeliveryPlan {
        DeliveryPlan::resolve(
            flags(true, false, dry_run),
            "Weekly Calendar Events",
            Some("a@x.com, b@y.com"),
            &email_config(Some("me@x.com"), Some("hunter2"), Some("digest@example.com")),
        )
        .unwrap()
    }

    fn header(message: &Message, name: &str) -> Option<String> {
        message.headers().get_raw(name).map(str::to_owned)
    }

    #[test]
    fn channel_precedence() {
        use Channel::*;

        assert_eq!(Channel::resolve(flags(false, false, false)).unwrap(), Console);
        assert_eq!(Channel::resolve(flags(false, true, false)).unwrap(), Web);
        assert_eq!(Channel::resolve(flags(true, false, false)).unwrap(), Email);
        assert_eq!(Channel::resolve(flags(true, false, true)).unwrap(), DryRunEmail);
        assert_eq!(Channel::resolve(flags(false, false, true)).unwrap(), Console);
        assert_eq!(Channel::resolve(flags(false, true, true)).unwrap(), Web);
    }

    #[test]
    fn email_and_web_conflict() {
        for dry_run in [false, true] {
            assert!(matches!(
                Channel::resolve(flags(true, true, dry_run)),
                Err(Error::ConflictingChannels)
            ));
            assert!(matches!(
                DeliveryPlan::resolve(
                    flags(true, true, dry_run),
                    "subject",
                    Some("a@x.com"),
                    &sender_only(),
                ),
                Err(Error::ConflictingChannels)
            ));
        }
    }

    #[test]
    fn recipients() {
        assert_eq!(
            parse_recipients("a@x.com, b@y.com"),
            vec!["a@x.com", "b@y.com"]
        );
        assert_eq!(
            parse_recipients(" c@z.com ,a@x.com,,  "),
            vec!["c@z.com", "a@x.com"]
        );
        assert!(parse_recipients("").is_empty());
    }

    #[test]
    fn email_requires_recipients_and_sender() {
        let config = sender_only();

        assert!(matches!(
            DeliveryPlan::resolve(flags(true, false, false), "s", None, &config),
            Err(Error::MissingRecipients)
        ));
        assert!(matches!(
            DeliveryPlan::resolve(flags(true, false, true), "s", Some(" , "), &config),
            Err(Error::MissingRecipients)
        ));
        assert!(matches!(
            DeliveryPlan::resolve(
                flags(true, false, false),
                "s",
                Some("a@x.com"),
                &email_config(None, Some("hunter2"), None),
            ),
            Err(Error::MissingSender)
        ));
        assert!(matches!(
            DeliveryPlan::resolve(flags(true, false, false), "s", Some("nope"), &config),
            Err(Error::InvalidAddress(_))
        ));

        // Recipients are only required for email.
        assert_eq!(
            DeliveryPlan::resolve(
                flags(false, false, false),
                "s",
                None,
                &email_config(None, None, None),
            )
            .unwrap(),
            DeliveryPlan::Console
        );
    }

    #[test]
    fn real_send_requires_credentials() {
        let no_password = email_config(Some("me@x.com"), None, None);

        assert!(matches!(
            DeliveryPlan::resolve(flags(true, false, false), "s", Some("a@x.com"), &no_password),
            Err(Error::MissingCredentials)
        ));
        assert!(matches!(
            DeliveryPlan::resolve(
                flags(true, false, false),
                "s",
                Some("a@x.com"),
                &email_config(None, Some("hunter2"), Some("digest@example.com")),
            ),
            Err(Error::MissingCredentials)
        ));

        // A dry run never connects, so it does not need credentials.
        let plan =
            DeliveryPlan::resolve(flags(true, false, true), "s", Some("a@x.com"), &no_password)
                .unwrap();
        assert_eq!(plan.channel(), Channel::DryRunEmail);
    }

    #[test]
    fn smtp_mailer_refuses_unauthenticated_send() {
        let DeliveryPlan::Email { request, .. } = email_plan(false) else {
            panic!("expected email plan");
        };
        let message = request.message(HTML).unwrap();

        let mailer = SmtpMailer::from_config(&email_config(Some("me@x.com"), None, None));

        assert!(matches!(mailer.send(&message), Err(Error::MissingCredentials)));
    }

    #[test]
    fn email_message() {
        let DeliveryPlan::Email { request, .. } = email_plan(false) else {
            panic!("expected email plan");
        };
        let message = request.message(HTML).unwrap();

        assert_eq!(
            header(&message, "Subject").as_deref(),
            Some("Weekly Calendar Events")
        );
        assert_eq!(
            header(&message, "From").as_deref(),
            Some("digest@example.com")
        );
        assert_eq!(
            header(&message, "To").as_deref(),
            Some("a@x.com, b@y.com")
        );

        let to: Vec<String> = message
            .envelope()
            .to()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(to, vec!["a@x.com", "b@y.com"]);

        let formatted = String::from_utf8(message.formatted()).unwrap();
        assert!(formatted.contains("multipart/alternative"));
        assert!(formatted.contains("text/html"));
    }

    #[test]
    fn real_send_submits_message() {
        let browser = RecordingBrowser::default();
        let mailer = RecordingMailer::default();
        let mut console = Vec::new();

        let delivered = Dispatcher::new(&mut console, &browser, &mailer)
            .dispatch(&email_plan(false), &EventsByDay::default(), HTML)
            .unwrap();

        assert_eq!(delivered, Delivered::Email);
        assert_eq!(mailer.0.borrow().len(), 1);
        assert!(browser.0.borrow().is_empty());
        assert!(console.is_empty());
    }

    #[test]
    fn dry_run_never_sends() {
        let browser = RecordingBrowser::default();
        let mailer = RecordingMailer::default();
        let mut console = Vec::new();

        let plan = email_plan(true);
        let delivered = Dispatcher::new(&mut console, &browser, &mailer)
            .dispatch(&plan, &EventsByDay::default(), HTML)
            .unwrap();

        assert_eq!(delivered, Delivered::DryRun);
        assert!(mailer.0.borrow().is_empty());
        assert!(browser.0.borrow().is_empty());

        let output = String::from_utf8(console).unwrap();
        assert_eq!(
            output,
            "Dry run, no email was sent.\n\
             Subject: Weekly Calendar Events\n\
             From: digest@example.com\n\
             To: a@x.com, b@y.com\n"
        );
    }

    #[test]
    fn dry_run_describes_the_real_message() {
        let mailer = RecordingMailer::default();
        let mut console = Vec::new();

        Dispatcher::new(io::sink(), SystemBrowser, &mailer)
            .dispatch(&email_plan(false), &EventsByDay::default(), HTML)
            .unwrap();
        Dispatcher::new(&mut console, SystemBrowser, FailingMailer)
            .dispatch(&email_plan(true), &EventsByDay::default(), HTML)
            .unwrap();

        let sent = &mailer.0.borrow()[0];
        let output = String::from_utf8(console).unwrap();

        for name in ["Subject", "From", "To"] {
            let value = header(sent, name).unwrap();
            assert!(
                output.contains(&format!("{name}: {value}\n")),
                "{name} differs: {output}"
            );
        }
    }

    #[test]
    fn transport_errors_are_fatal() {
        let result = Dispatcher::new(io::sink(), SystemBrowser, FailingMailer).dispatch(
            &email_plan(false),
            &EventsByDay::default(),
            HTML,
        );

        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn web_preview_writes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let browser = RecordingBrowser::default();
        let mailer = RecordingMailer::default();
        let mut console = Vec::new();

        let delivered = Dispatcher::new(&mut console, &browser, &mailer)
            .with_preview_dir(dir.path())
            .dispatch(&DeliveryPlan::Web, &EventsByDay::default(), HTML)
            .unwrap();

        let Delivered::Web(path) = delivered else {
            panic!("expected web delivery");
        };

        assert!(path.starts_with(dir.path()));
        assert_eq!(path.extension().and_then(|ext| ext.to_str()), Some("html"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), HTML);
        assert_eq!(*browser.0.borrow(), vec![path]);
        assert!(mailer.0.borrow().is_empty());
        assert!(console.is_empty());
    }

    macro_rules! at {
        ($y:expr, $m:expr, $d:expr, $h:expr, $min:expr) => {
            New_York
                .with_ymd_and_hms($y, $m, $d, $h, $min, 0)
                .unwrap()
        };
    }

    fn now() -> chrono::DateTime<chrono_tz::Tz> {
        at!(2026, 10, 16, 14, 30)
    }

    #[test]
    fn console_lists_all_day_before_timed() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let window = TimeWindow::new(now(), 7, false).unwrap();
        let events_by_day = normalize(
            vec![
                CalendarEvent {
                    id: "1".into(),
                    summary: "Dentist".into(),
                    time: EventTime::Timed {
                        start: at!(2026, 10, 19, 9, 0).with_timezone(&Utc),
                        end: at!(2026, 10, 19, 10, 0).with_timezone(&Utc),
                    },
                },
                CalendarEvent {
                    id: "2".into(),
                    summary: "Columbus Day".into(),
                    time: EventTime::AllDay {
                        date,
                        end_date: date.succ_opt().unwrap(),
                    },
                },
                CalendarEvent {
                    id: "3".into(),
                    summary: "Book club".into(),
                    time: EventTime::Timed {
                        start: at!(2026, 10, 21, 19, 0).with_timezone(&Utc),
                        end: at!(2026, 10, 21, 21, 0).with_timezone(&Utc),
                    },
                },
            ],
            &window,
        );

        let mut console = Vec::new();
        Dispatcher::new(&mut console, SystemBrowser, FailingMailer)
            .dispatch(&DeliveryPlan::Console, &events_by_day, HTML)
            .unwrap();

        assert_eq!(
            String::from_utf8(console).unwrap(),
            "Monday, October 19\n\
             \x20 [all day] Columbus Day\n\
             \x20 09:00 Dentist\n\
             \n\
             Wednesday, October 21\n\
             \x20 19:00 Book club\n"
        );
    }

    #[tokio::test]
    async fn end_to_end_without_events() {
        let calendar = Calendar::new(StaticEventSource::new(Vec::<CalendarEvent>::new()));
        let window = TimeWindow::new(now(), 7, false).unwrap();
        let events_by_day = calendar.get_events_by_day(&window).await.unwrap();

        let html = DigestRenderer::from_path("templates")
            .render("Weekly Calendar Events", &events_by_day)
            .unwrap();

        let mut console = Vec::new();
        let delivered = Dispatcher::new(&mut console, SystemBrowser, FailingMailer)
            .dispatch(&DeliveryPlan::Console, &events_by_day, &html)
            .unwrap();

        assert_eq!(delivered, Delivered::Console);
        assert!(console.is_empty());
    }

    #[tokio::test]
    async fn end_to_end_web_preview() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let calendar = Calendar::new(StaticEventSource::new([CalendarEvent {
            id: "1".into(),
            summary: "Columbus Day".into(),
            time: EventTime::AllDay {
                date,
                end_date: date.succ_opt().unwrap(),
            },
        }]));
        let window = TimeWindow::new(now(), 7, false).unwrap();
        let events_by_day = calendar.get_events_by_day(&window).await.unwrap();

        let html = DigestRenderer::from_path("templates")
            .render("Weekly Calendar Events", &events_by_day)
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let browser = RecordingBrowser::default();
        let mailer = RecordingMailer::default();

        let plan = DeliveryPlan::resolve(
            flags(false, true, false),
            "Weekly Calendar Events",
            None,
            &email_config(None, None, None),
        )
        .unwrap();
        let delivered = Dispatcher::new(io::sink(), &browser, &mailer)
            .with_preview_dir(dir.path())
            .dispatch(&plan, &events_by_day, &html)
            .unwrap();

        let Delivered::Web(path) = delivered else {
            panic!("expected web delivery");
        };
        let written = std::fs::read_to_string(path).unwrap();
        assert_eq!(written, html);
        assert!(written.contains("Columbus Day"));
        assert!(mailer.0.borrow().is_empty());
    }
}
