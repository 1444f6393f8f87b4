use chrono_tz::Tz;
use config::{Config, Environment, File};
use lettre::transport::smtp::authentication::Credentials;
use serde::{Deserialize, Serialize};
use std::env;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub mod calendar;
pub mod delivery;

/// Result type used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type returned by all fallible operations within this crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),
    #[error("calendar provider error: {0}")]
    Provider(#[from] calendar::google::ClientError),
    #[error("invalid time zone `{0}`")]
    InvalidTimeZone(String),
    #[error("invalid time window: {0}")]
    InvalidWindow(String),
    #[error("missing calendar id, pass --calendar-id or set DIGEST_CALENDAR__ID")]
    MissingCalendarId,
    #[error("--email and --web are mutually exclusive")]
    ConflictingChannels,
    #[error("no recipients given, pass --to or set DIGEST_EMAIL__RECIPIENTS")]
    MissingRecipients,
    #[error("no sender address, set DIGEST_EMAIL__FROM or DIGEST_EMAIL__USERNAME")]
    MissingSender,
    #[error("no SMTP credentials, set DIGEST_EMAIL__USERNAME and DIGEST_EMAIL__PASSWORD")]
    MissingCredentials,
    #[error("invalid email address: {0}")]
    InvalidAddress(#[from] lettre::address::AddressError),
    #[error("failed to build email: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("failed to open browser: {0}")]
    Browser(#[source] io::Error),
}

impl Error {
    /// Returns `true` for configuration and usage errors. These are detected before any I/O
    /// happens.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::InvalidTimeZone(_)
                | Error::InvalidWindow(_)
                | Error::MissingCalendarId
                | Error::ConflictingChannels
                | Error::MissingRecipients
                | Error::MissingSender
                | Error::MissingCredentials
                | Error::InvalidAddress(_)
        )
    }
}

/// Parses an IANA time zone name like `Europe/Berlin`.
pub fn parse_time_zone(name: &str) -> Result<Tz> {
    name.parse()
        .map_err(|_| Error::InvalidTimeZone(name.to_owned()))
}

/// Calendar configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct CalendarConfig {
    /// Default calendar to fetch events from.
    pub id: Option<String>,
    /// IANA time zone events are displayed in.
    pub time_zone: String,
}

/// Email delivery configuration.
#[derive(Deserialize, Serialize, Clone)]
pub struct EmailConfig {
    /// SMTP host, connected to via implicit TLS.
    pub host: String,
    /// SMTP port.
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Sender address. Falls back to `username` if unset.
    pub from: Option<String>,
    /// Default subject line.
    pub subject: String,
    /// Default comma-separated recipient list.
    pub recipients: Option<String>,
}

impl EmailConfig {
    /// The sender address, falling back to the SMTP username.
    pub fn sender(&self) -> Option<&str> {
        self.from
            .as_deref()
            .filter(|from| !from.trim().is_empty())
            .or(self.username.as_deref())
            .filter(|from| !from.trim().is_empty())
    }

    /// SMTP credentials. Sending requires both username and password.
    pub fn credentials(&self) -> Result<Credentials> {
        let username = self.username.as_deref().filter(|s| !s.trim().is_empty());
        let password = self.password.as_deref().filter(|s| !s.is_empty());

        match (username, password) {
            (Some(username), Some(password)) => {
                Ok(Credentials::new(username.to_owned(), password.to_owned()))
            }
            _ => Err(Error::MissingCredentials),
        }
    }
}

// Keeps the password out of debug logs.
impl std::fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("from", &self.from)
            .field("subject", &self.subject)
            .field("recipients", &self.recipients)
            .finish()
    }
}

/// Global application configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct AppConfig {
    /// Calendar configuration section.
    pub calendar: CalendarConfig,
    /// Email configuration section.
    pub email: EmailConfig,
    /// Directory containing the digest template.
    pub template_dir: PathBuf,
}

impl AppConfig {
    /// Loads the application configuration from built-in defaults, an optional
    /// `config/local.toml`, a `.env` file and environment variables.
    pub fn load() -> Result<AppConfig> {
        dotenv::dotenv().ok();

        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".into());

        log::info!("loading configuration using {} environment", app_env);

        let config = Config::builder()
            .set_default("calendar.time_zone", "America/New_York")?
            .set_default("template_dir", "templates")?
            .set_default("email.host", "smtp.gmail.com")?
            .set_default("email.port", 465)?
            .set_default("email.subject", "Weekly Calendar Events")?
            // Optional environment specific config overrides, e.g. `config/production.toml`.
            .add_source(File::with_name(&format!("config/{}", app_env)).required(false))
            // Optional local config overrides from `config/local.toml` (on .gitignore).
            .add_source(File::with_name("config/local").required(false))
            // Config from environment variables prefixed with `DIGEST_`, e.g. `DIGEST_EMAIL__HOST`.
            .add_source(
                Environment::with_prefix("DIGEST")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        log::debug!("loaded configuration: {:?}", config);

        Ok(config)
    }

    /// The display time zone.
    pub fn time_zone(&self) -> Result<Tz> {
        parse_time_zone(&self.calendar.time_zone)
    }
}
