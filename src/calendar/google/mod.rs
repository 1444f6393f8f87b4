pub mod models;

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING, AUTHORIZATION, USER_AGENT};
use std::ops::Range;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Error while authenticating with google.
    #[error("failed to authenticate: {0}")]
    GCloudAuth(#[from] google_cloud_auth::error::Error),

    /// Error while making a http request.
    #[error("failure requesting remote resource: {0}")]
    Request(#[from] reqwest::Error),

    /// Error while building http headers.
    #[error("encountered invalid HTTP header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    /// Error while parsing a JSON response.
    #[error("failed to parse response as JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Google calendar client for making requests to the google calendar api
#[derive(Debug)]
pub struct GoogleCalendarClient {
    client: reqwest::Client,
    calendar_id: String,
}

impl GoogleCalendarClient {
    /// Create a new google calendar client for `calendar_id`. Service account credentials are
    /// looked up from the environment via the GOOGLE_APPLICATION_CREDENTIALS variable pointing to
    /// the json key file generated in the google cloud console.
    pub async fn new(calendar_id: impl Into<String>) -> Result<GoogleCalendarClient, ClientError> {
        // We only need readonly acccess
        let scopes = ["https://www.googleapis.com/auth/calendar.readonly"];

        let config = google_cloud_auth::Config {
            audience: None,
            scopes: Some(&scopes),
        };

        let token_source = google_cloud_auth::create_token_source(config).await?;
        let token = token_source.token().await?;

        let mut authorization =
            HeaderValue::from_str(&format!("Bearer {}", token.access_token))?;
        authorization.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, authorization);
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_str("gzip")?);
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!(
                "calendar-digest/{} (gzip)",
                env!("CARGO_PKG_VERSION")
            ))?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(GoogleCalendarClient {
            client,
            calendar_id: calendar_id.into(),
        })
    }

    /// Queries one page of events from the google calendar. The query can be filtered by a date
    /// range. If more events are available a page token is returned that should be used in the
    /// next request to get the next page of events.
    pub async fn get_events(
        &self,
        date_range: Option<Range<DateTime<Utc>>>,
        next_page_token: Option<String>,
    ) -> Result<(Vec<models::Event>, Option<String>), ClientError> {
        let events_request = self.client.get(format!(
            "https://www.googleapis.com/calendar/v3/calendars/{}/events",
            self.calendar_id
        ));

        let query = build_query_parameters(&date_range, &next_page_token);

        let body = events_request
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let events: models::Events = serde_json::from_str(&body)?;

        log::debug!("fetched {} events from Google Calendar", events.items.len());

        Ok((events.items, events.next_page_token))
    }

    /// Fetches all events in `date_range`, following page tokens until the last page.
    pub async fn get_all_events(
        &self,
        date_range: Range<DateTime<Utc>>,
    ) -> Result<Vec<models::Event>, ClientError> {
        let mut events = Vec::new();
        let mut page_token = None;
        let mut pages = 0;

        loop {
            let (items, next_page_token) = self
                .get_events(Some(date_range.clone()), page_token)
                .await?;
            events.extend(items);
            pages += 1;

            match next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        log::debug!("fetched {} events in {} page(s)", events.len(), pages);

        Ok(events)
    }
}

fn build_query_parameters(
    date_range: &Option<Range<DateTime<Utc>>>,
    next_page_token: &Option<String>,
) -> IndexMap<&'static str, String> {
    // Google requires rfc3339 format for the times with a fixed offset
    // see: https://developers.google.com/calendar/api/v3/reference/events/list

    let mut query_parameters: IndexMap<&'static str, String> = IndexMap::from([
        // expand recurring events into single occurrences
        ("singleEvents", "true".to_owned()),
        // order ascending by start time
        ("orderBy", "startTime".to_owned()),
    ]);

    if let Some(range) = date_range {
        // limit the events by a time frame
        query_parameters.insert(
            "timeMin",
            range.start.to_rfc3339_opts(SecondsFormat::Micros, true),
        );
        query_parameters.insert(
            "timeMax",
            range.end.to_rfc3339_opts(SecondsFormat::Micros, true),
        );
    }

    if let Some(token) = next_page_token {
        // page token returned by previous request to fetch the next page
        query_parameters.insert("pageToken", token.clone());
    }

    query_parameters
}
