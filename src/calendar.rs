pub mod google;
pub mod templating;

use super::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Days, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use google::GoogleCalendarClient;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

/// When an event takes place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTime {
    /// An event with a start and end instant.
    Timed {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// An event that covers whole days. `end_date` is exclusive.
    AllDay { date: NaiveDate, end_date: NaiveDate },
}

impl EventTime {
    /// Classifies a provider record by the shape of its start and end. A start carrying an
    /// instant makes a timed event, a start carrying only a date makes an all-day event.
    ///
    /// Returns `None` if the start carries neither.
    pub fn from_timepoints(
        start: &google::models::Timepoint,
        end: &google::models::Timepoint,
    ) -> Option<EventTime> {
        if let Some(start) = start.date_time {
            return Some(EventTime::Timed {
                start,
                end: end.date_time.unwrap_or(start),
            });
        }

        let date = start.date?;
        let end_date = end
            .date
            .or_else(|| date.succ_opt())
            .unwrap_or(date);

        Some(EventTime::AllDay { date, end_date })
    }

    /// The instant the event starts, all-day events start at midnight UTC of their date.
    fn sort_key(&self) -> DateTime<Utc> {
        match self {
            EventTime::Timed { start, .. } => *start,
            EventTime::AllDay { date, .. } => date.and_time(NaiveTime::MIN).and_utc(),
        }
    }
}

/// Represents a single calendar event as returned by an event source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEvent {
    /// Identifier assigned by the source.
    pub id: String,
    /// The event title.
    pub summary: String,
    /// When the event takes place.
    pub time: EventTime,
}

/// Summary used for events that have no title.
pub const UNTITLED: &str = "(No title)";

impl TryFrom<google::models::Event> for CalendarEvent {
    type Error = google::models::Event;

    fn try_from(ev: google::models::Event) -> Result<Self, Self::Error> {
        match EventTime::from_timepoints(&ev.start, &ev.end) {
            Some(time) => Ok(CalendarEvent {
                id: ev.id,
                summary: ev.summary.unwrap_or_else(|| UNTITLED.to_owned()),
                time,
            }),
            None => Err(ev),
        }
    }
}

/// A timed event converted to the display time zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedEvent {
    pub id: String,
    pub summary: String,
    pub start: DateTime<Tz>,
    pub end: DateTime<Tz>,
}

impl TimedEvent {
    /// Formats the local start and end time, e.g. `09:00 - 10:30`. The end date is included
    /// when the event ends on another day.
    pub fn time_range(&self) -> String {
        let start = self.start.format("%H:%M");

        if self.start.date_naive() == self.end.date_naive() {
            format!("{start} - {}", self.end.format("%H:%M"))
        } else {
            format!("{start} - {}", self.end.format("%Y-%m-%d %H:%M"))
        }
    }
}

/// An all-day event keyed by its own date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllDayEvent {
    pub id: String,
    pub summary: String,
    pub date: NaiveDate,
    /// Exclusive end date.
    pub end_date: NaiveDate,
}

/// Events bucketed by local calendar date. Dates are kept in ascending order, events within a
/// bucket keep the order in which the source returned them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventsByDay {
    pub timed: BTreeMap<NaiveDate, Vec<TimedEvent>>,
    pub all_day: BTreeMap<NaiveDate, Vec<AllDayEvent>>,
}

impl EventsByDay {
    /// Returns `true` if there are no events at all.
    pub fn is_empty(&self) -> bool {
        self.timed.is_empty() && self.all_day.is_empty()
    }

    /// All dates that have at least one event, ascending.
    pub fn dates(&self) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = self
            .timed
            .keys()
            .chain(self.all_day.keys())
            .copied()
            .collect();
        dates.sort_unstable();
        dates.dedup();
        dates
    }

    pub fn timed_on(&self, date: &NaiveDate) -> &[TimedEvent] {
        self.timed.get(date).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn all_day_on(&self, date: &NaiveDate) -> &[AllDayEvent] {
        self.all_day.get(date).map(Vec::as_slice).unwrap_or_default()
    }
}

/// The span of days for which events are fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeWindow {
    /// Start of the fetch range.
    pub start: DateTime<Tz>,
    /// End of the fetch range.
    pub end: DateTime<Tz>,
    days: Range<NaiveDate>,
}

impl TimeWindow {
    /// Computes the window of `days` calendar days relative to `now`.
    ///
    /// With `include_today` the window starts at local midnight of the current day, otherwise it
    /// starts at the very end of the current day so that only future days are covered. The end is
    /// `days` calendar days after the start, which keeps the local time of day stable across DST
    /// changes.
    ///
    /// Returns `Error::InvalidWindow` if the end lies beyond the supported date range.
    pub fn new(now: DateTime<Tz>, days: u32, include_today: bool) -> Result<TimeWindow> {
        let tz = now.timezone();
        let today = now.date_naive();
        let out_of_range =
            || Error::InvalidWindow(format!("{days} days after {today} are out of range"));

        let (first_day, start_time) = if include_today {
            (today, NaiveTime::MIN)
        } else {
            let end_of_day = NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999)
                .unwrap_or(NaiveTime::MIN);
            (today.succ_opt().ok_or_else(out_of_range)?, end_of_day)
        };

        let start = today.and_time(start_time);
        let end = start
            .checked_add_days(Days::new(days.into()))
            .ok_or_else(out_of_range)?;
        let last_day = first_day
            .checked_add_days(Days::new(days.into()))
            .ok_or_else(out_of_range)?;

        Ok(TimeWindow {
            start: localize(&tz, start),
            end: localize(&tz, end),
            days: first_day..last_day,
        })
    }

    /// The display time zone of this window.
    pub fn time_zone(&self) -> Tz {
        self.start.timezone()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty() || self.start >= self.end
    }

    /// The window as a UTC range, as expected by event sources.
    pub fn range(&self) -> Range<DateTime<Utc>> {
        self.start.with_timezone(&Utc)..self.end.with_timezone(&Utc)
    }

    /// The calendar days covered by the window, end exclusive.
    pub fn days(&self) -> Range<NaiveDate> {
        self.days.clone()
    }

    /// Returns `true` if any of `days` (end exclusive) is one of the window's days.
    pub fn overlaps(&self, days: &Range<NaiveDate>) -> bool {
        days.start < self.days.end && self.days.start < days.end
    }
}

/// Resolves a local date time in `tz`. Ambiguous times resolve to the earlier instant, times
/// falling into a DST gap are moved forward by an hour.
fn localize(tz: &Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => {
            let shifted = naive + chrono::Duration::hours(1);
            tz.from_local_datetime(&shifted)
                .earliest()
                .unwrap_or_else(|| tz.from_utc_datetime(&naive))
        }
    }
}

/// The local calendar days a timed event touches, end exclusive. An event ending exactly at
/// midnight does not touch the following day.
fn local_days(start: &DateTime<Tz>, end: &DateTime<Tz>) -> Range<NaiveDate> {
    let first = start.date_naive();
    let last = if end > start && end.time() == NaiveTime::MIN {
        end.date_naive()
    } else {
        end.date_naive().succ_opt().unwrap_or(NaiveDate::MAX)
    };

    first..last.max(first.succ_opt().unwrap_or(NaiveDate::MAX))
}

/// Buckets events by their local start date in the window's time zone.
///
/// Timed events are converted to the display time zone and keyed by the date they start on, an
/// event spanning midnight is never split. All-day events are keyed by their own date. Events
/// are kept if any of their days lies within the window, so an event that started before the
/// window and is still ongoing is listed under its start date. Events not touching the window's
/// days are dropped. The order of `events` is preserved within each bucket.
pub fn normalize(events: Vec<CalendarEvent>, window: &TimeWindow) -> EventsByDay {
    let tz = window.time_zone();
    let mut events_by_day = EventsByDay::default();

    for event in events {
        match event.time {
            EventTime::Timed { start, end } => {
                let start = start.with_timezone(&tz);
                let end = end.with_timezone(&tz);
                let date = start.date_naive();

                if !window.overlaps(&local_days(&start, &end)) {
                    log::debug!("skipping event `{}` starting on {}", event.summary, date);
                    continue;
                }

                events_by_day.timed.entry(date).or_default().push(TimedEvent {
                    id: event.id,
                    summary: event.summary,
                    start,
                    end,
                });
            }
            EventTime::AllDay { date, end_date } => {
                let days = date..end_date.max(date.succ_opt().unwrap_or(NaiveDate::MAX));

                if !window.overlaps(&days) {
                    log::debug!("skipping all-day event `{}` on {}", event.summary, date);
                    continue;
                }

                events_by_day
                    .all_day
                    .entry(date)
                    .or_default()
                    .push(AllDayEvent {
                        id: event.id,
                        summary: event.summary,
                        date,
                        end_date,
                    });
            }
        }
    }

    events_by_day
}

/// Trait that needs to be implemented by a source of calendar events.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Fetches events overlapping `range`, recurring events expanded into single occurrences.
    async fn fetch_events(&self, range: Range<DateTime<Utc>>) -> Result<Vec<CalendarEvent>>;
}

/// An `EventSource` that returns events from a static list.
pub struct StaticEventSource {
    events: Vec<CalendarEvent>,
}

impl StaticEventSource {
    /// Creates a new `StaticEventSource` from an iterator.
    pub fn new<I>(iter: I) -> StaticEventSource
    where
        I: IntoIterator,
        I::Item: Into<CalendarEvent>,
    {
        StaticEventSource {
            events: iter.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl EventSource for StaticEventSource {
    async fn fetch_events(&self, _range: Range<DateTime<Utc>>) -> Result<Vec<CalendarEvent>> {
        Ok(self.events.clone())
    }
}

#[derive(Debug)]
pub struct GoogleCalendarEventSource {
    client: GoogleCalendarClient,
}

impl GoogleCalendarEventSource {
    pub async fn new(calendar_id: &str) -> Result<GoogleCalendarEventSource> {
        Ok(GoogleCalendarEventSource {
            client: GoogleCalendarClient::new(calendar_id).await?,
        })
    }
}

#[async_trait]
impl EventSource for GoogleCalendarEventSource {
    async fn fetch_events(&self, range: Range<DateTime<Utc>>) -> Result<Vec<CalendarEvent>> {
        let events = self.client.get_all_events(range).await?;
        Ok(from_google_events(events))
    }
}

/// Converts provider records, dropping cancelled events and records without a start.
fn from_google_events(events: Vec<google::models::Event>) -> Vec<CalendarEvent> {
    events
        .into_iter()
        .filter(|event| !event.is_cancelled())
        .filter_map(|event| match CalendarEvent::try_from(event) {
            Ok(event) => Some(event),
            Err(event) => {
                log::warn!("skipping event `{}` without start date", event.id);
                None
            }
        })
        .collect()
}

#[async_trait]
impl<T> EventSource for Arc<T>
where
    T: EventSource + ?Sized,
{
    async fn fetch_events(&self, range: Range<DateTime<Utc>>) -> Result<Vec<CalendarEvent>> {
        (**self).fetch_events(range).await
    }
}

/// The `Calendar` type wraps an event source with windowing and day bucketing.
pub struct Calendar {
    event_source: Box<dyn EventSource>,
}

impl Calendar {
    /// Creates a new `Calendar` from an event source.
    pub fn new<T>(event_source: T) -> Calendar
    where
        T: EventSource + 'static,
    {
        Calendar {
            event_source: Box::new(event_source),
        }
    }

    /// Fetches the events in `window`, ordered by start time. An empty window does not hit the
    /// source at all.
    pub async fn get_events(&self, window: &TimeWindow) -> Result<Vec<CalendarEvent>> {
        if window.start > window.end {
            return Err(Error::InvalidWindow(format!(
                "{} is after {}",
                window.start.to_rfc3339(),
                window.end.to_rfc3339()
            )));
        }

        if window.is_empty() {
            return Ok(Vec::new());
        }

        log::info!(
            "fetching events between {} and {}",
            window.start.to_rfc3339(),
            window.end.to_rfc3339()
        );

        let mut events = self.event_source.fetch_events(window.range()).await?;

        log::debug!("fetched {} events", events.len());

        // Sources are expected to return events ordered by start time. The sort is stable, so
        // this keeps the source order for events starting at the same time.
        events.sort_by_key(|event| event.time.sort_key());

        Ok(events)
    }

    /// Fetches the events in `window` and buckets them by local date. This is used to avoid
    /// having complicated logic for displaying events by day in templates.
    pub async fn get_events_by_day(&self, window: &TimeWindow) -> Result<EventsByDay> {
        let events = self.get_events(window).await?;
        Ok(normalize(events, window))
    }
}
