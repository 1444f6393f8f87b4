use super::{AllDayEvent, EventsByDay, TimedEvent};
use crate::Result;
use chrono::{Locale, NaiveDate};
use minijinja::value::{StructObject, Value};
use minijinja::{context, Environment, Source};
use std::path::Path;

/// Name of the digest template inside the template directory.
pub const DIGEST_TEMPLATE: &str = "digest.html";

/// Formats a day header, e.g. `Monday, October 19`.
pub fn format_day(date: &NaiveDate) -> String {
    date.format_localized("%A, %B %-d", Locale::en_US)
        .to_string()
}

impl StructObject for TimedEvent {
    fn get_field(&self, name: &str) -> Option<Value> {
        let value = match name {
            "summary" => Value::from(self.summary.clone()),
            "start" => Value::from(self.start.format("%H:%M").to_string()),
            "end" => Value::from(self.end.format("%H:%M").to_string()),
            "time" => Value::from(self.time_range()),
            _ => return None,
        };

        Some(value)
    }

    fn static_fields(&self) -> Option<&'static [&'static str]> {
        Some(&["summary", "start", "end", "time"][..])
    }
}

impl StructObject for AllDayEvent {
    fn get_field(&self, name: &str) -> Option<Value> {
        let value = match name {
            "summary" => Value::from(self.summary.clone()),
            "date" => Value::from(format_day(&self.date)),
            "multi_day" => Value::from(self.date.succ_opt() < Some(self.end_date)),
            _ => return None,
        };

        Some(value)
    }

    fn static_fields(&self) -> Option<&'static [&'static str]> {
        Some(&["summary", "date", "multi_day"][..])
    }
}

/// Renders the HTML digest from a template directory.
pub struct DigestRenderer {
    env: Environment<'static>,
}

impl DigestRenderer {
    /// Creates a renderer loading templates from `template_dir`. Templates are loaded lazily, a
    /// missing template only surfaces when rendering.
    pub fn from_path<P: AsRef<Path>>(template_dir: P) -> DigestRenderer {
        let mut env = Environment::new();
        env.set_source(Source::from_path(template_dir));
        DigestRenderer { env }
    }

    /// Renders the digest for `events_by_day`. All-day events come before timed events within
    /// each day.
    pub fn render(&self, subject: &str, events_by_day: &EventsByDay) -> Result<String> {
        let days: Vec<Value> = events_by_day
            .dates()
            .iter()
            .map(|date| {
                let all_day_events: Vec<Value> = events_by_day
                    .all_day_on(date)
                    .iter()
                    .cloned()
                    .map(Value::from_struct_object)
                    .collect();
                let timed_events: Vec<Value> = events_by_day
                    .timed_on(date)
                    .iter()
                    .cloned()
                    .map(Value::from_struct_object)
                    .collect();

                context! {
                    date => format_day(date),
                    iso_date => date.to_string(),
                    all_day_events => all_day_events,
                    timed_events => timed_events,
                }
            })
            .collect();

        let html = self
            .env
            .get_template(DIGEST_TEMPLATE)?
            .render(context! { subject => subject, days => days })?;

        Ok(html)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::America::New_York;

    fn events_by_day() -> EventsByDay {
        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let mut events_by_day = EventsByDay::default();

        events_by_day.all_day.insert(
            date,
            vec![AllDayEvent {
                id: "1".into(),
                summary: "Columbus Day".into(),
                date,
                end_date: date.succ_opt().unwrap(),
            }],
        );
        events_by_day.timed.insert(
            date,
            vec![TimedEvent {
                id: "2".into(),
                summary: "Dentist <Dr. Who>".into(),
                start: New_York.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap(),
                end: New_York.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap(),
            }],
        );

        events_by_day
    }

    #[test]
    fn day_header() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        assert_eq!(format_day(&date), "Monday, October 19");
    }

    #[test]
    fn render_digest() {
        let renderer = DigestRenderer::from_path("templates");
        let html = renderer
            .render("Weekly Calendar Events", &events_by_day())
            .unwrap();

        assert!(html.contains("Weekly Calendar Events"));
        assert!(html.contains("Monday, October 19"));
        assert!(html.contains("09:00 - 10:00"));
        // Autoescaped since the template has a `.html` extension.
        assert!(html.contains("Dentist &lt;Dr. Who&gt;"));

        let all_day = html.find("Columbus Day").unwrap();
        let timed = html.find("Dentist").unwrap();
        assert!(all_day < timed);
    }

    #[test]
    fn render_without_events() {
        let renderer = DigestRenderer::from_path("templates");
        let html = renderer
            .render("Weekly Calendar Events", &EventsByDay::default())
            .unwrap();

        assert!(html.contains("No upcoming events"));
    }

    #[test]
    fn missing_template() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = DigestRenderer::from_path(dir.path());

        assert!(matches!(
            renderer.render("subject", &events_by_day()),
            Err(crate::Error::Template(_))
        ));
    }
}
