use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

mod rfc3339_to_datetime_utc {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = match Option::<String>::deserialize(deserializer)? {
            Some(s) => s,
            None => return Ok(None),
        };
        let offset_time = DateTime::parse_from_rfc3339(&s).map_err(serde::de::Error::custom)?;
        Ok(Some(offset_time.with_timezone(&Utc)))
    }
}

/// Start or end of an event. Timed events carry `dateTime`, all-day events only carry `date`.
#[derive(Debug, Deserialize)]
#[serde(rename_all(deserialize = "camelCase"))]
pub struct Timepoint {
    #[serde(default, with = "rfc3339_to_datetime_utc")]
    pub date_time: Option<DateTime<Utc>>,
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all(deserialize = "camelCase"))]
pub struct Event {
    pub id: String,
    pub status: Option<String>,
    pub summary: Option<String>,
    pub start: Timepoint,
    pub end: Timepoint,
}

impl Event {
    pub fn is_cancelled(&self) -> bool {
        self.status.as_deref() == Some("cancelled")
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all(deserialize = "camelCase"))]
pub struct Events {
    #[serde(default)]
    pub items: Vec<Event>,
    pub next_page_token: Option<String>,
}
