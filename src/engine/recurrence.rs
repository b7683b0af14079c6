//! Recurrence rules for availability exceptions.
//!
//! Rules are parsed once, when the exception is created, into a structured
//! [`RecurrenceRule`]. Query-time code only ever calls [`RecurrenceRule::occurs`].

use std::fmt;

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid recurrence rule: {0}")]
pub struct RecurrenceParseError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Weekly,
    Yearly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    /// Weekly rules only. Sorted Monday-first, no duplicates, never empty for weekly rules.
    pub weekdays: Vec<Weekday>,
    /// Last date (inclusive) with an occurrence.
    pub until: Option<NaiveDate>,
}

/// JSON input form: `{"frequency": "weekly", "days": ["monday", "thursday"]}`.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct JsonRule {
    frequency: String,
    #[serde(default, alias = "weekdays")]
    days: Vec<String>,
    #[serde(default)]
    until: Option<NaiveDate>,
}

impl RecurrenceRule {
    pub fn weekly(days: &[Weekday]) -> Self {
        let mut weekdays = days.to_vec();
        normalize_weekdays(&mut weekdays);
        Self {
            frequency: Frequency::Weekly,
            weekdays,
            until: None,
        }
    }

    pub fn yearly() -> Self {
        Self {
            frequency: Frequency::Yearly,
            weekdays: Vec::new(),
            until: None,
        }
    }

    pub fn until(mut self, date: NaiveDate) -> Self {
        self.until = Some(date);
        self
    }

    /// Parse a rule given either as a JSON object or as `FREQ=WEEKLY;BYDAY=MO,WE`.
    ///
    /// `anchor` is the local date of the exception's start. A weekly rule without
    /// weekdays repeats on the anchor's weekday.
    pub fn parse(text: &str, anchor: NaiveDate) -> Result<Self, RecurrenceParseError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RecurrenceParseError("empty rule".into()));
        }
        let (frequency, days, until) = if text.starts_with('{') {
            parse_json(text)?
        } else {
            parse_rrule(text)?
        };

        let mut weekdays = days
            .iter()
            .map(|d| parse_weekday(d))
            .collect::<Result<Vec<_>, _>>()?;

        match frequency {
            Frequency::Weekly => {
                if weekdays.is_empty() {
                    weekdays.push(anchor.weekday());
                }
                normalize_weekdays(&mut weekdays);
            }
            Frequency::Yearly => {
                if !weekdays.is_empty() {
                    return Err(RecurrenceParseError(
                        "weekdays are not allowed on a yearly rule".into(),
                    ));
                }
            }
        }

        if let Some(until) = until
            && until < anchor
        {
            return Err(RecurrenceParseError(format!(
                "until {until} is before the first occurrence {anchor}"
            )));
        }

        Ok(Self {
            frequency,
            weekdays,
            until,
        })
    }

    /// Does the rule anchored at `anchor` produce an occurrence on `candidate`?
    pub fn occurs(&self, anchor: NaiveDate, candidate: NaiveDate) -> bool {
        if candidate < anchor {
            return false;
        }
        if self.until.is_some_and(|until| candidate > until) {
            return false;
        }
        match self.frequency {
            Frequency::Weekly => self.weekdays.contains(&candidate.weekday()),
            // Feb 29 anchors simply find no match in common years.
            Frequency::Yearly => {
                candidate.month() == anchor.month() && candidate.day() == anchor.day()
            }
        }
    }
}

impl fmt::Display for RecurrenceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.frequency {
            Frequency::Weekly => {
                let days: Vec<&str> = self.weekdays.iter().map(|d| weekday_code(*d)).collect();
                write!(f, "FREQ=WEEKLY;BYDAY={}", days.join(","))?;
            }
            Frequency::Yearly => f.write_str("FREQ=YEARLY")?,
        }
        if let Some(until) = self.until {
            write!(f, ";UNTIL={}", until.format("%Y%m%d"))?;
        }
        Ok(())
    }
}

fn parse_json(text: &str) -> Result<(Frequency, Vec<String>, Option<NaiveDate>), RecurrenceParseError> {
    let raw: JsonRule =
        serde_json::from_str(text).map_err(|e| RecurrenceParseError(e.to_string()))?;
    Ok((parse_frequency(&raw.frequency)?, raw.days, raw.until))
}

fn parse_rrule(text: &str) -> Result<(Frequency, Vec<String>, Option<NaiveDate>), RecurrenceParseError> {
    let body = text
        .strip_prefix("RRULE:")
        .or_else(|| text.strip_prefix("rrule:"))
        .unwrap_or(text);

    let mut frequency = None;
    let mut days = Vec::new();
    let mut until = None;

    for part in body.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| RecurrenceParseError(format!("malformed part: {part}")))?;
        match key.trim().to_ascii_uppercase().as_str() {
            "FREQ" => frequency = Some(parse_frequency(value)?),
            "BYDAY" => days.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(String::from),
            ),
            "UNTIL" => until = Some(parse_until(value)?),
            "INTERVAL" if value.trim() == "1" => {}
            other => {
                return Err(RecurrenceParseError(format!("unsupported rule part: {other}")));
            }
        }
    }

    let frequency = frequency.ok_or_else(|| RecurrenceParseError("missing FREQ".into()))?;
    Ok((frequency, days, until))
}

fn parse_frequency(value: &str) -> Result<Frequency, RecurrenceParseError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "weekly" => Ok(Frequency::Weekly),
        "yearly" | "annually" => Ok(Frequency::Yearly),
        other => Err(RecurrenceParseError(format!("unsupported frequency: {other}"))),
    }
}

fn parse_until(value: &str) -> Result<NaiveDate, RecurrenceParseError> {
    let value = value.trim();
    // Accept the date part of an RFC 5545 DATE-TIME as well.
    let date_part = value.split('T').next().unwrap_or(value);
    NaiveDate::parse_from_str(date_part, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(date_part, "%Y-%m-%d"))
        .map_err(|_| RecurrenceParseError(format!("bad UNTIL date: {value}")))
}

fn parse_weekday(value: &str) -> Result<Weekday, RecurrenceParseError> {
    let day = match value.trim().to_ascii_lowercase().as_str() {
        "mo" | "mon" | "monday" => Weekday::Mon,
        "tu" | "tue" | "tues" | "tuesday" => Weekday::Tue,
        "we" | "wed" | "wednesday" => Weekday::Wed,
        "th" | "thu" | "thurs" | "thursday" => Weekday::Thu,
        "fr" | "fri" | "friday" => Weekday::Fri,
        "sa" | "sat" | "saturday" => Weekday::Sat,
        "su" | "sun" | "sunday" => Weekday::Sun,
        other => return Err(RecurrenceParseError(format!("unknown weekday: {other}"))),
    };
    Ok(day)
}

fn weekday_code(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "MO",
        Weekday::Tue => "TU",
        Weekday::Wed => "WE",
        Weekday::Thu => "TH",
        Weekday::Fri => "FR",
        Weekday::Sat => "SA",
        Weekday::Sun => "SU",
    }
}

fn normalize_weekdays(days: &mut Vec<Weekday>) {
    days.sort_by_key(|d| d.num_days_from_monday());
    days.dedup();
}
