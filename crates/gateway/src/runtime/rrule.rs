//! Timezone-aware RRULE subset evaluator.
//!
//! Supports `FREQ=MINUTELY|HOURLY|DAILY|WEEKLY` with `INTERVAL`, `BYHOUR`,
//! `BYMINUTE`, and `BYDAY` (single day). Occurrences are computed in the
//! schedule's timezone; DST gaps are skipped and fall-back overlaps take the
//! earliest mapping.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc, Weekday};

use nerve_domain::error::{Error, Result};

/// Parse a timezone string, falling back to UTC.
pub fn parse_tz(tz: &str) -> chrono_tz::Tz {
    tz.parse::<chrono_tz::Tz>().unwrap_or(chrono_tz::UTC)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freq {
    Minutely,
    Hourly,
    Daily,
    Weekly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rrule {
    pub freq: Freq,
    pub interval: u32,
    pub by_hour: Option<u32>,
    pub by_minute: Option<u32>,
    pub by_day: Option<Weekday>,
}

fn parse_weekday(s: &str) -> Option<Weekday> {
    match s {
        "MO" => Some(Weekday::Mon),
        "TU" => Some(Weekday::Tue),
        "WE" => Some(Weekday::Wed),
        "TH" => Some(Weekday::Thu),
        "FR" => Some(Weekday::Fri),
        "SA" => Some(Weekday::Sat),
        "SU" => Some(Weekday::Sun),
        _ => None,
    }
}

impl Rrule {
    /// Parse `KEY=VALUE;...` form. Unknown keys are rejected so schedule
    /// typos fail loudly at write time rather than silently never firing.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut freq = None;
        let mut interval = 1u32;
        let mut by_hour = None;
        let mut by_minute = None;
        let mut by_day = None;

        for part in raw.split(';').filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| Error::Validation(format!("bad rrule component: {part:?}")))?;
            match key {
                "FREQ" => {
                    freq = Some(match value {
                        "MINUTELY" => Freq::Minutely,
                        "HOURLY" => Freq::Hourly,
                        "DAILY" => Freq::Daily,
                        "WEEKLY" => Freq::Weekly,
                        other => return Err(Error::Validation(format!("unsupported FREQ: {other}"))),
                    });
                }
                "INTERVAL" => {
                    interval = value
                        .parse::<u32>()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or_else(|| Error::Validation(format!("bad INTERVAL: {value}")))?;
                }
                "BYHOUR" => {
                    by_hour = Some(
                        value
                            .parse::<u32>()
                            .ok()
                            .filter(|h| *h < 24)
                            .ok_or_else(|| Error::Validation(format!("bad BYHOUR: {value}")))?,
                    );
                }
                "BYMINUTE" => {
                    by_minute = Some(
                        value
                            .parse::<u32>()
                            .ok()
                            .filter(|m| *m < 60)
                            .ok_or_else(|| Error::Validation(format!("bad BYMINUTE: {value}")))?,
                    );
                }
                "BYDAY" => {
                    by_day = Some(
                        parse_weekday(value).ok_or_else(|| Error::Validation(format!("bad BYDAY: {value}")))?,
                    );
                }
                other => return Err(Error::Validation(format!("unsupported rrule key: {other}"))),
            }
        }

        Ok(Self {
            freq: freq.ok_or_else(|| Error::Validation("rrule missing FREQ".into()))?,
            interval,
            by_hour,
            by_minute,
            by_day,
        })
    }

    /// Nominal period in seconds, used for the catch-up window.
    pub fn period_seconds(&self) -> i64 {
        let base = match self.freq {
            Freq::Minutely => 60,
            Freq::Hourly => 3_600,
            Freq::Daily => 86_400,
            Freq::Weekly => 604_800,
        };
        base * self.interval as i64
    }

    /// Whether a local naive minute matches the rule.
    fn matches_local(&self, dt: &chrono::NaiveDateTime) -> bool {
        let day_index = dt.date().num_days_from_ce();
        match self.freq {
            Freq::Minutely => {
                let minute_index = day_index as i64 * 1_440 + dt.hour() as i64 * 60 + dt.minute() as i64;
                minute_index % self.interval as i64 == 0
            }
            Freq::Hourly => {
                dt.minute() == self.by_minute.unwrap_or(0)
                    && (day_index as i64 * 24 + dt.hour() as i64) % self.interval as i64 == 0
            }
            Freq::Daily => {
                dt.hour() == self.by_hour.unwrap_or(0)
                    && dt.minute() == self.by_minute.unwrap_or(0)
                    && day_index as i64 % self.interval as i64 == 0
            }
            Freq::Weekly => {
                dt.weekday() == self.by_day.unwrap_or(Weekday::Mon)
                    && dt.hour() == self.by_hour.unwrap_or(0)
                    && dt.minute() == self.by_minute.unwrap_or(0)
                    && (day_index as i64 / 7) % self.interval as i64 == 0
            }
        }
    }

    /// Next occurrence strictly after `after`, evaluated in `tz`. Scans
    /// minute by minute with a one-year bound.
    pub fn next_occurrence(&self, after: &DateTime<Utc>, tz: chrono_tz::Tz) -> Option<DateTime<Utc>> {
        let local_after = after.with_timezone(&tz).naive_local();
        let advance = 60 - local_after.second() as i64;
        let mut candidate = (local_after + chrono::Duration::seconds(advance))
            .with_second(0)
            .unwrap_or(local_after);

        let max_checks = 366 * 24 * 60;
        for _ in 0..max_checks {
            if self.matches_local(&candidate) {
                match tz.from_local_datetime(&candidate) {
                    chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                    chrono::LocalResult::Ambiguous(earliest, _) => return Some(earliest.with_timezone(&Utc)),
                    chrono::LocalResult::None => {
                        // DST gap: this local minute does not exist.
                    }
                }
            }
            candidate += chrono::Duration::minutes(1);
        }
        None
    }
}
