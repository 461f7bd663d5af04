//! Calendar-aware time periods.
//!
//! A [`TimePeriod`] mixes calendar-variable units (years, months) with fixed
//! units (weeks down to milliseconds). Adding one month to a timestamp moves
//! it by 28 to 31 days depending on where it starts, so every delta is
//! computed against a concrete timestamp by [`CalendarDelta`].
//!
//! All arithmetic is in UTC on engine milliseconds.

use std::fmt;
use std::str::FromStr;

// used for the calendar month arithmetic
use chrono::{DateTime, Months, NaiveDateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;

use crate::datatype::Timestamp;
use crate::error::{ContinuumError, Result};

const MILLIS_PER_SECOND: i64 = 1_000;
const MILLIS_PER_MINUTE: i64 = 60 * MILLIS_PER_SECOND;
const MILLIS_PER_HOUR: i64 = 60 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;
const SHORTEST_MONTH: i64 = 28 * MILLIS_PER_DAY;
const LONGEST_MONTH: i64 = 31 * MILLIS_PER_DAY;

lazy_static! {
    static ref PERIOD_PART: Regex = Regex::new(
        r"(?i)(-?\d+)\s*(years?|months?|weeks?|days?|hours?|minutes?|min|seconds?|sec|milliseconds?|msec)\b"
    )
    .unwrap();
}

// ------------- Conversions -------------
pub fn to_datetime(ts: Timestamp) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ts)
        .ok_or_else(|| ContinuumError::Evaluation(format!("timestamp {} is out of range", ts)))
}

pub fn datetime_to_millis<Tz: TimeZone>(dt: &DateTime<Tz>) -> Timestamp {
    dt.timestamp_millis()
}

/// Parses `2002-02-15T09:00:00.000` (milliseconds optional) as UTC.
pub fn parse_iso(text: &str) -> Result<Timestamp> {
    let parsed = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
        .map_err(|e| ContinuumError::Evaluation(format!("cannot parse '{}' as a timestamp: {}", text, e)))?;
    Ok(parsed.and_utc().timestamp_millis())
}

pub fn format_millis(ts: Timestamp) -> String {
    match DateTime::from_timestamp_millis(ts) {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
        None => ts.to_string(),
    }
}

// ------------- TimePeriod -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TimePeriod {
    pub years: i32,
    pub months: i32,
    pub weeks: i64,
    pub days: i64,
    pub hours: i64,
    pub minutes: i64,
    pub seconds: i64,
    pub millis: i64,
}

impl TimePeriod {
    pub fn years(n: i32) -> Self {
        Self { years: n, ..Self::default() }
    }
    pub fn months(n: i32) -> Self {
        Self { months: n, ..Self::default() }
    }
    pub fn days(n: i64) -> Self {
        Self { days: n, ..Self::default() }
    }
    pub fn hours(n: i64) -> Self {
        Self { hours: n, ..Self::default() }
    }
    pub fn minutes(n: i64) -> Self {
        Self { minutes: n, ..Self::default() }
    }
    pub fn seconds(n: i64) -> Self {
        Self { seconds: n, ..Self::default() }
    }
    pub fn millis(n: i64) -> Self {
        Self { millis: n, ..Self::default() }
    }
    pub fn parse(text: &str) -> Result<Self> {
        text.parse()
    }

    pub fn is_calendar(&self) -> bool {
        self.years != 0 || self.months != 0
    }
    pub fn total_months(&self) -> i64 {
        self.years as i64 * 12 + self.months as i64
    }
    pub fn fixed_millis(&self) -> i64 {
        self.weeks * 7 * MILLIS_PER_DAY
            + self.days * MILLIS_PER_DAY
            + self.hours * MILLIS_PER_HOUR
            + self.minutes * MILLIS_PER_MINUTE
            + self.seconds * MILLIS_PER_SECOND
            + self.millis
    }
    /// Bounds on the length of one period, whatever timestamp it starts at.
    fn length_bounds(&self) -> (i64, i64) {
        let months = self.total_months();
        let fixed = self.fixed_millis();
        if months >= 0 {
            (months * SHORTEST_MONTH + fixed, months * LONGEST_MONTH + fixed)
        } else {
            (months * LONGEST_MONTH + fixed, months * SHORTEST_MONTH + fixed)
        }
    }

    /// `ts` moved by `times` whole periods. The month part is applied in one
    /// step from `ts`, so a day-of-month that does not exist in the target
    /// month clamps to that month's last day without drifting later steps.
    pub fn add_to(&self, ts: Timestamp, times: i64) -> Result<Timestamp> {
        let overflow = || ContinuumError::Evaluation(format!("time period {} overflows at {}", self, ts));
        let fixed = self.fixed_millis().checked_mul(times).ok_or_else(overflow)?;
        if !self.is_calendar() {
            return ts.checked_add(fixed).ok_or_else(overflow);
        }
        let months = self.total_months().checked_mul(times).ok_or_else(overflow)?;
        let step = Months::new(u32::try_from(months.unsigned_abs()).map_err(|_| overflow())?);
        let dt = to_datetime(ts)?;
        let shifted = if months >= 0 {
            dt.checked_add_months(step)
        } else {
            dt.checked_sub_months(step)
        }
        .ok_or_else(overflow)?;
        shifted.timestamp_millis().checked_add(fixed).ok_or_else(overflow)
    }
}

impl FromStr for TimePeriod {
    type Err = ContinuumError;
    fn from_str(text: &str) -> Result<Self> {
        let mut period = TimePeriod::default();
        let mut consumed = 0;
        let mut parts = 0;
        for captures in PERIOD_PART.captures_iter(text) {
            let whole = captures.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
            if !text[consumed..whole.0].trim_matches(|c: char| c.is_whitespace() || c == ',').is_empty() {
                break;
            }
            consumed = whole.1;
            parts += 1;
            let amount: i64 = captures[1]
                .parse()
                .map_err(|_| ContinuumError::InvalidTimePeriod(text.to_string()))?;
            let unit = captures[2].to_lowercase();
            match unit.as_str() {
                "year" | "years" => period.years += amount as i32,
                "month" | "months" => period.months += amount as i32,
                "week" | "weeks" => period.weeks += amount,
                "day" | "days" => period.days += amount,
                "hour" | "hours" => period.hours += amount,
                "minute" | "minutes" | "min" => period.minutes += amount,
                "second" | "seconds" | "sec" => period.seconds += amount,
                _ => period.millis += amount,
            }
        }
        if parts == 0 || !text[consumed..].trim().is_empty() {
            return Err(ContinuumError::InvalidTimePeriod(text.to_string()));
        }
        Ok(period)
    }
}

impl fmt::Display for TimePeriod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let parts = [
            (self.years as i64, "year"),
            (self.months as i64, "month"),
            (self.weeks, "week"),
            (self.days, "day"),
            (self.hours, "hour"),
            (self.minutes, "minute"),
            (self.seconds, "second"),
            (self.millis, "millisecond"),
        ];
        let rendered: Vec<String> = parts
            .iter()
            .filter(|(n, _)| *n != 0)
            .map(|(n, unit)| format!("{} {}{}", n, unit, if n.abs() == 1 { "" } else { "s" }))
            .collect();
        if rendered.is_empty() {
            write!(f, "0 milliseconds")
        } else {
            write!(f, "{}", rendered.join(" "))
        }
    }
}

// ------------- CalendarDelta -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaResult {
    pub delta: i64,
    pub last_reference: Timestamp,
}

/// Computes millisecond deltas for one period relative to concrete timestamps.
#[derive(Debug, Clone)]
pub struct CalendarDelta {
    period: TimePeriod,
    shortest: i64,
    longest: i64,
}

impl CalendarDelta {
    pub fn new(period: TimePeriod) -> Result<Self> {
        let (shortest, longest) = period.length_bounds();
        if shortest <= 0 {
            return Err(ContinuumError::InvalidTimePeriod(format!(
                "{} does not always move time forward",
                period
            )));
        }
        Ok(Self { period, shortest, longest })
    }
    pub fn period(&self) -> &TimePeriod {
        &self.period
    }

    /// Milliseconds from `ts` to `ts` plus one period.
    pub fn delta_add(&self, ts: Timestamp) -> Result<i64> {
        Ok(self.period.add_to(ts, 1)? - ts)
    }

    /// Milliseconds from `ts` minus one period to `ts`.
    pub fn delta_subtract(&self, ts: Timestamp) -> Result<i64> {
        Ok(ts - self.period.add_to(ts, -1)?)
    }

    /// Treats `reference` as an anchor recurring every period and finds the
    /// anchor `r` with `r <= current < r + period`. Returns the distance from
    /// `current` to the next anchor along with `r`, which callers keep as the
    /// reference for their next query.
    pub fn delta_add_with_reference(&self, current: Timestamp, reference: Timestamp) -> Result<DeltaResult> {
        let overflow = || ContinuumError::Evaluation(format!("time period {} overflows at {}", self.period, current));
        let span = |from: Timestamp, to: Timestamp| to.checked_sub(from).ok_or_else(overflow);
        if !self.period.is_calendar() {
            let length = self.shortest;
            let offset = span(reference, current)?.rem_euclid(length);
            return Ok(DeltaResult {
                delta: length - offset,
                last_reference: span(offset, current)?,
            });
        }
        let anchor = |k: i64| self.period.add_to(reference, k);

        // Start from a step count known to land at or before `current`.
        let mut k = if reference <= current {
            span(reference, current)? / self.longest
        } else {
            let behind = span(current, reference)?.checked_add(self.shortest - 1).ok_or_else(overflow)?;
            -(behind / self.shortest)
        };
        loop {
            let jump = span(anchor(k)?, current)? / self.longest;
            if jump <= 0 {
                break;
            }
            k += jump;
        }
        while anchor(k)? > current {
            k -= 1;
        }
        loop {
            let next = anchor(k + 1)?;
            if next > current {
                return Ok(DeltaResult {
                    delta: span(current, next)?,
                    last_reference: anchor(k)?,
                });
            }
            k += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Timestamp {
        parse_iso(text).unwrap()
    }

    #[test]
    fn parse_period_text() {
        let p = TimePeriod::parse("1 year 2 months 3 days 4 hours 5 minutes 6 seconds 7 milliseconds").unwrap();
        assert_eq!(p.years, 1);
        assert_eq!(p.months, 2);
        assert_eq!(p.fixed_millis(), 3 * MILLIS_PER_DAY + 4 * MILLIS_PER_HOUR + 5 * MILLIS_PER_MINUTE + 6_007);
        assert_eq!(TimePeriod::parse("2 sec").unwrap(), TimePeriod::seconds(2));
        assert_eq!(TimePeriod::parse("1 week").unwrap().fixed_millis(), 7 * MILLIS_PER_DAY);
        assert!(TimePeriod::parse("fortnight").is_err());
        assert!(TimePeriod::parse("1 month and a bit").is_err());
        assert_eq!(TimePeriod::months(1).to_string(), "1 month");
    }

    #[test]
    fn zero_or_backward_periods_are_rejected() {
        assert!(CalendarDelta::new(TimePeriod::default()).is_err());
        assert!(CalendarDelta::new(TimePeriod::months(-1)).is_err());
        assert!(CalendarDelta::new(TimePeriod { months: 1, days: -1, ..TimePeriod::default() }).is_ok());
    }

    #[test]
    fn month_delta_follows_february() {
        let month = CalendarDelta::new(TimePeriod::months(1)).unwrap();
        let four_weeks = 28 * MILLIS_PER_DAY;
        assert_eq!(month.delta_add(parse("2002-02-15T09:00:00.000")).unwrap(), four_weeks);
        assert_eq!(month.delta_subtract(parse("2002-03-15T09:00:00.000")).unwrap(), four_weeks);
        assert_eq!(month.delta_add(parse("2002-03-15T09:00:00.000")).unwrap(), 31 * MILLIS_PER_DAY);
    }

    #[test]
    fn fixed_period_reference_is_modular() {
        let delta = CalendarDelta::new(TimePeriod::seconds(10)).unwrap();
        let r = delta.delta_add_with_reference(25_000, 3_000).unwrap();
        assert_eq!(r, DeltaResult { delta: 8_000, last_reference: 23_000 });
        let r = delta.delta_add_with_reference(25_000, 1_000_003_000).unwrap();
        assert_eq!(r, DeltaResult { delta: 8_000, last_reference: 23_000 });
    }

    #[test]
    fn reference_stepping_from_near_and_far() {
        let month = CalendarDelta::new(TimePeriod::months(1)).unwrap();
        let at = |c: &str, r: &str| month.delta_add_with_reference(parse(c), parse(r)).unwrap();

        let r = at("2002-02-15T09:00:00.000", "2002-02-15T09:00:00.000");
        assert_eq!(r.delta, parse("2002-03-15T09:00:00.000") - parse("2002-02-15T09:00:00.000"));
        assert_eq!(r.last_reference, parse("2002-02-15T09:00:00.000"));

        let r = at("2002-03-15T09:00:00.000", "2002-02-15T09:00:00.000");
        assert_eq!(r.delta, parse("2002-04-15T09:00:00.000") - parse("2002-03-15T09:00:00.000"));
        assert_eq!(r.last_reference, parse("2002-03-15T09:00:00.000"));

        for far in ["2900-03-15T09:00:00.000", "1980-03-15T09:00:00.000"] {
            let r = at("2002-02-15T09:00:00.000", far);
            assert_eq!(r.delta, parse("2002-03-15T09:00:00.000") - parse("2002-02-15T09:00:00.000"));
            assert_eq!(r.last_reference, parse("2002-02-15T09:00:00.000"));
        }

        let r = at("2002-02-18T09:00:00.000", "1980-03-15T09:00:00.000");
        assert_eq!(r.delta, parse("2002-03-15T09:00:00.000") - parse("2002-02-18T09:00:00.000"));
        assert_eq!(r.last_reference, parse("2002-02-15T09:00:00.000"));

        let r = at("2002-02-11T09:00:00.000", "2980-03-15T09:00:00.000");
        assert_eq!(r.delta, parse("2002-02-15T09:00:00.000") - parse("2002-02-11T09:00:00.000"));
        assert_eq!(r.last_reference, parse("2002-01-15T09:00:00.000"));

        let r = at("2002-04-05T09:00:00.000", "2002-02-11T09:01:02.003");
        assert_eq!(r.delta, parse("2002-04-11T09:01:02.003") - parse("2002-04-05T09:00:00.000"));
        assert_eq!(r.last_reference, parse("2002-03-11T09:01:02.003"));
    }

    #[test]
    fn month_end_anchor_clamps_without_drift() {
        let month = CalendarDelta::new(TimePeriod::months(1)).unwrap();
        let anchor = parse("2002-01-31T00:00:00.000");
        let r = month.delta_add_with_reference(parse("2002-03-01T00:00:00.000"), anchor).unwrap();
        assert_eq!(r.last_reference, parse("2002-02-28T00:00:00.000"));
        assert_eq!(r.delta, parse("2002-03-31T00:00:00.000") - parse("2002-03-01T00:00:00.000"));
        let r = month.delta_add_with_reference(parse("2002-04-10T00:00:00.000"), anchor).unwrap();
        assert_eq!(r.last_reference, parse("2002-03-31T00:00:00.000"));
        assert_eq!(r.delta, parse("2002-04-30T00:00:00.000") - parse("2002-04-10T00:00:00.000"));
    }
}
