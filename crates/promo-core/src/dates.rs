//! Date normalization for source columns and operator input.
//!
//! Accepts ISO calendar dates, ISO timestamps (date part kept) and the `month.day`
//! shorthand (`2.7`, `2/7`, `02-07`) resolved against a caller-supplied year.

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::CoreError;

const SHORTHAND_SEPARATORS: [char; 3] = ['.', '/', '-'];

const TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

pub fn normalize_date(input: &str, default_year: i32) -> Result<NaiveDate, CoreError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(CoreError::malformed(input, "empty date"));
    }

    if let Some(prefix) = s.get(..10).filter(|p| is_iso_calendar(p)) {
        if s.len() == 10 {
            return NaiveDate::parse_from_str(prefix, "%Y-%m-%d")
                .map_err(|e| CoreError::malformed(input, e.to_string()));
        }
        return parse_timestamp(s).ok_or_else(|| CoreError::malformed(input, "unrecognized timestamp"));
    }

    let Some(sep) = SHORTHAND_SEPARATORS.iter().copied().find(|c| s.contains(*c)) else {
        return Err(CoreError::malformed(input, "unrecognized date format"));
    };

    let parts = s.split(sep).collect::<Vec<_>>();
    let [month, day] = parts.as_slice() else {
        return Err(CoreError::malformed(
            input,
            format!("expected month{sep}day, got {} parts", parts.len()),
        ));
    };
    let month: u32 = month
        .trim()
        .parse()
        .map_err(|_| CoreError::malformed(input, "month is not an integer"))?;
    let day: u32 = day
        .trim()
        .parse()
        .map_err(|_| CoreError::malformed(input, "day is not an integer"))?;

    NaiveDate::from_ymd_opt(default_year, month, day).ok_or_else(|| {
        CoreError::malformed(
            input,
            format!("{default_year}-{month:02}-{day:02} is not a calendar date"),
        )
    })
}

pub fn to_iso(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn is_iso_calendar(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == 10
        && b[4] == b'-'
        && b[7] == b'-'
        && b.iter()
            .enumerate()
            .all(|(i, c)| i == 4 || i == 7 || c.is_ascii_digit())
}

fn parse_timestamp(s: &str) -> Option<NaiveDate> {
    let trimmed = s.strip_suffix('Z').unwrap_or(s);
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .map(|dt| dt.date())
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive()))
}
