use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use nom::character::complete::char;
use nom::combinator::{map_res, opt};
use nom::sequence::{preceded, terminated, tuple};

use crate::common::parser::{NomResult, consume_all, p_u32};

fn p_hms_time(input: &str) -> NomResult<Duration> {
    map_res(
        tuple((
            p_u32,
            opt(preceded(char(':'), p_u32)),
            opt(preceded(char(':'), p_u32)),
        )),
        |parsed| match parsed {
            (seconds, None, None) => Ok(Duration::from_secs(seconds as u64)),
            (minutes, Some(seconds), None) => {
                Ok(Duration::from_secs(minutes as u64 * 60 + seconds as u64))
            }
            (hours, Some(minutes), Some(seconds)) => Ok(Duration::from_secs(
                hours as u64 * 3600 + minutes as u64 * 60 + seconds as u64,
            )),
            _ => Err(anyhow!("Invalid time specification")),
        },
    )(input)
}

/// Parses time strings in the format [[hh:]mm:]ss.
/// Individual time values may be zero padded.
pub fn parse_hms_time(input: &str) -> anyhow::Result<Duration> {
    consume_all(p_hms_time, input)
}

/// Accepts both `HH:MM:SS` and humantime durations such as `2h 30m`.
pub fn parse_hms_or_human_time(text: &str) -> anyhow::Result<Duration> {
    parse_hms_time(text)
        .or_else(|_| humantime::parse_duration(text))
        .map_err(|error| {
            anyhow!("Could not parse duration. Use either `HH:MM:SS` or humantime format (2hours): {error:?}")
        })
}

fn p_day_hms_time(input: &str) -> NomResult<Duration> {
    map_res(
        tuple((opt(terminated(p_u32, char('-'))), p_hms_time)),
        |(days, time)| -> anyhow::Result<Duration> {
            let days = Duration::from_secs(days.unwrap_or(0) as u64 * 24 * 3600);
            Ok(days + time)
        },
    )(input)
}

/// Parses time strings in the format [days-][[hh:]mm:]ss, as printed by Slurm.
pub fn parse_day_hms_time(input: &str) -> anyhow::Result<Duration> {
    consume_all(p_day_hms_time, input)
}

/// Format a duration as a `HH:MM:SS` string, e.g. 01:05:02.
/// Hours are not wrapped into days.
pub fn format_hms_duration(duration: &Duration) -> String {
    let mut seconds = duration.as_secs();
    let hours = seconds / 3600;
    seconds %= 3600;
    let minutes = seconds / 60;
    seconds %= 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

pub fn local_datetime(datetime: NaiveDateTime) -> Option<DateTime<Local>> {
    Local.from_local_datetime(&datetime).earliest()
}
