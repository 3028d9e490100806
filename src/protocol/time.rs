//! Packed timestamp formats used by ZK devices.
//!
//! Devices report wall-clock local time with no zone information, so both
//! decoders produce `NaiveDateTime`.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

/// Decode the compact u32 timestamp (device clock, attendance records).
///
/// The device packs `((((year-2000)*12 + month)*31 + day-1)*24 + hour)*60
/// + minute)*60 + second` with a zero-based month and a fixed 31-day month
/// width. The 31-day arithmetic is the device's published scheme and is
/// kept as-is; impossible dates are clamped to the month's last valid day
/// only when converting to a calendar date.
pub fn decode_compact(raw: u32) -> NaiveDateTime {
    let mut v = raw;
    let second = v % 60;
    v /= 60;
    let minute = v % 60;
    v /= 60;
    let hour = v % 24;
    v /= 24;
    let day = (v % 31) + 1;
    v /= 31;
    let month = (v % 12) + 1;
    v /= 12;
    let year = (v + 2000) as i32;

    to_datetime(year, month, day, hour, minute, second)
}

/// Encode a datetime into the compact u32 format.
pub fn encode_compact(dt: &NaiveDateTime) -> u32 {
    let years = (dt.year() - 2000).max(0) as u32;
    let mut v = years * 12 + dt.month0();
    v = v * 31 + (dt.day() - 1);
    v = v * 24 + dt.hour();
    v = v * 60 + dt.minute();
    v * 60 + dt.second()
}

/// Decode the 6-byte packed timestamp carried by real-time event frames.
///
/// Layout: year-2000, month, day, hour, minute, second.
pub fn decode_sextet(b: &[u8]) -> Option<NaiveDateTime> {
    if b.len() < 6 {
        return None;
    }
    let year = 2000 + i32::from(b[0]);
    Some(to_datetime(
        year,
        u32::from(b[1]),
        u32::from(b[2]),
        u32::from(b[3]),
        u32::from(b[4]),
        u32::from(b[5]),
    ))
}

/// Build a datetime, clamping out-of-range fields to the nearest valid
/// value. Day 31 in a 30-day month becomes day 30, and so on.
fn to_datetime(year: i32, month: u32, day: u32, hour: u32, minute: u32, second: u32) -> NaiveDateTime {
    let month = month.clamp(1, 12);
    let date = NaiveDate::from_ymd_opt(year, month, day).unwrap_or_else(|| {
        let last = last_day_of_month(year, month);
        NaiveDate::from_ymd_opt(year, month, day.min(last).max(1))
            .unwrap_or_else(|| NaiveDate::from_ymd_opt(2000, 1, 1).unwrap())
    });
    date.and_hms_opt(hour.min(23), minute.min(59), second.min(59))
        .unwrap()
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}
