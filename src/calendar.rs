//! Conversions between engine instants and the business calendar.
//!
//! The engine stores everything as [`Ms`]; weekday and "same calendar day"
//! rules are evaluated in one configured fixed UTC offset.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, TimeZone};

use crate::model::Ms;

pub fn to_local(ms: Ms, offset: FixedOffset) -> Option<DateTime<FixedOffset>> {
    DateTime::from_timestamp_millis(ms).map(|utc| utc.with_timezone(&offset))
}

pub fn local_date(ms: Ms, offset: FixedOffset) -> Option<NaiveDate> {
    to_local(ms, offset).map(|dt| dt.date_naive())
}

/// 0 = Monday … 6 = Sunday.
pub fn weekday_index(ms: Ms, offset: FixedOffset) -> Option<u8> {
    to_local(ms, offset).map(|dt| dt.weekday().num_days_from_monday() as u8)
}

pub fn date_weekday_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_monday() as u8
}

/// The instant at which `time` occurs on `date` in the business offset.
pub fn instant_at(date: NaiveDate, time: NaiveTime, offset: FixedOffset) -> Option<Ms> {
    offset
        .from_local_datetime(&date.and_time(time))
        .single()
        .map(|dt| dt.timestamp_millis())
}

pub fn offset_from_minutes(minutes: i32) -> Option<FixedOffset> {
    FixedOffset::east_opt(minutes.checked_mul(60)?)
}
