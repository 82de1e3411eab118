//! Time-of-day synchronisation between recorded rows and the wall clock.
//!
//! Rows are compared against "now" only within a recurring 24 hour cycle: the calendar date of
//! a record is discarded, so a dataset captured on any day replays at the matching time of day.

use crate::config::{ClockZone, CsvConfig, LateRowPolicy, ReplayOptions, TimestampFormat};
use crate::domain::Row;
use chrono::{
    DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Timelike, Utc,
};
use std::time::Duration;
use thiserror::Error;

pub const DAY_MS: u32 = 86_400_000;

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];
const OFFSET_DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"];
const TIME_FORMATS: &[&str] = &["%H:%M:%S%.f", "%H:%M"];

/// Source of "now", expressed as a naive wall-clock value in the replay zone.
pub trait ReplayClock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    zone: ClockZone,
}

impl SystemClock {
    pub fn new(zone: ClockZone) -> Self {
        Self { zone }
    }
}

impl ReplayClock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        match self.zone {
            ClockZone::Local => Local::now().naive_local(),
            ClockZone::Utc => Utc::now().naive_utc(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimestampError {
    #[error("missing timestamp column `{column}`")]
    MissingColumn { column: String },
    #[error("value `{value}` in column `{column}` is not a valid {format} timestamp")]
    Unparseable {
        column: String,
        value: String,
        format: &'static str,
    },
    #[error("timestamp `{value}` does not exist in the replay time zone")]
    OutOfRange { value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleDecision {
    Wait(Duration),
    SkipPast,
    SkipTooFarFuture,
    Abort(TimestampError),
}

impl ScheduleDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleDecision::Wait(_) => "wait",
            ScheduleDecision::SkipPast => "skip_past",
            ScheduleDecision::SkipTooFarFuture => "skip_too_far_future",
            ScheduleDecision::Abort(_) => "abort",
        }
    }
}

/// A record's timestamp, resolved into the replay zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordTime {
    pub local: NaiveDateTime,
    pub epoch_ms: i64,
}

impl RecordTime {
    pub fn time_of_day(&self) -> u32 {
        time_of_day(self.local.time())
    }
}

/// Milliseconds since midnight, always in `[0, DAY_MS)`.
pub fn time_of_day(time: NaiveTime) -> u32 {
    let seconds = time.hour() * 3600 + time.minute() * 60 + time.second();
    // leap seconds report nanos >= 1e9
    let millis = (time.nanosecond() / 1_000_000).min(999);
    seconds * 1000 + millis
}

#[derive(Debug, Clone)]
pub struct TimeSynchronizer {
    column: String,
    format: TimestampFormat,
    zone: ClockZone,
    max_wait_ms: u64,
    late_rows: LateRowPolicy,
}

impl TimeSynchronizer {
    pub fn new(csv: &CsvConfig, replay: &ReplayOptions) -> Self {
        Self {
            column: csv.timestamp_column.clone(),
            format: csv.timestamp_format,
            zone: replay.clock,
            max_wait_ms: replay.max_wait_ms,
            late_rows: replay.late_rows,
        }
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    /// Extracts and parses the timestamp column. `today` dates bare time-of-day values.
    pub fn record_time(&self, row: &Row, today: NaiveDate) -> Result<RecordTime, TimestampError> {
        let parsed = self.parse(row, today)?;
        let epoch_ms = match parsed.epoch_ms {
            Some(epoch_ms) => epoch_ms,
            None => self
                .epoch_millis(parsed.local)
                .ok_or_else(|| TimestampError::OutOfRange {
                    value: parsed.raw.to_string(),
                })?,
        };
        Ok(RecordTime {
            local: parsed.local,
            epoch_ms,
        })
    }

    /// The record's wall-clock value in the replay zone. Naive values are taken as written,
    /// so a time inside a daylight-saving gap still has a time of day.
    pub fn wall_time(&self, row: &Row, today: NaiveDate) -> Result<NaiveDateTime, TimestampError> {
        self.parse(row, today).map(|parsed| parsed.local)
    }

    fn parse<'r>(&self, row: &'r Row, today: NaiveDate) -> Result<Parsed<'r>, TimestampError> {
        let raw = row
            .get(&self.column)
            .ok_or_else(|| TimestampError::MissingColumn {
                column: self.column.clone(),
            })?;

        let unparseable = || TimestampError::Unparseable {
            column: self.column.clone(),
            value: raw.to_string(),
            format: self.format.as_str(),
        };

        match self.format {
            TimestampFormat::UnixMs => {
                let millis = parse_epoch_millis(raw).ok_or_else(unparseable)?;
                let utc = DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(unparseable)?;
                Ok(Parsed {
                    raw,
                    local: self.to_zone(utc),
                    epoch_ms: Some(millis),
                })
            }
            TimestampFormat::Iso => {
                let value = raw.trim();
                if let Some(utc) = parse_offset_datetime(value) {
                    return Ok(Parsed {
                        raw,
                        local: self.to_zone(utc),
                        epoch_ms: Some(utc.timestamp_millis()),
                    });
                }
                let local = parse_naive(value, today).ok_or_else(unparseable)?;
                Ok(Parsed {
                    raw,
                    local,
                    epoch_ms: None,
                })
            }
        }
    }

    /// Classifies a record's time-of-day against the wall clock's.
    pub fn decide(&self, record: NaiveTime, now: NaiveTime) -> ScheduleDecision {
        let diff = i64::from(time_of_day(record)) - i64::from(time_of_day(now));

        if diff < 0 {
            return match self.late_rows {
                LateRowPolicy::Skip => ScheduleDecision::SkipPast,
                LateRowPolicy::CatchUp => ScheduleDecision::Wait(Duration::ZERO),
            };
        }

        let diff = diff as u64;
        if diff < self.max_wait_ms {
            ScheduleDecision::Wait(Duration::from_millis(diff))
        } else {
            ScheduleDecision::SkipTooFarFuture
        }
    }

    pub fn classify(&self, row: &Row, now: NaiveDateTime) -> ScheduleDecision {
        match self.wall_time(row, now.date()) {
            Ok(record) => self.decide(record.time(), now.time()),
            Err(err) => ScheduleDecision::Abort(err),
        }
    }

    fn to_zone(&self, utc: DateTime<Utc>) -> NaiveDateTime {
        match self.zone {
            ClockZone::Local => utc.with_timezone(&Local).naive_local(),
            ClockZone::Utc => utc.naive_utc(),
        }
    }

    /// Time of day at which a record at `record_ms` is first inside the wait window, with
    /// half the window left as headroom. Never before midnight, because time-of-day
    /// comparisons do not wrap.
    pub fn window_opens(&self, record_ms: u32) -> u32 {
        let lead = u32::try_from(self.max_wait_ms / 2).unwrap_or(u32::MAX);
        record_ms.saturating_sub(lead)
    }

    /// Naive values in a daylight-saving gap resolve to the instant one hour later.
    fn epoch_millis(&self, local: NaiveDateTime) -> Option<i64> {
        match self.zone {
            ClockZone::Local => Local
                .from_local_datetime(&local)
                .earliest()
                .or_else(|| {
                    let shifted = local.checked_add_signed(TimeDelta::hours(1))?;
                    Local.from_local_datetime(&shifted).earliest()
                })
                .map(|dt| dt.timestamp_millis()),
            ClockZone::Utc => Some(Utc.from_utc_datetime(&local).timestamp_millis()),
        }
    }
}

/// Delay until the wall clock next shows `target_ms`; zero when it shows it now.
pub fn until_time_of_day(target_ms: u32, now: NaiveTime) -> Duration {
    let diff = (i64::from(target_ms) - i64::from(time_of_day(now))).rem_euclid(i64::from(DAY_MS));
    Duration::from_millis(diff as u64)
}

struct Parsed<'r> {
    raw: &'r str,
    local: NaiveDateTime,
    epoch_ms: Option<i64>,
}

fn parse_epoch_millis(raw: &str) -> Option<i64> {
    let value = raw.trim();
    if let Ok(millis) = value.parse::<i64>() {
        return Some(millis);
    }
    let float = value.parse::<f64>().ok().filter(|v| v.is_finite())?;
    if float.abs() > i64::MAX as f64 {
        return None;
    }
    Some(float.trunc() as i64)
}

fn parse_offset_datetime(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    OFFSET_DATETIME_FORMATS
        .iter()
        .find_map(|format| DateTime::parse_from_str(value, format).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
}

fn parse_naive(value: &str, today: NaiveDate) -> Option<NaiveDateTime> {
    if let Some(datetime) = NAIVE_DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
    {
        return Some(datetime);
    }

    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0);
    }

    TIME_FORMATS
        .iter()
        .find_map(|format| NaiveTime::parse_from_str(value, format).ok())
        .map(|time| today.and_time(time))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synchronizer(format: TimestampFormat, late_rows: LateRowPolicy) -> TimeSynchronizer {
        let csv = CsvConfig {
            timestamp_column: "Time".to_string(),
            timestamp_format: format,
            ..CsvConfig::default()
        };
        let replay = ReplayOptions {
            clock: ClockZone::Utc,
            late_rows,
            ..ReplayOptions::default()
        };
        TimeSynchronizer::new(&csv, &replay)
    }

    fn at(date: &str, time: &str) -> NaiveDateTime {
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").expect("date");
        let time = NaiveTime::parse_from_str(time, "%H:%M:%S%.f").expect("time");
        date.and_time(time)
    }

    fn row(time: &str) -> Row {
        Row::from_pairs(1, [("Time", time), ("PowerA", "120"), ("PowerB", "45")])
    }

    #[test]
    fn half_second_ahead_waits_exactly_that_long() {
        let sync = synchronizer(TimestampFormat::Iso, LateRowPolicy::Skip);
        let decision = sync.classify(&row("08:00:00.000"), at("2024-05-02", "07:59:59.500"));
        assert_eq!(decision, ScheduleDecision::Wait(Duration::from_millis(500)));
    }

    #[test]
    fn passed_time_of_day_is_skipped() {
        let sync = synchronizer(TimestampFormat::Iso, LateRowPolicy::Skip);
        let decision = sync.classify(&row("08:00:00.000"), at("2024-05-02", "08:05:00.000"));
        assert_eq!(decision, ScheduleDecision::SkipPast);
    }

    #[test]
    fn catch_up_policy_publishes_late_rows_immediately() {
        let sync = synchronizer(TimestampFormat::Iso, LateRowPolicy::CatchUp);
        let decision = sync.classify(&row("08:00:00.000"), at("2024-05-02", "08:05:00.000"));
        assert_eq!(decision, ScheduleDecision::Wait(Duration::ZERO));
    }

    #[test]
    fn max_wait_is_an_exclusive_bound() {
        let sync = synchronizer(TimestampFormat::Iso, LateRowPolicy::Skip);
        let now = at("2024-05-02", "08:00:00.000");

        assert_eq!(
            sync.classify(&row("08:00:59.999"), now),
            ScheduleDecision::Wait(Duration::from_millis(59_999))
        );
        assert_eq!(
            sync.classify(&row("08:01:00.000"), now),
            ScheduleDecision::SkipTooFarFuture
        );
        assert_eq!(
            sync.classify(&row("08:00:00.000"), now),
            ScheduleDecision::Wait(Duration::ZERO)
        );
    }

    #[test]
    fn calendar_date_is_ignored() {
        let sync = synchronizer(TimestampFormat::Iso, LateRowPolicy::Skip);
        let decision = sync.classify(
            &row("2020-03-17 08:00:00.250"),
            at("2024-05-02", "08:00:00.000"),
        );
        assert_eq!(decision, ScheduleDecision::Wait(Duration::from_millis(250)));
    }

    #[test]
    fn offset_timestamps_convert_into_replay_zone() {
        let sync = synchronizer(TimestampFormat::Iso, LateRowPolicy::Skip);
        let decision = sync.classify(
            &row("2020-03-17T10:00:00.100+02:00"),
            at("2024-05-02", "08:00:00.000"),
        );
        assert_eq!(decision, ScheduleDecision::Wait(Duration::from_millis(100)));
    }

    #[test]
    fn epoch_milliseconds_are_accepted() {
        let sync = synchronizer(TimestampFormat::UnixMs, LateRowPolicy::Skip);
        // 2020-03-17T08:00:01Z
        let record = sync
            .record_time(&row("1584432001000"), NaiveDate::MIN)
            .expect("epoch timestamp");
        assert_eq!(record.epoch_ms, 1_584_432_001_000);
        assert_eq!(record.time_of_day(), 8 * 3_600_000 + 1_000);
    }

    #[test]
    fn missing_timestamp_column_aborts() {
        let sync = synchronizer(TimestampFormat::Iso, LateRowPolicy::Skip);
        let row = Row::from_pairs(1, [("Watts", "3")]);
        assert_eq!(
            sync.classify(&row, at("2024-05-02", "08:00:00.000")),
            ScheduleDecision::Abort(TimestampError::MissingColumn {
                column: "Time".to_string()
            })
        );
    }

    #[test]
    fn malformed_iso_timestamp_aborts() {
        let sync = synchronizer(TimestampFormat::Iso, LateRowPolicy::Skip);
        let decision = sync.classify(&row("not-a-date"), at("2024-05-02", "08:00:00.000"));
        assert!(matches!(
            decision,
            ScheduleDecision::Abort(TimestampError::Unparseable { format: "iso", .. })
        ));
    }

    #[test]
    fn bare_times_are_dated_with_today() {
        let sync = synchronizer(TimestampFormat::Iso, LateRowPolicy::Skip);
        let today = NaiveDate::from_ymd_opt(2024, 5, 2).expect("date");
        let record = sync.record_time(&row("00:00:01"), today).expect("time");
        assert_eq!(record.local, at("2024-05-02", "00:00:01.000"));
        assert_eq!(record.epoch_ms, Utc.from_utc_datetime(&record.local).timestamp_millis());
    }

    #[test]
    fn window_opens_half_the_wait_bound_before_the_record() {
        let sync = synchronizer(TimestampFormat::Iso, LateRowPolicy::Skip);
        assert_eq!(sync.window_opens(120_000), 90_000);
        assert_eq!(sync.window_opens(1_000), 0);
    }

    #[test]
    fn delay_until_time_of_day_wraps_past_midnight() {
        let noon = NaiveTime::from_hms_opt(12, 0, 0).expect("time");
        assert_eq!(
            until_time_of_day(13 * 3_600_000, noon),
            Duration::from_secs(3_600)
        );
        assert_eq!(
            until_time_of_day(1_000, noon),
            Duration::from_millis(12 * 3_600_000 + 1_000)
        );
        assert_eq!(until_time_of_day(12 * 3_600_000, noon), Duration::ZERO);
    }

    #[test]
    fn time_of_day_counts_milliseconds_since_midnight() {
        let time = NaiveTime::from_hms_milli_opt(23, 59, 59, 999).expect("time");
        assert_eq!(time_of_day(time), DAY_MS - 1);
        assert_eq!(time_of_day(NaiveTime::MIN), 0);
    }
}
