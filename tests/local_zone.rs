use chrono::{NaiveDate, NaiveDateTime};
use std::sync::Once;
use std::time::Duration;
use syntised::config::{ClockZone, CsvConfig, ReplayOptions};
use syntised::domain::Row;
use syntised::replay::{ScheduleDecision, TimeSynchronizer};

static ZONE: Once = Once::new();

/// Central European rules: clocks jump from 02:00 to 03:00 on the last Sunday of March.
fn central_european_local_zone() -> TimeSynchronizer {
    ZONE.call_once(|| std::env::set_var("TZ", "CET-1CEST,M3.5.0,M10.5.0/3"));
    let csv = CsvConfig {
        timestamp_column: "Time".to_string(),
        ..CsvConfig::default()
    };
    let replay = ReplayOptions {
        clock: ClockZone::Local,
        ..ReplayOptions::default()
    };
    TimeSynchronizer::new(&csv, &replay)
}

fn at(value: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f").expect("datetime")
}

#[test]
fn times_inside_the_spring_forward_gap_still_schedule() {
    let sync = central_european_local_zone();
    let row = Row::from_pairs(2, [("Time", "2020-03-29 02:30:00"), ("Power", "5")]);

    let decision = sync.classify(&row, at("2020-03-29 02:29:59.500"));
    assert_eq!(decision, ScheduleDecision::Wait(Duration::from_millis(500)));

    let bare = Row::from_pairs(3, [("Time", "02:30:00"), ("Power", "5")]);
    let decision = sync.classify(&bare, at("2020-03-29 02:29:59.500"));
    assert_eq!(decision, ScheduleDecision::Wait(Duration::from_millis(500)));
}

#[test]
fn gap_times_resolve_one_hour_later_for_historical_timestamps() {
    let sync = central_european_local_zone();
    let row = Row::from_pairs(2, [("Time", "2020-03-29 02:30:00"), ("Power", "5")]);
    let today = NaiveDate::from_ymd_opt(2020, 3, 29).expect("date");

    let record = sync.record_time(&row, today).expect("gap time resolves");
    // 03:30 CEST
    assert_eq!(record.epoch_ms, 1_585_445_400_000);
}
