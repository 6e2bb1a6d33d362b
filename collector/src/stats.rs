use std::{collections::BTreeMap, str::FromStr};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use serde_json::Value;

use coldroom_common::{
    chart::{format_display_timestamp, DB_TIMESTAMP_FORMAT},
    SensorSeries,
};

use crate::store::{ColdRoom, TemperatureRecord};

const TREND_WINDOW: usize = 5;
const TREND_THRESHOLD_C: f64 = 0.5;
const DISPLAY_FORMAT: &str = "%d-%m-%Y %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Rising,
    Falling,
    Stable,
}

impl Trend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rising => "rising",
            Self::Falling => "falling",
            Self::Stable => "stable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomStats {
    pub avg_temp: Option<f64>,
    pub min_temp: Option<f64>,
    pub max_temp: Option<f64>,
    pub readings_count: usize,
    pub trend: Trend,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingView {
    pub temperature: f64,
    pub timestamp: String,
    pub seconds_ago: Option<i64>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Aggregation {
    #[default]
    Full,
    Hourly,
    Daily,
}

impl Aggregation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Hourly => "hourly",
            Self::Daily => "daily",
        }
    }
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "full" | "" => Ok(Self::Full),
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            other => Err(format!("Unknown aggregation '{other}'. Use full, hourly or daily")),
        }
    }
}

/// One hourly or daily bucket of an export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateRow {
    pub timestamp: String,
    pub avg_temp: f64,
    pub min_temp: f64,
    pub max_temp: f64,
    pub readings: usize,
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}

/// Compares the mean of the newest readings with the mean of the oldest ones.
pub fn trend(temps_newest_first: &[f64]) -> Trend {
    if temps_newest_first.len() < 2 {
        return Trend::Stable;
    }

    let window = TREND_WINDOW.min(temps_newest_first.len());
    let recent = mean(&temps_newest_first[..window]);
    let older = mean(&temps_newest_first[temps_newest_first.len() - window..]);

    if recent > older + TREND_THRESHOLD_C {
        Trend::Rising
    } else if recent < older - TREND_THRESHOLD_C {
        Trend::Falling
    } else {
        Trend::Stable
    }
}

/// Temperatures recorded in the 24 hours before `now`, in input order.
pub fn temps_24h(records: &[&TemperatureRecord], now: DateTime<Utc>) -> Vec<f64> {
    let since = now - Duration::hours(24);
    records
        .iter()
        .filter(|record| record.recorded_at().is_some_and(|at| at >= since))
        .map(|record| record.temperature)
        .collect()
}

pub fn stats_24h(records_newest_first: &[&TemperatureRecord], now: DateTime<Utc>) -> RoomStats {
    let temps = temps_24h(records_newest_first, now);

    if temps.is_empty() {
        return RoomStats {
            avg_temp: None,
            min_temp: None,
            max_temp: None,
            readings_count: 0,
            trend: Trend::Stable,
        };
    }

    let min = temps.iter().copied().fold(f64::INFINITY, f64::min);
    let max = temps.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    RoomStats {
        avg_temp: Some(round_to(mean(&temps), 1)),
        min_temp: Some(round_to(min, 1)),
        max_temp: Some(round_to(max, 1)),
        readings_count: temps.len(),
        trend: trend(&temps),
    }
}

/// Formats a stored UTC timestamp in the display timezone as `dd-mm-YYYY HH:MM:SS`.
pub fn display_timestamp(record: &TemperatureRecord, tz: Tz) -> String {
    match record.recorded_at() {
        Some(at) => at.with_timezone(&tz).format(DISPLAY_FORMAT).to_string(),
        None => format_display_timestamp(&record.timestamp),
    }
}

pub fn reading_view(
    record: &TemperatureRecord,
    now: DateTime<Utc>,
    tz: Tz,
    active_window_secs: i64,
) -> ReadingView {
    let seconds_ago = record
        .recorded_at()
        .map(|at| (now - at).num_seconds().max(0));

    ReadingView {
        temperature: record.temperature,
        timestamp: display_timestamp(record, tz),
        seconds_ago,
        is_active: seconds_ago.is_none_or(|secs| secs <= active_window_secs),
    }
}

/// Keeps readings whose UTC calendar date lies within the inclusive range.
pub fn filter_by_date<'a>(
    records: &[&'a TemperatureRecord],
    date_from: Option<NaiveDate>,
    date_to: Option<NaiveDate>,
) -> Vec<&'a TemperatureRecord> {
    records
        .iter()
        .copied()
        .filter(|record| {
            let Some(date) = record.recorded_at().map(|at| at.date_naive()) else {
                return false;
            };
            date_from.is_none_or(|from| date >= from) && date_to.is_none_or(|to| date <= to)
        })
        .collect()
}

/// Buckets readings by hour or day; rows come back newest first.
pub fn aggregate(records: &[&TemperatureRecord], aggregation: Aggregation) -> Vec<AggregateRow> {
    let bucket_format = match aggregation {
        Aggregation::Full => return Vec::new(),
        Aggregation::Hourly => "%Y-%m-%d %H:00:00",
        Aggregation::Daily => "%Y-%m-%d",
    };

    let mut buckets: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for record in records {
        if let Some(at) = record.recorded_at() {
            buckets
                .entry(at.format(bucket_format).to_string())
                .or_default()
                .push(record.temperature);
        }
    }

    buckets
        .into_iter()
        .rev()
        .map(|(timestamp, temps)| AggregateRow {
            timestamp,
            avg_temp: mean(&temps),
            min_temp: temps.iter().copied().fold(f64::INFINITY, f64::min),
            max_temp: temps.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            readings: temps.len(),
        })
        .collect()
}

/// Series label shown in the chart legend.
pub fn series_label(room: &ColdRoom) -> String {
    match room.sensor_id.as_deref() {
        Some(sensor) => format!("{} (Sensor: {sensor})", room.name),
        None => format!("{} (No Sensor)", room.name),
    }
}

/// Chart input for one room, oldest reading first, with x values in the display timezone.
pub fn chart_source(
    room: &ColdRoom,
    records_newest_first: &[&TemperatureRecord],
    tz: Tz,
) -> Value {
    let mut series = SensorSeries::default();
    for record in records_newest_first.iter().rev() {
        let timestamp = match record.recorded_at() {
            Some(at) => at.with_timezone(&tz).format(DB_TIMESTAMP_FORMAT).to_string(),
            None => record.timestamp.clone(),
        };
        series.timestamps.push(timestamp);
        series.temperatures.push(Some(record.temperature));
    }

    let mut sensors = serde_json::Map::new();
    sensors.insert(
        series_label(room),
        serde_json::to_value(series).unwrap_or(Value::Null),
    );
    Value::Object(sensors)
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
