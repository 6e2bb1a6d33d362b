use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::{
    stats::{mean, reading_view, round_to, stats_24h, temps_24h, RoomStats},
    store::{ColdRoom, CollectorData, DeviceError},
};

const NORMAL_MIN_C: f64 = -5.0;
const NORMAL_MAX_C: f64 = 5.0;
const ERRORS_PER_ROOM: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TempStatus {
    Normal,
    Alert,
    Offline,
}

impl TempStatus {
    pub fn classify(latest_temp: Option<f64>, is_active: bool) -> Self {
        match latest_temp {
            Some(temp) if is_active && (NORMAL_MIN_C..=NORMAL_MAX_C).contains(&temp) => Self::Normal,
            Some(_) if is_active => Self::Alert,
            _ => Self::Offline,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomSummary {
    #[serde(flatten)]
    pub room: ColdRoom,
    /// Only set while the sensor is active.
    pub latest_temp: Option<f64>,
    pub latest_time: Option<String>,
    pub is_sensor_active: bool,
    pub minutes_ago: Option<f64>,
    pub temp_status: TempStatus,
    #[serde(flatten)]
    pub stats: RoomStats,
    pub device_errors: Vec<DeviceError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedStats {
    pub live_temp: Option<f64>,
    pub avg_24h: Option<f64>,
    pub min_24h: Option<f64>,
    pub max_24h: Option<f64>,
    pub last_update: Option<String>,
    pub minutes_ago: Option<f64>,
    pub online_count: usize,
    pub total_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dashboard {
    pub rooms: Vec<RoomSummary>,
    pub combined: CombinedStats,
}

fn minutes(seconds: i64) -> f64 {
    round_to(seconds as f64 / 60.0, 1)
}

pub fn build_dashboard(
    data: &CollectorData,
    now: DateTime<Utc>,
    tz: Tz,
    active_window_secs: i64,
) -> Dashboard {
    let mut rooms = Vec::with_capacity(data.rooms().len());
    let mut live_temps = Vec::new();
    let mut temps_all_rooms = Vec::new();
    // (seconds ago, display timestamp) of the freshest active reading
    let mut freshest: Option<(i64, String)> = None;

    for room in data.rooms() {
        let records = data.readings_for_room(room.id);
        let latest = records
            .first()
            .map(|record| reading_view(record, now, tz, active_window_secs));

        let is_sensor_active = latest.as_ref().is_some_and(|view| view.is_active);
        let latest_temp = latest
            .as_ref()
            .filter(|view| view.is_active)
            .map(|view| view.temperature);

        if let Some(view) = latest.as_ref().filter(|view| view.is_active) {
            live_temps.push(view.temperature);
            let secs = view.seconds_ago.unwrap_or(0);
            if freshest.as_ref().is_none_or(|(best, _)| secs < *best) {
                freshest = Some((secs, view.timestamp.clone()));
            }
        }
        temps_all_rooms.extend(temps_24h(&records, now));

        let device_errors = match room.sensor_id.as_deref() {
            Some(sensor) => data
                .errors_for_sensor(sensor, ERRORS_PER_ROOM)
                .into_iter()
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        rooms.push(RoomSummary {
            room: room.clone(),
            latest_temp,
            latest_time: latest.as_ref().map(|view| view.timestamp.clone()),
            is_sensor_active,
            minutes_ago: latest
                .as_ref()
                .map(|view| view.seconds_ago.map(minutes).unwrap_or(0.0)),
            temp_status: TempStatus::classify(latest_temp, is_sensor_active),
            stats: stats_24h(&records, now),
            device_errors,
        });
    }

    let extreme = |fold: fn(f64, f64) -> f64, start: f64| {
        (!temps_all_rooms.is_empty())
            .then(|| round_to(temps_all_rooms.iter().copied().fold(start, fold), 1))
    };
    let combined = CombinedStats {
        live_temp: (!live_temps.is_empty()).then(|| round_to(mean(&live_temps), 1)),
        avg_24h: (!temps_all_rooms.is_empty()).then(|| round_to(mean(&temps_all_rooms), 1)),
        min_24h: extreme(f64::min, f64::INFINITY),
        max_24h: extreme(f64::max, f64::NEG_INFINITY),
        minutes_ago: freshest.as_ref().map(|(secs, _)| minutes(*secs)),
        last_update: freshest.map(|(_, timestamp)| timestamp),
        online_count: rooms.iter().filter(|room| room.is_sensor_active).count(),
        total_count: rooms.len(),
    };

    Dashboard { rooms, combined }
}
