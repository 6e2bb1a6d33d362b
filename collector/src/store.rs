use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, sync::Mutex};

use coldroom_common::chart::DB_TIMESTAMP_FORMAT;

const REGISTRY_FILE: &str = "registry.json";
const READINGS_FILE: &str = "readings.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColdRoom {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub location: String,
    pub sensor_id: Option<String>,
}

/// Fields a client may set when creating or editing a room.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomInput {
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub sensor_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureRecord {
    pub room_id: u64,
    pub temperature: f64,
    /// UTC, `YYYY-MM-DD HH:MM:SS`.
    pub timestamp: String,
}

impl TemperatureRecord {
    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(&self.timestamp, DB_TIMESTAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceErrorKind {
    UnregisteredSensor,
    MalformedData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceError {
    pub id: u64,
    pub device_mac: String,
    pub sensor_id: String,
    pub error_type: DeviceErrorKind,
    pub message: String,
    pub timestamp: String,
    pub resolved: bool,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("Cold room {0} not found")]
    RoomNotFound(u64),
    #[error("Device error {0} not found")]
    DeviceErrorNotFound(u64),
    #[error("Sensor {0} is already assigned to another room")]
    DuplicateSensor(String),
    #[error("Room name must not be empty")]
    EmptyName,
}

pub fn db_timestamp(at: DateTime<Utc>) -> String {
    at.format(DB_TIMESTAMP_FORMAT).to_string()
}

/// Rooms, readings and device errors held in memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectorData {
    next_room_id: u64,
    next_error_id: u64,
    rooms: Vec<ColdRoom>,
    errors: Vec<DeviceError>,
    /// Per room, oldest first.
    #[serde(skip)]
    readings: BTreeMap<u64, Vec<TemperatureRecord>>,
}

/// Marks the append-only state so an ingest can be undone when persisting fails.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    reading_lens: BTreeMap<u64, usize>,
    error_len: usize,
    next_error_id: u64,
}

impl CollectorData {
    pub fn rooms(&self) -> &[ColdRoom] {
        &self.rooms
    }

    pub fn room(&self, id: u64) -> Option<&ColdRoom> {
        self.rooms.iter().find(|room| room.id == id)
    }

    pub fn room_by_sensor(&self, sensor_id: &str) -> Option<&ColdRoom> {
        self.rooms
            .iter()
            .find(|room| room.sensor_id.as_deref() == Some(sensor_id))
    }

    pub fn add_room(&mut self, input: RoomInput) -> Result<ColdRoom, StoreError> {
        let input = self.validate_room(None, input)?;
        self.next_room_id = self.next_room_id.max(self.max_room_id()) + 1;

        let room = ColdRoom {
            id: self.next_room_id,
            name: input.name,
            location: input.location,
            sensor_id: input.sensor_id,
        };
        self.rooms.push(room.clone());
        Ok(room)
    }

    pub fn update_room(&mut self, id: u64, input: RoomInput) -> Result<ColdRoom, StoreError> {
        let input = self.validate_room(Some(id), input)?;
        let room = self
            .rooms
            .iter_mut()
            .find(|room| room.id == id)
            .ok_or(StoreError::RoomNotFound(id))?;

        room.name = input.name;
        room.location = input.location;
        room.sensor_id = input.sensor_id;
        Ok(room.clone())
    }

    /// Removes the room together with its readings.
    pub fn delete_room(&mut self, id: u64) -> Result<ColdRoom, StoreError> {
        let index = self
            .rooms
            .iter()
            .position(|room| room.id == id)
            .ok_or(StoreError::RoomNotFound(id))?;
        self.readings.remove(&id);
        Ok(self.rooms.remove(index))
    }

    /// Every stored reading, grouped by room, oldest first within a room.
    pub fn all_readings(&self) -> impl Iterator<Item = &TemperatureRecord> + '_ {
        self.readings.values().flatten()
    }

    pub fn reading_count(&self) -> usize {
        self.readings.values().map(Vec::len).sum()
    }

    pub fn insert_reading(&mut self, room_id: u64, temperature: f64, at: DateTime<Utc>) -> TemperatureRecord {
        let record = TemperatureRecord {
            room_id,
            temperature,
            timestamp: db_timestamp(at),
        };
        self.push_record(record.clone());
        record
    }

    /// Keeps each room's list sorted; same-second readings stay in arrival order.
    fn push_record(&mut self, record: TemperatureRecord) {
        let records = self.readings.entry(record.room_id).or_default();
        let at = records.partition_point(|existing| existing.timestamp <= record.timestamp);
        records.insert(at, record);
    }

    /// Newest first.
    pub fn readings_for_room(&self, room_id: u64) -> Vec<&TemperatureRecord> {
        self.readings
            .get(&room_id)
            .map(|records| records.iter().rev().collect())
            .unwrap_or_default()
    }

    /// Drops readings recorded before `cutoff` and returns how many went.
    pub fn prune_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let cutoff = db_timestamp(cutoff);
        let mut pruned = 0;
        for records in self.readings.values_mut() {
            let keep_from = records.partition_point(|record| record.timestamp < cutoff);
            records.drain(..keep_from);
            pruned += keep_from;
        }
        self.readings.retain(|_, records| !records.is_empty());
        pruned
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            reading_lens: self
                .readings
                .iter()
                .map(|(room_id, records)| (*room_id, records.len()))
                .collect(),
            error_len: self.errors.len(),
            next_error_id: self.next_error_id,
        }
    }

    /// Undoes readings and device errors added since `checkpoint`.
    pub fn rollback(&mut self, checkpoint: &Checkpoint) {
        self.readings.retain(|room_id, _| checkpoint.reading_lens.contains_key(room_id));
        for (room_id, records) in &mut self.readings {
            if let Some(len) = checkpoint.reading_lens.get(room_id) {
                records.truncate(*len);
            }
        }
        self.errors.truncate(checkpoint.error_len);
        self.next_error_id = checkpoint.next_error_id;
    }

    pub fn log_device_error(
        &mut self,
        device_mac: &str,
        sensor_id: &str,
        error_type: DeviceErrorKind,
        message: String,
        at: DateTime<Utc>,
    ) -> DeviceError {
        self.next_error_id = self.next_error_id.max(self.max_error_id()) + 1;
        let error = DeviceError {
            id: self.next_error_id,
            device_mac: device_mac.to_string(),
            sensor_id: sensor_id.to_string(),
            error_type,
            message,
            timestamp: db_timestamp(at),
            resolved: false,
        };
        self.errors.push(error.clone());
        error
    }

    /// Unresolved device errors, newest first.
    pub fn unresolved_errors(&self) -> Vec<&DeviceError> {
        self.errors.iter().rev().filter(|error| !error.resolved).collect()
    }

    /// Unresolved device errors reported for one sensor, newest first.
    pub fn errors_for_sensor(&self, sensor_id: &str, limit: usize) -> Vec<&DeviceError> {
        self.errors
            .iter()
            .rev()
            .filter(|error| !error.resolved && error.sensor_id == sensor_id)
            .take(limit)
            .collect()
    }

    pub fn resolve_error(&mut self, id: u64) -> Result<(), StoreError> {
        let error = self
            .errors
            .iter_mut()
            .find(|error| error.id == id)
            .ok_or(StoreError::DeviceErrorNotFound(id))?;
        error.resolved = true;
        Ok(())
    }

    fn validate_room(&self, id: Option<u64>, mut input: RoomInput) -> Result<RoomInput, StoreError> {
        input.name = input.name.trim().to_string();
        input.location = input.location.trim().to_string();
        input.sensor_id = input
            .sensor_id
            .map(|sensor| sensor.trim().to_string())
            .filter(|sensor| !sensor.is_empty());

        if input.name.is_empty() {
            return Err(StoreError::EmptyName);
        }
        if let Some(sensor) = input.sensor_id.as_deref() {
            if self
                .room_by_sensor(sensor)
                .is_some_and(|room| Some(room.id) != id)
            {
                return Err(StoreError::DuplicateSensor(sensor.to_string()));
            }
        }
        Ok(input)
    }

    fn max_room_id(&self) -> u64 {
        self.rooms.iter().map(|room| room.id).max().unwrap_or(0)
    }

    fn max_error_id(&self) -> u64 {
        self.errors.iter().map(|error| error.id).max().unwrap_or(0)
    }
}

/// Registry as pretty JSON, readings as an append-only JSON-lines log.
#[derive(Clone)]
pub struct AppStore {
    registry_path: Arc<PathBuf>,
    readings_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl AppStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            registry_path: Arc::new(data_dir.join(REGISTRY_FILE)),
            readings_path: Arc::new(data_dir.join(READINGS_FILE)),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn load(&self) -> anyhow::Result<CollectorData> {
        let _guard = self.lock.lock().await;

        let mut data = match tokio::fs::read(self.registry_path.as_ref()).await {
            Ok(raw) => serde_json::from_slice::<CollectorData>(&raw)?,
            Err(err) if err.kind() == ErrorKind::NotFound => CollectorData::default(),
            Err(err) => return Err(err.into()),
        };

        match tokio::fs::read_to_string(self.readings_path.as_ref()).await {
            Ok(raw) => {
                for (line_no, line) in raw.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<TemperatureRecord>(line) {
                        Ok(record) if data.room(record.room_id).is_some() => data.push_record(record),
                        Ok(record) => {
                            tracing::debug!("skipping reading of removed room {}", record.room_id)
                        }
                        Err(err) => tracing::warn!("skipping reading line {}: {err}", line_no + 1),
                    }
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        Ok(data)
    }

    pub async fn save_registry(&self, data: &CollectorData) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.registry_path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(data)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, payload).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub async fn append_readings(&self, records: &[TemperatureRecord]) -> anyhow::Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let _guard = self.lock.lock().await;
        let path = self.readings_path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut payload = Vec::new();
        for record in records {
            serde_json::to_writer(&mut payload, record)?;
            payload.push(b'\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(&payload).await?;
        file.flush().await?;
        Ok(())
    }

    /// Rewrites the reading log, used after a cascading delete or pruning.
    pub async fn rewrite_readings(&self, data: &CollectorData) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.readings_path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut payload = Vec::new();
        for record in data.all_readings() {
            serde_json::to_writer(&mut payload, record)?;
            payload.push(b'\n');
        }
        let tmp = path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, payload).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn room(name: &str, sensor: Option<&str>) -> RoomInput {
        RoomInput {
            name: name.to_string(),
            location: "Plant A".to_string(),
            sensor_id: sensor.map(str::to_string),
        }
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap()
    }

    #[test]
    fn sensor_ids_are_unique_across_rooms() {
        let mut data = CollectorData::default();
        let first = data.add_room(room("Freezer", Some("28FF0011AABBCC01"))).unwrap();

        assert_eq!(
            data.add_room(room("Chiller", Some(" 28FF0011AABBCC01 "))),
            Err(StoreError::DuplicateSensor("28FF0011AABBCC01".to_string()))
        );

        // Re-saving a room with its own sensor is fine.
        let updated = data
            .update_room(first.id, room("Freezer 1", Some("28FF0011AABBCC01")))
            .unwrap();
        assert_eq!(updated.name, "Freezer 1");
        assert_eq!(data.room_by_sensor("28FF0011AABBCC01").map(|r| r.id), Some(first.id));
    }

    #[test]
    fn blank_sensor_means_unassigned() {
        let mut data = CollectorData::default();
        let created = data.add_room(room("Dock", Some("  "))).unwrap();
        assert_eq!(created.sensor_id, None);
        assert_eq!(data.add_room(room("  ", None)), Err(StoreError::EmptyName));
    }

    #[test]
    fn delete_cascades_readings() {
        let mut data = CollectorData::default();
        let a = data.add_room(room("A", Some("S-A"))).unwrap();
        let b = data.add_room(room("B", Some("S-B"))).unwrap();
        data.insert_reading(a.id, 2.0, at(10, 0));
        data.insert_reading(b.id, 3.0, at(10, 0));

        data.delete_room(a.id).unwrap();

        assert!(data.room(a.id).is_none());
        assert_eq!(data.reading_count(), 1);
        assert_eq!(data.all_readings().next().map(|r| r.room_id), Some(b.id));
        assert_eq!(data.delete_room(a.id), Err(StoreError::RoomNotFound(a.id)));
    }

    #[test]
    fn room_ids_are_not_reused() {
        let mut data = CollectorData::default();
        let a = data.add_room(room("A", None)).unwrap();
        data.delete_room(a.id).unwrap();
        let b = data.add_room(room("B", None)).unwrap();
        assert!(b.id > a.id);
    }

    #[test]
    fn readings_for_room_are_newest_first() {
        let mut data = CollectorData::default();
        let a = data.add_room(room("A", None)).unwrap();
        data.insert_reading(a.id, 1.0, at(10, 0));
        data.insert_reading(a.id, 2.0, at(10, 5));
        data.insert_reading(a.id, 3.0, at(10, 5));

        let temps: Vec<f64> = data
            .readings_for_room(a.id)
            .iter()
            .map(|record| record.temperature)
            .collect();
        assert_eq!(temps, vec![3.0, 2.0, 1.0]);
        assert_eq!(data.readings_for_room(a.id)[2].timestamp, "2024-05-01 10:00:00");
    }

    #[test]
    fn late_reading_is_kept_in_time_order() {
        let mut data = CollectorData::default();
        let a = data.add_room(room("A", None)).unwrap();
        data.insert_reading(a.id, 1.0, at(10, 0));
        data.insert_reading(a.id, 3.0, at(10, 10));
        data.insert_reading(a.id, 2.0, at(10, 5));

        let temps: Vec<f64> = data
            .readings_for_room(a.id)
            .iter()
            .map(|record| record.temperature)
            .collect();
        assert_eq!(temps, vec![3.0, 2.0, 1.0]);
        assert!(data.readings_for_room(a.id + 1).is_empty());
    }

    #[test]
    fn pruning_drops_only_old_readings() {
        let mut data = CollectorData::default();
        let a = data.add_room(room("A", Some("S-A"))).unwrap();
        let b = data.add_room(room("B", Some("S-B"))).unwrap();
        data.insert_reading(a.id, 1.0, at(8, 0));
        data.insert_reading(a.id, 2.0, at(9, 0));
        data.insert_reading(b.id, 3.0, at(8, 30));

        assert_eq!(data.prune_before(at(9, 0)), 2);
        assert_eq!(data.reading_count(), 1);
        assert_eq!(data.readings_for_room(a.id)[0].temperature, 2.0);
        assert!(data.readings_for_room(b.id).is_empty());
    }

    #[test]
    fn rollback_undoes_readings_and_errors() {
        let mut data = CollectorData::default();
        let a = data.add_room(room("A", Some("S-A"))).unwrap();
        let b = data.add_room(room("B", Some("S-B"))).unwrap();
        data.insert_reading(a.id, 1.0, at(8, 0));
        let checkpoint = data.checkpoint();

        data.insert_reading(a.id, 2.0, at(8, 5));
        data.insert_reading(b.id, 3.0, at(8, 5));
        let logged = data.log_device_error(
            "AA",
            "S-X",
            DeviceErrorKind::UnregisteredSensor,
            "unknown".to_string(),
            at(8, 5),
        );
        data.rollback(&checkpoint);

        assert_eq!(data.reading_count(), 1);
        assert!(data.unresolved_errors().is_empty());
        let again = data.log_device_error(
            "AA",
            "S-X",
            DeviceErrorKind::UnregisteredSensor,
            "unknown".to_string(),
            at(8, 6),
        );
        assert_eq!(again.id, logged.id);
    }

    #[test]
    fn errors_for_sensor_are_unresolved_and_limited() {
        let mut data = CollectorData::default();
        for minute in 0..5 {
            data.log_device_error(
                "AA",
                "S-A",
                DeviceErrorKind::MalformedData,
                format!("bad {minute}"),
                at(9, minute),
            );
        }
        data.log_device_error("AA", "S-B", DeviceErrorKind::MalformedData, "other".to_string(), at(9, 6));
        data.resolve_error(5).unwrap();

        let messages: Vec<&str> = data
            .errors_for_sensor("S-A", 3)
            .iter()
            .map(|error| error.message.as_str())
            .collect();
        assert_eq!(messages, vec!["bad 3", "bad 2", "bad 1"]);
    }

    #[test]
    fn resolving_hides_device_error() {
        let mut data = CollectorData::default();
        let first = data.log_device_error(
            "AA:BB:CC:DD:EE:FF",
            "28FF",
            DeviceErrorKind::UnregisteredSensor,
            "unknown".to_string(),
            at(9, 0),
        );
        data.log_device_error(
            "AA:BB:CC:DD:EE:FF",
            "UNKNOWN",
            DeviceErrorKind::MalformedData,
            "bad".to_string(),
            at(9, 1),
        );

        data.resolve_error(first.id).unwrap();
        let open: Vec<u64> = data.unresolved_errors().iter().map(|e| e.id).collect();
        assert_eq!(open, vec![first.id + 1]);
        assert_eq!(data.resolve_error(99), Err(StoreError::DeviceErrorNotFound(99)));
    }

    #[tokio::test]
    async fn store_round_trips_registry_and_reading_log() {
        let dir = std::env::temp_dir().join(format!("coldroom-collector-store-{}", std::process::id()));
        let store = AppStore::new(&dir);

        let mut data = store.load().await.unwrap();
        assert!(data.rooms().is_empty());

        let a = data.add_room(room("A", Some("S-A"))).unwrap();
        let first = data.insert_reading(a.id, -18.5, at(8, 0));
        let second = data.insert_reading(a.id, -18.1, at(8, 5));
        store.save_registry(&data).await.unwrap();
        store.append_readings(&[first]).await.unwrap();
        store.append_readings(&[second.clone()]).await.unwrap();

        let reloaded = AppStore::new(&dir).load().await.unwrap();
        assert_eq!(reloaded.rooms(), data.rooms());
        assert_eq!(
            reloaded.all_readings().collect::<Vec<_>>(),
            data.all_readings().collect::<Vec<_>>()
        );

        let mut trimmed = reloaded.clone();
        trimmed.delete_room(a.id).unwrap();
        store.rewrite_readings(&trimmed).await.unwrap();
        assert_eq!(store.load().await.unwrap().reading_count(), 0);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
