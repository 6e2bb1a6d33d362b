use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::store::{AppStore, CollectorData, DeviceErrorKind, TemperatureRecord};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    #[error("Invalid JSON")]
    InvalidJson,
    #[error("Missing esp32_mac or readings")]
    MissingFields,
}

/// A report body that passed the envelope checks.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub esp32_mac: String,
    pub readings: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestSummary {
    pub processed: usize,
    pub errors_logged: usize,
    pub stored: Vec<TemperatureRecord>,
}

impl IngestSummary {
    pub fn message(&self) -> String {
        let mut message = format!("Processed {} readings.", self.processed);
        if self.errors_logged > 0 {
            message.push_str(&format!(" {} errors logged.", self.errors_logged));
        }
        message
    }
}

pub fn parse_batch(body: &[u8]) -> Result<Batch, IngestError> {
    let value: Value = serde_json::from_slice(body).map_err(|_| IngestError::InvalidJson)?;
    let object = match value {
        Value::Object(object) if !object.is_empty() => object,
        _ => return Err(IngestError::InvalidJson),
    };

    let esp32_mac = object
        .get("esp32_mac")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|mac| !mac.is_empty())
        .ok_or(IngestError::MissingFields)?;
    let readings = object
        .get("readings")
        .and_then(Value::as_array)
        .filter(|readings| !readings.is_empty())
        .ok_or(IngestError::MissingFields)?;

    Ok(Batch {
        esp32_mac: esp32_mac.to_string(),
        readings: readings.clone(),
    })
}

/// Stores readings from registered sensors and logs a device error for everything else.
pub fn ingest(data: &mut CollectorData, batch: &Batch, now: DateTime<Utc>) -> IngestSummary {
    let mut summary = IngestSummary::default();

    for reading in &batch.readings {
        let sensor_id = reading
            .get("sensor_id")
            .and_then(Value::as_str)
            .filter(|sensor| !sensor.is_empty());
        let temperature = reading
            .get("temperature")
            .and_then(Value::as_f64)
            .filter(|temp| temp.is_finite());

        match (sensor_id, temperature) {
            (Some(sensor_id), Some(temperature)) => {
                match data.room_by_sensor(sensor_id).map(|room| room.id) {
                    Some(room_id) => {
                        summary.stored.push(data.insert_reading(room_id, temperature, now));
                        summary.processed += 1;
                    }
                    None => {
                        tracing::warn!(
                            "unregistered sensor_id '{sensor_id}' from device '{}'",
                            batch.esp32_mac
                        );
                        data.log_device_error(
                            &batch.esp32_mac,
                            sensor_id,
                            DeviceErrorKind::UnregisteredSensor,
                            format!("Unregistered sensor_id '{sensor_id}' attempting to send data"),
                            now,
                        );
                        summary.errors_logged += 1;
                    }
                }
            }
            _ => {
                tracing::warn!("malformed reading from device '{}': {reading}", batch.esp32_mac);
                data.log_device_error(
                    &batch.esp32_mac,
                    sensor_id.unwrap_or("UNKNOWN"),
                    DeviceErrorKind::MalformedData,
                    format!(
                        "Malformed reading: sensor_id={}, temperature={}",
                        display_field(reading.get("sensor_id")),
                        display_field(reading.get("temperature")),
                    ),
                    now,
                );
                summary.errors_logged += 1;
            }
        }
    }

    summary
}

/// Ingests a batch and persists it. When the reading log cannot be appended the
/// in-memory state is rolled back, so a retried report is not counted twice.
pub async fn accept_batch(
    data: &mut CollectorData,
    store: &AppStore,
    batch: &Batch,
    now: DateTime<Utc>,
) -> anyhow::Result<IngestSummary> {
    let checkpoint = data.checkpoint();
    let summary = ingest(data, batch, now);

    if let Err(err) = store.append_readings(&summary.stored).await {
        data.rollback(&checkpoint);
        return Err(err.context("failed to append readings"));
    }
    if summary.errors_logged > 0 {
        if let Err(err) = store.save_registry(data).await {
            tracing::warn!("failed to persist device errors: {err:#}");
        }
    }

    Ok(summary)
}

fn display_field(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "None".to_string(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RoomInput;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn data_with_room(sensor: &str) -> CollectorData {
        let mut data = CollectorData::default();
        data.add_room(RoomInput {
            name: "Freezer".to_string(),
            location: String::new(),
            sensor_id: Some(sensor.to_string()),
        })
        .unwrap();
        data
    }

    #[test]
    fn envelope_validation() {
        assert_eq!(parse_batch(b"not json"), Err(IngestError::InvalidJson));
        assert_eq!(parse_batch(b"{}"), Err(IngestError::InvalidJson));
        assert_eq!(parse_batch(b"[1]"), Err(IngestError::InvalidJson));
        assert_eq!(
            parse_batch(br#"{"esp32_mac":"AA","readings":[]}"#),
            Err(IngestError::MissingFields)
        );
        assert_eq!(
            parse_batch(br#"{"readings":[{"sensor_id":"x","temperature":1}]}"#),
            Err(IngestError::MissingFields)
        );

        let batch = parse_batch(br#"{"esp32_mac":"AA:BB","readings":[{}]}"#).unwrap();
        assert_eq!(batch.esp32_mac, "AA:BB");
        assert_eq!(batch.readings.len(), 1);
    }

    #[test]
    fn classifies_registered_unregistered_and_malformed() {
        let mut data = data_with_room("28FF0011AABBCC01");
        let batch = parse_batch(
            br#"{"esp32_mac":"AA:BB:CC:DD:EE:FF","readings":[
                {"sensor_id":"28FF0011AABBCC01","temperature":-18.4},
                {"sensor_id":"28FF0011AABBCC01","temperature":-18.2},
                {"sensor_id":"28FF0011AABBCC09","temperature":4.0},
                {"sensor_id":"28FF0011AABBCC01"},
                {"temperature":3.5}
            ]}"#,
        )
        .unwrap();

        let summary = ingest(&mut data, &batch, now());

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.errors_logged, 3);
        assert_eq!(summary.message(), "Processed 2 readings. 3 errors logged.");
        assert_eq!(summary.stored.len(), 2);
        assert_eq!(summary.stored[0].timestamp, "2024-05-01 12:00:00");
        assert_eq!(data.reading_count(), 2);

        let errors = data.unresolved_errors();
        let kinds: Vec<(DeviceErrorKind, &str)> = errors
            .iter()
            .map(|error| (error.error_type, error.sensor_id.as_str()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (DeviceErrorKind::MalformedData, "UNKNOWN"),
                (DeviceErrorKind::MalformedData, "28FF0011AABBCC01"),
                (DeviceErrorKind::UnregisteredSensor, "28FF0011AABBCC09"),
            ]
        );
        assert_eq!(
            errors[1].message,
            "Malformed reading: sensor_id=28FF0011AABBCC01, temperature=None"
        );
    }

    #[test]
    fn clean_batch_message_has_no_error_suffix() {
        let mut data = data_with_room("S1");
        let batch = parse_batch(br#"{"esp32_mac":"AA","readings":[{"sensor_id":"S1","temperature":2}]}"#)
            .unwrap();

        assert_eq!(ingest(&mut data, &batch, now()).message(), "Processed 1 readings.");
    }

    fn unwritable_store(name: &str) -> (AppStore, std::path::PathBuf) {
        let blocker = std::env::temp_dir().join(format!("coldroom-ingest-{name}-{}", std::process::id()));
        std::fs::write(&blocker, b"not a directory").unwrap();
        (AppStore::new(blocker.join("data")), blocker)
    }

    #[tokio::test]
    async fn failed_append_leaves_no_trace_in_memory() {
        let (store, blocker) = unwritable_store("append");
        let mut data = data_with_room("S1");
        let batch = parse_batch(
            br#"{"esp32_mac":"AA","readings":[
                {"sensor_id":"S1","temperature":2},
                {"sensor_id":"S9","temperature":3}
            ]}"#,
        )
        .unwrap();

        assert!(accept_batch(&mut data, &store, &batch, now()).await.is_err());
        assert_eq!(data.reading_count(), 0);
        assert!(data.unresolved_errors().is_empty());

        // The retry after the outage is stored exactly once.
        let dir = std::env::temp_dir().join(format!("coldroom-ingest-retry-{}", std::process::id()));
        let healthy = AppStore::new(&dir);
        let summary = accept_batch(&mut data, &healthy, &batch, now()).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(data.reading_count(), 1);
        assert_eq!(healthy.load().await.unwrap().reading_count(), 1);
        assert_eq!(data.unresolved_errors().len(), 1);

        let _ = std::fs::remove_file(&blocker);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
