use thiserror::Error;

use crate::config::{MonitorConfig, BATCH_SIZE};

/// Value a DS18B20 driver reports when the probe does not answer.
pub const DISCONNECTED_SENTINEL_C: f32 = -127.0;
/// Scratchpad power-on value, returned when a conversion never ran.
pub const POWER_ON_RESET_C: f32 = 85.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProbeFault {
    #[error("probe did not respond")]
    Disconnected,
    #[error("reading {0:.2}°C outside valid range")]
    OutOfRange(f32),
    #[error("bus error: {0}")]
    Bus(String),
}

/// Checks a raw reading against the configured range and the driver sentinels.
pub fn validate_reading(temp_c: f32, config: &MonitorConfig) -> Result<f32, ProbeFault> {
    if temp_c == DISCONNECTED_SENTINEL_C {
        return Err(ProbeFault::Disconnected);
    }
    if !temp_c.is_finite()
        || temp_c == POWER_ON_RESET_C
        || temp_c < config.min_valid_temp_c
        || temp_c > config.max_valid_temp_c
    {
        return Err(ProbeFault::OutOfRange(temp_c));
    }
    Ok(temp_c)
}

pub fn round_one_decimal(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeEvent {
    Ok,
    Failed,
    /// The failure that pushed the probe over the consecutive-error limit.
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct SensorInfo {
    pub address: String,
    pub name: String,
    last_temp_c: Option<f32>,
    connected: bool,
    consecutive_errors: u8,
    batch: [Option<f32>; BATCH_SIZE],
}

impl SensorInfo {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            last_temp_c: None,
            connected: true,
            consecutive_errors: 0,
            batch: [None; BATCH_SIZE],
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn last_temp_c(&self) -> Option<f32> {
        self.last_temp_c
    }

    pub fn consecutive_errors(&self) -> u8 {
        self.consecutive_errors
    }

    pub fn batch(&self) -> &[Option<f32>; BATCH_SIZE] {
        &self.batch
    }

    pub fn record_success(&mut self, slot: usize, temp_c: f32) -> ProbeEvent {
        if let Some(entry) = self.batch.get_mut(slot) {
            *entry = Some(temp_c);
        }
        self.last_temp_c = Some(temp_c);
        self.consecutive_errors = 0;
        ProbeEvent::Ok
    }

    pub fn record_failure(&mut self, slot: usize, max_errors: u8) -> ProbeEvent {
        if let Some(entry) = self.batch.get_mut(slot) {
            *entry = None;
        }
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);

        if self.connected && self.consecutive_errors >= max_errors {
            self.connected = false;
            ProbeEvent::Disconnected
        } else {
            ProbeEvent::Failed
        }
    }

    /// Marks a probe seen again on the bus; returns true when it was disconnected.
    pub fn reconnect(&mut self) -> bool {
        let was_disconnected = !self.connected;
        self.connected = true;
        self.consecutive_errors = 0;
        was_disconnected
    }

    pub fn clear_batch(&mut self) {
        self.batch = [None; BATCH_SIZE];
    }

    pub fn valid_readings(&self) -> impl Iterator<Item = f32> + '_ {
        self.batch.iter().filter_map(|slot| *slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_rejects_sentinels_and_range() {
        let config = MonitorConfig::default();

        assert_eq!(validate_reading(3.25, &config), Ok(3.25));
        assert_eq!(validate_reading(-127.0, &config), Err(ProbeFault::Disconnected));
        assert_eq!(validate_reading(85.0, &config), Err(ProbeFault::OutOfRange(85.0)));
        assert_eq!(validate_reading(130.0, &config), Err(ProbeFault::OutOfRange(130.0)));
        assert!(validate_reading(f32::NAN, &config).is_err());
    }

    #[test]
    fn third_consecutive_failure_disconnects() {
        let mut probe = SensorInfo::new("28AA", "S1");

        assert_eq!(probe.record_failure(0, 3), ProbeEvent::Failed);
        assert_eq!(probe.record_failure(1, 3), ProbeEvent::Failed);
        assert!(probe.is_connected());
        assert_eq!(probe.record_failure(2, 3), ProbeEvent::Disconnected);
        assert!(!probe.is_connected());
        assert_eq!(probe.record_failure(3, 3), ProbeEvent::Failed);
    }

    #[test]
    fn success_resets_error_streak() {
        let mut probe = SensorInfo::new("28AA", "S1");

        probe.record_failure(0, 3);
        probe.record_failure(1, 3);
        probe.record_success(2, 4.5);
        probe.record_failure(3, 3);

        assert!(probe.is_connected());
        assert_eq!(probe.consecutive_errors(), 1);
        assert_eq!(probe.last_temp_c(), Some(4.5));
        assert_eq!(probe.valid_readings().collect::<Vec<_>>(), vec![4.5]);
    }

    #[test]
    fn rounding_to_one_decimal() {
        assert_eq!(round_one_decimal(2.46), 2.5);
        assert_eq!(round_one_decimal(-1.04), -1.0);
    }
}
