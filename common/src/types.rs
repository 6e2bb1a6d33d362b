use serde::{Deserialize, Serialize};

/// Body of the batched POST to the report endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportPayload {
    pub esp32_mac: String,
    pub readings: Vec<ReportReading>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportReading {
    pub sensor_id: String,
    pub temperature: f32,
}

/// Result of one report attempt as seen by the firmware loop.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Status(u16),
    Failed(String),
}

impl SendOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Status(200))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    WifiDisconnected,
    SensorDisconnected,
    HttpError,
    SendFailed,
    NoValidReadings,
    BootloopDetected,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WifiDisconnected => "WIFI_DISCONNECTED",
            Self::SensorDisconnected => "SENSOR_DISCONNECTED",
            Self::HttpError => "HTTP_ERROR",
            Self::SendFailed => "SEND_FAILED",
            Self::NoValidReadings => "NO_VALID_READINGS",
            Self::BootloopDetected => "BOOTLOOP_DETECTED",
        }
    }
}

/// Durable counters kept in non-volatile storage across resets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootCounters {
    pub boot_count: u32,
    pub error_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeStatus {
    pub address: String,
    pub name: String,
    pub connected: bool,
    #[serde(rename = "lastTemp")]
    pub last_temp_c: Option<f32>,
    #[serde(rename = "consecutiveErrors")]
    pub consecutive_errors: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    #[serde(rename = "deviceMac")]
    pub device_mac: String,
    #[serde(rename = "wifiConnected")]
    pub wifi_connected: bool,
    #[serde(rename = "readingsCollected")]
    pub readings_collected: usize,
    #[serde(rename = "batchSize")]
    pub batch_size: usize,
    #[serde(rename = "nextSendInMs")]
    pub next_send_in_ms: u64,
    #[serde(rename = "sendInFlight")]
    pub send_in_flight: bool,
    #[serde(rename = "successfulSends")]
    pub successful_sends: u32,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
    #[serde(rename = "bootCount")]
    pub boot_count: u32,
    #[serde(rename = "errorCount")]
    pub error_count: u32,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    pub probes: Vec<ProbeStatus>,
}

/// Formats a 6-byte MAC as `AA:BB:CC:DD:EE:FF`.
pub fn format_mac(mac: [u8; 6]) -> String {
    mac.iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Formats a one-wire ROM code family byte first, each byte as unpadded
/// upper-case hex. This is the sensor id registered on the collector, so a
/// byte below 0x10 contributes a single digit.
pub fn format_probe_address(rom: u64) -> String {
    rom.to_le_bytes()
        .iter()
        .map(|byte| format!("{byte:X}"))
        .collect()
}

/// Formats milliseconds of uptime as `HH:MM:SS` (hours keep counting past 24).
pub fn format_uptime(uptime_ms: u64) -> String {
    let total_secs = uptime_ms / 1_000;
    let hours = total_secs / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
