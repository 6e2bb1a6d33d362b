use serde::{Deserialize, Serialize};

/// Readings gathered per probe before a report is sent.
pub const BATCH_SIZE: usize = 5;
pub const MAX_PROBES: usize = 10;
pub const ERROR_LOG_CAPACITY: usize = 10;

pub const DEFAULT_REPORT_URL: &str = "https://coolkingengineering.in/api/data";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub read_interval_ms: u64,
    pub display_refresh_ms: u64,
    pub page_rotate_ms: u64,
    pub send_interval_ms: u64,
    pub wifi_retry_interval_ms: u64,
    pub bus_rescan_interval_ms: u64,
    pub http_timeout_ms: u64,
    pub max_consecutive_errors: u8,
    pub min_valid_temp_c: f32,
    pub max_valid_temp_c: f32,
    pub bootloop_threshold: u32,
    pub bootloop_delay_ms: u64,
    pub stable_uptime_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            read_interval_ms: 1_000,
            display_refresh_ms: 2_000,
            page_rotate_ms: 8_000,
            send_interval_ms: 300_000,
            wifi_retry_interval_ms: 30_000,
            bus_rescan_interval_ms: 60_000,
            http_timeout_ms: 10_000,
            max_consecutive_errors: 3,
            min_valid_temp_c: -55.0,
            max_valid_temp_c: 125.0,
            bootloop_threshold: 5,
            bootloop_delay_ms: 10_000,
            stable_uptime_ms: 120_000,
        }
    }
}

impl MonitorConfig {
    pub fn sanitize(&mut self) {
        self.read_interval_ms = self.read_interval_ms.max(100);
        self.display_refresh_ms = self.display_refresh_ms.max(250);
        self.page_rotate_ms = self.page_rotate_ms.max(self.display_refresh_ms);
        self.send_interval_ms = self.send_interval_ms.max(10_000);
        self.wifi_retry_interval_ms = self.wifi_retry_interval_ms.max(1_000);
        self.http_timeout_ms = self.http_timeout_ms.clamp(1_000, 60_000);
        self.max_consecutive_errors = self.max_consecutive_errors.max(1);

        if self.min_valid_temp_c >= self.max_valid_temp_c {
            self.min_valid_temp_c = -55.0;
            self.max_valid_temp_c = 125.0;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub report_url: String,
    #[serde(default)]
    pub api_key: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            report_url: DEFAULT_REPORT_URL.to_string(),
            api_key: String::new(),
        }
    }
}

/// Friendly name shown on the status display for a probe address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbeLabel {
    pub address: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub monitor: MonitorConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub labels: Vec<ProbeLabel>,
}

impl RuntimeConfig {
    pub fn label_for(&self, address: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|label| label.address.eq_ignore_ascii_case(address))
            .map(|label| label.name.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub http_port: u16,
    pub data_dir: String,
    /// Hex SHA-256 of the expected `X-API-Key`; empty disables the check.
    #[serde(default)]
    pub api_key_sha256: String,
    pub display_timezone: String,
    pub chart_limit: usize,
    pub active_window_secs: i64,
    /// Readings older than this are pruned; 0 keeps everything.
    pub retention_days: u32,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            data_dir: "./.coldroom".to_string(),
            api_key_sha256: String::new(),
            display_timezone: "Asia/Kolkata".to_string(),
            chart_limit: 200,
            active_window_secs: 900,
            retention_days: 365,
        }
    }
}

impl CollectorConfig {
    pub fn sanitize(&mut self) {
        if self.http_port == 0 {
            self.http_port = 8080;
        }
        self.chart_limit = self.chart_limit.clamp(1, 5_000);
        self.active_window_secs = self.active_window_secs.max(60);
        self.api_key_sha256 = self.api_key_sha256.trim().to_ascii_lowercase();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_restores_inverted_range() {
        let mut config = MonitorConfig {
            min_valid_temp_c: 40.0,
            max_valid_temp_c: -10.0,
            max_consecutive_errors: 0,
            ..MonitorConfig::default()
        };
        config.sanitize();

        assert_eq!(config.min_valid_temp_c, -55.0);
        assert_eq!(config.max_valid_temp_c, 125.0);
        assert_eq!(config.max_consecutive_errors, 1);
    }

    #[test]
    fn label_lookup_ignores_case() {
        let runtime = RuntimeConfig {
            labels: vec![ProbeLabel {
                address: "28FF0011AABBCC01".to_string(),
                name: "Room A".to_string(),
            }],
            ..RuntimeConfig::default()
        };

        assert_eq!(runtime.label_for("28ff0011aabbcc01"), Some("Room A"));
        assert_eq!(runtime.label_for("28FF0011AABBCC02"), None);
    }

    #[test]
    fn runtime_config_tolerates_missing_optional_fields() {
        let raw = r#"{
            "monitor": {
                "read_interval_ms": 1000, "display_refresh_ms": 2000, "page_rotate_ms": 8000,
                "send_interval_ms": 300000, "wifi_retry_interval_ms": 30000,
                "bus_rescan_interval_ms": 60000, "http_timeout_ms": 10000,
                "max_consecutive_errors": 3, "min_valid_temp_c": -55.0, "max_valid_temp_c": 125.0,
                "bootloop_threshold": 5, "bootloop_delay_ms": 10000, "stable_uptime_ms": 120000
            },
            "network": { "wifi_ssid": "cold", "wifi_pass": "room", "report_url": "http://x/api/data" }
        }"#;

        let runtime: RuntimeConfig = serde_json::from_str(raw).unwrap();
        assert!(runtime.labels.is_empty());
        assert!(runtime.network.api_key.is_empty());
    }
}
