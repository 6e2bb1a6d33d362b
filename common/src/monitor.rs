use crate::{
    boot_guard::BootGuard,
    config::{MonitorConfig, ProbeLabel, BATCH_SIZE, MAX_PROBES},
    display::{render_page, DisplayPage},
    error_log::ErrorLog,
    probe::{round_one_decimal, validate_reading, ProbeEvent, ProbeFault, SensorInfo},
    types::{
        BootCounters, ErrorKind, MonitorStatus, ProbeStatus, ReportPayload, ReportReading,
        SendOutcome,
    },
};

/// Work the platform loop must carry out after a [`MonitorEngine::tick`].
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorAction {
    /// Read these probe addresses and hand the results to `apply_readings`.
    ReadProbes(Vec<String>),
    /// Search the bus and hand the found addresses to `register_probes`.
    RescanBus,
    RenderPage(DisplayPage),
    /// POST the payload and hand the result to `complete_send`.
    SendReport(ReportPayload),
    /// Try to rejoin WiFi and report the result through `set_wifi_connected`.
    ReconnectWifi,
    SaveCounters(BootCounters),
}

#[derive(Debug, Clone)]
pub struct MonitorEngine {
    pub config: MonitorConfig,
    device_mac: String,
    probes: Vec<SensorInfo>,
    readings_collected: usize,
    errors: ErrorLog,

    counters: BootCounters,
    counters_dirty: bool,
    boot_guard: BootGuard,
    boot_marked_stable: bool,

    wifi_connected: Option<bool>,
    last_wifi_attempt_ms: Option<u64>,
    wifi_error_logged: bool,

    last_read_ms: Option<u64>,
    last_rescan_ms: u64,

    page: DisplayPage,
    page_since_ms: u64,
    last_render_ms: Option<u64>,

    last_send_ms: u64,
    send_in_flight: bool,
    successful_sends: u32,
}

impl MonitorEngine {
    pub fn new(mut config: MonitorConfig, device_mac: impl Into<String>, counters: BootCounters) -> Self {
        config.sanitize();
        let boot_guard = BootGuard::new(&config);
        Self {
            config,
            device_mac: device_mac.into(),
            probes: Vec::new(),
            readings_collected: 0,
            errors: ErrorLog::new(),
            counters,
            counters_dirty: false,
            boot_guard,
            boot_marked_stable: false,
            wifi_connected: None,
            last_wifi_attempt_ms: None,
            wifi_error_logged: false,
            last_read_ms: None,
            last_rescan_ms: 0,
            page: DisplayPage::default(),
            page_since_ms: 0,
            last_render_ms: None,
            last_send_ms: 0,
            send_in_flight: false,
            successful_sends: 0,
        }
    }

    pub fn device_mac(&self) -> &str {
        &self.device_mac
    }

    pub fn probes(&self) -> &[SensorInfo] {
        &self.probes
    }

    pub fn readings_collected(&self) -> usize {
        self.readings_collected
    }

    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    pub fn counters(&self) -> BootCounters {
        self.counters
    }

    pub fn current_page(&self) -> DisplayPage {
        self.page
    }

    pub fn is_wifi_connected(&self) -> bool {
        self.wifi_connected.unwrap_or(false)
    }

    pub fn is_send_in_flight(&self) -> bool {
        self.send_in_flight
    }

    pub fn connected_addresses(&self) -> Vec<String> {
        self.probes
            .iter()
            .filter(|probe| probe.is_connected())
            .map(|probe| probe.address.clone())
            .collect()
    }

    /// Adds newly found probes (up to `MAX_PROBES`) and re-admits known ones.
    /// Returns how many probes were added.
    pub fn register_probes(&mut self, found: &[String], labels: &[ProbeLabel]) -> usize {
        let mut added = 0;

        for address in found {
            if let Some(existing) = self
                .probes
                .iter_mut()
                .find(|probe| probe.address.eq_ignore_ascii_case(address))
            {
                existing.reconnect();
                continue;
            }

            if self.probes.len() >= MAX_PROBES {
                continue;
            }

            let name = labels
                .iter()
                .find(|label| label.address.eq_ignore_ascii_case(address))
                .map(|label| label.name.clone())
                .unwrap_or_else(|| format!("S{}", self.probes.len() + 1));
            self.probes.push(SensorInfo::new(address.clone(), name));
            added += 1;
        }

        added
    }

    pub fn record_error(&mut self, now_ms: u64, kind: ErrorKind, message: impl Into<String>) {
        self.errors.push(now_ms, kind, message);
        self.counters.error_count = self.counters.error_count.saturating_add(1);
        self.counters_dirty = true;
    }

    pub fn tick(&mut self, now_ms: u64) -> Vec<MonitorAction> {
        let mut actions = Vec::new();
        self.mark_boot_stable_if_needed(now_ms);
        self.schedule_wifi_reconnect(now_ms, &mut actions);
        self.schedule_rescan(now_ms, &mut actions);
        self.schedule_read(now_ms, &mut actions);
        self.schedule_report(now_ms, &mut actions);
        self.schedule_render(now_ms, &mut actions);

        if self.counters_dirty {
            self.counters_dirty = false;
            actions.push(MonitorAction::SaveCounters(self.counters));
        }

        actions
    }

    pub fn apply_readings(&mut self, now_ms: u64, results: Vec<(String, Result<f32, ProbeFault>)>) {
        if self.readings_collected >= BATCH_SIZE {
            return;
        }

        let slot = self.readings_collected;
        let max_errors = self.config.max_consecutive_errors;
        let mut lost = Vec::new();

        for probe in self.probes.iter_mut().filter(|probe| probe.is_connected()) {
            let result = results
                .iter()
                .find(|(address, _)| address == &probe.address)
                .map(|(_, result)| result.clone())
                .unwrap_or(Err(ProbeFault::Disconnected));

            match result.and_then(|temp_c| validate_reading(temp_c, &self.config)) {
                Ok(temp_c) => {
                    probe.record_success(slot, temp_c);
                }
                Err(fault) => {
                    if probe.record_failure(slot, max_errors) == ProbeEvent::Disconnected {
                        lost.push(format!("{} ({}) {}", probe.name, probe.address, fault));
                    }
                }
            }
        }

        for message in lost {
            self.record_error(now_ms, ErrorKind::SensorDisconnected, message);
        }

        self.readings_collected += 1;
    }

    pub fn complete_send(&mut self, now_ms: u64, outcome: SendOutcome) {
        self.send_in_flight = false;
        self.last_send_ms = now_ms;

        match outcome {
            SendOutcome::Status(200) => {
                self.successful_sends = self.successful_sends.saturating_add(1);
                self.reset_batch();
            }
            SendOutcome::Status(code) => {
                self.record_error(now_ms, ErrorKind::HttpError, format!("server answered HTTP {code}"));
            }
            SendOutcome::Failed(reason) => {
                self.record_error(now_ms, ErrorKind::SendFailed, reason);
            }
        }
    }

    pub fn set_wifi_connected(&mut self, now_ms: u64, connected: bool) {
        let previous = self.wifi_connected.replace(connected);

        if connected {
            self.last_wifi_attempt_ms = None;
            return;
        }

        if previous != Some(false) {
            self.record_error(now_ms, ErrorKind::WifiDisconnected, "wifi link lost");
        }
        if self.last_wifi_attempt_ms.is_none() {
            self.last_wifi_attempt_ms = Some(now_ms);
        }
    }

    /// Every valid reading of every connected probe, rounded to one decimal.
    pub fn build_report(&self) -> ReportPayload {
        let readings = self
            .probes
            .iter()
            .filter(|probe| probe.is_connected())
            .flat_map(|probe| {
                probe.valid_readings().map(|temp_c| ReportReading {
                    sensor_id: probe.address.clone(),
                    temperature: round_one_decimal(temp_c),
                })
            })
            .collect();

        ReportPayload {
            esp32_mac: self.device_mac.clone(),
            readings,
        }
    }

    pub fn next_send_in_ms(&self, now_ms: u64) -> u64 {
        let elapsed = now_ms.saturating_sub(self.last_send_ms);
        self.config.send_interval_ms.saturating_sub(elapsed)
    }

    pub fn status(&self, now_ms: u64) -> MonitorStatus {
        MonitorStatus {
            device_mac: self.device_mac.clone(),
            wifi_connected: self.is_wifi_connected(),
            readings_collected: self.readings_collected,
            batch_size: BATCH_SIZE,
            next_send_in_ms: self.next_send_in_ms(now_ms),
            send_in_flight: self.send_in_flight,
            successful_sends: self.successful_sends,
            uptime_ms: now_ms,
            boot_count: self.counters.boot_count,
            error_count: self.counters.error_count,
            last_error: self.errors.latest().map(|entry| entry.render()),
            probes: self
                .probes
                .iter()
                .map(|probe| ProbeStatus {
                    address: probe.address.clone(),
                    name: probe.name.clone(),
                    connected: probe.is_connected(),
                    last_temp_c: probe.last_temp_c(),
                    consecutive_errors: probe.consecutive_errors(),
                })
                .collect(),
        }
    }

    pub fn page_lines(&self, page: DisplayPage, now_ms: u64) -> Vec<String> {
        render_page(page, &self.status(now_ms), self.errors.latest())
    }

    fn reset_batch(&mut self) {
        self.readings_collected = 0;
        self.wifi_error_logged = false;
        for probe in &mut self.probes {
            probe.clear_batch();
        }
    }

    fn mark_boot_stable_if_needed(&mut self, now_ms: u64) {
        if self.boot_marked_stable || !self.boot_guard.is_stable(now_ms) {
            return;
        }
        self.boot_marked_stable = true;
        if self.counters.boot_count != 0 {
            self.counters.boot_count = 0;
            self.counters_dirty = true;
        }
    }

    fn schedule_wifi_reconnect(&mut self, now_ms: u64, actions: &mut Vec<MonitorAction>) {
        if self.wifi_connected != Some(false) {
            return;
        }
        let due = self
            .last_wifi_attempt_ms
            .map(|last| now_ms.saturating_sub(last) >= self.config.wifi_retry_interval_ms)
            .unwrap_or(true);
        if due {
            self.last_wifi_attempt_ms = Some(now_ms);
            actions.push(MonitorAction::ReconnectWifi);
        }
    }

    fn schedule_rescan(&mut self, now_ms: u64, actions: &mut Vec<MonitorAction>) {
        if now_ms.saturating_sub(self.last_rescan_ms) >= self.config.bus_rescan_interval_ms {
            self.last_rescan_ms = now_ms;
            actions.push(MonitorAction::RescanBus);
        }
    }

    fn schedule_read(&mut self, now_ms: u64, actions: &mut Vec<MonitorAction>) {
        if self.readings_collected >= BATCH_SIZE {
            return;
        }
        let due = self
            .last_read_ms
            .map(|last| now_ms.saturating_sub(last) >= self.config.read_interval_ms)
            .unwrap_or(true);
        if due {
            self.last_read_ms = Some(now_ms);
            actions.push(MonitorAction::ReadProbes(self.connected_addresses()));
        }
    }

    fn schedule_report(&mut self, now_ms: u64, actions: &mut Vec<MonitorAction>) {
        if self.send_in_flight
            || self.readings_collected < BATCH_SIZE
            || now_ms.saturating_sub(self.last_send_ms) < self.config.send_interval_ms
        {
            return;
        }

        if !self.is_wifi_connected() {
            if !self.wifi_error_logged {
                self.wifi_error_logged = true;
                self.record_error(
                    now_ms,
                    ErrorKind::WifiDisconnected,
                    "report postponed until wifi returns",
                );
            }
            return;
        }

        let payload = self.build_report();
        if payload.readings.is_empty() {
            self.record_error(now_ms, ErrorKind::NoValidReadings, "batch dropped");
            self.last_send_ms = now_ms;
            self.reset_batch();
            return;
        }

        self.send_in_flight = true;
        actions.push(MonitorAction::SendReport(payload));
    }

    fn schedule_render(&mut self, now_ms: u64, actions: &mut Vec<MonitorAction>) {
        let due = self
            .last_render_ms
            .map(|last| now_ms.saturating_sub(last) >= self.config.display_refresh_ms)
            .unwrap_or(true);
        if !due {
            return;
        }

        if now_ms.saturating_sub(self.page_since_ms) >= self.config.page_rotate_ms {
            self.page = self.page.next();
            self.page_since_ms = now_ms;
        }
        self.last_render_ms = Some(now_ms);
        actions.push(MonitorAction::RenderPage(self.page));
    }
}
