use core::fmt::Write as _;
use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use ds18b20::{Ds18b20, Resolution};
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::Write,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, IOPin, InputOutput, PinDriver, Pull},
    i2c::{I2cConfig, I2cDriver},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use one_wire_bus::{Address, OneWire};
use ssd1306::{mode::TerminalMode, prelude::*, I2CDisplayInterface, Ssd1306};

use coldroom_common::{
    display::{DISPLAY_COLS, DISPLAY_ROWS},
    types::{format_mac, format_probe_address},
    BootCounters, BootGuard, ErrorKind, MonitorAction, MonitorEngine, NetworkConfig, ProbeFault,
    ReportPayload, RuntimeConfig, SendOutcome,
};

const NVS_NAMESPACE: &str = "coldroom";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_BOOT_COUNT_KEY: &str = "boot_count";
const NVS_ERROR_COUNT_KEY: &str = "error_count";

const DS18B20_PIN: i32 = 4;
const I2C_BAUDRATE_HZ: u32 = 400_000;

const WATCHDOG_TIMEOUT_SEC: u32 = 60;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const LOOP_SLEEP_MS: u64 = 50;

type StatusDisplay = Ssd1306<I2CInterface<I2cDriver<'static>>, DisplaySize128x64, TerminalMode>;

struct ProbeBus {
    one_wire: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
    delay: Ets,
    /// ROM of every probe seen so far, keyed by its formatted sensor id.
    roms: Vec<(String, Address)>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

struct WifiLink {
    wifi: BlockingWifi<EspWifi<'static>>,
}

impl ProbeBus {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut one_wire_pin = PinDriver::input_output_od(pin)?;
        one_wire_pin.set_pull(Pull::Up)?;
        one_wire_pin.set_high()?;

        let one_wire = OneWire::new(one_wire_pin)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;

        Ok(Self {
            one_wire,
            delay: Ets,
            roms: Vec::new(),
        })
    }

    /// Addresses of every DS18B20 currently answering on the bus.
    fn search(&mut self) -> Vec<String> {
        let mut found = Vec::new();

        for device in self.one_wire.devices(false, &mut self.delay) {
            match device {
                Ok(address) if address.family_code() == ds18b20::FAMILY_CODE => {
                    let id = format_probe_address(address.0);
                    if !self.roms.iter().any(|(known, _)| known == &id) {
                        self.roms.push((id.clone(), address));
                    }
                    found.push(id);
                }
                Ok(address) => info!("ignoring one-wire device {:?}", address),
                Err(err) => {
                    warn!("one-wire device scan failed: {err:?}");
                    break;
                }
            }
        }

        info!("{} DS18B20 probe(s) on GPIO{}", found.len(), DS18B20_PIN);
        found
    }

    fn read_all(&mut self, addresses: Vec<String>) -> Vec<(String, Result<f32, ProbeFault>)> {
        if addresses.is_empty() {
            return Vec::new();
        }

        if let Err(err) =
            ds18b20::start_simultaneous_temp_measurement(&mut self.one_wire, &mut self.delay)
        {
            let fault = ProbeFault::Bus(format!("conversion start failed: {err:?}"));
            return addresses
                .into_iter()
                .map(|address| (address, Err(fault.clone())))
                .collect();
        }

        Resolution::Bits12.delay_for_measurement_time(&mut self.delay);

        addresses
            .into_iter()
            .map(|address| {
                let reading = self.read_one(&address);
                (address, reading)
            })
            .collect()
    }

    fn read_one(&mut self, address: &str) -> Result<f32, ProbeFault> {
        let rom = self
            .roms
            .iter()
            .find(|(known, _)| known == address)
            .map(|(_, rom)| *rom)
            .ok_or_else(|| ProbeFault::Bus(format!("unknown address {address}")))?;
        let sensor = Ds18b20::new::<core::convert::Infallible>(rom)
            .map_err(|err| ProbeFault::Bus(format!("{err:?}")))?;

        sensor
            .read_data(&mut self.one_wire, &mut self.delay)
            .map(|data| data.temperature)
            .map_err(|err| ProbeFault::Bus(format!("{err:?}")))
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn load_counters(&self) -> anyhow::Result<BootCounters> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;

        Ok(BootCounters {
            boot_count: nvs.get_u32(NVS_BOOT_COUNT_KEY)?.unwrap_or(0),
            error_count: nvs.get_u32(NVS_ERROR_COUNT_KEY)?.unwrap_or(0),
        })
    }

    fn save_counters(&self, counters: BootCounters) -> anyhow::Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        nvs.set_u32(NVS_BOOT_COUNT_KEY, counters.boot_count)?;
        nvs.set_u32(NVS_ERROR_COUNT_KEY, counters.error_count)?;
        Ok(())
    }
}

impl WifiLink {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
        network: &NetworkConfig,
    ) -> anyhow::Result<Self> {
        let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
        let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;

        let auth_method = if network.wifi_pass.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: network
                .wifi_ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi ssid too long"))?,
            password: network
                .wifi_pass
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi password too long"))?,
            auth_method,
            ..Default::default()
        }))?;

        wifi.start()?;
        info!("wifi started, station `{}`", network.wifi_ssid);
        Ok(Self { wifi })
    }

    fn mac(&self) -> anyhow::Result<String> {
        let mac = self.wifi.wifi().sta_netif().get_mac()?;
        Ok(format_mac(mac))
    }

    fn is_connected(&self) -> bool {
        is_wifi_station_connected()
    }

    fn connect(&mut self, attempts: u32) -> bool {
        for attempt in 1..=attempts {
            feed_watchdog();
            match self.wifi.connect().and_then(|()| self.wifi.wait_netif_up()) {
                Ok(()) => {
                    info!("wifi connected on attempt {attempt}/{attempts}");
                    return true;
                }
                Err(err) => warn!("wifi connect attempt {attempt}/{attempts} failed: {err:#}"),
            }

            let _ = self.wifi.disconnect();
            if attempt < attempts {
                thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
            }
        }
        false
    }
}

fn init_display(i2c: I2cDriver<'static>) -> anyhow::Result<StatusDisplay> {
    let interface = I2CDisplayInterface::new(i2c);
    let mut display =
        Ssd1306::new(interface, DisplaySize128x64, DisplayRotation::Rotate0).into_terminal_mode();
    display
        .init()
        .map_err(|err| anyhow!("failed to init display: {err:?}"))?;
    let _ = display.clear();
    write!(display, "Starting...").map_err(|_| anyhow!("display write failed"))?;
    Ok(display)
}

fn draw_lines(display: &mut StatusDisplay, lines: &[String]) -> anyhow::Result<()> {
    for row in 0..DISPLAY_ROWS {
        let text = lines.get(row).map(String::as_str).unwrap_or("");
        display
            .set_position(0, row as u8)
            .map_err(|err| anyhow!("display position failed: {err:?}"))?;
        // Pad to the full width so the previous page's text is overwritten.
        write!(display, "{text:<width$}", width = DISPLAY_COLS)
            .map_err(|_| anyhow!("display write failed"))?;
    }
    Ok(())
}

fn ensure_network_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        runtime.network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or("CHANGE_ME").to_string();
    }
    if runtime.network.wifi_pass.is_empty() {
        runtime.network.wifi_pass = option_env!("WIFI_PASS").unwrap_or_default().to_string();
    }
    if let Some(url) = option_env!("REPORT_URL") {
        if runtime.network.report_url == NetworkConfig::default().report_url {
            runtime.network.report_url = url.to_string();
        }
    }
}

fn post_report(network: &NetworkConfig, timeout_ms: u64, payload: &ReportPayload) -> SendOutcome {
    match try_post_report(network, timeout_ms, payload) {
        Ok(status) => SendOutcome::Status(status),
        Err(err) => SendOutcome::Failed(format!("{err:#}")),
    }
}

fn try_post_report(
    network: &NetworkConfig,
    timeout_ms: u64,
    payload: &ReportPayload,
) -> anyhow::Result<u16> {
    let body = serde_json::to_vec(payload)?;
    let content_length = body.len().to_string();

    let http_conf = HttpClientConfiguration {
        timeout: Some(Duration::from_millis(timeout_ms)),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);

    let mut headers = vec![
        ("content-type", "application/json"),
        ("content-length", content_length.as_str()),
    ];
    if !network.api_key.is_empty() {
        headers.push(("x-api-key", network.api_key.as_str()));
    }

    let mut request = client
        .request(Method::Post, &network.report_url, &headers)
        .map_err(|err| anyhow!("{err:?}"))?;
    request.write_all(&body).map_err(|err| anyhow!("{err:?}"))?;
    request.flush().map_err(|err| anyhow!("{err:?}"))?;
    let response = request.submit().map_err(|err| anyhow!("{err:?}"))?;

    Ok(response.status())
}

fn uptime_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let started = Instant::now();
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_network_defaults(&mut runtime);
    runtime.monitor.sanitize();

    let stored = nvs_store.load_counters().unwrap_or_else(|err| {
        warn!("failed to load counters from NVS: {err:#}");
        BootCounters::default()
    });
    let boot = BootGuard::new(&runtime.monitor).on_boot(stored);
    if let Err(err) = nvs_store.save_counters(boot.counters) {
        warn!("failed to persist boot counters: {err:#}");
    }
    info!(
        "boot #{} ({} errors recorded)",
        boot.counters.boot_count, boot.counters.error_count
    );
    if boot.bootloop_detected {
        warn!(
            "boot loop suspected; delaying start-up by {} ms",
            boot.startup_delay_ms
        );
        thread::sleep(Duration::from_millis(boot.startup_delay_ms));
    }

    let Peripherals {
        modem, pins, i2c0, ..
    } = Peripherals::take()?;

    let mut display = I2cDriver::new(
        i2c0,
        pins.gpio21,
        pins.gpio22,
        &I2cConfig::new().baudrate(Hertz(I2C_BAUDRATE_HZ)),
    )
    .map_err(anyhow::Error::from)
    .and_then(init_display)
    .map_err(|err| warn!("status display unavailable: {err:#}"))
    .ok();

    let mut bus = ProbeBus::new(pins.gpio4.downgrade()).context("failed to initialize probe bus")?;

    let mut wifi = WifiLink::new(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;
    let device_mac = wifi.mac().unwrap_or_else(|err| {
        warn!("failed to read station MAC: {err:#}");
        format_mac([0; 6])
    });

    let mut engine = MonitorEngine::new(runtime.monitor.clone(), device_mac, boot.counters);
    if boot.bootloop_detected {
        engine.record_error(
            uptime_ms(started),
            ErrorKind::BootloopDetected,
            format!("{} rapid restarts", boot.counters.boot_count),
        );
    }

    let found = bus.search();
    engine.register_probes(&found, &runtime.labels);

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let connected = wifi.connect(WIFI_CONNECT_ATTEMPTS);
    engine.set_wifi_connected(uptime_ms(started), connected);
    info!(
        "monitor {} started, reporting to {}",
        engine.device_mac(),
        runtime.network.report_url
    );

    let mut errors_seen = engine.errors().total();

    loop {
        feed_watchdog();
        let now_ms = uptime_ms(started);

        if engine.is_wifi_connected() && !wifi.is_connected() {
            engine.set_wifi_connected(now_ms, false);
        }

        for action in engine.tick(now_ms) {
            match action {
                MonitorAction::ReadProbes(addresses) => {
                    let results = bus.read_all(addresses);
                    engine.apply_readings(now_ms, results);
                }
                MonitorAction::RescanBus => {
                    let found = bus.search();
                    let added = engine.register_probes(&found, &runtime.labels);
                    if added > 0 {
                        info!("{added} new probe(s) registered");
                    }
                }
                MonitorAction::RenderPage(page) => {
                    if let Some(display) = display.as_mut() {
                        if let Err(err) = draw_lines(display, &engine.page_lines(page, now_ms)) {
                            warn!("display refresh failed: {err:#}");
                        }
                    }
                }
                MonitorAction::SendReport(payload) => {
                    info!("posting {} reading(s)", payload.readings.len());
                    feed_watchdog();
                    let outcome =
                        post_report(&runtime.network, runtime.monitor.http_timeout_ms, &payload);
                    if outcome.is_success() {
                        info!("report accepted");
                    }
                    engine.complete_send(uptime_ms(started), outcome);
                }
                MonitorAction::ReconnectWifi => {
                    let connected = wifi.connect(1);
                    engine.set_wifi_connected(uptime_ms(started), connected);
                }
                MonitorAction::SaveCounters(counters) => {
                    if let Err(err) = nvs_store.save_counters(counters) {
                        warn!("failed to persist counters: {err:#}");
                    }
                }
            }
        }

        let total = engine.errors().total();
        let fresh = total.saturating_sub(errors_seen) as usize;
        for entry in engine.errors().iter().take(fresh).collect::<Vec<_>>().into_iter().rev() {
            warn!("{}", entry.render());
        }
        errors_seen = total;

        thread::sleep(Duration::from_millis(LOOP_SLEEP_MS));
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}
